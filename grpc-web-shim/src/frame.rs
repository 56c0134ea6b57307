use std::{error, fmt};

use base64::Engine as _;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::Encoding;

// A grpc frame header is u8 (flags) + u32 (payload len)
pub(crate) const FRAME_HEADER_SIZE: usize = 1 + 4;

// 8th (MSB) bit of the 1st gRPC frame byte
// denotes an uncompressed trailer (as part of the body)
const GRPC_WEB_TRAILERS_BIT: u8 = 0b1000_0000;

/// A length-prefixed unit of a grpc or grpc-web body.
///
/// On the wire a frame is one flags byte, the payload length as a big-endian `u32` and the
/// payload itself. Frames flagged with `0x80` carry trailers encoded as an HTTP/1 header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    flags: u8,
    payload: Bytes,
}

impl Frame {
    /// A message frame with no flags set.
    pub fn data(payload: impl Into<Bytes>) -> Frame {
        Frame {
            flags: 0,
            payload: payload.into(),
        }
    }

    /// A trailer metadata frame carrying `trailers` as its header block.
    pub fn trailers(trailers: &HeaderMap) -> Frame {
        Frame {
            flags: GRPC_WEB_TRAILERS_BIT,
            payload: encode_header_block(trailers).into(),
        }
    }

    /// The flags byte.
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// The frame payload, without the five byte header.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Returns `true` when this frame carries trailer metadata.
    pub fn is_trailers(&self) -> bool {
        self.flags & GRPC_WEB_TRAILERS_BIT != 0
    }

    /// Parses the payload of a trailer frame back into a header map.
    pub fn to_trailers(&self) -> Result<HeaderMap, FrameError> {
        if !self.is_trailers() {
            return Err(FrameError::new(Kind::NotTrailers(self.flags)));
        }

        decode_header_block(&self.payload)
    }

    /// Size of the frame on the wire.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Appends the wire representation of this frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = u32::try_from(self.payload.len())
            .map_err(|_| FrameError::new(Kind::TooLarge(self.payload.len())))?;

        dst.reserve(self.encoded_len());
        dst.put_u8(self.flags);
        dst.put_u32(len);
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Splits one complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched while it holds less than a whole frame.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let len = match frame_len(src)? {
            Some(len) if src.len() >= len => len,
            _ => return Ok(None),
        };

        let mut frame = src.split_to(len);
        let flags = frame.get_u8();
        frame.advance(4);

        Ok(Some(Frame {
            flags,
            payload: frame.freeze(),
        }))
    }
}

/// Total wire length of the frame at the start of `buf`, once its header is buffered.
fn frame_len(buf: &[u8]) -> Result<Option<usize>, FrameError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let len = (&buf[1..FRAME_HEADER_SIZE]).get_u32();
    usize::try_from(len)
        .ok()
        .and_then(|len| len.checked_add(FRAME_HEADER_SIZE))
        .map(Some)
        .ok_or_else(|| FrameError::new(Kind::TooLarge(len as usize)))
}

/// Re-chunks a grpc response body into grpc-web output.
///
/// In binary mode bytes pass through untouched. In text mode input is buffered until at least
/// one whole frame is available and every complete frame is then base64 encoded on its own,
/// so a frame is never split across two encoded units. Bytes of an incomplete trailing frame
/// stay buffered for the next call.
#[derive(Debug)]
pub struct FrameEncoder {
    encoding: Encoding,
    buf: BytesMut,
}

impl FrameEncoder {
    /// Creates an encoder; `capacity` sizes the text mode buffer.
    pub fn new(encoding: Encoding, capacity: usize) -> FrameEncoder {
        FrameEncoder {
            encoding,
            buf: BytesMut::with_capacity(match encoding {
                Encoding::Base64 => capacity,
                Encoding::None => 0,
            }),
        }
    }

    /// The output encoding.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Number of bytes written but not yet emitted.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Accepts the next chunk of the grpc body and returns everything that can be emitted now.
    ///
    /// The returned bytes may be empty in text mode when no frame is complete yet.
    pub fn encode(&mut self, data: Bytes) -> Bytes {
        match self.encoding {
            Encoding::None => data,
            Encoding::Base64 => {
                self.buf.put(data);

                let mut out = String::new();
                loop {
                    let len = match frame_len(&self.buf) {
                        Ok(Some(len)) if self.buf.len() >= len => len,
                        Ok(_) => break,
                        Err(e) => {
                            // Can't happen on platforms where usize is at least 32 bits.
                            debug!(error = %e, "unframeable grpc body, emitting buffer as is");
                            self.buf.len()
                        }
                    };

                    let frame = self.buf.split_to(len);
                    crate::util::base64::STANDARD.encode_string(&frame, &mut out);
                }

                Bytes::from(out)
            }
        }
    }

    /// Drains whatever is still buffered at the end of the body.
    ///
    /// A well-formed grpc body leaves nothing behind, in which case `None` is returned.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            return None;
        }

        let rest = self.buf.split();
        debug!(len = rest.len(), "grpc body ended with an incomplete frame");

        Some(match self.encoding {
            Encoding::Base64 => crate::util::base64::STANDARD.encode(rest).into(),
            Encoding::None => rest.freeze(),
        })
    }
}

/// Key-value pairs encoded as a HTTP/1 headers block (without the terminating newline).
///
/// Every value of a multi-valued header gets its own `name:value\r\n` line.
pub fn encode_header_block(headers: &HeaderMap) -> Vec<u8> {
    headers.iter().fold(Vec::new(), |mut acc, (key, value)| {
        acc.put_slice(key.as_ref());
        acc.push(b':');
        acc.put_slice(value.as_bytes());
        acc.put_slice(b"\r\n");
        acc
    })
}

/// Parses a header block produced by [`encode_header_block`] or any HTTP/1 style encoder.
///
/// Lines may end in `\r\n` or `\n`, whitespace around values is ignored and repeated names
/// are kept as multiple values.
pub fn decode_header_block(block: &[u8]) -> Result<HeaderMap, FrameError> {
    let mut map = HeaderMap::new();

    for line in block.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }

        let colon = line
            .iter()
            .position(|b| *b == b':')
            .ok_or_else(|| FrameError::new(Kind::MissingColon))?;

        let name = HeaderName::from_bytes(&line[..colon])
            .map_err(|e| FrameError::new(Kind::InvalidHeader(e.to_string())))?;
        let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii())
            .map_err(|e| FrameError::new(Kind::InvalidHeader(e.to_string())))?;

        map.append(name, value);
    }

    Ok(map)
}

/// Errors produced while building or parsing frames.
#[derive(Debug)]
pub struct FrameError {
    kind: Kind,
}

#[derive(Debug)]
enum Kind {
    TooLarge(usize),
    NotTrailers(u8),
    MissingColon,
    InvalidHeader(String),
}

impl FrameError {
    fn new(kind: Kind) -> Self {
        Self { kind }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::TooLarge(len) => write!(f, "frame payload of {len} bytes does not fit a grpc frame"),
            Kind::NotTrailers(flags) => write!(f, "frame with flags {flags:#04x} is not a trailer frame"),
            Kind::MissingColon => f.write_str("header line without a colon"),
            Kind::InvalidHeader(e) => write!(f, "invalid header in block: {e}"),
        }
    }
}

impl error::Error for FrameError {}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn frames(payloads: &[Vec<u8>]) -> BytesMut {
        let mut buf = BytesMut::new();
        for payload in payloads {
            Frame::data(payload.clone()).encode(&mut buf).unwrap();
        }
        buf
    }

    // Output may hold several independently padded units.
    fn decode_base64(mut out: &[u8]) -> Vec<u8> {
        let mut decoded = Vec::new();
        while !out.is_empty() {
            let len = crate::util::base64::decodable_len(out);
            assert!(len > 0, "trailing partial quantum");
            decoded.extend(crate::util::base64::STANDARD.decode(&out[..len]).unwrap());
            out = &out[len..];
        }
        decoded
    }

    #[test]
    fn frame_layout() {
        let mut buf = BytesMut::new();
        Frame::data(&b"hello"[..]).encode(&mut buf).unwrap();

        assert_eq!(&buf[..], b"\0\0\0\0\x05hello");
    }

    #[test]
    fn decode_waits_for_whole_frame() {
        let mut buf = BytesMut::from(&b"\0\0\0\0\x05hel"[..]);

        assert_eq!(Frame::decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 8);

        buf.put_slice(b"lo\0\0");
        let frame = Frame::decode(&mut buf).unwrap().unwrap();

        assert_eq!(&frame.payload()[..], b"hello");
        assert!(!frame.is_trailers());
        assert_eq!(&buf[..], b"\0\0");
    }

    #[test]
    fn trailers_frame_shape() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", "0".parse().unwrap());

        let frame = Frame::trailers(&trailers);
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();

        assert_eq!(&buf[..], b"\x80\0\0\0\x0fgrpc-status:0\r\n");
        assert_eq!(frame.to_trailers().unwrap(), trailers);
    }

    #[test]
    fn data_frame_is_not_trailers() {
        assert!(Frame::data(Bytes::new()).to_trailers().is_err());
    }

    #[test]
    fn header_block_multiple_values() {
        let mut headers = HeaderMap::new();
        headers.append("grpc-status", "0".parse().unwrap());
        headers.append("x-custom", "a".parse().unwrap());
        headers.append("x-custom", "b".parse().unwrap());

        let block = encode_header_block(&headers);
        assert_eq!(&block[..], b"grpc-status:0\r\nx-custom:a\r\nx-custom:b\r\n");
        assert_eq!(decode_header_block(&block).unwrap(), headers);
    }

    #[test]
    fn header_block_tolerates_http1_spacing() {
        let block = b"Grpc-Status: 0\r\nGrpc-Message: all good\nx-empty:\r\n";
        let map = decode_header_block(block).unwrap();

        assert_eq!(map.get("grpc-status").unwrap(), "0");
        assert_eq!(map.get("grpc-message").unwrap(), "all good");
        assert_eq!(map.get("x-empty").unwrap(), "");
    }

    #[test]
    fn header_block_without_colon() {
        assert!(decode_header_block(b"grpc-status 0\r\n").is_err());
    }

    #[test]
    fn binary_mode_passthrough() {
        let mut encoder = FrameEncoder::new(Encoding::None, 0);
        let input = Bytes::from_static(b"\0\0\0\0\x05he");

        assert_eq!(encoder.encode(input.clone()), input);
        assert_eq!(encoder.buffered(), 0);
        assert_eq!(encoder.finish(), None);
    }

    #[test]
    fn text_mode_holds_partial_frame() {
        let mut encoder = FrameEncoder::new(Encoding::Base64, 64);
        let buf = frames(&[b"hello".to_vec()]);

        assert!(encoder.encode(buf.clone().freeze().slice(..3)).is_empty());
        assert_eq!(encoder.buffered(), 3);

        let out = encoder.encode(buf.clone().freeze().slice(3..));
        assert_eq!(encoder.buffered(), 0);
        assert_eq!(decode_base64(&out), &buf[..]);
    }

    #[test]
    fn text_mode_encodes_each_frame_separately() {
        let mut encoder = FrameEncoder::new(Encoding::Base64, 64);
        // A 7 byte frame needs padding, so the boundary is visible in the output.
        let buf = frames(&[b"ab".to_vec(), b"c".to_vec()]);

        let out = encoder.encode(buf.clone().freeze());
        assert_eq!(&out[..], b"AAAAAAJhYg==AAAAAAFj");
        assert_eq!(decode_base64(&out), &buf[..]);
    }

    #[test]
    fn text_mode_finish_flushes_remainder() {
        let mut encoder = FrameEncoder::new(Encoding::Base64, 64);
        encoder.encode(Bytes::from_static(b"\0\0\0"));

        let rest = encoder.finish().unwrap();
        assert_eq!(decode_base64(&rest), b"\0\0\0");
        assert_eq!(encoder.buffered(), 0);
        assert_eq!(encoder.finish(), None);
    }

    #[quickcheck]
    fn text_mode_reproduces_frames(payloads: Vec<Vec<u8>>, splits: Vec<usize>) -> bool {
        let input = frames(&payloads).freeze();
        let mut encoder = FrameEncoder::new(Encoding::Base64, 0);

        let mut cuts: Vec<usize> = splits.iter().map(|s| s % (input.len() + 1)).collect();
        cuts.sort_unstable();

        let mut decoded = Vec::new();
        let mut start = 0;
        for cut in cuts.into_iter().chain(std::iter::once(input.len())) {
            let out = encoder.encode(input.slice(start..cut));
            start = cut;

            // Every call emits whole frames only.
            let chunk = decode_base64(&out);
            let mut check = BytesMut::from(&chunk[..]);
            while let Some(_frame) = Frame::decode(&mut check).unwrap() {}
            if !check.is_empty() {
                return false;
            }

            decoded.extend_from_slice(&chunk);
        }

        encoder.buffered() == 0 && decoded == input
    }
}
