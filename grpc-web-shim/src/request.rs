use std::pin::Pin;
use std::task::{ready, Context, Poll};

use base64::Engine as _;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{header, HeaderValue, Request, Version};
use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;

use crate::{headers, internal_error, BoxError, Encoding};

const BUFFER_SIZE: usize = 8 * 1024;

/// Request body handed to the wrapped service.
///
/// Bodies of `application/grpc-web-text` requests are base64-decoded as they are read. Every
/// other body is forwarded untouched.
#[derive(Debug)]
#[pin_project]
pub struct RequestBody<B> {
    #[pin]
    inner: B,
    buf: BytesMut,
    encoding: Encoding,
}

impl<B> RequestBody<B> {
    /// Wraps a body that must reach the service exactly as it arrived.
    pub fn passthrough(inner: B) -> Self {
        Self::new(inner, Encoding::None)
    }

    pub(crate) fn new(inner: B, encoding: Encoding) -> Self {
        RequestBody {
            inner,
            buf: BytesMut::with_capacity(match encoding {
                Encoding::Base64 => BUFFER_SIZE,
                Encoding::None => 0,
            }),
            encoding,
        }
    }

    /// Consumes the wrapper, returning the original body.
    pub fn into_inner(self) -> B {
        self.inner
    }

    fn decode_chunk(self: Pin<&mut Self>) -> Result<Option<Bytes>, BoxError> {
        let buf = self.project().buf;

        let index = crate::util::base64::decodable_len(buf);
        if index == 0 {
            return Ok(None);
        }

        crate::util::base64::STANDARD
            .decode(buf.split_to(index))
            .map(|decoded| Some(Bytes::from(decoded)))
            .map_err(|e| internal_error(e).into())
    }
}

/// Turns a grpc-web request into a grpc request.
///
/// The request is marked as HTTP/2 since grpc services expect trailer support, `content-length`
/// is removed because the decoded body no longer matches it, the content type loses its
/// `-web` / `-web-text` part and `te: trailers` is set. Text request bodies are decoded lazily.
pub(crate) fn coerce_request<B>(mut req: Request<B>) -> Request<RequestBody<B>> {
    let encoding = Encoding::from_content_type(req.headers());

    *req.version_mut() = Version::HTTP_2;

    req.headers_mut().remove(header::CONTENT_LENGTH);

    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .map(headers::grpc_content_type);
    if let Some(content_type) = content_type {
        req.headers_mut().insert(header::CONTENT_TYPE, content_type);
    }

    req.headers_mut()
        .insert(header::TE, HeaderValue::from_static("trailers"));

    req.map(|body| RequestBody::new(body, encoding))
}

impl<B> Body for RequestBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if self.encoding == Encoding::None {
            return self.project().inner.poll_frame(cx).map_err(Into::into);
        }

        loop {
            if let Some(bytes) = self.as_mut().decode_chunk()? {
                return Poll::Ready(Some(Ok(Frame::data(bytes))));
            }

            let this = self.as_mut().project();

            match ready!(this.inner.poll_frame(cx)) {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => this.buf.put(data),
                    Err(frame) if frame.is_trailers() => {
                        return Poll::Ready(Some(Err(internal_error(
                            "malformed base64 request has unencoded trailers",
                        )
                        .into())))
                    }
                    Err(_) => {
                        return Poll::Ready(Some(Err(internal_error("unexpected frame type").into())))
                    }
                },
                Some(Err(e)) => return Poll::Ready(Some(Err(e.into()))),
                None => {
                    return if this.buf.has_remaining() {
                        Poll::Ready(Some(Err(internal_error("malformed base64 request").into())))
                    } else {
                        Poll::Ready(None)
                    }
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream() && self.buf.is_empty()
    }

    fn size_hint(&self) -> SizeHint {
        match self.encoding {
            Encoding::None => self.inner.size_hint(),
            Encoding::Base64 => SizeHint::default(),
        }
    }
}
