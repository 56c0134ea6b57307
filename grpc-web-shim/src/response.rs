use std::any::Any;
use std::collections::HashSet;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use http::{response::Parts, HeaderMap, HeaderName, Response};
use http_body::{Body, SizeHint};
use pin_project::pin_project;
use tonic::Status;
use tracing::{debug, trace};

use crate::frame::{Frame, FrameEncoder};
use crate::{headers, internal_error, BoxError, Config, Encoding};

/// Progress of a translated response.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum State {
    /// The wrapped service hasn't produced a response yet.
    Idle,
    /// The head is known but held back until the body shows whether it has any data.
    HeadersStaged,
    BodyStreaming,
    TrailersSent,
}

pub(crate) type Panic = Box<dyn Any + Send + 'static>;

/// Runs `poll`, turning a panic into an error when `catch_panics` is set.
pub(crate) fn poll_guarded<T>(
    catch_panics: bool,
    poll: impl FnOnce() -> Poll<T>,
) -> Poll<Result<T, Panic>> {
    if !catch_panics {
        return poll().map(Ok);
    }

    match catch_unwind(AssertUnwindSafe(poll)) {
        Ok(polled) => polled.map(Ok),
        Err(panic) => Poll::Ready(Err(panic)),
    }
}

pub(crate) fn panic_message(panic: &Panic) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

fn status_trailers(status: &Status) -> HeaderMap {
    let mut trailers = HeaderMap::new();
    if let Err(e) = status.add_header(&mut trailers) {
        debug!(error = %e, "unable to encode grpc status");
    }
    trailers
}

/// A headers-only response to a call that failed before anything was sent.
pub(crate) fn failed<B>(status: Status, encoding: Encoding) -> Response<ResponseBody<B>> {
    let (parts, ()) = Response::new(()).into_parts();
    headers_only(parts, HeaderMap::new(), Some(status_trailers(&status)), encoding, "")
}

fn headers_only<B>(
    mut parts: Parts,
    staged: HeaderMap,
    trailers: Option<HeaderMap>,
    encoding: Encoding,
    prefix: &str,
) -> Response<ResponseBody<B>> {
    headers::fold_trailers(&mut parts.headers, staged, trailers, prefix);
    headers::rewrite_response(&mut parts.headers, encoding);

    trace!(state = ?State::TrailersSent, "grpc-web response without body");
    Response::from_parts(parts, ResponseBody::empty())
}

/// What the first poll of the backend's body revealed.
enum First {
    Data(Bytes),
    End(Option<HeaderMap>),
    Failed(Status),
}

/// A response whose head stays staged until the first body frame is known.
///
/// A first data frame flushes the head and starts streaming. A body that ends without data
/// becomes a headers-only response with the trailers folded into the head.
pub(crate) struct Pending<B> {
    head: Option<(Parts, Pin<Box<B>>)>,
    staged: HeaderMap,
    encoding: Encoding,
    config: Config,
}

impl<B> Pending<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    pub(crate) fn new(res: Response<B>, encoding: Encoding, config: Config) -> Self {
        let (mut parts, body) = res.into_parts();
        let staged = headers::stage(&mut parts.headers, config.trailer_prefix);

        trace!(state = ?State::HeadersStaged, staged = staged.len());

        Pending {
            head: Some((parts, Box::pin(body))),
            staged,
            encoding,
            config,
        }
    }

    pub(crate) fn poll_response(&mut self, cx: &mut Context<'_>) -> Poll<Response<ResponseBody<B>>> {
        let first = ready!(self.poll_first(cx));

        match self.head.take() {
            Some((parts, body)) => Poll::Ready(self.respond(parts, body, first)),
            None => panic!("grpc-web response polled after completion"),
        }
    }

    fn poll_first(&mut self, cx: &mut Context<'_>) -> Poll<First> {
        let body = match &mut self.head {
            Some((_, body)) => body,
            None => return Poll::Ready(First::End(None)),
        };

        if body.is_end_stream() {
            return Poll::Ready(First::End(None));
        }

        let first = match ready!(poll_guarded(self.config.catch_panics, || {
            body.as_mut().poll_frame(cx)
        })) {
            Ok(Some(Ok(frame))) => match frame.into_data() {
                Ok(data) => First::Data(data),
                Err(frame) => First::End(frame.into_trailers().ok()),
            },
            Ok(Some(Err(e))) => {
                let e: BoxError = e.into();
                debug!(error = %e, "grpc response body failed before sending data");
                First::Failed(internal_error(e))
            }
            Ok(None) => First::End(None),
            Err(panic) => {
                debug!(panic = panic_message(&panic), "grpc response body panicked");
                First::Failed(internal_error("response body panicked"))
            }
        };

        Poll::Ready(first)
    }

    fn respond(&mut self, mut parts: Parts, body: Pin<Box<B>>, first: First) -> Response<ResponseBody<B>> {
        let staged = mem::take(&mut self.staged);
        let prefix = self.config.trailer_prefix;

        match first {
            First::Data(data) => {
                let sent = headers::rewrite_response(&mut parts.headers, self.encoding);

                let mut encoder = FrameEncoder::new(self.encoding, self.config.buffer_capacity);
                let ready = encoder.encode(data);

                trace!(state = ?State::BodyStreaming, encoding = ?self.encoding);

                let session = Session {
                    body: Some(body),
                    encoder,
                    staged,
                    sent,
                    ready: Some(ready),
                    config: self.config,
                    state: State::BodyStreaming,
                };

                Response::from_parts(parts, ResponseBody::streaming(session))
            }
            First::End(trailers) => headers_only(parts, staged, trailers, self.encoding, prefix),
            First::Failed(status) => {
                headers_only(parts, staged, Some(status_trailers(&status)), self.encoding, prefix)
            }
        }
    }
}

impl<B> Drop for Pending<B> {
    fn drop(&mut self) {
        if self.head.is_some() {
            debug!(state = ?State::HeadersStaged, "grpc-web response dropped before its headers were sent");
        }
    }
}

/// The streaming half of a translated response.
#[derive(Debug)]
struct Session<B> {
    body: Option<Pin<Box<B>>>,
    encoder: FrameEncoder,
    staged: HeaderMap,
    sent: HashSet<HeaderName>,
    ready: Option<Bytes>,
    config: Config,
    state: State,
}

impl<B> Session<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    fn poll_frame(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Bytes>, BoxError>>> {
        loop {
            if let Some(buf) = self.ready.take() {
                if !buf.is_empty() {
                    return Poll::Ready(Some(Ok(http_body::Frame::data(buf))));
                }
            }

            let body = match self.body.as_mut() {
                Some(body) => body,
                None => return Poll::Ready(None),
            };

            match ready!(poll_guarded(self.config.catch_panics, || {
                body.as_mut().poll_frame(cx)
            })) {
                Ok(Some(Ok(frame))) => match frame.into_data() {
                    Ok(data) => self.ready = Some(self.encoder.encode(data)),
                    Err(frame) => self.finish(frame.into_trailers().ok()),
                },
                Ok(Some(Err(e))) => {
                    let e: BoxError = e.into();
                    debug!(error = %e, "grpc response body failed");
                    self.finish(Some(status_trailers(&internal_error(e))));
                }
                Ok(None) => self.finish(None),
                Err(panic) => {
                    debug!(panic = panic_message(&panic), "grpc response body panicked");
                    self.finish(Some(status_trailers(&internal_error("response body panicked"))));
                }
            }
        }
    }

    /// Emits the trailer frame, after any bytes still held by the encoder.
    fn finish(&mut self, trailers: Option<HeaderMap>) {
        self.body = None;

        let block = headers::trailer_block(
            mem::take(&mut self.staged),
            trailers,
            &self.sent,
            self.config.trailer_prefix,
        );

        let mut frame = BytesMut::new();
        if let Err(e) = Frame::trailers(&block).encode(&mut frame) {
            debug!(error = %e, "dropping grpc-web trailers");
        }

        let mut out = BytesMut::new();
        if let Some(rest) = self.encoder.finish() {
            out.put(rest);
        }
        out.put(self.encoder.encode(frame.freeze()));

        self.ready = Some(out.freeze());
        self.state = State::TrailersSent;

        trace!(state = ?self.state, trailers = block.len());
    }
}

impl<B> Session<B> {
    fn is_end_stream(&self) -> bool {
        self.body.is_none() && self.ready.is_none()
    }
}

impl<B> Drop for Session<B> {
    fn drop(&mut self) {
        if self.state != State::TrailersSent {
            debug!(
                state = ?self.state,
                buffered = self.encoder.buffered(),
                "grpc-web response dropped before its trailers were sent"
            );
        }
    }
}

/// Response body returned to the client.
///
/// For grpc-web calls it re-encodes the wrapped service's body and appends the trailer frame.
/// Other responses are forwarded untouched.
#[pin_project]
#[derive(Debug)]
pub struct ResponseBody<B> {
    #[pin]
    kind: BodyKind<B>,
}

#[pin_project(project = BodyKindProj)]
#[derive(Debug)]
enum BodyKind<B> {
    Passthrough {
        #[pin]
        inner: B,
    },
    GrpcWeb {
        session: Session<B>,
    },
    Empty,
}

impl<B> ResponseBody<B> {
    /// Wraps a body that must reach the client exactly as the service produced it.
    pub fn passthrough(inner: B) -> Self {
        ResponseBody {
            kind: BodyKind::Passthrough { inner },
        }
    }

    fn streaming(session: Session<B>) -> Self {
        ResponseBody {
            kind: BodyKind::GrpcWeb { session },
        }
    }

    pub(crate) fn empty() -> Self {
        ResponseBody {
            kind: BodyKind::Empty,
        }
    }
}

impl<B> Body for ResponseBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        match self.project().kind.project() {
            BodyKindProj::Passthrough { inner } => inner.poll_frame(cx).map_err(Into::into),
            BodyKindProj::GrpcWeb { session } => session.poll_frame(cx),
            BodyKindProj::Empty => Poll::Ready(None),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            BodyKind::Passthrough { inner } => inner.is_end_stream(),
            BodyKind::GrpcWeb { session } => session.is_end_stream(),
            BodyKind::Empty => true,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            BodyKind::Passthrough { inner } => inner.size_hint(),
            BodyKind::GrpcWeb { .. } => SizeHint::default(),
            BodyKind::Empty => SizeHint::with_exact(0),
        }
    }
}
