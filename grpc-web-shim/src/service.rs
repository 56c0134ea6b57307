use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use http::{header, Request, Response};
use http_body::Body;
use pin_project::pin_project;
use tonic::server::NamedService;
use tower_service::Service;
use tracing::{debug, trace};

use crate::content_types::is_grpc_web;
use crate::request::coerce_request;
use crate::response::{self, panic_message, poll_guarded, Pending, State};
use crate::{internal_error, BoxError, Config, Encoding, RequestBody, ResponseBody};

/// Service implementing the grpc-web protocol.
///
/// grpc-web requests are translated into grpc requests before reaching the wrapped service and
/// its responses are translated back. Every other request is forwarded untouched.
#[derive(Debug, Clone)]
pub struct GrpcWebService<S> {
    inner: S,
    config: Config,
}

impl<S> GrpcWebService<S> {
    pub(crate) fn new(inner: S, config: Config) -> Self {
        GrpcWebService { inner, config }
    }

    /// Returns a reference to the wrapped service.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Consumes the wrapper, returning the wrapped service.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for GrpcWebService<S>
where
    S: Service<Request<RequestBody<ReqBody>>, Response = Response<ResBody>>,
    S::Error: Into<BoxError>,
    ResBody: Body<Data = Bytes>,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<ResponseBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        if !is_grpc_web(req.headers()) {
            debug!(kind = "other", content_type = ?req.headers().get(header::CONTENT_TYPE));
            return ResponseFuture::passthrough(self.inner.call(req.map(RequestBody::passthrough)));
        }

        let encoding = Encoding::from_content_type(req.headers());
        let accept = Encoding::from_accept(req.headers());
        trace!(kind = "grpc-web", path = ?req.uri().path(), ?encoding, ?accept, state = ?State::Idle);

        let req = coerce_request(req);

        if !self.config.catch_panics {
            return ResponseFuture::grpc_web(self.inner.call(req), accept, self.config);
        }

        match catch_unwind(AssertUnwindSafe(|| self.inner.call(req))) {
            Ok(fut) => ResponseFuture::grpc_web(fut, accept, self.config),
            Err(panic) => {
                debug!(panic = panic_message(&panic), "grpc service panicked");
                ResponseFuture::ready(response::failed(
                    internal_error("service panicked"),
                    accept,
                ))
            }
        }
    }
}

impl<S: NamedService> NamedService for GrpcWebService<S> {
    const NAME: &'static str = S::NAME;
}

/// Response future for [`GrpcWebService`].
#[pin_project]
#[must_use = "futures do nothing unless polled"]
pub struct ResponseFuture<F, B> {
    #[pin]
    kind: Kind<F, B>,
}

#[pin_project(project = KindProj)]
enum Kind<F, B> {
    Passthrough {
        #[pin]
        inner: F,
    },
    Call {
        #[pin]
        inner: F,
        accept: Encoding,
        config: Config,
    },
    Staged {
        pending: Pending<B>,
    },
    Ready {
        res: Option<Response<ResponseBody<B>>>,
    },
    Done,
}

impl<F, B> ResponseFuture<F, B> {
    fn passthrough(inner: F) -> Self {
        ResponseFuture {
            kind: Kind::Passthrough { inner },
        }
    }

    fn grpc_web(inner: F, accept: Encoding, config: Config) -> Self {
        ResponseFuture {
            kind: Kind::Call {
                inner,
                accept,
                config,
            },
        }
    }

    fn ready(res: Response<ResponseBody<B>>) -> Self {
        ResponseFuture {
            kind: Kind::Ready { res: Some(res) },
        }
    }
}

impl<F, B, E> Future for ResponseFuture<F, B>
where
    F: Future<Output = Result<Response<B>, E>>,
    E: Into<BoxError>,
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Output = Result<Response<ResponseBody<B>>, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            let mut this = self.as_mut().project();

            let next = match this.kind.as_mut().project() {
                KindProj::Passthrough { inner } => {
                    let res = ready!(inner.poll(cx))?;
                    this.kind.set(Kind::Done);
                    return Poll::Ready(Ok(res.map(ResponseBody::passthrough)));
                }
                KindProj::Call {
                    inner,
                    accept,
                    config,
                } => {
                    let (accept, config) = (*accept, *config);

                    match ready!(poll_guarded(config.catch_panics, || inner.poll(cx))) {
                        Ok(Ok(res)) => Kind::Staged {
                            pending: Pending::new(res, accept, config),
                        },
                        Ok(Err(e)) => {
                            let e: BoxError = e.into();
                            debug!(error = %e, "grpc service failed");
                            Kind::Ready {
                                res: Some(response::failed(internal_error(e), accept)),
                            }
                        }
                        Err(panic) => {
                            debug!(panic = panic_message(&panic), "grpc service panicked");
                            Kind::Ready {
                                res: Some(response::failed(
                                    internal_error("service panicked"),
                                    accept,
                                )),
                            }
                        }
                    }
                }
                KindProj::Staged { pending } => {
                    let res = ready!(pending.poll_response(cx));
                    this.kind.set(Kind::Done);
                    return Poll::Ready(Ok(res));
                }
                KindProj::Ready { res } => match res.take() {
                    Some(res) => {
                        this.kind.set(Kind::Done);
                        return Poll::Ready(Ok(res));
                    }
                    None => panic!("ResponseFuture polled after completion"),
                },
                KindProj::Done => panic!("ResponseFuture polled after completion"),
            };

            this.kind.set(next);
        }
    }
}

impl<F, B> fmt::Debug for ResponseFuture<F, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture").finish()
    }
}
