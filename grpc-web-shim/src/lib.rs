//! grpc-web protocol translation for grpc services.
//!
//! [`grpc_web_shim`] lets a backend that only speaks the binary grpc protocol over HTTP/2
//! answer [grpc-web] clients (binary and base64 text variants) that talk HTTP/1.1. It does so by
//! wrapping the backend with a [tower] service that rewrites every grpc-web request into a grpc
//! request and re-encodes the grpc response, trailers included, into the grpc-web wire format.
//!
//! ## Enabling a service
//!
//! The easiest way to get started is to call the [`enable`] function with your service:
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let addr = "[::1]:50051".parse().unwrap();
//!     let greeter = GreeterServer::new(MyGreeter::default());
//!
//!     Server::builder()
//!        .accept_http1(true)
//!        .add_service(grpc_web_shim::enable(greeter))
//!        .serve(addr)
//!        .await?;
//!
//!    Ok(())
//! }
//! ```
//!
//! The translation can also be applied to every service of a server with [`GrpcWebLayer`],
//! or tuned through [`Config`]:
//!
//! ```ignore
//! Server::builder()
//!    .accept_http1(true)
//!    .layer(grpc_web_shim::config().trailer_prefix("x-trailer-").layer())
//!    .add_service(greeter)
//!    .serve(addr)
//!    .await?;
//! ```
//!
//! ## What gets translated
//!
//! A request is translated when its `content-type` starts with `application/grpc-web`
//! (case-insensitive). Everything else reaches the wrapped service untouched.
//!
//! * The request is marked as HTTP/2, its `content-type` is rewritten to `application/grpc`
//!   (keeping any `+suffix`), `content-length` is dropped and `te: trailers` is set.
//! * `application/grpc-web-text` request bodies are base64-decoded lazily, as they are read.
//! * The response `content-type` is rewritten back to `application/grpc-web` or, when the
//!   request's `accept` header asks for it, `application/grpc-web-text`.
//! * grpc trailers are sent as a final body frame flagged with `0x80`. Responses without a
//!   body carry their trailers in the header block instead.
//! * In text mode the response body is base64-encoded one whole frame at a time.
//!
//! ## Limitations
//!
//! * Only the grpc-web wire format is handled. CORS, routing and TLS belong to the server.
//! * No compression is negotiated by this layer and grpc status codes are not interpreted,
//!   except for the `grpc-status: 13` reported when the wrapped service fails.
//!
//! [`grpc_web_shim`]: crate
//! [grpc-web]: https://github.com/grpc/grpc-web
//! [tower]: https://github.com/tower-rs/tower

pub use config::Config;
pub use frame::{decode_header_block, encode_header_block, Frame, FrameEncoder, FrameError};
pub use layer::GrpcWebLayer;
pub use request::RequestBody;
pub use response::ResponseBody;
pub use service::{GrpcWebService, ResponseFuture};

mod config;
mod frame;
mod headers;
mod layer;
mod request;
mod response;
mod service;

use http::{header, HeaderMap, HeaderValue};
use tonic::Status;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Enable a service to handle grpc-web requests with the default configuration.
pub fn enable<S>(service: S) -> GrpcWebService<S> {
    Config::default().enable(service)
}

/// Returns a default [`Config`] instance for configuring the translation.
pub fn config() -> Config {
    Config::default()
}

/// The body encoding of one direction of a grpc-web call.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Encoding {
    /// `application/grpc-web-text`: the whole body is base64 encoded.
    Base64,
    /// `application/grpc-web`: frames travel as raw bytes.
    None,
}

impl Encoding {
    pub(crate) fn from_content_type(headers: &HeaderMap) -> Encoding {
        Self::from_header(headers.get(header::CONTENT_TYPE))
    }

    pub(crate) fn from_accept(headers: &HeaderMap) -> Encoding {
        Self::from_header(headers.get(header::ACCEPT))
    }

    fn from_header(value: Option<&HeaderValue>) -> Encoding {
        match value {
            Some(value) if content_types::has_prefix(value.as_bytes(), content_types::GRPC_WEB_TEXT) => {
                Encoding::Base64
            }
            _ => Encoding::None,
        }
    }

    pub(crate) fn content_type_prefix(self) -> &'static str {
        match self {
            Encoding::Base64 => content_types::GRPC_WEB_TEXT,
            Encoding::None => content_types::GRPC_WEB,
        }
    }
}

pub(crate) mod content_types {
    use http::{header::CONTENT_TYPE, HeaderMap};

    pub(crate) const GRPC: &str = "application/grpc";
    pub(crate) const GRPC_WEB: &str = "application/grpc-web";
    pub(crate) const GRPC_WEB_TEXT: &str = "application/grpc-web-text";

    pub(crate) fn is_grpc_web(headers: &HeaderMap) -> bool {
        headers
            .get(CONTENT_TYPE)
            .is_some_and(|val| has_prefix(val.as_bytes(), GRPC_WEB))
    }

    /// Case-insensitive prefix match on a raw header value.
    pub(crate) fn has_prefix(value: &[u8], prefix: &str) -> bool {
        value
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix.as_bytes()))
    }
}

pub(crate) fn internal_error(e: impl std::fmt::Display) -> Status {
    Status::internal(format!("grpc-web: {e}"))
}

pub(crate) mod util {
    pub(crate) mod base64 {
        use base64::{
            alphabet,
            engine::{
                general_purpose::{GeneralPurpose, GeneralPurposeConfig},
                DecodePaddingMode,
            },
        };

        pub(crate) const STANDARD: GeneralPurpose = GeneralPurpose::new(
            &alphabet::STANDARD,
            GeneralPurposeConfig::new()
                .with_encode_padding(true)
                .with_decode_padding_mode(DecodePaddingMode::Indifferent),
        );

        /// Length of the longest prefix of `buf` that decodes on its own.
        ///
        /// That is every whole 4 byte quantum, cut right after the first padded quantum since
        /// streaming encoders concatenate independently padded units.
        pub(crate) fn decodable_len(buf: &[u8]) -> usize {
            let whole = (buf.len() / 4) * 4;

            match buf[..whole].iter().position(|b| *b == b'=') {
                Some(pad) => (pad / 4 + 1) * 4,
                None => whole,
            }
        }
    }
}
