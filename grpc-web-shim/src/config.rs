use crate::{GrpcWebLayer, GrpcWebService};

const DEFAULT_TRAILER_PREFIX: &str = "trailer-";

const DEFAULT_BUFFER_CAPACITY: usize = 8 * 1024;

/// Configuration options for wrapped services.
///
/// ```
/// let layer = grpc_web_shim::config()
///     .trailer_prefix("x-trailer-")
///     .buffer_capacity(16 * 1024)
///     .layer();
/// # drop(layer);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub(crate) trailer_prefix: &'static str,
    pub(crate) buffer_capacity: usize,
    pub(crate) catch_panics: bool,
}

impl Config {
    pub(crate) fn new() -> Config {
        Config {
            trailer_prefix: DEFAULT_TRAILER_PREFIX,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            catch_panics: true,
        }
    }

    /// Sets the header name prefix a service uses to declare trailer-only entries in its
    /// response headers. Defaults to `trailer-`.
    ///
    /// Prefixed entries are moved into the trailer frame, prefix stripped. When the response
    /// has no body they are sent as regular headers instead. The match ignores ASCII case.
    pub fn trailer_prefix(self, prefix: &'static str) -> Config {
        Self {
            trailer_prefix: prefix,
            ..self
        }
    }

    /// Initial capacity of the buffer that re-frames `application/grpc-web-text` responses.
    pub fn buffer_capacity(self, capacity: usize) -> Config {
        Self {
            buffer_capacity: capacity,
            ..self
        }
    }

    /// Whether a panic of the wrapped service is turned into a `grpc-status: 13` response.
    ///
    /// Enabled by default. Panics on the passthrough path are never caught.
    pub fn catch_panics(self, catch_panics: bool) -> Config {
        Self {
            catch_panics,
            ..self
        }
    }

    /// Builds a [`GrpcWebLayer`] using this configuration.
    pub fn layer(&self) -> GrpcWebLayer {
        GrpcWebLayer::with_config(*self)
    }

    /// Wraps `service` with the grpc-web translation using this configuration.
    pub fn enable<S>(&self, service: S) -> GrpcWebService<S> {
        tracing::trace!(trailer_prefix = self.trailer_prefix, "grpc-web enabled");
        GrpcWebService::new(service, *self)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}
