use tower_layer::Layer;

use crate::{Config, GrpcWebService};

/// Layer implementing the grpc-web protocol.
#[derive(Debug, Clone, Default)]
pub struct GrpcWebLayer {
    config: Config,
}

impl GrpcWebLayer {
    /// Create a new grpc-web layer with the default configuration.
    pub fn new() -> GrpcWebLayer {
        Self::default()
    }

    pub(crate) fn with_config(config: Config) -> GrpcWebLayer {
        GrpcWebLayer { config }
    }
}

impl<S> Layer<S> for GrpcWebLayer {
    type Service = GrpcWebService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcWebService::new(inner, self.config)
    }
}
