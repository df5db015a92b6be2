//! Ordered composition of wrapper layers around a base storage.
//!
//! Layers are listed innermost first: the first layer added wraps the base
//! storage directly and the last one added is what callers talk to.
//!
//! ```rust,ignore
//! let storage = StorageChain::new()
//!     .with(Layer::Metrics(registry))
//!     .with(Layer::ReadOnly)
//!     .build(base);
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::beforeop::{BeforeOpWrapper, BeforeOperation};
use crate::logging::TracingWrapper;
use crate::metrics::{MetricsRegistry, MetricsWrapper};
use crate::readonly::ReadOnlyWrapper;
use crate::retention::RetentionWrapper;
use crate::storage::SharedStorage;
use crate::throttling::{ThrottleMode, Throttler, ThrottlingWrapper};
use crate::types::RetentionMode;

/// A single wrapper layer and the state it needs.
#[derive(Debug, Clone)]
pub enum Layer {
    Metrics(Arc<MetricsRegistry>),
    Tracing {
        prefix: String,
    },
    ReadOnly,
    Throttling {
        throttler: Arc<Throttler>,
        mode: ThrottleMode,
        cancel: CancellationToken,
    },
    Retention {
        mode: RetentionMode,
        period: Duration,
        prefixes: Vec<String>,
    },
    BeforeOp(Arc<dyn BeforeOperation>),
}

impl Layer {
    pub fn name(&self) -> &'static str {
        match self {
            Layer::Metrics(_) => "metrics",
            Layer::Tracing { .. } => "tracing",
            Layer::ReadOnly => "readonly",
            Layer::Throttling { .. } => "throttling",
            Layer::Retention { .. } => "retention",
            Layer::BeforeOp(_) => "beforeop",
        }
    }

    fn wrap(self, inner: SharedStorage) -> SharedStorage {
        match self {
            Layer::Metrics(registry) => Arc::new(MetricsWrapper::new(inner, registry)),
            Layer::Tracing { prefix } => Arc::new(TracingWrapper::new(inner, prefix)),
            Layer::ReadOnly => Arc::new(ReadOnlyWrapper::new(inner)),
            Layer::Throttling {
                throttler,
                mode,
                cancel,
            } => Arc::new(ThrottlingWrapper::new(inner, throttler, mode, cancel)),
            Layer::Retention {
                mode,
                period,
                prefixes,
            } => Arc::new(RetentionWrapper::new(inner, mode, period, prefixes)),
            Layer::BeforeOp(hook) => Arc::new(BeforeOpWrapper::new(inner, hook)),
        }
    }
}

/// Ordered list of layers, folded over a base storage by [`StorageChain::build`].
#[derive(Debug, Clone, Default)]
pub struct StorageChain {
    layers: Vec<Layer>,
}

impl StorageChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `layer` outside every layer added so far.
    pub fn with(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    /// Append the layer produced by `layer` only when `enabled` is set.
    pub fn with_if(self, enabled: bool, layer: impl FnOnce() -> Layer) -> Self {
        if enabled {
            self.with(layer())
        } else {
            self
        }
    }

    /// Layer names, innermost first.
    pub fn names(&self) -> Vec<&'static str> {
        self.layers.iter().map(Layer::name).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn build(self, base: SharedStorage) -> SharedStorage {
        tracing::trace!(layers = ?self.names(), "assembling storage chain");
        self.layers.into_iter().fold(base, |inner, layer| layer.wrap(inner))
    }
}
