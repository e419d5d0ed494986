//! Convenience re-exports for the common path.
//!
//! ```
//! use whirligig::prelude::*;
//! ```

pub use crate::{
    BackoffCurve, BreakerConfig, BreakerState, HealthStatus, Method, Proxy, ProxyScheme,
    ProxySource, RequestOptions, RetryPolicy, RotationStrategy, Rotator, RotatorConfig,
    RotatorError, StatusCode, StrategyKind, TransportResponse,
};
