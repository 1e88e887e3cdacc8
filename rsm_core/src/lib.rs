//! Core types for the request/response messaging engine: payloads and their
//! frame codec, transport configuration, performance metrics, logging setup
//! and the shared error type.

pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod payload;

pub use codec::FrameCodec;
pub use config::{
    enable_optimizations, global_optimizations, OptimizationFlags, PerformanceMode,
    TransportConfig, TransportType, TuningOptions,
};
pub use error::{Result, RsmError};
pub use metrics::{Bandwidth, MetricsSummary, PerformanceMetrics};
pub use payload::{create_payload, Payload, PayloadBuilder, PayloadValue};
