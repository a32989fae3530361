//! Domain layer for telemetry-channel.
//!
//! Contains the canonical types shared across all modules:
//! - `Envelope`: the normalized wire record for one telemetry event
//! - `build_envelope`: pure conversion from a typed record to an envelope
//! - `PipelineError`: top-level error type

pub mod envelope;
pub mod error;

pub use envelope::{
    Data, Envelope, TelemetryContext, TelemetryRecord, TelemetryType, build_envelope,
};
pub use error::PipelineError;
