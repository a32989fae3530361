pub mod auth;
pub mod client;
pub mod response;
pub mod serialization;
pub mod state;
pub mod transmission;

pub use auth::{AuthorizationError, AuthorizationProvider, StaticTokenProvider};
pub use client::{HttpClient, SUPPRESS_INSTRUMENTATION_HEADER, SenderConfig};
pub use response::{IngestionBody, IngestionResponse, ItemError, RETRIABLE_STATUS_CODES};
pub use serialization::{PreparedPayload, prepare_payload};
pub use state::{RedirectPhase, SenderState, SenderStats};
pub use transmission::{MAX_CONNECTION_FAILURES_BEFORE_WARN, SendOutcome, Sender, SenderError};

use crate::buffer::Batch;
use std::future::Future;

/// The seam between the batching channel and the network.
pub trait Transport: Send + Sync + 'static {
    /// Send one batch asynchronously.
    fn send(&self, batch: Batch) -> impl Future<Output = Result<SendOutcome, SenderError>> + Send;

    /// Persist a batch without any asynchronous work. Used when the process
    /// is terminating and scheduled work would never run.
    fn save_on_crash(&self, batch: &Batch);

    fn set_disk_retry_mode(&self, enabled: bool);
}
