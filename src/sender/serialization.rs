use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::Write;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("IO error during compression: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Compression task failed: {0}")]
    TaskFailed(String),
}

/// Request body ready for the wire.
#[derive(Debug, Clone)]
pub struct PreparedPayload {
    pub body: Vec<u8>,
    pub compressed: bool,
    pub uncompressed_len: usize,
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Gzip the payload on the blocking pool. Falls back to the raw payload if
/// compression fails.
pub async fn prepare_payload(payload: String) -> PreparedPayload {
    let uncompressed_len = payload.len();
    let raw = Arc::new(payload.into_bytes());
    let task_raw = Arc::clone(&raw);

    let result = tokio::task::spawn_blocking(move || gzip(&task_raw))
        .await
        .map_err(|e| CompressionError::TaskFailed(e.to_string()))
        .and_then(|compressed| compressed);

    match result {
        Ok(body) => PreparedPayload {
            body,
            compressed: true,
            uncompressed_len,
        },
        Err(e) => {
            warn!(error = %e, "Gzip compression failed, sending uncompressed payload");
            PreparedPayload {
                body: Arc::try_unwrap(raw).unwrap_or_else(|shared| shared.as_ref().clone()),
                compressed: false,
                uncompressed_len,
            }
        }
    }
}
