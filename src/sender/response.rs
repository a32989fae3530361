use serde::{Deserialize, Serialize};
use url::Url;

/// Statuses for which a batch (or an individual item) should be retried later.
pub const RETRIABLE_STATUS_CODES: [u16; 8] = [206, 401, 403, 408, 429, 439, 500, 503];

pub fn is_retriable(status: u16) -> bool {
    RETRIABLE_STATUS_CODES.contains(&status)
}

/// Partial-acceptance body returned by the ingestion service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionBody {
    #[serde(default)]
    pub items_received: u64,
    #[serde(default)]
    pub items_accepted: u64,
    #[serde(default)]
    pub errors: Vec<ItemError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    pub index: usize,
    pub status_code: u16,
    #[serde(default)]
    pub message: String,
}

/// A collector response decoded once at the transport boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestionResponse {
    Accepted,
    /// Retriable status. `errors` is `None` when the body could not be
    /// parsed, in which case the whole batch is treated as retriable.
    PartialFailure {
        status: u16,
        errors: Option<Vec<ItemError>>,
    },
    Redirect {
        status: u16,
        location: Option<String>,
    },
    Fatal {
        status: u16,
    },
}

impl IngestionResponse {
    pub fn decode(status: u16, location: Option<&str>, body: &str) -> Self {
        match status {
            200 => IngestionResponse::Accepted,
            307 | 308 => IngestionResponse::Redirect {
                status,
                location: location
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string),
            },
            s if is_retriable(s) => IngestionResponse::PartialFailure {
                status,
                errors: serde_json::from_str::<IngestionBody>(body)
                    .ok()
                    .map(|b| b.errors),
            },
            _ => IngestionResponse::Fatal { status },
        }
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self, IngestionResponse::Redirect { .. })
    }

    /// Indices of items the service asked to be retried.
    pub fn retriable_indices(errors: &[ItemError]) -> Vec<usize> {
        errors
            .iter()
            .filter(|e| is_retriable(e.status_code))
            .map(|e| e.index)
            .collect()
    }
}

/// Resolve a `Location` header against the URL that produced it.
pub fn resolve_location(base: &Url, location: &str) -> Option<Url> {
    base.join(location).ok()
}
