use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub batch_size: usize,
    pub batch_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            batch_size: 250,
            batch_interval: Duration::from_secs(15),
        }
    }
}

/// Ordered group of serialized envelopes sent in one request.
///
/// Items keep their arrival order; the wire payload is the items joined by
/// newlines (newline-delimited JSON).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    id: String,
    items: Vec<String>,
}

impl Batch {
    pub fn new(items: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            items,
        }
    }

    pub fn with_id(id: String, items: Vec<String>) -> Self {
        Self { id, items }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn size(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn into_items(self) -> Vec<String> {
        self.items
    }

    pub fn payload(&self) -> String {
        self.items.join("\n")
    }

    /// Build a new batch from the items at `indices`, in the order given.
    /// Out-of-range indices are skipped.
    pub fn select<I>(&self, indices: I) -> Batch
    where
        I: IntoIterator<Item = usize>,
    {
        let items = indices
            .into_iter()
            .filter_map(|idx| self.items.get(idx).cloned())
            .collect();
        Batch::new(items)
    }
}
