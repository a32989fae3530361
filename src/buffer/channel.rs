use super::batch::{Batch, ChannelConfig};
use super::error::ChannelError;
use crate::sender::{SendOutcome, SenderError, Transport};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Result of draining the buffer.
#[derive(Debug)]
pub enum FlushOutcome {
    /// Nothing was buffered; no transport or disk call was made.
    Empty,
    /// The batch went through the transport.
    Sent(SendOutcome),
    /// The batch was handed to the synchronous crash path.
    PersistedOnCrash { items: usize },
}

/// In-memory batching in front of a [`Transport`].
///
/// Producers call [`send`](Self::send) from any thread. A batch is flushed
/// when the buffer reaches `batch_size` items or when the batch interval
/// timer fires, whichever comes first.
pub struct BatchingChannel<T: Transport> {
    inner: Arc<ChannelInner<T>>,
}

impl<T: Transport> Clone for BatchingChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ChannelInner<T> {
    config: ChannelConfig,
    transport: Arc<T>,
    state: Mutex<ChannelState>,
    disabled: AtomicBool,
    runtime: Handle,
}

#[derive(Default)]
struct ChannelState {
    buffer: Vec<String>,
    last_send: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the timer slot is armed or emptied by a flush.
    timer_generation: u64,
    in_flight: Vec<JoinHandle<()>>,
}

impl ChannelState {
    /// Drain the buffer into a batch. Always resets the last-send time and
    /// cancels the pending timer, even when the buffer is empty.
    fn take_batch(&mut self) -> Option<Batch> {
        self.last_send = Some(Instant::now());
        self.timer_generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if self.buffer.is_empty() {
            return None;
        }
        Some(Batch::new(std::mem::take(&mut self.buffer)))
    }
}

impl<T: Transport> BatchingChannel<T> {
    /// Must be called from within a tokio runtime; the runtime handle is
    /// captured so producers on other threads can still schedule flushes.
    pub fn new(config: ChannelConfig, transport: Arc<T>) -> Result<Self, ChannelError> {
        if config.batch_size == 0 {
            return Err(ChannelError::InvalidConfig(
                "Batch size must be greater than 0".to_string(),
            ));
        }
        if config.batch_interval.is_zero() {
            return Err(ChannelError::InvalidConfig(
                "Batch interval must be greater than 0".to_string(),
            ));
        }

        let runtime = Handle::try_current().map_err(|e| ChannelError::NoRuntime(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(ChannelInner {
                config,
                transport,
                state: Mutex::new(ChannelState::default()),
                disabled: AtomicBool::new(false),
                runtime,
            }),
        })
    }

    /// Serialize and buffer one envelope. Never fails: disabled channels,
    /// empty envelopes and serialization errors are logged and dropped.
    pub fn send<E>(&self, envelope: &E)
    where
        E: Serialize + ?Sized,
    {
        if self.is_disabled() {
            warn!("Telemetry is disabled, dropping envelope");
            return;
        }

        let serialized = match serde_json::to_string(envelope) {
            Ok(serialized) => serialized,
            Err(e) => {
                warn!(error = %e, "Failed to serialize envelope, dropping it");
                return;
            }
        };

        if matches!(serialized.as_str(), "null" | "{}" | "\"\"") {
            warn!("Ignoring empty envelope");
            return;
        }

        let ready = {
            let mut state = self.inner.state.lock();
            state.buffer.push(serialized);

            if state.buffer.len() >= self.inner.config.batch_size {
                state.take_batch()
            } else {
                if state.timer.is_none() {
                    state.timer_generation += 1;
                    let generation = state.timer_generation;
                    state.timer = Some(self.spawn_flush_timer(generation));
                }
                None
            }
        };

        if let Some(batch) = ready {
            debug!(
                batch_id = batch.id(),
                items = batch.size(),
                "Batch size reached, flushing"
            );
            self.dispatch(batch);
        }
    }

    /// Drain the buffer and send it through the transport.
    pub async fn trigger_send(&self) -> Result<FlushOutcome, SenderError> {
        let batch = self.inner.state.lock().take_batch();
        match batch {
            Some(batch) => self
                .inner
                .transport
                .send(batch)
                .await
                .map(FlushOutcome::Sent),
            None => Ok(FlushOutcome::Empty),
        }
    }

    /// Drain the buffer straight to the transport's synchronous crash path.
    /// Completes all work before returning; nothing is scheduled.
    pub fn flush_on_crash(&self) -> FlushOutcome {
        let batch = self.inner.state.lock().take_batch();
        match batch {
            Some(batch) => {
                let items = batch.size();
                self.inner.transport.save_on_crash(&batch);
                FlushOutcome::PersistedOnCrash { items }
            }
            None => FlushOutcome::Empty,
        }
    }

    pub fn set_offline_mode(&self, enabled: bool) {
        self.inner.transport.set_disk_retry_mode(enabled);
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.inner.disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.disabled.load(Ordering::Relaxed)
    }

    pub fn buffered_len(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }

    pub fn last_send(&self) -> Option<Instant> {
        self.inner.state.lock().last_send
    }

    pub fn has_pending_timer(&self) -> bool {
        self.inner.state.lock().timer.is_some()
    }

    /// Wait for size- and interval-triggered sends that are still running.
    pub async fn wait_for_in_flight(&self) {
        let handles = std::mem::take(&mut self.inner.state.lock().in_flight);
        for handle in handles {
            if let Err(e) = handle.await {
                debug!(error = %e, "In-flight flush did not complete");
            }
        }
    }

    pub fn in_flight_len(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.in_flight.retain(|h| !h.is_finished());
        state.in_flight.len()
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    fn spawn_flush_timer(&self, generation: u64) -> JoinHandle<()> {
        let channel = self.clone();
        let interval = self.inner.config.batch_interval;

        self.inner.runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            if !channel.claim_timer(generation) {
                return;
            }
            let batch = channel.inner.state.lock().take_batch();
            if let Some(batch) = batch {
                debug!(
                    batch_id = batch.id(),
                    items = batch.size(),
                    "Batch interval elapsed, flushing"
                );
                channel.dispatch(batch);
            }
        })
    }

    /// Release the timer slot on behalf of the timer armed as `generation`.
    /// Returns false if the slot has since been flushed or re-armed, in which
    /// case the caller is stale and must not flush.
    fn claim_timer(&self, generation: u64) -> bool {
        let mut state = self.inner.state.lock();
        if state.timer_generation != generation {
            return false;
        }
        state.timer = None;
        true
    }

    fn dispatch(&self, batch: Batch) {
        let transport = Arc::clone(&self.inner.transport);
        let handle = self.inner.runtime.spawn(async move {
            if let Err(e) = transport.send(batch).await {
                debug!(error = %e, "Background flush failed");
            }
        });

        let mut state = self.inner.state.lock();
        state.in_flight.retain(|h| !h.is_finished());
        state.in_flight.push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::IngestionResponse;
    use std::future::Future;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingTransport {
        sends: AtomicUsize,
    }

    impl Transport for CountingTransport {
        fn send(
            &self,
            _batch: Batch,
        ) -> impl Future<Output = Result<SendOutcome, SenderError>> + Send {
            self.sends.fetch_add(1, Ordering::SeqCst);
            async {
                Ok(SendOutcome {
                    status: 200,
                    body: String::new(),
                    response: IngestionResponse::Accepted,
                    persisted_items: 0,
                })
            }
        }

        fn save_on_crash(&self, _batch: &Batch) {}

        fn set_disk_retry_mode(&self, _enabled: bool) {}
    }

    fn timer_generation<T: Transport>(channel: &BatchingChannel<T>) -> u64 {
        channel.inner.state.lock().timer_generation
    }

    #[tokio::test]
    async fn test_stale_timer_leaves_newer_timer_armed() {
        let channel = BatchingChannel::new(
            ChannelConfig {
                batch_size: 10,
                batch_interval: Duration::from_secs(60),
            },
            Arc::new(CountingTransport::default()),
        )
        .unwrap();

        channel.send("first");
        let stale = timer_generation(&channel);
        channel.trigger_send().await.unwrap();

        channel.send("second");
        assert!(channel.has_pending_timer());

        // The first timer waking up late must not touch the second one.
        assert!(!channel.claim_timer(stale));
        assert!(channel.has_pending_timer());
        assert_eq!(channel.buffered_len(), 1);

        assert!(channel.claim_timer(timer_generation(&channel)));
        assert!(!channel.has_pending_timer());
        assert_eq!(channel.transport().sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_flush_invalidates_pending_timer() {
        let channel = BatchingChannel::new(
            ChannelConfig {
                batch_size: 2,
                batch_interval: Duration::from_secs(60),
            },
            Arc::new(CountingTransport::default()),
        )
        .unwrap();

        channel.send("a");
        let armed = timer_generation(&channel);
        channel.send("b");

        assert!(!channel.claim_timer(armed));
        channel.wait_for_in_flight().await;
        assert_eq!(channel.transport().sends.load(Ordering::SeqCst), 1);
        assert_eq!(channel.in_flight_len(), 0);
    }
}
