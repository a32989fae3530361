use super::auth::{AuthorizationError, AuthorizationProvider};
use super::client::{HttpClient, SenderConfig};
use super::response::{IngestionResponse, resolve_location};
use super::serialization::prepare_payload;
use super::state::{SenderState, SenderStats};
use super::Transport;
use crate::buffer::Batch;
use crate::reliability::{DiskConfig, DiskOverflowStore};
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::header::LOCATION;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Under a sustained outage only every Nth consecutive failure is logged at warn.
pub const MAX_CONNECTION_FAILURES_BEFORE_WARN: u32 = 5;

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("No async runtime available: {0}")]
    NoRuntime(String),
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Authorization failed: {0}")]
    Authorization(#[from] AuthorizationError),
    #[error("Error sending telemetry because of circular redirects ({redirects} consecutive)")]
    CircularRedirect { redirects: u32 },
    #[error("Redirect status {status} without a usable Location header")]
    RedirectWithoutLocation { status: u16 },
}

/// What the collector said about one batch.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub status: u16,
    pub body: String,
    pub response: IngestionResponse,
    /// Number of items written to the disk overflow store as a result.
    pub persisted_items: usize,
}

impl SendOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self.response, IngestionResponse::Accepted)
    }
}

/// HTTP transport to the ingestion endpoint.
///
/// Follows 307/308 redirects itself (remembering the learned host), triages
/// retriable statuses down to the individual items that should be retried,
/// and hands undeliverable batches to the [`DiskOverflowStore`] when disk
/// retry is enabled.
#[derive(Clone)]
pub struct Sender {
    inner: Arc<SenderInner>,
}

struct SenderInner {
    client: HttpClient,
    config: SenderConfig,
    store: DiskOverflowStore,
    auth: Option<Arc<dyn AuthorizationProvider>>,
    state: SenderState,
    runtime: Handle,
    cancel: CancellationToken,
}

impl Sender {
    pub fn new(
        config: SenderConfig,
        disk_config: DiskConfig,
        auth: Option<Arc<dyn AuthorizationProvider>>,
    ) -> Result<Self, SenderError> {
        if config.max_redirects == 0 {
            return Err(SenderError::InvalidConfiguration(
                "Max redirects must be greater than 0".to_string(),
            ));
        }

        let client = HttpClient::new(&config)?;
        let runtime = Handle::try_current().map_err(|e| SenderError::NoRuntime(e.to_string()))?;
        let disk_retry = config.disk_retry_enabled;

        let sender = Self {
            inner: Arc::new(SenderInner {
                client,
                config,
                store: DiskOverflowStore::new(disk_config),
                auth,
                state: SenderState::new(false),
                runtime,
                cancel: CancellationToken::new(),
            }),
        };

        sender.set_disk_retry_mode(disk_retry);
        Ok(sender)
    }

    pub fn store(&self) -> &DiskOverflowStore {
        &self.inner.store
    }

    pub fn state(&self) -> &SenderState {
        &self.inner.state
    }

    pub fn stats(&self) -> SenderStats {
        self.inner.state.snapshot()
    }

    pub fn config(&self) -> &SenderConfig {
        &self.inner.config
    }

    pub fn disk_retry_enabled(&self) -> bool {
        self.inner.state.disk_retry_enabled()
    }

    pub fn has_pending_resend(&self) -> bool {
        self.inner
            .state
            .resend_timer
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Toggle disk retry. Enabling starts the periodic expiry sweep;
    /// disabling stops it.
    pub fn set_disk_retry_mode(&self, enabled: bool) {
        self.inner.state.set_disk_retry(enabled);

        let mut cleanup = self.inner.state.cleanup_timer.lock();
        if enabled {
            if cleanup.as_ref().is_none_or(|t| t.is_finished()) {
                let task = Self::cleanup_task(
                    Arc::downgrade(&self.inner),
                    self.inner.cancel.clone(),
                    self.inner.store.config().cleanup_interval,
                );
                *cleanup = Some(self.inner.runtime.spawn(task));
            }
        } else if let Some(timer) = cleanup.take() {
            timer.abort();
        }
    }

    /// Send one batch, following redirects. Retriable failures are persisted
    /// as a side effect and still reported as `Ok` with the raw response.
    pub async fn send_batch(&self, batch: Batch) -> Result<SendOutcome, SenderError> {
        let payload = prepare_payload(batch.payload()).await;
        debug!(
            batch_id = batch.id(),
            items = batch.size(),
            bytes = payload.body.len(),
            compressed = payload.compressed,
            "Sending batch"
        );

        loop {
            let url = self.inner.state.target_url(self.inner.client.endpoint_url());
            let mut headers = self.inner.client.build_headers(payload.compressed);

            if let Some(auth) = &self.inner.auth
                && let Err(e) = auth.add_authorization_header(&mut headers).await
            {
                warn!(batch_id = batch.id(), error = %e, "Failed to obtain authorization header");
                self.persist(&batch).await;
                return Err(SenderError::Authorization(e));
            }

            self.inner.state.record_request();
            let response = match self
                .inner
                .client
                .post(url.clone(), headers, payload.body.clone())
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    self.on_network_error(&batch, &e).await;
                    return Err(SenderError::Network(e));
                }
            };

            let status = response.status().as_u16();
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    debug!(error = %e, "Failed to read response body");
                    String::new()
                }
            };

            let decoded = IngestionResponse::decode(status, location.as_deref(), &body);
            if !decoded.is_redirect() {
                self.inner.state.reset_redirects();
            }

            let persisted_items = match &decoded {
                IngestionResponse::Accepted => {
                    self.inner.state.reset_failures();
                    if self.disk_retry_enabled() {
                        self.arm_resend_timer();
                    }
                    info!(batch_id = batch.id(), items = batch.size(), "Batch accepted");
                    0
                }
                IngestionResponse::PartialFailure { status, errors } => {
                    warn!(
                        batch_id = batch.id(),
                        status,
                        "Ingestion endpoint returned a retriable status"
                    );
                    self.persist_retriable(&batch, errors.as_deref()).await
                }
                IngestionResponse::Redirect { status, location } => {
                    let redirects = self.inner.state.record_redirect();
                    if redirects >= self.inner.config.max_redirects {
                        self.inner.state.mark_abandoned();
                        warn!(
                            batch_id = batch.id(),
                            redirects, "Abandoning batch after circular redirects"
                        );
                        return Err(SenderError::CircularRedirect { redirects });
                    }

                    let Some(next) = location
                        .as_deref()
                        .and_then(|l| resolve_location(&url, l))
                    else {
                        warn!(batch_id = batch.id(), status, "Redirect without Location header");
                        return Err(SenderError::RedirectWithoutLocation { status: *status });
                    };

                    debug!(from = %url, to = %next, redirects, "Following redirect");
                    self.inner.state.set_redirect_url(next);
                    continue;
                }
                IngestionResponse::Fatal { status } => {
                    warn!(
                        batch_id = batch.id(),
                        status, "Ingestion endpoint rejected batch"
                    );
                    0
                }
            };

            return Ok(SendOutcome {
                status,
                body,
                response: decoded,
                persisted_items,
            });
        }
    }

    /// Synchronous crash path: write straight to disk, no network attempt.
    pub fn save_on_crash(&self, batch: &Batch) {
        if !self.disk_retry_enabled() {
            warn!(
                batch_id = batch.id(),
                items = batch.size(),
                "Disk retry is disabled, telemetry buffered at crash time is lost"
            );
            return;
        }
        if self.inner.store.store_to_disk_sync(batch).is_ok() {
            self.inner.state.record_persisted();
        }
    }

    /// Drain the oldest disk record and resubmit it. Returns `None` when
    /// nothing was on disk.
    pub async fn send_first_file_on_disk(&self) -> Option<Result<SendOutcome, SenderError>> {
        match self.inner.store.load_oldest().await {
            Ok(Some(batch)) => {
                info!(
                    batch_id = batch.id(),
                    items = batch.size(),
                    "Resending batch from disk"
                );
                Some(self.send_batch(batch).await)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Failed to load batch from disk");
                None
            }
        }
    }

    /// Cancelled by [`shutdown`](Self::shutdown) or when the last handle to
    /// this sender is dropped.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Cancel resend and cleanup timers.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.state.abort_timers();
    }

    async fn persist_retriable(
        &self,
        batch: &Batch,
        errors: Option<&[super::response::ItemError]>,
    ) -> usize {
        if !self.disk_retry_enabled() {
            return 0;
        }

        let retry = match errors {
            Some(errors) => {
                let indices = IngestionResponse::retriable_indices(errors);
                if indices.is_empty() {
                    return 0;
                }
                batch.select(indices)
            }
            // Retriable status with an unreadable body: keep everything.
            None => batch.clone(),
        };

        if self.persist(&retry).await {
            retry.size()
        } else {
            0
        }
    }

    async fn on_network_error(&self, batch: &Batch, error: &reqwest::Error) {
        let failures = self.inner.state.record_failure();
        let disk_retry = self.disk_retry_enabled();

        if failures == 1 || failures % MAX_CONNECTION_FAILURES_BEFORE_WARN == 0 {
            if disk_retry {
                warn!(
                    failures,
                    error = %error,
                    "Ingestion endpoint could not be reached, telemetry will be retried from disk"
                );
            } else {
                warn!(
                    failures,
                    error = %error,
                    "Ingestion endpoint could not be reached, this batch of telemetry has been lost"
                );
            }
        } else {
            info!(
                failures,
                disk_retry,
                error = %error,
                "Ingestion endpoint could not be reached"
            );
        }

        if disk_retry {
            self.persist(batch).await;
        }
    }

    async fn persist(&self, batch: &Batch) -> bool {
        if !self.disk_retry_enabled() {
            return false;
        }
        match self.inner.store.store_to_disk(batch).await {
            Ok(_) => {
                self.inner.state.record_persisted();
                true
            }
            Err(_) => false,
        }
    }

    fn arm_resend_timer(&self) {
        let mut timer = self.inner.state.resend_timer.lock();
        if timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let task = Self::resend_task(
            Arc::downgrade(&self.inner),
            self.inner.cancel.clone(),
            self.inner.config.resend_interval,
        );
        *timer = Some(self.inner.runtime.spawn(task));
    }

    // Tasks hold only a weak handle; their join handles live in `SenderInner`.
    // Boxed so the resend future does not make `send_batch` recursive.
    fn resend_task(
        inner: Weak<SenderInner>,
        cancel: CancellationToken,
        wait: Duration,
    ) -> BoxFuture<'static, ()> {
        async move {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(wait) => {}
            }
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let sender = Sender { inner };
            // Release the slot so a successful resend can arm the next one.
            drop(sender.inner.state.resend_timer.lock().take());
            if let Some(Err(e)) = sender.send_first_file_on_disk().await {
                debug!(error = %e, "Resend from disk failed");
            }
        }
        .boxed()
    }

    fn cleanup_task(
        inner: Weak<SenderInner>,
        cancel: CancellationToken,
        period: Duration,
    ) -> BoxFuture<'static, ()> {
        async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                if let Err(e) = inner.store.cleanup_expired().await {
                    warn!(error = %e, "Disk cleanup failed");
                }
            }
        }
        .boxed()
    }
}

impl Drop for SenderInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.state.abort_timers();
    }
}

impl Transport for Sender {
    fn send(&self, batch: Batch) -> impl Future<Output = Result<SendOutcome, SenderError>> + Send {
        self.send_batch(batch)
    }

    fn save_on_crash(&self, batch: &Batch) {
        Sender::save_on_crash(self, batch);
    }

    fn set_disk_retry_mode(&self, enabled: bool) {
        Sender::set_disk_retry_mode(self, enabled);
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("config", &self.inner.config)
            .field("stats", &self.inner.state.snapshot())
            .field("redirect_url", &self.inner.state.redirect_url())
            .finish()
    }
}
