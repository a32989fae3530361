use super::config::Config;
use crate::buffer::{BatchingChannel, FlushOutcome};
use crate::domain::{
    PipelineError, TelemetryContext, TelemetryRecord, TelemetryType, build_envelope,
};
use crate::sender::{AuthorizationProvider, Sender, SenderError, StaticTokenProvider};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

/// Owns one sender and the batching channel in front of it.
///
/// Everything the delivery path needs is reachable from here; there is no
/// process-wide state, so several pipelines (for several instrumentation
/// keys) can coexist.
pub struct TelemetryPipeline {
    channel: BatchingChannel<Sender>,
    sender: Arc<Sender>,
    context: TelemetryContext,
    common_properties: BTreeMap<String, String>,
    instrumentation_key: String,
}

impl TelemetryPipeline {
    /// Must be called from within a tokio runtime.
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let auth = config.bearer_token.as_ref().map(|token| {
            Arc::new(StaticTokenProvider::new(token.clone())) as Arc<dyn AuthorizationProvider>
        });

        let sender = Arc::new(Sender::new(
            config.sender.clone(),
            config.disk.clone(),
            auth,
        )?);
        let channel = BatchingChannel::new(config.channel.clone(), Arc::clone(&sender))?;
        channel.set_disabled(config.disabled);

        Ok(Self {
            channel,
            sender,
            context: TelemetryContext::with_defaults(),
            common_properties: BTreeMap::new(),
            instrumentation_key: config.instrumentation_key.clone(),
        })
    }

    pub fn channel(&self) -> &BatchingChannel<Sender> {
        &self.channel
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    pub fn context_mut(&mut self) -> &mut TelemetryContext {
        &mut self.context
    }

    /// Properties merged into every envelope, under the record's own.
    pub fn set_common_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.common_properties.insert(key.into(), value.into());
    }

    pub fn track(&self, record: &TelemetryRecord, telemetry_type: TelemetryType) {
        let envelope = build_envelope(
            record,
            telemetry_type,
            &self.common_properties,
            &self.context,
            &self.instrumentation_key,
        );
        self.channel.send(&envelope);
    }

    /// Send whatever is buffered, then wait for background sends started
    /// earlier so every response has been observed on return.
    pub async fn flush(&self) -> Result<FlushOutcome, SenderError> {
        let outcome = self.channel.trigger_send().await;
        self.channel.wait_for_in_flight().await;
        outcome
    }

    pub fn flush_on_crash(&self) -> FlushOutcome {
        self.channel.flush_on_crash()
    }

    pub fn shutdown(&self) {
        self.sender.shutdown();
    }
}

/// One line of newline-delimited input.
#[derive(Debug, Clone, Deserialize)]
pub struct InputRecord {
    #[serde(rename = "type")]
    pub telemetry_type: TelemetryType,
    #[serde(flatten)]
    pub record: TelemetryRecord,
}

pub fn parse_input_line(line: &str) -> Result<InputRecord, PipelineError> {
    serde_json::from_str(line).map_err(|e| PipelineError::Input(e.to_string()))
}

/// Feed every record from `reader` into the pipeline until EOF. Malformed
/// lines are logged and skipped. Returns the number of records tracked.
pub async fn run_input_loop<R>(
    pipeline: &TelemetryPipeline,
    reader: R,
) -> Result<usize, PipelineError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut tracked = 0;
    let mut line_number = 0usize;

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| PipelineError::Input(e.to_string()))?
    {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        match parse_input_line(&line) {
            Ok(input) => {
                pipeline.track(&input.record, input.telemetry_type);
                tracked += 1;
            }
            Err(e) => warn!(line = line_number, error = %e, "Skipping malformed input record"),
        }
    }

    info!(tracked, "Input closed");
    debug!(buffered = pipeline.channel().buffered_len(), "Remaining in buffer");
    Ok(tracked)
}
