use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const ENVELOPE_SCHEMA_VERSION: u32 = 1;
const DATA_SCHEMA_VERSION: u32 = 2;
const NAME_PREFIX: &str = "Microsoft.ApplicationInsights";

pub const MAX_PROPERTY_KEY_LENGTH: usize = 150;
pub const MAX_PROPERTY_VALUE_LENGTH: usize = 8192;

pub const TAG_CLOUD_ROLE_INSTANCE: &str = "ai.cloud.roleInstance";
pub const TAG_INTERNAL_SDK_VERSION: &str = "ai.internal.sdkVersion";

/// Normalized wire record for one telemetry event.
///
/// Envelopes are immutable once built; the batching channel serializes them
/// into newline-delimited JSON at `send` time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub ver: u32,
    pub name: String,
    pub time: String,
    #[serde(rename = "iKey")]
    pub instrumentation_key: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    pub data: Data,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Data {
    #[serde(rename = "baseType")]
    pub base_type: String,
    #[serde(rename = "baseData")]
    pub base_data: Value,
}

impl Envelope {
    pub fn telemetry_type(&self) -> Option<TelemetryType> {
        TelemetryType::from_base_type(&self.data.base_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TelemetryType {
    Event,
    #[serde(alias = "Message")]
    Trace,
    Exception,
    Request,
    #[serde(alias = "RemoteDependency")]
    Dependency,
    Metric,
    Availability,
    PageView,
}

impl TelemetryType {
    pub const ALL: [TelemetryType; 8] = [
        TelemetryType::Event,
        TelemetryType::Trace,
        TelemetryType::Exception,
        TelemetryType::Request,
        TelemetryType::Dependency,
        TelemetryType::Metric,
        TelemetryType::Availability,
        TelemetryType::PageView,
    ];

    /// Short type name used as the suffix of the envelope name.
    pub fn as_str(self) -> &'static str {
        match self {
            TelemetryType::Event => "Event",
            TelemetryType::Trace => "Message",
            TelemetryType::Exception => "Exception",
            TelemetryType::Request => "Request",
            TelemetryType::Dependency => "RemoteDependency",
            TelemetryType::Metric => "Metric",
            TelemetryType::Availability => "Availability",
            TelemetryType::PageView => "PageView",
        }
    }

    pub fn base_type(self) -> String {
        format!("{}Data", self.as_str())
    }

    pub fn from_base_type(base_type: &str) -> Option<Self> {
        let short = base_type.strip_suffix("Data")?;
        Self::ALL.into_iter().find(|t| t.as_str() == short)
    }
}

/// A typed telemetry record produced by instrumentation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryRecord {
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Context tags stamped onto every envelope.
#[derive(Debug, Clone, Default)]
pub struct TelemetryContext {
    pub tags: BTreeMap<String, String>,
}

impl TelemetryContext {
    pub fn with_defaults() -> Self {
        let mut tags = BTreeMap::new();
        if let Some(host) = hostname::get().ok().and_then(|h| h.into_string().ok()) {
            tags.insert(TAG_CLOUD_ROLE_INSTANCE.to_string(), host);
        }
        tags.insert(
            TAG_INTERNAL_SDK_VERSION.to_string(),
            format!("rust:{}", env!("CARGO_PKG_VERSION")),
        );
        Self { tags }
    }
}

/// Build a wire envelope from a telemetry record. Never fails: oversized
/// property keys and values are truncated rather than rejected.
pub fn build_envelope(
    record: &TelemetryRecord,
    telemetry_type: TelemetryType,
    common_properties: &BTreeMap<String, String>,
    context: &TelemetryContext,
    instrumentation_key: &str,
) -> Envelope {
    let mut properties = BTreeMap::new();
    for (key, value) in common_properties.iter().chain(record.properties.iter()) {
        properties.insert(
            truncate(key, MAX_PROPERTY_KEY_LENGTH),
            truncate(value, MAX_PROPERTY_VALUE_LENGTH),
        );
    }

    let mut base_data = record.data.clone();
    base_data.insert("ver".to_string(), Value::from(DATA_SCHEMA_VERSION));
    if !properties.is_empty() {
        let properties = properties
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect::<Map<_, _>>();
        base_data.insert("properties".to_string(), Value::Object(properties));
    }

    let ikey_no_dashes = instrumentation_key.replace('-', "");
    let name = if ikey_no_dashes.is_empty() {
        format!("{NAME_PREFIX}.{}", telemetry_type.as_str())
    } else {
        format!("{NAME_PREFIX}.{ikey_no_dashes}.{}", telemetry_type.as_str())
    };

    Envelope {
        ver: ENVELOPE_SCHEMA_VERSION,
        name,
        time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        instrumentation_key: instrumentation_key.to_string(),
        tags: context.tags.clone(),
        data: Data {
            base_type: telemetry_type.base_type(),
            base_data: Value::Object(base_data),
        },
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}
