use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Discriminator of an inbound stream event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    Connected,
    Progress,
    Chunk,
    StageStart,
    StageComplete,
    Complete,
    Error,
    Cancelled,
    Heartbeat,
}

impl StreamEventKind {
    /// Wire name of the kind, as carried in the `type` field.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Progress => "progress",
            Self::Chunk => "chunk",
            Self::StageStart => "stage_start",
            Self::StageComplete => "stage_complete",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Heartbeat => "heartbeat",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        let kind = match name {
            "connected" => Self::Connected,
            "progress" => Self::Progress,
            "chunk" => Self::Chunk,
            "stage_start" => Self::StageStart,
            "stage_complete" => Self::StageComplete,
            "complete" => Self::Complete,
            "error" => Self::Error,
            "cancelled" => Self::Cancelled,
            "heartbeat" => Self::Heartbeat,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for StreamEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage reported by progress and stage events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Initializing,
    ContextBuilding,
    PromptConstruction,
    ModelRouting,
    ModelInference,
    Evaluation,
    PostProcessing,
    Complete,
    Error,
}

impl ProgressStage {
    /// Human-readable label for progress displays.
    pub fn label(self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::ContextBuilding => "Building Context",
            Self::PromptConstruction => "Constructing Prompt",
            Self::ModelRouting => "Routing Model",
            Self::ModelInference => "Generating Response",
            Self::Evaluation => "Evaluating Quality",
            Self::PostProcessing => "Post-Processing",
            Self::Complete => "Complete",
            Self::Error => "Error",
        }
    }
}

/// Lifecycle of one stage inside a progress snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Complete,
    Error,
}

/// Per-stage entry of a progress snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageInfo {
    /// Stage this entry describes.
    pub stage: ProgressStage,
    /// Whether the stage is pending, running, done or failed.
    pub status: StageStatus,
    /// Completion of this stage alone, 0 to 100.
    #[serde(default)]
    pub progress_percent: f64,
    /// Status line shown next to the stage.
    #[serde(default)]
    pub message: String,
    /// RFC 3339 start time, once the stage has begun.
    #[serde(default)]
    pub started_at: Option<String>,
    /// RFC 3339 end time, once the stage has finished.
    #[serde(default)]
    pub completed_at: Option<String>,
    /// Stage-specific extras, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConnectedData {
    /// Server-assigned id of this websocket connection.
    #[serde(default)]
    pub connection_id: Option<String>,
    /// Inference the connection is subscribed to.
    #[serde(default)]
    pub inference_id: Option<String>,
    /// Greeting text from the server.
    #[serde(default)]
    pub message: Option<String>,
}

/// Snapshot of the whole pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressData {
    /// Overall completion, 0 to 100.
    #[serde(alias = "percentage", alias = "progress")]
    pub overall_progress: f64,
    /// Stage currently running.
    #[serde(default, alias = "stage")]
    pub current_stage: Option<ProgressStage>,
    /// Every stage known so far, in pipeline order.
    #[serde(default)]
    pub stages: Vec<StageInfo>,
    /// RFC 3339 start time of the inference.
    #[serde(default)]
    pub started_at: Option<String>,
    /// RFC 3339 end time, set once the inference finished.
    #[serde(default)]
    pub completed_at: Option<String>,
    /// Wall-clock seconds since the inference started.
    #[serde(default)]
    pub elapsed_time_seconds: Option<f64>,
    /// Server estimate of the seconds left.
    #[serde(default)]
    pub estimated_remaining_seconds: Option<f64>,
    /// Failure text when the pipeline stopped in error.
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ProgressData {
    /// Label of the current stage, if the peer reported one.
    pub fn stage_label(&self) -> Option<&'static str> {
        self.current_stage.map(ProgressStage::label)
    }
}

/// Incremental piece of model output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkData {
    /// Text to append to the output so far.
    #[serde(alias = "chunk")]
    pub text: String,
    /// Position of the chunk in the stream, when the server numbers them.
    #[serde(default)]
    pub index: Option<u64>,
    /// Chunk-specific extras, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Payload shared by `stage_start` and `stage_complete`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageData {
    /// Stage that started or finished.
    pub stage: ProgressStage,
    /// Status line for the transition.
    #[serde(default)]
    pub message: String,
    /// Overall completion at the time of the transition, 0 to 100.
    #[serde(default)]
    pub overall_progress: f64,
    /// Stage-specific extras, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Final result attached to a `complete` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InferenceResult {
    /// Inference that produced the result.
    #[serde(default)]
    pub inference_id: Option<String>,
    /// Full model output.
    #[serde(default)]
    pub output: String,
    /// Evaluator score, when evaluation ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_score: Option<f64>,
    /// Whether the output passed evaluation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_passed: Option<bool>,
    /// Model the router selected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    /// Provider that served the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Prompt plus completion tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    /// Model latency in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    /// Backend-specific fields not modelled above.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompleteData {
    /// Result of the inference, absent when the server omits it.
    #[serde(default)]
    pub result: Option<InferenceResult>,
    /// Total wall-clock seconds of the inference.
    #[serde(default)]
    pub elapsed_time_seconds: Option<f64>,
}

/// Failure reported by the peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorData {
    /// Human-readable failure text.
    #[serde(alias = "error")]
    pub message: String,
    /// Machine-readable code; numeric codes are kept as their decimal text.
    #[serde(default, deserialize_with = "deserialize_error_code")]
    pub code: Option<String>,
    /// Extra diagnostic fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CancelledData {
    /// Confirmation text from the server.
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatData {
    /// Server clock at send time.
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Envelope fields shared by every inbound event plus its typed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope<T> {
    /// Inference named in the envelope, if any.
    pub inference_id: Option<String>,
    /// Server timestamp of the frame, if any.
    pub timestamp: Option<String>,
    /// Kind-specific payload.
    pub data: T,
}

pub type ConnectedEvent = EventEnvelope<ConnectedData>;
pub type ProgressEvent = EventEnvelope<ProgressData>;
pub type ChunkEvent = EventEnvelope<ChunkData>;
pub type StageStartEvent = EventEnvelope<StageData>;
pub type StageCompleteEvent = EventEnvelope<StageData>;
pub type CompleteEvent = EventEnvelope<CompleteData>;
pub type ErrorEvent = EventEnvelope<ErrorData>;
pub type CancelledEvent = EventEnvelope<CancelledData>;
pub type HeartbeatEvent = EventEnvelope<HeartbeatData>;

/// Decoded inbound stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected(ConnectedEvent),
    Progress(ProgressEvent),
    Chunk(ChunkEvent),
    StageStart(StageStartEvent),
    StageComplete(StageCompleteEvent),
    Complete(CompleteEvent),
    Error(ErrorEvent),
    Cancelled(CancelledEvent),
    Heartbeat(HeartbeatEvent),
}

impl StreamEvent {
    /// Decodes one inbound text frame.
    ///
    /// Accepts both `{type, inference_id, timestamp, data: {..}}` and flat
    /// `{type, ..payload}` frames.
    pub fn from_text(text: &str) -> Result<Self, EventDecodeError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, EventDecodeError> {
        let Value::Object(mut object) = value else {
            return Err(EventDecodeError::NotAnObject);
        };

        let kind = match object.get("type") {
            Some(Value::String(name)) => StreamEventKind::from_wire(name)
                .ok_or_else(|| EventDecodeError::UnknownType(name.clone()))?,
            _ => return Err(EventDecodeError::MissingType),
        };
        let inference_id = optional_string(&object, "inference_id")?;
        let timestamp = optional_string(&object, "timestamp")?;

        let data = match object.remove("data") {
            Some(Value::Object(data)) => Value::Object(data),
            Some(Value::Null) | None => Value::Object(object),
            Some(_) => return Err(EventDecodeError::InvalidField { field: "data" }),
        };

        let event = match kind {
            StreamEventKind::Connected => Self::Connected(EventEnvelope {
                inference_id,
                timestamp,
                data: decode_payload(kind, data)?,
            }),
            StreamEventKind::Progress => Self::Progress(EventEnvelope {
                inference_id,
                timestamp,
                data: decode_payload(kind, data)?,
            }),
            StreamEventKind::Chunk => Self::Chunk(EventEnvelope {
                inference_id,
                timestamp,
                data: decode_payload(kind, data)?,
            }),
            StreamEventKind::StageStart => Self::StageStart(EventEnvelope {
                inference_id,
                timestamp,
                data: decode_payload(kind, data)?,
            }),
            StreamEventKind::StageComplete => Self::StageComplete(EventEnvelope {
                inference_id,
                timestamp,
                data: decode_payload(kind, data)?,
            }),
            StreamEventKind::Complete => Self::Complete(EventEnvelope {
                inference_id,
                timestamp,
                data: decode_payload(kind, data)?,
            }),
            StreamEventKind::Error => Self::Error(EventEnvelope {
                inference_id,
                timestamp,
                data: decode_payload(kind, data)?,
            }),
            StreamEventKind::Cancelled => Self::Cancelled(EventEnvelope {
                inference_id,
                timestamp,
                data: decode_payload(kind, data)?,
            }),
            StreamEventKind::Heartbeat => Self::Heartbeat(EventEnvelope {
                inference_id,
                timestamp,
                data: decode_payload(kind, data)?,
            }),
        };
        Ok(event)
    }

    pub fn kind(&self) -> StreamEventKind {
        match self {
            Self::Connected(_) => StreamEventKind::Connected,
            Self::Progress(_) => StreamEventKind::Progress,
            Self::Chunk(_) => StreamEventKind::Chunk,
            Self::StageStart(_) => StreamEventKind::StageStart,
            Self::StageComplete(_) => StreamEventKind::StageComplete,
            Self::Complete(_) => StreamEventKind::Complete,
            Self::Error(_) => StreamEventKind::Error,
            Self::Cancelled(_) => StreamEventKind::Cancelled,
            Self::Heartbeat(_) => StreamEventKind::Heartbeat,
        }
    }

    pub fn inference_id(&self) -> Option<&str> {
        let inference_id = match self {
            Self::Connected(event) => &event.inference_id,
            Self::Progress(event) => &event.inference_id,
            Self::Chunk(event) => &event.inference_id,
            Self::StageStart(event) => &event.inference_id,
            Self::StageComplete(event) => &event.inference_id,
            Self::Complete(event) => &event.inference_id,
            Self::Error(event) => &event.inference_id,
            Self::Cancelled(event) => &event.inference_id,
            Self::Heartbeat(event) => &event.inference_id,
        };
        inference_id.as_deref()
    }
}

/// Control frames sent from the client to the stream peer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Cancel,
    Ping,
}

impl ClientMessage {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Reasons an inbound frame could not be mapped to a [`StreamEvent`].
#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a json object")]
    NotAnObject,

    #[error("frame has no string `type` field")]
    MissingType,

    #[error("unknown event type `{0}`")]
    UnknownType(String),

    #[error("field `{field}` has the wrong type")]
    InvalidField { field: &'static str },

    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: StreamEventKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Formats a duration in seconds as `250ms`, `12.5s`, or `2m 5s`.
pub fn format_duration(seconds: f64) -> String {
    if seconds < 1.0 {
        return format!("{}ms", (seconds * 1000.0).round() as i64);
    }
    if seconds < 60.0 {
        return format!("{seconds:.1}s");
    }
    let minutes = (seconds / 60.0).floor() as u64;
    let remaining = (seconds % 60.0).floor() as u64;
    format!("{minutes}m {remaining}s")
}

/// Formats a 0-100 progress value as a rounded percentage.
pub fn format_progress(progress: f64) -> String {
    format!("{}%", progress.round() as i64)
}

fn optional_string(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, EventDecodeError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(EventDecodeError::InvalidField { field }),
    }
}

fn decode_payload<T>(kind: StreamEventKind, data: Value) -> Result<T, EventDecodeError>
where
    T: DeserializeOwned,
{
    serde_json::from_value(data).map_err(|source| EventDecodeError::InvalidPayload { kind, source })
}

fn deserialize_error_code<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(code)) => Ok(Some(code)),
        Some(Value::Number(code)) => Ok(Some(code.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "error code must be a string or number, got {other}"
        ))),
    }
}
