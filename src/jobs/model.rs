use crate::error::GatewayError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Imagine,
    Action,
    Blend,
    Describe,
    Inpaint,
}

impl JobAction {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "imagine" => Some(Self::Imagine),
            "action" => Some(Self::Action),
            "blend" => Some(Self::Blend),
            "describe" => Some(Self::Describe),
            "inpaint" => Some(Self::Inpaint),
            _ => None,
        }
    }

    /// Route segment under `/mj/submit/`.
    pub fn from_route(s: &str) -> Option<Self> {
        match s {
            "modal" => Some(Self::Inpaint),
            other => Self::from_str(other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Imagine => "imagine",
            Self::Action => "action",
            Self::Blend => "blend",
            Self::Describe => "describe",
            Self::Inpaint => "inpaint",
        }
    }

    pub fn submit_path(&self) -> &'static str {
        match self {
            Self::Imagine => "/mj/submit/imagine",
            Self::Action => "/mj/submit/action",
            Self::Blend => "/mj/submit/blend",
            Self::Describe => "/mj/submit/describe",
            Self::Inpaint => "/mj/submit/modal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    PendingQueue,
    OnQueue,
    Success,
    Failed,
}

impl JobStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending_queue" => Some(Self::PendingQueue),
            "on_queue" => Some(Self::OnQueue),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingQueue => "pending_queue",
            Self::OnQueue => "on_queue",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    #[default]
    Fast,
    Relax,
    Turbo,
}

impl JobMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Some(Self::Fast),
            "relax" => Some(Self::Relax),
            "turbo" => Some(Self::Turbo),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Relax => "relax",
            Self::Turbo => "turbo",
        }
    }

    pub fn default_timeout_secs(&self) -> i64 {
        match self {
            Self::Fast | Self::Turbo => 300,
            Self::Relax => 600,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: String,
    pub user_id: String,
    pub api_key_id: String,
    pub action: JobAction,
    pub status: JobStatus,
    pub mode: JobMode,
    pub parent_job_id: Option<String>,
    pub prompt: Option<String>,
    pub request_params: Value,
    pub upstream_task_id: Option<String>,
    pub provider_id: Option<String>,
    pub progress: i64,
    pub image_url: Option<String>,
    /// Raw upstream buttons, used to translate follow-up actions.
    pub buttons: Value,
    pub error_message: Option<String>,
    pub timeout_secs: i64,
    pub poll_attempts: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal()
            && now.signed_duration_since(self.created_at).num_seconds() > self.timeout_secs
    }
}

/// Inbound submission body, shared by every submit route.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBody {
    pub prompt: Option<String>,
    pub base64_array: Option<Vec<String>>,
    pub base64: Option<String>,
    pub mask_base64: Option<String>,
    pub task_id: Option<String>,
    pub custom_id: Option<String>,
    pub dimensions: Option<String>,
    pub bot_type: Option<String>,
    pub notify_hook: Option<String>,
    pub state: Option<String>,
    pub mode: Option<String>,
}

/// Validated submission ready to be stored.
#[derive(Debug, Clone)]
pub struct JobSubmission {
    pub action: JobAction,
    pub mode: JobMode,
    pub prompt: Option<String>,
    pub parent_job_id: Option<String>,
    pub custom_id: Option<String>,
    pub request_params: Value,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl SubmitBody {
    pub fn validate(self, action: JobAction) -> Result<JobSubmission, GatewayError> {
        let prompt = non_empty(&self.prompt);
        let mode = match self.mode.as_deref() {
            Some(raw) => JobMode::from_str(raw)
                .ok_or_else(|| GatewayError::validation("invalid_mode", format!("unknown mode {raw}")))?,
            None => JobMode::default(),
        };
        let images = self.base64_array.clone().unwrap_or_default();
        match action {
            JobAction::Imagine | JobAction::Inpaint if prompt.is_none() => {
                return Err(GatewayError::validation("MISSING_PROMPT", "prompt is required"));
            }
            JobAction::Action if non_empty(&self.task_id).is_none() => {
                return Err(GatewayError::validation("MISSING_TASK_ID", "taskId is required"));
            }
            JobAction::Action if non_empty(&self.custom_id).is_none() => {
                return Err(GatewayError::validation("MISSING_CUSTOM_ID", "customId is required"));
            }
            JobAction::Blend if !(2..=5).contains(&images.len()) => {
                return Err(GatewayError::validation(
                    "INVALID_IMAGES",
                    "blend requires between 2 and 5 images",
                ));
            }
            JobAction::Describe if non_empty(&self.base64).is_none() => {
                return Err(GatewayError::validation("MISSING_IMAGE", "base64 image is required"));
            }
            _ => {}
        }

        let mut params = Map::new();
        let mut put = |key: &str, value: Option<Value>| {
            if let Some(value) = value {
                params.insert(key.to_string(), value);
            }
        };
        put("prompt", prompt.clone().map(Value::String));
        put("base64Array", self.base64_array.map(|v| json!(v)));
        put("base64", self.base64.map(Value::String));
        put("maskBase64", self.mask_base64.map(Value::String));
        put("dimensions", self.dimensions.map(Value::String));
        put("botType", self.bot_type.map(Value::String));
        put("state", self.state.map(Value::String));
        put("notifyHook", self.notify_hook.map(Value::String));
        put("customId", self.custom_id.clone().map(Value::String));

        Ok(JobSubmission {
            action,
            mode,
            prompt,
            parent_job_id: non_empty(&self.task_id),
            custom_id: non_empty(&self.custom_id),
            request_params: Value::Object(params),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Button {
    pub custom_id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: u8,
    pub style: u8,
}

/// U1-U4 then V1-V4 for a finished imagine job.
pub fn buttons_for(job: &Job) -> Vec<Button> {
    if job.action != JobAction::Imagine || job.status != JobStatus::Success {
        return Vec::new();
    }
    let mut buttons = Vec::with_capacity(8);
    for (kind, label) in [("upsample", "U"), ("variation", "V")] {
        for n in 1..=4 {
            buttons.push(Button {
                custom_id: format!("MJ::JOB::{kind}::{n}::{}", job.job_id),
                label: format!("{label}{n}"),
                kind: 2,
                style: if kind == "upsample" { 2 } else { 1 },
            });
        }
    }
    buttons
}

/// Splits `MJ::JOB::{kind}::{index}::{job_id}` into its kind and index.
pub fn parse_custom_id(custom_id: &str) -> Option<(&str, u8)> {
    let mut parts = custom_id.split("::");
    if parts.next()? != "MJ" || parts.next()? != "JOB" {
        return None;
    }
    let kind = parts.next()?;
    let index = parts.next()?.parse().ok()?;
    Some((kind, index))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchView {
    pub id: String,
    pub action: String,
    pub status: String,
    pub progress: String,
    pub prompt: String,
    pub prompt_en: String,
    pub image_url: Option<String>,
    pub fail_reason: Option<String>,
    pub submit_time: i64,
    pub start_time: Option<i64>,
    pub finish_time: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<Button>,
}

impl From<&Job> for FetchView {
    fn from(job: &Job) -> Self {
        let prompt = job.prompt.clone().unwrap_or_default();
        Self {
            id: job.job_id.clone(),
            action: job.action.as_str().to_string(),
            status: job.status.as_str().to_string(),
            progress: format!("{}%", job.progress),
            prompt_en: prompt.clone(),
            prompt,
            image_url: job.image_url.clone(),
            fail_reason: job.error_message.clone(),
            submit_time: job.created_at.timestamp_millis(),
            start_time: job.started_at.map(|t| t.timestamp_millis()),
            finish_time: job.completed_at.map(|t| t.timestamp_millis()),
            buttons: buttons_for(job),
        }
    }
}

/// Envelope of every submit response.
#[derive(Debug, Clone, Serialize)]
pub struct MjResponse {
    pub code: i32,
    pub description: String,
    pub properties: Value,
    pub result: Value,
}

impl MjResponse {
    pub fn submitted(job: &Job) -> Self {
        Self {
            code: 1,
            description: "submitted".to_string(),
            properties: json!({ "status": job.status.as_str(), "action": job.action.as_str() }),
            result: Value::String(job.job_id.clone()),
        }
    }
}
