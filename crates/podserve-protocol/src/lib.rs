//! Wire types shared by the podserve HTTP surface and its clients.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Finished,
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Finished => "finished",
            JobStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Stopped)
    }
}

/// Body of `POST /jobs/`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewJobRequest {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt: String,
    /// Translation direction such as `en:ru`. Recorded on the job, not acted upon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translate: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueuedResponse {
    pub id: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: String,
    pub status: JobStatus,
    pub prompt: String,
    pub output: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Body of `POST /v1/chat/completions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Accepted for compatibility. Sampling is fixed per pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: usize,
    pub message: ChatMessage,
    pub logprobs: Option<serde_json::Value>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub usage: Usage,
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub pod_count: usize,
    pub cpu_load: f32,
    pub gpu_load: f32,
}

/// Every 4xx/5xx body: a human message plus a stable machine code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

impl ErrorBody {
    pub fn new(code: &str, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_roles_deserialize_without_failing() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"messages":[{"role":"system","content":"a"},{"role":"tool","content":"b"}]}"#,
        )
        .expect("parse chat request");
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[1].role, Role::Unknown);
    }

    #[test]
    fn health_uses_camel_case_keys() {
        let body = serde_json::to_value(HealthResponse {
            pod_count: 2,
            cpu_load: 0.5,
            gpu_load: 0.0,
        })
        .expect("serialize health");
        assert_eq!(body["podCount"], 2);
        assert!(body.get("cpuLoad").is_some());
        assert!(body.get("gpuLoad").is_some());
    }

    #[test]
    fn job_status_serializes_lowercase() {
        let body = serde_json::to_string(&JobStatusResponse {
            status: JobStatus::Processing,
        })
        .expect("serialize status");
        assert_eq!(body, r#"{"status":"processing"}"#);
        assert!(JobStatus::Stopped.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }
}
