use std::time::{SystemTime, UNIX_EPOCH};

use podserve_protocol::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSource {
    /// `POST /jobs/`: the prompt is raw user text.
    Api,
    /// Chat completion: the prompt lives pre-formatted in an ephemeral session.
    Chat,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub session_id: Option<String>,
    pub status: JobStatus,
    pub source: JobSource,

    pub prompt: String,
    pub full_prompt: String,
    pub output: String,
    pub requested_model: Option<String>,
    pub translate: Option<String>,

    pub model_id: String,
    pub prompt_id: String,
    pub sampling_id: String,
    /// Pod index, set only while processing.
    pub pod: Option<usize>,

    pub created_at: u64,
    pub started_at: u64,
    pub finished_at: u64,

    pub prompt_tokens: usize,
    pub output_tokens: usize,
    /// ms per prompt token.
    pub prompt_eval: f32,
    /// ms per output token.
    pub token_eval: f32,
}

impl Job {
    pub fn new(id: String, session_id: Option<String>, prompt: String, source: JobSource) -> Self {
        Job {
            id,
            session_id,
            status: JobStatus::Queued,
            source,
            prompt,
            full_prompt: String::new(),
            output: String::new(),
            requested_model: None,
            translate: None,
            model_id: String::new(),
            prompt_id: String::new(),
            sampling_id: String::new(),
            pod: None,
            created_at: now_millis(),
            started_at: 0,
            finished_at: 0,
            prompt_tokens: 0,
            output_tokens: 0,
            prompt_eval: 0.0,
            token_eval: 0.0,
        }
    }

    pub fn age_millis(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }

    pub fn status_line(&self) -> String {
        format!(
            "id={} status={} pod={} session={} prompt_tokens={} output_tokens={} age_ms={}",
            self.id,
            self.status.as_str(),
            self.pod
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.session_id.as_deref().unwrap_or("-"),
            self.prompt_tokens,
            self.output_tokens,
            self.age_millis(now_millis())
        )
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
