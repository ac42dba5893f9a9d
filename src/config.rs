use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "podserve.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Candle,
    Echo,
}

impl std::str::FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "candle" => Ok(EngineKind::Candle),
            "echo" => Ok(EngineKind::Echo),
            other => Err(format!("unknown engine '{}', use 'candle' or 'echo'", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server key, unique within a cluster; used for logging only.
    #[serde(default = "default_id")]
    pub id: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Optional log file, written next to stdout output.
    #[serde(default)]
    pub log: Option<PathBuf>,
    /// Directory for persisted session files.
    #[serde(default)]
    pub swap: Option<PathBuf>,
    /// Engine debug flags (`full`, `cuda`, ...), passed through verbatim.
    #[serde(default)]
    pub debug: String,
    /// Seconds a job may wait in the queue before it is dropped. 0 disables eviction.
    #[serde(default = "default_deadline")]
    pub deadline: u64,
    /// Seconds a chat completion request waits for its job.
    #[serde(default = "default_chat_timeout")]
    pub chat_timeout: u64,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_engine")]
    pub engine: EngineKind,
    #[serde(default)]
    pub echo: EchoConfig,

    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
    #[serde(default)]
    pub prompts: BTreeMap<String, PromptConfig>,
    #[serde(default)]
    pub samplings: BTreeMap<String, SamplingConfig>,
    #[serde(default)]
    pub pods: BTreeMap<String, PodConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EchoConfig {
    #[serde(default = "default_echo_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_echo_reply")]
    pub reply: String,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_echo_delay_ms(),
            reply: default_echo_reply(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub tokenizer: Option<PathBuf>,
    #[serde(default = "default_context")]
    pub context: usize,
    #[serde(default = "default_predict")]
    pub predict: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TemplatesConfig {
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub assistant: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptConfig {
    #[serde(default)]
    pub locale: String,
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub templates: TemplatesConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_temperature", alias = "temp")]
    pub temperature: f32,
    #[serde(default = "default_top_k", alias = "topk")]
    pub top_k: usize,
    #[serde(default = "default_top_p", alias = "topp")]
    pub top_p: f32,
    #[serde(default = "default_one")]
    pub typical_p: f32,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
    #[serde(default = "default_penalty_last_n")]
    pub penalty_last_n: usize,

    #[serde(default)]
    pub mirostat: u32,
    #[serde(default = "default_mirostat_tau")]
    pub mirostat_tau: f32,
    #[serde(default = "default_mirostat_eta")]
    pub mirostat_eta: f32,

    #[serde(default)]
    pub janus: u32,
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub scale: f32,
    #[serde(default)]
    pub hi: f32,
    #[serde(default)]
    pub lo: f32,

    /// `u32::MAX` asks the engine for a random seed.
    #[serde(default = "default_seed")]
    pub seed: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            typical_p: default_one(),
            repetition_penalty: default_repetition_penalty(),
            penalty_last_n: default_penalty_last_n(),
            mirostat: 0,
            mirostat_tau: default_mirostat_tau(),
            mirostat_eta: default_mirostat_eta(),
            janus: 0,
            depth: 0,
            scale: 0.0,
            hi: 0.0,
            lo: 0.0,
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PodConfig {
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub sampling: String,
    /// 0 means "all available cores".
    #[serde(default)]
    pub threads: usize,
    /// GPU split in percents, at most four entries.
    #[serde(default)]
    pub gpus: Vec<u32>,
    #[serde(default)]
    pub batch: usize,
    #[serde(default = "default_count")]
    pub count: usize,
}

fn default_id() -> String {
    "podserve".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_deadline() -> u64 {
    180
}

fn default_chat_timeout() -> u64 {
    180
}

fn default_tick_ms() -> u64 {
    20
}

fn default_engine() -> EngineKind {
    EngineKind::Candle
}

fn default_echo_delay_ms() -> u64 {
    50
}

fn default_echo_reply() -> String {
    "Hello! How can I help you today?".to_string()
}

fn default_context() -> usize {
    2048
}

fn default_predict() -> usize {
    512
}

fn default_temperature() -> f32 {
    0.8
}

fn default_top_k() -> usize {
    40
}

fn default_top_p() -> f32 {
    0.95
}

fn default_one() -> f32 {
    1.0
}

fn default_repetition_penalty() -> f32 {
    1.1
}

fn default_penalty_last_n() -> usize {
    64
}

fn default_mirostat_tau() -> f32 {
    5.0
}

fn default_mirostat_eta() -> f32 {
    0.1
}

fn default_seed() -> u32 {
    u32::MAX
}

fn default_count() -> usize {
    1
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn deadline(&self) -> Option<Duration> {
        (self.deadline > 0).then(|| Duration::from_secs(self.deadline))
    }

    pub fn chat_timeout(&self) -> Duration {
        Duration::from_secs(self.chat_timeout)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

/// Resolves a leading `~/` against the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}
