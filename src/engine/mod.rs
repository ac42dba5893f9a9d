//! Inference engine seam.
//!
//! The scheduler only talks to [`InferenceEngine`]. Two implementations live here: a deterministic
//! echo engine for tests and dry runs, and a candle engine running quantized GGUF models on CPU.

mod candle;
mod echo;
mod model;
mod tokenizer;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;

use crate::config::SamplingConfig;

pub use self::candle::CandleEngine;
pub use self::echo::EchoEngine;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cannot open model {path:?}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("no tokenizer.json found for model {0:?}")]
    TokenizerNotFound(PathBuf),
    #[error("unsupported model architecture '{0}'")]
    UnsupportedArchitecture(String),
    #[error("prompt has {prompt} tokens but the context holds {context}")]
    ContextOverflow { prompt: usize, context: usize },
    #[error("unknown context handle {0}")]
    UnknownContext(u64),
    #[error("cannot create context for pod {pod}: {reason}")]
    Context { pod: usize, reason: String },
}

/// Opaque per-pod engine context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

#[derive(Debug, Clone)]
pub struct ContextParams {
    pub pod_index: usize,
    pub model_path: PathBuf,
    pub tokenizer_path: Option<PathBuf>,
    pub threads: usize,
    pub batch_size: usize,
    pub gpu_split: [u32; 4],
    pub context_size: usize,
    pub predict: usize,
    pub sampling: SamplingConfig,
    /// `u32::MAX` means pick a random seed.
    pub seed: u32,
    pub debug: String,
}

pub trait InferenceEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// One-time setup before any context exists.
    fn init(&self, swap_dir: Option<&Path>, debug: &str) -> Result<(), EngineError>;

    fn init_context(&self, params: &ContextParams) -> Result<ContextHandle, EngineError>;

    /// Blocks until generation ends. Returns the number of generated tokens.
    fn run_inference(
        &self,
        pod_index: usize,
        handle: ContextHandle,
        job_id: &str,
        session_id: Option<&str>,
        prompt: &str,
    ) -> Result<usize, EngineError>;

    /// Prompt echo plus everything generated so far. Empty for unknown jobs.
    fn status(&self, job_id: &str) -> String;

    /// Best effort. A stop raised before the run starts is honoured once it does.
    fn stop_inference(&self, pod_index: usize);

    /// Drops a pending stop for the pod. Called when a new job is bound to it.
    fn reset_stop(&self, pod_index: usize);

    /// ms per generated token.
    fn timing(&self, job_id: &str) -> f32;

    /// ms per prompt token.
    fn prompt_eval(&self, job_id: &str) -> f32;

    fn prompt_token_count(&self, job_id: &str) -> usize;

    fn forget(&self, job_id: &str);
}

#[derive(Debug, Clone, Default)]
pub(crate) struct JobTrace {
    pub text: String,
    pub prompt_tokens: usize,
    pub output_tokens: usize,
    pub prompt_eval_ms: f32,
    pub token_eval_ms: f32,
}

/// Per-job traces readable while a job runs.
#[derive(Debug, Default)]
pub(crate) struct TraceBook {
    traces: Mutex<HashMap<String, JobTrace>>,
}

impl TraceBook {
    pub fn update(&self, job_id: &str, apply: impl FnOnce(&mut JobTrace)) {
        let mut traces = self.traces.lock().unwrap_or_else(PoisonError::into_inner);
        apply(traces.entry(job_id.to_string()).or_default());
    }

    pub fn read<T>(&self, job_id: &str, pick: impl FnOnce(&JobTrace) -> T) -> Option<T> {
        let traces = self.traces.lock().unwrap_or_else(PoisonError::into_inner);
        traces.get(job_id).map(pick)
    }

    pub fn remove(&self, job_id: &str) {
        let mut traces = self.traces.lock().unwrap_or_else(PoisonError::into_inner);
        traces.remove(job_id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.traces.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Cancellation flag a sleeping or generating pod can observe.
#[derive(Debug, Default)]
pub(crate) struct StopSignal {
    raised: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub fn raise(&self) {
        *self.raised.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }

    pub fn clear(&self) {
        *self.raised.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    pub fn is_raised(&self) -> bool {
        *self.raised.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps up to `timeout`; returns true when woken by a stop.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.raised.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |raised| !*raised)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Stop signals keyed by pod index, created on first use.
#[derive(Debug, Default)]
pub(crate) struct PodSignals {
    signals: Mutex<HashMap<usize, Arc<StopSignal>>>,
}

impl PodSignals {
    pub fn get(&self, pod_index: usize) -> Arc<StopSignal> {
        let mut signals = self.signals.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(signals.entry(pod_index).or_default())
    }
}

pub(crate) fn millis_per(elapsed: Duration, count: usize) -> f32 {
    if count == 0 {
        return 0.0;
    }
    elapsed.as_secs_f32() * 1000.0 / count as f32
}
