use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::{
    millis_per, ContextHandle, ContextParams, EngineError, InferenceEngine, PodSignals, TraceBook,
};

/// Deterministic engine: raw output is the prompt followed by a fixed reply.
#[derive(Debug)]
pub struct EchoEngine {
    delay: Duration,
    reply: String,
    leading_space: bool,
    failing_pods: HashSet<usize>,
    next_handle: AtomicU64,
    contexts: Mutex<HashSet<u64>>,
    signals: PodSignals,
    traces: TraceBook,
}

impl EchoEngine {
    pub fn new(delay: Duration, reply: impl Into<String>) -> Self {
        Self {
            delay,
            reply: reply.into(),
            leading_space: false,
            failing_pods: HashSet::new(),
            next_handle: AtomicU64::new(1),
            contexts: Mutex::new(HashSet::new()),
            signals: PodSignals::default(),
            traces: TraceBook::default(),
        }
    }

    /// Mimics tokenizers that decode with a leading space.
    pub fn with_leading_space(mut self) -> Self {
        self.leading_space = true;
        self
    }

    /// Makes `init_context` fail for the given pod.
    pub fn with_context_failure(mut self, pod_index: usize) -> Self {
        self.failing_pods.insert(pod_index);
        self
    }
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

impl InferenceEngine for EchoEngine {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn init(&self, swap_dir: Option<&Path>, debug: &str) -> Result<(), EngineError> {
        let flags = debug;
        tracing::debug!(?swap_dir, %flags, "echo engine ready");
        Ok(())
    }

    fn init_context(&self, params: &ContextParams) -> Result<ContextHandle, EngineError> {
        if self.failing_pods.contains(&params.pod_index) {
            return Err(EngineError::Context {
                pod: params.pod_index,
                reason: "echo context failure requested".to_string(),
            });
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle);
        Ok(ContextHandle(handle))
    }

    fn run_inference(
        &self,
        pod_index: usize,
        handle: ContextHandle,
        job_id: &str,
        session_id: Option<&str>,
        prompt: &str,
    ) -> Result<usize, EngineError> {
        let known = self
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&handle.0);
        if !known {
            return Err(EngineError::UnknownContext(handle.0));
        }

        let signal = self.signals.get(pod_index);
        let started = Instant::now();
        let prompt_tokens = word_count(prompt);
        self.traces.update(job_id, |t| {
            t.text = prompt.to_string();
            t.prompt_tokens = prompt_tokens;
        });
        tracing::trace!(job = job_id, session = ?session_id, pod = pod_index, "echo run");

        if signal.wait(self.delay) {
            return Ok(0);
        }

        let output_tokens = word_count(&self.reply);
        let space = if self.leading_space { " " } else { "" };
        let elapsed = started.elapsed();
        self.traces.update(job_id, |t| {
            t.text = format!("{}{}{}", space, prompt, self.reply);
            t.output_tokens = output_tokens;
            t.prompt_eval_ms = millis_per(elapsed, prompt_tokens);
            t.token_eval_ms = millis_per(elapsed, output_tokens);
        });
        Ok(output_tokens)
    }

    fn status(&self, job_id: &str) -> String {
        self.traces
            .read(job_id, |t| t.text.clone())
            .unwrap_or_default()
    }

    fn stop_inference(&self, pod_index: usize) {
        self.signals.get(pod_index).raise();
    }

    fn reset_stop(&self, pod_index: usize) {
        self.signals.get(pod_index).clear();
    }

    fn timing(&self, job_id: &str) -> f32 {
        self.traces
            .read(job_id, |t| t.token_eval_ms)
            .unwrap_or_default()
    }

    fn prompt_eval(&self, job_id: &str) -> f32 {
        self.traces
            .read(job_id, |t| t.prompt_eval_ms)
            .unwrap_or_default()
    }

    fn prompt_token_count(&self, job_id: &str) -> usize {
        self.traces
            .read(job_id, |t| t.prompt_tokens)
            .unwrap_or_default()
    }

    fn forget(&self, job_id: &str) {
        self.traces.remove(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SamplingConfig;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::thread;

    fn params(pod_index: usize) -> ContextParams {
        ContextParams {
            pod_index,
            model_path: PathBuf::from("tiny.gguf"),
            tokenizer_path: None,
            threads: 1,
            batch_size: 0,
            gpu_split: [0; 4],
            context_size: 2048,
            predict: 64,
            sampling: SamplingConfig::default(),
            seed: u32::MAX,
            debug: String::new(),
        }
    }

    #[test]
    fn echoes_prompt_then_reply() {
        let engine = EchoEngine::new(Duration::from_millis(1), " world");
        let handle = engine.init_context(&params(0)).expect("context");
        let n = engine
            .run_inference(0, handle, "j1", None, "hello")
            .expect("run");
        assert_eq!(n, 1);
        assert_eq!(engine.status("j1"), "hello world");
        assert_eq!(engine.prompt_token_count("j1"), 1);

        engine.forget("j1");
        assert_eq!(engine.status("j1"), "");
    }

    #[test]
    fn leading_space_variant_prefixes_output() {
        let engine = EchoEngine::new(Duration::ZERO, "!").with_leading_space();
        let handle = engine.init_context(&params(0)).expect("context");
        engine
            .run_inference(0, handle, "j", None, "hi")
            .expect("run");
        assert_eq!(engine.status("j"), " hi!");
    }

    #[test]
    fn stop_cuts_the_delay_short() {
        let engine = Arc::new(EchoEngine::new(Duration::from_secs(10), "late"));
        let handle = engine.init_context(&params(2)).expect("context");
        let runner = Arc::clone(&engine);
        let started = Instant::now();
        let worker =
            thread::spawn(move || runner.run_inference(2, handle, "j", None, "prompt"));
        while engine.status("j").is_empty() {
            thread::sleep(Duration::from_millis(5));
        }
        engine.stop_inference(2);

        let produced = worker.join().expect("join").expect("run");
        assert_eq!(produced, 0);
        assert_eq!(engine.status("j"), "prompt");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn stop_raised_before_the_run_is_honoured_until_reset() {
        let engine = EchoEngine::new(Duration::ZERO, " again");
        engine.init(None, "full,cuda").expect("init");
        let handle = engine.init_context(&params(3)).expect("context");

        engine.stop_inference(3);
        let produced = engine
            .run_inference(3, handle, "early", None, "prompt")
            .expect("run");
        assert_eq!(produced, 0);
        assert_eq!(engine.status("early"), "prompt");

        engine.reset_stop(3);
        let produced = engine
            .run_inference(3, handle, "fresh", None, "prompt")
            .expect("run");
        assert_eq!(produced, 1);
        assert_eq!(engine.status("fresh"), "prompt again");
    }

    #[test]
    fn context_failure_and_unknown_handles_are_errors() {
        let engine = EchoEngine::new(Duration::ZERO, "x").with_context_failure(1);
        assert!(engine.init_context(&params(0)).is_ok());
        assert!(matches!(
            engine.init_context(&params(1)),
            Err(EngineError::Context { pod: 1, .. })
        ));
        assert!(matches!(
            engine.run_inference(0, ContextHandle(999), "j", None, "p"),
            Err(EngineError::UnknownContext(999))
        ));
    }
}
