use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::utils::apply_repeat_penalty;
use tokenizers::Tokenizer;

use super::model::RuntimeModel;
use super::tokenizer::{resolve_tokenizer_path, stop_token_ids};
use super::{
    millis_per, ContextHandle, ContextParams, EngineError, InferenceEngine, PodSignals, TraceBook,
};
use crate::config::SamplingConfig;

const RANDOM_SEED: u32 = u32::MAX;

struct PodRuntime {
    model: RuntimeModel,
    tokenizer: Tokenizer,
    stop_ids: Vec<u32>,
    context_size: usize,
    predict: usize,
    sampling: SamplingConfig,
    seed: Option<u64>,
}

/// Quantized GGUF models on the CPU, one loaded model per pod.
pub struct CandleEngine {
    device: Device,
    next_handle: AtomicU64,
    runtimes: Mutex<HashMap<u64, Arc<Mutex<PodRuntime>>>>,
    signals: PodSignals,
    traces: TraceBook,
}

impl Default for CandleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CandleEngine {
    pub fn new() -> Self {
        Self {
            device: Device::Cpu,
            next_handle: AtomicU64::new(1),
            runtimes: Mutex::new(HashMap::new()),
            signals: PodSignals::default(),
            traces: TraceBook::default(),
        }
    }

    fn runtime(&self, handle: ContextHandle) -> Result<Arc<Mutex<PodRuntime>>, EngineError> {
        self.runtimes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle.0)
            .cloned()
            .ok_or(EngineError::UnknownContext(handle.0))
    }
}

pub(super) fn sampling_strategy(cfg: &SamplingConfig) -> Sampling {
    let temperature = f64::from(cfg.temperature);
    if temperature <= 0.0 {
        return Sampling::ArgMax;
    }
    let top_p = f64::from(cfg.top_p);
    let use_top_p = top_p > 0.0 && top_p < 1.0;
    match (cfg.top_k, use_top_p) {
        (0, false) => Sampling::All { temperature },
        (0, true) => Sampling::TopP {
            p: top_p,
            temperature,
        },
        (k, false) => Sampling::TopK { k, temperature },
        (k, true) => Sampling::TopKThenTopP {
            k,
            p: top_p,
            temperature,
        },
    }
}

fn run_seed(configured: Option<u64>) -> u64 {
    if let Some(seed) = configured {
        return seed;
    }
    let mut buf = [0u8; 8];
    match getrandom::getrandom(&mut buf) {
        Ok(()) => u64::from_le_bytes(buf),
        Err(err) => {
            tracing::warn!(error = %err, "no OS randomness, using clock seed");
            crate::job::now_millis()
        }
    }
}

fn tokenizer_err(err: impl std::fmt::Display) -> EngineError {
    EngineError::Tokenizer(err.to_string())
}

impl InferenceEngine for CandleEngine {
    fn name(&self) -> &'static str {
        "candle"
    }

    fn init(&self, swap_dir: Option<&Path>, debug: &str) -> Result<(), EngineError> {
        let flags = debug;
        tracing::info!(device = ?self.device, ?swap_dir, %flags, "candle engine init");
        Ok(())
    }

    fn init_context(&self, params: &ContextParams) -> Result<ContextHandle, EngineError> {
        if params.gpu_split.iter().any(|&share| share > 0) {
            tracing::warn!(pod = params.pod_index, split = ?params.gpu_split, "gpu split ignored on cpu device");
        }

        let model = RuntimeModel::load_from_gguf(&params.model_path, &self.device)?;
        let tokenizer_path =
            resolve_tokenizer_path(&params.model_path, params.tokenizer_path.as_deref())
                .ok_or_else(|| EngineError::TokenizerNotFound(params.model_path.clone()))?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(tokenizer_err)?;
        let stop_ids = stop_token_ids(&tokenizer);
        tracing::info!(
            pod = params.pod_index,
            tokenizer = %tokenizer_path.display(),
            ?stop_ids,
            context = params.context_size,
            threads = params.threads,
            "pod context ready"
        );

        let runtime = PodRuntime {
            model,
            tokenizer,
            stop_ids,
            context_size: params.context_size,
            predict: params.predict,
            sampling: params.sampling.clone(),
            seed: (params.seed != RANDOM_SEED).then_some(u64::from(params.seed)),
        };

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.runtimes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, Arc::new(Mutex::new(runtime)));
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
        let runtime = self.runtime(handle)?;
        let mut guard = runtime.lock().unwrap_or_else(PoisonError::into_inner);
        let rt = &mut *guard;

        let signal = self.signals.get(pod_index);

        let started = Instant::now();
        let prompt_ids = rt
            .tokenizer
            .encode(prompt, true)
            .map_err(tokenizer_err)?
            .get_ids()
            .to_vec();
        self.traces.update(job_id, |t| {
            t.text = prompt.to_string();
            t.prompt_tokens = prompt_ids.len();
        });
        if prompt_ids.is_empty() {
            return Ok(0);
        }
        if prompt_ids.len() >= rt.context_size {
            return Err(EngineError::ContextOverflow {
                prompt: prompt_ids.len(),
                context: rt.context_size,
            });
        }

        let budget = rt.predict.min(rt.context_size - prompt_ids.len());
        let mut sampler = LogitsProcessor::from_sampling(run_seed(rt.seed), sampling_strategy(&rt.sampling));
        let penalty = rt.sampling.repetition_penalty;

        let input = Tensor::new(prompt_ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let mut logits = rt.model.forward(&input, 0)?;
        let prompt_elapsed = started.elapsed();
        tracing::debug!(job = job_id, session = ?session_id, pod = pod_index, prompt_tokens = prompt_ids.len(), budget, "prompt evaluated");

        let generation_started = Instant::now();
        let mut context = prompt_ids.clone();
        let mut generated: Vec<u32> = Vec::with_capacity(budget);

        while generated.len() < budget {
            if signal.is_raised() {
                tracing::info!(job = job_id, pod = pod_index, produced = generated.len(), "generation stopped");
                break;
            }

            let step = logits.squeeze(0)?.to_dtype(DType::F32)?;
            let step = if (penalty - 1.0).abs() > f32::EPSILON {
                let window = context.len().saturating_sub(rt.sampling.penalty_last_n);
                apply_repeat_penalty(&step, penalty, &context[window..])?
            } else {
                step
            };

            let next = sampler.sample(&step)?;
            if rt.stop_ids.contains(&next) {
                break;
            }
            generated.push(next);
            context.push(next);

            let text = rt.tokenizer.decode(&generated, true).map_err(tokenizer_err)?;
            self.traces.update(job_id, |t| {
                t.text = format!("{}{}", prompt, text);
                t.output_tokens = generated.len();
            });

            let input = Tensor::new(&[next], &self.device)?.unsqueeze(0)?;
            logits = rt.model.forward(&input, context.len() - 1)?;
        }

        let prompt_eval = millis_per(prompt_elapsed, prompt_ids.len());
        let token_eval = millis_per(generation_started.elapsed(), generated.len());
        self.traces.update(job_id, |t| {
            t.output_tokens = generated.len();
            t.prompt_eval_ms = prompt_eval;
            t.token_eval_ms = token_eval;
        });
        Ok(generated.len())
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
