use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::{expand_home, Config, SamplingConfig};
use crate::engine::{ContextHandle, ContextParams, EngineError, InferenceEngine};
use crate::prompting::PromptTemplate;

const MAX_GPUS: usize = 4;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("model '{model}' file not found at {path:?}")]
    ModelFileMissing { model: String, path: PathBuf },
    #[error("pod '{pod}' references unknown model '{model}'")]
    UnknownModel { pod: String, model: String },
    #[error("pod '{pod}' references unknown prompt '{prompt}'")]
    UnknownPrompt { pod: String, prompt: String },
    #[error("pod '{pod}' references unknown sampling '{sampling}'")]
    UnknownSampling { pod: String, sampling: String },
    #[error("pod '{pod}' lists {count} gpus, at most 4 are supported")]
    TooManyGpus { pod: String, count: usize },
    #[error("no pods configured")]
    NoPods,
    #[error("engine init failed: {0}")]
    EngineInit(#[source] EngineError),
    #[error("engine context for pod '{pod}' failed: {source}")]
    Context {
        pod: String,
        #[source]
        source: EngineError,
    },
}

#[derive(Debug, Clone)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub tokenizer: Option<PathBuf>,
    pub context: usize,
    pub predict: usize,
}

#[derive(Debug, Clone)]
pub struct Pod {
    pub id: String,
    pub index: usize,
    pub threads: usize,
    pub gpus: [u32; MAX_GPUS],
    pub is_gpu: bool,
    pub model: String,
    pub prompt: String,
    pub sampling: String,
    pub batch: usize,
    pub context: ContextHandle,
}

/// Pods, models, prompts and samplings. Immutable once initialized.
#[derive(Debug)]
pub struct Registry {
    pods: Vec<Pod>,
    models: BTreeMap<String, Model>,
    prompts: BTreeMap<String, PromptTemplate>,
    samplings: BTreeMap<String, SamplingConfig>,
    max_threads: usize,
}

impl Registry {
    pub fn initialize(cfg: &Config, engine: &dyn InferenceEngine) -> Result<Self, RegistryError> {
        let mut models = BTreeMap::new();
        for (id, m) in &cfg.models {
            let path = expand_home(&m.path);
            if !path.exists() {
                return Err(RegistryError::ModelFileMissing {
                    model: id.clone(),
                    path,
                });
            }
            models.insert(
                id.clone(),
                Model {
                    id: id.clone(),
                    name: if m.name.is_empty() { id.clone() } else { m.name.clone() },
                    path,
                    tokenizer: m.tokenizer.as_deref().map(expand_home),
                    context: m.context,
                    predict: m.predict,
                },
            );
        }

        let mut prompts: BTreeMap<String, PromptTemplate> = cfg
            .prompts
            .iter()
            .map(|(id, p)| (id.clone(), PromptTemplate::from_config(id, p)))
            .collect();
        prompts.entry(String::new()).or_default();

        let mut samplings = cfg.samplings.clone();
        samplings.entry(String::new()).or_default();

        if cfg.pods.values().all(|p| p.count == 0) {
            return Err(RegistryError::NoPods);
        }

        let swap = cfg.swap.as_deref().map(expand_home);
        engine
            .init(swap.as_deref(), &cfg.debug)
            .map_err(RegistryError::EngineInit)?;

        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let mut pods = Vec::new();
        for (pod_id, pc) in &cfg.pods {
            let model = models
                .get(&pc.model)
                .ok_or_else(|| RegistryError::UnknownModel {
                    pod: pod_id.clone(),
                    model: pc.model.clone(),
                })?;
            let template = prompts
                .get(&pc.prompt)
                .ok_or_else(|| RegistryError::UnknownPrompt {
                    pod: pod_id.clone(),
                    prompt: pc.prompt.clone(),
                })?;
            let sampling = samplings
                .get(&pc.sampling)
                .ok_or_else(|| RegistryError::UnknownSampling {
                    pod: pod_id.clone(),
                    sampling: pc.sampling.clone(),
                })?;
            if pc.gpus.len() > MAX_GPUS {
                return Err(RegistryError::TooManyGpus {
                    pod: pod_id.clone(),
                    count: pc.gpus.len(),
                });
            }
            let mut gpus = [0u32; MAX_GPUS];
            gpus[..pc.gpus.len()].copy_from_slice(&pc.gpus);
            let threads = if pc.threads == 0 { available } else { pc.threads };

            for instance in 0..pc.count {
                let id = if instance == 0 {
                    pod_id.clone()
                } else {
                    format!("{}#{}", pod_id, instance)
                };
                let index = pods.len();
                let params = ContextParams {
                    pod_index: index,
                    model_path: model.path.clone(),
                    tokenizer_path: model.tokenizer.clone(),
                    threads,
                    batch_size: pc.batch,
                    gpu_split: gpus,
                    context_size: model.context,
                    predict: model.predict,
                    sampling: sampling.clone(),
                    seed: sampling.seed,
                    debug: cfg.debug.clone(),
                };
                let context = engine
                    .init_context(&params)
                    .map_err(|source| RegistryError::Context {
                        pod: id.clone(),
                        source,
                    })?;

                tracing::info!(
                    pod = %id,
                    index,
                    model = %model.id,
                    prompt = %template.id,
                    threads,
                    gpus = ?gpus,
                    "pod ready"
                );
                pods.push(Pod {
                    id,
                    index,
                    threads,
                    gpus,
                    is_gpu: gpus.iter().any(|&share| share > 0),
                    model: model.id.clone(),
                    prompt: pc.prompt.clone(),
                    sampling: pc.sampling.clone(),
                    batch: pc.batch,
                    context,
                });
            }
        }

        let max_threads = pods.iter().map(|p| p.threads).sum();
        Ok(Self {
            pods,
            models,
            prompts,
            samplings,
            max_threads,
        })
    }

    pub fn pods(&self) -> &[Pod] {
        &self.pods
    }

    pub fn pod(&self, index: usize) -> Option<&Pod> {
        self.pods.get(index)
    }

    pub fn model(&self, id: &str) -> Option<&Model> {
        self.models.get(id)
    }

    pub fn prompt(&self, id: &str) -> Option<&PromptTemplate> {
        self.prompts.get(id)
    }

    pub fn sampling(&self, id: &str) -> Option<&SamplingConfig> {
        self.samplings.get(id)
    }

    /// Global thread budget: the sum of all pods' threads.
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    pub fn gpu_pod_count(&self) -> usize {
        self.pods.iter().filter(|p| p.is_gpu).count()
    }

    /// Template used for chat completions: the first pod's.
    pub fn default_prompt(&self) -> &PromptTemplate {
        self.pods
            .first()
            .and_then(|p| self.prompts.get(&p.prompt))
            .or_else(|| self.prompts.get(""))
            .unwrap_or(&EMPTY_TEMPLATE)
    }

    pub fn format_list(&self) -> String {
        let mut lines = Vec::with_capacity(self.pods.len() + 1);
        lines.push(format!(
            "Pods ({}) threads={}",
            self.pods.len(),
            self.max_threads
        ));
        for pod in &self.pods {
            lines.push(format!(
                "- #{} id={} model={} prompt={} sampling={} threads={} gpu={}",
                pod.index,
                pod.id,
                pod.model,
                if pod.prompt.is_empty() { "<empty>" } else { &pod.prompt },
                if pod.sampling.is_empty() { "<default>" } else { &pod.sampling },
                pod.threads,
                pod.is_gpu
            ));
        }
        lines.join("\n")
    }
}

static EMPTY_TEMPLATE: PromptTemplate = PromptTemplate {
    id: String::new(),
    locale: String::new(),
    system: String::new(),
    templates: crate::config::TemplatesConfig {
        system: String::new(),
        user: String::new(),
        assistant: String::new(),
    },
};

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::EchoEngine;
    use std::fs;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub(crate) fn mk_temp_dir(prefix: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time ok")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("{}_{}_{}", prefix, std::process::id(), ts));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    /// Writes a stub model file and returns a config text using it.
    pub(crate) fn config_with_pods(dir: &std::path::Path, pods: &str) -> String {
        let model = dir.join("tiny.gguf");
        fs::write(&model, b"stub").expect("write model stub");
        format!(
            r#"
[models.tiny]
path = "{}"
context = 256
predict = 32

[prompts.chatml]
system = "Be nice."
[prompts.chatml.templates]
system = "<s>{{SYSTEM}}</s>"
user = "<u>{{USER}}</u>"
assistant = "<a>{{ASSISTANT}}</a>"

[samplings.greedy]
temperature = 0.0

{}
"#,
            model.display(),
            pods
        )
    }

    fn echo() -> EchoEngine {
        EchoEngine::new(Duration::ZERO, "ok")
    }

    #[test]
    fn pods_are_sorted_and_instances_expanded() {
        let dir = mk_temp_dir("podserve_registry_sort");
        let text = config_with_pods(
            &dir,
            r#"
[pods.zeta]
model = "tiny"
prompt = "chatml"
threads = 2

[pods.alpha]
model = "tiny"
threads = 3
count = 3
gpus = [100]
"#,
        );
        let cfg = Config::parse(&text).expect("parse");
        let reg = Registry::initialize(&cfg, &echo()).expect("init");

        let ids: Vec<&str> = reg.pods().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "alpha#1", "alpha#2", "zeta"]);
        assert_eq!(
            reg.pods().iter().map(|p| p.index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(reg.max_threads(), 11);
        assert_eq!(reg.gpu_pod_count(), 3);
        assert!(!reg.pod(3).expect("zeta").is_gpu);

        // first pod has the empty prompt reference
        assert_eq!(reg.default_prompt().templates.user, "");
        assert!(reg.format_list().contains("alpha#2"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn zero_threads_means_available_parallelism() {
        let dir = mk_temp_dir("podserve_registry_threads");
        let text = config_with_pods(&dir, "[pods.p]\nmodel = \"tiny\"\nprompt = \"chatml\"\n");
        let cfg = Config::parse(&text).expect("parse");
        let reg = Registry::initialize(&cfg, &echo()).expect("init");
        let expected = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        assert_eq!(reg.pods()[0].threads, expected);
        assert_eq!(reg.default_prompt().id, "chatml");
        assert!(reg.sampling("greedy").is_some());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn broken_references_are_fatal() {
        let dir = mk_temp_dir("podserve_registry_refs");
        let cases = [
            ("[pods.p]\nmodel = \"ghost\"\n", "unknown model"),
            ("[pods.p]\nmodel = \"tiny\"\nprompt = \"ghost\"\n", "unknown prompt"),
            ("[pods.p]\nmodel = \"tiny\"\nsampling = \"ghost\"\n", "unknown sampling"),
            ("[pods.p]\nmodel = \"tiny\"\ngpus = [10, 20, 30, 30, 10]\n", "at most 4"),
        ];
        for (pods, needle) in cases {
            let cfg = Config::parse(&config_with_pods(&dir, pods)).expect("parse");
            let err = Registry::initialize(&cfg, &echo()).expect_err(needle);
            assert!(err.to_string().contains(needle), "{} vs {}", err, needle);
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_model_file_and_no_pods_are_fatal() {
        let cfg = Config::parse(
            "[models.m]\npath = \"/definitely/missing.gguf\"\n[pods.p]\nmodel = \"m\"\n",
        )
        .expect("parse");
        assert!(matches!(
            Registry::initialize(&cfg, &echo()),
            Err(RegistryError::ModelFileMissing { .. })
        ));

        let dir = mk_temp_dir("podserve_registry_empty");
        let cfg = Config::parse(&config_with_pods(&dir, "")).expect("parse");
        assert!(matches!(
            Registry::initialize(&cfg, &echo()),
            Err(RegistryError::NoPods)
        ));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn engine_context_failure_aborts_startup() {
        let dir = mk_temp_dir("podserve_registry_ctx");
        let text = config_with_pods(&dir, "[pods.p]\nmodel = \"tiny\"\ncount = 2\n");
        let cfg = Config::parse(&text).expect("parse");
        let engine = echo().with_context_failure(1);
        let err = Registry::initialize(&cfg, &engine).expect_err("context failure");
        assert!(matches!(err, RegistryError::Context { ref pod, .. } if pod == "p#1"));
        let _ = fs::remove_dir_all(dir);
    }
}
