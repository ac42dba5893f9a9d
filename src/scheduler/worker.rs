use std::sync::atomic::Ordering;

use chrono::Local;
use podserve_protocol::JobStatus;

use super::Scheduler;
use crate::job::{now_millis, JobSource};
use crate::prompting::{strip_engine_space, strip_marker, visible_output};

/// What the worker needs from the locked state before calling the engine.
struct Prepared {
    full_prompt: String,
    session_id: Option<String>,
    source: JobSource,
}

struct Outcome {
    raw: String,
    output_tokens: usize,
    prompt_tokens: usize,
    prompt_eval: f32,
    token_eval: f32,
    failed: bool,
}

impl Scheduler {
    /// Executes one admitted job on `pod_index`, then frees the pod.
    pub(super) fn run_job(&self, job_id: &str, pod_index: usize) {
        let Some(pod) = self.registry.pod(pod_index) else {
            tracing::error!(job = job_id, pod = pod_index, "worker started on unknown pod");
            return;
        };

        let Some(prepared) = self.prepare(job_id, pod_index) else {
            tracing::info!(job = job_id, pod = %pod.id, "job stopped before start, engine skipped");
            self.release(job_id, pod_index, None);
            return;
        };

        tracing::debug!(
            job = job_id,
            pod = %pod.id,
            prompt_bytes = prepared.full_prompt.len(),
            "inference started"
        );
        let result = self.engine.run_inference(
            pod_index,
            pod.context,
            job_id,
            prepared.session_id.as_deref(),
            &prepared.full_prompt,
        );

        let outcome = match result {
            Ok(output_tokens) => Outcome {
                raw: strip_engine_space(self.engine.status(job_id), &prepared.full_prompt),
                output_tokens,
                prompt_tokens: self.engine.prompt_token_count(job_id),
                prompt_eval: self.engine.prompt_eval(job_id),
                token_eval: self.engine.timing(job_id),
                failed: false,
            },
            Err(err) => {
                tracing::error!(job = job_id, pod = %pod.id, error = %err, "inference failed");
                Outcome {
                    raw: String::new(),
                    output_tokens: 0,
                    prompt_tokens: 0,
                    prompt_eval: 0.0,
                    token_eval: 0.0,
                    failed: true,
                }
            }
        };
        self.engine.forget(job_id);

        self.release(job_id, pod_index, Some((prepared, outcome)));
    }

    /// Builds the full prompt under the lock. `None` when the job is no longer processing.
    fn prepare(&self, job_id: &str, pod_index: usize) -> Option<Prepared> {
        let pod = self.registry.pod(pod_index)?;
        let template = self.registry.prompt(&pod.prompt)?;
        let model = self.registry.model(&pod.model)?;

        let mut state = self.lock();
        let job = state.jobs.get(job_id)?;
        if job.status != JobStatus::Processing {
            return None;
        }
        let source = job.source;
        let session_id = job.session_id.clone();
        let prompt = job.prompt.clone();

        let full_prompt = match (source, session_id.as_deref()) {
            (JobSource::Chat, Some(sid)) => state.sessions.history(sid),
            (JobSource::Chat, None) => String::new(),
            (JobSource::Api, Some(sid)) => {
                state.sessions.enforce_budget(sid, model.predict, model.context);
                let history = state.sessions.history(sid);
                let date = template.date_text(Local::now());
                template.assemble(&prompt, Some(&history), &date)
            }
            (JobSource::Api, None) => {
                let date = template.date_text(Local::now());
                template.assemble(&prompt, None, &date)
            }
        };

        if let Some(job) = state.jobs.get_mut(job_id) {
            job.full_prompt = full_prompt.clone();
        }
        Some(Prepared {
            full_prompt,
            session_id,
            source,
        })
    }

    /// Writes results back, frees the pod and wakes completion waiters.
    fn release(&self, job_id: &str, pod_index: usize, done: Option<(Prepared, Outcome)>) {
        let suffix = self
            .registry
            .pod(pod_index)
            .and_then(|pod| self.registry.prompt(&pod.prompt))
            .map(|t| t.assistant_suffix().to_string())
            .unwrap_or_default();
        let threads = self
            .registry
            .pod(pod_index)
            .map(|pod| pod.threads)
            .unwrap_or(0);

        let mut state = self.lock();

        if let Some((prepared, outcome)) = &done {
            match (prepared.source, prepared.session_id.as_deref()) {
                (JobSource::Chat, Some(sid)) => {
                    state.sessions.remove(sid);
                }
                (JobSource::Api, Some(sid)) if !outcome.failed => {
                    state
                        .sessions
                        .record(sid, outcome.raw.clone(), outcome.output_tokens);
                }
                _ => {}
            }
        } else {
            state.release_chat_session(job_id);
        }

        if let Some(job) = state.jobs.get_mut(job_id) {
            if let Some((prepared, outcome)) = &done {
                let visible = visible_output(&outcome.raw, &prepared.full_prompt);
                job.output = strip_marker(visible, &suffix);
                job.prompt_tokens = outcome.prompt_tokens;
                job.output_tokens = outcome.output_tokens;
                job.prompt_eval = outcome.prompt_eval;
                job.token_eval = outcome.token_eval;
            }
            job.finished_at = now_millis();
            job.pod = None;
            if job.status == JobStatus::Stopped {
                tracing::info!(job = job_id, output_tokens = job.output_tokens, "stopped job released its pod");
            } else {
                job.status = JobStatus::Finished;
                self.stats.finished();
                tracing::info!(
                    job = job_id,
                    pod = pod_index,
                    prompt_tokens = job.prompt_tokens,
                    output_tokens = job.output_tokens,
                    prompt_eval_ms = job.prompt_eval,
                    token_eval_ms = job.token_eval,
                    elapsed_ms = job.finished_at.saturating_sub(job.started_at),
                    "job finished"
                );
            }
        }

        if state.bindings.get(pod_index).and_then(|b| b.as_deref()) == Some(job_id) {
            state.bindings[pod_index] = None;
        }
        self.running_threads.fetch_sub(threads, Ordering::AcqRel);
        self.running_pods.fetch_sub(1, Ordering::AcqRel);
        drop(state);
        self.completed.notify_all();
    }
}
