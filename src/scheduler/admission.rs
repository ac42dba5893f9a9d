use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use podserve_protocol::JobStatus;

use super::{Scheduler, SchedulerState};
use crate::job::now_millis;

impl Scheduler {
    /// Spawns the admission loop. It exits once shutdown is requested and all work drained.
    pub fn start(self: &Arc<Self>) -> io::Result<JoinHandle<()>> {
        let scheduler = Arc::clone(self);
        thread::Builder::new()
            .name("podserve-admission".to_string())
            .spawn(move || {
                tracing::info!(
                    pods = scheduler.registry.pods().len(),
                    max_threads = scheduler.registry.max_threads(),
                    tick_ms = scheduler.options.tick.as_millis() as u64,
                    "admission loop started"
                );
                loop {
                    if scheduler.is_drained() {
                        break;
                    }
                    scheduler.admit_pending();
                    thread::sleep(scheduler.options.tick);
                }
                tracing::info!("admission loop finished");
            })
    }

    /// Shutdown requested, nothing queued, nothing running.
    pub fn is_drained(&self) -> bool {
        if !self.is_shutting_down() {
            return false;
        }
        let state = self.lock();
        state.queue.is_empty() && self.running_threads.load(Ordering::Acquire) == 0
    }

    /// One admission pass. Returns how many jobs were bound to pods.
    pub(crate) fn admit_pending(self: &Arc<Self>) -> usize {
        let admitted = {
            let mut state = self.lock();
            self.evict_expired(&mut state);
            self.bind_idle_pods(&mut state)
        };

        let mut spawned = 0;
        let mut failed = Vec::new();
        for (job_id, pod) in admitted {
            let scheduler = Arc::clone(self);
            let worker_job = job_id.clone();
            let spawn = thread::Builder::new()
                .name(format!("podserve-pod-{}", pod))
                .spawn(move || scheduler.run_job(&worker_job, pod));
            match spawn {
                Ok(_) => spawned += 1,
                Err(err) => {
                    tracing::error!(job = %job_id, pod, error = %err, "cannot spawn worker, job requeued");
                    failed.push((job_id, pod));
                }
            }
        }

        if !failed.is_empty() {
            let mut state = self.lock();
            for (job_id, pod) in failed.into_iter().rev() {
                self.roll_back(&mut state, &job_id, pod);
            }
        }
        spawned
    }

    fn evict_expired(&self, state: &mut SchedulerState) {
        let Some(deadline) = self.options.deadline else {
            return;
        };
        let limit = deadline.as_millis() as u64;
        let now = now_millis();

        let expired: Vec<String> = state
            .queue
            .iter()
            .filter(|id| {
                state
                    .jobs
                    .get(id.as_str())
                    .map(|job| job.age_millis(now) > limit)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if expired.is_empty() {
            return;
        }

        state.queue.retain(|id| !expired.contains(id));
        for id in expired {
            state.release_chat_session(&id);
            if state.jobs.remove(&id).is_some() {
                self.stats.expired();
                tracing::info!(job = %id, deadline_secs = deadline.as_secs(), "queued job expired and dropped");
            }
        }
        self.completed.notify_all();
    }

    /// FIFO scan binding queued jobs to the lowest idle pods under the thread budget.
    fn bind_idle_pods(&self, state: &mut SchedulerState) -> Vec<(String, usize)> {
        let max_threads = self.registry.max_threads();
        let mut admitted = Vec::new();

        while let Some(job_id) = state.queue.front().cloned() {
            if self.running_threads.load(Ordering::Acquire) >= max_threads {
                break;
            }
            let Some(pod_index) = state.first_idle_pod() else {
                break;
            };
            let Some(pod) = self.registry.pod(pod_index) else {
                break;
            };

            state.queue.pop_front();
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.status != JobStatus::Queued {
                continue;
            }

            job.status = JobStatus::Processing;
            job.pod = Some(pod_index);
            job.started_at = now_millis();
            job.model_id = pod.model.clone();
            job.prompt_id = pod.prompt.clone();
            job.sampling_id = pod.sampling.clone();
            state.bindings[pod_index] = Some(job_id.clone());
            self.engine.reset_stop(pod_index);

            self.running_threads.fetch_add(pod.threads, Ordering::AcqRel);
            self.running_pods.fetch_add(1, Ordering::AcqRel);
            self.stats.admitted();
            tracing::debug!(job = %job_id, pod = %pod.id, index = pod_index, "job admitted");
            admitted.push((job_id, pod_index));
        }
        admitted
    }

    /// Undoes an admission whose worker never started; the job goes back to the queue head.
    fn roll_back(&self, state: &mut SchedulerState, job_id: &str, pod_index: usize) {
        if let Some(pod) = self.registry.pod(pod_index) {
            self.running_threads.fetch_sub(pod.threads, Ordering::AcqRel);
        }
        self.running_pods.fetch_sub(1, Ordering::AcqRel);
        state.bindings[pod_index] = None;

        if let Some(job) = state.jobs.get_mut(job_id) {
            job.pod = None;
            job.started_at = 0;
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Queued;
                state.queue.push_front(job_id.to_string());
            }
        }
    }
}
