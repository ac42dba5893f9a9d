//! Job admission and lifecycle.
//!
//! One [`Scheduler`] owns the job table, the FIFO of pending ids, the session store and the
//! pod bindings behind a single mutex. An admission thread scans the queue every tick and binds
//! jobs to idle pods; each admitted job runs on its own worker thread until the engine returns.
//!
//! The running-thread and running-pod counters are atomics read without the lock, so the
//! capacity check at admission is best effort.

mod admission;
mod metrics;
mod worker;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Local;
use podserve_protocol::{ChatMessage, HealthResponse, JobStatus, NewJobRequest};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::InferenceEngine;
use crate::error::JobError;
use crate::job::{now_millis, Job, JobSource};
use crate::prompting::{strip_engine_space, visible_output};
use crate::registry::Registry;
use crate::session::SessionStore;

pub use self::metrics::{Counters, Snapshot};
use self::metrics::Stats;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    /// Max queue wait; `None` disables eviction.
    pub deadline: Option<Duration>,
    pub tick: Duration,
    pub chat_timeout: Duration,
}

impl SchedulerOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            deadline: cfg.deadline(),
            tick: cfg.tick(),
            chat_timeout: cfg.chat_timeout(),
        }
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            deadline: Some(Duration::from_secs(180)),
            tick: Duration::from_millis(20),
            chat_timeout: Duration::from_secs(180),
        }
    }
}

struct SchedulerState {
    jobs: HashMap<String, Job>,
    queue: VecDeque<String>,
    sessions: SessionStore,
    /// Pod index → id of the job it runs.
    bindings: Vec<Option<String>>,
}

impl SchedulerState {
    fn first_idle_pod(&self) -> Option<usize> {
        self.bindings.iter().position(Option::is_none)
    }

    /// Drops the ephemeral session owned by a chat job.
    fn release_chat_session(&mut self, job_id: &str) {
        let Some(job) = self.jobs.get(job_id) else {
            return;
        };
        if job.source != JobSource::Chat {
            return;
        }
        if let Some(sid) = job.session_id.clone() {
            self.sessions.remove(&sid);
        }
    }
}

pub struct Scheduler {
    registry: Arc<Registry>,
    engine: Arc<dyn InferenceEngine>,
    state: Mutex<SchedulerState>,
    completed: Condvar,
    running_threads: AtomicUsize,
    running_pods: AtomicUsize,
    shutdown: AtomicBool,
    stats: Stats,
    options: SchedulerOptions,
}

fn parse_job_id(id: &str) -> Result<(), JobError> {
    Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| JobError::InvalidId)
}

impl Scheduler {
    pub fn new(
        registry: Arc<Registry>,
        engine: Arc<dyn InferenceEngine>,
        sessions: SessionStore,
        options: SchedulerOptions,
    ) -> Arc<Self> {
        let pods = registry.pods().len();
        Arc::new(Self {
            registry,
            engine,
            state: Mutex::new(SchedulerState {
                jobs: HashMap::new(),
                queue: VecDeque::new(),
                sessions,
                bindings: vec![None; pods],
            }),
            completed: Condvar::new(),
            running_threads: AtomicUsize::new(0),
            running_pods: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            stats: Stats::default(),
            options,
        })
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn options(&self) -> SchedulerOptions {
        self.options
    }

    /// Queues a plain API job.
    pub fn submit(&self, req: NewJobRequest) -> Result<(), JobError> {
        if self.is_shutting_down() {
            return Err(JobError::ShuttingDown);
        }
        parse_job_id(&req.id)?;

        let mut state = self.lock();
        if state.jobs.contains_key(&req.id) {
            return Err(JobError::Duplicate);
        }

        let session = req.session.filter(|s| !s.is_empty());
        let prompt = req.prompt.trim_matches(&['\n', ' '][..]).to_string();
        let mut job = Job::new(req.id.clone(), session, prompt, JobSource::Api);
        job.requested_model = req.model;
        job.translate = req.translate;

        tracing::debug!(job = %job.id, session = ?job.session_id, "job queued");
        state.jobs.insert(req.id.clone(), job);
        state.queue.push_back(req.id);
        self.stats.submitted();
        Ok(())
    }

    /// Formats `messages` into an ephemeral session and queues a job reading it.
    /// Returns the generated job id.
    pub fn submit_chat(&self, messages: &[ChatMessage]) -> Result<String, JobError> {
        if self.is_shutting_down() {
            return Err(JobError::ShuttingDown);
        }

        let template = self.registry.default_prompt();
        let date = template.date_text(Local::now());
        let history = template.chat_history(messages, &date);

        let id = Uuid::new_v4().to_string();
        let session_id = format!("chat-{}", id);

        let mut state = self.lock();
        state.sessions.seed_ephemeral(&session_id, history);
        state.jobs.insert(
            id.clone(),
            Job::new(id.clone(), Some(session_id), String::new(), JobSource::Chat),
        );
        state.queue.push_back(id.clone());
        self.stats.submitted();
        tracing::debug!(job = %id, messages = messages.len(), "chat job queued");
        Ok(id)
    }

    /// Stops a queued or running job. Terminal jobs keep their status.
    pub fn stop(&self, id: &str) -> Result<JobStatus, JobError> {
        parse_job_id(id)?;

        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;

        let status = job.status;
        match status {
            JobStatus::Queued => {
                job.status = JobStatus::Stopped;
                job.finished_at = now_millis();
                state.queue.retain(|queued| queued != id);
                state.release_chat_session(id);
                self.stats.stopped();
                self.completed.notify_all();
                tracing::info!(job = id, "queued job stopped");
            }
            JobStatus::Processing => {
                job.status = JobStatus::Stopped;
                let pod = job.pod;
                self.stats.stopped();
                if let Some(pod) = pod {
                    self.engine.stop_inference(pod);
                }
                self.completed.notify_all();
                tracing::info!(job = id, ?pod, "running job stopped");
            }
            JobStatus::Finished | JobStatus::Stopped => {}
        }
        Ok(job_status(&state, id))
    }

    pub fn status(&self, id: &str) -> Result<JobStatus, JobError> {
        parse_job_id(id)?;
        let state = self.lock();
        state
            .jobs
            .get(id)
            .map(|job| job.status)
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    /// Snapshot of a job. While processing, `output` carries the live partial answer.
    pub fn job(&self, id: &str) -> Result<Job, JobError> {
        parse_job_id(id)?;
        let job = self
            .lock()
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        Ok(self.with_live_output(job))
    }

    fn with_live_output(&self, mut job: Job) -> Job {
        if job.status == JobStatus::Processing && !job.full_prompt.is_empty() {
            let raw = strip_engine_space(self.engine.status(&job.id), &job.full_prompt);
            job.output = visible_output(&raw, &job.full_prompt);
        }
        job
    }

    /// Blocks until the job is terminal, evicted, or `timeout` passes.
    /// Returns `None` when the job is gone.
    pub fn wait_for_completion(&self, id: &str, timeout: Duration) -> Option<Job> {
        let state = self.lock();
        let (state, _) = self
            .completed
            .wait_timeout_while(state, timeout, |s| {
                s.jobs
                    .get(id)
                    .map(|job| !job.status.is_terminal())
                    .unwrap_or(false)
            })
            .unwrap_or_else(PoisonError::into_inner);
        let job = state.jobs.get(id).cloned();
        drop(state);
        job.map(|job| self.with_live_output(job))
    }

    pub fn health(&self) -> HealthResponse {
        let max_threads = self.registry.max_threads();
        let running = self.running_threads.load(Ordering::Acquire);
        let cpu_load = if max_threads == 0 {
            0.0
        } else {
            running as f32 / max_threads as f32
        };

        let gpu_pods = self.registry.gpu_pod_count();
        let gpu_load = if gpu_pods == 0 {
            0.0
        } else {
            let state = self.lock();
            let busy = self
                .registry
                .pods()
                .iter()
                .filter(|pod| pod.is_gpu && state.bindings[pod.index].is_some())
                .count();
            busy as f32 / gpu_pods as f32
        };

        HealthResponse {
            pod_count: self.registry.pods().len(),
            cpu_load,
            gpu_load,
        }
    }

    pub fn begin_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            tracing::info!("shutdown requested, draining queue");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn running_threads(&self) -> usize {
        self.running_threads.load(Ordering::Acquire)
    }

    pub fn running_pods(&self) -> usize {
        self.running_pods.load(Ordering::Acquire)
    }
}

fn job_status(state: &SchedulerState, id: &str) -> JobStatus {
    state
        .jobs
        .get(id)
        .map(|job| job.status)
        .unwrap_or(JobStatus::Stopped)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::EchoEngine;
    use crate::registry::tests::{config_with_pods, mk_temp_dir};
    use podserve_protocol::Role;
    use std::fs;
    use std::time::Instant;

    pub(crate) const JOB_A: &str = "11111111-1111-4111-8111-111111111111";
    pub(crate) const JOB_B: &str = "22222222-2222-4222-8222-222222222222";
    pub(crate) const JOB_C: &str = "33333333-3333-4333-8333-333333333333";

    pub(crate) struct Fixture<E: InferenceEngine + 'static = EchoEngine> {
        pub scheduler: Arc<Scheduler>,
        pub engine: Arc<E>,
        dir: std::path::PathBuf,
    }

    impl<E: InferenceEngine + 'static> Drop for Fixture<E> {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    pub(crate) fn fixture<E: InferenceEngine + 'static>(
        pods: &str,
        engine: E,
        options: SchedulerOptions,
    ) -> Fixture<E> {
        let dir = mk_temp_dir("podserve_sched");
        let cfg = Config::parse(&config_with_pods(&dir, pods)).expect("parse");
        let engine = Arc::new(engine);
        let registry = Registry::initialize(&cfg, engine.as_ref()).expect("registry");
        let scheduler = Scheduler::new(
            Arc::new(registry),
            engine.clone(),
            SessionStore::in_memory(),
            options,
        );
        Fixture {
            scheduler,
            engine,
            dir,
        }
    }

    pub(crate) fn one_pod() -> &'static str {
        "[pods.p]\nmodel = \"tiny\"\nprompt = \"chatml\"\nthreads = 2\n"
    }

    pub(crate) fn request(id: &str, prompt: &str, session: Option<&str>) -> NewJobRequest {
        NewJobRequest {
            id: id.to_string(),
            session: session.map(str::to_string),
            prompt: prompt.to_string(),
            ..NewJobRequest::default()
        }
    }

    pub(crate) fn wait_status(s: &Scheduler, id: &str, want: JobStatus) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if s.status(id) == Ok(want) {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("job {} never reached {:?}, now {:?}", id, want, s.status(id));
    }

    #[test]
    fn submit_validates_ids_and_rejects_duplicates() {
        let f = fixture(
            one_pod(),
            EchoEngine::new(Duration::ZERO, "ok"),
            SchedulerOptions::default(),
        );
        let s = &f.scheduler;

        assert_eq!(
            s.submit(request("not-a-uuid", "hi", None)),
            Err(JobError::InvalidId)
        );
        assert_eq!(s.submit(request(JOB_A, "first", None)), Ok(()));
        assert_eq!(s.status(JOB_A), Ok(JobStatus::Queued));
        assert_eq!(
            s.submit(request(JOB_A, "second", None)),
            Err(JobError::Duplicate)
        );
        assert_eq!(s.job(JOB_A).expect("job").prompt, "first");
        assert_eq!(s.submit(request(JOB_C, "\n  Hello there \n", None)), Ok(()));
        assert_eq!(s.job(JOB_C).expect("job").prompt, "Hello there");
        assert_eq!(
            s.status(JOB_B),
            Err(JobError::NotFound(JOB_B.to_string()))
        );
        assert_eq!(s.status("garbage"), Err(JobError::InvalidId));
    }

    #[test]
    fn stopping_a_queued_job_never_binds_it() {
        let f = fixture(
            one_pod(),
            EchoEngine::new(Duration::ZERO, "ok"),
            SchedulerOptions::default(),
        );
        let s = &f.scheduler;
        s.submit(request(JOB_A, "hi", None)).expect("submit");
        assert_eq!(s.stop(JOB_A), Ok(JobStatus::Stopped));

        assert_eq!(s.admit_pending(), 0);
        let job = s.job(JOB_A).expect("job");
        assert_eq!(job.status, JobStatus::Stopped);
        assert!(job.pod.is_none());
        assert_eq!(job.started_at, 0);
        assert!(s.snapshot().queue.is_empty());
    }

    #[test]
    fn stopping_a_running_job_keeps_it_stopped() {
        let f = fixture(
            one_pod(),
            EchoEngine::new(Duration::from_secs(10), "late"),
            SchedulerOptions::default(),
        );
        let s = &f.scheduler;
        s.submit(request(JOB_A, "hi", None)).expect("submit");
        assert_eq!(s.admit_pending(), 1);
        while f.engine.status(JOB_A).is_empty() {
            std::thread::sleep(Duration::from_millis(5));
        }

        let started = Instant::now();
        assert_eq!(s.stop(JOB_A), Ok(JobStatus::Stopped));
        let job = s
            .wait_for_completion(JOB_A, Duration::from_secs(5))
            .expect("job kept");
        assert_eq!(job.status, JobStatus::Stopped);
        assert!(started.elapsed() < Duration::from_secs(5));

        // the worker releases the pod without flipping the status
        let deadline = Instant::now() + Duration::from_secs(5);
        while s.running_pods() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(s.running_pods(), 0);
        assert_eq!(s.status(JOB_A), Ok(JobStatus::Stopped));
        assert_eq!(s.snapshot().stats.stopped, 1);
        assert_eq!(s.snapshot().stats.finished, 0);
    }

    /// Marks a queued job as running on pod 0 without spawning its worker.
    fn bind_by_hand(s: &Scheduler, id: &str, full_prompt: &str) {
        let mut state = s.lock();
        state.queue.retain(|queued| queued != id);
        let job = state.jobs.get_mut(id).expect("job");
        job.status = JobStatus::Processing;
        job.pod = Some(0);
        job.full_prompt = full_prompt.to_string();
        state.bindings[0] = Some(id.to_string());
    }

    #[test]
    fn stopping_a_running_job_wakes_completion_waiters() {
        let f = fixture(
            one_pod(),
            EchoEngine::new(Duration::ZERO, "ok"),
            SchedulerOptions::default(),
        );
        let s = Arc::clone(&f.scheduler);
        s.submit(request(JOB_A, "hi", None)).expect("submit");
        bind_by_hand(&s, JOB_A, "<u>hi</u><a>");

        let waiter = Arc::clone(&s);
        let started = Instant::now();
        let handle = std::thread::spawn(move || {
            waiter.wait_for_completion(JOB_A, Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(s.stop(JOB_A), Ok(JobStatus::Stopped));

        let job = handle.join().expect("join waiter").expect("job kept");
        assert_eq!(job.status, JobStatus::Stopped);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn running_job_exposes_trimmed_live_output() {
        let f = fixture(
            one_pod(),
            EchoEngine::new(Duration::ZERO, " partial answer "),
            SchedulerOptions::default(),
        );
        let s = &f.scheduler;
        let full_prompt = "<u>Hello</u><a>";
        s.submit(request(JOB_A, "Hello", None)).expect("submit");
        bind_by_hand(s, JOB_A, full_prompt);

        let job = s.job(JOB_A).expect("job");
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.output, "");

        let context = s.registry.pod(0).expect("pod").context;
        f.engine
            .run_inference(0, context, JOB_A, None, full_prompt)
            .expect("run");
        let job = s.job(JOB_A).expect("job");
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.output, "partial answer");
        // the stored record is untouched until the worker releases the pod
        assert_eq!(s.lock().jobs[JOB_A].output, "");
    }

    #[test]
    fn chat_wait_times_out_with_partial_state() {
        let f = fixture(
            one_pod(),
            EchoEngine::new(Duration::from_secs(10), "late"),
            SchedulerOptions::default(),
        );
        let s = &f.scheduler;
        let id = s
            .submit_chat(&[ChatMessage::new(Role::User, "Hello")])
            .expect("chat");

        let queued = s
            .wait_for_completion(&id, Duration::from_millis(50))
            .expect("still queued");
        assert_eq!(queued.status, JobStatus::Queued);
        assert_eq!(queued.output, "");

        assert_eq!(s.admit_pending(), 1);
        let running = s
            .wait_for_completion(&id, Duration::from_millis(50))
            .expect("still running");
        assert_eq!(running.status, JobStatus::Processing);
        assert_eq!(s.status(&id), Ok(JobStatus::Processing));

        s.stop(&id).expect("stop chat job");
    }

    #[test]
    fn chat_wait_returns_none_once_the_job_is_evicted() {
        let f = fixture(
            one_pod(),
            EchoEngine::new(Duration::from_secs(10), "late"),
            SchedulerOptions {
                deadline: Some(Duration::from_millis(50)),
                ..SchedulerOptions::default()
            },
        );
        let s = Arc::clone(&f.scheduler);
        s.submit(request(JOB_A, "busy", None)).expect("a");
        assert_eq!(s.admit_pending(), 1);

        let id = s
            .submit_chat(&[ChatMessage::new(Role::User, "Hello")])
            .expect("chat");
        let waiter = Arc::clone(&s);
        let wait_id = id.clone();
        let started = Instant::now();
        let handle = std::thread::spawn(move || {
            waiter.wait_for_completion(&wait_id, Duration::from_secs(5))
        });

        std::thread::sleep(Duration::from_millis(120));
        s.admit_pending();
        assert!(handle.join().expect("join waiter").is_none());
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(s.lock().sessions.is_empty());

        s.stop(JOB_A).expect("stop a");
    }

    #[test]
    fn stopping_a_finished_job_reports_finished() {
        let f = fixture(
            one_pod(),
            EchoEngine::new(Duration::ZERO, "ok"),
            SchedulerOptions::default(),
        );
        let s = &f.scheduler;
        s.submit(request(JOB_A, "hi", None)).expect("submit");
        s.admit_pending();
        wait_status(s, JOB_A, JobStatus::Finished);
        assert_eq!(s.stop(JOB_A), Ok(JobStatus::Finished));
        assert_eq!(
            s.stop(JOB_B),
            Err(JobError::NotFound(JOB_B.to_string()))
        );
    }

    #[test]
    fn health_reports_thread_load() {
        let f = fixture(
            "[pods.a]\nmodel = \"tiny\"\nthreads = 2\n[pods.b]\nmodel = \"tiny\"\nthreads = 2\ngpus = [100]\n",
            EchoEngine::new(Duration::from_secs(10), "late"),
            SchedulerOptions::default(),
        );
        let s = &f.scheduler;
        let idle = s.health();
        assert_eq!(idle.pod_count, 2);
        assert_eq!(idle.cpu_load, 0.0);
        assert_eq!(idle.gpu_load, 0.0);

        s.submit(request(JOB_A, "one", None)).expect("submit");
        s.submit(request(JOB_B, "two", None)).expect("submit");
        assert_eq!(s.admit_pending(), 2);
        let busy = s.health();
        assert_eq!(busy.cpu_load, 1.0);
        assert_eq!(busy.gpu_load, 1.0);

        s.stop(JOB_A).expect("stop a");
        s.stop(JOB_B).expect("stop b");
    }

    #[test]
    fn submissions_are_refused_after_shutdown() {
        let f = fixture(
            one_pod(),
            EchoEngine::new(Duration::ZERO, "ok"),
            SchedulerOptions::default(),
        );
        f.scheduler.begin_shutdown();
        assert_eq!(
            f.scheduler.submit(request(JOB_C, "late", None)),
            Err(JobError::ShuttingDown)
        );
        assert_eq!(
            f.scheduler.submit_chat(&[]),
            Err(JobError::ShuttingDown)
        );
    }
}
