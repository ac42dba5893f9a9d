use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::Scheduler;

/// Lifetime counters.
#[derive(Debug)]
pub(super) struct Stats {
    started: Instant,
    submitted: AtomicU64,
    admitted: AtomicU64,
    finished: AtomicU64,
    stopped: AtomicU64,
    expired: AtomicU64,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            submitted: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
            finished: AtomicU64::new(0),
            stopped: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }
}

impl Stats {
    pub fn submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finished(&self) {
        self.finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stopped(&self) {
        self.stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    fn counters(&self) -> Counters {
        Counters {
            uptime_secs: self.started.elapsed().as_secs(),
            submitted: self.submitted.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            stopped: self.stopped.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    pub uptime_secs: u64,
    pub submitted: u64,
    pub admitted: u64,
    pub finished: u64,
    pub stopped: u64,
    pub expired: u64,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub queue: Vec<String>,
    /// One `Job::status_line` per known job, sorted by creation time.
    pub jobs: Vec<String>,
    pub running_threads: usize,
    pub max_threads: usize,
    pub running_pods: usize,
    pub pod_count: usize,
    pub stats: Counters,
}

impl Scheduler {
    pub fn snapshot(&self) -> Snapshot {
        let state = self.lock();
        let mut jobs: Vec<_> = state.jobs.values().collect();
        jobs.sort_by_key(|job| (job.created_at, job.id.clone()));

        Snapshot {
            queue: state.queue.iter().cloned().collect(),
            jobs: jobs.iter().map(|job| job.status_line()).collect(),
            running_threads: self.running_threads(),
            max_threads: self.registry.max_threads(),
            running_pods: self.running_pods(),
            pod_count: self.registry.pods().len(),
            stats: self.stats.counters(),
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "uptime_s={} queue={} threads={}/{} pods={}/{} submitted={} admitted={} finished={} stopped={} expired={}",
            self.stats.uptime_secs,
            self.queue.len(),
            self.running_threads,
            self.max_threads,
            self.running_pods,
            self.pod_count,
            self.stats.submitted,
            self.stats.admitted,
            self.stats.finished,
            self.stats.stopped,
            self.stats.expired
        )?;
        for line in &self.jobs {
            writeln!(f, "  {}", line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{fixture, one_pod, request, wait_status, JOB_A, JOB_B};
    use super::super::SchedulerOptions;
    use crate::engine::EchoEngine;
    use podserve_protocol::JobStatus;
    use std::time::Duration;

    #[test]
    fn snapshot_counts_lifecycle_events() {
        let f = fixture(
            one_pod(),
            EchoEngine::new(Duration::ZERO, "ok"),
            SchedulerOptions::default(),
        );
        let s = &f.scheduler;
        s.submit(request(JOB_A, "one", None)).expect("a");
        s.submit(request(JOB_B, "two", None)).expect("b");
        s.stop(JOB_B).expect("stop b");

        let before = s.snapshot();
        assert_eq!(before.queue, vec![JOB_A.to_string()]);
        assert_eq!(before.jobs.len(), 2);
        assert_eq!(before.stats.submitted, 2);
        assert_eq!(before.stats.stopped, 1);

        s.admit_pending();
        wait_status(s, JOB_A, JobStatus::Finished);

        let after = s.snapshot();
        assert!(after.queue.is_empty());
        assert_eq!(after.stats.admitted, 1);
        assert_eq!(after.stats.finished, 1);
        assert_eq!(after.running_pods, 0);

        let text = after.to_string();
        assert!(text.contains("finished=1"));
        assert!(text.contains("status=stopped"));
    }
}
