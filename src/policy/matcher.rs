use std::sync::mpsc::{self, RecvTimeoutError, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::rules::CompiledPattern;

/// Runs one compiled pattern against a haystack.
///
/// The default engine is the linear-time `regex` crate; the seam exists so
/// other engines (or a deliberately slow one) can be plugged in.
pub trait PatternEngine: Send + Sync {
    fn name(&self) -> &str;

    fn is_match(&self, pattern: &CompiledPattern, haystack: &str) -> bool;
}

pub struct RegexEngine;

impl PatternEngine for RegexEngine {
    fn name(&self) -> &str {
        "regex"
    }

    fn is_match(&self, pattern: &CompiledPattern, haystack: &str) -> bool {
        pattern.regex.is_match(haystack)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched,
    NotMatched,
    TimedOut { elapsed: Duration },
    Failed(String),
}

/// `any_of` (when present) must hit and no `none_of` may hit.
pub fn composite_match(
    engine: &dyn PatternEngine,
    any_of: &[CompiledPattern],
    none_of: &[CompiledPattern],
    haystack: &str,
) -> bool {
    let wanted = any_of.is_empty() || any_of.iter().any(|p| engine.is_match(p, haystack));
    wanted && !none_of.iter().any(|p| engine.is_match(p, haystack))
}

struct MatchJob {
    deadline: Option<Instant>,
    run: Box<dyn FnOnce() + Send>,
}

/// A fixed set of matcher threads shared by every evaluation.
///
/// A match that overruns its timeout is abandoned, not awaited; it keeps its
/// worker until the engine returns. Jobs whose deadline passed while they sat
/// in the queue are dropped unrun.
pub struct MatchPool {
    jobs: mpsc::SyncSender<MatchJob>,
    workers: usize,
}

impl MatchPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (jobs, queue) = mpsc::sync_channel::<MatchJob>(workers * 16);
        let queue = Arc::new(Mutex::new(queue));
        let mut started = 0;
        for index in 0..workers {
            let queue = Arc::clone(&queue);
            let spawned = std::thread::Builder::new()
                .name(format!("policy-match-{index}"))
                .spawn(move || work(&queue));
            match spawned {
                Ok(_) => started += 1,
                Err(error) => tracing::warn!(%error, index, "policy.match_worker_spawn_failed"),
            }
        }
        Self {
            jobs,
            workers: started,
        }
    }

    /// Worker threads that actually started.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Evaluate a composite predicate on a pool worker, giving up after
    /// `timeout`.
    pub fn run(
        &self,
        engine: Arc<dyn PatternEngine>,
        any_of: Arc<[CompiledPattern]>,
        none_of: Arc<[CompiledPattern]>,
        haystack: Arc<str>,
        timeout: Duration,
    ) -> MatchOutcome {
        let started = Instant::now();
        let (tx, rx) = mpsc::sync_channel(1);
        let job = MatchJob {
            deadline: started.checked_add(timeout),
            run: Box::new(move || {
                let matched = composite_match(engine.as_ref(), &any_of, &none_of, &haystack);
                if tx.send(matched).is_err() {
                    tracing::debug!("policy.match_abandoned");
                }
            }),
        };
        match self.jobs.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return MatchOutcome::Failed("matcher queue is full".into());
            }
            Err(TrySendError::Disconnected(_)) => {
                return MatchOutcome::Failed("no matcher worker is running".into());
            }
        }

        match rx.recv_timeout(timeout) {
            Ok(true) => MatchOutcome::Matched,
            Ok(false) => MatchOutcome::NotMatched,
            Err(RecvTimeoutError::Timeout) => MatchOutcome::TimedOut {
                elapsed: started.elapsed(),
            },
            // A stale job is dropped unrun, which closes its reply channel.
            Err(RecvTimeoutError::Disconnected) if started.elapsed() >= timeout => {
                MatchOutcome::TimedOut {
                    elapsed: started.elapsed(),
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                MatchOutcome::Failed("matcher exited without a result".into())
            }
        }
    }
}

fn work(queue: &Mutex<mpsc::Receiver<MatchJob>>) {
    loop {
        let next = queue.lock().unwrap_or_else(PoisonError::into_inner).recv();
        let Ok(job) = next else {
            return;
        };
        if job.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            continue;
        }
        (job.run)();
    }
}
