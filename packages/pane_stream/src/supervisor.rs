//! Restart-with-backoff wrapper for long-lived loops.
//!
//! Pane read loops, the batcher flush loop, the hub accept loop and each
//! connection's pumps all run through [`Supervisor::run`]. A body that
//! returns `Ok(())` is done; an `Err` or a panic restarts it after an
//! exponential backoff until the restart ceiling is hit.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::SupervisorFileConfig;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failures tolerated before giving up.
    pub max_restarts: u32,
    /// A run lasting this long resets the failure count.
    pub stable_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from_file(&SupervisorFileConfig::default())
    }
}

impl RestartPolicy {
    pub fn from_file(fc: &SupervisorFileConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(fc.initial_backoff_ms),
            max_backoff: Duration::from_millis(fc.max_backoff_ms.max(fc.initial_backoff_ms)),
            max_restarts: fc.max_restarts,
            stable_after: Duration::from_secs(fc.stable_after_secs),
        }
    }
}

/// Notifications for whoever owns the process lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupervisorEvent {
    Restarted {
        name: String,
        attempt: u32,
        reason: String,
    },
    /// The restart ceiling was exhausted; the loop is no longer running.
    Fatal { name: String, reason: String },
}

/// How a supervised loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopOutcome {
    Completed,
    Cancelled,
    Exhausted,
}

#[derive(Clone, Debug, Default)]
pub struct Supervisor {
    policy: RestartPolicy,
    events: Option<mpsc::UnboundedSender<SupervisorEvent>>,
}

impl Supervisor {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            events: None,
        }
    }

    /// Report restarts and fatal exhaustion on `events`.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<SupervisorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run `body` until it completes, `cancel` fires, or it fails too often.
    ///
    /// Cancellation drops a running body at its next await point, so work
    /// that must happen on shutdown belongs after `run` returns.
    pub async fn run<F, Fut>(&self, name: &str, cancel: &CancellationToken, mut body: F) -> LoopOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let mut failures: u32 = 0;
        let mut backoff = self.policy.initial_backoff;

        loop {
            if cancel.is_cancelled() {
                return LoopOutcome::Cancelled;
            }

            let started = Instant::now();
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return LoopOutcome::Cancelled,
                attempt = AssertUnwindSafe(body()).catch_unwind() => attempt,
            };
            let reason = match attempt {
                Ok(Ok(())) if cancel.is_cancelled() => return LoopOutcome::Cancelled,
                Ok(Ok(())) => {
                    debug!(loop_name = name, "supervised loop completed");
                    return LoopOutcome::Completed;
                }
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => format!("panic: {}", panic_message(panic.as_ref())),
            };

            if cancel.is_cancelled() {
                return LoopOutcome::Cancelled;
            }

            if started.elapsed() >= self.policy.stable_after {
                failures = 0;
                backoff = self.policy.initial_backoff;
            }
            failures += 1;

            if failures > self.policy.max_restarts {
                error!(
                    loop_name = name,
                    failures,
                    reason = %reason,
                    "supervised loop exhausted its restarts"
                );
                self.emit(SupervisorEvent::Fatal {
                    name: name.to_string(),
                    reason,
                });
                return LoopOutcome::Exhausted;
            }

            warn!(
                loop_name = name,
                attempt = failures,
                backoff_ms = backoff.as_millis() as u64,
                reason = %reason,
                "supervised loop failed, restarting"
            );
            self.emit(SupervisorEvent::Restarted {
                name: name.to_string(),
                attempt: failures,
                reason,
            });

            tokio::select! {
                _ = cancel.cancelled() => return LoopOutcome::Cancelled,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.policy.max_backoff);
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            max_restarts,
            stable_after: Duration::from_secs(60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completed_body_runs_once() {
        let runs = AtomicU32::new(0);
        let outcome = Supervisor::new(fast_policy(3))
            .run("once", &CancellationToken::new(), || {
                runs.fetch_add(1, Ordering::SeqCst);
                async { anyhow::Ok(()) }
            })
            .await;
        assert_eq!(outcome, LoopOutcome::Completed);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panics_are_restarted_until_success() {
        let runs = Arc::new(AtomicU32::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let counter = runs.clone();
        let outcome = Supervisor::new(fast_policy(5))
            .with_events(tx)
            .run("flaky", &CancellationToken::new(), move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        panic!("boom {n}");
                    }
                    anyhow::Ok(())
                }
            })
            .await;

        assert_eq!(outcome, LoopOutcome::Completed);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        match rx.recv().await.unwrap() {
            SupervisorEvent::Restarted { name, attempt, reason } => {
                assert_eq!(name, "flaky");
                assert_eq!(attempt, 1);
                assert!(reason.contains("boom 0"), "{reason}");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_exhaustion_emits_fatal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = Supervisor::new(fast_policy(2))
            .with_events(tx)
            .run("doomed", &CancellationToken::new(), || async {
                Err::<(), _>(anyhow::anyhow!("always fails"))
            })
            .await;
        assert_eq!(outcome, LoopOutcome::Exhausted);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 3);
        assert!(matches!(
            events.last(),
            Some(SupervisorEvent::Fatal { name, reason }) if name == "doomed" && reason.contains("always fails")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let outcome = Supervisor::new(RestartPolicy {
            initial_backoff: Duration::from_secs(3600),
            ..fast_policy(10)
        })
        .run("waiting", &cancel, move || {
            let trigger = trigger.clone();
            async move {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    trigger.cancel();
                });
                Err::<(), _>(anyhow::anyhow!("fail once"))
            }
        })
        .await;
        assert_eq!(outcome, LoopOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_running_body() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(60),
            Supervisor::new(fast_policy(3)).run("sleeper", &cancel, || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                anyhow::Ok(())
            }),
        )
        .await;
        assert_eq!(outcome, Ok(LoopOutcome::Cancelled));
    }

    #[tokio::test]
    async fn body_ending_after_cancel_counts_as_cancelled() {
        let cancel = CancellationToken::new();
        let outcome = Supervisor::new(fast_policy(3))
            .run("winding-down", &cancel, || {
                cancel.cancel();
                async { anyhow::Ok(()) }
            })
            .await;
        assert_eq!(outcome, LoopOutcome::Cancelled);
    }

    #[test]
    fn policy_from_file_clamps_max_backoff() {
        let policy = RestartPolicy::from_file(&SupervisorFileConfig {
            initial_backoff_ms: 500,
            max_backoff_ms: 100,
            ..Default::default()
        });
        assert_eq!(policy.max_backoff, Duration::from_millis(500));
    }
}
