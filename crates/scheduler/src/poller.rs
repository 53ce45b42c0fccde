use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tabpilot_core::Result;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Work run on every tick of a session's poll timer.
#[async_trait]
pub trait PollJob: Send + Sync {
    async fn poll(&self) -> Result<()>;
}

struct PollHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Cancellable periodic tasks keyed by session id.
///
/// A timer only runs between an explicit `start` and `stop`; nothing restarts
/// it behind the caller's back.
#[derive(Default)]
pub struct PollService {
    timers: Mutex<HashMap<String, PollHandle>>,
}

impl PollService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start polling for `session_id`. Returns false if a timer already runs for it.
    pub async fn start(&self, session_id: &str, period: Duration, job: Arc<dyn PollJob>) -> bool {
        let mut timers = self.timers.lock().await;
        if timers.get(session_id).map(|h| !h.task.is_finished()).unwrap_or(false) {
            debug!(session_id = %session_id, "Poll timer already running");
            return false;
        }

        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let id = session_id.to_string();
        let task = tokio::spawn(async move {
            info!(session_id = %id, period_secs = period.as_secs(), "Poll timer started");
            // first poll happens one period after start
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = job.poll().await {
                            error!(session_id = %id, error = %e, "Poll failed");
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!(session_id = %id, "Poll timer stopped");
                        break;
                    }
                }
            }
        });
        timers.insert(session_id.to_string(), PollHandle { shutdown, task });
        true
    }

    /// Stop and forget the timer for `session_id`. Returns whether one existed.
    pub async fn stop(&self, session_id: &str) -> bool {
        let handle = self.timers.lock().await.remove(session_id);
        match handle {
            Some(handle) => {
                let _ = handle.shutdown.send(());
                // a poll in flight is not awaited
                if !handle.task.is_finished() {
                    handle.task.abort();
                }
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self, session_id: &str) -> bool {
        self.timers
            .lock()
            .await
            .get(session_id)
            .map(|h| !h.task.is_finished())
            .unwrap_or(false)
    }

    pub async fn stop_all(&self) {
        let handles: Vec<PollHandle> = self.timers.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            let _ = handle.shutdown.send(());
            handle.task.abort();
        }
    }
}
