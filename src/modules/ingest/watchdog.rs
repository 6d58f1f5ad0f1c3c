//! Publisher stall detection
//!
//! A watchdog is armed when a session starts streaming. It polls at a fixed
//! cadence well below the timeout; once the publisher has been silent for the
//! whole timeout while the transcoder is still running, it reports the stall
//! to the session and forces the transcoder down itself, so an idle session
//! is torn down even if nothing else wakes it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::transcoder::StopHandle;

pub struct IdleWatchdog {
    last_activity: Arc<Mutex<Instant>>,
    task: JoinHandle<()>,
}

impl IdleWatchdog {
    /// Start watching `process`. The receiver yields the idle time once, on expiry.
    pub fn arm(
        timeout: Duration,
        check_interval: Duration,
        process: StopHandle,
    ) -> (Self, mpsc::Receiver<Duration>) {
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let (expired_tx, expired_rx) = mpsc::channel(1);

        let activity = last_activity.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let idle = activity
                    .lock()
                    .map(|last| last.elapsed())
                    .unwrap_or_else(|poisoned| poisoned.into_inner().elapsed());

                if idle >= timeout && process.is_running() {
                    log::warn!("No stream data for {:?}, stopping transcoder", idle);
                    // Report first so the session attributes the exit to the stall.
                    let _ = expired_tx.send(idle).await;
                    process.force_stop();
                    break;
                }
            }
        });

        (
            IdleWatchdog {
                last_activity,
                task,
            },
            expired_rx,
        )
    }

    /// Record stream activity now.
    pub fn touch(&self) {
        let mut last = self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Instant::now();
    }

    /// Stop checking. Dropping the watchdog has the same effect.
    pub fn disarm(self) {}
}

impl Drop for IdleWatchdog {
    fn drop(&mut self) {
        self.task.abort();
    }
}
