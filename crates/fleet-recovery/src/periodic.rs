//! Background timer shared by the inactivity monitor and the cleanup service.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

struct Running {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// At most one loop per instance; `start` and `stop` are idempotent.
///
/// Ticks that fall behind are skipped rather than bunched up, and a tick never
/// overlaps the previous one.
pub struct PeriodicTask {
    name: &'static str,
    running: Mutex<Option<Running>>,
}

impl PeriodicTask {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.as_ref().is_some_and(|r| !r.handle.is_finished()))
            .unwrap_or(false)
    }

    /// Spawns the loop on the current tokio runtime. The first tick fires one
    /// `period` after start. Returns false if already running or no runtime is
    /// available.
    pub fn start<F, Fut>(&self, period: Duration, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(mut running) = self.running.lock() else {
            log::error!("periodic_task_lock_poisoned task={}", self.name);
            return false;
        };
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("periodic_task_no_runtime task={}", self.name);
            return false;
        };
        let (shutdown_tx, mut shutdown) = watch::channel(false);
        let name = self.name;
        let period = period.max(Duration::from_millis(1));
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => tick().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            log::debug!("periodic_task_stopped task={name}");
                            break;
                        }
                    }
                }
            }
        });
        *running = Some(Running {
            shutdown_tx,
            handle,
        });
        log::info!(
            "periodic_task_started task={} period_ms={}",
            self.name,
            period.as_millis()
        );
        true
    }

    /// Signals the loop and waits for it to finish. Returns false if nothing was running.
    pub async fn stop(&self) -> bool {
        let running = match self.running.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(running) = running else {
            return false;
        };
        let _ = running.shutdown_tx.send(true);
        if let Err(err) = running.handle.await {
            log::warn!("periodic_task_join_failed task={} error={}", self.name, err);
        }
        true
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.running.lock() {
            if let Some(running) = guard.take() {
                let _ = running.shutdown_tx.send(true);
                running.handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn ticks_until_stopped_and_start_is_idempotent() {
        let task = PeriodicTask::new("test");
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        assert!(task.start(Duration::from_millis(10), move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        }));
        assert!(!task.start(Duration::from_millis(10), || async {}));
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(task.stop().await);
        assert!(!task.stop().await);
        assert!(!task.is_running());

        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn start_without_runtime_is_refused() {
        let task = PeriodicTask::new("no-runtime");
        assert!(!task.start(Duration::from_millis(10), || async {}));
        assert!(!task.is_running());
    }
}
