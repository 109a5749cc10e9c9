//! Cancellable periodic task scheduler.
//!
//! Every long-running loop (discovery, polling, listening, anomaly
//! maintenance, optimization, load balancing) is registered here. A single
//! `watch` channel carries the shutdown signal; each task races its tick
//! against that signal with `tokio::select!`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// How long `shutdown` waits for each task before aborting it.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Receiver side of the shutdown signal.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

struct NamedTask {
    name: String,
    handle: JoinHandle<()>,
}

/// Owner of all background tasks.
#[derive(Clone)]
pub struct Scheduler {
    shutdown_tx: Arc<watch::Sender<bool>>,
    tasks: Arc<Mutex<Vec<NamedTask>>>,
    stopped: Arc<AtomicBool>,
    grace: Duration,
}

impl Scheduler {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            shutdown_tx: Arc::new(tx),
            tasks: Arc::new(Mutex::new(Vec::new())),
            stopped: Arc::new(AtomicBool::new(false)),
            grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.shutdown_tx.subscribe(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run `tick` every `period`, first run after one period.
    ///
    /// A tick that is still running when shutdown is requested is dropped at
    /// its next await point.
    pub async fn spawn_periodic<F, Fut>(&self, name: &str, period: Duration, tick: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut signal = self.signal();
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!(task = %task_name, period_ms = period.as_millis() as u64, "Periodic task started");

            loop {
                tokio::select! {
                    _ = signal.wait() => break,
                    _ = interval.tick() => {
                        tokio::select! {
                            _ = signal.wait() => break,
                            _ = tick() => {}
                        }
                    }
                }
            }
            tracing::debug!(task = %task_name, "Periodic task stopped");
        });
        self.register(name, handle).await;
    }

    /// Run a long-lived future until it completes or shutdown is requested.
    pub async fn spawn<Fut>(&self, name: &str, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut signal = self.signal();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = signal.wait() => {}
                _ = fut => {}
            }
        });
        self.register(name, handle).await;
    }

    async fn register(&self, name: &str, handle: JoinHandle<()>) {
        if self.is_shutdown() {
            handle.abort();
            return;
        }
        self.tasks.lock().await.push(NamedTask {
            name: name.to_string(),
            handle,
        });
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Signal every task and wait for them to finish. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);

        let tasks: Vec<NamedTask> = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let abort = task.handle.abort_handle();
            match tokio::time::timeout(self.grace, task.handle).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(task = %task.name, "Task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ticks_and_shutdown() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        scheduler
            .spawn_periodic("counter", Duration::from_secs(5), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;

        tokio::time::sleep(Duration::from_millis(15_500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        scheduler.shutdown().await;
        scheduler.shutdown().await;
        assert!(scheduler.is_shutdown());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_inflight_tick() {
        let scheduler = Scheduler::new();
        let finished = Arc::new(AtomicBool::new(false));

        let f = finished.clone();
        scheduler
            .spawn_periodic("slow", Duration::from_secs(1), move || {
                let f = f.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    f.store(true, Ordering::SeqCst);
                }
            })
            .await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        scheduler.shutdown().await;
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(scheduler.task_count().await, 0);
    }

    #[tokio::test]
    async fn test_spawn_after_shutdown_is_ignored() {
        let scheduler = Scheduler::new();
        scheduler.shutdown().await;
        scheduler.spawn("late", async {}).await;
        assert_eq!(scheduler.task_count().await, 0);
    }
}
