//! Background task scheduling with graceful shutdown.
//!
//! Each registered task runs on its own interval loop. A broadcast
//! channel fans the shutdown signal out to every loop; shutdown waits
//! for the in-flight tick to finish, so cancellation is cooperative.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Context provided to background tasks during execution.
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// A periodic background task.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging.
    fn name(&self) -> &'static str;

    /// How often to run this task.
    fn interval(&self) -> Duration;

    /// Delay before the first tick. Compaction workers randomize this so
    /// a fleet of them never stampedes in lockstep.
    fn startup_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Execute the task.
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Runs background tasks until shutdown.
pub struct Scheduler {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Register a periodic background task.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        self.tasks.lock().unwrap().push(handle);
        self
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let startup_delay = task.startup_delay();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        tokio::spawn(async move {
            if !startup_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(startup_delay) => {}
                    _ = shutdown_rx.recv() => return,
                }
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };

                        if let Err(e) = task.execute(ctx).await {
                            tracing::error!(
                                task = task.name(),
                                error = %e,
                                "background task failed"
                            );
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = task.name(), "task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Graceful shutdown: signal every loop and wait for it to exit.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx.send(()).ok();

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            handle.await?;
        }
        Ok(())
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestTask {
        interval: Duration,
        delay: Duration,
        counter: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for TestTask {
        fn name(&self) -> &'static str {
            "test-task"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        fn startup_delay(&self) -> Duration {
            self.delay
        }

        async fn execute(&self, _ctx: Context) -> Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_scheduler_runs_tasks() -> Result<()> {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(TestTask {
            interval: Duration::from_millis(10),
            delay: Duration::ZERO,
            counter: Arc::clone(&counter),
        }));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(counter.load(Ordering::SeqCst) > 0);

        scheduler.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_stops_ticks() -> Result<()> {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(TestTask {
            interval: Duration::from_millis(10),
            delay: Duration::ZERO,
            counter: Arc::clone(&counter),
        }));

        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler.shutdown().await?;

        let frozen = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), frozen);
        Ok(())
    }

    #[tokio::test]
    async fn test_startup_delay_defers_first_tick() -> Result<()> {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(TestTask {
            interval: Duration::from_millis(5),
            delay: Duration::from_millis(80),
            counter: Arc::clone(&counter),
        }));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        scheduler.shutdown().await?;
        Ok(())
    }
}
