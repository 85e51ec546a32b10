//! Robot lifecycle: pause, shutdown and the running-pipeline count.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Why a new pipeline was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    ShuttingDown,
    Paused,
}

#[derive(Debug, Default)]
pub struct Lifecycle {
    shutting_down: AtomicBool,
    paused: AtomicBool,
    running: AtomicUsize,
    drained: Notify,
    stop: Notify,
}

/// Held for the life of a pipeline.
#[derive(Debug)]
pub struct PipelineGuard {
    lifecycle: Arc<Lifecycle>,
}

impl Drop for PipelineGuard {
    fn drop(&mut self) {
        if self.lifecycle.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.lifecycle.drained.notify_waiters();
        }
    }
}

impl Lifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new pipeline. `bypass` lets admin commands through while
    /// paused or stopping.
    pub fn enter(self: &Arc<Self>, bypass: bool) -> Result<PipelineGuard, Refusal> {
        if !bypass {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(Refusal::ShuttingDown);
            }
            if self.paused.load(Ordering::Acquire) {
                return Err(Refusal::Paused);
            }
        }
        self.running.fetch_add(1, Ordering::AcqRel);
        Ok(PipelineGuard {
            lifecycle: Arc::clone(self),
        })
    }

    /// Number of pipelines running now.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        tracing::info!("Robot paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        tracing::info!("Robot resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Wait for every running pipeline to finish.
    pub async fn drain(&self) {
        loop {
            let drained = self.drained.notified();
            if self.running() == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Stop now, without waiting for pipelines.
    pub fn abort(&self) {
        self.begin_shutdown();
        self.stop.notify_one();
    }

    /// Resolves once [`Lifecycle::abort`] has been called.
    pub async fn stop_requested(&self) {
        self.stop.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pause_refuses_all_but_bypass() {
        let lc = Lifecycle::new();
        lc.pause();
        assert_eq!(lc.enter(false).unwrap_err(), Refusal::Paused);
        let guard = lc.enter(true).unwrap();
        assert_eq!(lc.running(), 1);
        drop(guard);
        lc.resume();
        assert!(lc.enter(false).is_ok());
    }

    #[test]
    fn shutdown_wins_over_pause() {
        let lc = Lifecycle::new();
        lc.pause();
        lc.begin_shutdown();
        assert_eq!(lc.enter(false).unwrap_err(), Refusal::ShuttingDown);
    }

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let lc = Lifecycle::new();
        let guard = lc.enter(false).unwrap();
        let waiter = {
            let lc = Arc::clone(&lc);
            tokio::spawn(async move { lc.drain().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn abort_is_remembered() {
        let lc = Lifecycle::new();
        lc.abort();
        tokio::time::timeout(Duration::from_secs(1), lc.stop_requested())
            .await
            .unwrap();
        assert!(lc.is_shutting_down());
    }
}
