//! Spawning and orderly shutdown of the long-running services.
//!
//! Every service receives a `TaskExecutor`. It carries a single cooperative cancellation signal
//! which services check at loop heads and before each major step. Any service may request a
//! shutdown through the `ShutdownReason` channel; the process owner then cancels the signal, waits
//! for every tracked task to settle and closes the store.
use futures::Future;
use slog::{crit, debug, o, trace};
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Default capacity of the shutdown channel. Only the first reason is acted upon.
pub const SHUTDOWN_CHANNEL_CAPACITY: usize = 4;

/// Provides a reason when the process is shut down.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The process shut down successfully.
    Success(&'static str),
    /// The process shut down due to an error condition.
    Failure(&'static str),
}

impl ShutdownReason {
    pub fn message(&self) -> &'static str {
        match self {
            ShutdownReason::Success(msg) => msg,
            ShutdownReason::Failure(msg) => msg,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownReason::Success(_) => 0,
            ShutdownReason::Failure(_) => 1,
        }
    }
}

/// A wrapper over a cancellation signal and a task tracker that also logs the life-cycle of
/// every spawned service.
#[derive(Clone)]
pub struct TaskExecutor {
    exit: CancellationToken,
    tracker: TaskTracker,
    signal_tx: Sender<ShutdownReason>,
    log: slog::Logger,
}

impl TaskExecutor {
    pub fn new(exit: CancellationToken, signal_tx: Sender<ShutdownReason>, log: slog::Logger) -> Self {
        Self {
            exit,
            tracker: TaskTracker::new(),
            signal_tx,
            log,
        }
    }

    /// Build an executor along with the receiving end of its shutdown channel.
    pub fn with_channel(log: slog::Logger) -> (Self, Receiver<ShutdownReason>) {
        let (signal_tx, signal_rx) = mpsc::channel(SHUTDOWN_CHANNEL_CAPACITY);
        (Self::new(CancellationToken::new(), signal_tx, log), signal_rx)
    }

    /// Clone the executor, replacing its logger with `log`.
    pub fn clone_with_logger(&self, log: slog::Logger) -> Self {
        let mut executor = self.clone();
        executor.log = log;
        executor
    }

    /// Spawn a tracked task. The task is expected to watch `self.exit()` itself so that it can
    /// finish its in-flight work before returning.
    pub fn spawn(&self, task: impl Future<Output = ()> + Send + 'static, name: &'static str) {
        let log = self.log.new(o!("task" => name));
        trace!(log, "Spawning task");
        self.tracker.spawn(async move {
            task.await;
            debug!(log, "Async task completed");
        });
    }

    /// Returns a copy of the cancellation signal. Cancelled once a shutdown has begun.
    pub fn exit(&self) -> CancellationToken {
        self.exit.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.exit.is_cancelled()
    }

    /// Get a channel to request shutting down.
    pub fn shutdown_sender(&self) -> Sender<ShutdownReason> {
        self.signal_tx.clone()
    }

    /// Stop dispatching new work everywhere and request a shutdown with `reason`.
    pub fn request_shutdown(&self, reason: ShutdownReason) {
        if let ShutdownReason::Failure(msg) = reason {
            crit!(self.log, "Shutdown requested after failure"; "reason" => msg);
        }
        self.exit.cancel();
        if let Err(e) = self.signal_tx.try_send(reason) {
            // A reason is already queued; the first one wins.
            debug!(self.log, "Shutdown already pending"; "error" => %e);
        }
    }

    /// Cancel the exit signal and wait for every spawned task to settle.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.exit.cancel();
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
    }

    pub fn log(&self) -> &slog::Logger {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logging::test_logger;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn first_shutdown_reason_wins() {
        let (executor, mut signal_rx) = TaskExecutor::with_channel(test_logger());
        executor.request_shutdown(ShutdownReason::Failure("unit failed"));
        executor.request_shutdown(ShutdownReason::Success("done"));

        assert!(executor.is_shutting_down());
        let reason = signal_rx.recv().await.unwrap();
        assert_eq!(reason, ShutdownReason::Failure("unit failed"));
        assert_eq!(reason.exit_code(), 1);
    }

    #[tokio::test]
    async fn shutdown_waits_for_tasks() {
        let (executor, _signal_rx) = TaskExecutor::with_channel(test_logger());
        let finished = Arc::new(AtomicBool::new(false));

        let exit = executor.exit();
        let flag = finished.clone();
        executor.spawn(
            async move {
                exit.cancelled().await;
                flag.store(true, Ordering::SeqCst);
            },
            "waiter",
        );

        assert!(executor.shutdown(Duration::from_secs(5)).await);
        assert!(finished.load(Ordering::SeqCst));
    }
}
