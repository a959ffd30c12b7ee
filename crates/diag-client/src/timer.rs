//! One-shot cancellable timer bounding every network wait

use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Why an armed timer stopped waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Armed,
    CancelRequested,
}

/// One-shot timer that can be stopped from another task or thread
///
/// The timer is rearmable: every [`start`](Self::start) or
/// [`wait`](Self::wait) goes Idle → Armed → Idle. Cancelling the shutdown
/// token passed at construction cancels the current and all future waits.
pub struct SyncTimer {
    state: Mutex<TimerState>,
    stop: Notify,
    shutdown: CancellationToken,
}

impl SyncTimer {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            state: Mutex::new(TimerState::Idle),
            stop: Notify::new(),
            shutdown,
        }
    }

    pub fn state(&self) -> TimerState {
        *self.state.lock()
    }

    /// Suspend until `timeout` elapses or the timer is stopped
    pub async fn start(&self, timeout: Duration) -> TimerOutcome {
        match self
            .wait(timeout, std::future::pending::<Infallible>())
            .await
        {
            Ok(never) => match never {},
            Err(outcome) => outcome,
        }
    }

    /// Drive `fut` to completion unless the timer fires or is stopped first
    pub async fn wait<F>(&self, timeout: Duration, fut: F) -> Result<F::Output, TimerOutcome>
    where
        F: Future,
    {
        let stopped = self.stop.notified();
        tokio::pin!(stopped);
        // Register interest before arming so a concurrent stop() is not lost.
        stopped.as_mut().enable();
        *self.state.lock() = TimerState::Armed;

        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TimerOutcome::Cancelled),
            _ = &mut stopped => Err(TimerOutcome::Cancelled),
            output = fut => Ok(output),
            _ = tokio::time::sleep(timeout) => Err(TimerOutcome::TimedOut),
        };

        *self.state.lock() = TimerState::Idle;
        result
    }

    /// Cancel the armed wait, if any. No-op on an idle timer.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if *state == TimerState::Armed {
            *state = TimerState::CancelRequested;
            self.stop.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;

    #[tokio::test]
    async fn test_times_out() {
        let timer = SyncTimer::new(CancellationToken::new());
        assert_eq!(
            timer.start(Duration::from_millis(20)).await,
            TimerOutcome::TimedOut
        );
        assert_eq!(timer.state(), TimerState::Idle);
    }

    #[tokio::test]
    async fn test_stop_from_other_task() {
        let timer = Arc::new(SyncTimer::new(CancellationToken::new()));
        let stopper = timer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.stop();
        });

        let started = Instant::now();
        assert_eq!(
            timer.start(Duration::from_secs(10)).await,
            TimerOutcome::Cancelled
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_stop_idle_is_noop_and_rearmable() {
        let timer = SyncTimer::new(CancellationToken::new());
        timer.stop();
        timer.stop();
        assert_eq!(timer.state(), TimerState::Idle);
        assert_eq!(
            timer.start(Duration::from_millis(10)).await,
            TimerOutcome::TimedOut
        );
        assert_eq!(
            timer.start(Duration::from_millis(10)).await,
            TimerOutcome::TimedOut
        );
    }

    #[tokio::test]
    async fn test_shutdown_cancels() {
        let shutdown = CancellationToken::new();
        let timer = SyncTimer::new(shutdown.clone());
        shutdown.cancel();
        assert_eq!(
            timer.start(Duration::from_secs(10)).await,
            TimerOutcome::Cancelled
        );
    }

    #[tokio::test]
    async fn test_wait_returns_output() {
        let timer = SyncTimer::new(CancellationToken::new());
        let result = timer
            .wait(Duration::from_secs(1), async { 42 })
            .await;
        assert_eq!(result, Ok(42));

        let slow = timer
            .wait(
                Duration::from_millis(10),
                tokio::time::sleep(Duration::from_secs(5)),
            )
            .await;
        assert_eq!(slow, Err(TimerOutcome::TimedOut));
    }
}
