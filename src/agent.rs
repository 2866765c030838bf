//! Generic lifecycle scaffolding for long-running workers.
//!
//! An [`Agent`] owns one spawned tokio task that repeatedly drives a
//! [`Worker`]. Construction is inert: nothing runs until [`Agent::spawn`] is
//! called, so a worker can be wired into channels and handed out before any
//! side effects happen.
//!
//! Stop requests are cooperative. [`Agent::request_stop`] flips a watch flag;
//! the driver loop races that flag against the worker's `on_loop`, so a worker
//! blocked on a channel is interrupted rather than waited out. `on_close`
//! always runs, including after a loop error.

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{AppResult, ScopeError};

/// What the driver loop should do after one `on_loop` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopFlow {
    /// Run `on_loop` again.
    Continue,
    /// Leave the loop and run `on_close`.
    Break,
}

/// One unit of long-running work driven by an [`Agent`].
#[async_trait]
pub trait Worker: Send + 'static {
    /// Descriptive name used in log output.
    fn name(&self) -> &str;

    /// Runs once before the first `on_loop` pass.
    async fn on_start(&mut self) -> AppResult<()> {
        Ok(())
    }

    /// One pass of the worker's loop. Returning [`LoopFlow::Break`] ends the
    /// agent normally; returning an error ends it abnormally. Must be
    /// cancel-safe at its await points.
    async fn on_loop(&mut self) -> AppResult<LoopFlow>;

    /// Runs once after the loop has ended, regardless of how it ended.
    async fn on_close(&mut self) {}
}

/// Handle to a spawned worker task.
pub struct Agent {
    name: String,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<AppResult<()>>,
}

impl Agent {
    /// Spawns `worker` onto the runtime and returns its handle.
    pub fn spawn<W: Worker>(mut worker: W) -> Self {
        let name = worker.name().to_string();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            debug!(agent = %task_name, "agent starting");
            let result = Self::drive(&mut worker, &mut stop_rx).await;
            worker.on_close().await;
            if let Err(err) = &result {
                error!(agent = %task_name, %err, "agent loop failed");
            }
            debug!(agent = %task_name, "agent stopped");
            result
        });

        Self {
            name,
            stop_tx,
            handle,
        }
    }

    async fn drive<W: Worker>(
        worker: &mut W,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> AppResult<()> {
        worker.on_start().await?;
        loop {
            if *stop_rx.borrow() {
                return Ok(());
            }
            tokio::select! {
                _ = stop_rx.changed() => return Ok(()),
                flow = worker.on_loop() => match flow? {
                    LoopFlow::Continue => {}
                    LoopFlow::Break => return Ok(()),
                },
            }
        }
    }

    /// Name of the wrapped worker.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Asks the worker to stop. Safe to call more than once.
    pub fn request_stop(&self) {
        // receiver gone means the task already exited, nothing to do
        let _ = self.stop_tx.send(true);
    }

    /// Waits for the task to finish and returns the loop outcome.
    pub async fn join(self) -> AppResult<()> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(ScopeError::AgentTerminated(err.to_string())),
        }
    }

    /// Requests a stop and waits for the task to finish.
    pub async fn stop(self) -> AppResult<()> {
        self.request_stop();
        self.join().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_test::assert_ok;

    struct Counter {
        ticks: u32,
        limit: u32,
        done_tx: Option<mpsc::Sender<u32>>,
    }

    #[async_trait]
    impl Worker for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        async fn on_loop(&mut self) -> AppResult<LoopFlow> {
            self.ticks += 1;
            if self.ticks >= self.limit {
                return Ok(LoopFlow::Break);
            }
            Ok(LoopFlow::Continue)
        }

        async fn on_close(&mut self) {
            if let Some(tx) = self.done_tx.take() {
                let _ = tx.send(self.ticks).await;
            }
        }
    }

    struct Blocked;

    #[async_trait]
    impl Worker for Blocked {
        fn name(&self) -> &str {
            "blocked"
        }

        async fn on_loop(&mut self) -> AppResult<LoopFlow> {
            // never resolves; the stop flag has to interrupt us
            std::future::pending::<()>().await;
            Ok(LoopFlow::Continue)
        }
    }

    struct Faulty;

    #[async_trait]
    impl Worker for Faulty {
        fn name(&self) -> &str {
            "faulty"
        }

        async fn on_loop(&mut self) -> AppResult<LoopFlow> {
            Err(ScopeError::Hardware("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn runs_until_break_and_closes() {
        let (tx, mut rx) = mpsc::channel(1);
        let agent = Agent::spawn(Counter {
            ticks: 0,
            limit: 3,
            done_tx: Some(tx),
        });
        tokio_test::assert_ok!(agent.join().await);
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn stop_interrupts_blocked_loop() {
        let agent = Agent::spawn(Blocked);
        agent.request_stop();
        agent.request_stop(); // double stop is a no-op
        tokio_test::assert_ok!(agent.join().await);
    }

    #[tokio::test]
    async fn loop_error_surfaces_through_join() {
        let agent = Agent::spawn(Faulty);
        let err = agent.join().await.unwrap_err();
        assert!(matches!(err, ScopeError::Hardware(_)));
    }
}
