use crate::pipeline::Harvester;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Coordinates the harvester lifecycle and handles OS signals for graceful shutdowns.
pub struct Runner {
    harvester: Arc<Harvester>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl Runner {
    /// Creates a runner around `harvester` with a fresh root [`CancellationToken`].
    pub fn new(harvester: Harvester) -> Self {
        Self {
            harvester: Arc::new(harvester),
            shutdown: CancellationToken::new(),
            task: None,
        }
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn harvester(&self) -> &Harvester {
        &self.harvester
    }

    /// Spawns the harvester on its own task. Calling it twice is a no-op.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }

        let harvester = self.harvester.clone();
        let shutdown = self.shutdown.clone();
        self.task = Some(tokio::spawn(async move { harvester.run(shutdown).await }));
    }

    /// Cancels the root token and waits for in-flight work items and the pool to wind down.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };

        self.shutdown.cancel();
        let result = task.await.context("harvester task panicked")?;
        self.shutdown = CancellationToken::new();
        result
    }

    /// Runs until a Ctrl-C (SIGINT) is received, the shutdown token is cancelled
    /// elsewhere, or the harvester stops on its own.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start();
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        let finished = match self.task.as_mut() {
            Some(task) => tokio::select! {
                _ = signal::ctrl_c() => {
                    tracing::info!("Ctrl-C received; shutting down runner");
                    None
                }
                _ = self.shutdown.cancelled() => {
                    tracing::info!("runner shutdown token cancelled");
                    None
                }
                joined = task => Some(joined),
            },
            None => None,
        };

        match finished {
            Some(joined) => {
                self.task = None;
                self.shutdown = CancellationToken::new();
                joined.context("harvester task panicked")?
            }
            None => self.stop().await,
        }
    }
}
