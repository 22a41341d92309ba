//! Process runner for the b-log workers.
//!
//! Runs named long-lived processes side by side and shuts them down together:
//! - a SIGINT/SIGTERM or the first process error cancels the shared token
//! - processes get `shutdown_timeout` to wind down (the md-worker drains here)
//! - closers run afterwards under `closer_timeout`, whatever the outcome
//!
//! # Example
//!
//! ```no_run
//! use b_log_runner::Runner;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Runner::new()
//!         .with_named_process("heartbeat", |ctx| async move {
//!             while !ctx.is_cancelled() {
//!                 tokio::select! {
//!                     _ = ctx.cancelled() => {}
//!                     _ = tokio::time::sleep(Duration::from_secs(1)) => {
//!                         tracing::info!("still alive");
//!                     }
//!                 }
//!             }
//!             Ok(())
//!         })
//!         .with_closer(|| async move {
//!             tracing::info!("cleaning up");
//!             Ok(())
//!         })
//!         .run()
//!         .await;
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

type BoxedResultFuture = Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send>>;

/// A long-running process. Receives the shared cancellation token.
pub type AppProcess = Box<dyn FnOnce(CancellationToken) -> BoxedResultFuture + Send>;

/// A cleanup step run once every process has stopped.
pub type Closer = Box<dyn FnOnce() -> BoxedResultFuture + Send>;

struct NamedProcess {
    name: String,
    process: AppProcess,
}

pub struct Runner {
    app_processes: Vec<NamedProcess>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    shutdown_timeout: Duration,
    cancellation_token: CancellationToken,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    /// Closer timeout 10s, shutdown timeout 15s, no processes or closers.
    pub fn new() -> Self {
        Self {
            app_processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(15),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Adds a named app process. If any process returns an error, all
    /// processes are cancelled.
    pub fn with_named_process<F, Fut>(mut self, name: impl Into<String>, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.app_processes.push(NamedProcess {
            name: name.into(),
            process: Box::new(|token| Box::pin(process(token))),
        });
        self
    }

    /// Adds a closer. All closers run, even if some fail.
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.closers.push(Box::new(|| Box::pin(closer())));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// How long processes may take to stop once cancelled before they are aborted.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets a custom cancellation token, allowing external control over shutdown.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Runs until shutdown and exits the process: code 0 on a clean stop,
    /// code 1 if any process failed.
    pub async fn run(self) {
        spawn_signal_handlers(self.cancellation_token.clone());

        match self.run_until_stopped().await {
            Ok(()) => {
                tracing::info!("application exiting normally");
                std::process::exit(0);
            }
            Err(err) => {
                tracing::error!("application exiting with error: {:#}", err);
                std::process::exit(1);
            }
        }
    }

    /// Runs all processes until the token is cancelled or one of them fails,
    /// then waits for the rest and runs closers. Returns the first process error.
    pub async fn run_until_stopped(self) -> Result<(), anyhow::Error> {
        let token = self.cancellation_token;
        let mut join_set = JoinSet::new();

        for NamedProcess { name, process } in self.app_processes {
            let process_token = token.clone();
            tracing::debug!(process = %name, "starting app process");
            join_set.spawn(async move { (name, process(process_token).await) });
        }

        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    tracing::info!(process = %name, "app process stopped");
                }
                Ok((name, Err(err))) => {
                    tracing::error!(process = %name, "app process error: {:#}", err);
                    if first_error.is_none() {
                        first_error = Some(err.context(format!("process {name} failed")));
                    }
                }
                Err(err) => {
                    tracing::error!("app process panicked: {}", err);
                    if first_error.is_none() {
                        first_error = Some(anyhow::anyhow!("app process panicked: {err}"));
                    }
                }
            }

            if !token.is_cancelled() {
                tracing::info!("app process finished, shutting down the remaining processes");
                token.cancel();
            }

            if !join_set.is_empty() {
                break;
            }
        }

        Self::wait_for_processes(&mut join_set, self.shutdown_timeout).await;
        Self::run_closers_with_timeout(self.closers, self.closer_timeout).await;

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Lets cancelled processes finish within the timeout, aborting stragglers.
    async fn wait_for_processes(
        join_set: &mut JoinSet<(String, Result<(), anyhow::Error>)>,
        timeout: Duration,
    ) {
        if join_set.is_empty() {
            return;
        }

        let waited = tokio::time::timeout(timeout, async {
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((name, Ok(()))) => tracing::info!(process = %name, "app process stopped"),
                    Ok((name, Err(err))) => {
                        tracing::error!(process = %name, "app process error during shutdown: {:#}", err)
                    }
                    Err(err) => tracing::error!("app process panicked: {}", err),
                }
            }
        })
        .await;

        if waited.is_err() {
            tracing::warn!(
                remaining = join_set.len(),
                "app processes did not stop within {:?}, aborting",
                timeout
            );
            join_set.shutdown().await;
        }
    }

    async fn run_closers_with_timeout(closers: Vec<Closer>, timeout: Duration) {
        if closers.is_empty() {
            return;
        }

        tracing::info!("running closers with timeout of {:?}", timeout);
        match tokio::time::timeout(timeout, Self::run_closers(closers)).await {
            Ok(()) => tracing::info!("all closers completed"),
            Err(_) => tracing::error!("closers timed out after {:?}", timeout),
        }
    }

    /// Runs all closers concurrently.
    async fn run_closers(closers: Vec<Closer>) {
        let mut closer_set = JoinSet::new();

        for closer in closers {
            closer_set.spawn(async move { closer().await });
        }

        while let Some(result) = closer_set.join_next().await {
            match result {
                Ok(Ok(())) => {
                    tracing::debug!("closer completed successfully");
                }
                Ok(Err(err)) => {
                    tracing::error!("closer error: {:#}", err);
                }
                Err(err) => {
                    tracing::error!("closer panicked: {}", err);
                }
            }
        }
    }
}

fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("received shutdown signal");
                ctrl_c_token.cancel();
            }
            Err(err) => {
                tracing::error!("error setting up signal handler: {}", err);
            }
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::spawn(async move {
                    sigterm.recv().await;
                    tracing::info!("received SIGTERM signal");
                    token.cancel();
                });
            }
            Err(err) => {
                tracing::error!("error setting up SIGTERM handler: {}", err);
            }
        }
    }
}
