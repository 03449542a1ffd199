//! Periodic job scheduler
//!
//! An explicit object owning every registered job loop; nothing lives in
//! global state. Each job runs on a fixed interval. A tick that arrives
//! while the previous run is still in flight is skipped with a log line,
//! never queued, so a slow batch cannot stack overlapping runs. Job errors
//! are logged and swallowed; one failed tick never affects the next.
//!
//! Shutdown stops scheduling new ticks and waits for in-flight runs to
//! finish.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    loops: Vec<(String, JoinHandle<()>)>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            loops: Vec::new(),
        }
    }

    /// Register a job to run every `period`, starting one period from now
    pub fn register<F>(&mut self, name: &str, period: Duration, job: F)
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let job = Arc::new(job);
        let job_name = name.to_string();

        info!("Scheduled job '{}' every {:?}", name, period);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately on the first tick
            ticker.tick().await;

            let mut current: Option<JoinHandle<()>> = None;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(running) = &current
                            && !running.is_finished()
                        {
                            info!("Job '{}' still running, skipping this tick", job_name);
                            continue;
                        }
                        let job = job.clone();
                        let name = job_name.clone();
                        current = Some(tokio::spawn(async move {
                            debug!("Job '{}' starting", name);
                            if let Err(e) = job().await {
                                error!("Job '{}' failed: {:#}", name, e);
                            }
                        }));
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            // Let an in-flight run finish before the loop exits
            if let Some(running) = current.take()
                && running.await.is_err()
            {
                warn!("Job '{}' panicked during shutdown", job_name);
            }
        });
        self.loops.push((name.to_string(), handle));
    }

    /// Stop scheduling and wait for every in-flight run to complete
    pub async fn shutdown(self) {
        info!("Scheduler shutting down, waiting for in-flight jobs");
        let _ = self.shutdown_tx.send(true);
        for (name, handle) in self.loops {
            if handle.await.is_err() {
                warn!("Job loop '{}' panicked", name);
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
