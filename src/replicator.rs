//! Periodic workers driving one node: router, push, pull and the transport
//! listener. Each worker owns its own timer; a failed cycle is logged and the
//! next tick starts over.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::node::SyncNode;
use crate::{Error, Result};

pub struct Replicator {
    node: Arc<SyncNode>,
}

impl Replicator {
    pub fn new(node: SyncNode) -> Self {
        Self {
            node: Arc::new(node),
        }
    }

    pub fn node(&self) -> &Arc<SyncNode> {
        &self.node
    }

    /// Runs every worker until `shutdown` becomes `true`.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let config = &self.node.config;
        info!(node_id = %config.node.node_id, "Replicator starting");
        let mut workers: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::new();

        let router = self.node.router.clone();
        workers.push((
            "router",
            tokio::spawn(run_worker(
                "router",
                config.router.period(),
                shutdown.clone(),
                move || {
                    let router = router.clone();
                    async move {
                        let summary = router.route().await?;
                        if summary.records_read > 0 {
                            debug!(?summary, "Routing cycle");
                        }
                        Ok(())
                    }
                },
            )),
        ));

        if self.node.topology.push_targets().next().is_some() {
            let push = self.node.push.clone();
            workers.push((
                "push",
                tokio::spawn(run_worker(
                    "push",
                    Duration::from_millis(config.transport.push_period_ms),
                    shutdown.clone(),
                    move || {
                        let push = push.clone();
                        async move {
                            push.push_all().await;
                            Ok(())
                        }
                    },
                )),
            ));
        }

        if self.node.topology.pull_sources().next().is_some() {
            let pull = self.node.pull.clone();
            workers.push((
                "pull",
                tokio::spawn(run_worker(
                    "pull",
                    Duration::from_millis(config.transport.pull_period_ms),
                    shutdown.clone(),
                    move || {
                        let pull = pull.clone();
                        async move {
                            pull.pull_all().await;
                            Ok(())
                        }
                    },
                )),
            ));
        }

        if let Some(addr) = &config.node.listen_addr {
            let listener = TcpListener::bind(addr).await?;
            let server = self.node.server.clone();
            workers.push(("server", tokio::spawn(server.serve(listener, shutdown.clone()))));
        }

        let mut first_error = None;
        for (name, handle) in workers {
            match handle.await {
                Ok(Ok(())) => debug!(worker = name, "Worker stopped"),
                Ok(Err(e)) => {
                    error!(worker = name, error = %e, "Worker failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(worker = name, "Worker panicked: {}", e);
                    first_error.get_or_insert(Error::Shutdown);
                }
            }
        }
        info!("Replicator stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Calls `cycle` on every tick until shutdown. Missed ticks are skipped, so a
/// slow cycle never causes a burst of catch-up cycles.
async fn run_worker<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut cycle: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let _ = shutdown.borrow_and_update();
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(worker = name, period_ms = period.as_millis() as u64, "Worker started");

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(worker = name, "Shutdown signal received");
                    return Ok(());
                }
                continue;
            }

            _ = ticker.tick() => {}
        }

        if let Err(e) = cycle().await {
            if e.is_retryable() {
                warn!(worker = name, error = %e, "Cycle failed, retrying next tick");
            } else {
                error!(worker = name, error = %e, "Cycle failed");
            }
        }
    }
}
