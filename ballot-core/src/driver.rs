//! Wall-clock tick driver
//!
//! Nodes only advance time when ticked. A [`Ticker`] ticks a set of nodes on
//! a tokio interval until it is stopped.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::raft::RaftNode;

pub struct Ticker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Ticker {
    /// Tick every node in `nodes` once per `interval`
    pub fn spawn(nodes: Vec<RaftNode>, interval: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        for node in &nodes {
                            if let Err(e) = node.tick().await {
                                warn!(node_id = %node.id(), error = %e, "Tick failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Ticker shutting down");
                        break;
                    }
                }
            }
        });

        Self { shutdown, handle }
    }

    /// Stop ticking and wait for the driver task to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}
