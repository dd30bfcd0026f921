//! Watchdog "kicker": periodic status queries that keep the device's
//! communication-timeout counter from tripping during long fire sequences.
//!
//! The kicker only reads status; it never changes device state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use ujlaser_core::error::LaserError;

use crate::controller::ControllerInner;

/// Running kicker task.
pub(crate) struct Kicker {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: JoinHandle<()>,
}

impl Kicker {
    pub(crate) fn spawn(inner: Arc<ControllerInner>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            info!(?interval, "kicker started");
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        match inner.query_status().await {
                            Ok(status) => {
                                debug!(status = status.encode(), "kicker status");
                                *inner.last_kicker_status.lock() = Some(status);
                            }
                            Err(LaserError::NotConnected) => {
                                warn!("kicker stopping: link closed");
                                break;
                            }
                            Err(e) => warn!(error = %e, "kicker status query failed"),
                        }
                    }
                }
            }
            info!("kicker stopped");
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            task_handle,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }

    /// Signal the task to stop. Any query already in flight completes first.
    pub(crate) fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
