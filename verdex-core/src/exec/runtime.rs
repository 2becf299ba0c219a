//! Worker pools that feed the two loops from an event source.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{EngineDeps, ExptManager, ItemEvalLoop, SchedulerLoop};
use crate::infra::ExptEventSource;

#[derive(Debug, Clone, Copy)]
pub struct RuntimeConf {
    pub schedule_workers: usize,
    pub item_workers: usize,
}

impl Default for RuntimeConf {
    fn default() -> Self {
        Self {
            schedule_workers: 2,
            item_workers: 4,
        }
    }
}

/// The running engine: both loops behind their worker pools. Dropping the
/// runtime without [`shutdown`](Self::shutdown) detaches the workers; they
/// stop when the event source closes.
pub struct ExptExecRuntime {
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ExptExecRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExptExecRuntime")
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl ExptExecRuntime {
    pub fn start(
        deps: EngineDeps,
        manager: Arc<ExptManager>,
        source: Arc<dyn ExptEventSource>,
        conf: RuntimeConf,
    ) -> Self {
        let scheduler = SchedulerLoop::new(deps.clone(), manager.clone());
        let item_loop = ItemEvalLoop::new(deps, manager);
        let cancel = CancellationToken::new();
        let pid = std::process::id();
        let mut workers =
            Vec::with_capacity(conf.schedule_workers + conf.item_workers);

        for i in 0..conf.schedule_workers {
            let name = format!("sched-{pid}-w{i}");
            let scheduler = scheduler.clone();
            let source = source.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                info!(worker = %name, "schedule worker started");
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = source.next_schedule() => {
                            let Some(event) = event else { break };
                            if let Err(err) = scheduler.handle(event).await {
                                warn!(worker = %name, %err, "schedule pass failed");
                            }
                        }
                    }
                }
                info!(worker = %name, "schedule worker stopped");
            }));
        }

        for i in 0..conf.item_workers {
            let name = format!("item-{pid}-w{i}");
            let item_loop = item_loop.clone();
            let source = source.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                info!(worker = %name, "item worker started");
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = source.next_item() => {
                            let Some(event) = event else { break };
                            if let Err(err) = item_loop.handle(event).await {
                                warn!(worker = %name, %err, "item pass failed");
                            }
                        }
                    }
                }
                info!(worker = %name, "item worker stopped");
            }));
        }

        Self { cancel, workers }
    }

    /// Stop accepting events and wait for in-flight passes to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}
