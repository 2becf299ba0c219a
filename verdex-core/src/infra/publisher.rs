//! Queue publishing and the in-process event bus.
//!
//! [`ExptPublisher`] is what the engine writes to; [`ExptEventSource`] is
//! what worker pools read from. Any at-least-once broker can implement the
//! pair. [`InProcExptBus`] implements both over tokio channels and is the
//! single-process deployment and test transport, not a test double.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

use crate::error::{ExptError, Result};
use verdex_model::{ItemEvalEvent, ScheduleEvent};

#[async_trait]
pub trait ExptPublisher: Send + Sync {
    async fn publish_schedule(
        &self,
        event: ScheduleEvent,
        delay: Option<Duration>,
    ) -> Result<()>;

    async fn publish_item(
        &self,
        event: ItemEvalEvent,
        delay: Option<Duration>,
    ) -> Result<()>;

    async fn batch_publish_items(
        &self,
        events: Vec<ItemEvalEvent>,
        delay: Option<Duration>,
    ) -> Result<()> {
        for event in events {
            self.publish_item(event, delay).await?;
        }
        Ok(())
    }
}

/// Consumer side of the queue, dequeued by worker pools.
#[async_trait]
pub trait ExptEventSource: Send + Sync {
    /// Next schedule event; `None` once the queue is closed.
    async fn next_schedule(&self) -> Option<ScheduleEvent>;
    /// Next item event; `None` once the queue is closed.
    async fn next_item(&self) -> Option<ItemEvalEvent>;
}

/// Current queue depths, for the daemon's periodic log line and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepths {
    pub schedule: usize,
    pub item: usize,
}

struct BusChannels {
    schedule_tx: mpsc::UnboundedSender<ScheduleEvent>,
    item_tx: mpsc::UnboundedSender<ItemEvalEvent>,
    schedule_rx: Mutex<mpsc::UnboundedReceiver<ScheduleEvent>>,
    item_rx: Mutex<mpsc::UnboundedReceiver<ItemEvalEvent>>,
}

/// In-process at-least-once queue. Delayed publishes are spawned sleeps,
/// mirroring a broker's delayed-delivery feature.
#[derive(Clone)]
pub struct InProcExptBus {
    channels: Arc<BusChannels>,
}

impl std::fmt::Debug for InProcExptBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcExptBus").finish()
    }
}

impl Default for InProcExptBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcExptBus {
    pub fn new() -> Self {
        let (schedule_tx, schedule_rx) = mpsc::unbounded_channel();
        let (item_tx, item_rx) = mpsc::unbounded_channel();
        Self {
            channels: Arc::new(BusChannels {
                schedule_tx,
                item_tx,
                schedule_rx: Mutex::new(schedule_rx),
                item_rx: Mutex::new(item_rx),
            }),
        }
    }

    pub async fn snapshot(&self) -> QueueDepths {
        QueueDepths {
            schedule: self.channels.schedule_rx.lock().await.len(),
            item: self.channels.item_rx.lock().await.len(),
        }
    }
}

fn send_err<E>(_: E) -> ExptError {
    ExptError::Publish("event bus closed".to_string())
}

#[async_trait]
impl ExptPublisher for InProcExptBus {
    async fn publish_schedule(
        &self,
        event: ScheduleEvent,
        delay: Option<Duration>,
    ) -> Result<()> {
        match delay.filter(|d| !d.is_zero()) {
            Some(delay) => {
                let tx = self.channels.schedule_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(event);
                });
                Ok(())
            }
            None => self.channels.schedule_tx.send(event).map_err(send_err),
        }
    }

    async fn publish_item(
        &self,
        event: ItemEvalEvent,
        delay: Option<Duration>,
    ) -> Result<()> {
        match delay.filter(|d| !d.is_zero()) {
            Some(delay) => {
                let tx = self.channels.item_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(event);
                });
                Ok(())
            }
            None => self.channels.item_tx.send(event).map_err(send_err),
        }
    }
}

#[async_trait]
impl ExptEventSource for InProcExptBus {
    async fn next_schedule(&self) -> Option<ScheduleEvent> {
        self.channels.schedule_rx.lock().await.recv().await
    }

    async fn next_item(&self) -> Option<ItemEvalEvent> {
        self.channels.item_rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use verdex_model::{EvalMode, ExptId, ItemId, RunId, Session, SpaceId};

    fn item_event(item: i64) -> ItemEvalEvent {
        ItemEvalEvent {
            expt_id: ExptId(1),
            run_id: RunId(10),
            space_id: SpaceId(7),
            mode: EvalMode::Submit,
            eval_set_item_id: ItemId(item),
            create_at: 0,
            retry_times: 0,
            ext: HashMap::new(),
            session: Session::default(),
        }
    }

    #[tokio::test]
    async fn publish_then_consume_in_order() {
        let bus = InProcExptBus::new();
        bus.batch_publish_items(vec![item_event(101), item_event(102)], None)
            .await
            .unwrap();

        assert_eq!(bus.snapshot().await.item, 2);
        assert_eq!(bus.next_item().await.unwrap().eval_set_item_id, ItemId(101));
        assert_eq!(bus.next_item().await.unwrap().eval_set_item_id, ItemId(102));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_publish_lands_after_the_delay() {
        let bus = InProcExptBus::new();
        bus.publish_item(item_event(101), Some(Duration::from_secs(5)))
            .await
            .unwrap();

        tokio::task::yield_now().await;
        assert_eq!(bus.snapshot().await.item, 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert_eq!(bus.snapshot().await.item, 1);
    }
}
