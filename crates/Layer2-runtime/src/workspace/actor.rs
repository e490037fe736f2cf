//! Workspace Actor
//!
//! 디바운스 타이머는 하나만 존재합니다. 첫 `finished` 이벤트가 타이머를 걸고,
//! 그 창 안에 들어온 이벤트는 같은 재집계에 합쳐집니다. 타이머를 미루지 않으므로
//! 이벤트가 계속 들어와도 집계는 창 하나 이상 늦어지지 않습니다.

use super::{WorkspaceContext, WorkspaceMessage};
use crate::store::{FindingsStore, StoreError};
use crate::supervisor::{arm, bounded, fired, reply, Actor, Timer};
use async_trait::async_trait;
use kestrel_foundation::{
    CommandStatus, Event, EventBus, FindingCounts, Result, RuntimeConfig, Subscription, WorkspaceId,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

enum Wake {
    Message(Option<WorkspaceMessage>),
    Event(Option<Arc<Event>>),
    Recount,
}

pub(super) struct WorkspaceActor {
    workspace_id: WorkspaceId,
    config: Arc<RuntimeConfig>,
    store: Arc<dyn FindingsStore>,
    bus: Arc<EventBus>,
    counts_tx: Arc<watch::Sender<FindingCounts>>,
    events: Subscription,
    debounce: Timer,
}

impl WorkspaceActor {
    pub(super) fn new(
        ctx: &WorkspaceContext,
        counts_tx: Arc<watch::Sender<FindingCounts>>,
        events: Subscription,
        recount_pending: bool,
    ) -> Self {
        let debounce = recount_pending.then(|| ctx.config.debounce_window());
        Self {
            workspace_id: ctx.workspace_id,
            config: Arc::clone(&ctx.config),
            store: Arc::clone(&ctx.store),
            bus: Arc::clone(&ctx.bus),
            counts_tx,
            events,
            debounce: debounce.and_then(arm),
        }
    }

    fn on_event(&mut self, event: &Event) {
        let Some(command) = event.completed_command() else {
            return;
        };
        if command.status != CommandStatus::Finished
            || command.scope.workspace_id != self.workspace_id
        {
            return;
        }

        if self.debounce.is_some() {
            debug!(workspace_id = %self.workspace_id, command_id = %command.id, "Joined pending recount");
            return;
        }
        debug!(workspace_id = %self.workspace_id, command_id = %command.id, "Recount scheduled");
        self.debounce = arm(self.config.debounce_window());
    }

    async fn count(&self) -> std::result::Result<FindingCounts, StoreError> {
        let wait = self.config.call_timeout();
        let timed_out = StoreError::Unavailable("count timed out".to_string());
        bounded(wait, timed_out, self.store.count_findings(self.workspace_id)).await
    }

    /// 다시 세고 바뀐 카테고리가 있으면 `DatabaseUpdated` 발행
    async fn recount(&mut self) -> Result<FindingCounts> {
        let counts = match self.count().await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(workspace_id = %self.workspace_id, error = %e, "Finding recount failed, keeping previous counts");
                return Err(e.into());
            }
        };

        let previous = *self.counts_tx.borrow();
        let changes = counts.changes_since(&previous);
        self.counts_tx.send_replace(counts);

        if !changes.is_empty() {
            info!(
                workspace_id = %self.workspace_id,
                changed = changes.len(),
                total = counts.total,
                "Findings updated"
            );
            self.bus
                .publish(Event::database_updated(self.workspace_id, changes, counts));
        }
        Ok(counts)
    }
}

#[async_trait]
impl Actor for WorkspaceActor {
    type Message = WorkspaceMessage;

    fn name(&self) -> String {
        format!("workspace:{}", self.workspace_id)
    }

    async fn run(mut self, inbox: &mut mpsc::Receiver<WorkspaceMessage>) {
        loop {
            let wake = tokio::select! {
                msg = inbox.recv() => Wake::Message(msg),
                event = self.events.recv() => Wake::Event(event),
                _ = fired(&mut self.debounce) => Wake::Recount,
            };

            match wake {
                Wake::Message(Some(WorkspaceMessage::Refresh { response_tx })) => {
                    self.debounce = None;
                    let result = self.recount().await;
                    reply(response_tx, result);
                }
                Wake::Message(Some(WorkspaceMessage::Shutdown { response_tx })) => {
                    reply(response_tx, ());
                    break;
                }
                Wake::Message(None) => break,
                Wake::Event(Some(event)) => self.on_event(&event),
                Wake::Event(None) => {
                    warn!(workspace_id = %self.workspace_id, "Event bus closed");
                    break;
                }
                Wake::Recount => {
                    self.debounce = None;
                    let _ = self.recount().await;
                }
            }
        }

        debug!(workspace_id = %self.workspace_id, "Workspace actor exited");
    }
}
