//! Workspace - 워크스페이스별 발견 항목 집계 캐시
//!
//! `finished` 명령 결과가 들어오면 디바운스 후 한 번만 다시 셉니다.
//! 읽기(`get_counts`)는 watch 채널에서 바로 반환되므로 저장소를 기다리지 않습니다.

mod actor;

use crate::store::FindingsStore;
use crate::supervisor::{self, request, MAILBOX_CAPACITY};
use actor::WorkspaceActor;
use kestrel_foundation::{EventBus, FindingCounts, Result, RuntimeConfig, Topic, WorkspaceId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::warn;

pub(crate) enum WorkspaceMessage {
    Refresh {
        response_tx: oneshot::Sender<Result<FindingCounts>>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

/// 워크스페이스 액터 핸들
#[derive(Clone)]
pub struct WorkspaceHandle {
    workspace_id: WorkspaceId,
    tx: mpsc::Sender<WorkspaceMessage>,
    counts: watch::Receiver<FindingCounts>,
    call_timeout: Duration,
}

impl WorkspaceHandle {
    pub fn workspace_id(&self) -> WorkspaceId {
        self.workspace_id
    }

    /// 캐시된 집계 (블록 없음)
    pub fn get_counts(&self) -> FindingCounts {
        *self.counts.borrow()
    }

    /// 디바운스를 건너뛰고 즉시 다시 셈
    pub async fn refresh_counts(&self) -> Result<FindingCounts> {
        request(&self.tx, "workspace", self.call_timeout * 2, |response_tx| {
            WorkspaceMessage::Refresh { response_tx }
        })
        .await?
    }

    pub async fn shutdown(&self) -> Result<()> {
        request(&self.tx, "workspace", self.call_timeout, |response_tx| {
            WorkspaceMessage::Shutdown { response_tx }
        })
        .await
    }

    pub fn watch(&self) -> watch::Receiver<FindingCounts> {
        self.counts.clone()
    }
}

/// 워크스페이스 액터 의존성
pub struct WorkspaceContext {
    pub workspace_id: WorkspaceId,
    pub config: Arc<RuntimeConfig>,
    pub store: Arc<dyn FindingsStore>,
    pub bus: Arc<EventBus>,
}

/// 초기 집계를 마친 뒤 액터 실행
///
/// 구독을 먼저 열고 나서 세므로 그 사이에 끝난 명령도 놓치지 않습니다.
/// 저장소가 실패하면 0으로 시작하고 디바운스 재집계를 예약합니다.
pub async fn spawn_workspace(ctx: WorkspaceContext) -> (WorkspaceHandle, JoinHandle<()>) {
    let workspace_id = ctx.workspace_id;
    let subscription = ctx.bus.subscribe(Topic::workspace(workspace_id));

    let wait = ctx.config.call_timeout();
    let (initial, recount_pending) =
        match tokio::time::timeout(wait, ctx.store.count_findings(workspace_id)).await {
            Ok(Ok(counts)) => (counts, false),
            Ok(Err(e)) => {
                warn!(workspace_id = %workspace_id, error = %e, "Initial finding count failed, starting from zero");
                (FindingCounts::default(), true)
            }
            Err(_) => {
                warn!(workspace_id = %workspace_id, "Initial finding count timed out, starting from zero");
                (FindingCounts::default(), true)
            }
        };

    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let (counts_tx, counts_rx) = watch::channel(initial);
    let counts_tx = Arc::new(counts_tx);

    let handle = WorkspaceHandle {
        workspace_id,
        tx,
        counts: counts_rx,
        call_timeout: wait,
    };

    let first = parking_lot::Mutex::new(Some(subscription));
    let max_restarts = ctx.config.max_actor_restarts;
    let supervisor = supervisor::supervise(rx, max_restarts, move |incarnation| {
        // 재기동이면 새로 구독하고, 놓친 이벤트가 있을 수 있으므로 다시 셈
        let (subscription, recount) = match first.lock().take() {
            Some(subscription) if !incarnation.is_recovery() => (subscription, recount_pending),
            _ => (ctx.bus.subscribe(Topic::workspace(workspace_id)), true),
        };
        WorkspaceActor::new(&ctx, Arc::clone(&counts_tx), subscription, recount)
    });

    (handle, supervisor)
}
