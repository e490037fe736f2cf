//! Container - 컨테이너 하나의 생명주기 액터
//!
//! - `state.rs`: 상태 전이 표
//! - `actor.rs`: 헬스 체크, 백오프 재시작, 콘솔 통지
//!
//! 외부에서는 [`ContainerHandle`]로만 접근합니다.

mod actor;
mod state;

pub use state::{transition, ContainerTransition};

use crate::adapter::{ContainerAdapter, ContainerRef, ContainerSpec};
use crate::console::ConsoleHandle;
use crate::supervisor::{self, request, MAILBOX_CAPACITY};
use actor::ContainerActor;
use chrono::{DateTime, Utc};
use kestrel_foundation::{ContainerStatus, EventBus, Result, RuntimeConfig, Scope, TrackId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// 생명주기 호출 응답 대기 = call_timeout × 이 값
///
/// stop은 콘솔 통지와 프로세스 정지를, start는 진행 중인 기동 뒤에서 대기할 수 있습니다.
const LIFECYCLE_TIMEOUT_FACTOR: u32 = 6;

// ============================================================================
// Snapshot
// ============================================================================

/// 컨테이너 상태 스냅샷 (watch 채널로 공유)
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSnapshot {
    pub scope: Scope,
    pub slug: String,
    pub status: ContainerStatus,
    /// 현재 장애 구간의 재시작 횟수
    pub restart_count: u32,
    /// 전체 재시작 횟수 (통계)
    pub total_restarts: u32,
    pub consecutive_failures: u32,
    /// 다음 실패 시 대기할 백오프
    pub next_backoff_ms: u64,
    pub container: Option<ContainerRef>,
    pub endpoint_host: Option<String>,
    pub last_error: Option<String>,
    pub consoles: usize,
    pub updated_at: DateTime<Utc>,
}

impl ContainerSnapshot {
    fn initial(scope: Scope, slug: &str, base_backoff_ms: u64) -> Self {
        Self {
            scope,
            slug: slug.to_string(),
            status: ContainerStatus::Stopped,
            restart_count: 0,
            total_restarts: 0,
            consecutive_failures: 0,
            next_backoff_ms: base_backoff_ms,
            container: None,
            endpoint_host: None,
            last_error: None,
            consoles: 0,
            updated_at: Utc::now(),
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

pub(crate) enum ContainerMessage {
    Start {
        response_tx: oneshot::Sender<Result<()>>,
    },
    Stop {
        response_tx: oneshot::Sender<Result<()>>,
    },
    Restart {
        response_tx: oneshot::Sender<Result<()>>,
    },
    AttachConsole {
        track_id: TrackId,
        console: ConsoleHandle,
        response_tx: oneshot::Sender<()>,
    },
    DetachConsole {
        track_id: TrackId,
        response_tx: oneshot::Sender<Option<ConsoleHandle>>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

// ============================================================================
// Handle
// ============================================================================

/// 컨테이너 액터 핸들
#[derive(Clone)]
pub struct ContainerHandle {
    scope: Scope,
    tx: mpsc::Sender<ContainerMessage>,
    snapshot: watch::Receiver<ContainerSnapshot>,
    call_timeout: Duration,
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("scope", &self.scope)
            .field("status", &self.snapshot.borrow().status)
            .finish_non_exhaustive()
    }
}

impl ContainerHandle {
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// `stopped`/`failed`에서 시작 (실패 카운터 초기화)
    ///
    /// 상태가 `starting`으로 바뀌면 바로 반환하고, 기동은 액터가 이어서 진행합니다.
    pub async fn start(&self) -> Result<()> {
        request(&self.tx, "container", self.lifecycle_timeout(), |response_tx| {
            ContainerMessage::Start { response_tx }
        })
        .await?
    }

    /// 정지 (멱등)
    pub async fn stop(&self) -> Result<()> {
        request(&self.tx, "container", self.lifecycle_timeout(), |response_tx| {
            ContainerMessage::Stop { response_tx }
        })
        .await?
    }

    /// `running`/`unhealthy`에서 즉시 재시작
    pub async fn restart(&self) -> Result<()> {
        request(&self.tx, "container", self.lifecycle_timeout(), |response_tx| {
            ContainerMessage::Restart { response_tx }
        })
        .await?
    }

    /// 콘솔 연결 (컨테이너가 running이면 즉시 endpoint 전달)
    pub async fn attach_console(&self, track_id: TrackId, console: ConsoleHandle) -> Result<()> {
        request(&self.tx, "container", self.call_timeout, |response_tx| {
            ContainerMessage::AttachConsole {
                track_id,
                console,
                response_tx,
            }
        })
        .await
    }

    pub async fn detach_console(&self, track_id: TrackId) -> Result<Option<ConsoleHandle>> {
        request(&self.tx, "container", self.call_timeout, |response_tx| {
            ContainerMessage::DetachConsole {
                track_id,
                response_tx,
            }
        })
        .await
    }

    /// 프로세스를 정지하고 액터 종료
    pub async fn shutdown(&self) -> Result<()> {
        request(&self.tx, "container", self.lifecycle_timeout(), |response_tx| {
            ContainerMessage::Shutdown { response_tx }
        })
        .await
    }

    /// 최근 스냅샷 (블록 없음)
    pub fn snapshot(&self) -> ContainerSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> ContainerStatus {
        self.snapshot.borrow().status
    }

    /// 스냅샷 변경 구독
    pub fn watch(&self) -> watch::Receiver<ContainerSnapshot> {
        self.snapshot.clone()
    }

    fn lifecycle_timeout(&self) -> Duration {
        self.call_timeout * LIFECYCLE_TIMEOUT_FACTOR
    }
}

// ============================================================================
// Spawn
// ============================================================================

/// 컨테이너 액터 의존성
pub struct ContainerContext {
    pub scope: Scope,
    pub spec: ContainerSpec,
    pub rpc_password: String,
    pub config: Arc<RuntimeConfig>,
    pub adapter: Arc<dyn ContainerAdapter>,
    pub bus: Arc<EventBus>,
}

/// 감시 하에 컨테이너 액터 실행 (초기 상태 `stopped`)
pub fn spawn_container(ctx: ContainerContext) -> (ContainerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let initial =
        ContainerSnapshot::initial(ctx.scope, &ctx.spec.slug, ctx.config.restart_base_backoff_ms);
    let (snapshot_tx, snapshot_rx) = watch::channel(initial);
    let snapshot_tx = Arc::new(snapshot_tx);
    let consoles = Arc::new(parking_lot::Mutex::new(BTreeMap::new()));

    let handle = ContainerHandle {
        scope: ctx.scope,
        tx,
        snapshot: snapshot_rx,
        call_timeout: ctx.config.call_timeout(),
    };

    let max_restarts = ctx.config.max_actor_restarts;
    let supervisor = supervisor::supervise(rx, max_restarts, move |incarnation| {
        let recovered = incarnation
            .is_recovery()
            .then(|| snapshot_tx.borrow().clone());
        ContainerActor::new(&ctx, Arc::clone(&snapshot_tx), Arc::clone(&consoles), recovered)
    });

    (handle, supervisor)
}
