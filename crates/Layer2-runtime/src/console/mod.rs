//! Console - 트랙 하나의 콘솔 세션 액터
//!
//! - `state.rs`: 명령 수락 규칙
//! - `history.rs`: 히스토리 블록
//! - `actor.rs`: 연결, 명령 직렬화, 출력 폴링, 재연결
//!
//! 한 번에 하나의 명령만 실행됩니다 (`idle → busy → idle`).

mod actor;
mod history;
mod state;

pub use history::{ConsoleHistory, HistoryBlock};
pub use state::check_submit;

use crate::rpc::{RpcClient, RpcEndpoint};
use crate::supervisor::{self, request, tell, MAILBOX_CAPACITY};
use actor::ConsoleActor;
use chrono::{DateTime, Utc};
use kestrel_foundation::{
    CommandExecution, CommandId, CommandSource, ConsoleStatus, EventBus, Result, RuntimeConfig,
    Scope,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// 응답 대기 = call_timeout × 이 값 (진행 중인 연결 시도 뒤에서 대기할 수 있음)
const REPLY_TIMEOUT_FACTOR: u32 = 4;

// ============================================================================
// Snapshot
// ============================================================================

/// 콘솔 상태 스냅샷
#[derive(Debug, Clone, Serialize)]
pub struct ConsoleSnapshot {
    pub scope: Scope,
    pub status: ConsoleStatus,
    pub prompt: String,
    /// offline/not_registered 사유
    pub reason: Option<String>,
    /// offline일 때 자동 재연결 중인지
    pub retrying: bool,
    pub active_command: Option<CommandExecution>,
    pub reconnect_attempts: u32,
    pub history_len: usize,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) endpoint: Option<RpcEndpoint>,
}

impl ConsoleSnapshot {
    fn initial(scope: Scope) -> Self {
        Self {
            scope,
            status: ConsoleStatus::Initializing,
            prompt: String::new(),
            reason: None,
            retrying: true,
            active_command: None,
            reconnect_attempts: 0,
            history_len: 0,
            updated_at: Utc::now(),
            endpoint: None,
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

pub(crate) enum ConsoleMessage {
    Submit {
        text: String,
        source: CommandSource,
        response_tx: oneshot::Sender<Result<CommandId>>,
    },
    ContainerReady {
        endpoint: RpcEndpoint,
    },
    ContainerDown {
        reason: String,
        retrying: bool,
        response_tx: oneshot::Sender<()>,
    },
    Reconnect {
        response_tx: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

// ============================================================================
// Handle
// ============================================================================

/// 콘솔 액터 핸들
#[derive(Clone)]
pub struct ConsoleHandle {
    scope: Scope,
    tx: mpsc::Sender<ConsoleMessage>,
    snapshot: watch::Receiver<ConsoleSnapshot>,
    history: Arc<parking_lot::Mutex<ConsoleHistory>>,
    call_timeout: Duration,
}

impl std::fmt::Debug for ConsoleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleHandle")
            .field("scope", &self.scope)
            .field("status", &self.snapshot.borrow().status)
            .finish_non_exhaustive()
    }
}

impl ConsoleHandle {
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// 명령 실행 요청
    ///
    /// `idle`이 아니면 즉시 거절됩니다. 수락되면 명령 ID를 반환하고,
    /// 결과는 `CommandResult` 이벤트로 전달됩니다.
    pub async fn submit(&self, text: impl Into<String>, source: CommandSource) -> Result<CommandId> {
        let text = text.into();
        request(&self.tx, "console", self.reply_timeout(), |response_tx| {
            ConsoleMessage::Submit {
                text,
                source,
                response_tx,
            }
        })
        .await?
    }

    /// 컨테이너가 running이 됨
    pub async fn container_ready(&self, endpoint: RpcEndpoint) -> Result<()> {
        tell(
            &self.tx,
            "console",
            self.call_timeout,
            ConsoleMessage::ContainerReady { endpoint },
        )
        .await
    }

    /// 컨테이너가 내려감 (콘솔이 offline으로 전환한 뒤 응답)
    pub async fn container_down(&self, reason: String, retrying: bool) -> Result<()> {
        request(&self.tx, "console", self.call_timeout, |response_tx| {
            ConsoleMessage::ContainerDown {
                reason,
                retrying,
                response_tx,
            }
        })
        .await
    }

    /// `offline`에서 재연결 예산을 초기화하고 다시 연결
    pub async fn reconnect(&self) -> Result<()> {
        request(&self.tx, "console", self.reply_timeout(), |response_tx| {
            ConsoleMessage::Reconnect { response_tx }
        })
        .await?
    }

    /// 원격 콘솔을 정리하고 액터 종료
    pub async fn shutdown(&self) -> Result<()> {
        request(&self.tx, "console", self.reply_timeout(), |response_tx| {
            ConsoleMessage::Shutdown { response_tx }
        })
        .await
    }

    /// 최근 스냅샷 (블록 없음)
    pub fn snapshot(&self) -> ConsoleSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> ConsoleStatus {
        self.snapshot.borrow().status
    }

    pub fn watch(&self) -> watch::Receiver<ConsoleSnapshot> {
        self.snapshot.clone()
    }

    /// 히스토리 블록 복사본
    pub fn history(&self) -> Vec<HistoryBlock> {
        self.history.lock().blocks().to_vec()
    }

    fn reply_timeout(&self) -> Duration {
        self.call_timeout * REPLY_TIMEOUT_FACTOR
    }
}

// ============================================================================
// Spawn
// ============================================================================

/// 콘솔 액터 의존성
pub struct ConsoleContext {
    pub scope: Scope,
    pub config: Arc<RuntimeConfig>,
    pub rpc: Arc<dyn RpcClient>,
    pub bus: Arc<EventBus>,
}

/// 감시 하에 콘솔 액터 실행 (초기 상태 `initializing`)
pub fn spawn_console(ctx: ConsoleContext) -> (ConsoleHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let (snapshot_tx, snapshot_rx) = watch::channel(ConsoleSnapshot::initial(ctx.scope));
    let snapshot_tx = Arc::new(snapshot_tx);
    let history = Arc::new(parking_lot::Mutex::new(ConsoleHistory::new()));

    let handle = ConsoleHandle {
        scope: ctx.scope,
        tx,
        snapshot: snapshot_rx,
        history: Arc::clone(&history),
        call_timeout: ctx.config.call_timeout(),
    };

    let max_restarts = ctx.config.max_actor_restarts;
    let supervisor = supervisor::supervise(rx, max_restarts, move |incarnation| {
        let recovered = incarnation
            .is_recovery()
            .then(|| snapshot_tx.borrow().clone());
        ConsoleActor::new(&ctx, Arc::clone(&snapshot_tx), Arc::clone(&history), recovered)
    });

    (handle, supervisor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcError;
    use crate::testing::{ScriptedRpc, SCRIPTED_BANNER, SCRIPTED_PROMPT};
    use kestrel_foundation::{CommandStatus, ContainerId, Error, TrackId, WorkspaceId};

    fn scope() -> Scope {
        Scope::track(WorkspaceId(1), ContainerId(1), TrackId(1))
    }

    fn endpoint() -> RpcEndpoint {
        RpcEndpoint::new("10.0.0.1", 55553, "s3cret")
    }

    fn spawn(rpc: &Arc<ScriptedRpc>) -> ConsoleHandle {
        let (handle, _task) = spawn_console(ConsoleContext {
            scope: scope(),
            config: Arc::new(RuntimeConfig::fast()),
            rpc: Arc::clone(rpc) as Arc<dyn RpcClient>,
            bus: Arc::new(EventBus::new()),
        });
        handle
    }

    async fn connected(rpc: &Arc<ScriptedRpc>) -> ConsoleHandle {
        let console = spawn(rpc);
        console.container_ready(endpoint()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(console.status(), ConsoleStatus::Idle);
        console
    }

    fn commands(console: &ConsoleHandle) -> Vec<(String, CommandStatus)> {
        console
            .history()
            .into_iter()
            .filter_map(|block| match block {
                HistoryBlock::Command {
                    command, status, ..
                } => Some((command, status)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_banner_becomes_startup_block() {
        let rpc = Arc::new(ScriptedRpc::new());
        let console = connected(&rpc).await;

        assert_eq!(console.snapshot().prompt, SCRIPTED_PROMPT);
        match &console.history()[0] {
            HistoryBlock::Startup { output, prompt, .. } => {
                assert_eq!(output, SCRIPTED_BANNER);
                assert_eq!(prompt, SCRIPTED_PROMPT);
            }
            other => panic!("unexpected block {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_before_ready_is_starting() {
        let rpc = Arc::new(ScriptedRpc::new());
        let console = spawn(&rpc);

        let err = console.submit("hosts", CommandSource::User).await.unwrap_err();
        assert_eq!(err.code(), "console_starting");
        assert!(rpc.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_rejects_second_command() {
        let rpc = Arc::new(ScriptedRpc::new());
        rpc.hang("db_nmap -sV 10.0.0.0/24");
        let console = connected(&rpc).await;

        console
            .submit("db_nmap -sV 10.0.0.0/24", CommandSource::Agent)
            .await
            .unwrap();
        assert_eq!(console.status(), ConsoleStatus::Busy);

        let err = console.submit("hosts", CommandSource::User).await.unwrap_err();
        assert!(matches!(err, Error::ConsoleBusy));
        assert_eq!(rpc.writes(), vec!["db_nmap -sV 10.0.0.0/24\n".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_follows_acceptance_order() {
        let rpc = Arc::new(ScriptedRpc::new());
        rpc.respond("services", &["port ", "proto ", "name\n"]);
        let console = connected(&rpc).await;

        console.submit("services", CommandSource::User).await.unwrap();
        assert!(console.submit("hosts", CommandSource::User).await.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;

        console.submit("hosts", CommandSource::User).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            commands(&console),
            vec![
                ("services".to_string(), CommandStatus::Finished),
                ("hosts".to_string(), CommandStatus::Finished),
            ]
        );
        match &console.history()[1] {
            HistoryBlock::Command { output, prompt, .. } => {
                assert_eq!(output, "port proto name\n");
                assert_eq!(prompt, SCRIPTED_PROMPT);
            }
            other => panic!("unexpected block {:?}", other),
        }
        assert_eq!(console.status(), ConsoleStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_change_applies_to_next_command() {
        const HANDLER_PROMPT: &str = "msf6 exploit(multi/handler) > ";
        let rpc = Arc::new(ScriptedRpc::new());
        let console = connected(&rpc).await;

        rpc.set_prompt(HANDLER_PROMPT);
        console.submit("use exploit/multi/handler", CommandSource::User).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(console.snapshot().prompt, HANDLER_PROMPT);

        console.submit("show options", CommandSource::User).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // 블록의 프롬프트는 명령을 받기 직전의 것
        let prompts: Vec<String> = console
            .history()
            .into_iter()
            .filter_map(|block| match block {
                HistoryBlock::Command { prompt, .. } => Some(prompt),
                _ => None,
            })
            .collect();
        assert_eq!(prompts, vec![SCRIPTED_PROMPT.to_string(), HANDLER_PROMPT.to_string()]);

        // idle 콘솔은 읽지 않음
        let reads = rpc.read_count();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rpc.read_count(), reads);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_command_is_rejected() {
        let rpc = Arc::new(ScriptedRpc::new());
        let console = connected(&rpc).await;

        let err = console.submit("  \n", CommandSource::User).await.unwrap_err();
        assert_eq!(err.code(), "invalid_input");
        assert_eq!(console.status(), ConsoleStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failures_error_the_command() {
        let rpc = Arc::new(ScriptedRpc::new());
        let console = connected(&rpc).await;
        rpc.fail_reads(3, RpcError::Read("malformed response".into()));

        console.submit("vulns", CommandSource::User).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            commands(&console),
            vec![("vulns".to_string(), CommandStatus::Error)]
        );
        assert_eq!(console.status(), ConsoleStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_read_failure_is_retried() {
        let rpc = Arc::new(ScriptedRpc::new());
        let console = connected(&rpc).await;
        rpc.fail_reads(1, RpcError::Read("malformed response".into()));

        console.submit("creds", CommandSource::User).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            commands(&console),
            vec![("creds".to_string(), CommandStatus::Finished)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_container_down_goes_offline() {
        let rpc = Arc::new(ScriptedRpc::new());
        rpc.hang("exploit");
        let console = connected(&rpc).await;
        console.submit("exploit", CommandSource::Agent).await.unwrap();

        console
            .container_down("container stopped".to_string(), false)
            .await
            .unwrap();

        assert_eq!(console.status(), ConsoleStatus::Offline);
        assert_eq!(
            commands(&console),
            vec![("exploit".to_string(), CommandStatus::Error)]
        );
        assert!(console.history().last().map(HistoryBlock::is_restart).unwrap_or(false));

        match console.submit("hosts", CommandSource::User).await.unwrap_err() {
            Error::ConsoleOffline { reason, retrying } => {
                assert_eq!(reason.as_deref(), Some("container stopped"));
                assert!(!retrying);
            }
            other => panic!("unexpected {:?}", other),
        }

        // 컨테이너가 없으면 수동 재연결도 불가
        assert_eq!(console.reconnect().await.unwrap_err().code(), "console_offline");
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_connect_attempts_exhausted() {
        let rpc = Arc::new(ScriptedRpc::new());
        rpc.set_reachable(false);
        let console = spawn(&rpc);
        console.container_ready(endpoint()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(rpc.connect_count(), 3);
        let snapshot = console.snapshot();
        assert_eq!(snapshot.status, ConsoleStatus::Offline);
        assert!(!snapshot.retrying);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_console_is_not_registered() {
        let rpc = Arc::new(ScriptedRpc::new());
        rpc.fail_console_creates(1, RpcError::Protocol("no console slots".into()));
        let console = spawn(&rpc);
        console.container_ready(endpoint()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(console.status(), ConsoleStatus::NotRegistered);
        let err = console.submit("hosts", CommandSource::User).await.unwrap_err();
        assert_eq!(err.code(), "console_not_registered");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(console.status(), ConsoleStatus::Idle);
        // 로그인 세션은 재시도에서 재사용
        assert_eq!(rpc.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_banner_destroys_remote_console() {
        let rpc = Arc::new(ScriptedRpc::new());
        rpc.fail_reads(1, RpcError::Read("malformed response".into()));
        let console = spawn(&rpc);
        console.container_ready(endpoint()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(console.status(), ConsoleStatus::NotRegistered);
        assert_eq!(rpc.destroyed(), vec!["1".to_string()]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(console.status(), ConsoleStatus::Idle);
        assert_eq!(rpc.connect_count(), 1);

        console.shutdown().await.unwrap();
        assert_eq!(rpc.destroyed(), vec!["1".to_string(), "2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_resets_budget() {
        let rpc = Arc::new(ScriptedRpc::new());
        let console = connected(&rpc).await;

        rpc.set_reachable(false);
        let err = console.submit("hosts", CommandSource::User).await.unwrap_err();
        assert_eq!(err.code(), "console_offline");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!console.snapshot().retrying);

        rpc.set_reachable(true);
        console.reconnect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(console.status(), ConsoleStatus::Idle);
        console.submit("hosts", CommandSource::User).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_destroys_remote_console() {
        let rpc = Arc::new(ScriptedRpc::new());
        let console = connected(&rpc).await;

        console.shutdown().await.unwrap();

        assert_eq!(rpc.destroyed(), vec!["1".to_string()]);
        assert_eq!(console.status(), ConsoleStatus::Offline);
        assert_eq!(console.submit("hosts", CommandSource::User).await.unwrap_err().code(), "actor_unavailable");
    }
}
