//! Runtime 통합 시나리오 - 컨테이너, 콘솔, 워크스페이스를 함께 구동
//!
//! `cargo test -p kestrel-runtime --test end_to_end`

use kestrel_foundation::{
    CommandSource, CommandStatus, ConsoleStatus, ContainerId, ContainerStatus, Error, EventKind,
    FindingCategory, RuntimeConfig, Subscription, Topic, TrackId, WorkspaceId,
};
use kestrel_runtime::testing::{MemoryFindingsStore, ScriptedAdapter, ScriptedRpc};
use kestrel_runtime::{
    AdapterError, ContainerAdapter, FindingsStore, HistoryBlock, RpcClient, Runtime,
};
use std::sync::Arc;
use std::time::Duration;

const W: WorkspaceId = WorkspaceId(1);
const C: ContainerId = ContainerId(1);
const T: TrackId = TrackId(1);

struct Harness {
    runtime: Runtime,
    adapter: Arc<ScriptedAdapter>,
    rpc: Arc<ScriptedRpc>,
    store: Arc<MemoryFindingsStore>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(RuntimeConfig::fast())
    }

    fn with_config(config: RuntimeConfig) -> Self {
        let adapter = Arc::new(ScriptedAdapter::new());
        let rpc = Arc::new(ScriptedRpc::new());
        let store = Arc::new(MemoryFindingsStore::new());
        let runtime = Runtime::new(
            config,
            Arc::clone(&adapter) as Arc<dyn ContainerAdapter>,
            Arc::clone(&rpc) as Arc<dyn RpcClient>,
            Arc::clone(&store) as Arc<dyn FindingsStore>,
        );
        Self {
            runtime,
            adapter,
            rpc,
            store,
        }
    }

    /// 컨테이너 running + 콘솔 idle까지
    async fn bring_up(&self) {
        self.runtime
            .provision_container(W, C, "kali-1", "kali:latest")
            .await
            .unwrap();
        self.runtime.activate_track(W, C, T).await.unwrap();
        self.runtime.start_container(C).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(self.runtime.container_status(C).unwrap().status, ContainerStatus::Running);
        assert_eq!(self.runtime.console_snapshot(T).unwrap().status, ConsoleStatus::Idle);
    }
}

async fn next_database_update(events: &mut Subscription) -> Option<(i64, u64)> {
    let wait = tokio::time::timeout(Duration::from_secs(1), async {
        while let Some(event) = events.recv().await {
            if let EventKind::DatabaseUpdated { changes, totals } = &event.kind {
                return Some((
                    changes.get(&FindingCategory::Hosts).copied().unwrap_or(0),
                    totals.hosts,
                ));
            }
        }
        None
    });
    wait.await.ok().flatten()
}

#[tokio::test(start_paused = true)]
async fn test_finished_command_updates_counts() {
    let h = Harness::new();
    h.bring_up().await;
    assert_eq!(h.runtime.get_counts(W).unwrap().hosts, 0);

    let mut events = h.runtime.subscribe(Topic::workspace(W));
    h.rpc.respond(
        "db_nmap -sn 10.0.0.0/24",
        &["Nmap scan report for 10.0.0.2\n", "Nmap scan report for 10.0.0.3\n", "Nmap done: 3 hosts up\n"],
    );

    h.runtime
        .submit_command(T, "db_nmap -sn 10.0.0.0/24", CommandSource::Agent)
        .await
        .unwrap();
    // 명령이 데이터 계층에 3개 호스트를 기록
    h.store.add(W, FindingCategory::Hosts, 3);

    assert_eq!(next_database_update(&mut events).await, Some((3, 3)));
    assert_eq!(h.runtime.get_counts(W).unwrap().hosts, 3);

    // 초기 집계 1번 + 디바운스 재집계 1번
    assert_eq!(h.store.count_calls(W), 2);
}

#[tokio::test(start_paused = true)]
async fn test_other_workspace_is_untouched() {
    let h = Harness::new();
    h.bring_up().await;
    let other = WorkspaceId(2);
    h.runtime.open_workspace(other).await;
    assert_eq!(h.store.count_calls(other), 1);

    for command in ["hosts", "services", "vulns"] {
        h.runtime
            .submit_command(T, command, CommandSource::User)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.store.count_calls(other), 1);
    assert_eq!(h.store.count_calls(W), 2);
}

#[tokio::test(start_paused = true)]
async fn test_command_events_carry_track_scope() {
    let h = Harness::new();
    h.bring_up().await;
    let mut track_events = h.runtime.subscribe(Topic::track(W, C, T));

    let id = h
        .runtime
        .submit_command(T, "creds", CommandSource::User)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut seen = Vec::new();
    while let Some(event) = track_events.try_recv() {
        match &event.kind {
            EventKind::CommandIssued { command } => {
                assert_eq!(command.id, id);
                seen.push("issued");
            }
            EventKind::CommandResult { command } if command.status == CommandStatus::Finished => {
                assert_eq!(command.id, id);
                assert_eq!(event.scope.track_id, Some(T));
                seen.push("finished");
            }
            _ => {}
        }
    }
    assert_eq!(seen, vec!["issued", "finished"]);
}

#[tokio::test(start_paused = true)]
async fn test_lost_connection_exhausts_reconnects() {
    let h = Harness::new();
    h.bring_up().await;
    h.rpc.hang("exploit/multi/handler");
    h.runtime
        .submit_command(T, "exploit/multi/handler", CommandSource::Agent)
        .await
        .unwrap();

    let connects_before = h.rpc.connect_count();
    h.rpc.set_reachable(false);
    tokio::time::sleep(Duration::from_millis(500)).await;

    // 재연결 3번, 간격은 늘어남
    let times = h.rpc.connect_times();
    let attempts = &times[connects_before..];
    assert_eq!(attempts.len(), 3);
    let gaps: Vec<_> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps[0] < gaps[1]);

    let snapshot = h.runtime.console_snapshot(T).unwrap();
    assert_eq!(snapshot.status, ConsoleStatus::Offline);
    assert!(!snapshot.retrying);

    // 실행 중이던 명령은 error로 기록
    let history = h.runtime.console_history(T).unwrap();
    assert!(history.iter().any(|block| matches!(
        block,
        HistoryBlock::Command { status: CommandStatus::Error, .. }
    )));

    // 이후 요청은 즉시 거절
    let started = tokio::time::Instant::now();
    let err = h
        .runtime
        .submit_command(T, "sessions -l", CommandSource::User)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConsoleOffline { retrying: false, .. }));
    assert_eq!(started.elapsed(), Duration::ZERO);

    // 컨테이너는 그대로 running
    assert_eq!(h.runtime.container_status(C).unwrap().status, ContainerStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn test_container_restart_reconnects_console() {
    let h = Harness::new();
    h.bring_up().await;

    h.runtime.restart_container(C).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.runtime.console_snapshot(T).unwrap().status, ConsoleStatus::Idle);
    let history = h.runtime.console_history(T).unwrap();
    let kinds: Vec<_> = history
        .iter()
        .map(|block| match block {
            HistoryBlock::Startup { .. } => "startup",
            HistoryBlock::Command { .. } => "command",
            HistoryBlock::Restart { .. } => "restart",
        })
        .collect();
    assert_eq!(kinds, vec!["startup", "restart", "startup"]);

    h.runtime
        .submit_command(T, "hosts", CommandSource::User)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_container_takes_console_offline() {
    let h = Harness::new();
    h.bring_up().await;

    // 헬스 체크 실패 + 재기동 3번 모두 실패
    h.adapter.fail_starts(3, AdapterError::DaemonUnreachable("socket closed".into()));
    h.adapter.set_healthy(false);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(h.runtime.container_status(C).unwrap().status, ContainerStatus::Failed);
    let snapshot = h.runtime.console_snapshot(T).unwrap();
    assert_eq!(snapshot.status, ConsoleStatus::Offline);
    assert!(!snapshot.retrying);
    let err = h
        .runtime
        .submit_command(T, "hosts", CommandSource::User)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "console_offline");

    // 수동 시작이 복구 경로
    h.adapter.set_healthy(true);
    h.runtime.start_container(C).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.runtime.console_snapshot(T).unwrap().status, ConsoleStatus::Idle);
    h.runtime
        .submit_command(T, "hosts", CommandSource::User)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_everything() {
    let h = Harness::new();
    h.bring_up().await;
    assert_eq!(h.adapter.running().len(), 1);

    h.runtime.shutdown().await;

    assert!(h.adapter.running().is_empty());
    assert_eq!(h.rpc.destroyed().len(), 1);
    assert_eq!(h.runtime.container_status(C).unwrap_err().code(), "not_found");
}
