//! Runtime - 엔티티 ID → 액터 핸들 레지스트리
//!
//! 소비자(UI 계층, 데몬)가 쓰는 유일한 진입점입니다.
//!
//! ```text
//! Runtime
//!   ├── workspaces: WorkspaceId → WorkspaceHandle
//!   ├── containers: ContainerId → ContainerHandle
//!   ├── consoles:   TrackId     → ConsoleHandle
//!   └── bus:        EventBus (모든 액터가 공유)
//! ```
//!
//! 맵 잠금은 await 지점을 넘어가지 않습니다. 핸들을 복제해 꺼낸 뒤 호출합니다.

use crate::adapter::{ContainerAdapter, ContainerSpec};
use crate::console::{spawn_console, ConsoleContext, ConsoleHandle, ConsoleSnapshot, HistoryBlock};
use crate::container::{spawn_container, ContainerContext, ContainerHandle, ContainerSnapshot};
use crate::rpc::RpcClient;
use crate::store::FindingsStore;
use crate::workspace::{spawn_workspace, WorkspaceContext, WorkspaceHandle};
use kestrel_foundation::{
    CommandId, CommandSource, ContainerId, Error, EventBus, FindingCounts, Result, RuntimeConfig,
    Scope, Subscription, Topic, TrackId, WorkspaceId,
};
use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 컨테이너 안 콘솔 서비스 비밀번호 환경 변수
pub const RPC_PASSWORD_ENV: &str = "MSF_RPC_PASS";

/// 콘솔 서비스 포트 환경 변수
pub const RPC_PORT_ENV: &str = "MSF_RPC_PORT";

const RPC_PASSWORD_LEN: usize = 24;

struct ContainerEntry {
    workspace_id: WorkspaceId,
    handle: ContainerHandle,
    task: JoinHandle<()>,
}

struct ConsoleEntry {
    scope: Scope,
    handle: ConsoleHandle,
    task: JoinHandle<()>,
}

struct WorkspaceEntry {
    handle: WorkspaceHandle,
    task: JoinHandle<()>,
}

/// 런타임 레지스트리
pub struct Runtime {
    config: Arc<RuntimeConfig>,
    adapter: Arc<dyn ContainerAdapter>,
    rpc: Arc<dyn RpcClient>,
    store: Arc<dyn FindingsStore>,
    bus: Arc<EventBus>,
    network: Option<String>,

    workspaces: RwLock<HashMap<WorkspaceId, WorkspaceEntry>>,
    containers: RwLock<HashMap<ContainerId, ContainerEntry>>,
    consoles: RwLock<HashMap<TrackId, ConsoleEntry>>,
}

impl Runtime {
    pub fn new(
        config: impl Into<Arc<RuntimeConfig>>,
        adapter: Arc<dyn ContainerAdapter>,
        rpc: Arc<dyn RpcClient>,
        store: Arc<dyn FindingsStore>,
    ) -> Self {
        let config = config.into();
        let bus = Arc::new(EventBus::with_capacity(config.event_buffer));
        Self {
            config,
            adapter,
            rpc,
            store,
            bus,
            network: None,
            workspaces: RwLock::new(HashMap::new()),
            containers: RwLock::new(HashMap::new()),
            consoles: RwLock::new(HashMap::new()),
        }
    }

    /// 새 컨테이너를 붙일 네트워크
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// 토픽 구독 (구독 이후 이벤트만 수신)
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.bus.subscribe(topic)
    }

    // ========================================================================
    // Workspaces
    // ========================================================================

    /// 워크스페이스 액터 기동 (이미 있으면 기존 핸들)
    pub async fn open_workspace(&self, workspace_id: WorkspaceId) -> WorkspaceHandle {
        if let Some(entry) = self.workspaces.read().get(&workspace_id) {
            return entry.handle.clone();
        }

        let (handle, task) = spawn_workspace(WorkspaceContext {
            workspace_id,
            config: Arc::clone(&self.config),
            store: Arc::clone(&self.store),
            bus: Arc::clone(&self.bus),
        })
        .await;

        // 기동 중에 다른 호출이 먼저 등록했으면 그쪽을 사용
        let duplicate = {
            let mut workspaces = self.workspaces.write();
            match workspaces.get(&workspace_id) {
                Some(existing) => Some(existing.handle.clone()),
                None => {
                    workspaces.insert(
                        workspace_id,
                        WorkspaceEntry {
                            handle: handle.clone(),
                            task,
                        },
                    );
                    None
                }
            }
        };

        match duplicate {
            Some(existing) => {
                let _ = handle.shutdown().await;
                existing
            }
            None => {
                info!(workspace_id = %workspace_id, "Workspace opened");
                handle
            }
        }
    }

    fn workspace(&self, workspace_id: WorkspaceId) -> Result<WorkspaceHandle> {
        self.workspaces
            .read()
            .get(&workspace_id)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| Error::NotFound(workspace_id.to_string()))
    }

    /// 캐시된 발견 항목 수 (블록 없음)
    pub fn get_counts(&self, workspace_id: WorkspaceId) -> Result<FindingCounts> {
        Ok(self.workspace(workspace_id)?.get_counts())
    }

    /// 디바운스 없이 즉시 다시 셈
    pub async fn refresh_counts(&self, workspace_id: WorkspaceId) -> Result<FindingCounts> {
        self.workspace(workspace_id)?.refresh_counts().await
    }

    // ========================================================================
    // Containers
    // ========================================================================

    /// 컨테이너 액터 등록 (`stopped` 상태, 프로세스는 만들지 않음)
    pub async fn provision_container(
        &self,
        workspace_id: WorkspaceId,
        container_id: ContainerId,
        slug: &str,
        image: &str,
    ) -> Result<ContainerHandle> {
        if slug.trim().is_empty() || image.trim().is_empty() {
            return Err(Error::InvalidInput(
                "container slug and image are required".to_string(),
            ));
        }
        if self.containers.read().contains_key(&container_id) {
            return Err(Error::InvalidInput(format!(
                "{} is already provisioned",
                container_id
            )));
        }

        self.open_workspace(workspace_id).await;

        let password = generate_password();
        let mut spec = ContainerSpec::new(slug, image)
            .with_label("kestrel.workspace", workspace_id.get().to_string())
            .with_label("kestrel.container", container_id.get().to_string())
            .with_label("kestrel.slug", slug)
            .with_env(RPC_PASSWORD_ENV, password.clone());
        let port = spec.rpc_port.to_string();
        spec = spec.with_env(RPC_PORT_ENV, port);
        if let Some(network) = &self.network {
            spec = spec.with_network(network.clone());
        }

        let scope = Scope::container(workspace_id, container_id);
        let (handle, task) = spawn_container(ContainerContext {
            scope,
            spec,
            rpc_password: password,
            config: Arc::clone(&self.config),
            adapter: Arc::clone(&self.adapter),
            bus: Arc::clone(&self.bus),
        });

        let mut containers = self.containers.write();
        if containers.contains_key(&container_id) {
            task.abort();
            return Err(Error::InvalidInput(format!(
                "{} is already provisioned",
                container_id
            )));
        }
        containers.insert(
            container_id,
            ContainerEntry {
                workspace_id,
                handle: handle.clone(),
                task,
            },
        );
        drop(containers);

        info!(scope = %scope, slug, "Container provisioned");
        Ok(handle)
    }

    fn container(&self, container_id: ContainerId) -> Result<ContainerHandle> {
        self.containers
            .read()
            .get(&container_id)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| Error::NotFound(container_id.to_string()))
    }

    pub async fn start_container(&self, container_id: ContainerId) -> Result<()> {
        self.container(container_id)?.start().await
    }

    /// 정지 (이미 정지 상태면 아무 일도 하지 않음)
    pub async fn stop_container(&self, container_id: ContainerId) -> Result<()> {
        self.container(container_id)?.stop().await
    }

    pub async fn restart_container(&self, container_id: ContainerId) -> Result<()> {
        self.container(container_id)?.restart().await
    }

    pub fn container_status(&self, container_id: ContainerId) -> Result<ContainerSnapshot> {
        Ok(self.container(container_id)?.snapshot())
    }

    /// 등록된 컨테이너 ID 목록
    pub fn container_ids(&self) -> Vec<ContainerId> {
        let mut ids: Vec<_> = self.containers.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// 프로세스를 정지하고 소속 콘솔과 액터를 모두 종료
    pub async fn delete_container(&self, container_id: ContainerId) -> Result<()> {
        let entry = self
            .containers
            .write()
            .remove(&container_id)
            .ok_or_else(|| Error::NotFound(container_id.to_string()))?;

        let consoles: Vec<ConsoleEntry> = {
            let mut consoles = self.consoles.write();
            let tracks: Vec<TrackId> = consoles
                .iter()
                .filter(|(_, console)| console.scope.container_id == Some(container_id))
                .map(|(track_id, _)| *track_id)
                .collect();
            tracks
                .into_iter()
                .filter_map(|track_id| consoles.remove(&track_id))
                .collect()
        };

        // 원격 콘솔을 먼저 정리해야 세션이 살아 있는 동안 destroy할 수 있음
        for console in consoles {
            detach_and_close(&entry.handle, console).await;
        }
        if let Err(e) = entry.handle.shutdown().await {
            warn!(container_id = %container_id, error = %e, "Container actor shutdown failed");
        }
        let _ = entry.task.await;

        info!(workspace_id = %entry.workspace_id, container_id = %container_id, "Container deleted");
        Ok(())
    }

    // ========================================================================
    // Tracks / consoles
    // ========================================================================

    /// 트랙의 콘솔 액터 기동 후 컨테이너에 연결
    ///
    /// 컨테이너가 running이면 바로 연결을 시작하고, 아니면 `initializing`으로 대기합니다.
    pub async fn activate_track(
        &self,
        workspace_id: WorkspaceId,
        container_id: ContainerId,
        track_id: TrackId,
    ) -> Result<ConsoleHandle> {
        let container = {
            let containers = self.containers.read();
            match containers.get(&container_id) {
                Some(entry) if entry.workspace_id == workspace_id => entry.handle.clone(),
                _ => return Err(Error::NotFound(container_id.to_string())),
            }
        };

        if let Some(entry) = self.consoles.read().get(&track_id) {
            return if entry.scope.container_id == Some(container_id) {
                Ok(entry.handle.clone())
            } else {
                Err(Error::InvalidInput(format!(
                    "{} belongs to another container",
                    track_id
                )))
            };
        }

        let scope = Scope::track(workspace_id, container_id, track_id);
        let (handle, task) = spawn_console(ConsoleContext {
            scope,
            config: Arc::clone(&self.config),
            rpc: Arc::clone(&self.rpc),
            bus: Arc::clone(&self.bus),
        });

        {
            let mut consoles = self.consoles.write();
            if let Some(existing) = consoles.get(&track_id) {
                task.abort();
                return Ok(existing.handle.clone());
            }
            consoles.insert(
                track_id,
                ConsoleEntry {
                    scope,
                    handle: handle.clone(),
                    task,
                },
            );
        }

        if let Err(e) = container.attach_console(track_id, handle.clone()).await {
            warn!(scope = %scope, error = %e, "Attaching console failed");
            let entry = self.consoles.write().remove(&track_id);
            if let Some(entry) = entry {
                close_console(entry).await;
            }
            return Err(e);
        }

        debug!(scope = %scope, "Track activated");
        Ok(handle)
    }

    /// 콘솔을 컨테이너에서 떼고 종료
    pub async fn delete_track(&self, track_id: TrackId) -> Result<()> {
        let entry = self
            .consoles
            .write()
            .remove(&track_id)
            .ok_or_else(|| Error::NotFound(track_id.to_string()))?;

        if let Some(container_id) = entry.scope.container_id {
            if let Ok(container) = self.container(container_id) {
                if let Err(e) = container.detach_console(track_id).await {
                    warn!(scope = %entry.scope, error = %e, "Detaching console failed");
                }
            }
        }

        close_console(entry).await;
        debug!(track_id = %track_id, "Track deleted");
        Ok(())
    }

    fn console(&self, track_id: TrackId) -> Option<ConsoleHandle> {
        self.consoles
            .read()
            .get(&track_id)
            .map(|entry| entry.handle.clone())
    }

    /// 명령 실행 요청
    ///
    /// 콘솔 액터가 없는 트랙이면 `console_not_registered`.
    pub async fn submit_command(
        &self,
        track_id: TrackId,
        text: &str,
        source: CommandSource,
    ) -> Result<CommandId> {
        self.console(track_id)
            .ok_or(Error::ConsoleNotRegistered)?
            .submit(text, source)
            .await
    }

    pub fn console_snapshot(&self, track_id: TrackId) -> Result<ConsoleSnapshot> {
        self.console(track_id)
            .map(|console| console.snapshot())
            .ok_or_else(|| Error::NotFound(track_id.to_string()))
    }

    pub fn console_history(&self, track_id: TrackId) -> Result<Vec<HistoryBlock>> {
        self.console(track_id)
            .map(|console| console.history())
            .ok_or_else(|| Error::NotFound(track_id.to_string()))
    }

    /// `offline` 콘솔을 수동으로 재연결
    pub async fn reconnect_console(&self, track_id: TrackId) -> Result<()> {
        self.console(track_id)
            .ok_or_else(|| Error::NotFound(track_id.to_string()))?
            .reconnect()
            .await
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// 모든 컨테이너를 정지하고 모든 액터 종료
    pub async fn shutdown(&self) {
        let containers: HashMap<_, _> = self.containers.write().drain().collect();
        let consoles: Vec<_> = self.consoles.write().drain().map(|(_, e)| e).collect();
        let workspaces: Vec<_> = self.workspaces.write().drain().map(|(_, e)| e).collect();

        info!(
            containers = containers.len(),
            consoles = consoles.len(),
            workspaces = workspaces.len(),
            "Runtime shutting down"
        );

        let closes = consoles.into_iter().map(|console| {
            let container = console
                .scope
                .container_id
                .and_then(|container_id| containers.get(&container_id))
                .map(|entry| entry.handle.clone());
            async move {
                match container {
                    Some(container) => detach_and_close(&container, console).await,
                    None => close_console(console).await,
                }
            }
        });
        futures::future::join_all(closes).await;

        let stops = containers.into_iter().map(|(container_id, entry)| async move {
            if let Err(e) = entry.handle.shutdown().await {
                warn!(container_id = %container_id, error = %e, "Container shutdown failed");
            }
            let _ = entry.task.await;
        });
        futures::future::join_all(stops).await;

        for entry in workspaces {
            if let Err(e) = entry.handle.shutdown().await {
                debug!(workspace_id = %entry.handle.workspace_id(), error = %e, "Workspace shutdown failed");
            }
            let _ = entry.task.await;
        }
    }
}

async fn detach_and_close(container: &ContainerHandle, entry: ConsoleEntry) {
    if let Some(track_id) = entry.scope.track_id {
        if let Err(e) = container.detach_console(track_id).await {
            debug!(scope = %entry.scope, error = %e, "Detaching console failed");
        }
    }
    close_console(entry).await;
}

async fn close_console(entry: ConsoleEntry) {
    if let Err(e) = entry.handle.shutdown().await {
        warn!(scope = %entry.scope, error = %e, "Console shutdown failed");
    }
    let _ = entry.task.await;
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RPC_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryFindingsStore, ScriptedAdapter, ScriptedRpc};
    use kestrel_foundation::{ConsoleStatus, ContainerStatus};
    use std::time::Duration;

    fn runtime() -> (Runtime, Arc<ScriptedAdapter>) {
        let adapter = Arc::new(ScriptedAdapter::new());
        let runtime = Runtime::new(
            RuntimeConfig::fast(),
            Arc::clone(&adapter) as Arc<dyn ContainerAdapter>,
            Arc::new(ScriptedRpc::new()),
            Arc::new(MemoryFindingsStore::new()),
        );
        (runtime, adapter)
    }

    #[test]
    fn test_generated_password() {
        let a = generate_password();
        let b = generate_password();
        assert_eq!(a.len(), RPC_PASSWORD_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_ids() {
        let (runtime, _) = runtime();

        assert_eq!(runtime.start_container(ContainerId(9)).await.unwrap_err().code(), "not_found");
        assert_eq!(runtime.get_counts(WorkspaceId(9)).unwrap_err().code(), "not_found");
        assert_eq!(
            runtime
                .submit_command(TrackId(9), "hosts", CommandSource::User)
                .await
                .unwrap_err()
                .code(),
            "console_not_registered"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_rejects_duplicates() {
        let (runtime, _) = runtime();
        let handle = runtime
            .provision_container(WorkspaceId(1), ContainerId(1), "kali-1", "kali:latest")
            .await
            .unwrap();
        let debug = format!("{:?}", handle);
        assert!(debug.starts_with("ContainerHandle"), "{}", debug);
        assert!(debug.contains("Stopped"), "{}", debug);

        let err = runtime
            .provision_container(WorkspaceId(1), ContainerId(1), "kali-1", "kali:latest")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_input");
        assert_eq!(
            runtime.container_status(ContainerId(1)).unwrap().status,
            ContainerStatus::Stopped
        );
        assert!(runtime.get_counts(WorkspaceId(1)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_waits_for_container() {
        let (runtime, _) = runtime();
        runtime
            .provision_container(WorkspaceId(1), ContainerId(1), "kali-1", "kali:latest")
            .await
            .unwrap();
        runtime
            .activate_track(WorkspaceId(1), ContainerId(1), TrackId(1))
            .await
            .unwrap();

        assert_eq!(
            runtime.console_snapshot(TrackId(1)).unwrap().status,
            ConsoleStatus::Initializing
        );
        let err = runtime
            .submit_command(TrackId(1), "hosts", CommandSource::User)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "console_starting");

        runtime.start_container(ContainerId(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            runtime.console_snapshot(TrackId(1)).unwrap().status,
            ConsoleStatus::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_requires_matching_workspace() {
        let (runtime, _) = runtime();
        runtime
            .provision_container(WorkspaceId(1), ContainerId(1), "kali-1", "kali:latest")
            .await
            .unwrap();

        let err = runtime
            .activate_track(WorkspaceId(2), ContainerId(1), TrackId(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_container_stops_process_and_consoles() {
        let (runtime, adapter) = runtime();
        runtime
            .provision_container(WorkspaceId(1), ContainerId(1), "kali-1", "kali:latest")
            .await
            .unwrap();
        let console = runtime
            .activate_track(WorkspaceId(1), ContainerId(1), TrackId(1))
            .await
            .unwrap();
        runtime.start_container(ContainerId(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(adapter.running().len(), 1);

        runtime.delete_container(ContainerId(1)).await.unwrap();

        assert!(adapter.running().is_empty());
        assert_eq!(console.status(), ConsoleStatus::Offline);
        assert_eq!(runtime.container_status(ContainerId(1)).unwrap_err().code(), "not_found");
        assert_eq!(
            runtime
                .submit_command(TrackId(1), "hosts", CommandSource::User)
                .await
                .unwrap_err()
                .code(),
            "console_not_registered"
        );
    }
}
