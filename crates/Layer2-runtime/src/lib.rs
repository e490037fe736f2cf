//! # kestrel-runtime
//!
//! Lifecycle and concurrency engine for Kestrel.
//! 컨테이너, 콘솔, 워크스페이스마다 액터 하나가 상태를 단독으로 소유합니다.
//!
//! ## Features
//!
//! - Container Actor: 헬스 체크, 백오프 재시작, 재시작 예산
//! - Console Actor: RPC 세션 유지, 명령 직렬화, 출력 폴링, 재연결
//! - Workspace Actor: 디바운스된 발견 항목 집계 캐시
//! - Supervisor: panic한 액터를 같은 inbox로 재기동
//! - Runtime: 엔티티 ID → 액터 핸들 레지스트리
//!
//! ## 협력자
//!
//! ```text
//! Container Actor ──▶ ContainerAdapter (Docker / bollard)
//! Console Actor   ──▶ RpcClient        (JSON-RPC / reqwest)
//! Workspace Actor ──▶ FindingsStore    (SQLite / rusqlite)
//! ```

pub mod adapter;
pub mod backoff;
pub mod console;
pub mod container;
pub mod registry;
pub mod rpc;
pub mod store;
pub mod supervisor;
pub mod testing;
pub mod workspace;

// Runtime
pub use registry::{Runtime, RPC_PASSWORD_ENV, RPC_PORT_ENV};

// Actors
pub use console::{spawn_console, ConsoleContext, ConsoleHandle, ConsoleHistory, ConsoleSnapshot, HistoryBlock};
pub use container::{spawn_container, ContainerContext, ContainerHandle, ContainerSnapshot};
pub use workspace::{spawn_workspace, WorkspaceContext, WorkspaceHandle};

// Collaborators
pub use adapter::{
    AdapterError, ContainerAdapter, ContainerRef, ContainerSpec, DockerAdapter, ProcessInfo,
    ProcessState, DEFAULT_RPC_PORT,
};
pub use rpc::{ConsoleRead, MsfRpcClient, RemoteConsole, RpcClient, RpcEndpoint, RpcError, RpcSession};
pub use store::{FindingsStore, SqliteFindingsStore, StoreError};

// Infrastructure
pub use backoff::Backoff;
pub use supervisor::{supervise, Actor, Incarnation, MAILBOX_CAPACITY};
