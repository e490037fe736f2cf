//! Core Module - 핵심 타입
//!
//! Kestrel의 모든 레이어가 공유하는 식별자와 값 타입을 정의합니다.
//!
//! ## 엔티티 계층
//!
//! ```text
//! Workspace ──┬── Container ──┬── Track (Console)
//!             │               └── Track (Console)
//!             └── Container ───── Track (Console)
//! ```
//!
//! - `types.rs`: 식별자 (WorkspaceId, ContainerId, TrackId), Scope,
//!   명령 실행 기록, 액터 상태, 발견 항목 집계

pub mod types;

pub use types::{
    CommandExecution, CommandId, CommandSource, CommandStatus, ConsoleStatus, ContainerId,
    ContainerStatus, FindingCategory, FindingCounts, Scope, TrackId, WorkspaceId,
};
