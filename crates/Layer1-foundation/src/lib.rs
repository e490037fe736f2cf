//! # kestrel-foundation
//!
//! Foundation layer for Kestrel:
//! - Core: 식별자, Scope, 명령 실행 기록, 액터 상태, 발견 항목 집계
//! - Error: 액터 경계의 단일 에러 타입
//! - Config: 타이밍/재시도 설정 (RuntimeConfig)
//! - Event: 토픽 기반 이벤트 버스
//!
//! ## 아키텍처
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Layer4: kestreld (daemon)                               │
//! │                     │                                   │
//! │                     ▼                                   │
//! │  Layer2: runtime (Container / Console / Workspace 액터)   │
//! │                     │                                   │
//! │                     ▼                                   │
//! │  Layer1: foundation (types, errors, config, event bus)  │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod event;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, ErrorKind, Result};

// ============================================================================
// Core (핵심 타입)
// ============================================================================
pub use core::{
    // Identifiers
    ContainerId,
    TrackId,
    WorkspaceId,
    // Scope
    Scope,
    // Command
    CommandExecution,
    CommandId,
    CommandSource,
    CommandStatus,
    // Lifecycle
    ConsoleStatus,
    ContainerStatus,
    // Findings
    FindingCategory,
    FindingCounts,
};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{RuntimeConfig, ENV_PREFIX};

// ============================================================================
// Event (이벤트 시스템)
// ============================================================================
pub use event::{
    Event, EventBus, EventBusConfig, EventId, EventKind, EventListener, Subscription, Topic,
};
