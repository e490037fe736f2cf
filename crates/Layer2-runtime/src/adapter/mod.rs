//! Container Adapter - 컨테이너 런타임 추상화
//!
//! Container Actor는 이 trait만 알고 있습니다.
//! - `docker.rs`: bollard 기반 Docker 구현

mod docker;

pub use docker::DockerAdapter;

use async_trait::async_trait;
use kestrel_foundation::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error as ThisError;

/// 컨테이너 안에서 콘솔 RPC 서비스가 듣는 기본 포트
pub const DEFAULT_RPC_PORT: u16 = 55553;

// ============================================================================
// Types
// ============================================================================

/// 생성할 컨테이너 명세
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// 컨테이너 이름 (네트워크 안에서 호스트 이름으로도 쓰임)
    pub slug: String,
    pub image: String,
    /// 연결할 네트워크 (None이면 런타임 기본값)
    pub network: Option<String>,
    pub labels: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub rpc_port: u16,
}

impl ContainerSpec {
    pub fn new(slug: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            image: image.into(),
            network: None,
            labels: HashMap::new(),
            env: HashMap::new(),
            rpc_port: DEFAULT_RPC_PORT,
        }
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// 생성된 컨테이너 참조
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerRef {
    /// 런타임이 부여한 ID
    pub id: String,
    pub name: String,
}

/// 프로세스 실행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessState {
    Running,
    Exited { exit_code: Option<i64> },
}

/// inspect 결과
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub state: ProcessState,
    pub pid: Option<i64>,
    /// 네트워크 주소 (IP)
    pub address: Option<String>,
}

impl ProcessInfo {
    pub fn running(address: Option<String>) -> Self {
        Self {
            state: ProcessState::Running,
            pid: None,
            address,
        }
    }

    pub fn exited(exit_code: Option<i64>) -> Self {
        Self {
            state: ProcessState::Exited { exit_code },
            pid: None,
            address: None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, ProcessState::Running)
    }
}

// ============================================================================
// Error
// ============================================================================

/// 컨테이너 런타임 에러
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Container runtime unreachable: {0}")]
    DaemonUnreachable(String),

    #[error("Container runtime call timed out")]
    Timeout,

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl AdapterError {
    /// 사용자에게 보여줄 메시지
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::ImageNotFound(_) => "container image is not available",
            Self::DaemonUnreachable(_) => "container runtime is unreachable",
            Self::Timeout => "container runtime did not respond in time",
            Self::NotFound(_) => "container no longer exists",
            Self::Other(_) => "container runtime error",
        }
    }
}

impl From<AdapterError> for Error {
    fn from(err: AdapterError) -> Self {
        Error::adapter(err.user_message(), &err)
    }
}

// ============================================================================
// ContainerAdapter Trait
// ============================================================================

/// 컨테이너 런타임 어댑터
///
/// `stop`은 멱등이어야 합니다. 이미 멈췄거나 없는 컨테이너도 성공으로 처리하며,
/// stop 이후의 `start`는 새 프로세스를 만듭니다.
#[async_trait]
pub trait ContainerAdapter: Send + Sync {
    /// 어댑터 이름 (로깅용)
    fn name(&self) -> &str;

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerRef, AdapterError>;

    async fn start(&self, container: &ContainerRef) -> Result<(), AdapterError>;

    async fn stop(&self, container: &ContainerRef) -> Result<(), AdapterError>;

    async fn inspect(&self, container: &ContainerRef) -> Result<ProcessInfo, AdapterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_error_translation() {
        let err: Error = AdapterError::ImageNotFound("msf:latest".into()).into();
        assert_eq!(err.code(), "container_adapter");
        assert_eq!(err.to_string(), "container image is not available");
        assert_eq!(err.reason(), Some("Image not found: msf:latest"));
    }

    #[test]
    fn test_spec_builder() {
        let spec = ContainerSpec::new("ws1-kali", "metasploit:latest")
            .with_network("kestrel")
            .with_label("kestrel.slug", "ws1-kali")
            .with_env("MSF_RPC_PORT", "55553");

        assert_eq!(spec.network.as_deref(), Some("kestrel"));
        assert_eq!(spec.labels["kestrel.slug"], "ws1-kali");
        assert_eq!(spec.rpc_port, DEFAULT_RPC_PORT);
    }
}
