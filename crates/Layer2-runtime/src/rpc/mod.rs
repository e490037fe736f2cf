//! Console RPC - 컨테이너 안의 콘솔 서비스와 통신
//!
//! Console Actor는 이 trait만 알고 있습니다.
//! - `msf.rs`: JSON-RPC over HTTP 구현 (reqwest)

mod msf;

pub use msf::{normalize_prompt, MsfRpcClient};

use async_trait::async_trait;
use kestrel_foundation::Error;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

// ============================================================================
// Types
// ============================================================================

/// 콘솔 서비스 접속 정보
///
/// 컨테이너가 running이 되면 Container Actor가 만들어 Console Actor에게 넘깁니다.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcEndpoint {
    pub host: String,
    pub port: u16,
    pub password: String,
}

impl RpcEndpoint {
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            password: password.into(),
        }
    }
}

// 비밀번호는 로그에 남기지 않음
impl std::fmt::Debug for RpcEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &"***")
            .finish()
    }
}

/// 인증된 RPC 세션
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcSession {
    pub endpoint: RpcEndpoint,
    pub token: String,
}

/// 원격 콘솔 핸들
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConsole {
    pub id: String,
    pub prompt: String,
}

/// `console.read` 결과
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsoleRead {
    /// 마지막 read 이후 쌓인 출력
    pub output: String,
    /// 정규화된 프롬프트
    pub prompt: String,
    /// 콘솔이 아직 명령을 처리 중인지
    pub busy: bool,
}

impl ConsoleRead {
    /// 명령 완료 신호: busy가 아니고 프롬프트가 다시 보임
    pub fn is_complete(&self) -> bool {
        !self.busy && !self.prompt.is_empty()
    }
}

// ============================================================================
// Error
// ============================================================================

/// RPC 에러
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("RPC call timed out")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown console: {0}")]
    UnknownConsole(String),
}

impl RpcError {
    /// 세션을 다시 만들어야 하는 에러인지
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Auth(_) | Self::UnknownConsole(_)
        )
    }

    /// 사용자에게 보여줄 메시지
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Connection(_) => "console service is unreachable",
            Self::Auth(_) => "console service rejected the credentials",
            Self::Read(_) => "failed to read console output",
            Self::Write(_) => "failed to send the command",
            Self::Timeout => "console service did not respond in time",
            Self::Protocol(_) => "console service returned an unexpected response",
            Self::UnknownConsole(_) => "console session no longer exists",
        }
    }
}

impl From<RpcError> for Error {
    fn from(err: RpcError) -> Self {
        Error::rpc(err.user_message(), &err)
    }
}

// ============================================================================
// RpcClient Trait
// ============================================================================

/// 콘솔 RPC 클라이언트
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// 인증하고 세션 토큰을 받음
    async fn connect(&self, endpoint: &RpcEndpoint) -> Result<RpcSession, RpcError>;

    async fn create_console(&self, session: &RpcSession) -> Result<RemoteConsole, RpcError>;

    async fn write(
        &self,
        session: &RpcSession,
        console_id: &str,
        data: &str,
    ) -> Result<(), RpcError>;

    async fn read(&self, session: &RpcSession, console_id: &str)
        -> Result<ConsoleRead, RpcError>;

    async fn destroy_console(&self, session: &RpcSession, console_id: &str)
        -> Result<(), RpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_requires_prompt() {
        let read = ConsoleRead {
            output: String::new(),
            prompt: String::new(),
            busy: false,
        };
        assert!(!read.is_complete());

        let read = ConsoleRead {
            prompt: "msf6 > ".into(),
            ..read
        };
        assert!(read.is_complete());
        assert!(!ConsoleRead { busy: true, ..read }.is_complete());
    }

    #[test]
    fn test_endpoint_debug_hides_password() {
        let endpoint = RpcEndpoint::new("10.0.0.2", 55553, "s3cret");
        let debug = format!("{:?}", endpoint);
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("10.0.0.2"));
    }

    #[test]
    fn test_connection_lost_classification() {
        assert!(RpcError::UnknownConsole("3".into()).is_connection_lost());
        assert!(RpcError::Connection("refused".into()).is_connection_lost());
        assert!(!RpcError::Read("bad".into()).is_connection_lost());
        assert!(!RpcError::Timeout.is_connection_lost());
    }
}
