//! Error types for Kestrel
//!
//! 모든 에러를 중앙에서 관리
//!
//! 하위 협력자(Docker, RPC, 저장소)의 에러는 액터 경계에서 이 타입으로 변환됩니다.
//! 원본 메시지는 `reason`에 보존되고, 사용자에게는 `Display` 메시지만 노출됩니다.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// 에러 분류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 일시적 - 자동 재시도 대상, 호출자에게는 거절로 전달
    Transient,
    /// 재시도 예산 소진 - 수동 개입 필요
    Exhausted,
    /// 호출자 입력 오류 - 상태 변경 없음, 재시도 없음
    CallerInput,
    /// 내부 오류 (설정, IO 등)
    Internal,
}

/// Kestrel 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // 콘솔 관련
    // ========================================================================
    #[error("console is starting")]
    ConsoleStarting,

    #[error("console is busy")]
    ConsoleBusy,

    #[error("console is offline")]
    ConsoleOffline {
        reason: Option<String>,
        retrying: bool,
    },

    #[error("console is not registered")]
    ConsoleNotRegistered,

    // ========================================================================
    // 컨테이너 관련
    // ========================================================================
    #[error("container failed and needs a manual start")]
    ContainerFailed { reason: String },

    #[error("invalid {entity} transition: {event} while {from}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        event: String,
    },

    // ========================================================================
    // 협력자 관련
    // ========================================================================
    #[error("{message}")]
    Adapter { message: String, reason: String },

    #[error("{message}")]
    Rpc { message: String, reason: String },

    #[error("{message}")]
    Store { message: String, reason: String },

    // ========================================================================
    // 실행 관련
    // ========================================================================
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Actor unavailable: {0}")]
    ActorUnavailable(String),

    // ========================================================================
    // 일반
    // ========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // 외부 에러 변환
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 에러 분류
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConsoleStarting
            | Error::ConsoleBusy
            | Error::Adapter { .. }
            | Error::Rpc { .. }
            | Error::Store { .. }
            | Error::Timeout(_)
            | Error::ActorUnavailable(_) => ErrorKind::Transient,
            Error::ConsoleOffline { retrying, .. } => {
                if *retrying {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Exhausted
                }
            }
            Error::ContainerFailed { .. } => ErrorKind::Exhausted,
            Error::ConsoleNotRegistered
            | Error::InvalidTransition { .. }
            | Error::NotFound(_)
            | Error::InvalidInput(_) => ErrorKind::CallerInput,
            Error::Config(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Toml(_)
            | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// 고정된 에러 코드 (API/UI 용)
    pub fn code(&self) -> &'static str {
        match self {
            Error::ConsoleStarting => "console_starting",
            Error::ConsoleBusy => "console_busy",
            Error::ConsoleOffline { .. } => "console_offline",
            Error::ConsoleNotRegistered => "console_not_registered",
            Error::ContainerFailed { .. } => "container_failed",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::Adapter { .. } => "container_adapter",
            Error::Rpc { .. } => "rpc",
            Error::Store { .. } => "store",
            Error::Timeout(_) => "timeout",
            Error::ActorUnavailable(_) => "actor_unavailable",
            Error::NotFound(_) => "not_found",
            Error::InvalidInput(_) => "invalid_input",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Toml(_) => "toml",
            Error::Internal(_) => "internal",
        }
    }

    /// 진단용 원본 에러 메시지
    pub fn reason(&self) -> Option<&str> {
        match self {
            Error::ConsoleOffline { reason, .. } => reason.as_deref(),
            Error::ContainerFailed { reason }
            | Error::Adapter { reason, .. }
            | Error::Rpc { reason, .. }
            | Error::Store { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// 재시도 가능한 에러인지 확인
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// 사용자에게 보여줄 수 있는 에러인지 확인
    pub fn is_user_facing(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Internal)
    }

    /// Adapter 에러 생성 헬퍼
    pub fn adapter(message: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Adapter {
            message: message.into(),
            reason: reason.to_string(),
        }
    }

    /// RPC 에러 생성 헬퍼
    pub fn rpc(message: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Rpc {
            message: message.into(),
            reason: reason.to_string(),
        }
    }

    /// 저장소 에러 생성 헬퍼
    pub fn store(message: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Store {
            message: message.into(),
            reason: reason.to_string(),
        }
    }

    /// 잘못된 상태 전이 에러 생성 헬퍼
    pub fn invalid_transition(
        entity: &'static str,
        from: impl std::fmt::Display,
        event: impl std::fmt::Debug,
    ) -> Self {
        Error::InvalidTransition {
            entity,
            from: from.to_string(),
            event: format!("{:?}", event),
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_rejections_have_stable_codes() {
        assert_eq!(Error::ConsoleBusy.code(), "console_busy");
        assert_eq!(Error::ConsoleStarting.code(), "console_starting");
        assert_eq!(Error::ConsoleNotRegistered.code(), "console_not_registered");
        assert_eq!(
            Error::ConsoleOffline {
                reason: None,
                retrying: false
            }
            .code(),
            "console_offline"
        );
    }

    #[test]
    fn test_collaborator_reason_not_in_message() {
        let err = Error::adapter("container runtime is unreachable", "connect ECONNREFUSED");
        assert_eq!(err.to_string(), "container runtime is unreachable");
        assert_eq!(err.reason(), Some("connect ECONNREFUSED"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::ConsoleBusy.kind(), ErrorKind::Transient);
        assert_eq!(
            Error::ContainerFailed {
                reason: "restart budget exhausted".into()
            }
            .kind(),
            ErrorKind::Exhausted
        );
        assert_eq!(Error::ConsoleNotRegistered.kind(), ErrorKind::CallerInput);
        assert_eq!(
            Error::ConsoleOffline {
                reason: None,
                retrying: true
            }
            .kind(),
            ErrorKind::Transient
        );
        assert!(!Error::Config("bad".into()).is_user_facing());
    }
}
