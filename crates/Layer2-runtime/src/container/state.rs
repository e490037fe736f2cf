//! Container State Machine
//!
//! ```text
//!              Start                Started
//!  Stopped ─────────▶ Starting ─────────────▶ Running ◀──┐
//!  Failed  ─────────▶    │                     │  ▲      │ CheckPassed
//!                        │ StartFailed         │  │      │
//!                        ▼          CheckFailed▼  │      │
//!                   Restarting ◀─────────── Unhealthy ───┘
//!                        │       Restart
//!                        │ Exhausted
//!                        ▼
//!                      Failed            (Stop: any ──▶ Stopped)
//! ```
//!
//! 표에 없는 조합은 모두 `InvalidTransition` 에러입니다.

use kestrel_foundation::{ContainerStatus, Error, Result};

/// 상태 전이 입력
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerTransition {
    /// 수동 시작 요청
    Start,
    /// 프로세스 기동 성공
    Started,
    /// 프로세스 기동 실패
    StartFailed,
    /// 헬스 체크 실패
    CheckFailed,
    /// 헬스 체크 성공
    CheckPassed,
    /// 재시작 (백오프 만료 또는 운영자 요청)
    Restart,
    /// 재시작 예산 소진
    Exhausted,
    /// 정지 요청
    Stop,
}

/// 다음 상태 계산
pub fn transition(from: ContainerStatus, event: ContainerTransition) -> Result<ContainerStatus> {
    use ContainerStatus::*;
    use ContainerTransition as T;

    let next = match (from, event) {
        (Stopped | Failed, T::Start) => Starting,
        (Starting | Restarting, T::Started) => Running,
        (Starting | Restarting, T::StartFailed) => Restarting,
        (Running | Unhealthy, T::CheckFailed) => Unhealthy,
        (Running | Unhealthy, T::CheckPassed) => Running,
        (Running | Unhealthy, T::Restart) => Restarting,
        (Restarting | Unhealthy, T::Exhausted) => Failed,
        (_, T::Stop) => Stopped,
        (from, event) => return Err(Error::invalid_transition("container", from, event)),
    };

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ContainerStatus::*;
    use ContainerTransition as T;

    const ALL_STATUSES: [ContainerStatus; 6] =
        [Starting, Running, Unhealthy, Restarting, Failed, Stopped];

    #[test]
    fn test_happy_path() {
        let status = transition(Stopped, T::Start).unwrap();
        assert_eq!(status, Starting);
        assert_eq!(transition(status, T::Started).unwrap(), Running);
    }

    #[test]
    fn test_restart_cycle() {
        assert_eq!(transition(Starting, T::StartFailed).unwrap(), Restarting);
        assert_eq!(transition(Restarting, T::StartFailed).unwrap(), Restarting);
        assert_eq!(transition(Restarting, T::Exhausted).unwrap(), Failed);
        assert_eq!(transition(Running, T::CheckFailed).unwrap(), Unhealthy);
        assert_eq!(transition(Unhealthy, T::CheckPassed).unwrap(), Running);
        assert_eq!(transition(Unhealthy, T::Restart).unwrap(), Restarting);
        assert_eq!(transition(Failed, T::Start).unwrap(), Starting);
    }

    #[test]
    fn test_stop_from_anywhere() {
        for status in ALL_STATUSES {
            assert_eq!(transition(status, T::Stop).unwrap(), Stopped);
        }
    }

    #[test]
    fn test_rejects_unlisted_pairs() {
        let err = transition(Running, T::Start).unwrap_err();
        assert_eq!(err.code(), "invalid_transition");

        assert!(transition(Failed, T::Started).is_err());
        assert!(transition(Stopped, T::CheckFailed).is_err());
        assert!(transition(Starting, T::Restart).is_err());
        assert!(transition(Running, T::Exhausted).is_err());
    }
}
