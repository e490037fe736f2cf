//! Console State - 명령 수락 규칙
//!
//! ```text
//! Initializing ──ready──▶ Connecting ──▶ Idle ⇄ Busy
//!                             │  ▲         │
//!                  no console │  │         │ rpc lost / container down
//!                             ▼  │         ▼
//!                       NotRegistered    Offline ──reconnect──▶ Connecting
//! ```

use kestrel_foundation::{ConsoleStatus, Error, Result};

/// 현재 상태에서 명령을 받을 수 있는지
///
/// `idle`일 때만 수락합니다. 거절 사유는 상태별로 고정입니다.
pub fn check_submit(
    status: ConsoleStatus,
    offline_reason: Option<&str>,
    retrying: bool,
) -> Result<()> {
    match status {
        ConsoleStatus::Idle => Ok(()),
        ConsoleStatus::Initializing | ConsoleStatus::Connecting => Err(Error::ConsoleStarting),
        ConsoleStatus::Busy => Err(Error::ConsoleBusy),
        ConsoleStatus::NotRegistered => Err(Error::ConsoleNotRegistered),
        ConsoleStatus::Offline => Err(Error::ConsoleOffline {
            reason: offline_reason.map(str::to_string),
            retrying,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_idle_accepts() {
        assert!(check_submit(ConsoleStatus::Idle, None, false).is_ok());

        let cases = [
            (ConsoleStatus::Initializing, "console_starting"),
            (ConsoleStatus::Connecting, "console_starting"),
            (ConsoleStatus::Busy, "console_busy"),
            (ConsoleStatus::NotRegistered, "console_not_registered"),
            (ConsoleStatus::Offline, "console_offline"),
        ];
        for (status, code) in cases {
            assert_eq!(check_submit(status, None, true).unwrap_err().code(), code);
        }
    }

    #[test]
    fn test_offline_carries_reason() {
        match check_submit(ConsoleStatus::Offline, Some("connection refused"), false) {
            Err(Error::ConsoleOffline { reason, retrying }) => {
                assert_eq!(reason.as_deref(), Some("connection refused"));
                assert!(!retrying);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
