//! Runtime Config - 액터 타이밍 설정
//!
//! 시작 시 한 번 만들어서 각 액터 생성자에 `Arc`로 전달합니다.
//! 비즈니스 로직 안에서 전역 설정을 조회하지 않습니다.
//!
//! 로드 순서: 기본값 → TOML 파일 → `KESTREL_*` 환경 변수 → 검증

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// 환경 변수 접두사
pub const ENV_PREFIX: &str = "KESTREL_";

/// 액터 타이밍/재시도 설정
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    // ========================================================================
    // Container Actor
    // ========================================================================
    /// 헬스 체크 주기
    pub health_check_interval_ms: u64,
    /// 실패 상태로 가기 전 최대 재시작 횟수
    pub max_restart_count: u32,
    /// 재시작 백오프 시작값
    pub restart_base_backoff_ms: u64,
    /// 재시작 백오프 상한
    pub restart_max_backoff_ms: u64,
    /// 이 시간 동안 건강하면 실패 카운터 초기화
    pub success_reset_window_ms: u64,

    // ========================================================================
    // Console Actor - 연결
    // ========================================================================
    /// 컨테이너가 뜬 뒤 첫 RPC 연결까지 대기
    pub rpc_initial_connect_delay_ms: u64,
    /// 첫 연결 최대 시도 횟수
    pub max_connect_attempts: u32,
    /// 연결 재시도 백오프 시작값
    pub connect_backoff_ms: u64,
    /// 연결 재시도 백오프 상한
    pub connect_max_backoff_ms: u64,

    // ========================================================================
    // Console Actor - 재연결
    // ========================================================================
    pub console_restart_base_backoff_ms: u64,
    pub console_restart_max_backoff_ms: u64,
    pub console_max_restart_attempts: u32,

    // ========================================================================
    // Console Actor - 명령 실행
    // ========================================================================
    /// busy 상태에서 출력 폴링 주기
    pub output_poll_interval_ms: u64,
    /// 읽기 실패 허용 횟수 (초과 시 명령 에러 처리)
    pub command_max_retries: u32,
    /// 읽기 실패 후 재시도 지연 (마지막 값 반복)
    pub retry_delays_ms: Vec<u64>,

    // ========================================================================
    // Workspace Actor
    // ========================================================================
    /// 재집계 디바운스 윈도우
    pub debounce_window_ms: u64,

    // ========================================================================
    // 공통
    // ========================================================================
    /// Adapter/RPC 호출 및 액터 요청 타임아웃
    pub call_timeout_ms: u64,
    /// 토픽별 이벤트 채널 용량
    pub event_buffer: usize,
    /// 액터 패닉 시 슈퍼바이저 재시작 허용 횟수
    pub max_actor_restarts: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 5_000,
            max_restart_count: 5,
            restart_base_backoff_ms: 1_000,
            restart_max_backoff_ms: 60_000,
            success_reset_window_ms: 300_000,
            rpc_initial_connect_delay_ms: 5_000,
            max_connect_attempts: 10,
            connect_backoff_ms: 2_000,
            connect_max_backoff_ms: 30_000,
            console_restart_base_backoff_ms: 1_000,
            console_restart_max_backoff_ms: 30_000,
            console_max_restart_attempts: 10,
            output_poll_interval_ms: 100,
            command_max_retries: 3,
            retry_delays_ms: vec![500, 1_000, 2_000],
            debounce_window_ms: 500,
            call_timeout_ms: 10_000,
            event_buffer: 256,
            max_actor_restarts: 3,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 테스트용 빠른 타이밍 프리셋
    pub fn fast() -> Self {
        Self {
            health_check_interval_ms: 20,
            max_restart_count: 3,
            restart_base_backoff_ms: 10,
            restart_max_backoff_ms: 80,
            success_reset_window_ms: 200,
            rpc_initial_connect_delay_ms: 0,
            max_connect_attempts: 3,
            connect_backoff_ms: 10,
            connect_max_backoff_ms: 80,
            console_restart_base_backoff_ms: 10,
            console_restart_max_backoff_ms: 80,
            console_max_restart_attempts: 3,
            output_poll_interval_ms: 5,
            command_max_retries: 2,
            retry_delays_ms: vec![5, 10],
            debounce_window_ms: 50,
            call_timeout_ms: 500,
            event_buffer: 64,
            max_actor_restarts: 3,
        }
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// 기본값 + 파일(있으면) + 환경 변수 병합 로드
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("Failed to read {}: {}", path.display(), e))
                })?;
                Self::from_toml_str(&content)?
            }
            None => Self::default(),
        };

        config.apply_env_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 문자열에서 로드 (빠진 키는 기본값)
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// `KESTREL_*` 변수 적용
    ///
    /// 알 수 없는 `KESTREL_` 키는 무시하고, 값 파싱 실패는 에러로 처리합니다.
    pub fn apply_env_overrides<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(field) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let field = field.to_ascii_lowercase();
            if self.set(&field, value.as_ref())? {
                debug!(key = %field, "Applied environment override");
            }
        }
        Ok(())
    }

    /// 키 이름으로 값 설정. 알 수 없는 키면 `false`
    pub fn set(&mut self, key: &str, value: &str) -> Result<bool> {
        let this = self;

        macro_rules! parse_fields {
            ($($field:ident),* $(,)?) => {
                match key {
                    $(
                        stringify!($field) => {
                            this.$field = value.trim().parse().map_err(|_| {
                                Error::Config(format!(
                                    "invalid value for {}: {:?}",
                                    stringify!($field),
                                    value
                                ))
                            })?;
                            return Ok(true);
                        }
                    )*
                    _ => {}
                }
            };
        }

        parse_fields!(
            health_check_interval_ms,
            max_restart_count,
            restart_base_backoff_ms,
            restart_max_backoff_ms,
            success_reset_window_ms,
            rpc_initial_connect_delay_ms,
            max_connect_attempts,
            connect_backoff_ms,
            connect_max_backoff_ms,
            console_restart_base_backoff_ms,
            console_restart_max_backoff_ms,
            console_max_restart_attempts,
            output_poll_interval_ms,
            command_max_retries,
            debounce_window_ms,
            call_timeout_ms,
            event_buffer,
            max_actor_restarts,
        );

        if key == "retry_delays_ms" {
            this.retry_delays_ms = value
                .split(',')
                .filter(|part| !part.trim().is_empty())
                .map(|part| part.trim().parse::<u64>())
                .collect::<std::result::Result<_, _>>()
                .map_err(|_| {
                    Error::Config(format!("invalid value for retry_delays_ms: {:?}", value))
                })?;
            return Ok(true);
        }

        Ok(false)
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("restart_base_backoff_ms", self.restart_base_backoff_ms),
            ("success_reset_window_ms", self.success_reset_window_ms),
            ("connect_backoff_ms", self.connect_backoff_ms),
            (
                "console_restart_base_backoff_ms",
                self.console_restart_base_backoff_ms,
            ),
            ("output_poll_interval_ms", self.output_poll_interval_ms),
            ("debounce_window_ms", self.debounce_window_ms),
            ("call_timeout_ms", self.call_timeout_ms),
            ("event_buffer", self.event_buffer as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than 0", name)));
            }
        }

        let ranges = [
            (
                "restart",
                self.restart_base_backoff_ms,
                self.restart_max_backoff_ms,
            ),
            (
                "connect",
                self.connect_backoff_ms,
                self.connect_max_backoff_ms,
            ),
            (
                "console_restart",
                self.console_restart_base_backoff_ms,
                self.console_restart_max_backoff_ms,
            ),
        ];
        for (name, base, max) in ranges {
            if base > max {
                return Err(Error::Config(format!(
                    "{} backoff base ({}ms) exceeds its maximum ({}ms)",
                    name, base, max
                )));
            }
        }

        if self.retry_delays_ms.is_empty() {
            return Err(Error::Config("retry_delays_ms must not be empty".into()));
        }
        if self.max_connect_attempts == 0 || self.console_max_restart_attempts == 0 {
            return Err(Error::Config("connect attempt budgets must be at least 1".into()));
        }

        Ok(())
    }

    // ========================================================================
    // Duration accessors
    // ========================================================================

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn success_reset_window(&self) -> Duration {
        Duration::from_millis(self.success_reset_window_ms)
    }

    pub fn rpc_initial_connect_delay(&self) -> Duration {
        Duration::from_millis(self.rpc_initial_connect_delay_ms)
    }

    pub fn output_poll_interval(&self) -> Duration {
        Duration::from_millis(self.output_poll_interval_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// n번째 읽기 실패(1부터) 후 지연. 스케줄보다 길면 마지막 값
    pub fn retry_delay(&self, failure: u32) -> Duration {
        let index = (failure.max(1) as usize - 1).min(self.retry_delays_ms.len().saturating_sub(1));
        Duration::from_millis(self.retry_delays_ms.get(index).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
        assert!(RuntimeConfig::fast().validate().is_ok());
    }

    #[test]
    fn test_toml_partial_keeps_defaults() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            debounce_window_ms = 250
            retry_delays_ms = [100, 200]
            "#,
        )
        .unwrap();

        assert_eq!(config.debounce_window_ms, 250);
        assert_eq!(config.retry_delays_ms, vec![100, 200]);
        assert_eq!(config.max_restart_count, 5);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RuntimeConfig::default();
        config
            .apply_env_overrides([
                ("KESTREL_MAX_RESTART_COUNT", "7"),
                ("KESTREL_RETRY_DELAYS_MS", "10, 20,40"),
                ("KESTREL_UNKNOWN_KNOB", "1"),
                ("PATH", "/usr/bin"),
            ])
            .unwrap();

        assert_eq!(config.max_restart_count, 7);
        assert_eq!(config.retry_delays_ms, vec![10, 20, 40]);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = RuntimeConfig::default();
        let err = config
            .apply_env_overrides([("KESTREL_DEBOUNCE_WINDOW_MS", "soon")])
            .unwrap_err();
        assert_eq!(err.code(), "config");
    }

    #[test]
    fn test_validate_backoff_ranges() {
        let config = RuntimeConfig {
            restart_base_backoff_ms: 5_000,
            restart_max_backoff_ms: 1_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_delay_repeats_last() {
        let config = RuntimeConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_millis(500));
        assert_eq!(config.retry_delay(3), Duration::from_millis(2_000));
        assert_eq!(config.retry_delay(9), Duration::from_millis(2_000));
    }
}
