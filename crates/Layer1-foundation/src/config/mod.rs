//! Config - 통합 설정 관리
//!
//! - `runtime.rs` - 액터 타이밍/재시도 설정 (RuntimeConfig)

mod runtime;

pub use runtime::{RuntimeConfig, ENV_PREFIX};
