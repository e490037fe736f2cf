//! Findings Store - 워크스페이스 발견 항목 집계 조회
//!
//! 스키마는 데이터 레이어가 소유하고, 여기서는 읽기만 합니다.
//! - `sqlite.rs`: rusqlite 구현

mod sqlite;

pub use sqlite::SqliteFindingsStore;

use async_trait::async_trait;
use kestrel_foundation::{Error, FindingCounts, WorkspaceId};
use thiserror::Error as ThisError;

/// 저장소 에러
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        let message = match err {
            StoreError::Unavailable(_) => "findings store is unavailable",
            StoreError::Query(_) => "failed to count findings",
        };
        Error::store(message, &err)
    }
}

/// 발견 항목 저장소
#[async_trait]
pub trait FindingsStore: Send + Sync {
    /// 워크스페이스의 카테고리별 항목 수
    async fn count_findings(&self, workspace_id: WorkspaceId) -> Result<FindingCounts, StoreError>;
}
