//! Core Types - 공용 타입 정의
//!
//! 모든 레이어에서 공통으로 사용하는 식별자와 값 타입들

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Identifiers - 엔티티 식별자
// ============================================================================

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub fn new(id: i64) -> Self {
                Self(id)
            }

            pub fn get(&self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

entity_id!(
    /// 워크스페이스 ID (최상위 그룹)
    WorkspaceId,
    "workspace"
);

entity_id!(
    /// 컨테이너 ID
    ContainerId,
    "container"
);

entity_id!(
    /// 트랙 ID (컨테이너 안의 콘솔 세션 하나)
    TrackId,
    "track"
);

// ============================================================================
// Scope - 이벤트/엔티티 범위
// ============================================================================

/// 엔티티가 속한 범위
///
/// 모든 이벤트는 scope를 가지고 있어서 구독자가 싸게 필터링할 수 있습니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub workspace_id: WorkspaceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<ContainerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<TrackId>,
}

impl Scope {
    pub fn workspace(workspace_id: WorkspaceId) -> Self {
        Self {
            workspace_id,
            container_id: None,
            track_id: None,
        }
    }

    pub fn container(workspace_id: WorkspaceId, container_id: ContainerId) -> Self {
        Self {
            workspace_id,
            container_id: Some(container_id),
            track_id: None,
        }
    }

    pub fn track(workspace_id: WorkspaceId, container_id: ContainerId, track_id: TrackId) -> Self {
        Self {
            workspace_id,
            container_id: Some(container_id),
            track_id: Some(track_id),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.workspace_id)?;
        if let Some(container_id) = self.container_id {
            write!(f, "/{}", container_id)?;
        }
        if let Some(track_id) = self.track_id {
            write!(f, "/{}", track_id)?;
        }
        Ok(())
    }
}

// ============================================================================
// Command - 명령 실행 관련 타입
// ============================================================================

/// 명령을 보낸 주체
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    /// 사용자가 직접 입력
    User,
    /// AI 에이전트가 실행
    Agent,
    /// 시스템 내부 (자동화)
    System,
}

impl CommandSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }
}

impl Default for CommandSource {
    fn default() -> Self {
        Self::User
    }
}

/// 명령 실행 상태 (`issued → running → finished | error`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Issued,
    Running,
    Finished,
    Error,
}

impl CommandStatus {
    /// 더 이상 바뀌지 않는 상태인지
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issued => "issued",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 명령 상관관계 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub uuid::Uuid);

impl CommandId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 명령 실행 기록
///
/// 브로드캐스트 후에는 수정하지 않습니다. 상태가 바뀌면 새 값을 만들어 다시 발행합니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandExecution {
    pub id: CommandId,
    pub scope: Scope,
    pub source: CommandSource,
    pub command: String,
    /// 명령 직전에 표시된 프롬프트
    pub prompt: String,
    pub status: CommandStatus,
    /// 지금까지 누적된 출력
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub issued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl CommandExecution {
    pub fn issued(
        scope: Scope,
        source: CommandSource,
        command: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: CommandId::new(),
            scope,
            source,
            command: command.into(),
            prompt: prompt.into(),
            status: CommandStatus::Issued,
            output: String::new(),
            error: None,
            issued_at: Utc::now(),
            finished_at: None,
        }
    }

    /// 출력이 쌓인 running 스냅샷
    pub fn running(&self, output: &str) -> Self {
        Self {
            status: CommandStatus::Running,
            output: output.to_string(),
            ..self.clone()
        }
    }

    pub fn finished(&self, output: &str) -> Self {
        Self {
            status: CommandStatus::Finished,
            output: output.to_string(),
            finished_at: Some(Utc::now()),
            ..self.clone()
        }
    }

    pub fn errored(&self, output: &str, error: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Error,
            output: output.to_string(),
            error: Some(error.into()),
            finished_at: Some(Utc::now()),
            ..self.clone()
        }
    }
}

// ============================================================================
// Lifecycle Status - 액터 상태
// ============================================================================

/// 컨테이너 생명주기 상태
///
/// 전이 규칙은 런타임의 컨테이너 상태 머신이 소유합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Starting,
    Running,
    Unhealthy,
    Restarting,
    /// 재시작 예산 소진 - 수동 재시작 필요
    Failed,
    Stopped,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Unhealthy => "unhealthy",
            Self::Restarting => "restarting",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// 자동 복구가 멈춘 상태인지
    pub fn is_halted(&self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }

    /// 헬스 체크 대상인지
    pub fn is_monitored(&self) -> bool {
        matches!(self, Self::Running | Self::Unhealthy)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 콘솔 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleStatus {
    /// 컨테이너 준비 대기
    Initializing,
    /// RPC 인증/콘솔 생성 중
    Connecting,
    /// 세션은 있지만 원격 콘솔 핸들이 없음
    NotRegistered,
    Idle,
    Busy,
    Offline,
}

impl ConsoleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Connecting => "connecting",
            Self::NotRegistered => "not_registered",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }

    /// 원격 콘솔과 연결되어 있는지
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }
}

impl std::fmt::Display for ConsoleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Findings - 발견 항목 집계
// ============================================================================

/// 발견 항목 카테고리
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCategory {
    Hosts,
    Services,
    Vulns,
    Creds,
    Loots,
    Notes,
    Sessions,
}

impl FindingCategory {
    pub const ALL: [FindingCategory; 7] = [
        Self::Hosts,
        Self::Services,
        Self::Vulns,
        Self::Creds,
        Self::Loots,
        Self::Notes,
        Self::Sessions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hosts => "hosts",
            Self::Services => "services",
            Self::Vulns => "vulns",
            Self::Creds => "creds",
            Self::Loots => "loots",
            Self::Notes => "notes",
            Self::Sessions => "sessions",
        }
    }
}

impl std::fmt::Display for FindingCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 워크스페이스별 발견 항목 수
///
/// 데이터 저장소에서 계산한 값을 메모리에만 보관합니다 (저장하지 않음).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingCounts {
    pub hosts: u64,
    pub services: u64,
    pub vulns: u64,
    pub creds: u64,
    pub loots: u64,
    pub notes: u64,
    pub sessions: u64,
    pub total: u64,
}

impl FindingCounts {
    /// 카테고리별 값으로 생성 (total은 자동 계산)
    pub fn from_categories(values: impl IntoIterator<Item = (FindingCategory, u64)>) -> Self {
        let mut counts = Self::default();
        for (category, value) in values {
            counts.set(category, value);
        }
        counts
    }

    pub fn get(&self, category: FindingCategory) -> u64 {
        match category {
            FindingCategory::Hosts => self.hosts,
            FindingCategory::Services => self.services,
            FindingCategory::Vulns => self.vulns,
            FindingCategory::Creds => self.creds,
            FindingCategory::Loots => self.loots,
            FindingCategory::Notes => self.notes,
            FindingCategory::Sessions => self.sessions,
        }
    }

    /// 값 설정 후 total 재계산
    pub fn set(&mut self, category: FindingCategory, value: u64) {
        let slot = match category {
            FindingCategory::Hosts => &mut self.hosts,
            FindingCategory::Services => &mut self.services,
            FindingCategory::Vulns => &mut self.vulns,
            FindingCategory::Creds => &mut self.creds,
            FindingCategory::Loots => &mut self.loots,
            FindingCategory::Notes => &mut self.notes,
            FindingCategory::Sessions => &mut self.sessions,
        };
        *slot = value;
        self.total = FindingCategory::ALL.iter().map(|c| self.get(*c)).sum();
    }

    /// 이전 값 대비 변경된 카테고리만 delta로 반환
    pub fn changes_since(&self, previous: &FindingCounts) -> BTreeMap<FindingCategory, i64> {
        FindingCategory::ALL
            .iter()
            .filter_map(|category| {
                let delta = self.get(*category) as i64 - previous.get(*category) as i64;
                (delta != 0).then_some((*category, delta))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_display() {
        let scope = Scope::track(WorkspaceId(1), ContainerId(2), TrackId(3));
        assert_eq!(scope.to_string(), "workspace-1/container-2/track-3");
        assert_eq!(Scope::workspace(WorkspaceId(9)).to_string(), "workspace-9");
    }

    #[test]
    fn test_counts_total_tracks_categories() {
        let mut counts = FindingCounts::from_categories([
            (FindingCategory::Hosts, 3),
            (FindingCategory::Services, 5),
        ]);
        assert_eq!(counts.total, 8);

        counts.set(FindingCategory::Hosts, 1);
        assert_eq!(counts.total, 6);
    }

    #[test]
    fn test_changes_since_only_reports_changed() {
        let before = FindingCounts::from_categories([(FindingCategory::Notes, 2)]);
        let after = FindingCounts::from_categories([
            (FindingCategory::Notes, 2),
            (FindingCategory::Hosts, 3),
        ]);

        let changes = after.changes_since(&before);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.get(&FindingCategory::Hosts), Some(&3));
        assert!(after.changes_since(&after).is_empty());
    }
}
