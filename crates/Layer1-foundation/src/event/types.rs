//! Event Types - 런타임 전체에서 사용되는 이벤트 타입 정의
//!
//! 액터들이 발행하는 생명주기/명령/집계 이벤트를 정의합니다.
//! 모든 이벤트는 scope를 가지므로 구독자는 토픽 단위로 필터링합니다.

use crate::core::{
    CommandExecution, ConsoleStatus, ContainerId, ContainerStatus, FindingCategory,
    FindingCounts, Scope, TrackId, WorkspaceId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Event ID
// ============================================================================

/// 이벤트 고유 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub uuid::Uuid);

impl EventId {
    /// 새 이벤트 ID 생성
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Topic
// ============================================================================

/// 구독 토픽
///
/// `(w, c, t)` 범위의 이벤트는 `Workspace(w)`, `Container(w, c)`,
/// `Track(w, c, t)` 세 토픽 모두에 전달됩니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Topic {
    Workspace {
        workspace_id: WorkspaceId,
    },
    Container {
        workspace_id: WorkspaceId,
        container_id: ContainerId,
    },
    Track {
        workspace_id: WorkspaceId,
        container_id: ContainerId,
        track_id: TrackId,
    },
}

impl Topic {
    pub fn workspace(workspace_id: WorkspaceId) -> Self {
        Self::Workspace { workspace_id }
    }

    pub fn container(workspace_id: WorkspaceId, container_id: ContainerId) -> Self {
        Self::Container {
            workspace_id,
            container_id,
        }
    }

    pub fn track(workspace_id: WorkspaceId, container_id: ContainerId, track_id: TrackId) -> Self {
        Self::Track {
            workspace_id,
            container_id,
            track_id,
        }
    }

    /// 이 범위의 이벤트가 도달하는 모든 토픽 (넓은 것부터)
    pub fn covering(scope: &Scope) -> Vec<Topic> {
        let mut topics = vec![Topic::workspace(scope.workspace_id)];
        if let Some(container_id) = scope.container_id {
            topics.push(Topic::container(scope.workspace_id, container_id));
            if let Some(track_id) = scope.track_id {
                topics.push(Topic::track(scope.workspace_id, container_id, track_id));
            }
        }
        topics
    }

    pub fn workspace_id(&self) -> WorkspaceId {
        match self {
            Self::Workspace { workspace_id }
            | Self::Container { workspace_id, .. }
            | Self::Track { workspace_id, .. } => *workspace_id,
        }
    }
}

impl From<Scope> for Topic {
    /// 가장 좁은 토픽
    fn from(scope: Scope) -> Self {
        match (scope.container_id, scope.track_id) {
            (Some(c), Some(t)) => Topic::track(scope.workspace_id, c, t),
            (Some(c), None) => Topic::container(scope.workspace_id, c),
            _ => Topic::workspace(scope.workspace_id),
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Workspace { workspace_id } => write!(f, "{}", workspace_id),
            Self::Container {
                workspace_id,
                container_id,
            } => write!(f, "{}/{}", workspace_id, container_id),
            Self::Track {
                workspace_id,
                container_id,
                track_id,
            } => write!(f, "{}/{}/{}", workspace_id, container_id, track_id),
        }
    }
}

// ============================================================================
// Event Kind
// ============================================================================

/// 이벤트 종류별 페이로드
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// 컨테이너 상태 전이
    ContainerStatusChanged {
        status: ContainerStatus,
        restart_count: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        backoff_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// 콘솔 상태 전이
    ConsoleStatusChanged {
        status: ConsoleStatus,
        prompt: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// 명령이 콘솔에 기록됨
    CommandIssued { command: CommandExecution },

    /// 명령 진행/완료 (`command.status`가 running, finished, error 중 하나)
    CommandResult { command: CommandExecution },

    /// 워크스페이스 발견 항목 집계 변경
    DatabaseUpdated {
        changes: BTreeMap<FindingCategory, i64>,
        totals: FindingCounts,
    },
}

impl EventKind {
    /// 이벤트 타입 문자열
    pub fn name(&self) -> &'static str {
        match self {
            Self::ContainerStatusChanged { .. } => "container_status_changed",
            Self::ConsoleStatusChanged { .. } => "console_status_changed",
            Self::CommandIssued { .. } => "command_issued",
            Self::CommandResult { .. } => "command_result",
            Self::DatabaseUpdated { .. } => "database_updated",
        }
    }
}

// ============================================================================
// Event
// ============================================================================

/// 런타임 이벤트
///
/// 발행 후에는 `Arc`로 공유되며 수정되지 않습니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub scope: Scope,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    /// 새 이벤트 생성
    pub fn new(scope: Scope, kind: EventKind) -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            scope,
            kind,
        }
    }

    pub fn container_status(
        scope: Scope,
        status: ContainerStatus,
        restart_count: u32,
        backoff_ms: Option<u64>,
        reason: Option<String>,
    ) -> Self {
        Self::new(
            scope,
            EventKind::ContainerStatusChanged {
                status,
                restart_count,
                backoff_ms,
                reason,
            },
        )
    }

    pub fn console_status(
        scope: Scope,
        status: ConsoleStatus,
        prompt: impl Into<String>,
        reason: Option<String>,
    ) -> Self {
        Self::new(
            scope,
            EventKind::ConsoleStatusChanged {
                status,
                prompt: prompt.into(),
                reason,
            },
        )
    }

    pub fn command_issued(command: CommandExecution) -> Self {
        Self::new(command.scope, EventKind::CommandIssued { command })
    }

    pub fn command_result(command: CommandExecution) -> Self {
        Self::new(command.scope, EventKind::CommandResult { command })
    }

    pub fn database_updated(
        workspace_id: WorkspaceId,
        changes: BTreeMap<FindingCategory, i64>,
        totals: FindingCounts,
    ) -> Self {
        Self::new(
            Scope::workspace(workspace_id),
            EventKind::DatabaseUpdated { changes, totals },
        )
    }

    /// 이벤트 타입 문자열
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// 결과가 확정된 명령 기록 (finished/error)
    pub fn completed_command(&self) -> Option<&CommandExecution> {
        match &self.kind {
            EventKind::CommandResult { command } if command.status.is_terminal() => Some(command),
            _ => None,
        }
    }

    /// JSON 문자열로 직렬화
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// 테스트
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CommandSource, CommandStatus};

    fn track_scope() -> Scope {
        Scope::track(WorkspaceId(1), ContainerId(2), TrackId(3))
    }

    #[test]
    fn test_covering_topics() {
        let topics = Topic::covering(&track_scope());
        assert_eq!(
            topics,
            vec![
                Topic::workspace(WorkspaceId(1)),
                Topic::container(WorkspaceId(1), ContainerId(2)),
                Topic::track(WorkspaceId(1), ContainerId(2), TrackId(3)),
            ]
        );

        let topics = Topic::covering(&Scope::workspace(WorkspaceId(7)));
        assert_eq!(topics, vec![Topic::workspace(WorkspaceId(7))]);
    }

    #[test]
    fn test_narrowest_topic() {
        let topic = Topic::from(track_scope());
        assert_eq!(topic.to_string(), "workspace-1/container-2/track-3");
        assert_eq!(topic.workspace_id(), WorkspaceId(1));
    }

    #[test]
    fn test_completed_command() {
        let issued =
            CommandExecution::issued(track_scope(), CommandSource::Agent, "db_nmap -sV host", "msf6 > ");

        let running = Event::command_result(issued.running("Starting Nmap"));
        assert!(running.completed_command().is_none());

        let finished = Event::command_result(issued.finished("done"));
        let record = finished.completed_command().unwrap();
        assert_eq!(record.status, CommandStatus::Finished);
        assert_eq!(record.id, issued.id);
        assert_eq!(finished.scope, track_scope());
    }

    #[test]
    fn test_event_json_shape() {
        let mut changes = BTreeMap::new();
        changes.insert(FindingCategory::Hosts, 3);
        let mut totals = FindingCounts::default();
        totals.set(FindingCategory::Hosts, 3);

        let event = Event::database_updated(WorkspaceId(1), changes, totals);
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "database_updated");
        assert_eq!(json["scope"]["workspace_id"], 1);
        assert_eq!(json["changes"]["hosts"], 3);
        assert_eq!(json["totals"]["hosts"], 3);
    }
}
