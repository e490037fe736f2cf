//! Console history - ordered record of what happened on a track

use chrono::{DateTime, Utc};
use kestrel_foundation::{CommandExecution, CommandId, CommandSource, CommandStatus};
use serde::{Deserialize, Serialize};

/// One discrete unit of console activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryBlock {
    /// Banner printed when the remote console is created
    Startup {
        output: String,
        prompt: String,
        at: DateTime<Utc>,
    },

    /// A command and everything it printed
    Command {
        id: CommandId,
        source: CommandSource,
        prompt: String,
        command: String,
        output: String,
        status: CommandStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        started_at: DateTime<Utc>,
        finished_at: Option<DateTime<Utc>>,
    },

    /// The console lost its session and is being reconnected
    Restart { reason: String, at: DateTime<Utc> },
}

impl HistoryBlock {
    pub fn is_restart(&self) -> bool {
        matches!(self, Self::Restart { .. })
    }
}

impl From<&CommandExecution> for HistoryBlock {
    fn from(record: &CommandExecution) -> Self {
        Self::Command {
            id: record.id,
            source: record.source,
            prompt: record.prompt.clone(),
            command: record.command.clone(),
            output: record.output.clone(),
            status: record.status,
            error: record.error.clone(),
            started_at: record.issued_at,
            finished_at: record.finished_at,
        }
    }
}

/// Append-only block list
#[derive(Debug, Clone, Default)]
pub struct ConsoleHistory {
    blocks: Vec<HistoryBlock>,
}

impl ConsoleHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_startup(&mut self, output: impl Into<String>, prompt: impl Into<String>) {
        self.blocks.push(HistoryBlock::Startup {
            output: output.into(),
            prompt: prompt.into(),
            at: Utc::now(),
        });
    }

    /// Only terminal records belong in history
    pub fn push_command(&mut self, record: &CommandExecution) {
        debug_assert!(record.status.is_terminal());
        self.blocks.push(HistoryBlock::from(record));
    }

    /// Consecutive restart markers collapse into the latest one
    pub fn push_restart(&mut self, reason: impl Into<String>) {
        let block = HistoryBlock::Restart {
            reason: reason.into(),
            at: Utc::now(),
        };
        match self.blocks.last_mut() {
            Some(last) if last.is_restart() => *last = block,
            _ => self.blocks.push(block),
        }
    }

    pub fn blocks(&self) -> &[HistoryBlock] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_foundation::{ContainerId, Scope, TrackId, WorkspaceId};

    #[test]
    fn test_restart_markers_collapse() {
        let mut history = ConsoleHistory::new();
        history.push_startup("banner", "msf6 > ");
        history.push_restart("connection refused");
        history.push_restart("connection refused again");

        assert_eq!(history.len(), 2);
        match &history.blocks()[1] {
            HistoryBlock::Restart { reason, .. } => assert_eq!(reason, "connection refused again"),
            other => panic!("unexpected block {:?}", other),
        }
    }

    #[test]
    fn test_command_block_keeps_prompt_before_command() {
        let scope = Scope::track(WorkspaceId(1), ContainerId(1), TrackId(1));
        let issued = CommandExecution::issued(scope, CommandSource::User, "hosts", "msf6 > ");
        let mut history = ConsoleHistory::new();
        history.push_command(&issued.finished("Hosts\n====="));

        match &history.blocks()[0] {
            HistoryBlock::Command {
                prompt,
                command,
                output,
                status,
                ..
            } => {
                assert_eq!(prompt, "msf6 > ");
                assert_eq!(command, "hosts");
                assert_eq!(output, "Hosts\n=====");
                assert_eq!(*status, CommandStatus::Finished);
            }
            other => panic!("unexpected block {:?}", other),
        }
    }
}
