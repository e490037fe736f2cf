//! Event log - 이벤트를 JSON 한 줄씩 출력

use async_trait::async_trait;
use kestrel_foundation::{Event, EventListener};
use std::io::Write;
use tracing::warn;

/// stdout JSON Lines 리스너
pub struct JsonLineLogger;

impl JsonLineLogger {
    pub fn format(event: &Event) -> Option<String> {
        match event.to_json() {
            Ok(line) => Some(line),
            Err(e) => {
                warn!(event = event.name(), error = %e, "Failed to serialize event");
                None
            }
        }
    }
}

#[async_trait]
impl EventListener for JsonLineLogger {
    fn name(&self) -> &str {
        "json-lines"
    }

    async fn on_event(&self, event: &Event) {
        let Some(line) = Self::format(event) else {
            return;
        };
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", line) {
            warn!(error = %e, "Failed to write event");
        }
    }
}
