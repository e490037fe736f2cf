//! Event System - 토픽 기반 이벤트 발행/구독
//!
//! 액터 사이의 교차 효과는 모두 이벤트 버스를 통해 흐릅니다.
//!
//! ## 아키텍처
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        EventBus                              │
//! │  publish(event{scope = w/c/t})                               │
//! │         │                                                    │
//! │         ├──▶ Topic::Workspace(w)      ──▶ Workspace Actor    │
//! │         ├──▶ Topic::Container(w, c)   ──▶ observers          │
//! │         └──▶ Topic::Track(w, c, t)    ──▶ observers          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## 사용법
//!
//! ```ignore
//! use kestrel_foundation::event::{EventBus, Topic};
//!
//! let bus = EventBus::with_capacity(256);
//! let mut sub = bus.subscribe(Topic::workspace(workspace_id));
//!
//! while let Some(event) = sub.recv().await {
//!     println!("{}: {}", event.scope, event.name());
//! }
//! ```

mod bus;
mod types;

pub use bus::{EventBus, EventBusConfig, EventListener, Subscription};
pub use types::{Event, EventId, EventKind, Topic};
