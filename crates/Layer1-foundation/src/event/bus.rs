//! Event Bus - 토픽 기반 이벤트 브로드캐스트
//!
//! 토픽마다 bounded broadcast 채널을 하나씩 둡니다.
//! 발행은 동기적이며 절대 블록되지 않습니다. 느린 구독자는 가장 오래된
//! 이벤트를 잃고 경고를 남긴 뒤 계속 수신합니다.

use super::types::{Event, Topic};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

// ============================================================================
// EventListener Trait
// ============================================================================

/// 이벤트 리스너 trait
///
/// [`EventBus::attach`]로 토픽에 연결하면 전용 태스크에서 이벤트를 받습니다.
#[async_trait]
pub trait EventListener: Send + Sync {
    /// 리스너 이름 (디버깅용)
    fn name(&self) -> &str;

    /// 이벤트 처리
    async fn on_event(&self, event: &Event);
}

// ============================================================================
// Subscription
// ============================================================================

/// 토픽 구독
///
/// 구독자별 FIFO 순서가 보장됩니다. 구독 이전에 발행된 이벤트는 받지 않습니다.
pub struct Subscription {
    topic: Topic,
    receiver: broadcast::Receiver<Arc<Event>>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// 다음 이벤트 대기
    ///
    /// 버스가 사라지면 `None`을 반환합니다.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "Slow subscriber dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// 대기 중인 이벤트를 블록 없이 꺼냄
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "Slow subscriber dropped events");
                }
                Err(_) => return None,
            }
        }
    }
}

// ============================================================================
// EventBus
// ============================================================================

/// 이벤트 버스 설정
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// 토픽별 브로드캐스트 채널 용량
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

/// 이벤트 버스
///
/// ## 사용법
///
/// ```ignore
/// use kestrel_foundation::event::{Event, EventBus, Topic};
///
/// let bus = EventBus::new();
/// let mut sub = bus.subscribe(Topic::workspace(workspace_id));
///
/// bus.publish(event);
/// let received = sub.recv().await;
/// ```
pub struct EventBus {
    /// 설정
    config: EventBusConfig,

    /// 토픽별 송신자
    topics: RwLock<HashMap<Topic, broadcast::Sender<Arc<Event>>>>,

    /// 발행된 이벤트 수
    event_count: AtomicU64,
}

impl EventBus {
    /// 기본 설정으로 이벤트 버스 생성
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    /// 커스텀 설정으로 이벤트 버스 생성
    pub fn with_config(config: EventBusConfig) -> Self {
        Self {
            config: EventBusConfig {
                channel_capacity: config.channel_capacity.max(1),
            },
            topics: RwLock::new(HashMap::new()),
            event_count: AtomicU64::new(0),
        }
    }

    /// 토픽별 채널 용량 지정
    pub fn with_capacity(channel_capacity: usize) -> Self {
        Self::with_config(EventBusConfig { channel_capacity })
    }

    /// 토픽 구독
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let receiver = {
            let mut topics = self.topics.write();
            topics
                .entry(topic)
                .or_insert_with(|| broadcast::channel(self.config.channel_capacity).0)
                .subscribe()
        };

        debug!(topic = %topic, "Subscribed to topic");
        Subscription { topic, receiver }
    }

    /// 이벤트 발행
    ///
    /// 이벤트 범위를 포함하는 모든 토픽의 현재 구독자에게 전달하고,
    /// 전달된 구독자 수를 반환합니다.
    pub fn publish(&self, event: Event) -> usize {
        let event = Arc::new(event);
        let count = self.event_count.fetch_add(1, Ordering::Relaxed) + 1;
        let mut delivered = 0;
        let mut idle = Vec::new();

        {
            let topics = self.topics.read();
            for topic in Topic::covering(&event.scope) {
                let Some(sender) = topics.get(&topic) else {
                    continue;
                };
                match sender.send(Arc::clone(&event)) {
                    Ok(receivers) => delivered += receivers,
                    Err(_) => idle.push(topic),
                }
            }
        }

        if !idle.is_empty() {
            self.prune(&idle);
        }

        trace!(
            event_id = %event.id,
            event_type = event.name(),
            scope = %event.scope,
            delivered,
            "Published event #{}", count
        );

        delivered
    }

    /// 리스너를 토픽에 연결
    ///
    /// 버스가 닫히거나 태스크가 abort될 때까지 이벤트를 순서대로 전달합니다.
    pub fn attach(&self, topic: Topic, listener: Arc<dyn EventListener>) -> JoinHandle<()> {
        let mut subscription = self.subscribe(topic);
        debug!(listener_name = listener.name(), topic = %topic, "Attaching event listener");

        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                trace!(
                    listener_name = listener.name(),
                    event_type = event.name(),
                    "Delivering event to listener"
                );
                listener.on_event(&event).await;
            }
        })
    }

    /// 토픽의 현재 구독자 수
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// 구독자가 남아 있는 토픽 수
    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    /// 총 발행된 이벤트 수
    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    /// 구독자가 없는 토픽 정리
    fn prune(&self, candidates: &[Topic]) {
        let mut topics = self.topics.write();
        for topic in candidates {
            if topics
                .get(topic)
                .is_some_and(|sender| sender.receiver_count() == 0)
            {
                topics.remove(topic);
                trace!(topic = %topic, "Pruned idle topic");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// 테스트
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ContainerId, ContainerStatus, Scope, TrackId, WorkspaceId};
    use std::sync::atomic::AtomicUsize;

    fn status_event(scope: Scope, restart_count: u32) -> Event {
        Event::container_status(scope, ContainerStatus::Running, restart_count, None, None)
    }

    fn track_scope() -> Scope {
        Scope::track(WorkspaceId(1), ContainerId(2), TrackId(3))
    }

    #[tokio::test]
    async fn test_fan_out_to_enclosing_topics() {
        let bus = EventBus::new();
        let mut workspace = bus.subscribe(Topic::workspace(WorkspaceId(1)));
        let mut container = bus.subscribe(Topic::container(WorkspaceId(1), ContainerId(2)));
        let mut track = bus.subscribe(Topic::track(WorkspaceId(1), ContainerId(2), TrackId(3)));
        let mut other = bus.subscribe(Topic::workspace(WorkspaceId(9)));

        let delivered = bus.publish(status_event(track_scope(), 0));
        assert_eq!(delivered, 3);

        assert!(workspace.recv().await.is_some());
        assert!(container.recv().await.is_some());
        assert!(track.recv().await.is_some());
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_narrow_subscriber_misses_wider_event() {
        let bus = EventBus::new();
        let mut track = bus.subscribe(Topic::track(WorkspaceId(1), ContainerId(2), TrackId(3)));

        bus.publish(status_event(Scope::container(WorkspaceId(1), ContainerId(2)), 0));
        assert!(track.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_per_subscriber_fifo() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Topic::workspace(WorkspaceId(1)));

        for i in 0..10 {
            bus.publish(status_event(track_scope(), i));
        }

        for expected in 0..10 {
            let event = sub.recv().await.unwrap();
            match &event.kind {
                crate::event::EventKind::ContainerStatusChanged { restart_count, .. } => {
                    assert_eq!(*restart_count, expected)
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::with_capacity(4);
        let mut sub = bus.subscribe(Topic::workspace(WorkspaceId(1)));

        for i in 0..10 {
            bus.publish(status_event(track_scope(), i));
        }

        // 오래된 이벤트는 버려지고 최신 4개만 남음
        let mut received = Vec::new();
        while let Some(event) = sub.try_recv() {
            if let crate::event::EventKind::ContainerStatusChanged { restart_count, .. } =
                &event.kind
            {
                received.push(*restart_count);
            }
        }
        assert_eq!(received, vec![6, 7, 8, 9]);
        assert_eq!(bus.event_count(), 10);
    }

    #[tokio::test]
    async fn test_no_replay_and_pruning() {
        let bus = EventBus::new();
        bus.publish(status_event(track_scope(), 0));

        let sub = bus.subscribe(Topic::workspace(WorkspaceId(1)));
        assert_eq!(bus.subscriber_count(&Topic::workspace(WorkspaceId(1))), 1);
        drop(sub);

        assert_eq!(bus.topic_count(), 1);
        assert_eq!(bus.publish(status_event(track_scope(), 1)), 0);
        assert_eq!(bus.topic_count(), 0);
    }

    struct CountingListener {
        count: AtomicUsize,
    }

    #[async_trait]
    impl EventListener for CountingListener {
        fn name(&self) -> &str {
            "counting"
        }

        async fn on_event(&self, _event: &Event) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_attached_listener() {
        let bus = EventBus::new();
        let listener = Arc::new(CountingListener {
            count: AtomicUsize::new(0),
        });
        let handle = bus.attach(Topic::workspace(WorkspaceId(1)), listener.clone());

        bus.publish(status_event(track_scope(), 0));
        bus.publish(status_event(track_scope(), 1));

        for _ in 0..100 {
            if listener.count.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(listener.count.load(Ordering::SeqCst), 2);
        handle.abort();
    }
}
