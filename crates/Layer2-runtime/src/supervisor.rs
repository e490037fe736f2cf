//! Supervisor - 액터 태스크 감시 및 재기동
//!
//! 액터 하나는 `tokio::spawn`된 태스크 하나입니다. 태스크가 panic하면
//! 같은 inbox를 물려받은 새 인스턴스를 띄웁니다 (`max_actor_restarts`까지).
//! 정상 종료(shutdown)면 감시도 끝납니다.
//!
//! ```text
//! Handle ──mpsc──▶ inbox (Arc<Mutex<Receiver>>)
//!                      │
//!          ┌───────────┴───────────┐
//!          ▼                       ▼
//!   incarnation #0  ──panic──▶ incarnation #1 (last snapshot 복구)
//! ```

use async_trait::async_trait;
use kestrel_foundation::{Error, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, error, warn};

/// 액터 inbox 용량
pub const MAILBOX_CAPACITY: usize = 64;

// ============================================================================
// Actor Trait
// ============================================================================

/// 감시 대상 액터
#[async_trait]
pub trait Actor: Send + Sized + 'static {
    type Message: Send + 'static;

    /// 로깅용 이름
    fn name(&self) -> String;

    /// inbox가 닫히거나 shutdown을 받을 때까지 실행
    async fn run(self, inbox: &mut mpsc::Receiver<Self::Message>);
}

/// 몇 번째 인스턴스인지 (0 = 최초 기동)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Incarnation(pub u32);

impl Incarnation {
    pub fn is_recovery(&self) -> bool {
        self.0 > 0
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// 액터를 감시 하에 실행
///
/// `factory`는 인스턴스마다 새 상태로 액터를 만듭니다. 복구 시에는 보통
/// 마지막 snapshot을 읽어 초기 상태를 정합니다.
pub fn supervise<A, F>(
    inbox: mpsc::Receiver<A::Message>,
    max_restarts: u32,
    factory: F,
) -> JoinHandle<()>
where
    A: Actor,
    F: Fn(Incarnation) -> A + Send + 'static,
{
    let inbox = Arc::new(Mutex::new(inbox));

    tokio::spawn(async move {
        let mut restarts = 0u32;

        loop {
            let actor = factory(Incarnation(restarts));
            let name = actor.name();
            let inbox = Arc::clone(&inbox);

            let task = tokio::spawn(async move {
                let mut inbox = inbox.lock_owned().await;
                actor.run(&mut inbox).await;
            });

            match task.await {
                Ok(()) => {
                    debug!(actor = %name, "Actor exited");
                    break;
                }
                Err(e) if e.is_panic() => {
                    if restarts >= max_restarts {
                        error!(actor = %name, restarts, "Actor crashed, restart budget exhausted");
                        break;
                    }
                    restarts += 1;
                    warn!(actor = %name, attempt = restarts, "Actor crashed, restarting");
                }
                Err(_) => {
                    debug!(actor = %name, "Actor task cancelled");
                    break;
                }
            }
        }
    })
}

// ============================================================================
// Mailbox helpers
// ============================================================================

/// 요청을 보내고 응답을 기다림
///
/// 액터가 사라졌으면 `ActorUnavailable`, 응답이 늦으면 `Timeout`.
pub(crate) async fn request<M, T>(
    tx: &mpsc::Sender<M>,
    actor: &str,
    wait: Duration,
    make: impl FnOnce(oneshot::Sender<T>) -> M,
) -> Result<T> {
    let (response_tx, response_rx) = oneshot::channel();

    tokio::time::timeout(wait, tx.send(make(response_tx)))
        .await
        .map_err(|_| Error::Timeout(format!("{} inbox is full", actor)))?
        .map_err(|_| Error::ActorUnavailable(actor.to_string()))?;

    tokio::time::timeout(wait, response_rx)
        .await
        .map_err(|_| Error::Timeout(format!("{} did not reply", actor)))?
        .map_err(|_| Error::ActorUnavailable(actor.to_string()))
}

/// 응답 없는 메시지 전송
pub(crate) async fn tell<M>(tx: &mpsc::Sender<M>, actor: &str, wait: Duration, msg: M) -> Result<()> {
    tokio::time::timeout(wait, tx.send(msg))
        .await
        .map_err(|_| Error::Timeout(format!("{} inbox is full", actor)))?
        .map_err(|_| Error::ActorUnavailable(actor.to_string()))
}

/// 응답 채널로 결과 전달 (호출자가 이미 떠났으면 무시)
pub(crate) fn reply<T>(response_tx: oneshot::Sender<T>, value: T) {
    let _ = response_tx.send(value);
}

/// 액터 타이머 (한 번에 최대 하나)
pub(crate) type Timer = Option<Pin<Box<Sleep>>>;

pub(crate) fn arm(delay: Duration) -> Timer {
    Some(Box::pin(tokio::time::sleep(delay)))
}

/// 타이머가 없으면 영원히 대기
pub(crate) fn fired(timer: &mut Timer) -> impl Future<Output = ()> + '_ {
    async move {
        match timer {
            Some(sleep) => sleep.as_mut().await,
            None => std::future::pending().await,
        }
    }
}

/// 협력자 호출에 시간 제한 적용
pub(crate) async fn bounded<T, E>(
    wait: Duration,
    on_timeout: E,
    call: impl Future<Output = std::result::Result<T, E>>,
) -> std::result::Result<T, E> {
    match tokio::time::timeout(wait, call).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout),
    }
}
