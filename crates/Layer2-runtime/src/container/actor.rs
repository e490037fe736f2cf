//! Container Actor
//!
//! 프로세스 하나를 소유하며 상태 전이는 이 태스크 안에서만 일어납니다.
//!
//! 재시작 규칙:
//! - 기동 실패 또는 `unhealthy` 진입마다 현재 백오프만큼 기다린 뒤 재시작하고,
//!   백오프는 두 배가 됩니다 (`restart_max_backoff_ms`에서 멈춤).
//! - 한 장애 구간에서 `max_restart_count`번 재시작해도 실패하면 `failed`.
//! - `success_reset_window` 동안 계속 건강하면 카운터와 백오프를 초기화합니다.

use super::state::{transition, ContainerTransition};
use super::{ContainerContext, ContainerMessage, ContainerSnapshot};
use crate::adapter::{AdapterError, ContainerAdapter, ContainerRef, ContainerSpec};
use crate::backoff::Backoff;
use crate::console::ConsoleHandle;
use crate::rpc::RpcEndpoint;
use crate::supervisor::{arm, bounded, fired, reply, Actor, Timer};
use async_trait::async_trait;
use chrono::Utc;
use kestrel_foundation::{
    ContainerStatus, Error, Event, EventBus, Result, RuntimeConfig, Scope, TrackId,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

type ConsoleSet = Arc<parking_lot::Mutex<BTreeMap<TrackId, ConsoleHandle>>>;

enum Wake {
    Message(Option<ContainerMessage>),
    RestartDue,
    HealthTick,
}

pub(super) struct ContainerActor {
    scope: Scope,
    spec: ContainerSpec,
    rpc_password: String,
    config: Arc<RuntimeConfig>,
    adapter: Arc<dyn ContainerAdapter>,
    bus: Arc<EventBus>,
    consoles: ConsoleSet,
    snapshot_tx: Arc<watch::Sender<ContainerSnapshot>>,
    recovered: Option<ContainerSnapshot>,

    status: ContainerStatus,
    current: Option<ContainerRef>,
    endpoint: Option<RpcEndpoint>,
    restart_count: u32,
    total_restarts: u32,
    consecutive_failures: u32,
    backoff: Backoff,
    last_error: Option<String>,
    healthy_since: Option<Instant>,

    restart_timer: Timer,
    health_timer: Timer,
}

impl ContainerActor {
    pub(super) fn new(
        ctx: &ContainerContext,
        snapshot_tx: Arc<watch::Sender<ContainerSnapshot>>,
        consoles: ConsoleSet,
        recovered: Option<ContainerSnapshot>,
    ) -> Self {
        let config = Arc::clone(&ctx.config);
        Self {
            scope: ctx.scope,
            spec: ctx.spec.clone(),
            rpc_password: ctx.rpc_password.clone(),
            adapter: Arc::clone(&ctx.adapter),
            bus: Arc::clone(&ctx.bus),
            consoles,
            snapshot_tx,
            recovered,
            status: ContainerStatus::Stopped,
            current: None,
            endpoint: None,
            restart_count: 0,
            total_restarts: 0,
            consecutive_failures: 0,
            backoff: Backoff::new(config.restart_base_backoff_ms, config.restart_max_backoff_ms),
            last_error: None,
            healthy_since: None,
            restart_timer: None,
            health_timer: None,
            config,
        }
    }

    // ========================================================================
    // Message handling
    // ========================================================================

    /// false면 액터 종료
    async fn handle(&mut self, msg: ContainerMessage) -> bool {
        match msg {
            ContainerMessage::Start { response_tx } => {
                if let Err(e) = self.begin_start() {
                    reply(response_tx, Err(e));
                    return true;
                }
                reply(response_tx, Ok(()));
                self.launch().await;
            }
            ContainerMessage::Restart { response_tx } => {
                if let Err(e) = self.begin_operator_restart() {
                    reply(response_tx, Err(e));
                    return true;
                }
                reply(response_tx, Ok(()));
                self.relaunch("restart requested").await;
            }
            ContainerMessage::Stop { response_tx } => {
                self.stop_all("stopped by request").await;
                reply(response_tx, Ok(()));
            }
            ContainerMessage::AttachConsole {
                track_id,
                console,
                response_tx,
            } => {
                self.consoles.lock().insert(track_id, console.clone());
                if let (ContainerStatus::Running, Some(endpoint)) = (self.status, &self.endpoint) {
                    if let Err(e) = console.container_ready(endpoint.clone()).await {
                        warn!(scope = %self.scope, track_id = %track_id, error = %e, "Failed to hand endpoint to console");
                    }
                }
                self.publish_snapshot();
                reply(response_tx, ());
            }
            ContainerMessage::DetachConsole {
                track_id,
                response_tx,
            } => {
                let console = self.consoles.lock().remove(&track_id);
                self.publish_snapshot();
                reply(response_tx, console);
            }
            ContainerMessage::Shutdown { response_tx } => {
                self.stop_all("runtime shutting down").await;
                reply(response_tx, ());
                return false;
            }
        }
        true
    }

    /// 수동 시작: 카운터 초기화 후 `starting`
    fn begin_start(&mut self) -> Result<()> {
        let next = transition(self.status, ContainerTransition::Start)?;
        self.restart_count = 0;
        self.consecutive_failures = 0;
        self.backoff.reset();
        self.last_error = None;
        self.set_status(next, None, None);
        Ok(())
    }

    fn begin_operator_restart(&mut self) -> Result<()> {
        // 예산을 다 쓴 컨테이너는 재시작 대신 start로 수동 복구
        if self.status == ContainerStatus::Failed {
            return Err(Error::ContainerFailed {
                reason: self
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "restart budget exhausted".to_string()),
            });
        }
        let next = transition(self.status, ContainerTransition::Restart)?;
        self.restart_timer = None;
        self.health_timer = None;
        self.total_restarts += 1;
        self.set_status(next, None, Some("restart requested".to_string()));
        Ok(())
    }

    // ========================================================================
    // Launch / restart
    // ========================================================================

    /// 프로세스 생성 + 기동
    async fn launch(&mut self) {
        match self.create_and_start().await {
            Ok((container, address)) => {
                let host = address.unwrap_or_else(|| container.name.clone());
                let endpoint = RpcEndpoint::new(host, self.spec.rpc_port, self.rpc_password.clone());
                info!(scope = %self.scope, container = %container.name, host = %endpoint.host, "Container running");

                self.current = Some(container);
                self.endpoint = Some(endpoint.clone());
                self.healthy_since = Some(Instant::now());
                self.apply(ContainerTransition::Started);
                self.health_timer = arm(self.config.health_check_interval());
                self.publish_status(None, None);
                self.notify_ready(endpoint).await;
            }
            Err(err) => self.on_start_failed(err).await,
        }
    }

    async fn create_and_start(&self) -> std::result::Result<(ContainerRef, Option<String>), AdapterError> {
        let wait = self.config.call_timeout();
        let container = bounded(wait, AdapterError::Timeout, self.adapter.create(&self.spec)).await?;

        if let Err(e) = bounded(wait, AdapterError::Timeout, self.adapter.start(&container)).await {
            // 반쯤 만들어진 컨테이너는 남기지 않음
            if let Err(cleanup) =
                bounded(wait, AdapterError::Timeout, self.adapter.stop(&container)).await
            {
                debug!(scope = %self.scope, error = %cleanup, "Cleanup after failed start failed");
            }
            return Err(e);
        }

        let address = match bounded(wait, AdapterError::Timeout, self.adapter.inspect(&container)).await {
            Ok(info) => info.address,
            Err(e) => {
                debug!(scope = %self.scope, error = %e, "Inspect after start failed");
                None
            }
        };

        Ok((container, address))
    }

    async fn on_start_failed(&mut self, err: AdapterError) {
        self.consecutive_failures += 1;
        self.last_error = Some(err.to_string());
        self.apply(ContainerTransition::StartFailed);

        if self.restart_count >= self.config.max_restart_count {
            self.exhaust(err.to_string()).await;
            return;
        }

        let delay = self.backoff.next_delay();
        warn!(
            scope = %self.scope,
            attempt = self.restart_count + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Container start failed, retrying"
        );
        self.restart_timer = arm(delay);
        self.publish_status(Some(delay.as_millis() as u64), Some(err.to_string()));
    }

    /// 백오프 만료
    async fn on_restart_due(&mut self) {
        if self.status == ContainerStatus::Unhealthy {
            self.apply(ContainerTransition::Restart);
        }
        if self.status != ContainerStatus::Restarting {
            return;
        }

        self.restart_count += 1;
        self.total_restarts += 1;
        info!(
            scope = %self.scope,
            attempt = self.restart_count,
            max = self.config.max_restart_count,
            "Restarting container"
        );
        self.publish_status(None, self.last_error.clone());
        self.relaunch("container restarting").await;
    }

    /// 콘솔을 내리고 이전 프로세스를 정지한 뒤 다시 기동
    async fn relaunch(&mut self, reason: &str) {
        self.notify_down(reason, true).await;
        self.stop_process().await;
        self.launch().await;
    }

    async fn exhaust(&mut self, reason: String) {
        self.apply(ContainerTransition::Exhausted);
        self.restart_timer = None;
        self.health_timer = None;
        self.healthy_since = None;

        error!(
            scope = %self.scope,
            restarts = self.restart_count,
            reason = %reason,
            "Container restart budget exhausted"
        );

        self.notify_down("container failed", false).await;
        self.stop_process().await;
        self.last_error = Some(reason.clone());
        self.publish_status(None, Some(reason));
    }

    // ========================================================================
    // Health
    // ========================================================================

    async fn on_health_tick(&mut self) {
        if !self.status.is_monitored() {
            return;
        }

        let failure = match &self.current {
            None => Some("no process".to_string()),
            Some(container) => {
                let wait = self.config.call_timeout();
                match bounded(wait, AdapterError::Timeout, self.adapter.inspect(container)).await {
                    Ok(info) if info.is_running() => None,
                    Ok(info) => Some(format!("process not running ({:?})", info.state)),
                    Err(e) => Some(e.to_string()),
                }
            }
        };

        match failure {
            None => self.on_check_passed(),
            Some(reason) => self.on_check_failed(reason).await,
        }

        if self.status.is_monitored() {
            self.health_timer = arm(self.config.health_check_interval());
        }
    }

    fn on_check_passed(&mut self) {
        if self.status == ContainerStatus::Unhealthy {
            info!(scope = %self.scope, "Container recovered");
            self.restart_timer = None;
            self.healthy_since = Some(Instant::now());
            self.apply(ContainerTransition::CheckPassed);
            self.publish_status(None, None);
            return;
        }

        let Some(since) = self.healthy_since else {
            self.healthy_since = Some(Instant::now());
            return;
        };

        let dirty = self.restart_count > 0
            || self.consecutive_failures > 0
            || self.backoff.peek().as_millis() as u64 != self.config.restart_base_backoff_ms;
        if dirty && since.elapsed() >= self.config.success_reset_window() {
            info!(
                scope = %self.scope,
                restarts = self.restart_count,
                "Container stable, resetting restart budget"
            );
            self.restart_count = 0;
            self.consecutive_failures = 0;
            self.backoff.reset();
            self.publish_snapshot();
        }
    }

    async fn on_check_failed(&mut self, reason: String) {
        debug!(scope = %self.scope, reason = %reason, "Health check failed");
        self.last_error = Some(reason.clone());

        // 재시작이 이미 예약됨
        if self.status == ContainerStatus::Unhealthy {
            self.publish_snapshot();
            return;
        }

        self.consecutive_failures += 1;
        self.healthy_since = None;
        self.apply(ContainerTransition::CheckFailed);

        if self.restart_count >= self.config.max_restart_count {
            self.exhaust(reason).await;
            return;
        }

        let delay = self.backoff.next_delay();
        warn!(
            scope = %self.scope,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Container unhealthy, restart scheduled"
        );
        self.restart_timer = arm(delay);
        self.publish_status(Some(delay.as_millis() as u64), Some(reason));
    }

    // ========================================================================
    // Stop
    // ========================================================================

    async fn stop_all(&mut self, reason: &str) {
        self.restart_timer = None;
        self.health_timer = None;
        self.healthy_since = None;

        if self.status == ContainerStatus::Stopped && self.current.is_none() {
            return;
        }

        self.notify_down(reason, false).await;
        self.stop_process().await;
        self.apply(ContainerTransition::Stop);
        info!(scope = %self.scope, "Container stopped");
        self.publish_status(None, None);
    }

    /// 현재 프로세스 정지 (실패해도 계속 진행)
    async fn stop_process(&mut self) {
        self.endpoint = None;
        let Some(container) = self.current.take() else {
            return;
        };

        let wait = self.config.call_timeout();
        if let Err(e) = bounded(wait, AdapterError::Timeout, self.adapter.stop(&container)).await {
            warn!(scope = %self.scope, container = %container.name, error = %e, "Failed to stop container");
        }
    }

    // ========================================================================
    // Consoles
    // ========================================================================

    fn console_handles(&self) -> Vec<(TrackId, ConsoleHandle)> {
        self.consoles
            .lock()
            .iter()
            .map(|(track_id, console)| (*track_id, console.clone()))
            .collect()
    }

    async fn notify_ready(&self, endpoint: RpcEndpoint) {
        for (track_id, console) in self.console_handles() {
            if let Err(e) = console.container_ready(endpoint.clone()).await {
                warn!(scope = %self.scope, track_id = %track_id, error = %e, "Failed to notify console");
            }
        }
    }

    /// 모든 콘솔을 offline으로 내리고 응답을 기다림
    async fn notify_down(&self, reason: &str, retrying: bool) {
        let consoles = self.console_handles();
        if consoles.is_empty() {
            return;
        }

        let acks = consoles.iter().map(|(track_id, console)| async move {
            (*track_id, console.container_down(reason.to_string(), retrying).await)
        });
        for (track_id, result) in futures::future::join_all(acks).await {
            if let Err(e) = result {
                warn!(scope = %self.scope, track_id = %track_id, error = %e, "Console did not acknowledge container down");
            }
        }
    }

    // ========================================================================
    // State & snapshot
    // ========================================================================

    /// 내부 전이 적용 (표에 없으면 로그만 남김)
    fn apply(&mut self, event: ContainerTransition) {
        match transition(self.status, event) {
            Ok(next) => {
                debug!(scope = %self.scope, from = %self.status, to = %next, ?event, "Container transition");
                self.status = next;
            }
            Err(e) => error!(scope = %self.scope, error = %e, "Rejected container transition"),
        }
    }

    fn set_status(&mut self, next: ContainerStatus, backoff_ms: Option<u64>, reason: Option<String>) {
        self.status = next;
        self.publish_status(backoff_ms, reason);
    }

    fn publish_status(&mut self, backoff_ms: Option<u64>, reason: Option<String>) {
        self.bus.publish(Event::container_status(
            self.scope,
            self.status,
            self.restart_count,
            backoff_ms,
            reason,
        ));
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        let consoles = self.consoles.lock().len();
        self.snapshot_tx.send_replace(ContainerSnapshot {
            scope: self.scope,
            slug: self.spec.slug.clone(),
            status: self.status,
            restart_count: self.restart_count,
            total_restarts: self.total_restarts,
            consecutive_failures: self.consecutive_failures,
            next_backoff_ms: self.backoff.peek().as_millis() as u64,
            container: self.current.clone(),
            endpoint_host: self.endpoint.as_ref().map(|e| e.host.clone()),
            last_error: self.last_error.clone(),
            consoles,
            updated_at: Utc::now(),
        });
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// 이전 인스턴스가 panic한 뒤: 마지막 프로세스를 정리하고 필요하면 다시 기동
    async fn recover(&mut self, snapshot: ContainerSnapshot) {
        warn!(scope = %self.scope, status = %snapshot.status, "Recovering container actor");
        self.total_restarts = snapshot.total_restarts;

        self.notify_down("container actor restarted", !snapshot.status.is_halted())
            .await;
        if let Some(container) = snapshot.container {
            self.current = Some(container);
            self.stop_process().await;
        }

        if snapshot.status.is_halted() {
            self.status = snapshot.status;
            self.last_error = snapshot.last_error;
            self.publish_snapshot();
            return;
        }

        match self.begin_start() {
            Ok(()) => self.launch().await,
            Err(e) => error!(scope = %self.scope, error = %e, "Recovery start rejected"),
        }
    }
}

#[async_trait]
impl Actor for ContainerActor {
    type Message = ContainerMessage;

    fn name(&self) -> String {
        format!("container:{}", self.scope)
    }

    async fn run(mut self, inbox: &mut mpsc::Receiver<ContainerMessage>) {
        if let Some(snapshot) = self.recovered.take() {
            self.recover(snapshot).await;
        }

        loop {
            let wake = tokio::select! {
                msg = inbox.recv() => Wake::Message(msg),
                _ = fired(&mut self.restart_timer) => Wake::RestartDue,
                _ = fired(&mut self.health_timer) => Wake::HealthTick,
            };

            match wake {
                Wake::Message(Some(msg)) => {
                    if !self.handle(msg).await {
                        break;
                    }
                }
                Wake::Message(None) => {
                    self.stop_all("all handles dropped").await;
                    break;
                }
                Wake::RestartDue => {
                    self.restart_timer = None;
                    self.on_restart_due().await;
                }
                Wake::HealthTick => {
                    self.health_timer = None;
                    self.on_health_tick().await;
                }
            }
        }

        debug!(scope = %self.scope, "Container actor exited");
    }
}
