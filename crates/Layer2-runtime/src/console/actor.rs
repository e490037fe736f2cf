//! Console Actor
//!
//! 원격 콘솔 세션 하나를 소유합니다. 명령은 한 번에 하나만 실행되고,
//! 출력은 `output_poll_interval`마다 읽어 누적합니다.
//!
//! 연결 규칙:
//! - 최초 연결: 컨테이너 준비 후 `rpc_initial_connect_delay`를 기다리고
//!   `max_connect_attempts`번까지 connect 백오프로 재시도
//! - 재연결 (RPC 연결 끊김): console restart 백오프로
//!   `console_max_restart_attempts`번까지, 시도 사이에는 `offline`

use super::history::ConsoleHistory;
use super::state::check_submit;
use super::{ConsoleContext, ConsoleMessage, ConsoleSnapshot};
use crate::backoff::Backoff;
use crate::rpc::{RemoteConsole, RpcClient, RpcEndpoint, RpcError, RpcSession};
use crate::supervisor::{arm, bounded, fired, reply, Actor, Timer};
use async_trait::async_trait;
use chrono::Utc;
use kestrel_foundation::{
    CommandExecution, CommandId, CommandSource, ConsoleStatus, Error, Event, EventBus, Result,
    RuntimeConfig, Scope,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// 배너를 읽을 때 최대 read 횟수
const BANNER_MAX_READS: u32 = 50;

enum Wake {
    Message(Option<ConsoleMessage>),
    Connect,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectMode {
    /// 컨테이너가 (다시) 준비됨
    Initial,
    /// RPC 세션을 잃음
    Reconnect,
}

/// 연결 실패 정보
struct ConnectFailure {
    error: RpcError,
    /// 세션은 얻었지만 콘솔 생성 실패
    registered: bool,
}

/// 실행 중인 명령
struct ActiveCommand {
    record: CommandExecution,
    output: String,
    read_failures: u32,
}

pub(super) struct ConsoleActor {
    scope: Scope,
    config: Arc<RuntimeConfig>,
    rpc: Arc<dyn RpcClient>,
    bus: Arc<EventBus>,
    snapshot_tx: Arc<watch::Sender<ConsoleSnapshot>>,
    history: Arc<parking_lot::Mutex<ConsoleHistory>>,
    recovered: Option<ConsoleSnapshot>,

    status: ConsoleStatus,
    prompt: String,
    reason: Option<String>,
    retrying: bool,

    endpoint: Option<RpcEndpoint>,
    session: Option<RpcSession>,
    console_id: Option<String>,
    active: Option<ActiveCommand>,

    mode: ConnectMode,
    connect_attempts: u32,
    reconnect_attempts: u32,
    connect_backoff: Backoff,
    restart_backoff: Backoff,

    connect_timer: Timer,
    poll_timer: Timer,
}

impl ConsoleActor {
    pub(super) fn new(
        ctx: &ConsoleContext,
        snapshot_tx: Arc<watch::Sender<ConsoleSnapshot>>,
        history: Arc<parking_lot::Mutex<ConsoleHistory>>,
        recovered: Option<ConsoleSnapshot>,
    ) -> Self {
        let config = Arc::clone(&ctx.config);
        Self {
            scope: ctx.scope,
            rpc: Arc::clone(&ctx.rpc),
            bus: Arc::clone(&ctx.bus),
            snapshot_tx,
            history,
            recovered,
            status: ConsoleStatus::Initializing,
            prompt: String::new(),
            reason: None,
            retrying: true,
            endpoint: None,
            session: None,
            console_id: None,
            active: None,
            mode: ConnectMode::Initial,
            connect_attempts: 0,
            reconnect_attempts: 0,
            connect_backoff: Backoff::new(config.connect_backoff_ms, config.connect_max_backoff_ms),
            restart_backoff: Backoff::new(
                config.console_restart_base_backoff_ms,
                config.console_restart_max_backoff_ms,
            ),
            connect_timer: None,
            poll_timer: None,
            config,
        }
    }

    // ========================================================================
    // Message handling
    // ========================================================================

    /// false면 액터 종료
    async fn handle(&mut self, msg: ConsoleMessage) -> bool {
        match msg {
            ConsoleMessage::Submit {
                text,
                source,
                response_tx,
            } => {
                let result = self.submit(text, source).await;
                reply(response_tx, result);
            }
            ConsoleMessage::ContainerReady { endpoint } => self.on_container_ready(endpoint),
            ConsoleMessage::ContainerDown {
                reason,
                retrying,
                response_tx,
            } => {
                self.on_container_down(reason, retrying);
                reply(response_tx, ());
            }
            ConsoleMessage::Reconnect { response_tx } => {
                let result = self.manual_reconnect();
                reply(response_tx, result);
            }
            ConsoleMessage::Shutdown { response_tx } => {
                self.close("console shut down").await;
                reply(response_tx, ());
                return false;
            }
        }
        true
    }

    // ========================================================================
    // Commands
    // ========================================================================

    async fn submit(&mut self, text: String, source: CommandSource) -> Result<CommandId> {
        check_submit(self.status, self.reason.as_deref(), self.retrying)?;

        let command = text.trim_end_matches(['\r', '\n']).to_string();
        if command.trim().is_empty() {
            return Err(Error::InvalidInput("command is empty".to_string()));
        }

        let (Some(session), Some(console_id)) = (self.session.clone(), self.console_id.clone())
        else {
            return Err(Error::ConsoleNotRegistered);
        };

        let record = CommandExecution::issued(self.scope, source, command, self.prompt.clone());
        self.set_status(ConsoleStatus::Busy);

        let data = format!("{}\n", record.command);
        let wait = self.config.call_timeout();
        match bounded(wait, RpcError::Timeout, self.rpc.write(&session, &console_id, &data)).await {
            Ok(()) => {
                debug!(scope = %self.scope, command_id = %record.id, source = record.source.as_str(), "Command issued");
                let id = record.id;
                self.bus.publish(Event::command_issued(record.clone()));
                self.active = Some(ActiveCommand {
                    record,
                    output: String::new(),
                    read_failures: 0,
                });
                self.poll_timer = arm(self.config.output_poll_interval());
                self.publish_snapshot();
                Ok(id)
            }
            Err(e) if e.is_connection_lost() => {
                self.on_connection_lost(&e);
                Err(Error::ConsoleOffline {
                    reason: Some(e.to_string()),
                    retrying: self.retrying,
                })
            }
            Err(e) => {
                warn!(scope = %self.scope, error = %e, "Command write failed");
                self.set_status(ConsoleStatus::Idle);
                Err(e.into())
            }
        }
    }

    async fn on_poll(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        let (Some(session), Some(console_id)) = (self.session.clone(), self.console_id.clone())
        else {
            self.active = Some(active);
            self.fail_active("console session lost");
            return;
        };

        let wait = self.config.call_timeout();
        match bounded(wait, RpcError::Timeout, self.rpc.read(&session, &console_id)).await {
            Ok(read) => {
                active.read_failures = 0;
                if !read.output.is_empty() {
                    active.output.push_str(&read.output);
                    self.bus
                        .publish(Event::command_result(active.record.running(&active.output)));
                }

                if read.is_complete() {
                    self.finish(active, read.prompt);
                } else {
                    self.active = Some(active);
                    self.poll_timer = arm(self.config.output_poll_interval());
                }
            }
            Err(e) if e.is_connection_lost() => {
                self.active = Some(active);
                self.on_connection_lost(&e);
            }
            Err(e) => {
                active.read_failures += 1;
                if active.read_failures > self.config.command_max_retries {
                    error!(
                        scope = %self.scope,
                        command_id = %active.record.id,
                        failures = active.read_failures,
                        error = %e,
                        "Reading command output failed, giving up"
                    );
                    self.active = Some(active);
                    self.fail_active(&e.to_string());
                    self.set_status(ConsoleStatus::Idle);
                    return;
                }

                let delay = self.config.retry_delay(active.read_failures);
                warn!(
                    scope = %self.scope,
                    attempt = active.read_failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Reading command output failed, retrying"
                );
                self.active = Some(active);
                self.poll_timer = arm(delay);
            }
        }
    }

    /// 프롬프트가 돌아옴: 히스토리 추가 → idle → finished 발행
    fn finish(&mut self, active: ActiveCommand, prompt: String) {
        let record = active.record.finished(&active.output);
        self.history.lock().push_command(&record);
        if !prompt.is_empty() {
            self.prompt = prompt;
        }
        self.set_status(ConsoleStatus::Idle);
        info!(scope = %self.scope, command_id = %record.id, "Command finished");
        self.bus.publish(Event::command_result(record));
    }

    /// 실행 중인 명령을 error로 종료
    fn fail_active(&mut self, reason: &str) {
        self.poll_timer = None;
        let Some(active) = self.active.take() else {
            return;
        };

        let record = active.record.errored(&active.output, reason);
        self.history.lock().push_command(&record);
        self.bus.publish(Event::command_result(record));
        self.publish_snapshot();
    }

    // ========================================================================
    // Connection
    // ========================================================================

    fn on_container_ready(&mut self, endpoint: RpcEndpoint) {
        if self.status.is_connected() && self.endpoint.as_ref() == Some(&endpoint) {
            return;
        }

        debug!(scope = %self.scope, host = %endpoint.host, "Container ready");
        self.endpoint = Some(endpoint);
        self.session = None;
        self.console_id = None;
        self.mode = ConnectMode::Initial;
        self.connect_attempts = 0;
        self.reconnect_attempts = 0;
        self.connect_backoff.reset();
        self.restart_backoff.reset();
        self.reason = None;
        self.retrying = true;
        self.set_status(ConsoleStatus::Connecting);
        self.connect_timer = arm(self.config.rpc_initial_connect_delay());
    }

    fn on_container_down(&mut self, reason: String, retrying: bool) {
        self.connect_timer = None;
        self.fail_active(&reason);

        if self.session.is_some() || self.status.is_connected() {
            self.history.lock().push_restart(reason.clone());
        }
        self.session = None;
        self.console_id = None;
        if !retrying {
            self.endpoint = None;
        }

        info!(scope = %self.scope, reason = %reason, retrying, "Console offline, container down");
        self.go_offline(reason, retrying);
    }

    fn on_connection_lost(&mut self, err: &RpcError) {
        let reason = err.to_string();
        warn!(scope = %self.scope, error = %err, "Console connection lost");

        self.fail_active(&reason);
        self.history.lock().push_restart(reason.clone());
        self.session = None;
        self.console_id = None;
        self.mode = ConnectMode::Reconnect;

        let delay = self.restart_backoff.next_delay();
        self.go_offline(reason, true);
        self.connect_timer = arm(delay);
    }

    fn manual_reconnect(&mut self) -> Result<()> {
        match self.status {
            ConsoleStatus::Offline | ConsoleStatus::NotRegistered => {}
            _ => return Ok(()),
        }
        if self.endpoint.is_none() {
            return Err(Error::ConsoleOffline {
                reason: Some("container is not running".to_string()),
                retrying: false,
            });
        }

        info!(scope = %self.scope, "Manual console reconnect");
        self.mode = ConnectMode::Reconnect;
        self.reconnect_attempts = 0;
        self.restart_backoff.reset();
        self.reason = None;
        self.retrying = true;
        self.set_status(ConsoleStatus::Connecting);
        self.connect_timer = arm(Duration::ZERO);
        Ok(())
    }

    async fn on_connect_due(&mut self) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };

        match self.open_session(&endpoint).await {
            Ok(()) => {
                self.connect_attempts = 0;
                self.reconnect_attempts = 0;
                self.connect_backoff.reset();
                self.restart_backoff.reset();
                self.reason = None;
                self.retrying = true;
                info!(scope = %self.scope, prompt = %self.prompt, "Console connected");
                self.set_status(ConsoleStatus::Idle);
            }
            Err(failure) => self.on_connect_failed(failure),
        }
    }

    /// 인증 → 콘솔 생성 → 배너 수집
    ///
    /// 콘솔 생성만 실패했던 세션은 다시 로그인하지 않고 재사용합니다.
    async fn open_session(&mut self, endpoint: &RpcEndpoint) -> std::result::Result<(), ConnectFailure> {
        let wait = self.config.call_timeout();
        let registered = |error| ConnectFailure {
            error,
            registered: true,
        };

        let session = match self.session.clone() {
            Some(session) => session,
            None => {
                let session = bounded(wait, RpcError::Timeout, self.rpc.connect(endpoint))
                    .await
                    .map_err(|error| ConnectFailure {
                        error,
                        registered: false,
                    })?;
                self.session = Some(session.clone());
                session
            }
        };

        let console = bounded(wait, RpcError::Timeout, self.rpc.create_console(&session))
            .await
            .map_err(registered)?;

        let (banner, prompt) = match self.drain_banner(&session, &console).await {
            Ok(drained) => drained,
            Err(e) => {
                // 배너를 못 읽은 원격 콘솔은 남기지 않음
                if let Err(cleanup) = bounded(
                    wait,
                    RpcError::Timeout,
                    self.rpc.destroy_console(&session, &console.id),
                )
                .await
                {
                    debug!(scope = %self.scope, console_id = %console.id, error = %cleanup, "Destroying half-open console failed");
                }
                return Err(registered(e));
            }
        };

        self.history.lock().push_startup(banner, prompt.clone());
        self.prompt = prompt;
        self.console_id = Some(console.id);
        Ok(())
    }

    /// 프롬프트가 돌아올 때까지 배너 출력을 모음
    async fn drain_banner(
        &self,
        session: &RpcSession,
        console: &RemoteConsole,
    ) -> std::result::Result<(String, String), RpcError> {
        let wait = self.config.call_timeout();
        let mut banner = String::new();
        let mut prompt = console.prompt.clone();

        for read_no in 0..BANNER_MAX_READS {
            let read = bounded(wait, RpcError::Timeout, self.rpc.read(session, &console.id)).await?;
            banner.push_str(&read.output);
            if !read.prompt.is_empty() {
                prompt = read.prompt.clone();
            }
            if read.is_complete() {
                break;
            }
            if read_no + 1 < BANNER_MAX_READS {
                tokio::time::sleep(self.config.output_poll_interval()).await;
            }
        }

        Ok((banner, prompt))
    }

    fn on_connect_failed(&mut self, failure: ConnectFailure) {
        let reason = failure.error.to_string();
        if !failure.registered || failure.error.is_connection_lost() {
            self.session = None;
        }

        let (attempt, max, delay) = match self.mode {
            ConnectMode::Initial => {
                self.connect_attempts += 1;
                (
                    self.connect_attempts,
                    self.config.max_connect_attempts,
                    self.connect_backoff.next_delay(),
                )
            }
            ConnectMode::Reconnect => {
                self.reconnect_attempts += 1;
                (
                    self.reconnect_attempts,
                    self.config.console_max_restart_attempts,
                    self.restart_backoff.next_delay(),
                )
            }
        };

        if attempt >= max {
            error!(
                scope = %self.scope,
                attempts = attempt,
                error = %failure.error,
                "Console connection attempts exhausted"
            );
            self.session = None;
            self.go_offline(reason, false);
            return;
        }

        warn!(
            scope = %self.scope,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %failure.error,
            "Console connection failed, retrying"
        );
        self.reason = Some(reason.clone());
        let status = match (failure.registered, self.mode) {
            (true, _) => ConsoleStatus::NotRegistered,
            (false, ConnectMode::Initial) => ConsoleStatus::Connecting,
            (false, ConnectMode::Reconnect) => ConsoleStatus::Offline,
        };
        if status == ConsoleStatus::Offline {
            self.go_offline(reason, true);
        } else {
            self.set_status(status);
        }
        self.connect_timer = arm(delay);
    }

    fn go_offline(&mut self, reason: String, retrying: bool) {
        self.reason = Some(reason);
        self.retrying = retrying;
        self.set_status(ConsoleStatus::Offline);
    }

    /// 원격 콘솔 정리 (실패해도 계속)
    async fn close(&mut self, reason: &str) {
        self.connect_timer = None;
        self.fail_active(reason);

        if let (Some(session), Some(console_id)) = (self.session.take(), self.console_id.take()) {
            let wait = self.config.call_timeout();
            if let Err(e) =
                bounded(wait, RpcError::Timeout, self.rpc.destroy_console(&session, &console_id)).await
            {
                debug!(scope = %self.scope, error = %e, "Destroying remote console failed");
            }
        }

        self.endpoint = None;
        self.go_offline(reason.to_string(), false);
    }

    // ========================================================================
    // State & snapshot
    // ========================================================================

    /// 상태가 바뀌었거나 (비연결 상태에서) 사유가 바뀌면 이벤트 발행
    fn set_status(&mut self, next: ConsoleStatus) {
        let changed = self.status != next;
        if changed {
            debug!(scope = %self.scope, from = %self.status, to = %next, "Console transition");
            self.status = next;
        }
        if next.is_connected() {
            self.reason = None;
        }

        if changed || !next.is_connected() {
            self.bus.publish(Event::console_status(
                self.scope,
                self.status,
                self.prompt.clone(),
                self.reason.clone(),
            ));
        }
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        let history_len = self.history.lock().len();
        self.snapshot_tx.send_replace(ConsoleSnapshot {
            scope: self.scope,
            status: self.status,
            prompt: self.prompt.clone(),
            reason: self.reason.clone(),
            retrying: self.retrying,
            active_command: self.active.as_ref().map(|a| a.record.running(&a.output)),
            reconnect_attempts: self.reconnect_attempts,
            history_len,
            updated_at: Utc::now(),
            endpoint: self.endpoint.clone(),
        });
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// 이전 인스턴스가 panic한 뒤: 진행 중이던 명령을 error로 닫고 다시 연결
    fn recover(&mut self, snapshot: ConsoleSnapshot) {
        warn!(scope = %self.scope, status = %snapshot.status, "Recovering console actor");
        self.prompt = snapshot.prompt;

        if let Some(record) = snapshot.active_command {
            let record = record.errored(&record.output, "console actor restarted");
            self.history.lock().push_command(&record);
            self.bus.publish(Event::command_result(record));
        }

        let resumable = snapshot.status != ConsoleStatus::Offline || snapshot.retrying;
        match snapshot.endpoint {
            Some(endpoint) if resumable => {
                self.history.lock().push_restart("console actor restarted");
                self.endpoint = Some(endpoint);
                self.mode = ConnectMode::Reconnect;
                self.go_offline("console actor restarted".to_string(), true);
                self.connect_timer = arm(self.restart_backoff.next_delay());
            }
            Some(endpoint) => {
                self.endpoint = Some(endpoint);
                self.go_offline(snapshot.reason.unwrap_or_default(), false);
            }
            // 컨테이너가 아직 준비되지 않음
            None if snapshot.status == ConsoleStatus::Initializing => self.publish_snapshot(),
            None => self.go_offline(snapshot.reason.unwrap_or_default(), snapshot.retrying),
        }
    }
}

#[async_trait]
impl Actor for ConsoleActor {
    type Message = ConsoleMessage;

    fn name(&self) -> String {
        format!("console:{}", self.scope)
    }

    async fn run(mut self, inbox: &mut mpsc::Receiver<ConsoleMessage>) {
        if let Some(snapshot) = self.recovered.take() {
            self.recover(snapshot);
        } else {
            self.publish_snapshot();
        }

        loop {
            let wake = tokio::select! {
                msg = inbox.recv() => Wake::Message(msg),
                _ = fired(&mut self.connect_timer) => Wake::Connect,
                _ = fired(&mut self.poll_timer) => Wake::Poll,
            };

            match wake {
                Wake::Message(Some(msg)) => {
                    if !self.handle(msg).await {
                        break;
                    }
                }
                Wake::Message(None) => {
                    self.close("all handles dropped").await;
                    break;
                }
                Wake::Connect => {
                    self.connect_timer = None;
                    self.on_connect_due().await;
                }
                Wake::Poll => {
                    self.poll_timer = None;
                    self.on_poll().await;
                }
            }
        }

        debug!(scope = %self.scope, "Console actor exited");
    }
}
