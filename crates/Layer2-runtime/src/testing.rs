//! Testing - 스크립트 가능한 인메모리 협력자
//!
//! Docker, 콘솔 서비스, 데이터베이스 없이 액터를 구동하기 위한 구현입니다.
//! 모든 호출은 기록되므로 테스트에서 순서와 시각을 검증할 수 있습니다.

use crate::adapter::{AdapterError, ContainerAdapter, ContainerRef, ContainerSpec, ProcessInfo};
use crate::rpc::{ConsoleRead, RemoteConsole, RpcClient, RpcEndpoint, RpcError, RpcSession};
use crate::store::{FindingsStore, StoreError};
use async_trait::async_trait;
use kestrel_foundation::{FindingCategory, FindingCounts, WorkspaceId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::time::Instant;

// ============================================================================
// ScriptedAdapter
// ============================================================================

/// 기록된 어댑터 호출
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    Create(String),
    Start(String),
    Stop(String),
    Inspect(String),
}

#[derive(Default)]
struct AdapterState {
    start_results: VecDeque<Result<(), AdapterError>>,
    inspect_results: VecDeque<Result<ProcessInfo, AdapterError>>,
    calls: Vec<AdapterCall>,
    start_times: Vec<Instant>,
    running: HashSet<String>,
    next_id: u32,
}

/// 스크립트 가능한 컨테이너 어댑터
///
/// 기본 동작: create/start 성공, inspect는 running.
pub struct ScriptedAdapter {
    state: Mutex<AdapterState>,
    healthy: AtomicBool,
    panic_on_inspect: AtomicBool,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AdapterState::default()),
            healthy: AtomicBool::new(true),
            panic_on_inspect: AtomicBool::new(false),
        }
    }

    /// 다음 `count`번의 start를 실패시킴
    pub fn fail_starts(&self, count: usize, error: AdapterError) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.start_results.push_back(Err(error.clone()));
        }
    }

    /// 스크립트가 없을 때 inspect가 running을 보고할지
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn push_inspect(&self, result: Result<ProcessInfo, AdapterError>) {
        self.state.lock().inspect_results.push_back(result);
    }

    /// 다음 inspect에서 panic (supervisor 테스트용)
    pub fn panic_on_next_inspect(&self) {
        self.panic_on_inspect.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.state.lock().calls.clone()
    }

    pub fn start_attempts(&self) -> usize {
        self.state.lock().start_times.len()
    }

    /// start 호출 시각 (paused clock 기준)
    pub fn start_times(&self) -> Vec<Instant> {
        self.state.lock().start_times.clone()
    }

    pub fn stop_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, AdapterCall::Stop(_)))
            .count()
    }

    /// 현재 살아 있는 컨테이너 ID
    pub fn running(&self) -> Vec<String> {
        let mut running: Vec<String> = self.state.lock().running.iter().cloned().collect();
        running.sort();
        running
    }
}

impl Default for ScriptedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerRef, AdapterError> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("{}-{}", spec.slug, state.next_id);
        state.calls.push(AdapterCall::Create(spec.slug.clone()));
        Ok(ContainerRef {
            id,
            name: spec.slug.clone(),
        })
    }

    async fn start(&self, container: &ContainerRef) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        state.calls.push(AdapterCall::Start(container.id.clone()));
        state.start_times.push(Instant::now());
        let result = state.start_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            state.running.insert(container.id.clone());
        }
        result
    }

    async fn stop(&self, container: &ContainerRef) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        state.calls.push(AdapterCall::Stop(container.id.clone()));
        state.running.remove(&container.id);
        Ok(())
    }

    async fn inspect(&self, container: &ContainerRef) -> Result<ProcessInfo, AdapterError> {
        if self.panic_on_inspect.swap(false, Ordering::SeqCst) {
            panic!("scripted inspect panic");
        }

        let mut state = self.state.lock();
        state.calls.push(AdapterCall::Inspect(container.id.clone()));
        if let Some(result) = state.inspect_results.pop_front() {
            return result;
        }

        if self.healthy.load(Ordering::SeqCst) && state.running.contains(&container.id) {
            Ok(ProcessInfo::running(Some(format!("10.0.0.{}", state.next_id))))
        } else {
            Ok(ProcessInfo::exited(Some(137)))
        }
    }
}

// ============================================================================
// ScriptedRpc
// ============================================================================

/// 기본 프롬프트
pub const SCRIPTED_PROMPT: &str = "msf6 > ";

/// 기본 배너
pub const SCRIPTED_BANNER: &str = "=[ metasploit v6 ]=\n";

#[derive(Default)]
struct RpcState {
    reachable: bool,
    connect_failures: VecDeque<RpcError>,
    create_failures: VecDeque<RpcError>,
    read_failures: VecDeque<RpcError>,
    responses: HashMap<String, VecDeque<ConsoleRead>>,
    pending: VecDeque<ConsoleRead>,
    writes: Vec<String>,
    connects: usize,
    connect_times: Vec<Instant>,
    reads: usize,
    destroyed: Vec<String>,
    next_console: u32,
    prompt: String,
}

/// 스크립트 가능한 콘솔 RPC
///
/// 기본 동작: 연결 성공, 콘솔 생성 후 첫 read는 배너, 명령은 즉시 완료.
pub struct ScriptedRpc {
    state: Mutex<RpcState>,
}

impl ScriptedRpc {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RpcState {
                reachable: true,
                prompt: SCRIPTED_PROMPT.to_string(),
                ..Default::default()
            }),
        }
    }

    /// false면 모든 호출이 Connection 에러
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    pub fn fail_connects(&self, count: usize, error: RpcError) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.connect_failures.push_back(error.clone());
        }
    }

    pub fn fail_console_creates(&self, count: usize, error: RpcError) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.create_failures.push_back(error.clone());
        }
    }

    pub fn fail_reads(&self, count: usize, error: RpcError) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.read_failures.push_back(error.clone());
        }
    }

    /// 명령에 대한 출력 스크립트
    ///
    /// 마지막 chunk 전까지는 busy, 마지막 chunk와 함께 프롬프트가 돌아옵니다.
    pub fn respond(&self, command: &str, chunks: &[&str]) {
        let mut state = self.state.lock();
        let prompt = state.prompt.clone();
        let mut reads: VecDeque<ConsoleRead> = chunks
            .iter()
            .map(|chunk| ConsoleRead {
                output: chunk.to_string(),
                prompt: String::new(),
                busy: true,
            })
            .collect();
        match reads.back_mut() {
            Some(last) => {
                last.busy = false;
                last.prompt = prompt;
            }
            None => reads.push_back(ConsoleRead {
                output: String::new(),
                prompt,
                busy: false,
            }),
        }
        state.responses.insert(command.to_string(), reads);
    }

    /// 끝나지 않는 명령 (항상 busy)
    pub fn hang(&self, command: &str) {
        let mut state = self.state.lock();
        let reads = (0..10_000)
            .map(|_| ConsoleRead {
                output: String::new(),
                prompt: String::new(),
                busy: true,
            })
            .collect();
        state.responses.insert(command.to_string(), reads);
    }

    pub fn set_prompt(&self, prompt: &str) {
        self.state.lock().prompt = prompt.to_string();
    }

    /// 기록된 write (개행 포함 원문)
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().writes.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.state.lock().connect_times.clone()
    }

    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().destroyed.clone()
    }
}

impl Default for ScriptedRpc {
    fn default() -> Self {
        Self::new()
    }
}

fn unreachable_error() -> RpcError {
    RpcError::Connection("connection refused".to_string())
}

#[async_trait]
impl RpcClient for ScriptedRpc {
    async fn connect(&self, endpoint: &RpcEndpoint) -> Result<RpcSession, RpcError> {
        let mut state = self.state.lock();
        state.connects += 1;
        state.connect_times.push(Instant::now());
        if !state.reachable {
            return Err(unreachable_error());
        }
        if let Some(err) = state.connect_failures.pop_front() {
            return Err(err);
        }
        Ok(RpcSession {
            endpoint: endpoint.clone(),
            token: format!("token-{}", state.connects),
        })
    }

    async fn create_console(&self, _session: &RpcSession) -> Result<RemoteConsole, RpcError> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(unreachable_error());
        }
        if let Some(err) = state.create_failures.pop_front() {
            return Err(err);
        }
        state.next_console += 1;
        let prompt = state.prompt.clone();
        state.pending.clear();
        state.pending.push_back(ConsoleRead {
            output: SCRIPTED_BANNER.to_string(),
            prompt: prompt.clone(),
            busy: false,
        });
        Ok(RemoteConsole {
            id: state.next_console.to_string(),
            prompt,
        })
    }

    async fn write(
        &self,
        _session: &RpcSession,
        _console_id: &str,
        data: &str,
    ) -> Result<(), RpcError> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(unreachable_error());
        }
        state.writes.push(data.to_string());

        let command = data.trim_end_matches('\n');
        let reads = match state.responses.remove(command) {
            Some(reads) => reads,
            None => VecDeque::from([ConsoleRead {
                output: String::new(),
                prompt: state.prompt.clone(),
                busy: false,
            }]),
        };
        state.pending.extend(reads);
        Ok(())
    }

    async fn read(&self, _session: &RpcSession, _console_id: &str) -> Result<ConsoleRead, RpcError> {
        let mut state = self.state.lock();
        state.reads += 1;
        if !state.reachable {
            return Err(unreachable_error());
        }
        if let Some(err) = state.read_failures.pop_front() {
            return Err(err);
        }
        Ok(state.pending.pop_front().unwrap_or_else(|| ConsoleRead {
            output: String::new(),
            prompt: state.prompt.clone(),
            busy: false,
        }))
    }

    async fn destroy_console(&self, _session: &RpcSession, console_id: &str) -> Result<(), RpcError> {
        let mut state = self.state.lock();
        state.destroyed.push(console_id.to_string());
        Ok(())
    }
}

// ============================================================================
// MemoryFindingsStore
// ============================================================================

/// 인메모리 발견 항목 저장소
pub struct MemoryFindingsStore {
    counts: Mutex<HashMap<WorkspaceId, FindingCounts>>,
    calls: Mutex<HashMap<WorkspaceId, usize>>,
    failures: AtomicUsize,
}

impl MemoryFindingsStore {
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            failures: AtomicUsize::new(0),
        }
    }

    /// 데이터 레이어가 항목을 추가한 것처럼 값 증가
    pub fn add(&self, workspace_id: WorkspaceId, category: FindingCategory, amount: u64) {
        let mut counts = self.counts.lock();
        let entry = counts.entry(workspace_id).or_default();
        let value = entry.get(category) + amount;
        entry.set(category, value);
    }

    pub fn set(&self, workspace_id: WorkspaceId, counts: FindingCounts) {
        self.counts.lock().insert(workspace_id, counts);
    }

    /// 다음 `count`번의 조회를 실패시킴
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// 워크스페이스별 조회 횟수
    pub fn count_calls(&self, workspace_id: WorkspaceId) -> usize {
        self.calls.lock().get(&workspace_id).copied().unwrap_or(0)
    }
}

impl Default for MemoryFindingsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FindingsStore for MemoryFindingsStore {
    async fn count_findings(&self, workspace_id: WorkspaceId) -> Result<FindingCounts, StoreError> {
        *self.calls.lock().entry(workspace_id).or_insert(0) += 1;

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("database is locked".to_string()));
        }

        Ok(self
            .counts
            .lock()
            .get(&workspace_id)
            .copied()
            .unwrap_or_default())
    }
}
