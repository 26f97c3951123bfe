//! 集成测试公共部分 - 脚本化的假 tmux 与带时间门槛的存储

#![allow(dead_code)]

use agentmux::infra::{SessionSummary, TmuxTransport};
use agentmux::store::{
    DeliveryLogEntry, MemberEdit, MemberRecord, MemoryStore, RegistrationStatus, StateStore,
};
use agentmux::{Orchestrator, OrchestratorConfig};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const AGENT_BANNER: &str = "╭──────────────────────────╮\n│ ✻ Welcome to Claude Code! │\n╰──────────────────────────╯";
pub const PALETTE: &str = "/help    show help\n/clear   clear conversation\n/compact compact context";
pub const HUNG_SCREEN: &str = "Segmentation fault (core dumped)";

/// 假 pane 的行为
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaneMode {
    /// 普通 shell：回显输入
    Shell,
    /// 可交互 agent：`/` 打开命令面板
    Agent,
    /// 卡死：忽略所有输入
    Frozen,
}

/// 记录下来的 tmux 调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    NewSession(String),
    KillSession(String),
    Literal(String, String),
    Key(String, String),
}

struct FakePane {
    mode: PaneMode,
    output: String,
    input: String,
    palette_open: bool,
}

impl FakePane {
    fn new(mode: PaneMode) -> Self {
        let output = if mode == PaneMode::Frozen {
            format!("{}\n", HUNG_SCREEN)
        } else {
            String::new()
        };
        Self {
            mode,
            output,
            input: String::new(),
            palette_open: false,
        }
    }

    fn render(&self) -> String {
        match self.mode {
            PaneMode::Shell => format!("{}$ {}", self.output, self.input),
            PaneMode::Agent => {
                let palette = if self.palette_open {
                    format!("\n{}", PALETTE)
                } else {
                    String::new()
                };
                format!("{}{}\n> {}{}", self.output, AGENT_BANNER, self.input, palette)
            }
            PaneMode::Frozen => self.output.clone(),
        }
    }
}

#[derive(Default)]
struct FakeState {
    panes: BTreeMap<String, FakePane>,
    calls: Vec<Call>,
    session_modes: VecDeque<PaneMode>,
    startup_modes: VecDeque<PaneMode>,
    fail_literals: bool,
}

/// 脚本化的 tmux 传输层
pub struct FakeTmux {
    state: Mutex<FakeState>,
    default_mode: PaneMode,
    startup_mode: PaneMode,
    registrar: Option<Arc<MemoryStore>>,
}

impl FakeTmux {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            default_mode: PaneMode::Shell,
            startup_mode: PaneMode::Agent,
            registrar: None,
        }
    }

    /// agent 收到含 `mark-active` 的提示后自动在存储中登记
    pub fn with_registrar(mut self, store: Arc<MemoryStore>) -> Self {
        self.registrar = Some(store);
        self
    }

    /// 新建 session 的默认模式
    pub fn with_default_mode(mut self, mode: PaneMode) -> Self {
        self.default_mode = mode;
        self
    }

    /// 启动脚本执行后进入的默认模式
    pub fn with_startup_mode(mut self, mode: PaneMode) -> Self {
        self.startup_mode = mode;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_session(&self, name: &str, mode: PaneMode) {
        self.lock().panes.insert(name.to_string(), FakePane::new(mode));
    }

    pub fn remove_session(&self, name: &str) {
        self.lock().panes.remove(name);
    }

    /// 依次用于之后新建的 session
    pub fn queue_session_modes(&self, modes: &[PaneMode]) {
        self.lock().session_modes.extend(modes.iter().copied());
    }

    /// 依次用于之后执行的启动脚本
    pub fn queue_startup_modes(&self, modes: &[PaneMode]) {
        self.lock().startup_modes.extend(modes.iter().copied());
    }

    /// 之后的字面输入全部失败
    pub fn fail_literals(&self, fail: bool) {
        self.lock().fail_literals = fail;
    }

    pub fn mode(&self, name: &str) -> Option<PaneMode> {
        self.lock().panes.get(name).map(|p| p.mode)
    }

    /// 模拟 agent 产生输出
    pub fn append_output(&self, name: &str, text: &str) {
        if let Some(pane) = self.lock().panes.get_mut(name) {
            pane.output.push_str(text);
            pane.output.push('\n');
        }
    }

    pub fn screen(&self, name: &str) -> Option<String> {
        self.lock().panes.get(name).map(|p| p.render())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn literals_for(&self, name: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Literal(s, text) if s == name => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn count_key(&self, name: &str, key: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Key(s, k) if s == name && k == key))
            .count()
    }

    pub fn count_calls(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    fn press(&self, state: &mut FakeState, name: &str, key: &str) -> Result<Option<String>> {
        let startup_mode = self.startup_mode;
        let pane = state
            .panes
            .get_mut(name)
            .ok_or_else(|| anyhow!("can't find session: {}", name))?;
        let mut registered = None;

        match (pane.mode, key) {
            (PaneMode::Frozen, _) => {}
            (PaneMode::Shell, "Enter") => {
                let line = std::mem::take(&mut pane.input);
                pane.output.push_str(&format!("$ {}\n", line));
                if line.trim_start().starts_with("cd ") && line.contains("&&") {
                    pane.mode = state.startup_modes.pop_front().unwrap_or(startup_mode);
                    if pane.mode == PaneMode::Frozen {
                        pane.output.push_str(&format!("{}\n", HUNG_SCREEN));
                    }
                }
            }
            (PaneMode::Agent, "Enter") => {
                let line = std::mem::take(&mut pane.input);
                pane.palette_open = false;
                if line.contains("mark-active") {
                    registered = Some(name.to_string());
                }
                pane.output.push_str(&format!("> {}\n● Working...\n", line));
            }
            (PaneMode::Shell, "C-c") => {
                let line = std::mem::take(&mut pane.input);
                pane.output.push_str(&format!("$ {}^C\n", line));
            }
            (PaneMode::Agent, "C-c") => {
                // agent 退出回到 shell
                pane.input.clear();
                pane.palette_open = false;
                pane.mode = PaneMode::Shell;
            }
            (PaneMode::Agent, "Escape") => {
                pane.input.clear();
                pane.palette_open = false;
            }
            (PaneMode::Shell, "Escape") => {}
            (_, "BSpace") => {
                pane.input.pop();
            }
            (PaneMode::Agent, "/") if pane.input.is_empty() => {
                pane.palette_open = true;
                pane.input.push('/');
            }
            (_, other) => pane.input.push_str(other),
        }
        Ok(registered)
    }
}

impl Default for FakeTmux {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TmuxTransport for FakeTmux {
    async fn new_session(&self, name: &str, _working_dir: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(Call::NewSession(name.to_string()));
        if state.panes.contains_key(name) {
            return Err(anyhow!("duplicate session: {}", name));
        }
        let mode = state.session_modes.pop_front().unwrap_or(self.default_mode);
        state.panes.insert(name.to_string(), FakePane::new(mode));
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(Call::KillSession(name.to_string()));
        state
            .panes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| anyhow!("can't find session: {}", name))
    }

    async fn has_session(&self, name: &str) -> bool {
        self.lock().panes.contains_key(name)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        Ok(self
            .lock()
            .panes
            .keys()
            .map(|name| SessionSummary {
                name: name.clone(),
                created_at: Utc::now(),
                attached: false,
            })
            .collect())
    }

    async fn send_literal(&self, name: &str, text: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(Call::Literal(name.to_string(), text.to_string()));
        if state.fail_literals {
            return Err(anyhow!("server exited unexpectedly"));
        }
        let pane = state
            .panes
            .get_mut(name)
            .ok_or_else(|| anyhow!("can't find session: {}", name))?;
        if pane.mode != PaneMode::Frozen {
            pane.input.push_str(text);
        }
        Ok(())
    }

    async fn send_key(&self, name: &str, key: &str) -> Result<()> {
        let registered = {
            let mut state = self.lock();
            state.calls.push(Call::Key(name.to_string(), key.to_string()));
            self.press(&mut state, name, key)?
        };
        if let (Some(session), Some(store)) = (registered, &self.registrar) {
            // agent 自己调用注册接口
            store
                .update_member(&session, None, Box::new(|m| m.mark_active()))
                .await?;
        }
        Ok(())
    }

    async fn capture(&self, name: &str, _lines: u32) -> Result<String> {
        self.lock()
            .panes
            .get(name)
            .map(|p| p.render())
            .ok_or_else(|| anyhow!("can't find session: {}", name))
    }
}

/// 注册确认只在 `ready_at` 之后出现的存储
pub struct TimedStore {
    inner: MemoryStore,
    ready_at: Instant,
}

impl TimedStore {
    pub fn new(after: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            ready_at: Instant::now() + after,
        }
    }
}

#[async_trait]
impl StateStore for TimedStore {
    async fn get_member(&self, session_name: &str) -> Result<Option<MemberRecord>> {
        self.inner.get_member(session_name).await
    }

    async fn put_member(&self, record: MemberRecord) -> Result<()> {
        self.inner.put_member(record).await
    }

    async fn remove_member(&self, session_name: &str) -> Result<()> {
        self.inner.remove_member(session_name).await
    }

    async fn get_all_members(&self) -> Result<Vec<MemberRecord>> {
        self.inner.get_all_members().await
    }

    async fn record_delivery_log(&self, entry: DeliveryLogEntry) -> Result<()> {
        self.inner.record_delivery_log(entry).await
    }

    async fn delivery_logs(&self, session_name: Option<&str>) -> Result<Vec<DeliveryLogEntry>> {
        self.inner.delivery_logs(session_name).await
    }

    async fn get_member_registration_status(
        &self,
        _session_name: &str,
        _role: &str,
    ) -> Result<RegistrationStatus> {
        Ok(RegistrationStatus {
            registered: Instant::now() >= self.ready_at,
        })
    }
}

/// 对某个 session 的写入总是失败的存储
pub struct BrokenWriteStore {
    inner: MemoryStore,
    broken: String,
}

impl BrokenWriteStore {
    pub fn new(broken: &str) -> Self {
        Self {
            inner: MemoryStore::new(),
            broken: broken.to_string(),
        }
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait]
impl StateStore for BrokenWriteStore {
    async fn get_member(&self, session_name: &str) -> Result<Option<MemberRecord>> {
        self.inner.get_member(session_name).await
    }

    async fn put_member(&self, record: MemberRecord) -> Result<()> {
        if record.session_name == self.broken {
            return Err(anyhow!("disk full"));
        }
        self.inner.put_member(record).await
    }

    async fn update_member(
        &self,
        session_name: &str,
        create_role: Option<&str>,
        edit: MemberEdit,
    ) -> Result<Option<MemberRecord>> {
        if session_name == self.broken {
            return Err(anyhow!("disk full"));
        }
        self.inner.update_member(session_name, create_role, edit).await
    }

    async fn remove_member(&self, session_name: &str) -> Result<()> {
        self.inner.remove_member(session_name).await
    }

    async fn get_all_members(&self) -> Result<Vec<MemberRecord>> {
        self.inner.get_all_members().await
    }

    async fn record_delivery_log(&self, entry: DeliveryLogEntry) -> Result<()> {
        self.inner.record_delivery_log(entry).await
    }

    async fn delivery_logs(&self, session_name: Option<&str>) -> Result<Vec<DeliveryLogEntry>> {
        self.inner.delivery_logs(session_name).await
    }
}

pub fn orchestrator(tmux: Arc<FakeTmux>, store: Arc<dyn StateStore>) -> Orchestrator {
    Orchestrator::new(OrchestratorConfig::default(), tmux, store)
}
