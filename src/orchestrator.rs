//! Orchestrator 模块 - 会话生命周期的统一入口
//!
//! 持有全部组件（控制器、探测、注册状态机、调度器、活动监控、存储），
//! 不依赖任何全局状态。外部接口层（CLI 等）只与这里交互。

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::activity::{ActivityMonitor, ActivitySample};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::infra::{CancelToken, LifecycleState, Session, TmuxManager, TmuxTransport};
use crate::registration::{RegistrationMachine, RegistrationReport, RegistrationRequest};
use crate::runtime::{RuntimeProbe, RuntimeType};
use crate::scheduler::{CheckinScheduler, ScheduledCheck};
use crate::store::{JsonFileStore, SharedStore, StateStore};

/// 启动 agent 的请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub session_name: String,
    pub role: String,
    pub working_directory: String,
    #[serde(default)]
    pub runtime: RuntimeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,
    /// 不指定时使用配置中的整体超时
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_timeout: Option<Duration>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    tmux: Arc<TmuxManager>,
    probe: Arc<RuntimeProbe>,
    registration: Arc<RegistrationMachine>,
    scheduler: CheckinScheduler,
    activity: Arc<ActivityMonitor>,
    store: SharedStore,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        transport: Arc<dyn TmuxTransport>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let tmux = Arc::new(TmuxManager::new(transport, config.tmux.clone()));
        let store = SharedStore::new(store);
        let probe = Arc::new(RuntimeProbe::new(Arc::clone(&tmux), config.probe.clone()));
        let registration = Arc::new(RegistrationMachine::new(
            Arc::clone(&tmux),
            Arc::clone(&probe),
            store.clone(),
            config.registration.clone(),
        ));
        let scheduler = CheckinScheduler::new(Arc::clone(&tmux), store.clone());
        let activity = Arc::new(ActivityMonitor::new(
            Arc::clone(&tmux),
            store.clone(),
            config.activity.clone(),
        ));

        Self {
            config,
            tmux,
            probe,
            registration,
            scheduler,
            activity,
            store,
        }
    }

    /// 真实 tmux + 数据目录下的文件存储
    pub fn from_config(config: OrchestratorConfig) -> Result<Self> {
        let transport = Arc::new(crate::infra::CommandTransport::new(config.tmux.socket.clone()));
        let store = Arc::new(JsonFileStore::new(&config.store.data_dir)?);
        Ok(Self::new(config, transport, store))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn tmux(&self) -> &Arc<TmuxManager> {
        &self.tmux
    }

    pub fn probe(&self) -> &Arc<RuntimeProbe> {
        &self.probe
    }

    pub fn registration(&self) -> &Arc<RegistrationMachine> {
        &self.registration
    }

    pub fn scheduler(&self) -> &CheckinScheduler {
        &self.scheduler
    }

    pub fn activity(&self) -> &Arc<ActivityMonitor> {
        &self.activity
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub async fn create_session(&self, name: &str, working_directory: &str) -> Result<Session> {
        let session = self.tmux.create_session(name, working_directory).await?;
        self.registration.set_state(name, LifecycleState::Created);
        Ok(session)
    }

    pub async fn is_agent_responsive(&self, session: &str, force_refresh: bool) -> bool {
        self.probe.is_agent_responsive(session, force_refresh).await
    }

    pub async fn register_session(
        &self,
        session: &str,
        role: &str,
        working_directory: &str,
        overall_timeout: Option<Duration>,
        member_id: Option<String>,
    ) -> Result<RegistrationReport> {
        let timeout = overall_timeout.unwrap_or_else(|| self.config.registration.overall_timeout());
        let request = RegistrationRequest::new(session, role, working_directory, timeout)
            .with_member_id(member_id);
        self.registration.register_session(request).await
    }

    /// 创建 session（已存在则复用）、启动运行时、注册
    pub async fn spawn_agent(&self, spawn: SpawnRequest) -> Result<RegistrationReport> {
        let timeout = spawn
            .overall_timeout
            .unwrap_or_else(|| self.config.registration.overall_timeout());
        let request = RegistrationRequest::new(
            &spawn.session_name,
            &spawn.role,
            &spawn.working_directory,
            timeout,
        )
        .with_member_id(spawn.member_id.clone())
        .with_runtime(spawn.runtime);

        let reused = match self.create_session(&spawn.session_name, &spawn.working_directory).await {
            Ok(_) => false,
            Err(OrchestratorError::AlreadyExists(name)) => {
                info!(session = %name, "Session already exists, reusing it");
                true
            }
            Err(e) => return Err(e),
        };

        // 已经在跑的 agent 会把启动命令当成聊天输入
        let agent_running = reused && self.probe.is_agent_responsive(&spawn.session_name, true).await;
        if agent_running {
            info!(session = %spawn.session_name, "Agent already running in reused session, skipping launch");
        } else {
            // 运行时没起来也继续，由注册的升级策略兜底
            let ready_deadline = Instant::now() + self.config.registration.ready_timeout();
            if let Err(e) = self.registration.launch_runtime(&request, ready_deadline).await {
                warn!(session = %spawn.session_name, error = %e, "Runtime launch not confirmed");
            }
        }

        self.registration.register_session(request).await
    }

    pub fn lifecycle_state(&self, session: &str) -> Option<LifecycleState> {
        self.registration.lifecycle_state(session)
    }

    pub fn schedule_check(&self, target: &str, delay_minutes: u64, message: &str) -> Result<String> {
        self.scheduler.schedule_once(target, delay_minutes, message)
    }

    pub fn schedule_recurring(&self, target: &str, interval_minutes: u64, message: &str) -> Result<String> {
        self.scheduler.schedule_recurring(target, interval_minutes, message)
    }

    pub fn cancel_check(&self, check_id: &str) -> bool {
        self.scheduler.cancel(check_id)
    }

    pub fn list_checks(&self) -> Vec<ScheduledCheck> {
        self.scheduler.list_active()
    }

    pub fn get_activity(&self, session: &str) -> Option<ActivitySample> {
        self.activity.get_activity(session)
    }

    /// 拆除 session：取消定时器、清理缓存、终止 session、成员置为 inactive
    pub async fn teardown(&self, session: &str) -> Result<()> {
        let cancelled = self.scheduler.cancel_all_for_session(session);
        self.activity.remove(session);
        self.probe.invalidate(session);
        self.registration.forget(session);
        self.tmux.kill_session(session).await;
        self.store.update_member(session, |m| m.mark_inactive()).await?;
        info!(session = %session, cancelled_checks = cancelled, "Session torn down");
        Ok(())
    }

    /// 后台活动监控，直到 `cancel` 被触发
    pub fn run_activity_loop(&self, cancel: CancelToken) -> tokio::task::JoinHandle<()> {
        let activity = Arc::clone(&self.activity);
        tokio::spawn(async move { activity.run(&cancel).await })
    }

    /// 取消所有定时器
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}
