//! 外部存储 - 团队成员状态与投递日志
//!
//! 注册是否成功只以这里的记录为准；终端文本仅作为存活判断的启发式依据。
//!
//! ## 实现
//!
//! - `file::JsonFileStore` - `members.json` + `deliveries.jsonl`，文件锁保护
//! - `memory::MemoryStore` - 进程内实现，用于测试和临时运行

pub mod file;
pub mod memory;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::infra::KeyedLocks;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

/// 编排者会话使用的角色名
pub const ORCHESTRATOR_ROLE: &str = "orchestrator";

/// 成员的 agent 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Inactive,
    Activating,
    Active,
}

/// 成员的工作状态（由活动监控推导）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkingStatus {
    #[default]
    Idle,
    InProgress,
}

impl std::fmt::Display for WorkingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkingStatus::Idle => write!(f, "idle"),
            WorkingStatus::InProgress => write!(f, "in_progress"),
        }
    }
}

/// 成员记录，以 session 名称为 key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub session_name: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,
    #[serde(default)]
    pub agent_status: AgentStatus,
    #[serde(default)]
    pub working_status: WorkingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_check: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl MemberRecord {
    pub fn new(session_name: &str, role: &str) -> Self {
        Self {
            session_name: session_name.to_string(),
            role: role.to_string(),
            member_id: None,
            agent_status: AgentStatus::Inactive,
            working_status: WorkingStatus::Idle,
            registered_at: None,
            last_activity_check: None,
            updated_at: Utc::now(),
        }
    }

    /// 由 agent 自己调用的注册接口所做的修改
    pub fn mark_active(&mut self) {
        let now = Utc::now();
        self.agent_status = AgentStatus::Active;
        self.registered_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_inactive(&mut self) {
        self.agent_status = AgentStatus::Inactive;
        self.working_status = WorkingStatus::Idle;
        self.updated_at = Utc::now();
    }
}

/// 注册确认查询结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationStatus {
    pub registered: bool,
}

/// 一次 check-in 投递的日志（只追加）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_id: Option<String>,
    pub target_session: String,
    pub message: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub delivered_at: DateTime<Utc>,
}

impl DeliveryLogEntry {
    pub fn new(
        check_id: Option<&str>,
        target_session: &str,
        message: &str,
        error: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            check_id: check_id.map(|s| s.to_string()),
            target_session: target_session.to_string(),
            message: message.to_string(),
            success: error.is_none(),
            error,
            delivered_at: Utc::now(),
        }
    }
}

/// 对单条成员记录的修改
pub type MemberEdit = Box<dyn FnOnce(&mut MemberRecord) + Send + 'static>;

/// 存储接口：按记录 upsert，单条记录读自己的写
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_member(&self, session_name: &str) -> Result<Option<MemberRecord>>;
    async fn put_member(&self, record: MemberRecord) -> Result<()>;

    /// 读-改-写一条记录。`create_role` 为 `Some` 时记录不存在则按该角色新建，
    /// 否则返回 `None`。
    ///
    /// 默认实现是两次独立调用；跨进程共享的存储必须覆盖它，在同一把锁内完成。
    async fn update_member(
        &self,
        session_name: &str,
        create_role: Option<&str>,
        edit: MemberEdit,
    ) -> Result<Option<MemberRecord>> {
        let mut record = match self.get_member(session_name).await? {
            Some(record) => record,
            None => match create_role {
                Some(role) => MemberRecord::new(session_name, role),
                None => return Ok(None),
            },
        };
        edit(&mut record);
        self.put_member(record.clone()).await?;
        Ok(Some(record))
    }

    async fn remove_member(&self, session_name: &str) -> Result<()>;
    async fn get_all_members(&self) -> Result<Vec<MemberRecord>>;
    async fn record_delivery_log(&self, entry: DeliveryLogEntry) -> Result<()>;
    async fn delivery_logs(&self, session_name: Option<&str>) -> Result<Vec<DeliveryLogEntry>>;

    /// 轮询注册确认用的读路径
    async fn get_member_registration_status(
        &self,
        session_name: &str,
        role: &str,
    ) -> Result<RegistrationStatus> {
        let registered = self
            .get_member(session_name)
            .await?
            .map(|m| m.role == role && m.agent_status == AgentStatus::Active)
            .unwrap_or(false);
        Ok(RegistrationStatus { registered })
    }

    /// 编排者成员的记录
    async fn get_orchestrator_status(&self) -> Result<Option<MemberRecord>> {
        Ok(self
            .get_all_members()
            .await?
            .into_iter()
            .find(|m| m.role == ORCHESTRATOR_ROLE))
    }
}

/// 带每个 session 写锁的存储句柄
///
/// 同一 session 的读-改-写不会交错，不同 session 之间互不阻塞。
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<dyn StateStore>,
    locks: Arc<KeyedLocks>,
}

impl SharedStore {
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self {
            inner,
            locks: Arc::new(KeyedLocks::new()),
        }
    }

    pub fn inner(&self) -> &Arc<dyn StateStore> {
        &self.inner
    }

    /// 在 session 写锁内修改记录；记录不存在时返回 `None`
    pub async fn update_member<F>(&self, session_name: &str, f: F) -> Result<Option<MemberRecord>>
    where
        F: FnOnce(&mut MemberRecord) + Send + 'static,
    {
        let _guard = self.locks.lock(session_name).await;
        self.inner
            .update_member(session_name, None, stamped(f))
            .await
    }

    /// 在 session 写锁内修改记录；不存在时按 `role` 新建
    pub async fn upsert_member<F>(
        &self,
        session_name: &str,
        role: &str,
        f: F,
    ) -> Result<MemberRecord>
    where
        F: FnOnce(&mut MemberRecord) + Send + 'static,
    {
        let _guard = self.locks.lock(session_name).await;
        self.inner
            .update_member(session_name, Some(role), stamped(f))
            .await?
            .with_context(|| format!("store did not create member {}", session_name))
    }

    pub async fn remove_member(&self, session_name: &str) -> Result<()> {
        let _guard = self.locks.lock(session_name).await;
        self.inner.remove_member(session_name).await
    }

    pub async fn get_member(&self, session_name: &str) -> Result<Option<MemberRecord>> {
        self.inner.get_member(session_name).await
    }

    pub async fn get_all_members(&self) -> Result<Vec<MemberRecord>> {
        self.inner.get_all_members().await
    }

    pub async fn get_member_registration_status(
        &self,
        session_name: &str,
        role: &str,
    ) -> Result<RegistrationStatus> {
        self.inner
            .get_member_registration_status(session_name, role)
            .await
    }

    pub async fn record_delivery_log(&self, entry: DeliveryLogEntry) -> Result<()> {
        self.inner.record_delivery_log(entry).await
    }

    pub async fn delivery_logs(&self, session_name: Option<&str>) -> Result<Vec<DeliveryLogEntry>> {
        self.inner.delivery_logs(session_name).await
    }
}

fn stamped<F>(f: F) -> MemberEdit
where
    F: FnOnce(&mut MemberRecord) + Send + 'static,
{
    Box::new(move |record| {
        f(record);
        record.updated_at = Utc::now();
    })
}
