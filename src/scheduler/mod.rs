//! Check-in 调度 - 定时向 session 发送消息
//!
//! 每个 check 是一个独立的 tokio 任务，持有自己的 `CancelToken`。
//! 注册表只在增删时短暂加锁；取消后的 check 不会再触发，也不会重新排期。
//! 定时器不持久化，进程退出即丢失。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::infra::{CancelToken, TmuxManager};
use crate::store::{DeliveryLogEntry, SharedStore};

const SECS_PER_MINUTE: u64 = 60;
/// 延迟和间隔的上限：一年
pub const MAX_SCHEDULE_MINUTES: u64 = 365 * 24 * 60;

fn minutes_to_duration(minutes: u64, what: &str) -> Result<Duration> {
    if minutes > MAX_SCHEDULE_MINUTES {
        return Err(OrchestratorError::InvalidParameter(format!(
            "{} of {} minutes exceeds the limit of {} minutes",
            what, minutes, MAX_SCHEDULE_MINUTES
        )));
    }
    minutes
        .checked_mul(SECS_PER_MINUTE)
        .map(Duration::from_secs)
        .ok_or_else(|| OrchestratorError::InvalidParameter(format!("{} overflows", what)))
}

/// 触发方式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CheckSchedule {
    Once { fire_at: DateTime<Utc> },
    Recurring { interval_minutes: u64 },
}

/// 已排期的 check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledCheck {
    pub id: String,
    pub target_session: String,
    pub message: String,
    #[serde(flatten)]
    pub schedule: CheckSchedule,
    pub created_at: DateTime<Utc>,
}

impl ScheduledCheck {
    pub fn is_recurring(&self) -> bool {
        matches!(self.schedule, CheckSchedule::Recurring { .. })
    }
}

struct CheckEntry {
    check: ScheduledCheck,
    cancel: CancelToken,
}

type Registry = Arc<Mutex<HashMap<String, CheckEntry>>>;

/// 触发时需要的依赖
#[derive(Clone)]
struct Courier {
    tmux: Arc<TmuxManager>,
    store: SharedStore,
}

impl Courier {
    /// 投递一次；session 不存在时静默跳过，否则无论成败都写投递日志
    async fn deliver(&self, check: &ScheduledCheck) {
        let target = check.target_session.as_str();
        if !self.tmux.session_exists(target).await {
            debug!(check_id = %check.id, session = %target, "Target session gone, skipping check-in");
            return;
        }

        let error = match self.tmux.send_message(target, &check.message).await {
            Ok(()) => {
                info!(check_id = %check.id, session = %target, "Check-in delivered");
                None
            }
            Err(e) => {
                warn!(check_id = %check.id, session = %target, error = %e, "Check-in delivery failed");
                Some(e.to_string())
            }
        };

        let entry = DeliveryLogEntry::new(Some(&check.id), target, &check.message, error);
        if let Err(e) = self.store.record_delivery_log(entry).await {
            warn!(check_id = %check.id, error = %e, "Failed to record delivery log");
        }
    }
}

/// Check-in 调度器
pub struct CheckinScheduler {
    courier: Courier,
    checks: Registry,
}

impl CheckinScheduler {
    pub fn new(tmux: Arc<TmuxManager>, store: SharedStore) -> Self {
        Self {
            courier: Courier { tmux, store },
            checks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn validate(target_session: &str, message: &str) -> Result<()> {
        TmuxManager::validate_name(target_session)?;
        if message.trim().is_empty() {
            return Err(OrchestratorError::InvalidParameter(
                "check-in message must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// `delay_minutes` 后触发一次
    pub fn schedule_once(&self, target_session: &str, delay_minutes: u64, message: &str) -> Result<String> {
        Self::validate(target_session, message)?;
        let delay = minutes_to_duration(delay_minutes, "delay")?;
        let fire_at = Utc::now() + chrono::Duration::seconds(delay.as_secs() as i64);
        let check = self.new_check(target_session, message, CheckSchedule::Once { fire_at });
        Ok(self.arm(check, delay, None))
    }

    /// 每 `interval_minutes` 触发一次，第一次在一个间隔之后
    pub fn schedule_recurring(
        &self,
        target_session: &str,
        interval_minutes: u64,
        message: &str,
    ) -> Result<String> {
        Self::validate(target_session, message)?;
        if interval_minutes == 0 {
            return Err(OrchestratorError::InvalidParameter(
                "recurring interval must be at least one minute".to_string(),
            ));
        }
        let every = minutes_to_duration(interval_minutes, "interval")?;
        let check = self.new_check(
            target_session,
            message,
            CheckSchedule::Recurring { interval_minutes },
        );
        Ok(self.arm(check, every, Some(every)))
    }

    fn new_check(&self, target_session: &str, message: &str, schedule: CheckSchedule) -> ScheduledCheck {
        ScheduledCheck {
            id: uuid::Uuid::new_v4().to_string(),
            target_session: target_session.to_string(),
            message: message.to_string(),
            schedule,
            created_at: Utc::now(),
        }
    }

    fn arm(&self, check: ScheduledCheck, first_delay: Duration, every: Option<Duration>) -> String {
        let id = check.id.clone();
        let cancel = CancelToken::new();

        // 持锁完成 spawn + insert，任务结束时的自我移除一定发生在插入之后
        let mut checks = self.checks.lock().unwrap_or_else(|e| e.into_inner());
        tokio::spawn(run_check(
            self.courier.clone(),
            Arc::clone(&self.checks),
            check.clone(),
            cancel.clone(),
            Instant::now() + first_delay,
            every,
        ));
        info!(
            check_id = %id,
            session = %check.target_session,
            recurring = every.is_some(),
            delay_secs = first_delay.as_secs(),
            "Check-in scheduled"
        );
        checks.insert(id.clone(), CheckEntry { check, cancel });
        id
    }

    /// 取消 check；不存在时返回 `false`
    pub fn cancel(&self, check_id: &str) -> bool {
        let removed = {
            let mut checks = self.checks.lock().unwrap_or_else(|e| e.into_inner());
            checks.remove(check_id)
        };
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                info!(check_id = %check_id, session = %entry.check.target_session, "Check-in cancelled");
                true
            }
            None => false,
        }
    }

    /// 取消某个 session 的全部 check，返回取消数量
    pub fn cancel_all_for_session(&self, session_name: &str) -> usize {
        let removed: Vec<CheckEntry> = {
            let mut checks = self.checks.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<String> = checks
                .iter()
                .filter(|(_, e)| e.check.target_session == session_name)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| checks.remove(id)).collect()
        };
        for entry in &removed {
            entry.cancel.cancel();
        }
        if !removed.is_empty() {
            info!(session = %session_name, count = removed.len(), "Check-ins cancelled for session");
        }
        removed.len()
    }

    /// 仍在排期中的 check，按创建时间排序
    pub fn list_active(&self) -> Vec<ScheduledCheck> {
        let checks = self.checks.lock().unwrap_or_else(|e| e.into_inner());
        let mut active: Vec<ScheduledCheck> = checks
            .values()
            .filter(|e| !e.cancel.is_cancelled())
            .map(|e| e.check.clone())
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        active
    }

    /// 每个 session 的活跃 check 数量
    pub fn stats_by_session(&self) -> BTreeMap<String, usize> {
        let mut stats = BTreeMap::new();
        for check in self.list_active() {
            *stats.entry(check.target_session).or_insert(0) += 1;
        }
        stats
    }

    /// 取消全部定时器
    pub fn shutdown(&self) {
        let drained: Vec<CheckEntry> = {
            let mut checks = self.checks.lock().unwrap_or_else(|e| e.into_inner());
            checks.drain().map(|(_, e)| e).collect()
        };
        // 正在投递的任务允许跑完，但不会再排期
        for entry in &drained {
            entry.cancel.cancel();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "Check-in scheduler shut down");
        }
    }
}

impl Drop for CheckinScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_check(
    courier: Courier,
    registry: Registry,
    check: ScheduledCheck,
    cancel: CancelToken,
    first_fire: Instant,
    every: Option<Duration>,
) {
    let mut next = first_fire;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sleep_until(next) => {}
        }
        // 同一时刻被唤醒的其他任务先运行，到期瞬间发出的取消优先
        tokio::task::yield_now().await;
        if cancel.is_cancelled() {
            break;
        }

        courier.deliver(&check).await;

        match every {
            Some(every) if !cancel.is_cancelled() => {
                next += every;
                debug!(check_id = %check.id, "Check-in re-armed");
            }
            _ => break,
        }
    }

    let mut checks = registry.lock().unwrap_or_else(|e| e.into_inner());
    checks.remove(&check.id);
}
