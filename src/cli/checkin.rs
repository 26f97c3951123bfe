// src/cli/checkin.rs
//! Check-in 与监控命令 - 前台运行直到 Ctrl+C

use anyhow::{anyhow, Result};
use clap::Args;
use std::time::Duration;
use tracing::info;

use super::output::{preview, print_rows};
use crate::infra::CancelToken;
use crate::orchestrator::Orchestrator;

/// checkin 命令参数
#[derive(Args)]
pub struct CheckinArgs {
    /// 目标 tmux session
    pub target: String,

    /// 消息内容
    pub message: String,

    /// 延迟 N 分钟后发送一次
    #[arg(long, conflicts_with = "every")]
    pub after: Option<u64>,

    /// 每 N 分钟发送一次
    #[arg(long)]
    pub every: Option<u64>,
}

/// 调度 check-in 并在前台等待
pub async fn handle_checkin(orch: &Orchestrator, args: CheckinArgs) -> Result<()> {
    let id = match (args.after, args.every) {
        (_, Some(every)) => orch.schedule_recurring(&args.target, every, &args.message)?,
        (Some(after), None) => orch.schedule_check(&args.target, after, &args.message)?,
        (None, None) => return Err(anyhow!("需要指定 --after 或 --every")),
    };
    println!("已调度 check-in {} -> {}（Ctrl+C 退出）", id, args.target);

    // 一次性 check 触发后自动退出
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if orch.list_checks().iter().all(|c| c.id != id) {
                    break;
                }
            }
        }
    }

    orch.shutdown();
    Ok(())
}

/// 运行活动监控循环
pub async fn handle_watch(orch: &Orchestrator) -> Result<()> {
    let cancel = CancelToken::new();
    let handle = orch.run_activity_loop(cancel.clone());
    println!(
        "活动监控已启动，间隔 {}s（Ctrl+C 退出）",
        orch.config().activity.interval_secs
    );

    tokio::signal::ctrl_c().await?;
    cancel.cancel();
    handle.await?;
    Ok(())
}

/// 打印投递日志
pub async fn handle_deliveries(orch: &Orchestrator, session: Option<String>, json: bool) -> Result<()> {
    let entries = orch.store().delivery_logs(session.as_deref()).await?;
    print_rows(&entries, json, "暂无投递记录", |e| {
        format!(
            "{} | {} | {} | {}{}",
            e.delivered_at.format("%Y-%m-%d %H:%M:%S"),
            e.target_session,
            if e.success { "ok" } else { "failed" },
            preview(&e.message, 60),
            e.error.as_deref().map(|err| format!(" ({})", err)).unwrap_or_default()
        )
    });
    Ok(())
}
