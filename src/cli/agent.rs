// src/cli/agent.rs
//! Agent 命令 - 启动、注册、成员查询
//!
//! `mark-active` 是注册提示中要求 agent 自己执行的命令，
//! 它只写存储，不接触 tmux。

use anyhow::{anyhow, Result};
use clap::Args;
use std::time::Duration;

use super::output::{print_rows, to_json};
use super::session::resolve_working_dir;
use crate::orchestrator::{Orchestrator, SpawnRequest};
use crate::registration::{RegistrationReport, RegistrationRequest};
use crate::runtime::RuntimeType;
use crate::store::MemberRecord;

/// register 命令参数
#[derive(Args)]
pub struct RegisterArgs {
    /// tmux session 名称
    pub name: String,

    /// 角色: orchestrator, developer, qa, tpm, designer ...
    #[arg(long, short)]
    pub role: String,

    /// 工作目录（默认当前目录）
    #[arg(long, short = 'c')]
    pub cwd: Option<String>,

    /// Agent 运行时: claude-code, gemini-cli, codex
    #[arg(long, default_value = "claude-code")]
    pub runtime: String,

    /// 成员 ID（写入注册提示）
    #[arg(long)]
    pub member_id: Option<String>,

    /// 整体超时（秒），默认使用配置值
    #[arg(long)]
    pub timeout: Option<u64>,

    /// 输出 JSON 格式
    #[arg(long)]
    pub json: bool,
}

/// mark-active 命令参数
#[derive(Args)]
pub struct MarkActiveArgs {
    /// tmux session 名称
    #[arg(long, short)]
    pub session: String,

    /// 角色
    #[arg(long, short)]
    pub role: String,

    /// 成员 ID
    #[arg(long)]
    pub member_id: Option<String>,
}

impl RegisterArgs {
    fn runtime(&self) -> Result<RuntimeType> {
        self.runtime.parse().map_err(|_| {
            anyhow!(
                "不支持的运行时: {}，可选: claude-code, gemini-cli, codex",
                self.runtime
            )
        })
    }
}

fn print_report(report: &RegistrationReport, json: bool) {
    if json {
        println!("{}", to_json(report));
        return;
    }
    println!(
        "✅ {} ({}) 已注册，策略 {} ({})，耗时 {:.1}s",
        report.session_name,
        report.role,
        report.strategy.number(),
        report.strategy,
        report.elapsed.as_secs_f64()
    );
}

/// 对已有 session 执行注册流程
pub async fn handle_register(orch: &Orchestrator, args: RegisterArgs) -> Result<()> {
    let runtime = args.runtime()?;
    let cwd = resolve_working_dir(args.cwd.clone())?;
    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| orch.config().registration.overall_timeout());

    let request = RegistrationRequest::new(&args.name, &args.role, &cwd, timeout)
        .with_member_id(args.member_id.clone())
        .with_runtime(runtime);
    let report = orch.registration().register_session(request).await?;
    print_report(&report, args.json);
    Ok(())
}

/// 创建 session、启动运行时并注册
pub async fn handle_spawn(orch: &Orchestrator, args: RegisterArgs) -> Result<()> {
    let runtime = args.runtime()?;
    let cwd = resolve_working_dir(args.cwd.clone())?;
    let report = orch
        .spawn_agent(SpawnRequest {
            session_name: args.name.clone(),
            role: args.role.clone(),
            working_directory: cwd,
            runtime,
            member_id: args.member_id.clone(),
            overall_timeout: args.timeout.map(Duration::from_secs),
        })
        .await?;
    print_report(&report, args.json);
    Ok(())
}

/// agent 调用的注册接口
pub async fn handle_mark_active(orch: &Orchestrator, args: MarkActiveArgs) -> Result<()> {
    let role = args.role.clone();
    let member_id = args.member_id.clone();
    let record = orch
        .store()
        .upsert_member(&args.session, &args.role, move |m| {
            m.role = role;
            if member_id.is_some() {
                m.member_id = member_id;
            }
            m.mark_active();
        })
        .await?;
    println!("已注册: {} ({})", record.session_name, record.role);
    Ok(())
}

pub async fn handle_members(orch: &Orchestrator, json: bool) -> Result<()> {
    let members: Vec<MemberRecord> = orch.store().get_all_members().await?;
    print_rows(&members, json, "暂无成员", |m| {
        format!(
            "{} | 角色: {} | 状态: {:?} | 工作: {}",
            m.session_name, m.role, m.agent_status, m.working_status
        )
    });
    Ok(())
}
