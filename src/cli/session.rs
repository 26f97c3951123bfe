// src/cli/session.rs
//! Session 命令 - 直接操作 tmux session

use anyhow::{anyhow, Result};
use clap::Args;
use serde::Serialize;
use std::path::Path;

use super::output::{print_rows, to_json};
use crate::infra::terminal::truncate_last_lines;
use crate::orchestrator::Orchestrator;

/// create 命令参数
#[derive(Args)]
pub struct CreateArgs {
    /// tmux session 名称
    pub name: String,

    /// 工作目录（默认当前目录）
    #[arg(long, short = 'c')]
    pub cwd: Option<String>,
}

/// send 命令参数
#[derive(Args)]
pub struct SendArgs {
    /// tmux session 名称
    pub name: String,

    /// 要发送的消息
    pub message: String,

    /// 只输入文本，不发送 Enter
    #[arg(long)]
    pub no_enter: bool,
}

/// capture 命令参数
#[derive(Args)]
pub struct CaptureArgs {
    /// tmux session 名称
    pub name: String,

    /// 捕获行数
    #[arg(long, short, default_value = "50")]
    pub lines: u32,
}

/// probe 命令参数
#[derive(Args)]
pub struct ProbeArgs {
    /// tmux session 名称
    pub name: String,

    /// 忽略缓存，强制重新探测
    #[arg(long)]
    pub force: bool,

    /// 输出 JSON 格式
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct ProbeOutput<'a> {
    session: &'a str,
    responsive: bool,
}

/// 展开 `~/` 并校验目录存在
pub fn resolve_working_dir(cwd: Option<String>) -> Result<String> {
    let cwd = cwd
        .map(|p| {
            if let (Some(rest), Some(home)) = (p.strip_prefix("~/"), dirs::home_dir()) {
                return home.join(rest).to_string_lossy().into_owned();
            }
            p
        })
        .unwrap_or_else(|| {
            std::env::current_dir()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| ".".to_string())
        });

    if !Path::new(&cwd).is_dir() {
        return Err(anyhow!("工作目录不存在: {}", cwd));
    }
    Ok(cwd)
}

pub async fn handle_sessions(orch: &Orchestrator, json: bool) -> Result<()> {
    let sessions = orch.tmux().list_sessions().await;
    if !json {
        println!("发现 {} 个 tmux session:\n", sessions.len());
    }
    print_rows(&sessions, json, "  (无)", |s| {
        format!(
            "{} | 创建于: {} | {}",
            s.name,
            s.created_at.format("%Y-%m-%d %H:%M:%S"),
            if s.attached { "attached" } else { "detached" }
        )
    });
    Ok(())
}

pub async fn handle_create(orch: &Orchestrator, args: CreateArgs) -> Result<()> {
    let cwd = resolve_working_dir(args.cwd)?;
    let session = orch.create_session(&args.name, &cwd).await?;
    println!("已创建 tmux session: {} ({})", session.name, session.working_directory);
    Ok(())
}

pub async fn handle_kill(orch: &Orchestrator, name: &str) -> Result<()> {
    orch.teardown(name).await?;
    println!("已终止 session: {}", name);
    Ok(())
}

pub async fn handle_send(orch: &Orchestrator, args: SendArgs) -> Result<()> {
    if args.no_enter {
        orch.tmux().send_literal_input(&args.name, &args.message).await?;
    } else {
        orch.tmux().send_message(&args.name, &args.message).await?;
    }
    println!("已发送到 {}", args.name);
    Ok(())
}

pub async fn handle_capture(orch: &Orchestrator, args: CaptureArgs) -> Result<()> {
    if !orch.tmux().session_exists(&args.name).await {
        return Err(anyhow!("tmux session 不存在: {}", args.name));
    }
    let output = orch.tmux().capture_pane(&args.name, args.lines).await;
    println!("{}", truncate_last_lines(&output, args.lines as usize));
    Ok(())
}

pub async fn handle_probe(orch: &Orchestrator, args: ProbeArgs) -> Result<()> {
    let responsive = orch.is_agent_responsive(&args.name, args.force).await;
    if args.json {
        println!(
            "{}",
            to_json(&ProbeOutput {
                session: &args.name,
                responsive,
            })
        );
    } else if responsive {
        println!("{}: agent 可交互", args.name);
    } else {
        println!("{}: 未检测到可交互的 agent", args.name);
    }
    Ok(())
}
