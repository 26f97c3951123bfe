//! agentmux CLI
//!
//! 管理 tmux 中的编码 agent (Claude Code, Gemini CLI, Codex)：创建、注册、check-in、活动监控

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

use agentmux::cli::{
    self, CaptureArgs, CheckinArgs, CreateArgs, MarkActiveArgs, ProbeArgs, RegisterArgs, SendArgs,
};
use agentmux::{Orchestrator, OrchestratorConfig};

#[derive(Parser)]
#[command(name = "agentmux")]
#[command(about = "agentmux - 在 tmux 中编排编码 agent 的会话生命周期")]
#[command(version)]
struct Cli {
    /// 配置文件路径（默认 ~/.config/agentmux/config.json）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 列出所有 tmux session
    Sessions {
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
    /// 创建 tmux session
    Create(CreateArgs),
    /// 终止 session 并清理其定时器和成员状态
    Kill {
        /// tmux session 名称
        name: String,
    },
    /// 向 session 发送消息
    Send(SendArgs),
    /// 捕获 session 的终端输出
    Capture(CaptureArgs),
    /// 探测 session 中的 agent 是否可交互
    Probe(ProbeArgs),
    /// 对已有 session 执行注册流程
    Register(RegisterArgs),
    /// 创建 session、启动 agent 并注册
    Spawn(RegisterArgs),
    /// 标记成员已注册（由 agent 自己调用）
    MarkActive(MarkActiveArgs),
    /// 调度 check-in 消息（前台运行）
    Checkin(CheckinArgs),
    /// 运行活动监控（前台运行）
    Watch,
    /// 列出团队成员
    Members {
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
    /// 查看 check-in 投递日志
    Deliveries {
        /// 只看某个 session
        #[arg(long, short)]
        session: Option<String>,
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // 通过 RUST_LOG 环境变量控制日志级别，默认为 info
    // 例如: RUST_LOG=agentmux=debug agentmux watch
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("agentmux=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let args = Cli::parse();

    let config = match &args.config {
        Some(path) => OrchestratorConfig::load_from(path)?,
        None => OrchestratorConfig::load()?,
    };
    let orch = Orchestrator::from_config(config)?;

    match args.command {
        Commands::Sessions { json } => cli::handle_sessions(&orch, json).await?,
        Commands::Create(a) => cli::handle_create(&orch, a).await?,
        Commands::Kill { name } => cli::handle_kill(&orch, &name).await?,
        Commands::Send(a) => cli::handle_send(&orch, a).await?,
        Commands::Capture(a) => cli::handle_capture(&orch, a).await?,
        Commands::Probe(a) => cli::handle_probe(&orch, a).await?,
        Commands::Register(a) => cli::handle_register(&orch, a).await?,
        Commands::Spawn(a) => cli::handle_spawn(&orch, a).await?,
        Commands::MarkActive(a) => cli::handle_mark_active(&orch, a).await?,
        Commands::Checkin(a) => cli::handle_checkin(&orch, a).await?,
        Commands::Watch => cli::handle_watch(&orch).await?,
        Commands::Members { json } => cli::handle_members(&orch, json).await?,
        Commands::Deliveries { session, json } => {
            cli::handle_deliveries(&orch, session, json).await?
        }
    }

    orch.shutdown();
    Ok(())
}
