//! 注册状态机测试 - 递进策略、外部确认、失败语义

mod common;

use agentmux::registration::AttemptOutcome;
use agentmux::store::{AgentStatus, MemoryStore, StateStore};
use agentmux::{LifecycleState, OrchestratorError, RuntimeType, SpawnRequest, Strategy};
use common::{orchestrator, Call, FakeTmux, PaneMode, TimedStore};
use std::sync::Arc;
use std::time::Duration;

fn spawn_request(name: &str, role: &str) -> SpawnRequest {
    SpawnRequest {
        session_name: name.to_string(),
        role: role.to_string(),
        working_directory: "/work/project".to_string(),
        runtime: RuntimeType::ClaudeCode,
        member_id: Some("m-42".to_string()),
        overall_timeout: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_spawn_agent_registers_with_direct_prompt() {
    // Given: 会对注册提示做出响应的 agent
    let store = Arc::new(MemoryStore::new());
    let fake = Arc::new(FakeTmux::new().with_registrar(store.clone()));
    let orch = orchestrator(fake.clone(), store.clone());

    // When
    let report = orch.spawn_agent(spawn_request("dev-1", "developer")).await.unwrap();

    // Then: 第一个策略即成功
    assert_eq!(report.strategy, Strategy::DirectPrompt);
    assert_eq!(report.state, LifecycleState::Registered);
    assert_eq!(orch.lifecycle_state("dev-1"), Some(LifecycleState::Registered));

    let member = store.get_member("dev-1").await.unwrap().unwrap();
    assert_eq!(member.agent_status, AgentStatus::Active);
    assert_eq!(member.role, "developer");
    assert_eq!(member.member_id.as_deref(), Some("m-42"));

    // Then: 启动脚本在工作目录中执行，提示里带着 session 和成员 ID
    let literals = fake.literals_for("dev-1");
    assert!(literals.iter().any(|l| l == "cd '/work/project' && claude --dangerously-skip-permissions"));
    let prompt = literals.iter().find(|l| l.contains("mark-active")).unwrap();
    assert!(prompt.contains("--session dev-1 --role developer"));
    assert!(prompt.contains("m-42"));
    assert!(!prompt.contains('\n'));
}

#[tokio::test(start_paused = true)]
async fn test_spawn_onto_live_agent_does_not_type_launch_command() {
    // Given: session 已存在，里面的 agent 正在运行
    let store = Arc::new(MemoryStore::new());
    let fake = Arc::new(FakeTmux::new().with_registrar(store.clone()));
    fake.add_session("dev-1", PaneMode::Agent);
    let orch = orchestrator(fake.clone(), store.clone());

    // When
    let report = orch.spawn_agent(spawn_request("dev-1", "developer")).await.unwrap();

    // Then: 直接注册，启动命令没有作为聊天输入发给 agent
    assert_eq!(report.strategy, Strategy::DirectPrompt);
    let literals = fake.literals_for("dev-1");
    assert!(!literals.iter().any(|l| l.starts_with("cd ")));
    assert!(literals.iter().any(|l| l.contains("mark-active")));
    assert_eq!(fake.count_calls(|c| matches!(c, Call::KillSession(_))), 0);
    assert!(store.get_member_registration_status("dev-1", "developer").await.unwrap().registered);
}

#[tokio::test(start_paused = true)]
async fn test_spawn_onto_idle_shell_session_launches_runtime() {
    // Given: session 已存在，但只是一个空闲 shell
    let store = Arc::new(MemoryStore::new());
    let fake = Arc::new(FakeTmux::new().with_registrar(store.clone()));
    fake.add_session("dev-1", PaneMode::Shell);
    let orch = orchestrator(fake.clone(), store.clone());

    // When
    let report = orch.spawn_agent(spawn_request("dev-1", "developer")).await.unwrap();

    // Then: 启动脚本照常执行
    assert_eq!(report.strategy, Strategy::DirectPrompt);
    assert_eq!(fake.mode("dev-1"), Some(PaneMode::Agent));
    let literals = fake.literals_for("dev-1");
    assert!(literals.iter().any(|l| l == "cd '/work/project' && claude --dangerously-skip-permissions"));
}

#[tokio::test(start_paused = true)]
async fn test_stale_active_record_is_not_confirmation() {
    // Given: 存储里残留着上一次运行的 active 记录，但 agent 已卡死
    let store = Arc::new(MemoryStore::new());
    let mut stale = agentmux::MemberRecord::new("dev-1", "developer");
    stale.mark_active();
    store.put_member(stale).await.unwrap();

    let fake = Arc::new(
        FakeTmux::new()
            .with_default_mode(PaneMode::Frozen)
            .with_startup_mode(PaneMode::Frozen),
    );
    fake.add_session("dev-1", PaneMode::Frozen);
    let orch = orchestrator(fake.clone(), store.clone());

    // When
    let result = orch
        .register_session("dev-1", "developer", "/work", Some(Duration::from_secs(10)), None)
        .await;

    // Then: 没有把残留记录当作成功
    assert!(matches!(result, Err(OrchestratorError::EscalationExhausted(_))));
    let member = store.get_member("dev-1").await.unwrap().unwrap();
    assert_eq!(member.agent_status, AgentStatus::Inactive);
}

#[tokio::test(start_paused = true)]
async fn test_escalation_reaches_full_recreate() {
    // Given: 现有 session 卡死，原地重启也卡死，只有重建后才正常
    let store = Arc::new(MemoryStore::new());
    let fake = Arc::new(FakeTmux::new().with_registrar(store.clone()));
    fake.add_session("dev-1", PaneMode::Frozen);
    fake.queue_session_modes(&[PaneMode::Shell]);
    let orch = orchestrator(fake.clone(), store.clone());

    // When
    let report = orch
        .register_session("dev-1", "developer", "/work", None, None)
        .await
        .unwrap();

    // Then: 依次尝试了 1、2，最终由 3 成功
    assert_eq!(report.strategy, Strategy::FullRecreate);
    let tried: Vec<Strategy> = report.attempts.iter().map(|a| a.strategy).collect();
    assert_eq!(
        tried,
        vec![Strategy::DirectPrompt, Strategy::CleanupReinit, Strategy::FullRecreate]
    );
    assert!(matches!(report.attempts[0].outcome, AttemptOutcome::Failure(_)));
    assert!(matches!(report.attempts[1].outcome, AttemptOutcome::Failure(_)));
    assert_eq!(report.attempts[2].outcome, AttemptOutcome::Success);

    // Then: 可观察到的调用与策略对应
    assert!(fake.count_key("dev-1", "C-c") >= 3);
    assert_eq!(fake.count_calls(|c| matches!(c, Call::KillSession(s) if s == "dev-1")), 1);
    assert_eq!(fake.count_calls(|c| matches!(c, Call::NewSession(s) if s == "dev-1")), 1);
    assert_eq!(fake.mode("dev-1"), Some(PaneMode::Agent));
    assert!(report.elapsed <= Duration::from_secs(90));
}

#[tokio::test(start_paused = true)]
async fn test_confirmation_after_twenty_seconds_succeeds_in_cleanup() {
    // Given: agent 可交互，但外部确认在 t=20s 才出现
    let store: Arc<dyn StateStore> = Arc::new(TimedStore::new(Duration::from_secs(20)));
    let fake = Arc::new(FakeTmux::new());
    fake.add_session("dev-1", PaneMode::Agent);
    let orch = orchestrator(fake.clone(), store);

    // When
    let report = orch
        .register_session("dev-1", "developer", "/work", None, None)
        .await
        .unwrap();

    // Then: 策略 1 的 15s 预算耗尽，策略 2 在确认出现后成功
    assert_eq!(report.strategy, Strategy::CleanupReinit);
    assert_eq!(report.attempts.len(), 2);
    assert!(report.elapsed >= Duration::from_secs(20));
    assert!(report.elapsed <= Duration::from_secs(24));
    assert!(report.attempts[0].elapsed >= Duration::from_secs(15));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_escalation_reports_last_strategy() {
    // Given: 无论怎样都卡死
    let store = Arc::new(MemoryStore::new());
    let fake = Arc::new(
        FakeTmux::new()
            .with_registrar(store.clone())
            .with_default_mode(PaneMode::Frozen)
            .with_startup_mode(PaneMode::Frozen),
    );
    fake.add_session("qa-1", PaneMode::Frozen);
    let orch = orchestrator(fake.clone(), store.clone());

    // When
    let err = orch
        .register_session("qa-1", "qa", "/work", None, None)
        .await
        .unwrap_err();

    // Then: 结构化失败，包含最后尝试的策略和耗时
    let failure = match err {
        OrchestratorError::EscalationExhausted(failure) => failure,
        other => panic!("unexpected error: {}", other),
    };
    assert_eq!(failure.last_strategy, Some(Strategy::FullRecreate));
    assert_eq!(failure.attempts.len(), 3);
    assert!(failure.elapsed <= Duration::from_secs(90));
    assert!(failure.to_string().contains("after full session recreation"));

    assert_eq!(orch.lifecycle_state("qa-1"), Some(LifecycleState::Failed));
    let member = store.get_member("qa-1").await.unwrap().unwrap();
    assert_eq!(member.agent_status, AgentStatus::Inactive);
}

#[tokio::test(start_paused = true)]
async fn test_overall_timeout_bounds_escalation() {
    // Given: 只给 20s 的整体预算
    let store = Arc::new(MemoryStore::new());
    let fake = Arc::new(
        FakeTmux::new()
            .with_default_mode(PaneMode::Frozen)
            .with_startup_mode(PaneMode::Frozen),
    );
    fake.add_session("qa-1", PaneMode::Frozen);
    let orch = orchestrator(fake.clone(), store.clone());

    let start = tokio::time::Instant::now();
    let err = orch
        .register_session("qa-1", "qa", "/work", Some(Duration::from_secs(20)), None)
        .await
        .unwrap_err();

    // Then: 没有超出整体预算，也没来得及重建
    assert!(start.elapsed() < Duration::from_secs(21));
    let failure = match err {
        OrchestratorError::EscalationExhausted(failure) => failure,
        other => panic!("unexpected error: {}", other),
    };
    assert_eq!(failure.last_strategy, Some(Strategy::CleanupReinit));
    assert_eq!(fake.count_calls(|c| matches!(c, Call::KillSession(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_registration_parameters() {
    let store = Arc::new(MemoryStore::new());
    let fake = Arc::new(FakeTmux::new());
    let orch = orchestrator(fake, store);

    let err = orch
        .register_session("dev 1", "developer", "/work", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidParameter(_)));

    let err = orch
        .register_session("dev-1", "", "/work", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidParameter(_)));
}

#[tokio::test(start_paused = true)]
async fn test_registrations_of_different_sessions_do_not_block() {
    // Given: 一个卡死的 session 和一个正常的 session
    let store = Arc::new(MemoryStore::new());
    let fake = Arc::new(FakeTmux::new().with_registrar(store.clone()));
    fake.add_session("stuck", PaneMode::Frozen);
    fake.queue_session_modes(&[PaneMode::Shell]);
    fake.add_session("dev-1", PaneMode::Agent);
    let orch = Arc::new(orchestrator(fake.clone(), store.clone()));

    // When: 同时注册
    let slow = {
        let orch = orch.clone();
        tokio::spawn(async move {
            orch.register_session("stuck", "qa", "/work", None, None).await
        })
    };
    let start = tokio::time::Instant::now();
    let fast = orch
        .register_session("dev-1", "developer", "/work", None, None)
        .await
        .unwrap();

    // Then: 正常的那个不受卡死 session 的影响
    assert_eq!(fast.strategy, Strategy::DirectPrompt);
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(slow.await.unwrap().is_ok());
}
