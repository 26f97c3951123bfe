//! Escalating registration runs.
//!
//! A run walks the strategies in order until the external store confirms the
//! member, or every strategy has been tried. Each strategy gets its own
//! deadline, clipped to the overall deadline of the run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use super::{
    AttemptOutcome, PromptLibrary, RegistrationAttempt, RegistrationFailure, RegistrationReport,
    RegistrationRequest, Strategy,
};
use crate::config::RegistrationConfig;
use crate::error::{OrchestratorError, Result};
use crate::infra::terminal::shell_single_quote;
use crate::infra::{poll_until, ControlKey, KeyedLocks, LifecycleState, TmuxManager};
use crate::runtime::{ReadySignal, RuntimeProbe, RuntimeType};
use crate::store::{AgentStatus, SharedStore};

/// Shell line that starts `runtime` inside `working_directory`.
pub fn startup_script(
    working_directory: &str,
    runtime: RuntimeType,
    overrides: &HashMap<String, String>,
) -> String {
    format!(
        "cd {} && {}",
        shell_single_quote(working_directory),
        runtime.startup_command(overrides)
    )
}

/// Prompts are submitted as one line: a literal newline would submit early.
fn single_line(prompt: &str) -> String {
    prompt
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct RegistrationMachine {
    tmux: Arc<TmuxManager>,
    probe: Arc<RuntimeProbe>,
    store: SharedStore,
    prompts: PromptLibrary,
    config: RegistrationConfig,
    locks: KeyedLocks,
    states: Mutex<HashMap<String, LifecycleState>>,
}

impl RegistrationMachine {
    pub fn new(
        tmux: Arc<TmuxManager>,
        probe: Arc<RuntimeProbe>,
        store: SharedStore,
        config: RegistrationConfig,
    ) -> Self {
        let prompts = PromptLibrary::new(config.prompt_dir.clone());
        Self {
            tmux,
            probe,
            store,
            prompts,
            config,
            locks: KeyedLocks::new(),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    /// Last lifecycle state seen for `session`
    pub fn lifecycle_state(&self, session: &str) -> Option<LifecycleState> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.get(session).copied()
    }

    pub fn forget(&self, session: &str) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.remove(session);
    }

    pub(crate) fn set_state(&self, session: &str, state: LifecycleState) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let previous = states.insert(session.to_string(), state);
        if previous != Some(state) {
            info!(session = %session, state = %state, "Lifecycle state changed");
        }
    }

    fn validate(request: &RegistrationRequest) -> Result<()> {
        TmuxManager::validate_name(&request.session_name)?;
        if request.role.trim().is_empty() {
            return Err(OrchestratorError::InvalidParameter(
                "role must not be empty".to_string(),
            ));
        }
        if request.working_directory.trim().is_empty() {
            return Err(OrchestratorError::InvalidParameter(
                "working directory must not be empty".to_string(),
            ));
        }
        if request.overall_timeout.is_zero() {
            return Err(OrchestratorError::InvalidParameter(
                "overall timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Drive `request.session_name` to `Registered`, escalating on failure.
    pub async fn register_session(&self, request: RegistrationRequest) -> Result<RegistrationReport> {
        Self::validate(&request)?;
        let session = request.session_name.as_str();

        let _guard = self.locks.lock(session).await;
        let started = Instant::now();
        let overall_deadline = started + request.overall_timeout;

        if self.lifecycle_state(session).is_none() {
            self.set_state(session, LifecycleState::Created);
        }

        // A stale `active` from an earlier run must not count as confirmation
        let member_id = request.member_id.clone();
        let role = request.role.clone();
        self.store
            .upsert_member(session, &request.role, move |m| {
                m.role = role;
                if member_id.is_some() {
                    m.member_id = member_id;
                }
                m.agent_status = AgentStatus::Activating;
                m.registered_at = None;
            })
            .await?;

        info!(
            session = %session,
            role = %request.role,
            timeout_secs = request.overall_timeout.as_secs(),
            "Registration started"
        );

        let mut attempts = Vec::new();
        let mut last_strategy = None;

        for strategy in Strategy::ESCALATION {
            let now = Instant::now();
            if now >= overall_deadline {
                warn!(session = %session, "Overall registration timeout reached");
                break;
            }
            let deadline = (now + strategy.budget(&self.config)).min(overall_deadline);
            let mut attempt = RegistrationAttempt::new(session, strategy, deadline);
            last_strategy = Some(strategy);

            info!(
                session = %session,
                strategy = %strategy,
                budget_ms = (deadline - now).as_millis() as u64,
                "Trying registration strategy"
            );

            attempt.outcome = match timeout_at(deadline, self.run_strategy(strategy, &request, deadline)).await {
                Ok(Ok(())) => AttemptOutcome::Success,
                Ok(Err(e)) => {
                    warn!(session = %session, strategy = %strategy, error = %e, "Registration strategy failed");
                    AttemptOutcome::Failure(e.to_string())
                }
                Err(_) => {
                    warn!(session = %session, strategy = %strategy, "Registration strategy ran out of time");
                    AttemptOutcome::Failure("strategy budget exhausted".to_string())
                }
            };

            let succeeded = attempt.outcome == AttemptOutcome::Success;
            attempts.push(attempt.summary());

            if succeeded {
                self.set_state(session, LifecycleState::Registered);
                let elapsed = started.elapsed();
                info!(
                    session = %session,
                    strategy = %strategy,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Registration confirmed"
                );
                return Ok(RegistrationReport {
                    session_name: request.session_name.clone(),
                    role: request.role.clone(),
                    state: LifecycleState::Registered,
                    strategy,
                    elapsed,
                    attempts,
                });
            }
        }

        self.set_state(session, LifecycleState::Failed);
        if let Err(e) = self.store.update_member(session, |m| m.mark_inactive()).await {
            warn!(session = %session, error = %e, "Failed to mark member inactive");
        }

        let failure = RegistrationFailure {
            session_name: request.session_name.clone(),
            role: request.role.clone(),
            elapsed: started.elapsed(),
            last_strategy,
            attempts,
        };
        error!(session = %session, role = %request.role, "{}", failure);
        Err(OrchestratorError::EscalationExhausted(Box::new(failure)))
    }

    async fn run_strategy(
        &self,
        strategy: Strategy,
        request: &RegistrationRequest,
        deadline: Instant,
    ) -> Result<()> {
        let session = request.session_name.as_str();
        let started = Instant::now();

        match strategy {
            Strategy::DirectPrompt => {
                if !self.probe.is_agent_responsive(session, false).await {
                    return Err(OrchestratorError::RuntimeUnavailable {
                        session: session.to_string(),
                        waited: started.elapsed(),
                    });
                }
                self.set_state(session, LifecycleState::RuntimeReady);
            }
            Strategy::CleanupReinit => {
                self.interrupt(session).await?;
                self.start_runtime(request, deadline).await?;
            }
            Strategy::FullRecreate => {
                self.tmux.kill_session(session).await;
                self.probe.invalidate(session);
                self.tmux
                    .create_session(session, &request.working_directory)
                    .await?;
                self.set_state(session, LifecycleState::Created);
                self.start_runtime(request, deadline).await?;
            }
            Strategy::GiveUp => {
                return Err(OrchestratorError::InvalidParameter(
                    "give_up is not a runnable strategy".to_string(),
                ))
            }
        }

        self.set_state(session, LifecycleState::Registering);
        self.send_prompt(request).await?;
        self.await_confirmation(request, deadline).await
    }

    /// Several interrupts clear half-typed input and stuck prompts
    async fn interrupt(&self, session: &str) -> Result<()> {
        for i in 0..self.config.interrupt_count {
            if i > 0 {
                sleep(self.config.interrupt_gap()).await;
            }
            self.tmux.send_control_key(session, ControlKey::Interrupt).await?;
        }
        sleep(self.config.after_interrupt()).await;
        Ok(())
    }

    /// Type the startup script and wait for the runtime banner.
    pub async fn launch_runtime(&self, request: &RegistrationRequest, deadline: Instant) -> Result<()> {
        let session = request.session_name.as_str();
        self.set_state(session, LifecycleState::RuntimeStarting);

        let script = startup_script(
            &request.working_directory,
            request.runtime,
            &self.config.startup_commands,
        );
        self.probe.invalidate(session);
        self.tmux.send_message(session, &script).await?;

        self.wait_for_ready(request, deadline).await?;
        self.set_state(session, LifecycleState::RuntimeReady);
        Ok(())
    }

    /// Launch, then confirm with a fresh probe.
    async fn start_runtime(&self, request: &RegistrationRequest, deadline: Instant) -> Result<()> {
        let session = request.session_name.as_str();
        self.launch_runtime(request, deadline).await?;

        let waited = Instant::now();
        if !self.probe.is_agent_responsive(session, true).await {
            return Err(OrchestratorError::RuntimeUnavailable {
                session: session.to_string(),
                waited: waited.elapsed(),
            });
        }
        Ok(())
    }

    /// Only a missing banner at the end of the wait counts as unavailable.
    async fn wait_for_ready(&self, request: &RegistrationRequest, deadline: Instant) -> Result<()> {
        let session = request.session_name.as_str();
        let signal = ReadySignal::new(request.runtime, &self.config.extra_ready_phrases);
        let started = Instant::now();
        let ready_deadline = (started + self.config.ready_timeout()).min(deadline);
        let lines = self.tmux.config().capture_lines;

        let ready = poll_until(ready_deadline, self.config.ready_poll(), None, || {
            let signal = &signal;
            async move {
                let pane = self.tmux.capture_pane(session, lines).await;
                signal.matches(&pane).then_some(())
            }
        })
        .await;

        match ready {
            Some(()) => {
                debug!(session = %session, waited_ms = started.elapsed().as_millis() as u64, "Runtime banner visible");
                Ok(())
            }
            None => Err(OrchestratorError::RuntimeUnavailable {
                session: session.to_string(),
                waited: started.elapsed(),
            }),
        }
    }

    async fn send_prompt(&self, request: &RegistrationRequest) -> Result<()> {
        let prompt = self.prompts.render(
            &request.role,
            &request.session_name,
            request.member_id.as_deref(),
        );
        self.tmux
            .send_message(&request.session_name, &single_line(&prompt))
            .await
    }

    /// Poll the store; the agent's own terminal output is never trusted here.
    async fn await_confirmation(&self, request: &RegistrationRequest, deadline: Instant) -> Result<()> {
        let session = request.session_name.as_str();
        let role = request.role.as_str();
        let started = Instant::now();

        let confirmed = poll_until(deadline, self.config.confirmation_poll(), None, || async move {
            match self.store.get_member_registration_status(session, role).await {
                Ok(status) => status.registered.then_some(()),
                Err(e) => {
                    debug!(session = %session, error = %e, "Registration status read failed");
                    None
                }
            }
        })
        .await;

        confirmed.ok_or_else(|| OrchestratorError::RegistrationTimeout {
            session: session.to_string(),
            role: role.to_string(),
            waited: started.elapsed(),
        })
    }
}
