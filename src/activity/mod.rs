//! Activity monitoring - derives idle / in-progress from pane changes

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ActivityConfig;
use crate::infra::{sleep_or_cancel, CancelToken, TmuxManager};
use crate::store::{AgentStatus, SharedStore, WorkingStatus};

/// Last captured buffer for one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySample {
    pub session_name: String,
    pub last_buffer: String,
    pub working_status: WorkingStatus,
    pub sampled_at: DateTime<Utc>,
}

/// Status for `current` given the previous buffer.
///
/// The first sample is only a baseline and reports idle.
pub fn derive_status(previous: Option<&str>, current: &str) -> WorkingStatus {
    match previous {
        Some(prev) if prev != current && !current.trim().is_empty() => WorkingStatus::InProgress,
        _ => WorkingStatus::Idle,
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub sampled: usize,
    /// Sessions whose persisted working status changed
    pub changed: Vec<(String, WorkingStatus)>,
    pub vanished: Vec<String>,
}

enum Observation {
    Vanished,
    Captured(String),
}

pub struct ActivityMonitor {
    tmux: Arc<TmuxManager>,
    store: SharedStore,
    config: ActivityConfig,
    samples: Mutex<HashMap<String, ActivitySample>>,
}

impl ActivityMonitor {
    pub fn new(tmux: Arc<TmuxManager>, store: SharedStore, config: ActivityConfig) -> Self {
        Self {
            tmux,
            store,
            config,
            samples: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_activity(&self, session: &str) -> Option<ActivitySample> {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.get(session).cloned()
    }

    /// Drop the sample so the next capture starts from a fresh baseline
    pub fn remove(&self, session: &str) {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.remove(session);
    }

    /// Sample every non-inactive member once.
    pub async fn tick(&self) -> Result<TickReport> {
        let members = self.store.get_all_members().await?;
        let tracked: Vec<_> = members
            .into_iter()
            .filter(|m| m.agent_status != AgentStatus::Inactive)
            .collect();

        let mut captures = JoinSet::new();
        for member in &tracked {
            let tmux = Arc::clone(&self.tmux);
            let name = member.session_name.clone();
            let lines = self.config.capture_lines;
            captures.spawn(async move {
                let observation = if tmux.session_exists(&name).await {
                    Observation::Captured(tmux.capture_pane(&name, lines).await)
                } else {
                    Observation::Vanished
                };
                (name, observation)
            });
        }

        let mut observed = HashMap::new();
        while let Some(joined) = captures.join_next().await {
            match joined {
                Ok((name, observation)) => {
                    observed.insert(name, observation);
                }
                Err(e) => warn!(error = %e, "Activity capture task failed"),
            }
        }

        let mut report = TickReport::default();
        for member in tracked {
            let name = member.session_name.as_str();
            match observed.remove(name) {
                Some(Observation::Vanished) => {
                    self.remove(name);
                    info!(session = %name, "Session disappeared, marking member inactive");
                    if let Err(e) = self.store.update_member(name, |m| m.mark_inactive()).await {
                        warn!(session = %name, error = %e, "Failed to mark member inactive");
                    }
                    report.vanished.push(name.to_string());
                }
                Some(Observation::Captured(buffer)) => {
                    report.sampled += 1;
                    let status = self.record_sample(name, buffer);
                    if status != member.working_status {
                        debug!(session = %name, from = %member.working_status, to = %status, "Working status changed");
                        let persisted = self
                            .store
                            .update_member(name, move |m| {
                                m.working_status = status;
                                m.last_activity_check = Some(Utc::now());
                            })
                            .await;
                        match persisted {
                            Ok(_) => report.changed.push((name.to_string(), status)),
                            Err(e) => {
                                warn!(session = %name, error = %e, "Failed to persist working status")
                            }
                        }
                    }
                }
                None => {}
            }
        }

        Ok(report)
    }

    fn record_sample(&self, session: &str, buffer: String) -> WorkingStatus {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let previous = samples.get(session).map(|s| s.last_buffer.as_str());
        let status = derive_status(previous, &buffer);
        samples.insert(
            session.to_string(),
            ActivitySample {
                session_name: session.to_string(),
                last_buffer: buffer,
                working_status: status,
                sampled_at: Utc::now(),
            },
        );
        status
    }

    /// Tick at the configured interval until cancelled.
    pub async fn run(&self, cancel: &CancelToken) {
        info!(interval_secs = self.config.interval_secs, "Activity monitor started");
        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "Activity tick failed");
            }
            if !sleep_or_cancel(self.config.interval(), Some(cancel)).await {
                break;
            }
        }
        info!("Activity monitor stopped");
    }
}
