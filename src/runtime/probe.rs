//! Runtime probe - is an interactive agent alive and responsive in a session?
//!
//! A single probe key is sent and the pane is captured before and after a
//! settle delay. A responsive agent reacts with a visible UI element (the
//! slash-command palette), a plain shell echoes one character, and a frozen
//! session shows nothing at all.
//!
//! Results are cached per session for a freshness window, and at most one
//! probe runs per session: concurrent callers wait on the in-flight probe.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::ProbeConfig;
use crate::infra::{ControlKey, TmuxManager};

/// How one probe classified the pane change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Nothing changed: frozen or not accepting input
    Unobserved,
    /// Echoed like a plain shell
    PlainShell,
    /// Delta between the thresholds, treated as not responsive
    Inconclusive,
    AgentDetected,
}

impl ProbeOutcome {
    pub fn is_responsive(&self) -> bool {
        matches!(self, ProbeOutcome::AgentDetected)
    }
}

/// Cached outcome of a probe
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub is_responsive: bool,
    pub observed_at: DateTime<Utc>,
    checked: Instant,
}

impl ProbeResult {
    fn new(is_responsive: bool) -> Self {
        Self {
            is_responsive,
            observed_at: Utc::now(),
            checked: Instant::now(),
        }
    }

    pub fn is_fresh(&self, freshness: std::time::Duration) -> bool {
        self.checked.elapsed() < freshness
    }
}

/// Classify the pane before and after the probe key.
pub fn classify_probe(before: &str, after: &str, config: &ProbeConfig) -> ProbeOutcome {
    let marker_appeared = config
        .ui_markers
        .iter()
        .any(|m| after.matches(m.as_str()).count() > before.matches(m.as_str()).count());
    if marker_appeared {
        return ProbeOutcome::AgentDetected;
    }

    let delta = after.chars().count() as i64 - before.chars().count() as i64;
    if delta <= 1 {
        return ProbeOutcome::Unobserved;
    }

    let delta = delta as usize;
    if delta > config.shell_delta_max {
        ProbeOutcome::AgentDetected
    } else if delta >= config.shell_delta_min {
        ProbeOutcome::PlainShell
    } else {
        ProbeOutcome::Inconclusive
    }
}

#[derive(Default)]
struct ProbeSlot {
    cached: Option<ProbeResult>,
    in_flight: Option<watch::Receiver<Option<bool>>>,
}

type SharedSlot = Arc<Mutex<ProbeSlot>>;

/// Clears the in-flight marker even if the probing future is dropped.
struct InFlightGuard {
    slot: SharedSlot,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.in_flight = None;
    }
}

enum Ticket {
    Cached(bool),
    Wait(watch::Receiver<Option<bool>>),
    Run(watch::Sender<Option<bool>>, InFlightGuard),
}

pub struct RuntimeProbe {
    tmux: Arc<TmuxManager>,
    config: ProbeConfig,
    slots: Mutex<HashMap<String, SharedSlot>>,
}

impl RuntimeProbe {
    pub fn new(tmux: Arc<TmuxManager>, config: ProbeConfig) -> Self {
        Self {
            tmux,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, session: &str) -> SharedSlot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(session.to_string()).or_default().clone()
    }

    /// Last cached result, fresh or not
    pub fn cached(&self, session: &str) -> Option<ProbeResult> {
        let slot = self.slot(session);
        let slot = slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.cached.clone()
    }

    /// Drop the cached result (session killed or recreated)
    pub fn invalidate(&self, session: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let Some(slot) = slots.get(session) else {
            return;
        };
        slot.lock().unwrap_or_else(|e| e.into_inner()).cached = None;
        // Keep the slot while a probe is running so waiters still find it
        if Arc::strong_count(slot) == 1 {
            slots.remove(session);
        }
    }

    fn take_ticket(&self, session: &str, force_refresh: bool) -> Ticket {
        let shared = self.slot(session);
        let mut slot = shared.lock().unwrap_or_else(|e| e.into_inner());

        if !force_refresh {
            if let Some(result) = slot.cached.as_ref().filter(|r| r.is_fresh(self.config.freshness())) {
                return Ticket::Cached(result.is_responsive);
            }
        }

        if let Some(rx) = &slot.in_flight {
            return Ticket::Wait(rx.clone());
        }

        let (tx, rx) = watch::channel(None);
        slot.in_flight = Some(rx);
        drop(slot);
        Ticket::Run(tx, InFlightGuard { slot: shared })
    }

    /// Whether a responsive agent runs in `session`.
    pub async fn is_agent_responsive(&self, session: &str, force_refresh: bool) -> bool {
        match self.take_ticket(session, force_refresh) {
            Ticket::Cached(value) => {
                debug!(session = %session, responsive = value, "Probe cache hit");
                value
            }
            Ticket::Wait(rx) => self.wait_for_in_flight(session, rx).await,
            Ticket::Run(tx, guard) => {
                let result = self.run_probe(session).await;
                if let Some(value) = result {
                    let mut slot = guard.slot.lock().unwrap_or_else(|e| e.into_inner());
                    slot.cached = Some(ProbeResult::new(value));
                }
                let value = result.unwrap_or(false);
                tx.send_replace(Some(value));
                drop(guard);
                value
            }
        }
    }

    async fn wait_for_in_flight(&self, session: &str, mut rx: watch::Receiver<Option<bool>>) -> bool {
        debug!(session = %session, "Probe already in flight, waiting for its result");
        let waited = timeout(self.config.dedup_wait(), async {
            loop {
                if let Some(value) = *rx.borrow_and_update() {
                    return Some(value);
                }
                if rx.changed().await.is_err() {
                    // Prober went away without a result
                    return None;
                }
            }
        })
        .await;

        match waited {
            Ok(Some(value)) => value,
            Ok(None) => false,
            Err(_) => {
                warn!(session = %session, "Timed out waiting for in-flight probe");
                false
            }
        }
    }

    /// Send the probe key and classify. `None` means the probe could not be
    /// delivered; such results are not cached.
    async fn run_probe(&self, session: &str) -> Option<bool> {
        let lines = self.config.capture_lines;
        let before = self.tmux.capture_pane(session, lines).await;

        if let Err(e) = self
            .tmux
            .send_control_key(session, ControlKey::Char(self.config.probe_key))
            .await
        {
            debug!(session = %session, error = %e, "Probe key not delivered");
            return None;
        }

        sleep(self.config.settle()).await;
        let after = self.tmux.capture_pane(session, lines).await;
        let outcome = classify_probe(&before, &after, &self.config);

        // Put the pane back the way it was
        let restore = match outcome {
            ProbeOutcome::AgentDetected => Some(ControlKey::Escape),
            _ if after.chars().count() > before.chars().count() => Some(ControlKey::Backspace),
            _ => None,
        };
        if let Some(key) = restore {
            if let Err(e) = self.tmux.send_control_key(session, key).await {
                debug!(session = %session, error = %e, "Failed to restore pane after probe");
            }
        }

        info!(session = %session, outcome = ?outcome, "Runtime probe finished");
        Some(outcome.is_responsive())
    }
}
