//! Periodic idle/expiry supervision.

use super::registry::SessionRegistry;
use crate::error::{Result, ServerError};
use crate::protocol::SessionId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStateChange {
    /// Crossed the AFK threshold.
    Idle,
    /// Activity resumed after being idle.
    Active,
    /// Crossed the session timeout and was removed.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionNotice {
    pub session_id: SessionId,
    pub change: SessionStateChange,
}

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    pub went_idle: Vec<SessionId>,
    pub resumed: Vec<SessionId>,
    pub expired: Vec<SessionId>,
}

impl SupervisorReport {
    pub fn is_empty(&self) -> bool {
        self.went_idle.is_empty() && self.resumed.is_empty() && self.expired.is_empty()
    }
}

pub struct SessionSupervisor {
    registry: Arc<SessionRegistry>,
    afk_timeout: Duration,
    session_timeout: Duration,
    tick_interval: Duration,
    notices: Option<mpsc::UnboundedSender<SessionNotice>>,
}

impl SessionSupervisor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        afk_timeout: Duration,
        session_timeout: Duration,
        tick_interval: Duration,
    ) -> Result<Self> {
        if afk_timeout >= session_timeout {
            return Err(ServerError::Config(format!(
                "afk timeout ({afk_timeout:?}) must be shorter than session timeout ({session_timeout:?})"
            )));
        }
        if tick_interval.is_zero() {
            return Err(ServerError::Config("supervisor interval must be non-zero".into()));
        }

        Ok(Self {
            registry,
            afk_timeout,
            session_timeout,
            tick_interval,
            notices: None,
        })
    }

    /// Sends every state change to `notices` in addition to logging it.
    pub fn with_notices(mut self, notices: mpsc::UnboundedSender<SessionNotice>) -> Self {
        self.notices = Some(notices);
        self
    }

    /// Runs one pass against `now`.
    ///
    /// All sessions are classified first; expired ones are removed only after
    /// the scan has finished.
    pub fn tick_at(&self, now: Instant) -> SupervisorReport {
        let mut report = SupervisorReport::default();

        for session in self.registry.all_sessions() {
            let idle = now.saturating_duration_since(session.last_activity());

            if idle > self.session_timeout {
                report.expired.push(session.id());
            } else if idle > self.afk_timeout {
                if !session.set_idle(true) {
                    report.went_idle.push(session.id());
                }
            } else if session.set_idle(false) {
                report.resumed.push(session.id());
            }
        }

        for &id in &report.went_idle {
            info!("💤 Session {} is idle", id);
            self.notify(id, SessionStateChange::Idle);
        }
        for &id in &report.resumed {
            info!("Session {} is active again", id);
            self.notify(id, SessionStateChange::Active);
        }
        for &id in &report.expired {
            if self.registry.remove_session(id).is_some() {
                info!("⏰ Session {} expired", id);
                self.notify(id, SessionStateChange::Expired);
            }
        }

        report
    }

    pub fn tick(&self) -> SupervisorReport {
        self.tick_at(Instant::now())
    }

    /// Ticks until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick();
                    if !report.is_empty() {
                        debug!("Supervisor tick: {:?}", report);
                    }
                }
            }
        }

        debug!("Session supervisor stopped");
    }

    fn notify(&self, session_id: SessionId, change: SessionStateChange) {
        if let Some(notices) = &self.notices {
            if notices.send(SessionNotice { session_id, change }).is_err() {
                warn!("Session notice receiver dropped");
            }
        }
    }
}
