//! Time-bounded consultation
//!
//! Runs the decision process for moderate-severity violations. Each
//! session owns an independent cancellable deadline timer; votes are
//! serialized into the tally under a single coordinator lock. Only one
//! active session may exist per violation id; re-opening returns a ticket
//! for the existing session instead of spawning a duplicate.

use crate::contracts::{ConsultationSession, Decision, SessionStatus, Violation};
use crate::error::{GuardianError, Result};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use uuid::Uuid;

/// Handle returned from [`ConsultationCoordinator::open`]
pub struct SessionTicket {
    pub session_id: Uuid,
    /// True when an existing session for the violation was reused
    pub reused: bool,
    receiver: watch::Receiver<Option<Decision>>,
}

impl SessionTicket {
    /// Await the session's decision
    pub async fn decision(mut self) -> Decision {
        loop {
            if let Some(decision) = *self.receiver.borrow() {
                return decision;
            }
            // Sender dropping without a decision means the coordinator
            // went away; treat as timeout.
            if self.receiver.changed().await.is_err() {
                return Decision::TimedOut;
            }
        }
    }
}

struct SessionState {
    session: ConsultationSession,
    voted: HashSet<String>,
    timer: Option<JoinHandle<()>>,
    outcome_tx: watch::Sender<Option<Decision>>,
}

#[derive(Default)]
struct CoordinatorInner {
    sessions: HashMap<Uuid, SessionState>,
    by_violation: HashMap<Uuid, Uuid>,
}

/// Coordinates consultation sessions for moderate violations
pub struct ConsultationCoordinator {
    quorum_fraction: f64,
    approval_threshold: f64,
    inner: Mutex<CoordinatorInner>,
}

impl ConsultationCoordinator {
    pub fn new(quorum_fraction: f64, approval_threshold: f64) -> Self {
        Self {
            quorum_fraction,
            approval_threshold,
            inner: Mutex::new(CoordinatorInner::default()),
        }
    }

    /// Open a session for a violation, or return a ticket for the one
    /// already active on that violation id.
    pub async fn open(
        self: &Arc<Self>,
        violation: &Violation,
        representatives: Vec<String>,
        timeout: Duration,
    ) -> SessionTicket {
        let mut inner = self.inner.lock().await;

        if let Some(&existing_id) = inner.by_violation.get(&violation.id) {
            if let Some(state) = inner.sessions.get(&existing_id) {
                return SessionTicket {
                    session_id: existing_id,
                    reused: true,
                    receiver: state.outcome_tx.subscribe(),
                };
            }
        }

        let session_id = Uuid::new_v4();
        let (outcome_tx, receiver) = watch::channel(None);

        let session = ConsultationSession {
            id: session_id,
            violation_id: violation.id,
            metric_name: violation.metric_name.clone(),
            deadline: Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_default(),
            representatives,
            status: SessionStatus::Pending,
            votes_for: 0,
            votes_against: 0,
        };

        let coordinator = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            coordinator.expire(session_id).await;
        });

        inner.by_violation.insert(violation.id, session_id);
        inner.sessions.insert(
            session_id,
            SessionState {
                session,
                voted: HashSet::new(),
                timer: Some(timer),
                outcome_tx,
            },
        );

        tracing::info!(session_id = %session_id, violation_id = %violation.id, "consultation session opened");

        SessionTicket {
            session_id,
            reused: false,
            receiver,
        }
    }

    /// Record one representative's vote.
    ///
    /// Votes are serialized under the coordinator lock. A session resolves
    /// before its deadline only once every representative has voted;
    /// otherwise the tally is evaluated when the deadline fires.
    pub async fn cast_vote(
        &self,
        session_id: Uuid,
        representative: &str,
        approve: bool,
    ) -> Result<SessionStatus> {
        let mut inner = self.inner.lock().await;
        let state = inner
            .sessions
            .get_mut(&session_id)
            .ok_or(GuardianError::SessionNotFound(session_id))?;

        if state.session.status != SessionStatus::Pending {
            return Err(GuardianError::SessionClosed(session_id));
        }
        if !state
            .session
            .representatives
            .iter()
            .any(|r| r == representative)
        {
            return Err(GuardianError::UnknownRepresentative {
                session_id,
                representative: representative.to_string(),
            });
        }
        if !state.voted.insert(representative.to_string()) {
            return Err(GuardianError::DuplicateVote {
                session_id,
                representative: representative.to_string(),
            });
        }

        if approve {
            state.session.votes_for += 1;
        } else {
            state.session.votes_against += 1;
        }

        if state.voted.len() == state.session.representatives.len() {
            let decision = self.tally(&state.session);
            let status = Self::finish(state, decision);
            Self::cleanup(&mut inner, session_id);
            return Ok(status);
        }

        Ok(SessionStatus::Pending)
    }

    /// Deadline expiry: evaluate the tally, or time out without quorum
    async fn expire(&self, session_id: Uuid) {
        let mut inner = self.inner.lock().await;
        let Some(state) = inner.sessions.get_mut(&session_id) else {
            return;
        };
        if state.session.status != SessionStatus::Pending {
            return;
        }
        let decision = self.tally(&state.session);
        Self::finish(state, decision);
        Self::cleanup(&mut inner, session_id);
        tracing::info!(session_id = %session_id, ?decision, "consultation session reached deadline");
    }

    /// Quorum gates the approval threshold
    fn tally(&self, session: &ConsultationSession) -> Decision {
        let votes_cast = (session.votes_for + session.votes_against) as f64;
        let representatives = session.representatives.len().max(1) as f64;

        if votes_cast / representatives < self.quorum_fraction || votes_cast == 0.0 {
            return Decision::TimedOut;
        }
        if session.votes_for as f64 / votes_cast >= self.approval_threshold {
            Decision::Approved
        } else {
            Decision::Rejected
        }
    }

    /// Mark resolved, cancel the deadline timer, publish the decision
    fn finish(state: &mut SessionState, decision: Decision) -> SessionStatus {
        state.session.status = match decision {
            Decision::Approved => SessionStatus::Approved,
            Decision::Rejected => SessionStatus::Rejected,
            Decision::TimedOut => SessionStatus::TimedOut,
            Decision::Superseded => SessionStatus::Superseded,
        };
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let _ = state.outcome_tx.send(Some(decision));
        state.session.status
    }

    /// Drop a resolved session; further votes get `SessionNotFound`
    fn cleanup(inner: &mut CoordinatorInner, session_id: Uuid) {
        if let Some(state) = inner.sessions.remove(&session_id) {
            inner.by_violation.remove(&state.session.violation_id);
        }
    }

    /// Cancel the active session for a violation, if any.
    ///
    /// Used when a worsening detection moves the violation onto the
    /// immediate path: the timer is aborted, the awaiting decision task
    /// receives [`Decision::Superseded`], and late votes get
    /// `SessionNotFound`.
    pub async fn supersede(&self, violation_id: Uuid) -> Option<Uuid> {
        let mut inner = self.inner.lock().await;
        let session_id = inner.by_violation.get(&violation_id).copied()?;
        let state = inner.sessions.get_mut(&session_id)?;
        if state.session.status != SessionStatus::Pending {
            return None;
        }
        Self::finish(state, Decision::Superseded);
        Self::cleanup(&mut inner, session_id);
        tracing::info!(session_id = %session_id, violation_id = %violation_id, "consultation session superseded");
        Some(session_id)
    }

    /// Snapshot of active sessions for the monitoring endpoint
    pub async fn sessions(&self) -> Vec<ConsultationSession> {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .values()
            .map(|state| state.session.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::Severity;

    fn violation() -> Violation {
        Violation {
            id: Uuid::new_v4(),
            metric_name: "participation.rate".to_string(),
            current_value: 0.55,
            threshold: 0.60,
            severity: Severity::Moderate,
            detected_at: Utc::now(),
        }
    }

    fn coordinator() -> Arc<ConsultationCoordinator> {
        Arc::new(ConsultationCoordinator::new(0.10, 0.60))
    }

    fn reps(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("rep-{}", i)).collect()
    }

    #[tokio::test]
    async fn test_zero_votes_times_out_at_deadline_not_earlier() {
        let coordinator = coordinator();
        let ticket = coordinator
            .open(&violation(), reps(10), Duration::from_millis(120))
            .await;

        // Well before the deadline the session is still pending.
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(coordinator.sessions().await.len(), 1);

        let decision = ticket.decision().await;
        assert_eq!(decision, Decision::TimedOut);
        assert!(coordinator.sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_quorum_and_approval_at_deadline() {
        let coordinator = coordinator();
        let ticket = coordinator
            .open(&violation(), reps(10), Duration::from_millis(80))
            .await;

        // 2/10 participation meets the 10% quorum; 2/2 approvals meet 60%.
        coordinator
            .cast_vote(ticket.session_id, "rep-0", true)
            .await
            .unwrap();
        coordinator
            .cast_vote(ticket.session_id, "rep-1", true)
            .await
            .unwrap();

        assert_eq!(ticket.decision().await, Decision::Approved);
    }

    #[tokio::test]
    async fn test_quorum_met_but_approval_short_rejects() {
        let coordinator = coordinator();
        let ticket = coordinator
            .open(&violation(), reps(10), Duration::from_millis(80))
            .await;

        coordinator
            .cast_vote(ticket.session_id, "rep-0", true)
            .await
            .unwrap();
        coordinator
            .cast_vote(ticket.session_id, "rep-1", false)
            .await
            .unwrap();

        // 50% approval < 60% threshold.
        assert_eq!(ticket.decision().await, Decision::Rejected);
    }

    #[tokio::test]
    async fn test_all_votes_resolve_before_deadline() {
        let coordinator = coordinator();
        let ticket = coordinator
            .open(&violation(), reps(3), Duration::from_secs(60))
            .await;
        let session_id = ticket.session_id;

        coordinator.cast_vote(session_id, "rep-0", true).await.unwrap();
        coordinator.cast_vote(session_id, "rep-1", true).await.unwrap();
        let status = coordinator.cast_vote(session_id, "rep-2", false).await.unwrap();
        assert_eq!(status, SessionStatus::Approved);

        // Resolves immediately, long before the 60s deadline.
        assert_eq!(ticket.decision().await, Decision::Approved);

        // Session destroyed after resolution; late votes are rejected.
        let err = coordinator.cast_vote(session_id, "rep-0", true).await.unwrap_err();
        assert!(matches!(err, GuardianError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_one_active_session_per_violation() {
        let coordinator = coordinator();
        let v = violation();

        let first = coordinator
            .open(&v, reps(3), Duration::from_secs(60))
            .await;
        let second = coordinator
            .open(&v, reps(3), Duration::from_secs(60))
            .await;

        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(coordinator.sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_representative_rejected() {
        let coordinator = coordinator();
        let ticket = coordinator
            .open(&violation(), reps(2), Duration::from_secs(60))
            .await;
        let err = coordinator
            .cast_vote(ticket.session_id, "intruder", true)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardianError::UnknownRepresentative { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_vote_rejected() {
        let coordinator = coordinator();
        let ticket = coordinator
            .open(&violation(), reps(3), Duration::from_secs(60))
            .await;
        coordinator
            .cast_vote(ticket.session_id, "rep-0", true)
            .await
            .unwrap();
        let err = coordinator
            .cast_vote(ticket.session_id, "rep-0", true)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardianError::DuplicateVote { .. }));
    }

    #[tokio::test]
    async fn test_below_quorum_votes_still_time_out() {
        // 1 of 20 representatives is 5% participation, below the 10% quorum.
        let coordinator = coordinator();
        let ticket = coordinator
            .open(&violation(), reps(20), Duration::from_millis(60))
            .await;
        coordinator
            .cast_vote(ticket.session_id, "rep-0", true)
            .await
            .unwrap();

        assert_eq!(ticket.decision().await, Decision::TimedOut);
    }
}
