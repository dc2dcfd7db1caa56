//! Degraded-mode responses
//!
//! Produces responses served in place of an unreachable dependency.
//! A fallback is always explicitly flagged degraded and restates the
//! invariants the dependency would normally guarantee; it is never
//! indistinguishable from a real response. State-changing intents are
//! parked in a replay queue until the dependency recovers.

use crate::contracts::{FallbackResponse, QueuedIntent};
use chrono::Utc;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Capability interface for producing degraded responses
pub trait FallbackResponder: Send + Sync {
    fn respond(&self, dependency: &str) -> FallbackResponse;
}

/// Per-dependency fallback template
struct FallbackProfile {
    guarantees: Vec<String>,
    payload: serde_json::Value,
}

/// Builds fallbacks from declared invariant clauses.
///
/// Dependencies without a declared profile get a generic degraded
/// payload; the degraded flag is set unconditionally either way.
#[derive(Default)]
pub struct InvariantFallbackGenerator {
    profiles: HashMap<String, FallbackProfile>,
}

impl InvariantFallbackGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the guarantees and payload served for one dependency
    pub fn declare(
        mut self,
        dependency: impl Into<String>,
        guarantees: Vec<String>,
        payload: serde_json::Value,
    ) -> Self {
        self.profiles.insert(
            dependency.into(),
            FallbackProfile {
                guarantees,
                payload,
            },
        );
        self
    }
}

impl FallbackResponder for InvariantFallbackGenerator {
    fn respond(&self, dependency: &str) -> FallbackResponse {
        let (guarantees, payload) = match self.profiles.get(dependency) {
            Some(profile) => (profile.guarantees.clone(), profile.payload.clone()),
            None => (
                vec!["no state was modified".to_string()],
                json!({ "status": "degraded", "dependency": dependency }),
            ),
        };

        FallbackResponse {
            dependency: dependency.to_string(),
            degraded: true,
            guarantees,
            payload,
            generated_at: Utc::now(),
        }
    }
}

/// Parks state-changing intents while a dependency is unreachable
#[derive(Default)]
pub struct ReplayQueue {
    inner: Mutex<VecDeque<QueuedIntent>>,
}

impl ReplayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park one intent; returns its queue id
    pub async fn enqueue(&self, dependency: &str, intent: serde_json::Value) -> Uuid {
        let queued = QueuedIntent {
            id: Uuid::new_v4(),
            dependency: dependency.to_string(),
            intent,
            queued_at: Utc::now(),
        };
        let id = queued.id;
        self.inner.lock().await.push_back(queued);
        id
    }

    /// Take everything queued so far, in arrival order
    pub async fn drain(&self) -> Vec<QueuedIntent> {
        self.inner.lock().await.drain(..).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_always_flagged_degraded() {
        let generator = InvariantFallbackGenerator::new();
        let response = generator.respond("revenue-calc");
        assert!(response.degraded);
        assert_eq!(response.dependency, "revenue-calc");
        assert!(!response.guarantees.is_empty());
    }

    #[test]
    fn test_declared_profile_restates_invariants() {
        let generator = InvariantFallbackGenerator::new().declare(
            "revenue-calc",
            vec!["minimum creator share 75% remains enforced".to_string()],
            json!({ "share_ratio_floor": 0.75 }),
        );

        let response = generator.respond("revenue-calc");
        assert!(response.degraded);
        assert_eq!(
            response.guarantees,
            vec!["minimum creator share 75% remains enforced".to_string()]
        );
        assert_eq!(response.payload["share_ratio_floor"], 0.75);
    }

    #[tokio::test]
    async fn test_replay_queue_preserves_arrival_order() {
        let queue = ReplayQueue::new();
        queue.enqueue("revenue-calc", json!({ "op": "first" })).await;
        queue.enqueue("revenue-calc", json!({ "op": "second" })).await;
        assert_eq!(queue.len().await, 2);

        let drained = queue.drain().await;
        assert_eq!(drained[0].intent["op"], "first");
        assert_eq!(drained[1].intent["op"], "second");
        assert!(queue.is_empty().await);
    }
}
