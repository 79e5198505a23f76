//! Instance registry: which group owns which device instance.
//!
//! A single lock over the assignment map linearizes every reservation and
//! release, so two groups can never both believe they own an instance.
//! Contention is rejected, never queued: a caller denied a reservation
//! moves on to another instance.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use botgrid_core::InstanceId;
use botgrid_state::store::epoch_millis;

use crate::error::{SchedulerError, SchedulerResult};

/// Ownership record for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceAssignment {
    pub instance: InstanceId,
    pub group: String,
    pub worker_id: String,
    /// Unix timestamp (milliseconds) of the latest reservation.
    pub reserved_at_ms: u64,
    /// A worker is executing on the instance.
    pub running: bool,
}

/// Instance → owning group.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    assignments: RwLock<HashMap<InstanceId, InstanceAssignment>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `group` may use `instance`, and the owning group if not.
    pub async fn check_availability(
        &self,
        instance: InstanceId,
        group: &str,
    ) -> (bool, Option<String>) {
        let assignments = self.assignments.read().await;
        match assignments.get(&instance) {
            Some(a) if a.group != group => (false, Some(a.group.clone())),
            _ => (true, None),
        }
    }

    /// Claim `instance` for `group`. Re-reserving as the same owner
    /// refreshes the record.
    pub async fn reserve(
        &self,
        instance: InstanceId,
        group: &str,
        worker_id: &str,
    ) -> SchedulerResult<()> {
        let mut assignments = self.assignments.write().await;
        if let Some(current) = assignments.get(&instance) {
            if current.group != group {
                return Err(SchedulerError::InstanceOwned {
                    instance,
                    owner: current.group.clone(),
                });
            }
        }

        assignments.insert(
            instance,
            InstanceAssignment {
                instance,
                group: group.to_string(),
                worker_id: worker_id.to_string(),
                reserved_at_ms: epoch_millis(),
                running: false,
            },
        );
        debug!(instance, %group, %worker_id, "instance reserved");
        Ok(())
    }

    /// Give up `instance`. No-op if nobody owns it; fails if someone else does.
    pub async fn release(&self, instance: InstanceId, group: &str) -> SchedulerResult<()> {
        let mut assignments = self.assignments.write().await;
        match assignments.get(&instance) {
            None => Ok(()),
            Some(current) if current.group != group => Err(SchedulerError::NotOwner {
                instance,
                owner: current.group.clone(),
                caller: group.to_string(),
            }),
            Some(_) => {
                assignments.remove(&instance);
                debug!(instance, %group, "instance released");
                Ok(())
            }
        }
    }

    /// Release every instance owned by `group`. Returns the released ids, sorted.
    pub async fn release_all(&self, group: &str) -> Vec<InstanceId> {
        let mut assignments = self.assignments.write().await;
        let mut released: Vec<InstanceId> = assignments
            .values()
            .filter(|a| a.group == group)
            .map(|a| a.instance)
            .collect();
        for id in &released {
            assignments.remove(id);
        }
        released.sort_unstable();
        if !released.is_empty() {
            debug!(%group, count = released.len(), "released all group instances");
        }
        released
    }

    /// Flag whether a worker is executing on an owned instance.
    pub async fn set_running(
        &self,
        instance: InstanceId,
        group: &str,
        running: bool,
    ) -> SchedulerResult<()> {
        let mut assignments = self.assignments.write().await;
        match assignments.get_mut(&instance) {
            Some(a) if a.group == group => {
                a.running = running;
                Ok(())
            }
            Some(a) => Err(SchedulerError::NotOwner {
                instance,
                owner: a.group.clone(),
                caller: group.to_string(),
            }),
            None => Err(SchedulerError::NotOwner {
                instance,
                owner: String::new(),
                caller: group.to_string(),
            }),
        }
    }

    pub async fn assignment(&self, instance: InstanceId) -> Option<InstanceAssignment> {
        self.assignments.read().await.get(&instance).cloned()
    }

    /// Assignments held by `group`, ordered by instance id.
    pub async fn assignments_for(&self, group: &str) -> Vec<InstanceAssignment> {
        let assignments = self.assignments.read().await;
        let mut owned: Vec<_> = assignments
            .values()
            .filter(|a| a.group == group)
            .cloned()
            .collect();
        owned.sort_by_key(|a| a.instance);
        owned
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn free_instance_is_available_to_anyone() {
        let registry = InstanceRegistry::new();
        assert_eq!(registry.check_availability(1, "a").await, (true, None));
    }

    #[tokio::test]
    async fn owned_instance_reports_owner() {
        let registry = InstanceRegistry::new();
        registry.reserve(1, "a", "a-1").await.unwrap();

        assert_eq!(registry.check_availability(1, "a").await, (true, None));
        assert_eq!(
            registry.check_availability(1, "b").await,
            (false, Some("a".to_string()))
        );
    }

    #[tokio::test]
    async fn reserve_rejects_other_group() {
        let registry = InstanceRegistry::new();
        registry.reserve(1, "a", "a-1").await.unwrap();

        let err = registry.reserve(1, "b", "b-1").await.unwrap_err();
        assert!(matches!(err, SchedulerError::InstanceOwned { instance: 1, ref owner } if owner == "a"));
        assert_eq!(registry.assignment(1).await.unwrap().group, "a");
    }

    #[tokio::test]
    async fn reserve_is_idempotent_for_owner() {
        let registry = InstanceRegistry::new();
        registry.reserve(1, "a", "a-1").await.unwrap();
        registry.reserve(1, "a", "a-2").await.unwrap();

        let assignment = registry.assignment(1).await.unwrap();
        assert_eq!(assignment.worker_id, "a-2");
        assert_eq!(registry.assignments_for("a").await.len(), 1);
    }

    #[tokio::test]
    async fn release_semantics() {
        let registry = InstanceRegistry::new();

        // Unassigned: no-op, twice.
        registry.release(1, "a").await.unwrap();
        registry.release(1, "a").await.unwrap();

        registry.reserve(1, "a", "a-1").await.unwrap();
        let err = registry.release(1, "b").await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotOwner { .. }));

        registry.release(1, "a").await.unwrap();
        registry.release(1, "a").await.unwrap();
        assert_eq!(registry.check_availability(1, "b").await, (true, None));
    }

    #[tokio::test]
    async fn release_all_only_touches_one_group() {
        let registry = InstanceRegistry::new();
        registry.reserve(3, "a", "a-3").await.unwrap();
        registry.reserve(1, "a", "a-1").await.unwrap();
        registry.reserve(2, "b", "b-2").await.unwrap();

        assert_eq!(registry.release_all("a").await, vec![1, 3]);
        assert!(registry.assignments_for("a").await.is_empty());
        assert_eq!(registry.assignments_for("b").await.len(), 1);
        assert!(registry.release_all("a").await.is_empty());
    }

    #[tokio::test]
    async fn running_flag_requires_ownership() {
        let registry = InstanceRegistry::new();
        registry.reserve(1, "a", "a-1").await.unwrap();

        registry.set_running(1, "a", true).await.unwrap();
        assert!(registry.assignment(1).await.unwrap().running);
        assert!(registry.set_running(1, "b", false).await.is_err());
        assert!(registry.set_running(2, "a", true).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reserve_has_exactly_one_winner() {
        for round in 0..50 {
            let registry = Arc::new(InstanceRegistry::new());
            let barrier = Arc::new(tokio::sync::Barrier::new(2));

            let tasks: Vec<_> = ["a", "b"]
                .into_iter()
                .map(|group| {
                    let registry = registry.clone();
                    let barrier = barrier.clone();
                    tokio::spawn(async move {
                        barrier.wait().await;
                        registry.reserve(round, group, group).await.is_ok()
                    })
                })
                .collect();

            let mut wins = 0;
            for task in tasks {
                if task.await.unwrap() {
                    wins += 1;
                }
            }
            assert_eq!(wins, 1, "round {round}");
            assert!(registry.assignment(round).await.is_some());
        }
    }
}
