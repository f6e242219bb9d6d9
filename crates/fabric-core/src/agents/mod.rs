//! Multi-Agent Controller: capability-based assignment of work to one of N
//! live instances per agent role, with load tracking and failover.
//!
//! Generalizes [`crate::harness`]'s (not-yet-deleted) `HarnessRegistry` from
//! "one harness per name" to "N instances per role, chosen by policy", and
//! keeps the `Harness` trait's object-safety shape (`#[async_trait]`,
//! compile-time `_assert_object_safe` check) as the template for the
//! [`Agent`] port below. Least-loaded tracking reuses the same
//! claim-on-assign/release-on-complete counter shape as
//! `gator-core::state::assign_task`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use fabric_db::models::{AgentDefinition, AgentInstance, ErrorKind};
use fabric_db::queries::agents;

use crate::error::FabricError;

/// Outcome of one agent execution, independent of which concrete runtime
/// produced it.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub exit_code: i32,
    pub summary: String,
}

/// Adapter interface for a concrete agent runtime (an LLM coding agent CLI,
/// a scripted worker, etc). Object-safe by the same construction as
/// `Harness`: every method returns a concrete or boxed type, so `Box<dyn
/// Agent>` can live in [`AgentRuntimeRegistry`].
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    /// Run the agent against `prompt` with `cwd` as its working directory,
    /// cooperatively cancellable via `cancel`.
    async fn execute(
        &self,
        prompt: &str,
        cwd: &Path,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Agent) {}
};

/// Registry of concrete agent runtimes, keyed by name (e.g. "claude-code",
/// "codex"). Distinct from the assignment [`Controller`] below: this is the
/// process-adapter layer; the controller is the DB-backed instance/load
/// bookkeeping that decides *which* registered runtime handles a given role.
#[derive(Default)]
pub struct AgentRuntimeRegistry {
    runtimes: HashMap<String, Box<dyn Agent>>,
}

impl AgentRuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, runtime: Box<dyn Agent>) {
        self.runtimes.insert(runtime.name().to_string(), runtime);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Agent> {
        self.runtimes.get(name).map(|b| b.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.runtimes.keys().map(|s| s.as_str()).collect()
    }
}

impl std::fmt::Debug for AgentRuntimeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntimeRegistry")
            .field("runtimes", &self.runtimes.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A successful assignment: the instance claimed, with the load reservation
/// already recorded against it. Callers must release it on terminal
/// transition via [`Controller::release`].
#[derive(Debug, Clone)]
pub struct Assignment {
    pub instance: AgentInstance,
}

/// DB-backed assignment policy: `capability_match` -> `least_loaded` ->
/// `round_robin` tie-break, per spec.md §4.5.
pub struct Controller {
    pool: PgPool,
    round_robin_cursor: AtomicUsize,
}

impl Controller {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            round_robin_cursor: AtomicUsize::new(0),
        }
    }

    pub async fn register_definition(
        &self,
        role: &str,
        name: &str,
        capabilities: &[String],
    ) -> Result<AgentDefinition, FabricError> {
        agents::insert_agent_definition(&self.pool, role, name, capabilities)
            .await
            .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))
    }

    pub async fn register_instance(
        &self,
        definition_id: Uuid,
        name: &str,
        capabilities: &[String],
    ) -> Result<AgentInstance, FabricError> {
        agents::insert_agent_instance(&self.pool, definition_id, name, capabilities)
            .await
            .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))
    }

    /// Assign work requiring every capability in `required_capabilities` to
    /// one healthy instance, excluding any in `exclude` (used by failover to
    /// avoid re-picking an instance that just failed).
    ///
    /// `capability_match`: query instances advertising the first required
    /// capability (the DB index is on a single `= ANY(capabilities)` check),
    /// then filter in process for the full capability subset -- `is_subset`
    /// over the remaining requirements, matching spec.md §9's "plain data,
    /// no polymorphism" framing for capability comparison.
    /// `least_loaded`: the query already orders by `active_load ASC, name
    /// ASC`; candidates tied on load after the capability filter are then
    /// `round_robin`'d via a rotating cursor instead of always picking the
    /// alphabetically-first one.
    pub async fn assign(
        &self,
        required_capabilities: &[String],
        exclude: &[Uuid],
    ) -> Result<Assignment, FabricError> {
        let Some(first) = required_capabilities.first() else {
            return Err(FabricError::invalid_input(
                "at least one capability is required to assign an agent",
            ));
        };

        let candidates = agents::list_healthy_instances_with_capability(&self.pool, first)
            .await
            .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;

        let required: std::collections::HashSet<&str> =
            required_capabilities.iter().map(String::as_str).collect();

        let eligible: Vec<AgentInstance> = candidates
            .into_iter()
            .filter(|instance| !exclude.contains(&instance.id))
            .filter(|instance| {
                let owned: std::collections::HashSet<&str> =
                    instance.capabilities.iter().map(String::as_str).collect();
                required.is_subset(&owned)
            })
            .collect();

        if eligible.is_empty() {
            return Err(FabricError::not_found(
                "no healthy agent instance has the required capabilities",
            ));
        }

        let min_load = eligible.iter().map(|i| i.active_load).min().unwrap();
        let tied: Vec<&AgentInstance> = eligible.iter().filter(|i| i.active_load == min_load).collect();

        // Try each tied candidate in round-robin order until one claims
        // successfully -- a claim can fail if a health check flipped it
        // unhealthy between the read above and now.
        let start = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) % tied.len();
        for offset in 0..tied.len() {
            let candidate = tied[(start + offset) % tied.len()];
            let claimed = agents::claim_agent_instance(&self.pool, candidate.id)
                .await
                .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))?;
            if claimed > 0 {
                let mut instance = candidate.clone();
                instance.active_load += 1;
                return Ok(Assignment { instance });
            }
        }

        Err(FabricError::conflict(
            "every candidate agent instance became unhealthy before assignment completed",
        ))
    }

    /// Release a claimed instance's load reservation. Called on every
    /// terminal transition of the step/run that held the assignment,
    /// regardless of success or failure.
    pub async fn release(&self, instance_id: Uuid) -> Result<(), FabricError> {
        agents::release_agent_instance(&self.pool, instance_id)
            .await
            .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))
    }

    pub async fn set_health(&self, instance_id: Uuid, healthy: bool) -> Result<(), FabricError> {
        agents::set_agent_instance_health(&self.pool, instance_id, healthy)
            .await
            .map_err(|e| FabricError::new(ErrorKind::Internal, e.to_string()))
    }

    /// Attempt failover to another eligible instance after a non-fatal
    /// failure, excluding the instance that just failed. Callers are
    /// expected to have already checked retries remaining before calling
    /// this -- the controller only knows about capabilities and load, not
    /// retry budgets.
    pub async fn failover(
        &self,
        required_capabilities: &[String],
        failed_instance: Uuid,
    ) -> Result<Assignment, FabricError> {
        self.assign(required_capabilities, &[failed_instance]).await
    }
}

pub type SharedController = Arc<Controller>;

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: Uuid, load: i32, caps: &[&str]) -> AgentInstance {
        AgentInstance {
            id,
            definition_id: Uuid::new_v4(),
            name: id.to_string(),
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            active_load: load,
            healthy: true,
        }
    }

    #[test]
    fn capability_subset_check_matches_spec_semantics() {
        let inst = instance(Uuid::new_v4(), 0, &["python", "testing"]);
        let required: std::collections::HashSet<&str> = ["python"].into_iter().collect();
        let owned: std::collections::HashSet<&str> =
            inst.capabilities.iter().map(String::as_str).collect();
        assert!(required.is_subset(&owned));

        let required2: std::collections::HashSet<&str> = ["python", "rust"].into_iter().collect();
        assert!(!required2.is_subset(&owned));
    }
}
