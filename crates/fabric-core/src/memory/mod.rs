//! Agent Memory Store: versioned per-context data plus per-instance keyed
//! memory with TTL/LRU/max-bytes pruning.
//!
//! Context versions are immutable and monotonic -- rollback means reading an
//! older version, never mutating one in place -- the same compare-and-swap
//! discipline as [`crate::state::RunPhaseStateMachine::transition`], applied
//! to a version counter instead of a status column.
//! [`fabric_db::queries::memory::append_context_version`] already does the
//! "insert next version, then bump the parent's counter" transaction; this
//! module adds the pruning and handoff semantics around the raw queries.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use fabric_db::models::{AgentContext, AgentContextVersion, AgentMemoryEntry};
use fabric_db::queries::memory;

use crate::error::FabricError;

/// Pruning limits enforced on every write to an agent instance's memory.
/// Checked in this order: expire by TTL, then evict by LRU until the
/// max-bytes ceiling is satisfied -- mirrors the teacher's bounded-size
/// philosophy (`truncate_snippet`, `worktree::cleanup_stale`) generalized
/// from "bound one string" to "bound a keyed store".
#[derive(Debug, Clone, Copy)]
pub struct MemoryLimits {
    pub ttl_seconds: i64,
    pub max_bytes: i64,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            ttl_seconds: 24 * 3600,
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Facade over the versioned context store and the per-instance memory
/// table, handed out through [`crate::context::FabricContext`].
#[derive(Debug, Clone)]
pub struct MemoryStore {
    pool: PgPool,
    limits: MemoryLimits,
}

impl MemoryStore {
    pub fn new(pool: PgPool, limits: MemoryLimits) -> Self {
        Self { pool, limits }
    }

    /// Create a new named context for an agent working within a
    /// workspace/project pair. Starts at version 0.
    pub async fn create_context(
        &self,
        workspace_id: Uuid,
        project_id: Uuid,
        name: &str,
    ) -> Result<AgentContext, FabricError> {
        memory::insert_agent_context(&self.pool, workspace_id, project_id, name)
            .await
            .map_err(|e| FabricError::new(fabric_db::models::ErrorKind::Internal, e.to_string()))
    }

    pub async fn get_context(&self, id: Uuid) -> Result<AgentContext, FabricError> {
        memory::get_agent_context(&self.pool, id)
            .await
            .map_err(|e| FabricError::new(fabric_db::models::ErrorKind::Internal, e.to_string()))?
            .ok_or_else(|| FabricError::not_found(format!("agent context {id} not found")))
    }

    /// Append a new, immutable version onto a context. Never mutates an
    /// existing version -- "rollback" is just reading an older one back via
    /// [`Self::read_version`].
    pub async fn commit_version(
        &self,
        context_id: Uuid,
        data: &serde_json::Value,
    ) -> Result<AgentContextVersion, FabricError> {
        memory::append_context_version(&self.pool, context_id, data)
            .await
            .map_err(|e| FabricError::new(fabric_db::models::ErrorKind::Internal, e.to_string()))
    }

    /// Read a specific version, or the current one if `version` is `None`.
    pub async fn read_version(
        &self,
        context_id: Uuid,
        version: Option<i32>,
    ) -> Result<AgentContextVersion, FabricError> {
        memory::get_context_version(&self.pool, context_id, version)
            .await
            .map_err(|e| FabricError::new(fabric_db::models::ErrorKind::Internal, e.to_string()))?
            .ok_or_else(|| FabricError::not_found(format!("no version for context {context_id}")))
    }

    /// Write (or overwrite) a keyed memory entry for an agent instance,
    /// then enforce TTL and LRU/max-bytes pruning. Pruning runs after every
    /// write, per spec, rather than on a timer -- a store that is never
    /// written to never needs pruning.
    pub async fn remember(
        &self,
        agent_instance_id: Uuid,
        key: &str,
        value: &serde_json::Value,
        received_from: Option<Uuid>,
    ) -> Result<AgentMemoryEntry, FabricError> {
        let size_bytes = serde_json::to_vec(value)
            .map(|bytes| bytes.len() as i64)
            .unwrap_or(0);

        let entry = memory::upsert_memory_entry(
            &self.pool,
            agent_instance_id,
            key,
            value,
            size_bytes,
            received_from,
        )
        .await
        .map_err(|e| FabricError::new(fabric_db::models::ErrorKind::Internal, e.to_string()))?;

        self.prune(agent_instance_id).await?;
        Ok(entry)
    }

    /// Read a memory entry, bumping its last-accessed timestamp (LRU touch)
    /// as a side effect -- the query itself does the bump so the read and
    /// the touch are one round trip.
    pub async fn recall(
        &self,
        agent_instance_id: Uuid,
        key: &str,
    ) -> Result<Option<AgentMemoryEntry>, FabricError> {
        memory::get_memory_entry(&self.pool, agent_instance_id, key)
            .await
            .map_err(|e| FabricError::new(fabric_db::models::ErrorKind::Internal, e.to_string()))
    }

    /// TTL expiry followed by LRU eviction until the instance is back under
    /// `max_bytes`. Order matters: expiry is free information (it doesn't
    /// need a byte count), so it runs first and may make LRU eviction
    /// unnecessary.
    async fn prune(&self, agent_instance_id: Uuid) -> Result<u64, FabricError> {
        let expired = memory::evict_expired_memory_entries(
            &self.pool,
            agent_instance_id,
            self.limits.ttl_seconds,
        )
        .await
        .map_err(|e| FabricError::new(fabric_db::models::ErrorKind::Internal, e.to_string()))?;

        let mut total = memory::total_memory_bytes(&self.pool, agent_instance_id)
            .await
            .map_err(|e| FabricError::new(fabric_db::models::ErrorKind::Internal, e.to_string()))?;

        if total <= self.limits.max_bytes {
            return Ok(expired);
        }

        let by_lru = memory::list_memory_entries_by_lru(&self.pool, agent_instance_id)
            .await
            .map_err(|e| FabricError::new(fabric_db::models::ErrorKind::Internal, e.to_string()))?;

        for entry in by_lru {
            if total <= self.limits.max_bytes {
                break;
            }
            memory::delete_memory_entry(&self.pool, entry.id)
                .await
                .map_err(|e| FabricError::new(fabric_db::models::ErrorKind::Internal, e.to_string()))?;
            total -= entry.size_bytes;
        }

        Ok(expired)
    }

    /// Copy (not move) every key from `source` into `destination`, stamping
    /// each copied entry's `received_from` with the source instance. Used
    /// when an agent instance hands work off to another (failover, or an
    /// explicit multi-agent handoff step) -- the source keeps its memory
    /// intact in case it's reassigned later.
    pub async fn handoff(&self, source: Uuid, destination: Uuid) -> Result<usize, FabricError> {
        let entries = memory::list_memory_entries_by_lru(&self.pool, source)
            .await
            .map_err(|e| FabricError::new(fabric_db::models::ErrorKind::Internal, e.to_string()))?;

        let mut copied = 0;
        for entry in entries {
            memory::upsert_memory_entry(
                &self.pool,
                destination,
                &entry.key,
                &entry.value,
                entry.size_bytes,
                Some(source),
            )
            .await
            .map_err(|e| FabricError::new(fabric_db::models::ErrorKind::Internal, e.to_string()))?;
            copied += 1;
        }

        self.prune(destination).await?;
        Ok(copied)
    }
}

/// Shared handle alias, matching the `Arc`-wrapped-service convention used
/// for every other process-wide port in [`crate::context::FabricContext`].
pub type SharedMemoryStore = Arc<MemoryStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_are_sane() {
        let limits = MemoryLimits::default();
        assert!(limits.ttl_seconds > 0);
        assert!(limits.max_bytes > 0);
    }
}
