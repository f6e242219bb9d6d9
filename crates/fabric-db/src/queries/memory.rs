//! Database query functions for `agent_contexts`, `agent_context_versions`,
//! and `agent_memory_entries` (the Multi-Agent Controller's memory store).

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{AgentContext, AgentContextVersion, AgentMemoryEntry};

/// Create a new named context for a project, starting at version 0 with no
/// versions recorded yet.
pub async fn insert_agent_context(
    pool: &PgPool,
    workspace_id: Uuid,
    project_id: Uuid,
    name: &str,
) -> Result<AgentContext> {
    let context = sqlx::query_as::<_, AgentContext>(
        "INSERT INTO agent_contexts (workspace_id, project_id, name, current_version) \
         VALUES ($1, $2, $3, 0) \
         RETURNING *",
    )
    .bind(workspace_id)
    .bind(project_id)
    .bind(name)
    .fetch_one(pool)
    .await
    .context("failed to insert agent context")?;

    Ok(context)
}

/// Fetch a context by ID.
pub async fn get_agent_context(pool: &PgPool, id: Uuid) -> Result<Option<AgentContext>> {
    let context = sqlx::query_as::<_, AgentContext>("SELECT * FROM agent_contexts WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch agent context")?;

    Ok(context)
}

/// Append a new immutable version to a context and bump its pointer, inside
/// a transaction so the version row and the pointer never drift apart.
pub async fn append_context_version(
    pool: &PgPool,
    context_id: Uuid,
    data: &serde_json::Value,
) -> Result<AgentContextVersion> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let version = sqlx::query_as::<_, AgentContextVersion>(
        "INSERT INTO agent_context_versions (context_id, version, data) \
         VALUES ($1, (SELECT current_version + 1 FROM agent_contexts WHERE id = $1), $2) \
         RETURNING *",
    )
    .bind(context_id)
    .bind(data)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert agent context version")?;

    sqlx::query("UPDATE agent_contexts SET current_version = $1 WHERE id = $2")
        .bind(version.version)
        .bind(context_id)
        .execute(&mut *tx)
        .await
        .context("failed to bump agent context version pointer")?;

    tx.commit().await.context("failed to commit transaction")?;

    Ok(version)
}

/// Fetch a specific version of a context, or the current one if `version`
/// is `None`.
pub async fn get_context_version(
    pool: &PgPool,
    context_id: Uuid,
    version: Option<i32>,
) -> Result<Option<AgentContextVersion>> {
    let row = match version {
        Some(v) => {
            sqlx::query_as::<_, AgentContextVersion>(
                "SELECT * FROM agent_context_versions WHERE context_id = $1 AND version = $2",
            )
            .bind(context_id)
            .bind(v)
            .fetch_optional(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, AgentContextVersion>(
                "SELECT acv.* FROM agent_context_versions acv \
                 JOIN agent_contexts ac ON ac.id = acv.context_id AND ac.current_version = acv.version \
                 WHERE acv.context_id = $1",
            )
            .bind(context_id)
            .fetch_optional(pool)
            .await
        }
    }
    .context("failed to fetch agent context version")?;

    Ok(row)
}

/// Upsert a memory entry for an agent instance. On conflict, replaces the
/// value, size, and `last_accessed_at` -- the common "remember this fact"
/// path used mid-run.
pub async fn upsert_memory_entry(
    pool: &PgPool,
    agent_instance_id: Uuid,
    key: &str,
    value: &serde_json::Value,
    size_bytes: i64,
    received_from: Option<Uuid>,
) -> Result<AgentMemoryEntry> {
    let entry = sqlx::query_as::<_, AgentMemoryEntry>(
        "INSERT INTO agent_memory_entries \
         (agent_instance_id, key, value, size_bytes, last_accessed_at, received_from) \
         VALUES ($1, $2, $3, $4, NOW(), $5) \
         ON CONFLICT (agent_instance_id, key) DO UPDATE \
         SET value = EXCLUDED.value, size_bytes = EXCLUDED.size_bytes, \
             last_accessed_at = NOW(), received_from = EXCLUDED.received_from \
         RETURNING *",
    )
    .bind(agent_instance_id)
    .bind(key)
    .bind(value)
    .bind(size_bytes)
    .bind(received_from)
    .fetch_one(pool)
    .await
    .context("failed to upsert agent memory entry")?;

    Ok(entry)
}

/// Read a memory entry, bumping its `last_accessed_at` for LRU accounting.
pub async fn get_memory_entry(
    pool: &PgPool,
    agent_instance_id: Uuid,
    key: &str,
) -> Result<Option<AgentMemoryEntry>> {
    let entry = sqlx::query_as::<_, AgentMemoryEntry>(
        "UPDATE agent_memory_entries SET last_accessed_at = NOW() \
         WHERE agent_instance_id = $1 AND key = $2 \
         RETURNING *",
    )
    .bind(agent_instance_id)
    .bind(key)
    .fetch_optional(pool)
    .await
    .context("failed to fetch agent memory entry")?;

    Ok(entry)
}

/// List every memory entry for an instance, least-recently-accessed first --
/// the eviction order the memory pruner walks.
pub async fn list_memory_entries_by_lru(
    pool: &PgPool,
    agent_instance_id: Uuid,
) -> Result<Vec<AgentMemoryEntry>> {
    let entries = sqlx::query_as::<_, AgentMemoryEntry>(
        "SELECT * FROM agent_memory_entries \
         WHERE agent_instance_id = $1 \
         ORDER BY last_accessed_at ASC",
    )
    .bind(agent_instance_id)
    .fetch_all(pool)
    .await
    .context("failed to list agent memory entries")?;

    Ok(entries)
}

/// Total bytes of memory currently held by an instance.
pub async fn total_memory_bytes(pool: &PgPool, agent_instance_id: Uuid) -> Result<i64> {
    let row: (Option<i64>,) = sqlx::query_as(
        "SELECT SUM(size_bytes) FROM agent_memory_entries WHERE agent_instance_id = $1",
    )
    .bind(agent_instance_id)
    .fetch_one(pool)
    .await
    .context("failed to sum agent memory bytes")?;

    Ok(row.0.unwrap_or(0))
}

/// Delete entries older than `ttl_seconds` measured from `last_accessed_at`,
/// or explicitly by ID for the size-based pruner. Returns the number of rows
/// removed.
pub async fn evict_expired_memory_entries(
    pool: &PgPool,
    agent_instance_id: Uuid,
    ttl_seconds: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM agent_memory_entries \
         WHERE agent_instance_id = $1 \
           AND last_accessed_at < NOW() - ($2 || ' seconds')::interval",
    )
    .bind(agent_instance_id)
    .bind(ttl_seconds)
    .execute(pool)
    .await
    .context("failed to evict expired agent memory entries")?;

    Ok(result.rows_affected())
}

/// Delete a specific memory entry by ID (used by the size/LRU pruner once it
/// has decided which entries to drop).
pub async fn delete_memory_entry(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM agent_memory_entries WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete agent memory entry")?;

    Ok(())
}
