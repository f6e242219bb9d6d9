//! Database query functions for `agent_definitions` and `agent_instances`
//! (Multi-Agent Controller assignment).

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{AgentDefinition, AgentInstance};

/// Register a new agent role/capability template.
pub async fn insert_agent_definition(
    pool: &PgPool,
    role: &str,
    name: &str,
    capabilities: &[String],
) -> Result<AgentDefinition> {
    let def = sqlx::query_as::<_, AgentDefinition>(
        "INSERT INTO agent_definitions (role, name, capabilities) VALUES ($1, $2, $3) RETURNING *",
    )
    .bind(role)
    .bind(name)
    .bind(capabilities)
    .fetch_one(pool)
    .await
    .context("failed to insert agent definition")?;

    Ok(def)
}

/// List all registered agent definitions.
pub async fn list_agent_definitions(pool: &PgPool) -> Result<Vec<AgentDefinition>> {
    let defs = sqlx::query_as::<_, AgentDefinition>("SELECT * FROM agent_definitions ORDER BY role")
        .fetch_all(pool)
        .await
        .context("failed to list agent definitions")?;

    Ok(defs)
}

/// Register a live instance of an agent definition, starting healthy and
/// unloaded.
pub async fn insert_agent_instance(
    pool: &PgPool,
    definition_id: Uuid,
    name: &str,
    capabilities: &[String],
) -> Result<AgentInstance> {
    let instance = sqlx::query_as::<_, AgentInstance>(
        "INSERT INTO agent_instances (definition_id, name, capabilities) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(definition_id)
    .bind(name)
    .bind(capabilities)
    .fetch_one(pool)
    .await
    .context("failed to insert agent instance")?;

    Ok(instance)
}

/// List every healthy instance that advertises the given capability, ordered
/// by current load ascending (least-loaded first -- the controller's second
/// assignment tiebreaker after capability match).
pub async fn list_healthy_instances_with_capability(
    pool: &PgPool,
    capability: &str,
) -> Result<Vec<AgentInstance>> {
    let instances = sqlx::query_as::<_, AgentInstance>(
        "SELECT * FROM agent_instances \
         WHERE healthy = true AND $1 = ANY(capabilities) \
         ORDER BY active_load ASC, name ASC",
    )
    .bind(capability)
    .fetch_all(pool)
    .await
    .context("failed to list healthy agent instances by capability")?;

    Ok(instances)
}

/// Atomically claim an instance for a new assignment by incrementing its
/// load counter, but only if it is still healthy (guards against a health
/// check flipping it down between the read and the claim).
pub async fn claim_agent_instance(pool: &PgPool, instance_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agent_instances SET active_load = active_load + 1 \
         WHERE id = $1 AND healthy = true",
    )
    .bind(instance_id)
    .execute(pool)
    .await
    .context("failed to claim agent instance")?;

    Ok(result.rows_affected())
}

/// Release a claimed instance, decrementing its load counter.
pub async fn release_agent_instance(pool: &PgPool, instance_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE agent_instances SET active_load = GREATEST(active_load - 1, 0) WHERE id = $1",
    )
    .bind(instance_id)
    .execute(pool)
    .await
    .context("failed to release agent instance")?;

    Ok(())
}

/// Flip an instance's health flag (set by the periodic health check).
pub async fn set_agent_instance_health(pool: &PgPool, instance_id: Uuid, healthy: bool) -> Result<()> {
    sqlx::query("UPDATE agent_instances SET healthy = $1 WHERE id = $2")
        .bind(healthy)
        .bind(instance_id)
        .execute(pool)
        .await
        .context("failed to set agent instance health")?;

    Ok(())
}
