//! Dependency-injection handle threaded through the fabric.
//!
//! Per the resolved "singletons vs DI" open question, every process-wide
//! service (connection pool, token config, agent registry, event
//! broadcaster, cost tracker) is constructed once at startup and passed down
//! explicitly through a `FabricContext` clone. Nothing in this crate reaches
//! for a `lazy_static`/process-wide `OnceCell` to get at shared state; the
//! only exception is `fabric-test-utils`' `OnceCell<SharedPg>`, which holds
//! test infrastructure, not application state.

use std::sync::Arc;

use sqlx::PgPool;

use crate::token::TokenConfig;

/// Shared, cheaply-cloneable handle to the fabric's process-wide services.
///
/// `FabricContext` is `Clone` because every field is either `Copy`,
/// `Arc`-wrapped, or itself cheap to clone (`PgPool` is a connection pool
/// handle, not the pool itself). Construct one in `main` and pass it to every
/// task, HTTP handler, and background loop that needs database or token
/// access; do not store it in a global.
#[derive(Clone)]
pub struct FabricContext {
    pool: PgPool,
    token_config: Arc<TokenConfig>,
}

impl FabricContext {
    pub fn new(pool: PgPool, token_config: TokenConfig) -> Self {
        Self {
            pool,
            token_config: Arc::new(token_config),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn token_config(&self) -> &TokenConfig {
        &self.token_config
    }
}

impl std::fmt::Debug for FabricContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FabricContext").finish_non_exhaustive()
    }
}
