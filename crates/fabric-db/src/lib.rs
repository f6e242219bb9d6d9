//! Persistence layer for the execution fabric: connection pooling, runtime
//! migrations, row models, and hand-written queries against Postgres.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
