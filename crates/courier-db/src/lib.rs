//! # courier-db
//!
//! PostgreSQL storage layer for courier.
//!
//! This crate provides:
//! - Connection pool management
//! - `UnitOfWork`, a transaction with post-commit hooks
//! - The outbox event store and emission API
//! - Webhook endpoint registry
//! - Upload batch, file, session and part tracking
//!
//! ## Example
//!
//! ```rust,ignore
//! use courier_db::{Database, NewOutboxEvent};
//!
//! let db = Database::connect("postgres://localhost/courier").await?;
//! let outbox = db.outbox.clone();
//!
//! db.atomic(move |uow| Box::pin(async move {
//!     // ... business writes on uow.conn() ...
//!     outbox
//!         .emit(uow, NewOutboxEvent::new("UploadFile", "42", "file.stored"))
//!         .await
//! }))
//! .await?;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub mod endpoints;
pub mod outbox;
pub mod pool;
pub mod test_fixtures;
pub mod unit_of_work;
pub mod uploads;

pub use endpoints::PgWebhookEndpointRepository;
pub use outbox::PgOutboxRepository;
pub use pool::{connect_pool, log_pool_health, PoolConfig};
pub use unit_of_work::UnitOfWork;
pub use uploads::{events, PgUploadRepository};

// Re-export core types for convenience
pub use courier_core::*;

/// Database handle with all repositories.
#[derive(Clone)]
pub struct Database {
    pool: sqlx::Pool<sqlx::Postgres>,
    /// Outbox event store and emission API.
    pub outbox: PgOutboxRepository,
    /// Webhook endpoint registry.
    pub endpoints: PgWebhookEndpointRepository,
    /// Upload batches, files and chunked sessions.
    pub uploads: PgUploadRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    ///
    /// The outbox targets the generic table and schedules nothing on commit
    /// until [`Database::with_trigger`] is called.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        let outbox = PgOutboxRepository::new(pool.clone());
        Self::assemble(pool, outbox)
    }

    fn assemble(pool: sqlx::Pool<sqlx::Postgres>, outbox: PgOutboxRepository) -> Self {
        Self {
            endpoints: PgWebhookEndpointRepository::new(pool.clone()),
            uploads: PgUploadRepository::new(pool.clone(), outbox.clone()),
            outbox,
            pool,
        }
    }

    /// Fire `trigger` after every committed emission.
    pub fn with_trigger(self, trigger: Arc<dyn SweepTrigger>) -> Self {
        let outbox = self.outbox.with_trigger(trigger);
        Self::assemble(self.pool, outbox)
    }

    /// Point the outbox at another physical table.
    pub fn with_outbox_table(self, table: OutboxTable) -> Self {
        let outbox = self.outbox.with_table(table);
        Self::assemble(self.pool, outbox)
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = connect_pool(url, &PoolConfig::default()).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = connect_pool(url, &config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }

    /// Begin a unit of work.
    pub async fn begin(&self) -> Result<UnitOfWork<'static>> {
        UnitOfWork::begin(&self.pool).await
    }

    /// Run `f` inside a unit of work.
    ///
    /// Commits when `f` succeeds, then runs post-commit hooks. When `f` fails
    /// the transaction rolls back and no hook runs.
    pub async fn atomic<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(
            &'a mut UnitOfWork<'static>,
        ) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>,
    {
        let mut uow = self.begin().await?;
        let result = f(&mut uow).await?;
        uow.commit().await?;
        Ok(result)
    }
}
