//! Unit of work: a database transaction with post-commit hooks.
//!
//! Business logic performs its state change and emits outbox events on the
//! same `UnitOfWork`. Side effects that must only happen once the data is
//! durable (scheduling a delivery sweep) are registered with
//! [`UnitOfWork::on_commit`] and run after [`UnitOfWork::commit`] succeeds.
//! Dropping the unit of work rolls the transaction back and discards hooks.

use std::fmt;

use sqlx::{Acquire, PgConnection, PgPool, Postgres, Transaction};
use tracing::debug;

use courier_core::{Error, Result};

type CommitHook = Box<dyn FnOnce() + Send + 'static>;

/// A transaction plus the callbacks to run once it commits.
pub struct UnitOfWork<'c> {
    tx: Transaction<'c, Postgres>,
    hooks: Vec<CommitHook>,
}

impl UnitOfWork<'static> {
    /// Begin a new unit of work on a pooled connection.
    pub async fn begin(pool: &PgPool) -> Result<Self> {
        let tx = pool.begin().await.map_err(Error::Database)?;
        Ok(Self::from_transaction(tx))
    }
}

impl<'c> UnitOfWork<'c> {
    /// Wrap a transaction the caller already opened.
    pub fn from_transaction(tx: Transaction<'c, Postgres>) -> Self {
        Self {
            tx,
            hooks: Vec::new(),
        }
    }

    /// Connection to run queries on inside this unit of work.
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    /// Open a savepoint. Dropping it without commit rolls back only the work
    /// done through it and leaves the unit of work usable.
    pub async fn savepoint(&mut self) -> Result<Transaction<'_, Postgres>> {
        Acquire::begin(&mut self.tx).await.map_err(Error::Database)
    }

    /// Register a callback to run after a successful commit.
    pub fn on_commit<F>(&mut self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    /// Number of callbacks waiting for commit.
    pub fn pending_hooks(&self) -> usize {
        self.hooks.len()
    }

    /// Commit, then run the registered callbacks in registration order.
    pub async fn commit(self) -> Result<()> {
        let Self { tx, hooks } = self;
        tx.commit().await.map_err(Error::Database)?;

        if !hooks.is_empty() {
            debug!(
                subsystem = "database",
                component = "unit_of_work",
                op = "commit",
                hooks = hooks.len(),
                "Running post-commit hooks"
            );
        }
        for hook in hooks {
            hook();
        }
        Ok(())
    }

    /// Roll back explicitly. Registered callbacks are discarded.
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(Error::Database)
    }
}

impl fmt::Debug for UnitOfWork<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("pending_hooks", &self.hooks.len())
            .finish()
    }
}
