//! Embedded key-value file shared by the url cache, the billing limiter and
//! the time-series store.
//!
//! redb transactions are blocking, so every transaction runs on tokio's
//! blocking pool.

use anyhow::Result;
use redb::{Database, ReadTransaction, ReadableDatabase, TableDefinition, WriteTransaction};
use std::path::Path;
use std::sync::Arc;

/// short code -> long url
pub const URLS: TableDefinition<&str, &str> = TableDefinition::new("urls");

/// short code -> unix second after which the `urls` entry is stale
pub const URLS_TTL: TableDefinition<&str, i64> = TableDefinition::new("urls_ttl");

/// account id -> JSON array of billing options
pub const BILLING: TableDefinition<i64, &str> = TableDefinition::new("billing");

/// short code -> JSON link detail (owning account)
pub const DETAILS: TableDefinition<&str, &str> = TableDefinition::new("details");

/// (bucket name, RFC3339 day) -> counter
pub const BUCKETS: TableDefinition<(&str, &str), u64> = TableDefinition::new("buckets");

#[derive(Clone)]
pub struct Kv {
    db: Arc<Database>,
}

impl Kv {
    /// Create or open the database file and make sure every table exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref())?;

        let txn = db.begin_write()?;
        {
            txn.open_table(URLS)?;
            txn.open_table(URLS_TTL)?;
            txn.open_table(BILLING)?;
            txn.open_table(DETAILS)?;
            txn.open_table(BUCKETS)?;
        }
        txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Run `f` inside a write transaction and commit when it returns Ok.
    /// redb serializes write transactions, which makes each call atomic
    /// with respect to every other `write`.
    pub async fn write<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&WriteTransaction) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write()?;
            let out = f(&txn)?;
            txn.commit()?;
            Ok(out)
        })
        .await?
    }

    /// Run `f` against a consistent read snapshot
    pub async fn read<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ReadTransaction) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read()?;
            f(&txn)
        })
        .await?
    }
}
