use crate::config::Config;
use crate::error::ApiError;
use anyhow::Result;
use libsql::{Builder, Connection, Database as LibsqlDatabase};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const SYSTEM_MIGRATIONS: &[(&str, &str)] =
    &[("system/000_migrations_table.sql", include_str!("migrations/system/000_migrations_table.sql"))];

/// Poll interval used by `acquire_ready` while the pool is still coming up.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Delay between background initialization attempts.
const INIT_RETRY_DELAY: Duration = Duration::from_secs(3);
const INIT_MAX_ATTEMPTS: u32 = 20;

/// Process-wide advisory locks keyed by name. Guards are owned so callers
/// can hold them for the remainder of a transaction and drop them at
/// commit or rollback.
#[derive(Default)]
pub struct NamedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NamedLocks {
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// A usable database handle. `Connection` is a cheap clonable handle
/// onto one underlying connection, so each logical operation takes its
/// own clone and drops it when done; writers serialize transactions
/// through `tx_lock`.
pub struct Pool {
    _db: LibsqlDatabase,
    conn: Connection,
    tx_lock: Arc<Mutex<()>>,
    locks: Arc<NamedLocks>,
}

impl Pool {
    pub fn connect(&self) -> Result<Connection, libsql::Error> {
        Ok(self.conn.clone())
    }

    /// Held for the duration of every write transaction; `BEGIN` on the
    /// shared connection must never nest.
    pub fn tx_lock(&self) -> Arc<Mutex<()>> {
        self.tx_lock.clone()
    }

    pub fn locks(&self) -> Arc<NamedLocks> {
        self.locks.clone()
    }

    async fn is_migration_applied(conn: &Connection, name: &str) -> Result<bool> {
        let query = "SELECT 1 FROM _migrations WHERE name = ?";
        match conn.query(query, libsql::params![name]).await {
            Ok(mut rows) => Ok(rows.next().await?.is_some()),
            Err(e) => {
                if e.to_string().contains("no such table") {
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    async fn record_migration(conn: &Connection, name: &str) -> Result<()> {
        let query = r#"
            INSERT INTO _migrations (name, applied_at)
            VALUES (?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        "#;
        conn.execute(query, libsql::params![name]).await?;
        Ok(())
    }

    async fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<()> {
        if Self::is_migration_applied(conn, name).await? {
            tracing::debug!("migration {} already applied, skipping", name);
            return Ok(());
        }

        tracing::info!("applying migration: {}", name);
        conn.execute_batch(sql)
            .await
            .map_err(|e| anyhow::anyhow!("failed to execute migration {name}: {e}"))?;

        Self::record_migration(conn, name).await?;
        Ok(())
    }

    /// Opens the database, verifies it answers, and applies all pending
    /// migrations. Schema setup happens here, once, never per request.
    pub async fn open(cfg: &Config, data_dir: &Path) -> Result<Self> {
        let database = cfg.app.get_db();
        let path = if database == ":memory:" {
            database.to_string()
        } else {
            data_dir.join(database).to_string_lossy().into_owned()
        };

        let db = Builder::new_local(&path).build().await?;
        let conn = db.connect()?;
        conn.query("SELECT 1", ()).await?;

        for (filename, sql) in SYSTEM_MIGRATIONS {
            Self::run_migration(&conn, filename, sql).await?;
        }

        for (filename, sql) in crate::bim::migrations() {
            Self::run_migration(&conn, filename, sql).await?;
        }

        Ok(Pool {
            _db: db,
            conn,
            tx_lock: Arc::new(Mutex::new(())),
            locks: Arc::new(NamedLocks::default()),
        })
    }
}

enum PoolState {
    Unset,
    Connecting,
    Ready(Arc<Pool>),
}

/// Lazily-initialized shared pool handle.
///
/// The state machine is `Unset -> Connecting -> Ready`. A background task
/// owns the transition to `Ready`; readers only ever poll, so concurrent
/// `acquire_ready` callers need no mutual exclusion beyond the state read.
pub struct PoolManager {
    state: RwLock<PoolState>,
    last_error: Mutex<Option<String>>,
}

impl PoolManager {
    pub fn new() -> Self {
        PoolManager {
            state: RwLock::new(PoolState::Unset),
            last_error: Mutex::new(None),
        }
    }

    pub async fn state_name(&self) -> &'static str {
        match *self.state.read().await {
            PoolState::Unset => "unset",
            PoolState::Connecting => "connecting",
            PoolState::Ready(_) => "ready",
        }
    }

    async fn try_ready(&self) -> Option<Arc<Pool>> {
        match *self.state.read().await {
            PoolState::Ready(ref pool) => Some(pool.clone()),
            _ => None,
        }
    }

    pub async fn set_ready(&self, pool: Pool) {
        *self.state.write().await = PoolState::Ready(Arc::new(pool));
    }

    async fn record_error(&self, err: &anyhow::Error) {
        *self.last_error.lock().await = Some(err.to_string());
    }

    /// Polls until a usable pool exists or `timeout` elapses. A pool that
    /// is merely not ready yet is not an error until the deadline passes,
    /// at which point the last observed initialization error is reported.
    pub async fn acquire_ready(&self, timeout: Duration) -> Result<Arc<Pool>, ApiError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(pool) = self.try_ready().await {
                return Ok(pool);
            }
            if Instant::now() >= deadline {
                let last = self.last_error.lock().await.clone();
                return Err(ApiError::NotReady(
                    last.unwrap_or_else(|| "initializing".to_string()),
                ));
            }
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }

    /// Spawns the background initialization task. Retries with a fixed
    /// delay until the pool opens, the attempt budget runs out, or
    /// shutdown is requested.
    pub fn spawn_init(
        self: Arc<Self>,
        cfg: Config,
        data_dir: std::path::PathBuf,
        shutdown: CancellationToken,
    ) {
        let manager = self;
        tokio::spawn(async move {
            {
                *manager.state.write().await = PoolState::Connecting;
            }
            for attempt in 1..=INIT_MAX_ATTEMPTS {
                match Pool::open(&cfg, &data_dir).await {
                    Ok(pool) => {
                        manager.set_ready(pool).await;
                        tracing::info!("database pool initialized");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(
                            attempt,
                            max_attempts = INIT_MAX_ATTEMPTS,
                            error = %e,
                            "database connect attempt failed"
                        );
                        manager.record_error(&e).await;
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(INIT_RETRY_DELAY) => {}
                    _ = shutdown.cancelled() => {
                        tracing::info!("pool init task shutting down");
                        return;
                    }
                }
            }
            tracing::error!("database init gave up after {} attempts", INIT_MAX_ATTEMPTS);
        });
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::Config;

    pub async fn memory_pool() -> Pool {
        let cfg: Config =
            serde_yaml::from_str("app:\n  database: \":memory:\"\n  port: 0\n").unwrap();
        Pool::open(&cfg, Path::new(".")).await.unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_times_out_while_unset() {
        let manager = PoolManager::new();
        match manager.acquire_ready(Duration::from_millis(150)).await {
            Err(ApiError::NotReady(msg)) => assert_eq!(msg, "initializing"),
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("pool should not be ready"),
        }
    }

    #[tokio::test]
    async fn acquire_returns_pool_once_ready() {
        let manager = PoolManager::new();
        let pool = test_support::memory_pool().await;
        manager.set_ready(pool).await;

        let pool = manager
            .acquire_ready(Duration::from_millis(100))
            .await
            .unwrap();
        let conn = pool.connect().unwrap();
        let mut rows = conn.query("SELECT 1", ()).await.unwrap();
        assert!(rows.next().await.unwrap().is_some());
        assert_eq!(manager.state_name().await, "ready");
    }

    #[tokio::test]
    async fn migrations_apply_once() {
        let pool = test_support::memory_pool().await;
        let conn = pool.connect().unwrap();

        // Running the same migration set again must be a no-op.
        for (name, sql) in crate::bim::migrations() {
            Pool::run_migration(&conn, name, sql).await.unwrap();
        }

        let mut rows = conn
            .query("SELECT COUNT(*) FROM _migrations", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let count: i64 = row.get(0).unwrap();
        assert_eq!(count as usize, 1 + crate::bim::migrations().len());
    }

    #[tokio::test]
    async fn named_locks_serialize_holders() {
        let locks = NamedLocks::default();
        let guard = locks.acquire("bim.blocks.id").await;
        assert!(
            tokio::time::timeout(Duration::from_millis(50), locks.acquire("bim.blocks.id"))
                .await
                .is_err(),
            "second holder should block while the guard lives"
        );
        drop(guard);
        let _reacquired = locks.acquire("bim.blocks.id").await;
    }
}
