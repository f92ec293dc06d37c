use std::{path::PathBuf, time::Duration};

use deadpool_sqlite::Runtime;
use rusqlite::{ErrorCode, OptionalExtension, Row, TransactionBehavior};
use snafu::{ensure, Location, ResultExt, Snafu};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::Info;
use crate::config::DurableWorkerConfig;

const LEASE_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS snowflake_worker (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    worker_id       INTEGER NOT NULL,
    business        TEXT    NOT NULL,
    flag            TEXT    NOT NULL,
    status          INTEGER NOT NULL,
    over_last_time  INTEGER NOT NULL DEFAULT 0,
    back_last_time  INTEGER NOT NULL DEFAULT 0,
    UNIQUE (worker_id, business)
);";

const STATUS_UNUSED: i64 = 1;
const STATUS_USED: i64 = 2;

const STORE_DEADLINE: Duration = Duration::from_secs(20);
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const ALLOCATE_ATTEMPTS: usize = 3;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("build sqlite pool error"))]
    PoolBuild {
        #[snafu(source)]
        error: deadpool_sqlite::BuildError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("get sqlite conn error"))]
    Pool {
        #[snafu(source)]
        error: deadpool_sqlite::PoolError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("sqlite interact error"))]
    Interact {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("sqlite database error"))]
    Database {
        #[snafu(source)]
        error: rusqlite::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("create sqlite data dir {} error", path.display()))]
    MakeDataDir {
        path: PathBuf,
        #[snafu(source)]
        error: std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("lease store deadline exceeded"))]
    DeadlineExceeded {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no worker id is available"))]
    NoWorkerIdAvailable {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("worker id {worker_id} already exists"))]
    WorkerIdExists {
        worker_id: i64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("worker id lease is not held"))]
    LeaseNotHeld {
        #[snafu(implicit)]
        location: Location,
    },
}

struct LeaseRow {
    id: i64,
    worker_id: i64,
    over_last_time: i64,
    back_last_time: i64,
}

impl TryFrom<&Row<'_>> for LeaseRow {
    type Error = rusqlite::Error;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.get("id")?,
            worker_id: row.get("worker_id")?,
            over_last_time: row.get("over_last_time")?,
            back_last_time: row.get("back_last_time")?,
        })
    }
}

impl From<&LeaseRow> for Info {
    fn from(row: &LeaseRow) -> Self {
        Self {
            worker_id: row.worker_id,
            over_last_time: row.over_last_time,
            back_last_time: row.back_last_time,
        }
    }
}

/// Worker leasing its id from a shared `snowflake_worker` table.
///
/// Cross-process contention is mediated by immediate transactions on the
/// shared database; in-process access is serialised by the mutex around
/// the cached lease.
#[derive(Debug)]
pub struct DurableWorker {
    business: String,
    worker_id_bit_length: u8,
    max_worker_id: i64,
    /// Lease-holder nonce tying row updates to this process lifetime.
    flag: String,
    pool: deadpool_sqlite::Pool,
    info: Mutex<Option<Info>>,
}

impl DurableWorker {
    pub fn new(config: &DurableWorkerConfig) -> Result<Self, Error> {
        std::fs::create_dir_all(&config.data_dir).context(MakeDataDirSnafu {
            path: &config.data_dir,
        })?;
        let pool = deadpool_sqlite::Config::new(config.data_dir.join("snowflake_worker.sqlite"))
            .builder(Runtime::Tokio1)
            .expect("infallible")
            .build()
            .context(PoolBuildSnafu)?;
        Ok(Self::with_pool(config, pool))
    }

    /// Build a worker over an existing pool, e.g. one shared with the
    /// embedding application.
    pub fn with_pool(config: &DurableWorkerConfig, pool: deadpool_sqlite::Pool) -> Self {
        Self {
            business: config.business.clone(),
            worker_id_bit_length: config.worker_id_bit_length,
            max_worker_id: (1i64 << config.worker_id_bit_length) - 1,
            flag: Uuid::new_v4().to_string(),
            pool,
            info: Mutex::new(None),
        }
    }

    async fn query<F, R>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R, Error> + Send + 'static,
        R: Send + 'static,
    {
        let run = async {
            self.pool
                .get()
                .await
                .context(PoolSnafu)?
                .interact(f)
                .await
                .map_err(|_| InteractSnafu.build())?
        };
        tokio::time::timeout(STORE_DEADLINE, run)
            .await
            .map_err(|_| DeadlineExceededSnafu.build())?
    }

    /// Reserve the lowest released lease for this business, if any.
    async fn reserve_released(&self) -> Result<Option<Info>, Error> {
        let business = self.business.clone();
        let flag = self.flag.clone();
        self.query(move |conn| {
            conn.busy_timeout(BUSY_TIMEOUT).context(DatabaseSnafu)?;
            conn.execute_batch(LEASE_TABLE_DDL).context(DatabaseSnafu)?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context(DatabaseSnafu)?;
            let row = tx
                .query_row(
                    "SELECT id, worker_id, over_last_time, back_last_time
                     FROM snowflake_worker
                     WHERE business = ?1 AND status = ?2
                     ORDER BY worker_id
                     LIMIT 1;",
                    (&business, STATUS_UNUSED),
                    |row| LeaseRow::try_from(row),
                )
                .optional()
                .context(DatabaseSnafu)?;
            let Some(row) = row else {
                return Ok(None);
            };
            tx.execute(
                "UPDATE snowflake_worker SET status = ?1, flag = ?2 WHERE id = ?3;",
                (STATUS_USED, &flag, row.id),
            )
            .context(DatabaseSnafu)?;
            tx.commit().context(DatabaseSnafu)?;
            Ok(Some(Info::from(&row)))
        })
        .await
    }

    async fn allocate(&self) -> Result<Info, Error> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_allocate().await {
                Err(Error::WorkerIdExists { .. }) if attempts < ALLOCATE_ATTEMPTS => {}
                result => return result,
            }
        }
    }

    /// Insert a lease row one past the largest allocated worker id.
    async fn try_allocate(&self) -> Result<Info, Error> {
        let business = self.business.clone();
        let flag = self.flag.clone();
        let max_worker_id = self.max_worker_id;
        self.query(move |conn| {
            conn.busy_timeout(BUSY_TIMEOUT).context(DatabaseSnafu)?;
            conn.execute_batch(LEASE_TABLE_DDL).context(DatabaseSnafu)?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context(DatabaseSnafu)?;
            let largest: Option<i64> = tx
                .query_row(
                    "SELECT worker_id FROM snowflake_worker
                     WHERE business = ?1
                     ORDER BY worker_id DESC
                     LIMIT 1;",
                    (&business,),
                    |row| row.get(0),
                )
                .optional()
                .context(DatabaseSnafu)?;
            let worker_id = largest.map_or(1, |id| id + 1);
            ensure!(worker_id <= max_worker_id, NoWorkerIdAvailableSnafu);
            let inserted = tx.execute(
                "INSERT INTO snowflake_worker
                     (worker_id, business, flag, status, over_last_time, back_last_time)
                 VALUES (?1, ?2, ?3, ?4, 0, 0);",
                (worker_id, &business, &flag, STATUS_USED),
            );
            match inserted {
                Ok(_) => {}
                Err(err) if is_unique_violation(&err) => {
                    return WorkerIdExistsSnafu { worker_id }.fail();
                }
                Err(err) => return Err(err).context(DatabaseSnafu),
            }
            tx.commit().context(DatabaseSnafu)?;
            Ok(Info {
                worker_id,
                over_last_time: 0,
                back_last_time: 0,
            })
        })
        .await
    }

    async fn update_frontier(
        &self,
        sql: &'static str,
        value: i64,
        worker_id: i64,
    ) -> Result<(), Error> {
        let business = self.business.clone();
        let flag = self.flag.clone();
        let updated = self
            .query(move |conn| {
                conn.execute(sql, (value, worker_id, &business, &flag))
                    .context(DatabaseSnafu)
            })
            .await?;
        ensure!(updated > 0, LeaseNotHeldSnafu);
        Ok(())
    }
}

impl super::Worker for DurableWorker {
    #[tracing::instrument(skip(self))]
    async fn get_info(&self) -> Result<Info, super::Error> {
        let mut cache = self.info.lock().await;
        if let Some(info) = *cache {
            return Ok(info);
        }
        let info = match self.reserve_released().await? {
            Some(info) => info,
            None => self.allocate().await?,
        };
        *cache = Some(info);
        Ok(info)
    }

    fn worker_id_bit_length(&self) -> u8 {
        self.worker_id_bit_length
    }

    #[tracing::instrument(skip(self))]
    async fn release(&self) -> Result<(), super::Error> {
        let mut cache = self.info.lock().await;
        let Some(info) = *cache else {
            return Ok(());
        };
        let business = self.business.clone();
        let flag = self.flag.clone();
        let worker_id = info.worker_id;
        self.query(move |conn| {
            conn.busy_timeout(BUSY_TIMEOUT).context(DatabaseSnafu)?;
            conn.execute(
                "UPDATE snowflake_worker SET status = ?1
                 WHERE worker_id = ?2 AND business = ?3 AND flag = ?4;",
                (STATUS_UNUSED, worker_id, &business, &flag),
            )
            .context(DatabaseSnafu)?;
            Ok(())
        })
        .await?;
        *cache = None;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn update_over_last_time(&self, over_last_time: i64) -> Result<(), super::Error> {
        let mut cache = self.info.lock().await;
        let Some(info) = cache.as_mut() else {
            return Err(LeaseNotHeldSnafu.build().into());
        };
        self.update_frontier(
            "UPDATE snowflake_worker SET over_last_time = ?1
             WHERE worker_id = ?2 AND business = ?3 AND flag = ?4;",
            over_last_time,
            info.worker_id,
        )
        .await?;
        info.over_last_time = over_last_time;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn update_back_last_time(&self, back_last_time: i64) -> Result<(), super::Error> {
        let mut cache = self.info.lock().await;
        let Some(info) = cache.as_mut() else {
            return Err(LeaseNotHeldSnafu.build().into());
        };
        self.update_frontier(
            "UPDATE snowflake_worker SET back_last_time = ?1
             WHERE worker_id = ?2 AND business = ?3 AND flag = ?4;",
            back_last_time,
            info.worker_id,
        )
        .await?;
        info.back_last_time = back_last_time;
        Ok(())
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}
