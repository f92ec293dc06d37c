use std::sync::Arc;

use snafu::{Location, OptionExt, ResultExt, Snafu};
use tokio::sync::RwLock;
use tracing::error;

use crate::{
    config::Config,
    generator::{self, Snowflake},
    worker::{self, AnyWorker},
};

static GLOBAL: RwLock<Option<Arc<Snowflake<AnyWorker>>>> = RwLock::const_new(None);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("build {worker_name} worker error"))]
    BuildWorker {
        worker_name: String,
        source: worker::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("init snowflake error"))]
    Init {
        source: generator::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("snowflake is not initialized"))]
    NotInitialized {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("release worker id error"))]
    Release {
        source: worker::Error,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Initialise the process-global generator, replacing any previous one.
///
/// May be called again after [`release`]; the new generator obtains a
/// fresh lease.
pub async fn init(config: Config) -> Result<(), Error> {
    let worker = worker::new_worker(&config.worker_name, &config).context(BuildWorkerSnafu {
        worker_name: config.worker_name.clone(),
    })?;
    let snowflake = Snowflake::new(config, worker).await.context(InitSnafu)?;
    *GLOBAL.write().await = Some(Arc::new(snowflake));
    Ok(())
}

pub async fn fetch_id() -> Result<i64, Error> {
    Ok(current().await?.fetch_id().await)
}

pub async fn worker_id() -> Result<i64, Error> {
    Ok(current().await?.worker_id())
}

/// Release the global generator's worker lease and clear the slot.
///
/// The slot is cleared even when the release fails, so a subsequent
/// [`init`] always starts from scratch. Not initialised is a no-op.
pub async fn release() -> Result<(), Error> {
    let Some(snowflake) = GLOBAL.write().await.take() else {
        return Ok(());
    };
    snowflake.release().await.map_err(|err| {
        error!("failed to release worker id: {err:?}");
        err
    })
    .context(ReleaseSnafu)
}

async fn current() -> Result<Arc<Snowflake<AnyWorker>>, Error> {
    GLOBAL.read().await.clone().context(NotInitializedSnafu)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use uuid::Uuid;

    use super::*;
    use crate::config::DurableWorkerConfig;

    // One test drives the whole lifecycle: the slot is process-wide.
    #[tokio::test]
    async fn lifecycle_with_a_durable_worker() {
        assert!(matches!(
            fetch_id().await.unwrap_err(),
            Error::NotInitialized { .. }
        ));
        release().await.unwrap();

        let data_dir = std::env::temp_dir().join(format!("snowdrift-global-{}", Uuid::new_v4()));
        let config = Config {
            worker_name: "durable".to_owned(),
            worker: crate::config::WorkerConfig {
                durable: DurableWorkerConfig {
                    data_dir: data_dir.clone(),
                    ..DurableWorkerConfig::default()
                },
                ..crate::config::WorkerConfig::default()
            },
            ..Config::default()
        };

        init(config.clone()).await.unwrap();
        let leased = worker_id().await.unwrap();
        let mut seen = HashSet::with_capacity(20_000);
        for _ in 0..10_000 {
            assert!(seen.insert(fetch_id().await.unwrap()));
        }
        release().await.unwrap();
        assert!(matches!(
            worker_id().await.unwrap_err(),
            Error::NotInitialized { .. }
        ));

        // Re-init reacquires the released lease and keeps issuing fresh
        // ids, even without a clock advance in between.
        init(config).await.unwrap();
        assert_eq!(worker_id().await.unwrap(), leased);
        for _ in 0..10_000 {
            assert!(seen.insert(fetch_id().await.unwrap()));
        }
        release().await.unwrap();

        std::fs::remove_dir_all(data_dir).ok();
    }
}
