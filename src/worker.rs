use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, LazyLock, RwLock},
};

use snafu::{Location, OptionExt, Snafu};

use crate::config::Config;

pub mod durable;
pub mod fixed;

pub use self::{durable::DurableWorker, fixed::StaticWorker};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("worker builder {name} not found"))]
    BuilderNotFound {
        name: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("static worker error"), context(false))]
    Static {
        source: fixed::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("durable worker error"), context(false))]
    Durable {
        source: durable::Error,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Worker-id lease held by this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Info {
    pub worker_id: i64,
    /// Highest tick the lease holder has committed to never reuse.
    pub over_last_time: i64,
    /// Tick of the most recently persisted clock regression.
    pub back_last_time: i64,
}

/// Capability set shared by the worker-id variants.
///
/// The generator calls `update_over_last_time` and `update_back_last_time`
/// only on over-cost and turn-back transitions, never on the common
/// emission path.
pub trait Worker: Send + Sync + 'static {
    /// Lease for this process. Idempotent after the first success; the
    /// result is cached in memory.
    fn get_info(&self) -> impl Future<Output = Result<Info, Error>> + Send;

    fn worker_id_bit_length(&self) -> u8;

    /// Return the lease. No-op when none is held.
    fn release(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Durably record the over-cost frontier.
    fn update_over_last_time(
        &self,
        over_last_time: i64,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Durably record the turn-back frontier.
    fn update_back_last_time(
        &self,
        back_last_time: i64,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Runtime-selected worker variant.
#[derive(Debug)]
pub enum AnyWorker {
    Static(StaticWorker),
    Durable(DurableWorker),
}

impl Worker for AnyWorker {
    async fn get_info(&self) -> Result<Info, Error> {
        match self {
            AnyWorker::Static(worker) => worker.get_info().await,
            AnyWorker::Durable(worker) => worker.get_info().await,
        }
    }

    fn worker_id_bit_length(&self) -> u8 {
        match self {
            AnyWorker::Static(worker) => worker.worker_id_bit_length(),
            AnyWorker::Durable(worker) => worker.worker_id_bit_length(),
        }
    }

    async fn release(&self) -> Result<(), Error> {
        match self {
            AnyWorker::Static(worker) => worker.release().await,
            AnyWorker::Durable(worker) => worker.release().await,
        }
    }

    async fn update_over_last_time(&self, over_last_time: i64) -> Result<(), Error> {
        match self {
            AnyWorker::Static(worker) => worker.update_over_last_time(over_last_time).await,
            AnyWorker::Durable(worker) => worker.update_over_last_time(over_last_time).await,
        }
    }

    async fn update_back_last_time(&self, back_last_time: i64) -> Result<(), Error> {
        match self {
            AnyWorker::Static(worker) => worker.update_back_last_time(back_last_time).await,
            AnyWorker::Durable(worker) => worker.update_back_last_time(back_last_time).await,
        }
    }
}

pub type WorkerBuilder = Arc<dyn Fn(&Config) -> Result<AnyWorker, Error> + Send + Sync>;

static BUILDERS: LazyLock<RwLock<HashMap<String, WorkerBuilder>>> = LazyLock::new(|| {
    let mut builders: HashMap<String, WorkerBuilder> = HashMap::new();
    builders.insert(
        "static".to_owned(),
        Arc::new(|config| Ok(AnyWorker::Static(StaticWorker::new(&config.worker.static_)?))),
    );
    builders.insert(
        "durable".to_owned(),
        Arc::new(|config| Ok(AnyWorker::Durable(DurableWorker::new(&config.worker.durable)?))),
    );
    RwLock::new(builders)
});

/// Register a worker builder under `name`, replacing any previous one.
///
/// Intended to be called from application startup, before any generator is
/// constructed.
pub fn register_worker_builder(name: impl Into<String>, builder: WorkerBuilder) {
    BUILDERS
        .write()
        .expect("worker builder registry poisoned")
        .insert(name.into(), builder);
}

/// Build the worker registered under `name`.
pub fn new_worker(name: &str, config: &Config) -> Result<AnyWorker, Error> {
    let builders = BUILDERS.read().expect("worker builder registry poisoned");
    let builder = builders
        .get(name)
        .context(BuilderNotFoundSnafu { name })?
        .clone();
    drop(builders);
    builder(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_builder_name() {
        let err = new_worker("bogus", &Config::default()).unwrap_err();
        assert!(matches!(err, Error::BuilderNotFound { ref name, .. } if name == "bogus"));
    }

    #[tokio::test]
    async fn static_builder_is_registered() {
        let worker = new_worker("static", &Config::default()).unwrap();
        assert!(matches!(worker, AnyWorker::Static(_)));
        assert_eq!(worker.worker_id_bit_length(), 6);
        assert_eq!(worker.get_info().await.unwrap().worker_id, 1);
    }

    #[test]
    fn registered_builder_resolves() {
        register_worker_builder(
            "fixed-zero",
            Arc::new(|config| {
                let mut section = config.worker.static_.clone();
                section.worker_id = 0;
                Ok(AnyWorker::Static(StaticWorker::new(&section)?))
            }),
        );
        let worker = new_worker("fixed-zero", &Config::default()).unwrap();
        assert!(matches!(worker, AnyWorker::Static(_)));
    }
}
