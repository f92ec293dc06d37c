use snafu::{ensure, Location, Snafu};

use super::{Info, Worker};
use crate::config::StaticWorkerConfig;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("worker id {worker_id} does not fit in {bit_length} bits"))]
    WorkerIdOutOfRange {
        worker_id: i64,
        bit_length: u8,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("static worker does not persist the {frontier} frontier"))]
    CheckpointUnsupported {
        frontier: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Worker with a config-supplied id and no backing store.
///
/// Frontier checkpoints are declined, so the generator degrades to
/// catch-up waits on sequence exhaustion and clock regression. Suitable
/// for single-process deployments with a stable monotonic clock.
#[derive(Debug)]
pub struct StaticWorker {
    info: Info,
    worker_id_bit_length: u8,
}

impl StaticWorker {
    pub fn new(config: &StaticWorkerConfig) -> Result<Self, Error> {
        let max_worker_id = (1i64 << config.worker_id_bit_length) - 1;
        ensure!(
            (0..=max_worker_id).contains(&config.worker_id),
            WorkerIdOutOfRangeSnafu {
                worker_id: config.worker_id,
                bit_length: config.worker_id_bit_length,
            }
        );
        Ok(Self {
            info: Info {
                worker_id: config.worker_id,
                ..Info::default()
            },
            worker_id_bit_length: config.worker_id_bit_length,
        })
    }
}

impl Worker for StaticWorker {
    async fn get_info(&self) -> Result<Info, super::Error> {
        Ok(self.info)
    }

    fn worker_id_bit_length(&self) -> u8 {
        self.worker_id_bit_length
    }

    async fn release(&self) -> Result<(), super::Error> {
        Ok(())
    }

    async fn update_over_last_time(&self, _over_last_time: i64) -> Result<(), super::Error> {
        Err(CheckpointUnsupportedSnafu {
            frontier: "over-last-time",
        }
        .build()
        .into())
    }

    async fn update_back_last_time(&self, _back_last_time: i64) -> Result<(), super::Error> {
        Err(CheckpointUnsupportedSnafu {
            frontier: "back-last-time",
        }
        .build()
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_the_configured_id() {
        let worker = StaticWorker::new(&StaticWorkerConfig {
            worker_id_bit_length: 6,
            worker_id: 63,
        })
        .unwrap();
        let info = worker.get_info().await.unwrap();
        assert_eq!(info.worker_id, 63);
        assert_eq!(info.over_last_time, 0);
        assert_eq!(info.back_last_time, 0);
        assert_eq!(worker.worker_id_bit_length(), 6);
        worker.release().await.unwrap();
    }

    #[test]
    fn rejects_an_id_wider_than_its_bit_length() {
        let err = StaticWorker::new(&StaticWorkerConfig {
            worker_id_bit_length: 6,
            worker_id: 64,
        })
        .unwrap_err();
        assert!(matches!(err, Error::WorkerIdOutOfRange { worker_id: 64, .. }));
    }

    #[tokio::test]
    async fn declines_frontier_checkpoints() {
        let worker = StaticWorker::new(&StaticWorkerConfig::default()).unwrap();
        assert!(worker.update_over_last_time(1).await.is_err());
        assert!(worker.update_back_last_time(1).await.is_err());
    }
}
