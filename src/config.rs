use std::path::PathBuf;

use serde::Deserialize;

/// Generator configuration.
///
/// All fields default to the values documented on [`Default`], so embedding
/// applications can splice a partial section out of their own config files.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Milliseconds since the unix epoch subtracted from the wall clock
    /// before shifting into the timestamp field. Must be in the past.
    pub base_time: i64,
    /// Width of the sequence field.
    pub seq_bit_length: u8,
    /// Upper bound of the sequence counter. `0` derives
    /// `2^seq_bit_length - 1`.
    pub max_seq_number: i64,
    /// Lower bound of the sequence counter. Slots below it are reserved
    /// for ids borrowed during clock regression.
    pub min_seq_number: i64,
    /// Cap on consecutive synthetic-tick advances while a single
    /// millisecond's sequence space is exhausted.
    pub top_over_cost_count: i64,
    /// Name of the registered worker builder.
    pub worker_name: String,
    pub worker: WorkerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_time: 1_582_136_402_000,
            seq_bit_length: 12,
            max_seq_number: 0,
            min_seq_number: 5,
            top_over_cost_count: 2000,
            worker_name: "static".to_owned(),
            worker: WorkerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    #[serde(rename = "static")]
    pub static_: StaticWorkerConfig,
    pub durable: DurableWorkerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StaticWorkerConfig {
    pub worker_id_bit_length: u8,
    pub worker_id: i64,
}

impl Default for StaticWorkerConfig {
    fn default() -> Self {
        Self {
            worker_id_bit_length: 6,
            worker_id: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DurableWorkerConfig {
    pub worker_id_bit_length: u8,
    /// Scope within which leased worker ids are unique.
    pub business: String,
    /// Directory holding the shared lease database.
    pub data_dir: PathBuf,
}

impl Default for DurableWorkerConfig {
    fn default() -> Self {
        Self {
            worker_id_bit_length: 6,
            business: "default".to_owned(),
            data_dir: PathBuf::from("./data"),
        }
    }
}
