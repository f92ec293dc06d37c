use std::time::Duration;

use snafu::{ensure, Location, ResultExt, Snafu};
use tokio::{sync::Mutex, time};
use tracing::{debug, error, info};

use crate::{
    clock::{SystemClock, TimeSource},
    config::Config,
    worker::{self, Worker},
};

/// Widest combined worker-id + sequence layout; leaves at least 41 bits
/// of millisecond delta inside a 63-bit id.
const MAX_SHIFT_BIT_LENGTH: u8 = 22;
/// Lowest permitted `min_seq_number`; slots 1..5 stay reserved for ids
/// borrowed during clock regression.
const MIN_SEQ_FLOOR: i64 = 5;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("min seq number must be at least {MIN_SEQ_FLOOR}"))]
    MinSeqTooSmall {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("min seq number {min_seq_number} must not exceed max seq number {max_seq_number}"))]
    MinSeqAboveMax {
        min_seq_number: i64,
        max_seq_number: i64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "worker id bit length {worker_id_bit_length} + seq bit length {seq_bit_length} must not exceed {MAX_SHIFT_BIT_LENGTH}"
    ))]
    BitLengthExceeded {
        worker_id_bit_length: u8,
        seq_bit_length: u8,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("get worker info error"))]
    WorkerInfo {
        source: worker::Error,
        #[snafu(implicit)]
        location: Location,
    },
}

#[derive(Debug)]
struct State {
    /// Tick attached to the most recently emitted id.
    last_time_tick: i64,
    /// Next sequence value to emit at `last_time_tick`.
    current_seq_number: i64,
    is_over_cost: bool,
    over_cost_count_in_one_term: i64,
    /// Tick the next borrowed id will carry; 0 when no regression is
    /// being served.
    turn_back_time_tick: i64,
    /// Persisted regression boundary; borrowed sweeps never cross it.
    min_back_time_tick: i64,
    /// Intra-tick slot of the current borrowed sweep, always below
    /// `min_seq_number`.
    turn_back_index: i64,
}

/// Snowflake id generator.
///
/// Ids pack `[timestamp_delta | worker_id | sequence]` into 63 bits.
/// When a millisecond's sequence space runs out the generator borrows
/// synthetic future ticks (over-cost); when the clock runs backward it
/// borrows low-slot ids from past ticks (turn-back). Both transitions
/// checkpoint through the worker so a restarted process cannot reissue
/// an id, and both degrade to waiting out the wall clock when the
/// checkpoint fails.
#[derive(Debug)]
pub struct Snowflake<W, C = SystemClock> {
    base_time: i64,
    worker_id: i64,
    seq_bit_length: u8,
    max_seq_number: i64,
    min_seq_number: i64,
    top_over_cost_count: i64,
    timestamp_shift: u8,
    state: Mutex<State>,
    worker: W,
    clock: C,
}

impl<W: Worker> Snowflake<W> {
    pub async fn new(config: Config, worker: W) -> Result<Self, Error> {
        Self::with_clock(config, worker, SystemClock).await
    }
}

impl<W: Worker, C: TimeSource> Snowflake<W, C> {
    pub async fn with_clock(config: Config, worker: W, clock: C) -> Result<Self, Error> {
        let max_seq_number = if config.max_seq_number == 0 {
            (1i64 << config.seq_bit_length) - 1
        } else {
            config.max_seq_number
        };
        ensure!(config.min_seq_number >= MIN_SEQ_FLOOR, MinSeqTooSmallSnafu);
        ensure!(
            config.min_seq_number <= max_seq_number,
            MinSeqAboveMaxSnafu {
                min_seq_number: config.min_seq_number,
                max_seq_number,
            }
        );
        let worker_id_bit_length = worker.worker_id_bit_length();
        ensure!(
            worker_id_bit_length + config.seq_bit_length <= MAX_SHIFT_BIT_LENGTH,
            BitLengthExceededSnafu {
                worker_id_bit_length,
                seq_bit_length: config.seq_bit_length,
            }
        );

        let info = worker.get_info().await.context(WorkerInfoSnafu)?;
        info!(worker_id = info.worker_id, "snowflake worker ready");

        let snowflake = Self {
            base_time: config.base_time,
            worker_id: info.worker_id,
            seq_bit_length: config.seq_bit_length,
            max_seq_number,
            min_seq_number: config.min_seq_number,
            top_over_cost_count: config.top_over_cost_count,
            timestamp_shift: worker_id_bit_length + config.seq_bit_length,
            state: Mutex::new(State {
                last_time_tick: 0,
                current_seq_number: config.min_seq_number,
                is_over_cost: false,
                over_cost_count_in_one_term: 0,
                turn_back_time_tick: 0,
                min_back_time_tick: info.back_last_time,
                turn_back_index: 0,
            }),
            worker,
            clock,
        };

        // A persisted over-cost frontier at or ahead of the wall clock
        // means a prior incarnation already issued ids up to that tick;
        // refuse to emit anything at or below it.
        if info.over_last_time >= snowflake.current_time_tick() {
            let mut state = snowflake.state.lock().await;
            state.last_time_tick = info.over_last_time;
            let last_time_tick = state.last_time_tick;
            snowflake.next_time_tick(last_time_tick).await;
        }

        Ok(snowflake)
    }

    /// Emit the next id. Infallible: checkpoint failures degrade to
    /// waiting out the wall clock.
    pub async fn fetch_id(&self) -> i64 {
        let mut state = self.state.lock().await;
        if state.is_over_cost {
            self.next_over_cost_id(&mut state).await
        } else {
            self.next_normal_id(&mut state).await
        }
    }

    pub fn worker_id(&self) -> i64 {
        self.worker_id
    }

    /// Return the worker lease. Checkpoints the last emitted tick first
    /// (best effort) so a successor starting inside the same millisecond
    /// cannot duplicate an id this incarnation issued.
    pub async fn release(&self) -> Result<(), worker::Error> {
        let last_time_tick = self.state.lock().await.last_time_tick;
        if last_time_tick > 0 {
            if let Err(err) = self.worker.update_over_last_time(last_time_tick).await {
                debug!("skipping frontier checkpoint on release: {err}");
            }
        }
        self.worker.release().await
    }

    async fn next_normal_id(&self, state: &mut State) -> i64 {
        let current_time_tick = self.current_time_tick();

        if current_time_tick < state.last_time_tick {
            if state.turn_back_time_tick < 1 && !self.begin_turn_back(state).await {
                let tick = state.last_time_tick;
                return self.cost_id(state, tick);
            }
            return self.calc_turn_back_id(state);
        }

        if state.turn_back_time_tick > 0 {
            self.end_turn_back(state).await;
        }

        if current_time_tick > state.last_time_tick {
            state.last_time_tick = current_time_tick;
            state.current_seq_number = self.min_seq_number;
            let tick = state.last_time_tick;
            return self.cost_id(state, tick);
        }

        if state.current_seq_number > self.max_seq_number {
            self.begin_over_cost(state).await;
        }
        let tick = state.last_time_tick;
        self.cost_id(state, tick)
    }

    async fn next_over_cost_id(&self, state: &mut State) -> i64 {
        let current_time_tick = self.current_time_tick();

        if current_time_tick > state.last_time_tick {
            self.end_over_cost(state, current_time_tick);
        } else if state.over_cost_count_in_one_term >= self.top_over_cost_count {
            let tick = self.next_time_tick(state.last_time_tick).await;
            self.end_over_cost(state, tick);
        } else if state.current_seq_number > self.max_seq_number {
            self.begin_over_cost(state).await;
        }

        let tick = state.last_time_tick;
        self.cost_id(state, tick)
    }

    /// Advance into the next synthetic tick, persisting it first so a
    /// restart cannot reuse it.
    async fn begin_over_cost(&self, state: &mut State) {
        if let Err(err) = self
            .worker
            .update_over_last_time(state.last_time_tick + 1)
            .await
        {
            error!("failed to update over last time: {err}");
            let tick = self.next_time_tick(state.last_time_tick).await;
            self.end_over_cost(state, tick);
            return;
        }
        state.last_time_tick += 1;
        state.current_seq_number = self.min_seq_number;
        state.is_over_cost = true;
        state.over_cost_count_in_one_term += 1;
    }

    fn end_over_cost(&self, state: &mut State, current_time_tick: i64) {
        state.last_time_tick = current_time_tick;
        state.current_seq_number = self.min_seq_number;
        state.is_over_cost = false;
        state.over_cost_count_in_one_term = 0;
    }

    /// Start (or restart) a borrowed sweep below `last_time_tick`.
    /// Returns false when the sweep is abandoned; the caller then emits
    /// at the fresh tick the abandonment waited for.
    async fn begin_turn_back(&self, state: &mut State) -> bool {
        state.turn_back_index += 1;
        state.turn_back_time_tick = state.last_time_tick - 1;

        // The borrowed window is exhausted, or a previously persisted
        // regression already issued ids in it.
        if state.min_back_time_tick >= state.turn_back_time_tick
            && state.turn_back_index >= self.min_seq_number
        {
            self.abandon_turn_back(state).await;
            return false;
        }
        if state.turn_back_index == 1
            && self
                .worker
                .update_back_last_time(state.last_time_tick)
                .await
                .is_err()
        {
            self.abandon_turn_back(state).await;
            return false;
        }
        true
    }

    async fn abandon_turn_back(&self, state: &mut State) {
        state.last_time_tick = self.next_time_tick(state.last_time_tick).await;
        state.current_seq_number = self.min_seq_number;
        self.end_turn_back(state).await;
    }

    async fn end_turn_back(&self, state: &mut State) {
        state.turn_back_time_tick = 0;
        state.turn_back_index = 0;
        // The persisted frontier only ever advances; rereading it keeps
        // future regressions off the slots this one issued.
        if let Ok(info) = self.worker.get_info().await {
            state.min_back_time_tick = info.back_last_time;
        }
    }

    /// Sleep in 1 ms steps until the wall clock moves past
    /// `last_time_tick`.
    async fn next_time_tick(&self, last_time_tick: i64) -> i64 {
        let mut tick = self.current_time_tick();
        while tick <= last_time_tick {
            time::sleep(Duration::from_millis(1)).await;
            tick = self.current_time_tick();
        }
        tick
    }

    fn current_time_tick(&self) -> i64 {
        self.clock.current_millis() - self.base_time
    }

    fn cost_id(&self, state: &mut State, use_time_tick: i64) -> i64 {
        let id = (use_time_tick << self.timestamp_shift)
            | (self.worker_id << self.seq_bit_length)
            | state.current_seq_number;
        state.current_seq_number += 1;
        id
    }

    fn calc_turn_back_id(&self, state: &mut State) -> i64 {
        let id = (state.turn_back_time_tick << self.timestamp_shift)
            | (self.worker_id << self.seq_bit_length)
            | state.turn_back_index;
        state.turn_back_time_tick -= 1;
        id
    }
}
