use chrono::Utc;

/// Millisecond wall-clock reading used by the generator.
pub trait TimeSource: Send + Sync + 'static {
    /// Current time in milliseconds since the unix epoch.
    fn current_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn current_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_does_not_run_backward() {
        let clock = SystemClock;
        let first = clock.current_millis();
        let second = clock.current_millis();
        assert!(first > 0);
        assert!(second >= first);
    }
}
