use std::time::Duration;

/// Timing and recovery settings of a [`crate::Device`].
///
/// The defaults are tuned for a 2831E behind its CP210x bridge at 9600 baud.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Wait for the answer to a plain query such as `*IDN?`.
    pub read_timeout: Duration,
    /// Bound for a single write, including the flush.
    pub write_timeout: Duration,
    /// Wait for the optional echo after a configuration command. Echoes
    /// arriving later are still recognized by the codec.
    pub echo_timeout: Duration,
    /// Wait for a single line inside a fetch.
    pub line_timeout: Duration,
    /// Time a fetch attempt keeps reading lines before it is given up.
    pub fetch_window: Duration,
    /// Fetch attempts (each resends the query) before the fetch fails.
    pub fetch_attempts: u32,
    /// Lines read per fetch attempt before it is given up.
    pub max_lines: usize,
    /// Pause after the n-th failed attempt is n times this.
    pub retry_backoff: Duration,
    /// Minimum gap between two commands leaving the host.
    pub command_gap: Duration,
    /// Consecutive failures triggering a buffer flush.
    pub light_reset_after: u32,
    /// Consecutive failures triggering a close and reopen of the port.
    pub heavy_reset_after: u32,
    /// Idle time after a reopen before the next command may be sent.
    pub cool_off: Duration,
    /// Extra cool-off per consecutive failure, counting at most three.
    pub cool_off_step: Duration,
    /// Pause between a BUS trigger and fetching its reading.
    pub trigger_settle: Duration,
    /// Pause after opening a port before the first command.
    pub open_settle: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(1500),
            write_timeout: Duration::from_millis(1500),
            echo_timeout: Duration::from_millis(1500),
            line_timeout: Duration::from_millis(100),
            fetch_window: Duration::from_millis(1500),
            fetch_attempts: 3,
            max_lines: 16,
            retry_backoff: Duration::from_millis(150),
            command_gap: Duration::from_millis(40),
            light_reset_after: 1,
            heavy_reset_after: 3,
            cool_off: Duration::from_millis(800),
            cool_off_step: Duration::from_millis(200),
            trigger_settle: Duration::from_millis(50),
            open_settle: Duration::from_millis(200),
        }
    }
}

impl Config {
    /// Cool-off after a reopen caused by `failures` consecutive failures.
    pub fn cool_off_for(&self, failures: u32) -> Duration {
        self.cool_off + self.cool_off_step * failures.min(3)
    }

    /// Upper bound of the time spent in one fetch, cool-off included.
    pub fn fetch_budget(&self) -> Duration {
        let attempts = self.fetch_attempts;
        let backoff: u32 = (1..attempts).sum();
        (self.command_gap + self.write_timeout + self.fetch_window) * attempts
            + self.retry_backoff * backoff
            + self.cool_off_for(self.heavy_reset_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cool_off_is_capped() {
        let config = Config::default();
        assert_eq!(config.cool_off_for(0), Duration::from_millis(800));
        assert_eq!(config.cool_off_for(3), Duration::from_millis(1400));
        assert_eq!(config.cool_off_for(10), Duration::from_millis(1400));
    }

    #[test]
    fn test_fetch_budget() {
        let config = Config::default();
        // 3 * (40 + 1500 + 1500) + 150 * (1 + 2) + 1400
        assert_eq!(config.fetch_budget(), Duration::from_millis(10_970));
    }
}
