//! Per-connection health tracking.
//!
//! Each message-processing loop owns one [`ConnectionHealth`]. Bad reads
//! (empty or undecodable frames) push the connection from `Healthy` to
//! `Degraded` and, past `max_bad_reads` in a row, to `Closed`. Local failures
//! while handling a message are counted separately; past `max_errors` the
//! process environment is presumed broken and the verdict is `Abort`.

use crate::config::ConnectionConfig;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Messages are flowing normally.
    Healthy,
    /// Recent bad reads or handling errors, still serving.
    Degraded,
    /// The loop must stop reading from this connection.
    Closed,
}

/// What the processing loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// Close this connection.
    Close,
    /// Terminate the process.
    Abort,
}

/// Health tracker for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    state: ConnectionState,
    consecutive_bad_reads: u32,
    errors: u32,
    max_bad_reads: u32,
    max_errors: u32,
}

impl ConnectionHealth {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            state: ConnectionState::Healthy,
            consecutive_bad_reads: 0,
            errors: 0,
            max_bad_reads: config.max_bad_reads,
            max_errors: config.max_errors,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// A well-formed message arrived.
    pub fn record_message(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.consecutive_bad_reads = 0;
        if self.errors == 0 {
            self.state = ConnectionState::Healthy;
        }
    }

    /// An empty or undecodable frame arrived.
    pub fn record_bad_read(&mut self) -> Verdict {
        if self.state == ConnectionState::Closed {
            return Verdict::Close;
        }
        self.consecutive_bad_reads += 1;
        if self.consecutive_bad_reads >= self.max_bad_reads {
            self.state = ConnectionState::Closed;
            return Verdict::Close;
        }
        self.state = ConnectionState::Degraded;
        Verdict::Continue
    }

    /// Handling a message failed locally.
    pub fn record_error(&mut self) -> Verdict {
        self.errors += 1;
        if self.errors >= self.max_errors {
            self.state = ConnectionState::Closed;
            return Verdict::Abort;
        }
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Degraded;
        }
        Verdict::Continue
    }

    /// The peer went away or the stream broke.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(max_bad_reads: u32, max_errors: u32) -> ConnectionHealth {
        ConnectionHealth::new(&ConnectionConfig {
            max_bad_reads,
            max_errors,
            ..Default::default()
        })
    }

    #[test]
    fn test_starts_healthy() {
        let h = health(3, 5);
        assert_eq!(h.state(), ConnectionState::Healthy);
    }

    #[test]
    fn test_bad_reads_close_after_threshold() {
        let mut h = health(3, 5);
        assert_eq!(h.record_bad_read(), Verdict::Continue);
        assert_eq!(h.state(), ConnectionState::Degraded);
        assert_eq!(h.record_bad_read(), Verdict::Continue);
        assert_eq!(h.record_bad_read(), Verdict::Close);
        assert_eq!(h.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_good_message_resets_bad_read_streak() {
        let mut h = health(3, 5);
        h.record_bad_read();
        h.record_bad_read();
        h.record_message();
        assert_eq!(h.state(), ConnectionState::Healthy);
        assert_eq!(h.record_bad_read(), Verdict::Continue);
        assert_eq!(h.record_bad_read(), Verdict::Continue);
        assert_eq!(h.record_bad_read(), Verdict::Close);
    }

    #[test]
    fn test_errors_accumulate_to_abort() {
        let mut h = health(3, 4);
        for _ in 0..3 {
            assert_eq!(h.record_error(), Verdict::Continue);
            h.record_message();
            assert_eq!(h.state(), ConnectionState::Degraded);
        }
        assert_eq!(h.record_error(), Verdict::Abort);
        assert_eq!(h.errors(), 4);
        assert_eq!(h.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_default_thresholds() {
        let config = ConnectionConfig::default();
        assert_eq!(config.max_bad_reads, 10);
        assert_eq!(config.max_errors, 50);
    }
}
