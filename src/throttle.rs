//! Transfer Throttle Module
//!
//! Byte-budgeted blocking throttler for the external image transfer pipe.
//! The transfer loop calls [`BandwidthThrottler::throttle`] after each buffer
//! it moves; the call sleeps whenever the current period's budget is spent.

use std::sync::Mutex;
use std::time::{Duration, Instant};

const PERIOD: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct ThrottleState {
    period_start: Instant,
    bytes_this_period: u64,
}

/// Caps a transfer at a fixed number of bytes per second.
#[derive(Debug)]
pub struct BandwidthThrottler {
    bytes_per_period: u64,
    state: Mutex<ThrottleState>,
}

impl BandwidthThrottler {
    /// A throttler granting `bytes_per_sec` across half-second periods.
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_period: (bytes_per_sec / 2).max(1),
            state: Mutex::new(ThrottleState {
                period_start: Instant::now(),
                bytes_this_period: 0,
            }),
        }
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_period * 2
    }

    /// Account for `bytes` just transferred, sleeping out the remainder of
    /// the period when the budget is exhausted.
    pub fn throttle(&self, bytes: u64) {
        let mut state = self.state.lock().expect("throttle lock");
        state.bytes_this_period += bytes;
        while state.bytes_this_period >= self.bytes_per_period {
            let elapsed = state.period_start.elapsed();
            if elapsed < PERIOD {
                std::thread::sleep(PERIOD - elapsed);
            }
            state.period_start = Instant::now();
            state.bytes_this_period = state.bytes_this_period.saturating_sub(self.bytes_per_period);
        }
    }
}
