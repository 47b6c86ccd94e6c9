use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// A logical clock that advances by one on every tick of a fixed-interval timer. Resend
///  scheduling is done in logical ticks rather than wall-clock time.
pub struct LogicalClock {
    interval: Interval,
    now: u64,
}

impl LogicalClock {
    pub fn new(tick_interval: Duration) -> LogicalClock {
        let mut interval = interval(tick_interval);
        // ticks that were missed while the connection was busy are not made up for
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        LogicalClock {
            interval,
            now: 0,
        }
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    /// waits for the next tick, returning the new logical time
    pub async fn tick(&mut self) -> u64 {
        self.interval.tick().await;
        self.now += 1;
        self.now
    }
}
