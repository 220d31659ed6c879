use chrono::Utc;

/// Wall-clock milliseconds that never repeat or go backwards. A reading at
/// or before the previous one is bumped to previous + 1.
#[derive(Debug, Default, Clone)]
pub struct MonotonicClock {
    last: i64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&mut self) -> i64 {
        self.tick_at(Utc::now().timestamp_millis())
    }

    pub fn tick_at(&mut self, wall_ms: i64) -> i64 {
        self.last = if wall_ms > self.last { wall_ms } else { self.last + 1 };
        self.last
    }
}
