use std::time::{Duration, Instant};

/// Bounds how long a blocking wait may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Wait as long as it takes.
    Never,
    /// Do not wait at all.
    Instant,
    /// Wait for at most the given duration, measured from the moment the wait begins.
    Relative(Duration),
    /// Wait until the given point in time.
    Absolute(Instant),
}

impl Default for Deadline {
    fn default() -> Self {
        Deadline::Never
    }
}

impl Deadline {
    pub fn after(duration: Duration) -> Deadline {
        if duration == Duration::from_secs(0) {
            Deadline::Instant
        } else {
            Deadline::Relative(duration)
        }
    }

    pub fn is_never(&self) -> bool {
        matches!(self, Deadline::Never)
    }

    /// Returns true if waiting on this deadline would not block at all.
    pub fn is_instant(&self) -> bool {
        match *self {
            Deadline::Instant => true,
            Deadline::Relative(duration) => duration == Duration::from_secs(0),
            Deadline::Absolute(at) => at <= Instant::now(),
            Deadline::Never => false,
        }
    }

    /// Time left before the deadline expires, or `None` for [`Deadline::Never`].
    pub fn remaining(&self) -> Option<Duration> {
        match *self {
            Deadline::Never => None,
            Deadline::Instant => Some(Duration::from_secs(0)),
            Deadline::Relative(duration) => Some(duration),
            Deadline::Absolute(at) => Some(at.saturating_duration_since(Instant::now())),
        }
    }

    /// Pin a relative deadline to the current time so that it can be re-evaluated across
    /// several waits without being extended.
    pub fn start(&self) -> Deadline {
        match *self {
            Deadline::Relative(duration) => match Instant::now().checked_add(duration) {
                Some(at) => Deadline::Absolute(at),
                None => Deadline::Never,
            },
            other => other,
        }
    }

    /// Remaining time in whole milliseconds for `poll(2)` style interfaces; `-1` means infinite.
    pub fn as_poll_timeout(&self) -> i32 {
        match self.remaining() {
            None => -1,
            Some(remaining) => {
                // Round up so that a sub-millisecond deadline still waits.
                let millis = remaining.as_nanos().saturating_add(999_999) / 1_000_000;
                std::cmp::min(millis, i32::MAX as u128) as i32
            }
        }
    }
}

impl From<Duration> for Deadline {
    fn from(duration: Duration) -> Self {
        Deadline::after(duration)
    }
}

impl From<Instant> for Deadline {
    fn from(at: Instant) -> Self {
        Deadline::Absolute(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels() {
        assert!(Deadline::Instant.is_instant());
        assert!(!Deadline::Never.is_instant());
        assert_eq!(None, Deadline::Never.remaining());
        assert_eq!(-1, Deadline::Never.as_poll_timeout());
        assert_eq!(0, Deadline::Instant.as_poll_timeout());
        assert_eq!(Deadline::Instant, Deadline::after(Duration::from_secs(0)));
    }

    #[test]
    fn test_relative_rounds_up() {
        let deadline = Deadline::Relative(Duration::from_micros(10));
        assert_eq!(1, deadline.as_poll_timeout());
        let deadline = Deadline::Relative(Duration::from_millis(1500));
        assert_eq!(1500, deadline.as_poll_timeout());
    }

    #[test]
    fn test_start_pins_relative() {
        let deadline = Deadline::Relative(Duration::from_secs(60)).start();
        match deadline {
            Deadline::Absolute(at) => assert!(at > Instant::now()),
            other => panic!("unexpected {:?}", other),
        }
        let past = Deadline::Absolute(Instant::now() - Duration::from_millis(5));
        assert!(past.is_instant());
        assert_eq!(Some(Duration::from_secs(0)), past.remaining());
    }
}
