use std::thread;
use std::time::{Duration, Instant};

/// Deadline for polled register handshakes.
///
/// Timer-based sleeps are far too coarse for the microsecond-order windows
/// hardware handshakes allow, so pollers yield between register reads and
/// check the clock instead.
pub struct Timeout {
    deadline: Instant,
}

impl Timeout {
    #[inline]
    pub fn new(duration: Duration) -> Self {
        Self {
            deadline: Instant::now() + duration,
        }
    }

    #[inline]
    pub fn from_micros(micros: u64) -> Self {
        Self::new(Duration::from_micros(micros))
    }

    #[inline]
    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    #[inline]
    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Yield once more, or report that the deadline has passed.
    #[inline]
    pub fn run(&self) -> Result<(), ()> {
        if Instant::now() < self.deadline {
            thread::yield_now();
            Ok(())
        } else {
            Err(())
        }
    }

    #[inline]
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires() {
        let timeout = Timeout::from_micros(1);
        while timeout.run().is_ok() {}
        assert!(timeout.expired());
    }
}
