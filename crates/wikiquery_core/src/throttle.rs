use std::thread::sleep;
use std::time::{Duration, Instant};

/// Process-wide pacing of physical HTTP calls.
pub trait Throttle {
    /// Called exactly once before every physical call, retries included.
    fn gate(&mut self, is_write: bool);

    /// Block for a backoff delay chosen by the retry logic.
    fn pause(&mut self, delay: Duration);
}

pub struct IntervalThrottle {
    read_interval: Duration,
    write_interval: Duration,
    last_request_at: Option<Instant>,
}

impl IntervalThrottle {
    pub fn new(read_interval: Duration, write_interval: Duration) -> Self {
        Self {
            read_interval,
            write_interval,
            last_request_at: None,
        }
    }

    fn interval(&self, is_write: bool) -> Duration {
        if is_write {
            self.write_interval
        } else {
            self.read_interval
        }
    }
}

impl Throttle for IntervalThrottle {
    fn gate(&mut self, is_write: bool) {
        let delay = self.interval(is_write);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
    }

    fn pause(&mut self, delay: Duration) {
        if !delay.is_zero() {
            sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{IntervalThrottle, Throttle};

    #[test]
    fn first_gate_does_not_wait() {
        let mut throttle = IntervalThrottle::new(Duration::from_secs(5), Duration::from_secs(5));
        let started = Instant::now();
        throttle.gate(false);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn second_gate_waits_for_interval() {
        let mut throttle =
            IntervalThrottle::new(Duration::from_millis(20), Duration::from_millis(40));
        throttle.gate(false);
        let started = Instant::now();
        throttle.gate(true);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
