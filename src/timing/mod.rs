use std::time::{Duration, Instant};

/// The memory manager occasionally has to hold the CPU until the GPU
/// catches up -- most notably while compaction copies are still in flight.
/// The wait is expressed as a policy object so an application can tune the
/// poll cadence and so tests can pump a simulated GPU instead of sleeping.
pub trait WaitPolicy {
    /// Poll `ready` until it reports true or the policy gives up.
    ///
    /// Returns false if the policy gave up before `ready` was satisfied.
    fn wait_until(&mut self, ready: &mut dyn FnMut() -> bool) -> bool;
}

/// A wait policy which spin-sleeps a fixed interval between polls and
/// gives up after a deadline.
///
/// The interval matches the cadence the hardware needs for label
/// write-back; the deadline exists so a wedged GPU surfaces as an error
/// instead of an unbounded busy-poll.
pub struct SpinWait {
    interval: Duration,
    timeout: Duration,
}

impl SpinWait {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

impl Default for SpinWait {
    /// Poll every 30 microseconds, give up after two seconds.
    fn default() -> Self {
        Self::new(Duration::from_micros(30), Duration::from_secs(2))
    }
}

impl WaitPolicy for SpinWait {
    fn wait_until(&mut self, ready: &mut dyn FnMut() -> bool) -> bool {
        let deadline = Instant::now() + self.timeout;
        loop {
            if ready() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            spin_sleep::sleep(self.interval);
        }
    }
}
