use std::time::Duration;

/// Escalating wait between attempts: spin, then yield, then sleep with a capped exponent.
///
/// Every lock in this crate is polled, there is no futex or condition variable that other
/// processes could wake us through.
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 10;
    const SLEEP_LIMIT: u32 = 15;

    pub fn new() -> Self {
        Backoff { step: 0 }
    }

    pub fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..1u32 << self.step {
                core::hint::spin_loop();
            }
        } else if self.step <= Self::YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            let exp = self.step - Self::YIELD_LIMIT;
            std::thread::sleep(Duration::from_micros(50 << exp));
        }

        if self.step < Self::SLEEP_LIMIT {
            self.step += 1;
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new()
    }
}
