/// Monotonic millisecond time source. The counter is a `u32` and wraps
/// after roughly 49.7 days; compare timestamps with [`elapsed`] only.
pub trait Clock {
    fn now_ms(&self) -> u32;

    /// Blocks for `ms` while letting the network stack run.
    fn sleep_ms(&mut self, ms: u32);

    /// Hands control back to background housekeeping between loop iterations.
    fn yield_now(&mut self) {}
}

/// Milliseconds from `since` to `now`, correct across one counter wrap.
pub fn elapsed(now: u32, since: u32) -> u32 {
    now.wrapping_sub(since)
}

/// Polls `ready` every `poll_ms` until it returns `true` or `timeout_ms`
/// elapses. Returns whether the condition was met. `None` waits forever.
pub fn wait_until<C, F>(clock: &mut C, timeout_ms: Option<u32>, poll_ms: u32, mut ready: F) -> bool
where
    C: Clock + ?Sized,
    F: FnMut() -> bool,
{
    let started = clock.now_ms();
    loop {
        if ready() {
            return true;
        }
        if let Some(timeout) = timeout_ms {
            if elapsed(clock.now_ms(), started) >= timeout {
                return false;
            }
        }
        clock.sleep_ms(poll_ms);
    }
}

/// Simulated clock: time only moves through `sleep_ms` and `advance`.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: u32,
    sleeps: Vec<u32>,
}

impl ManualClock {
    pub fn starting_at(now: u32) -> Self {
        Self {
            now,
            sleeps: Vec::new(),
        }
    }

    pub fn advance(&mut self, ms: u32) {
        self.now = self.now.wrapping_add(ms);
    }

    pub fn set(&mut self, now: u32) {
        self.now = now;
    }

    /// Every `sleep_ms` duration requested so far, in order.
    pub fn sleeps(&self) -> &[u32] {
        &self.sleeps
    }

    pub fn total_slept(&self) -> u64 {
        self.sleeps.iter().map(|&ms| u64::from(ms)).sum()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.now
    }

    fn sleep_ms(&mut self, ms: u32) {
        self.sleeps.push(ms);
        self.advance(ms);
    }
}
