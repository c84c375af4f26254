use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

/// Lifecycle of a worker, shared between the supervisor, the watch loop and
/// the producer. Transitions are one-way except `Reload`, which the
/// supervisor resolves back into `Start` or `Stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunStatus {
    Wait = 0,
    Start = 1,
    Reload = 2,
    Stop = 3,
}

impl RunStatus {
    fn from_u8(v: u8) -> RunStatus {
        match v {
            0 => RunStatus::Wait,
            1 => RunStatus::Start,
            2 => RunStatus::Reload,
            _ => RunStatus::Stop,
        }
    }
}

/// Counters kept off the data path. All adds are relaxed; these are
/// statistics, not synchronization.
#[derive(Debug, Default)]
pub struct Stats {
    /// Lines framed out of source files.
    pub lines_read: AtomicU64,
    /// Records handed to the sender queue.
    pub records_queued: AtomicU64,
    /// Records acknowledged by the broker.
    pub records_sent: AtomicU64,
    /// Lines dropped by framing (overflow) or by a failing transform.
    pub lines_dropped: AtomicU64,
    /// Records currently between the watch loop and a broker ack.
    pub queue_depth: AtomicU64,
}

impl Stats {
    pub fn incr(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn decr(counter: &AtomicU64, n: u64) {
        counter.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// The few pieces of state that cross thread boundaries on the sender:
/// run status, the producer's flow-control signal, the tail-limit flag
/// and the counters. Everything else is owned by exactly one loop.
#[derive(Debug)]
pub struct Shared {
    run: AtomicU8,
    flow_control: AtomicBool,
    tail_limit: AtomicBool,
    pub stats: Stats,
}

impl Default for Shared {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    pub fn new() -> Shared {
        Shared {
            run: AtomicU8::new(RunStatus::Wait as u8),
            flow_control: AtomicBool::new(false),
            tail_limit: AtomicBool::new(false),
            stats: Stats::default(),
        }
    }

    pub fn run_status(&self) -> RunStatus {
        RunStatus::from_u8(self.run.load(Ordering::SeqCst))
    }

    pub fn set_run_status(&self, status: RunStatus) {
        self.run.store(status as u8, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.run_status() == RunStatus::Stop
    }

    /// Set by the producer while the broker client rejects submissions;
    /// readers suspend framing while this is on.
    pub fn flow_control_on(&self) -> bool {
        self.flow_control.load(Ordering::SeqCst)
    }

    pub fn set_flow_control(&self, on: bool) {
        self.flow_control.store(on, Ordering::SeqCst);
    }

    /// Raised by a reader that had to cap a tail pass; the supervisor can
    /// surface it through the pingback sink.
    pub fn tail_limited(&self) -> bool {
        self.tail_limit.load(Ordering::SeqCst)
    }

    pub fn set_tail_limit(&self, on: bool) {
        self.tail_limit.store(on, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_round_trips() {
        let shared = Shared::new();
        assert_eq!(shared.run_status(), RunStatus::Wait);
        shared.set_run_status(RunStatus::Start);
        assert_eq!(shared.run_status(), RunStatus::Start);
        shared.set_run_status(RunStatus::Stop);
        assert!(shared.stop_requested());
    }

    #[test]
    fn flow_control_toggles() {
        let shared = Shared::new();
        assert!(!shared.flow_control_on());
        shared.set_flow_control(true);
        assert!(shared.flow_control_on());
        shared.set_flow_control(false);
        assert!(!shared.flow_control_on());
    }
}
