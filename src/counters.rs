//! Per-service activity counters.
//!
//! Every live subprocess and every running poll loop holds an [`ActivityGuard`]
//! for as long as it exists, so the counters always reflect what is actually
//! running rather than what the state machine believes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activity {
    Process,
    Poll,
}

/// Live/peak counts of subprocesses and poll loops for one service.
#[derive(Debug, Default)]
pub struct ActivityCounters {
    live_processes: AtomicUsize,
    active_polls: AtomicUsize,
    peak_processes: AtomicUsize,
    peak_polls: AtomicUsize,
}

impl ActivityCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Counts a subprocess until the returned guard is dropped.
    pub fn track_process(self: &Arc<Self>) -> ActivityGuard {
        self.enter(Activity::Process)
    }

    /// Counts a poll loop until the returned guard is dropped.
    pub fn track_poll(self: &Arc<Self>) -> ActivityGuard {
        self.enter(Activity::Poll)
    }

    pub fn live_processes(&self) -> usize {
        self.live_processes.load(Ordering::SeqCst)
    }

    pub fn active_polls(&self) -> usize {
        self.active_polls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous subprocesses ever observed.
    pub fn peak_processes(&self) -> usize {
        self.peak_processes.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous poll loops ever observed.
    pub fn peak_polls(&self) -> usize {
        self.peak_polls.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>, activity: Activity) -> ActivityGuard {
        let (live, peak) = self.slots(activity);
        let now = live.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        ActivityGuard {
            counters: Arc::clone(self),
            activity,
        }
    }

    fn slots(&self, activity: Activity) -> (&AtomicUsize, &AtomicUsize) {
        match activity {
            Activity::Process => (&self.live_processes, &self.peak_processes),
            Activity::Poll => (&self.active_polls, &self.peak_polls),
        }
    }
}

/// Decrements its counter on drop.
#[derive(Debug)]
pub struct ActivityGuard {
    counters: Arc<ActivityCounters>,
    activity: Activity,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        let (live, _) = self.counters.slots(self.activity);
        live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_track_live_and_peak_counts() {
        let counters = ActivityCounters::new();
        let first = counters.track_process();
        let second = counters.track_process();
        let poll = counters.track_poll();
        assert_eq!(counters.live_processes(), 2);
        assert_eq!(counters.active_polls(), 1);
        drop(first);
        drop(second);
        drop(poll);
        assert_eq!(counters.live_processes(), 0);
        assert_eq!(counters.active_polls(), 0);
        assert_eq!(counters.peak_processes(), 2);
        assert_eq!(counters.peak_polls(), 1);
    }
}
