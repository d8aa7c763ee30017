//! Logical timers driven by the entity's owner: time is passed in explicitly, and expired timers
//!  are collected by polling, so an entity never runs code behind its owner's back.

use std::time::{Duration, Instant};
use tracing::trace;


#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum TimerId {
    PollRetransmit,
    Reordering,
    StatusProhibit,
}

#[derive(Clone, Debug)]
pub struct LogicalTimer {
    duration: Duration,
    deadline: Option<Instant>,
}

impl LogicalTimer {
    pub fn new(duration: Duration) -> LogicalTimer {
        LogicalTimer {
            duration,
            deadline: None,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// (re)starts the timer, replacing a previous deadline
    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.duration);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true exactly once per arming, namely on the first call at or after the deadline.
    pub fn take_expired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}


/// The three timers of an AM entity
#[derive(Clone, Debug)]
pub struct TimerSet {
    pub poll_retransmit: LogicalTimer,
    pub reordering: LogicalTimer,
    pub status_prohibit: LogicalTimer,
}

impl TimerSet {
    pub fn new(t_poll_retransmit: Duration, t_reordering: Duration, t_status_prohibit: Duration) -> TimerSet {
        TimerSet {
            poll_retransmit: LogicalTimer::new(t_poll_retransmit),
            reordering: LogicalTimer::new(t_reordering),
            status_prohibit: LogicalTimer::new(t_status_prohibit),
        }
    }

    pub fn get_mut(&mut self, id: TimerId) -> &mut LogicalTimer {
        match id {
            TimerId::PollRetransmit => &mut self.poll_retransmit,
            TimerId::Reordering => &mut self.reordering,
            TimerId::StatusProhibit => &mut self.status_prohibit,
        }
    }

    /// Collects and disarms all timers that expired at `now`. The order is fixed so that a
    ///  status prohibit expiry is seen before a reordering expiry requests a new report.
    pub fn expired(&mut self, now: Instant) -> Vec<TimerId> {
        let mut result = Vec::new();
        for id in [TimerId::StatusProhibit, TimerId::Reordering, TimerId::PollRetransmit] {
            if self.get_mut(id).take_expired(now) {
                trace!("timer {:?} expired", id);
                result.push(id);
            }
        }
        result
    }

    /// the earliest deadline of all running timers
    pub fn next_deadline(&self) -> Option<Instant> {
        [&self.poll_retransmit, &self.reordering, &self.status_prohibit]
            .into_iter()
            .filter_map(LogicalTimer::deadline)
            .min()
    }

    pub fn cancel_all(&mut self) {
        self.poll_retransmit.cancel();
        self.reordering.cancel();
        self.status_prohibit.cancel();
    }
}
