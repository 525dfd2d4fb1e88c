//! Schedule slot state machine.
//!
//! A slot tracks when one target (a DNS lookup key or a health check) last
//! ran and decides when it must run again. DNS entries and health checks
//! both embed one, so duplicate suppression works the same way for each.

use crate::clock::Timestamp;

use std::time::Duration;
use thiserror::Error;

/// Query lifecycle of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Inactive,
    Queued,
    InProgress,
    Failed,
}

/// What the caller should do after asking a slot whether it needs work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryDecision {
    /// Due now. The slot is marked queued and the caller must enqueue a unit.
    Work,
    /// Due later. The caller must arm a timer for the given time.
    Event(Timestamp),
    /// Queued, running, or already covered by a pending timer.
    Ignore,
}

/// Why a query could not be started.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryRefused {
    #[error("stale generation {expected} (current {current})")]
    Stale { expected: u64, current: u64 },
    #[error("query already in progress")]
    InFlight,
}

#[derive(Debug, Clone)]
pub struct ScheduleSlot {
    state: QueryState,
    /// Generation under which the last query started.
    version: u64,
    query_start: Timestamp,
    result_time: Timestamp,
    period: Duration,
    timeout: Duration,
    /// Fire time of a timer already armed for this slot.
    pending_event: Option<Timestamp>,
}

impl ScheduleSlot {
    pub fn new(period: Duration, timeout: Duration, version: u64) -> Self {
        Self {
            state: QueryState::Inactive,
            version,
            query_start: Timestamp::NEVER,
            result_time: Timestamp::NEVER,
            period,
            timeout,
            pending_event: None,
        }
    }

    /// Carry scheduling history over into a new generation.
    ///
    /// A slot that was queued or running in the old generation keeps the old
    /// version, which makes it due immediately under the new one.
    pub fn inherit(&mut self, previous: &ScheduleSlot, generation: u64) {
        self.result_time = previous.result_time;
        self.query_start = previous.query_start;
        match previous.state {
            QueryState::Queued | QueryState::InProgress => {
                self.state = QueryState::Inactive;
                self.version = previous.version;
            }
            state => {
                self.state = state;
                self.version = generation;
            }
        }
    }

    /// Restore the outcome of a query recorded before startup.
    pub fn restore(&mut self, result_time: Timestamp, success: bool) {
        if matches!(self.state, QueryState::Queued | QueryState::InProgress) {
            return;
        }
        self.result_time = result_time;
        self.state = if success {
            QueryState::Inactive
        } else {
            QueryState::Failed
        };
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn query_start(&self) -> Timestamp {
        self.query_start
    }

    pub fn result_time(&self) -> Timestamp {
        self.result_time
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn pending_event(&self) -> Option<Timestamp> {
        self.pending_event
    }

    /// Shrink period and timeout to the smaller of the current and requested values.
    pub fn narrow(&mut self, period: Duration, timeout: Duration) {
        self.period = self.period.min(period);
        self.timeout = self.timeout.min(timeout);
    }

    /// When the next query is due, never earlier than `now`.
    pub fn next_query_time(&self, now: Timestamp, generation: u64) -> Timestamp {
        if self.version != generation {
            return now;
        }
        let due = match self.state {
            QueryState::Inactive | QueryState::Failed => self.result_time + self.period,
            QueryState::InProgress => self.query_start + self.timeout,
            QueryState::Queued => now,
        };
        due.max(now)
    }

    pub fn query_needed(&mut self, now: Timestamp, generation: u64) -> QueryDecision {
        match self.state {
            QueryState::Queued => return QueryDecision::Ignore,
            QueryState::InProgress if now < self.query_start + self.timeout => {
                return QueryDecision::Ignore;
            }
            _ => {}
        }

        let due = self.next_query_time(now, generation);
        if due <= now {
            self.state = QueryState::Queued;
            self.pending_event = None;
            return QueryDecision::Work;
        }

        match self.pending_event {
            Some(pending) if pending <= due => QueryDecision::Ignore,
            _ => {
                self.pending_event = Some(due);
                QueryDecision::Event(due)
            }
        }
    }

    /// Clear the pending mark if the timer that fired is the one recorded.
    pub fn release_event(&mut self, fired: Timestamp) {
        if self.pending_event == Some(fired) {
            self.pending_event = None;
        }
    }

    pub fn start(&mut self, now: Timestamp, generation: u64) -> Result<Timestamp, QueryRefused> {
        if self.state == QueryState::InProgress {
            return Err(QueryRefused::InFlight);
        }
        self.state = QueryState::InProgress;
        self.query_start = now;
        self.version = generation;
        self.pending_event = None;
        Ok(now + self.timeout)
    }

    /// Record a finished query and return when the next one is due.
    ///
    /// The returned time is recorded as the pending timer; the caller arms it.
    pub fn finish(&mut self, now: Timestamp, success: bool, generation: u64) -> Timestamp {
        self.state = if success {
            QueryState::Inactive
        } else {
            QueryState::Failed
        };
        self.result_time = now;
        let next = self.next_query_time(now, generation);
        self.pending_event = (next > now).then_some(next);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    fn at(millis: u64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    #[test]
    fn test_new_slot_is_due() {
        let mut slot = ScheduleSlot::new(SEC, SEC / 2, 1);
        assert_eq!(slot.query_needed(at(10_000), 1), QueryDecision::Work);
        assert_eq!(slot.state(), QueryState::Queued);
        assert_eq!(slot.query_needed(at(10_000), 1), QueryDecision::Ignore);
    }

    #[test]
    fn test_finish_schedules_next_run() {
        let mut slot = ScheduleSlot::new(SEC, SEC / 2, 1);
        assert_eq!(slot.start(at(10_000), 1), Ok(at(10_500)));
        assert_eq!(slot.start(at(10_100), 1), Err(QueryRefused::InFlight));

        let next = slot.finish(at(10_200), true, 1);
        assert_eq!(next, at(11_200));
        assert_eq!(slot.pending_event(), Some(at(11_200)));

        // The finishing worker armed the timer, so nobody else needs to
        assert_eq!(slot.query_needed(at(10_300), 1), QueryDecision::Ignore);
        assert_eq!(slot.query_needed(at(11_200), 1), QueryDecision::Work);
    }

    #[test]
    fn test_event_only_once_per_timer() {
        let mut slot = ScheduleSlot::new(SEC, SEC / 2, 1);
        slot.start(at(10_000), 1).unwrap();
        slot.finish(at(10_000), true, 1);
        slot.release_event(at(11_000));
        assert_eq!(slot.pending_event(), None);

        assert_eq!(slot.query_needed(at(10_100), 1), QueryDecision::Event(at(11_000)));
        assert_eq!(slot.query_needed(at(10_200), 1), QueryDecision::Ignore);

        // A stale timer does not clear the newer one
        slot.release_event(at(10_900));
        assert_eq!(slot.pending_event(), Some(at(11_000)));

        // Narrowing moves the due time earlier, so a new timer is requested
        slot.narrow(SEC / 2, SEC / 2);
        assert_eq!(slot.query_needed(at(10_200), 1), QueryDecision::Event(at(10_500)));
    }

    #[test]
    fn test_overdue_query_is_forced() {
        let mut slot = ScheduleSlot::new(SEC, SEC / 2, 1);
        slot.start(at(10_000), 1).unwrap();
        assert_eq!(slot.query_needed(at(10_499), 1), QueryDecision::Ignore);
        assert_eq!(slot.next_query_time(at(10_499), 1), at(10_500));
        assert_eq!(slot.next_query_time(at(20_000), 1), at(20_000));
        assert_eq!(slot.query_needed(at(10_500), 1), QueryDecision::Work);
        assert_eq!(slot.state(), QueryState::Queued);
    }

    #[test]
    fn test_failed_retries_after_period() {
        let mut slot = ScheduleSlot::new(SEC, SEC / 2, 1);
        slot.start(at(10_000), 1).unwrap();
        assert_eq!(slot.finish(at(10_100), false, 1), at(11_100));
        assert_eq!(slot.state(), QueryState::Failed);
        assert_eq!(slot.next_query_time(at(10_200), 1), at(11_100));
    }

    #[test]
    fn test_version_mismatch_forces_now() {
        let mut slot = ScheduleSlot::new(SEC, SEC / 2, 1);
        slot.start(at(10_000), 1).unwrap();
        slot.finish(at(10_000), true, 1);
        assert_eq!(slot.next_query_time(at(10_100), 2), at(10_100));
    }

    #[test]
    fn test_restore_defers_first_query() {
        let mut slot = ScheduleSlot::new(SEC, SEC / 2, 1);
        slot.restore(at(10_000), true);
        assert_eq!(slot.query_needed(at(10_400), 1), QueryDecision::Event(at(11_000)));

        let mut busy = ScheduleSlot::new(SEC, SEC / 2, 1);
        busy.start(at(10_000), 1).unwrap();
        busy.restore(at(5_000), false);
        assert_eq!(busy.state(), QueryState::InProgress);
    }

    #[test]
    fn test_inherit() {
        let mut old = ScheduleSlot::new(SEC, SEC / 2, 1);
        old.start(at(10_000), 1).unwrap();
        old.finish(at(10_000), true, 1);

        let mut settled = ScheduleSlot::new(SEC, SEC, 2);
        settled.inherit(&old, 2);
        assert_eq!(settled.next_query_time(at(10_100), 2), at(11_000));

        old.query_needed(at(11_000), 1);
        let mut requeued = ScheduleSlot::new(SEC, SEC, 2);
        requeued.inherit(&old, 2);
        assert_eq!(requeued.state(), QueryState::Inactive);
        assert_eq!(requeued.query_needed(at(11_001), 2), QueryDecision::Work);
    }
}
