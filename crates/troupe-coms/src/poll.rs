use std::time::{Duration, Instant};

/// Outcome of one bounded poll: data, a stop condition (cancel or peer
/// loss), expiry of the configured timeout, or the peer closing the
/// connection. The four are mutually exclusive.
#[derive(Debug)]
pub(crate) enum Polled<T> {
    Ready(T),
    Stopped,
    TimedOut,
    Closed,
}

/// Deadline for one blocking receive. `None` blocks forever.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    end: Option<Instant>,
}

impl Deadline {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            end: timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn forever() -> Self {
        Self { end: None }
    }

    pub fn expired(&self) -> bool {
        match self.end {
            Some(end) => Instant::now() >= end,
            None => false,
        }
    }
}

/// Global time budget spanning a whole multi-step operation, such as a
/// handshake with retries. `None` means unbounded.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimeoutBudget {
    end: Option<Instant>,
}

impl TimeoutBudget {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            end: timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn exhausted(&self) -> bool {
        match self.end {
            Some(end) => Instant::now() >= end,
            None => false,
        }
    }

    /// Time left, or `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.end.map(|end| end.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_deadline_never_expires() {
        let deadline = Deadline::forever();
        assert!(!deadline.expired());

        let deadline = Deadline::new(None);
        assert!(!deadline.expired());
    }

    #[test]
    fn bounded_deadline_expires() {
        let deadline = Deadline::new(Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(deadline.expired());
    }

    #[test]
    fn budget_remaining_shrinks() {
        let budget = TimeoutBudget::new(Some(Duration::from_secs(10)));
        let first = budget.remaining().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let second = budget.remaining().unwrap();
        assert!(second <= first);
        assert!(!budget.exhausted());
    }

    #[test]
    fn unbounded_budget_never_exhausts() {
        let budget = TimeoutBudget::new(None);
        assert!(!budget.exhausted());
        assert!(budget.remaining().is_none());
    }
}
