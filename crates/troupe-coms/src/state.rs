use std::sync::Mutex;

/// Lifecycle of a channel object.
///
/// `Ready` is the only active state. The terminal states are sticky: once
/// a channel is canceled, ended or timed out it never reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Uninitialized,
    Handshaking,
    Ready,
    Canceled,
    Ended,
    TimedOut,
}

impl ChannelState {
    /// True for the sticky terminal states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChannelState::Canceled | ChannelState::Ended | ChannelState::TimedOut
        )
    }
}

/// Shared state holder enforcing the sticky-terminal rule.
#[derive(Debug)]
pub(crate) struct StateCell {
    state: Mutex<ChannelState>,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState::Uninitialized),
        }
    }

    pub fn get(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    pub fn is_ready(&self) -> bool {
        self.get() == ChannelState::Ready
    }

    /// Transition to `next`. Terminal states never revert.
    pub fn set(&self, next: ChannelState) {
        let mut state = self.state.lock().unwrap();
        if !state.is_terminal() {
            *state = next;
        }
    }
}
