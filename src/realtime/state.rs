//! Connection state machine for the realtime channel.
//!
//! The transition function is pure: it maps the current state and an input to
//! the next state plus the side effect the driver must perform. All I/O lives
//! in [`crate::realtime::channel`].

use serde::Serialize;
use std::time::Duration;

/// Where the channel is in its connect cascade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ChannelState {
    /// Idle; no transport open and no reconnect scheduled
    Disconnected,
    /// Opening transport `transport` during pass `round`
    Connecting {
        /// Index into the transport list
        transport: usize,
        /// Zero-based pass over the transport list
        round: u32,
    },
    /// Receiving on transport `transport`
    Connected {
        /// Index into the transport list
        transport: usize,
        /// Pass the connection was opened in; kept until it proves stable
        round: u32,
    },
    /// Every transport failed; waiting before pass `round`
    Backoff {
        /// Pass that starts when the wait ends
        round: u32,
    },
}

impl ChannelState {
    /// Whether a transport is open and listening
    pub fn is_connected(&self) -> bool {
        matches!(self, ChannelState::Connected { .. })
    }
}

/// Events fed to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelInput {
    /// Caller asked to connect
    Connect,
    /// Current transport opened
    Opened,
    /// Current transport failed or timed out while connecting, or dropped
    /// before the connection proved stable
    Failed,
    /// A stable connection closed or errored
    Closed,
    /// Backoff delay finished
    BackoffElapsed,
    /// Caller asked to disconnect
    Disconnect,
}

/// Side effect requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelAction {
    /// Connect transport `i`
    Open(usize),
    /// Subscribe and read from transport `i`
    Listen(usize),
    /// Sleep, then feed [`ChannelInput::BackoffElapsed`]
    Wait(Duration),
    /// Close whatever is open and stop
    Stop,
    /// Retry budget spent; stop trying
    GiveUp,
}

/// Limits of the connect cascade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Number of transports in the cascade
    pub transport_count: usize,
    /// Backoff before pass `n` is `n * base_delay`
    pub base_delay: Duration,
    /// Passes over the transport list before giving up
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before pass `round`
    pub fn delay_for(&self, round: u32) -> Duration {
        self.base_delay.saturating_mul(round)
    }
}

/// Compute the next state and the action the driver should take
pub fn transition(
    state: ChannelState,
    input: ChannelInput,
    policy: &ReconnectPolicy,
) -> (ChannelState, Option<ChannelAction>) {
    use ChannelAction::*;
    use ChannelInput::*;
    use ChannelState::*;

    match (state, input) {
        (_, Disconnect) => (Disconnected, Some(Stop)),

        (Disconnected, Connect) => start_round(0, policy),

        (Connecting { transport, round }, Opened) => (Connected { transport, round }, Some(Listen(transport))),

        (Connecting { transport, round }, Failed) | (Connected { transport, round }, Failed) => {
            next_transport(transport, round, policy)
        }

        (Connected { .. }, Closed) => start_round(0, policy),

        (Backoff { round }, BackoffElapsed) => start_round(round, policy),

        (state, _) => (state, None),
    }
}

fn next_transport(transport: usize, round: u32, policy: &ReconnectPolicy) -> (ChannelState, Option<ChannelAction>) {
    let next = transport + 1;
    if next < policy.transport_count {
        return (ChannelState::Connecting { transport: next, round }, Some(ChannelAction::Open(next)));
    }

    let round = round + 1;
    if round >= policy.max_attempts {
        (ChannelState::Disconnected, Some(ChannelAction::GiveUp))
    } else {
        (ChannelState::Backoff { round }, Some(ChannelAction::Wait(policy.delay_for(round))))
    }
}

fn start_round(round: u32, policy: &ReconnectPolicy) -> (ChannelState, Option<ChannelAction>) {
    if policy.transport_count == 0 {
        (ChannelState::Disconnected, Some(ChannelAction::GiveUp))
    } else {
        (ChannelState::Connecting { transport: 0, round }, Some(ChannelAction::Open(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy(transports: usize, max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            transport_count: transports,
            base_delay: Duration::from_secs(1),
            max_attempts,
        }
    }

    #[test]
    fn test_connect_tries_transports_in_order() {
        let p = policy(3, 5);
        let (s, a) = transition(ChannelState::Disconnected, ChannelInput::Connect, &p);
        assert_eq!(s, ChannelState::Connecting { transport: 0, round: 0 });
        assert_eq!(a, Some(ChannelAction::Open(0)));

        let (s, a) = transition(s, ChannelInput::Failed, &p);
        assert_eq!(a, Some(ChannelAction::Open(1)));
        let (s, a) = transition(s, ChannelInput::Opened, &p);
        assert_eq!(s, ChannelState::Connected { transport: 1, round: 0 });
        assert_eq!(a, Some(ChannelAction::Listen(1)));
    }

    #[test]
    fn test_backoff_grows_linearly_then_gives_up() {
        let p = policy(2, 3);
        let mut state = transition(ChannelState::Disconnected, ChannelInput::Connect, &p).0;
        let mut waits = Vec::new();

        loop {
            let (next, action) = transition(state, ChannelInput::Failed, &p);
            state = next;
            match action {
                Some(ChannelAction::Open(_)) => continue,
                Some(ChannelAction::Wait(delay)) => {
                    waits.push(delay);
                    state = transition(state, ChannelInput::BackoffElapsed, &p).0;
                }
                Some(ChannelAction::GiveUp) => break,
                other => panic!("unexpected action {:?}", other),
            }
        }

        assert_eq!(waits, vec![Duration::from_secs(1), Duration::from_secs(2)]);
        assert_eq!(state, ChannelState::Disconnected);
    }

    #[test]
    fn test_stable_close_restarts_cascade() {
        let p = policy(2, 5);
        let (s, a) = transition(ChannelState::Connected { transport: 1, round: 3 }, ChannelInput::Closed, &p);
        assert_eq!(s, ChannelState::Connecting { transport: 0, round: 0 });
        assert_eq!(a, Some(ChannelAction::Open(0)));
    }

    #[test]
    fn test_unstable_close_counts_as_failed_attempt() {
        let p = policy(2, 3);
        let (s, a) = transition(ChannelState::Connected { transport: 0, round: 1 }, ChannelInput::Failed, &p);
        assert_eq!(s, ChannelState::Connecting { transport: 1, round: 1 });
        assert_eq!(a, Some(ChannelAction::Open(1)));

        let (s, a) = transition(ChannelState::Connected { transport: 1, round: 1 }, ChannelInput::Failed, &p);
        assert_eq!(s, ChannelState::Backoff { round: 2 });
        assert_eq!(a, Some(ChannelAction::Wait(Duration::from_secs(2))));

        let (s, a) = transition(ChannelState::Connected { transport: 1, round: 2 }, ChannelInput::Failed, &p);
        assert_eq!((s, a), (ChannelState::Disconnected, Some(ChannelAction::GiveUp)));
    }

    #[test]
    fn test_flapping_transport_is_bounded() {
        let p = policy(1, 4);
        let mut state = transition(ChannelState::Disconnected, ChannelInput::Connect, &p).0;
        let mut opens = 1;
        let mut waits = Vec::new();

        loop {
            state = transition(state, ChannelInput::Opened, &p).0;
            let (next, action) = transition(state, ChannelInput::Failed, &p);
            state = next;
            match action {
                Some(ChannelAction::Wait(delay)) => {
                    waits.push(delay);
                    state = transition(state, ChannelInput::BackoffElapsed, &p).0;
                    opens += 1;
                }
                Some(ChannelAction::GiveUp) => break,
                other => panic!("unexpected action {:?}", other),
            }
        }

        assert_eq!(opens, 4);
        assert_eq!(waits, vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(3)]);
        assert_eq!(state, ChannelState::Disconnected);
    }

    #[test]
    fn test_disconnect_from_any_state() {
        let p = policy(2, 5);
        for state in [
            ChannelState::Disconnected,
            ChannelState::Connecting { transport: 1, round: 2 },
            ChannelState::Connected { transport: 0, round: 1 },
            ChannelState::Backoff { round: 1 },
        ] {
            assert_eq!(
                transition(state, ChannelInput::Disconnect, &p),
                (ChannelState::Disconnected, Some(ChannelAction::Stop))
            );
        }
    }

    #[test]
    fn test_no_transports_gives_up() {
        let p = policy(0, 5);
        assert_eq!(
            transition(ChannelState::Disconnected, ChannelInput::Connect, &p),
            (ChannelState::Disconnected, Some(ChannelAction::GiveUp))
        );
    }

    #[test]
    fn test_irrelevant_inputs_ignored() {
        let p = policy(2, 5);
        let connected = ChannelState::Connected { transport: 0, round: 0 };
        assert_eq!(transition(connected, ChannelInput::Connect, &p), (connected, None));
        assert_eq!(
            transition(ChannelState::Disconnected, ChannelInput::Opened, &p),
            (ChannelState::Disconnected, None)
        );
    }

    fn input_strategy() -> impl Strategy<Value = ChannelInput> {
        prop_oneof![
            Just(ChannelInput::Connect),
            Just(ChannelInput::Opened),
            Just(ChannelInput::Failed),
            Just(ChannelInput::Closed),
            Just(ChannelInput::BackoffElapsed),
        ]
    }

    proptest! {
        #[test]
        fn states_stay_within_policy(
            transports in 1usize..5,
            max_attempts in 1u32..6,
            inputs in proptest::collection::vec(input_strategy(), 0..100),
        ) {
            let p = policy(transports, max_attempts);
            let mut state = ChannelState::Disconnected;
            for input in inputs {
                let (next, action) = transition(state, input, &p);
                match next {
                    ChannelState::Connecting { transport, round } => {
                        prop_assert!(transport < transports);
                        prop_assert!(round < max_attempts);
                    }
                    ChannelState::Connected { transport, round } => {
                        prop_assert!(transport < transports);
                        prop_assert!(round < max_attempts);
                    }
                    ChannelState::Backoff { round } => prop_assert!(round >= 1 && round < max_attempts),
                    ChannelState::Disconnected => {}
                }
                if let Some(ChannelAction::Wait(delay)) = action {
                    prop_assert!(delay <= p.base_delay * max_attempts);
                }
                state = next;
            }
        }
    }
}
