//! Interaction State Machine
//!
//! This module defines the UI-observable interaction states, the events that
//! drive them, and the [`Dispatcher`] that commits transitions and notifies
//! observers. The transition function is total: every state/event pair maps to
//! a next state, and pairs not listed in the table are self-loops.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// The closed set of states an interaction session can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionState {
    /// Not running. Initial state, and the target of `Exit`/`Error` from anywhere.
    #[default]
    Off,
    /// Waiting for the relay to accept the launch request.
    Initializing,
    /// Idle and ready for a button press or a wake word.
    Standby,
    /// Capturing the user's utterance.
    Listening,
    /// A turn is in flight or its reply is playing.
    Response,
}

impl InteractionState {
    pub const ALL: [InteractionState; 5] = [
        InteractionState::Off,
        InteractionState::Initializing,
        InteractionState::Standby,
        InteractionState::Listening,
        InteractionState::Response,
    ];
}

impl fmt::Display for InteractionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InteractionState::Off => "off",
            InteractionState::Initializing => "initializing",
            InteractionState::Standby => "standby",
            InteractionState::Listening => "listening",
            InteractionState::Response => "response",
        };
        f.write_str(name)
    }
}

/// Payload-free events fed into the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    Start,
    Launched,
    Press,
    Release,
    /// Marker between `Release` and the reply. Folded into `Release -> Response`,
    /// so it never changes state on its own.
    Command,
    Finish,
    Cancel,
    Exit,
    Error,
}

impl Event {
    pub const ALL: [Event; 9] = [
        Event::Start,
        Event::Launched,
        Event::Press,
        Event::Release,
        Event::Command,
        Event::Finish,
        Event::Cancel,
        Event::Exit,
        Event::Error,
    ];
}

/// Computes the next state for `state` under `event`.
pub const fn transition(state: InteractionState, event: Event) -> InteractionState {
    use Event as E;
    use InteractionState as S;

    match (state, event) {
        (S::Off, E::Start) => S::Initializing,

        (S::Initializing, E::Launched) => S::Standby,
        (S::Initializing, E::Exit | E::Error) => S::Off,

        (S::Standby, E::Press) => S::Listening,
        (S::Standby, E::Exit | E::Error) => S::Off,

        // A second press while listening restarts the capture in place.
        (S::Listening, E::Press) => S::Listening,
        (S::Listening, E::Release) => S::Response,
        (S::Listening, E::Exit | E::Error) => S::Off,

        // Barge-in: pressing during a reply goes straight back to listening.
        (S::Response, E::Press) => S::Listening,
        (S::Response, E::Finish | E::Cancel) => S::Standby,
        (S::Response, E::Exit | E::Error) => S::Off,

        (state, _) => state,
    }
}

/// A committed state change, handed to every observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: InteractionState,
    pub previous: InteractionState,
    pub event: Event,
}

type Observer = Arc<dyn Fn(Transition) + Send + Sync>;

#[derive(Default)]
struct DispatcherInner {
    state: InteractionState,
    observers: Vec<Observer>,
}

/// Holds the current [`InteractionState`] for one session and fans committed
/// transitions out to observers.
///
/// Observers run after the new state is stored and outside the internal lock,
/// so an observer may call back into [`Dispatcher::dispatch`].
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<Mutex<DispatcherInner>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the committed state.
    pub fn state(&self) -> InteractionState {
        self.lock().state
    }

    /// Registers an observer. Observers are additive and are called in
    /// registration order.
    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(Transition) + Send + Sync + 'static,
    {
        self.lock().observers.push(Arc::new(observer));
    }

    /// Applies `event` and returns the resulting state.
    ///
    /// Observers are notified only when the state actually changed.
    pub fn dispatch(&self, event: Event) -> InteractionState {
        let (change, observers) = {
            let mut inner = self.lock();
            let previous = inner.state;
            let next = transition(previous, event);
            if next == previous {
                return next;
            }
            inner.state = next;
            (
                Transition {
                    next,
                    previous,
                    event,
                },
                inner.observers.clone(),
            )
        };

        debug!(from = %change.previous, to = %change.next, event = ?event, "State transition");
        for observer in &observers {
            observer(change);
        }
        change.next
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DispatcherInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Dispatcher")
            .field("state", &inner.state)
            .field("observers", &inner.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use Event as E;
    use InteractionState as S;

    #[test]
    fn test_transition_is_total_and_defaults_to_self_loop() {
        let listed = [
            (S::Off, E::Start, S::Initializing),
            (S::Initializing, E::Launched, S::Standby),
            (S::Initializing, E::Exit, S::Off),
            (S::Initializing, E::Error, S::Off),
            (S::Standby, E::Press, S::Listening),
            (S::Standby, E::Exit, S::Off),
            (S::Standby, E::Error, S::Off),
            (S::Listening, E::Press, S::Listening),
            (S::Listening, E::Release, S::Response),
            (S::Listening, E::Exit, S::Off),
            (S::Listening, E::Error, S::Off),
            (S::Response, E::Press, S::Listening),
            (S::Response, E::Finish, S::Standby),
            (S::Response, E::Cancel, S::Standby),
            (S::Response, E::Exit, S::Off),
            (S::Response, E::Error, S::Off),
        ];

        for state in S::ALL {
            for event in E::ALL {
                let expected = listed
                    .iter()
                    .find(|(s, e, _)| *s == state && *e == event)
                    .map(|(_, _, next)| *next)
                    .unwrap_or(state);
                assert_eq!(
                    transition(state, event),
                    expected,
                    "transition({state}, {event:?})"
                );
            }
        }
    }

    #[test]
    fn test_command_never_changes_state() {
        for state in S::ALL {
            assert_eq!(transition(state, E::Command), state);
        }
    }

    #[test]
    fn test_press_release_finish_cycle() {
        let dispatcher = Dispatcher::new();
        dispatcher.dispatch(E::Start);
        dispatcher.dispatch(E::Launched);
        assert_eq!(dispatcher.state(), S::Standby);

        assert_eq!(dispatcher.dispatch(E::Press), S::Listening);
        assert_eq!(dispatcher.dispatch(E::Release), S::Response);
        assert_eq!(dispatcher.dispatch(E::Finish), S::Standby);
    }

    #[test]
    fn test_barge_in_skips_standby() {
        let dispatcher = Dispatcher::new();
        for event in [E::Start, E::Launched, E::Press, E::Release] {
            dispatcher.dispatch(event);
        }
        assert_eq!(dispatcher.state(), S::Response);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher.subscribe(move |t| sink.lock().unwrap().push(t));

        assert_eq!(dispatcher.dispatch(E::Press), S::Listening);
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![Transition {
                next: S::Listening,
                previous: S::Response,
                event: E::Press,
            }]
        );
    }

    #[test]
    fn test_observers_only_fire_on_change() {
        let dispatcher = Dispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        dispatcher.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch(E::Press); // Off ignores Press
        dispatcher.dispatch(E::Finish);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        dispatcher.dispatch(E::Start);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_observer_sees_committed_state_and_can_redispatch() {
        let dispatcher = Dispatcher::new();
        let handle = dispatcher.clone();
        dispatcher.subscribe(move |t| {
            assert_eq!(handle.state(), t.next);
            if t.next == S::Initializing {
                handle.dispatch(E::Launched);
            }
        });

        dispatcher.dispatch(E::Start);
        assert_eq!(dispatcher.state(), S::Standby);
    }

    #[test]
    fn test_exit_from_any_state_returns_off() {
        for state in S::ALL {
            assert_eq!(transition(state, E::Exit), S::Off);
            assert_eq!(transition(state, E::Error), S::Off);
        }
    }
}
