//! Poller state machine.
//!
//! Every poller walks the same activation sequence and records it here, so an
//! exchange that happens out of order is caught as an invalid transition
//! instead of silently confusing the card.
//!
//! # States
//!
//! - `Idle`: no card selected
//! - `Reset`: field being (re)established
//! - `Request`: REQA/WUPA sent, waiting for ATQA
//! - `Collision(level)`: bit-oriented anticollision at a cascade level
//! - `Select(level)`: SELECT sent for a resolved UID part
//! - `ReadAts`: RATS sent, waiting for the ATS
//! - `Active`: card selected, protocol commands allowed
//! - `Halt`: HLTA (plain or encrypted) in flight
//! - `Error`: an exchange failed; the next step is always `Idle`
//!
//! # Valid Transitions
//!
//! - Idle → Reset → Request → Collision(1) → Select(1) → [Collision(n) → Select(n)] → Active
//! - Active → ReadAts → Active
//! - Active → Halt → Idle
//! - any state but Idle → Error → Idle
//!
//! # Examples
//!
//! ```
//! use tapkit_poller::{PollerState, PollerStateMachine};
//!
//! let mut machine = PollerStateMachine::new();
//! machine.transition_to(PollerState::Reset).unwrap();
//! machine.transition_to(PollerState::Request).unwrap();
//! assert!(machine.transition_to(PollerState::Active).is_err());
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tapkit_core::{Error, Result};
use tapkit_protocol::CascadeLevel;

/// Maximum number of state transitions to keep in history.
///
/// A triple-size UID activation with ATS takes 11 transitions, so this holds
/// the last few activations of a read loop.
const MAX_HISTORY_SIZE: usize = 64;

/// Poller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    Idle,
    Reset,
    Request,
    Collision(CascadeLevel),
    Select(CascadeLevel),
    ReadAts,
    Active,
    Halt,
    Error,
}

impl fmt::Display for PollerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollerState::Idle => write!(f, "Idle"),
            PollerState::Reset => write!(f, "Reset"),
            PollerState::Request => write!(f, "Request"),
            PollerState::Collision(level) => write!(f, "Collision(CL{})", level.index() + 1),
            PollerState::Select(level) => write!(f, "Select(CL{})", level.index() + 1),
            PollerState::ReadAts => write!(f, "ReadAts"),
            PollerState::Active => write!(f, "Active"),
            PollerState::Halt => write!(f, "Halt"),
            PollerState::Error => write!(f, "Error"),
        }
    }
}

impl PollerState {
    /// Check if transition to target state is valid from this state.
    ///
    /// # Examples
    ///
    /// ```
    /// use tapkit_poller::PollerState;
    /// use tapkit_protocol::CascadeLevel;
    ///
    /// assert!(PollerState::Request.can_transition_to(&PollerState::Collision(CascadeLevel::One)));
    /// assert!(!PollerState::Request.can_transition_to(&PollerState::Collision(CascadeLevel::Two)));
    /// assert!(PollerState::Active.can_transition_to(&PollerState::Error));
    /// assert!(!PollerState::Idle.can_transition_to(&PollerState::Error));
    /// ```
    pub fn can_transition_to(&self, target: &PollerState) -> bool {
        match (self, target) {
            (PollerState::Idle, PollerState::Reset)
            | (PollerState::Reset, PollerState::Request)
            | (PollerState::Request, PollerState::Collision(CascadeLevel::One))
            | (PollerState::Active, PollerState::ReadAts | PollerState::Halt)
            | (PollerState::ReadAts, PollerState::Active)
            | (PollerState::Halt, PollerState::Idle)
            | (PollerState::Error, PollerState::Idle) => true,
            (PollerState::Collision(from), PollerState::Select(to)) => from == to,
            (PollerState::Select(from), PollerState::Collision(to)) => from.next() == Some(*to),
            (PollerState::Select(_), PollerState::Active) => true,
            (PollerState::Idle | PollerState::Error, PollerState::Error) => false,
            (_, PollerState::Error) => true,
            _ => false,
        }
    }

    /// Whether a card is currently selected.
    pub fn is_active(&self) -> bool {
        matches!(self, PollerState::Active | PollerState::ReadAts)
    }
}

/// A single state transition with timestamp.
///
/// The timestamp is not serialized; deserialized records get the time of
/// deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: PollerState,
    pub to: PollerState,
    #[serde(skip, default = "Instant::now")]
    pub timestamp: Instant,
}

impl StateTransition {
    pub fn new(from: PollerState, to: PollerState) -> Self {
        Self {
            from,
            to,
            timestamp: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.timestamp.elapsed()
    }
}

/// State machine tracking one poller's activation sequence.
///
/// Not thread-safe; each poller owns its own machine.
#[derive(Debug)]
pub struct PollerStateMachine {
    current_state: PollerState,
    state_entered_at: Instant,
    history: VecDeque<StateTransition>,
}

impl PollerStateMachine {
    /// Create a new state machine in the Idle state.
    pub fn new() -> Self {
        Self {
            current_state: PollerState::Idle,
            state_entered_at: Instant::now(),
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
        }
    }

    /// Create a builder for a machine with a custom starting point.
    ///
    /// # Examples
    ///
    /// ```
    /// use tapkit_poller::{PollerState, PollerStateMachine};
    ///
    /// let machine = PollerStateMachine::builder()
    ///     .with_initial_state(PollerState::Active)
    ///     .build();
    /// assert_eq!(machine.current_state(), &PollerState::Active);
    /// ```
    pub fn builder() -> PollerStateMachineBuilder {
        PollerStateMachineBuilder::default()
    }

    pub fn current_state(&self) -> &PollerState {
        &self.current_state
    }

    pub fn time_in_current_state(&self) -> Duration {
        self.state_entered_at.elapsed()
    }

    /// Recent transitions, oldest first.
    pub fn history(&self) -> &VecDeque<StateTransition> {
        &self.history
    }

    /// The last `count` transitions, oldest first.
    pub fn last_transitions(&self, count: usize) -> Vec<StateTransition> {
        self.history
            .iter()
            .rev()
            .take(count)
            .rev()
            .cloned()
            .collect()
    }

    /// Transition to a new state, validating the transition.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidStateTransition` if the transition is not
    /// allowed from the current state. The machine is left unchanged.
    pub fn transition_to(&mut self, new_state: PollerState) -> Result<StateTransition> {
        if !self.current_state.can_transition_to(&new_state) {
            return Err(Error::InvalidStateTransition {
                from: self.current_state.to_string(),
                to: new_state.to_string(),
            });
        }

        let transition = StateTransition::new(self.current_state, new_state);
        self.perform_state_change(new_state, transition.clone());
        Ok(transition)
    }

    /// Force the machine back to Idle, whatever the current state.
    pub fn reset(&mut self) -> StateTransition {
        let transition = StateTransition::new(self.current_state, PollerState::Idle);
        self.perform_state_change(PollerState::Idle, transition.clone());
        transition
    }

    fn perform_state_change(&mut self, new_state: PollerState, transition: StateTransition) {
        self.current_state = new_state;
        self.state_entered_at = Instant::now();
        self.history.push_back(transition);
        if self.history.len() > MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
    }
}

impl Default for PollerStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`PollerStateMachine`].
#[derive(Debug)]
pub struct PollerStateMachineBuilder {
    initial_state: PollerState,
}

impl PollerStateMachineBuilder {
    pub fn with_initial_state(mut self, state: PollerState) -> Self {
        self.initial_state = state;
        self
    }

    /// Machine starting in the configured state with an empty history.
    pub fn build(self) -> PollerStateMachine {
        PollerStateMachine {
            current_state: self.initial_state,
            state_entered_at: Instant::now(),
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
        }
    }
}

impl Default for PollerStateMachineBuilder {
    fn default() -> Self {
        Self {
            initial_state: PollerState::Idle,
        }
    }
}
