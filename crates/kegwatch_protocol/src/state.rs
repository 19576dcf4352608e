//! Pallet lifecycle state machine.
//!
//! The lifecycle is a tagged enum with an explicit transition table.
//! Invalid transitions are typed errors, never silent no-ops, which also
//! gives the recovery manager a known state to resume at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle states of a pallet record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PalletState {
    /// Captures may exist but no QR has identified the pallet yet.
    Open,
    /// First decoded payload assigned the pallet id.
    Identified,
    /// Receiving further captures under a fixed identity.
    Accumulating,
    /// A capture decoded a different pallet id; operator must resolve.
    PendingReview,
    /// Operator or completion rule closed the record; counts are frozen.
    Complete,
    /// Cloud acknowledged the record. Terminal.
    Synced,
    /// Operator cancelled. Terminal, reachable from any non-terminal state.
    Abandoned,
}

impl PalletState {
    pub const ALL: [PalletState; 7] = [
        PalletState::Open,
        PalletState::Identified,
        PalletState::Accumulating,
        PalletState::PendingReview,
        PalletState::Complete,
        PalletState::Synced,
        PalletState::Abandoned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PalletState::Open => "OPEN",
            PalletState::Identified => "IDENTIFIED",
            PalletState::Accumulating => "ACCUMULATING",
            PalletState::PendingReview => "PENDING_REVIEW",
            PalletState::Complete => "COMPLETE",
            PalletState::Synced => "SYNCED",
            PalletState::Abandoned => "ABANDONED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PalletState::Synced | PalletState::Abandoned)
    }

    /// States in which new captures are applied to the record.
    pub fn accepts_captures(&self) -> bool {
        matches!(
            self,
            PalletState::Open | PalletState::Identified | PalletState::Accumulating
        )
    }

    pub fn valid_transitions(&self) -> &'static [PalletState] {
        match self {
            PalletState::Open => &[PalletState::Identified, PalletState::Abandoned],
            PalletState::Identified => &[
                PalletState::Accumulating,
                PalletState::PendingReview,
                PalletState::Complete,
                PalletState::Abandoned,
            ],
            PalletState::Accumulating => &[
                PalletState::PendingReview,
                PalletState::Complete,
                PalletState::Abandoned,
            ],
            PalletState::PendingReview => &[PalletState::Accumulating, PalletState::Abandoned],
            PalletState::Complete => &[PalletState::Synced, PalletState::Abandoned],
            PalletState::Synced | PalletState::Abandoned => &[],
        }
    }

    pub fn can_transition_to(&self, target: PalletState) -> bool {
        self.valid_transitions().contains(&target)
    }
}

impl fmt::Display for PalletState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PalletState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(PalletState::Open),
            "IDENTIFIED" => Ok(PalletState::Identified),
            "ACCUMULATING" => Ok(PalletState::Accumulating),
            "PENDING_REVIEW" => Ok(PalletState::PendingReview),
            "COMPLETE" => Ok(PalletState::Complete),
            "SYNCED" => Ok(PalletState::Synced),
            "ABANDONED" => Ok(PalletState::Abandoned),
            _ => Err(format!("Invalid pallet state: '{}'", s)),
        }
    }
}

/// One recorded transition, kept in the record's audit history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: PalletState,
    pub to: PalletState,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl StateTransition {
    pub fn new(from: PalletState, to: PalletState) -> Self {
        Self {
            from,
            to,
            at: Utc::now(),
            reason: None,
            actor: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

/// Errors for lifecycle operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PalletStateError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: PalletState, to: PalletState },

    #[error("state is terminal: {0}")]
    Terminal(PalletState),
}

/// Lifecycle manager for one pallet record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PalletLifecycle {
    current: PalletState,
    history: Vec<StateTransition>,
}

impl PalletLifecycle {
    pub fn new() -> Self {
        Self {
            current: PalletState::Open,
            history: Vec::new(),
        }
    }

    /// Resume a lifecycle at a known persisted state.
    pub fn from_state(state: PalletState) -> Self {
        Self {
            current: state,
            history: Vec::new(),
        }
    }

    pub fn current(&self) -> PalletState {
        self.current
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    pub fn transition(&mut self, to: PalletState) -> Result<StateTransition, PalletStateError> {
        self.transition_with(to, None, None)
    }

    pub fn transition_with(
        &mut self,
        to: PalletState,
        reason: Option<String>,
        actor: Option<String>,
    ) -> Result<StateTransition, PalletStateError> {
        if self.current.is_terminal() {
            return Err(PalletStateError::Terminal(self.current));
        }
        if !self.current.can_transition_to(to) {
            return Err(PalletStateError::InvalidTransition {
                from: self.current,
                to,
            });
        }

        let mut transition = StateTransition::new(self.current, to);
        if let Some(r) = reason {
            transition = transition.with_reason(r);
        }
        if let Some(a) = actor {
            transition = transition.with_actor(a);
        }

        self.current = to;
        self.history.push(transition.clone());
        Ok(transition)
    }
}

impl Default for PalletLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
