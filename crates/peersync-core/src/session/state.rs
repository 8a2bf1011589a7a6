//! Transition table of the peer session state machine.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::protocol::{FmtType, Message, Role, State};

/// One independent exchange within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exchange {
    /// Clipboard replication in one format
    Clipboard(FmtType),
    /// One file-drop transfer, keyed by its timestamp
    FileDrop(u64),
}

impl Exchange {
    /// The exchange a message belongs to.
    #[must_use]
    pub const fn of(message: &Message) -> Self {
        match message.fmt {
            FmtType::FileDrop => Self::FileDrop(message.timestamp),
            fmt => Self::Clipboard(fmt),
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clipboard(fmt) => write!(f, "{fmt}"),
            Self::FileDrop(ts) => write!(f, "FILE_DROP#{ts}"),
        }
    }
}

/// Whether an exchange may move from `current` to `next`.
#[must_use]
pub const fn is_valid_transition(current: Option<(State, Role)>, next: (State, Role)) -> bool {
    match next {
        (State::Init, Role::Src) | (State::Info | State::Io, Role::Dst) => true,
        (State::Info, Role::Src) => matches!(current, None | Some((State::Init, Role::Src))),
        (State::Trans, Role::Src) => matches!(current, Some((State::Info, Role::Src))),
        (State::Trans, Role::Dst) => matches!(current, Some((State::Info, Role::Dst))),
        (State::Io, Role::Src) => matches!(current, Some((State::Trans, Role::Src))),
        (State::Init, Role::Dst) => false,
    }
}

fn describe(pair: Option<(State, Role)>) -> String {
    pair.map_or_else(|| "NONE".to_string(), |(s, r)| format!("{s}/{r}"))
}

/// Current `(State, Role)` of every exchange of one session.
#[derive(Debug, Default)]
pub struct ExchangeStates {
    states: HashMap<Exchange, (State, Role)>,
}

impl ExchangeStates {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current pair of an exchange.
    #[must_use]
    pub fn current(&self, exchange: Exchange) -> Option<(State, Role)> {
        self.states.get(&exchange).copied()
    }

    /// Move an exchange to `next`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` and leaves the state unchanged if the
    /// table forbids the move.
    pub fn advance(&mut self, exchange: Exchange, next: (State, Role)) -> Result<()> {
        let current = self.current(exchange);
        if !is_valid_transition(current, next) {
            return Err(Error::InvalidTransition {
                exchange: exchange.to_string(),
                from: describe(current),
                to: describe(Some(next)),
            });
        }
        tracing::debug!("{}: {} -> {}", exchange, describe(current), describe(Some(next)));
        self.states.insert(exchange, next);
        Ok(())
    }

    /// Forget a finished exchange.
    pub fn forget(&mut self, exchange: Exchange) {
        self.states.remove(&exchange);
    }

    /// Number of tracked exchanges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }
}
