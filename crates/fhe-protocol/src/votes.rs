//! Vote ingestion.
//!
//! Votes arrive as an ordered sequence of [`VoteEvent`]s from a [`VoteSource`]
//! and are validated against the candidate [`Roster`] before encryption. An
//! invalid vote is reported back to its source, which may produce a
//! replacement as its next event.

use std::collections::VecDeque;

use crate::{Error, Result};

/// One raw vote: the 1-based index of the chosen candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteEvent {
    /// Candidate index as entered; validated against the roster.
    pub choice: i64,
}

impl From<i64> for VoteEvent {
    fn from(choice: i64) -> Self {
        Self { choice }
    }
}

/// An ordered source of vote events.
pub trait VoteSource {
    /// The next vote, or `None` when the source is exhausted.
    fn next_vote(&mut self) -> Option<VoteEvent>;

    /// Called when `event` was rejected. The default ignores the rejection.
    fn rejected(&mut self, event: &VoteEvent, error: &Error) {
        let _ = (event, error);
    }
}

/// A vote source over a fixed list, recording rejected events.
#[derive(Debug, Default, Clone)]
pub struct VoteQueue {
    pending: VecDeque<VoteEvent>,
    rejected: Vec<VoteEvent>,
}

impl VoteQueue {
    /// Create a queue from raw choices.
    pub fn new<I: IntoIterator<Item = i64>>(choices: I) -> Self {
        Self {
            pending: choices.into_iter().map(VoteEvent::from).collect(),
            rejected: Vec::new(),
        }
    }

    /// Events rejected so far.
    pub fn rejected_events(&self) -> &[VoteEvent] {
        &self.rejected
    }
}

impl VoteSource for VoteQueue {
    fn next_vote(&mut self) -> Option<VoteEvent> {
        self.pending.pop_front()
    }

    fn rejected(&mut self, event: &VoteEvent, _error: &Error) {
        self.rejected.push(*event);
    }
}

/// The candidates of a voting session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    names: Vec<String>,
}

impl Roster {
    /// Create a roster; at least one candidate is required.
    pub fn new(names: Vec<String>) -> Result<Self> {
        if names.is_empty() {
            return Err(Error::InvalidParameter(
                "at least one candidate is required".to_string(),
            ));
        }
        Ok(Self { names })
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Always false; a roster holds at least one candidate.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Name of the candidate at 1-based `index`.
    pub fn name(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.names.get(i))
            .map(String::as_str)
    }

    /// Candidate names in roster order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Validate a vote, returning the 1-based candidate index.
    pub fn validate(&self, event: &VoteEvent) -> Result<usize> {
        if event.choice < 1 || event.choice > self.names.len() as i64 {
            return Err(Error::invalid_vote(event.choice, self.names.len()));
        }
        Ok(event.choice as usize)
    }
}
