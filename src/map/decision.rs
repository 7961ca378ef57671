//! Decisions for `operate`
//!
//! A [`DecisionMaker`] looks at the value currently stored under a key (and
//! the value offered by the caller) and decides what a write should do. The
//! built-in makers cover `put`, `remove`, the conditional writes and page
//! rewriting for compaction.

use crate::cursor::CursorPos;
use crate::types::{DataType, KeyType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Leave the tree unchanged and return the existing value
    Abort,
    /// Remove the entry
    Remove,
    /// Insert or replace the entry
    Put,
    /// Traverse again
    Repeat,
}

/// Chooses the outcome of one `operate` call
///
/// `operate` may call `decide` more than once when it has to retry; `reset` is
/// called before every retry.
pub trait DecisionMaker<K: KeyType, V: DataType> {
    fn decide(&mut self, existing: Option<&V::Item>, provided: Option<&V::Item>) -> Decision;

    /// Decide with the descent path (root first, leaf last) at hand
    fn decide_on_path(
        &mut self,
        existing: Option<&V::Item>,
        provided: Option<&V::Item>,
        _path: &[CursorPos<K, V>],
    ) -> Decision {
        self.decide(existing, provided)
    }

    /// Value to store on `Put`
    fn select_value(&mut self, _existing: Option<&V::Item>, provided: Option<V::Item>) -> Option<V::Item> {
        provided
    }

    fn reset(&mut self) {}
}

/// `Put` when a value is given, `Remove` otherwise
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDecision;

impl<K: KeyType, V: DataType> DecisionMaker<K, V> for DefaultDecision {
    fn decide(&mut self, _existing: Option<&V::Item>, provided: Option<&V::Item>) -> Decision {
        if provided.is_some() {
            Decision::Put
        } else {
            Decision::Remove
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PutDecision;

impl<K: KeyType, V: DataType> DecisionMaker<K, V> for PutDecision {
    fn decide(&mut self, _existing: Option<&V::Item>, _provided: Option<&V::Item>) -> Decision {
        Decision::Put
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveDecision;

impl<K: KeyType, V: DataType> DecisionMaker<K, V> for RemoveDecision {
    fn decide(&mut self, _existing: Option<&V::Item>, _provided: Option<&V::Item>) -> Decision {
        Decision::Remove
    }
}

/// Put only when the key is absent
#[derive(Debug, Clone, Copy, Default)]
pub struct IfAbsent;

impl<K: KeyType, V: DataType> DecisionMaker<K, V> for IfAbsent {
    fn decide(&mut self, existing: Option<&V::Item>, _provided: Option<&V::Item>) -> Decision {
        if existing.is_none() {
            Decision::Put
        } else {
            Decision::Abort
        }
    }
}

/// Put only when the key is present
#[derive(Debug, Clone, Copy, Default)]
pub struct IfPresent;

impl<K: KeyType, V: DataType> DecisionMaker<K, V> for IfPresent {
    fn decide(&mut self, existing: Option<&V::Item>, _provided: Option<&V::Item>) -> Decision {
        if existing.is_some() {
            Decision::Put
        } else {
            Decision::Abort
        }
    }
}

/// Write only when the stored value equals `expected` (`None`: absent)
#[derive(Debug, Clone)]
pub struct Equals<V: DataType> {
    expected: Option<V::Item>,
    decision: Option<Decision>,
}

impl<V: DataType> Equals<V> {
    pub fn new(expected: Option<V::Item>) -> Self {
        Self {
            expected,
            decision: None,
        }
    }

    /// Outcome of the last `decide`
    pub fn decision(&self) -> Option<Decision> {
        self.decision
    }
}

impl<K: KeyType, V: DataType> DecisionMaker<K, V> for Equals<V> {
    fn decide(&mut self, existing: Option<&V::Item>, provided: Option<&V::Item>) -> Decision {
        let decision = if existing == self.expected.as_ref() {
            if provided.is_none() {
                Decision::Remove
            } else {
                Decision::Put
            }
        } else {
            Decision::Abort
        };
        self.decision = Some(decision);
        decision
    }

    fn reset(&mut self) {
        self.decision = None;
    }
}

/// Re-put the existing value if the page at `pos` is still on the path
///
/// Used by compaction: rewriting an entry copies its leaf and every ancestor,
/// so the old page (and its chunk) stops being referenced.
#[derive(Debug, Clone)]
pub(crate) struct Rewrite {
    pos: u64,
    decision: Option<Decision>,
}

impl Rewrite {
    pub(crate) fn new(pos: u64) -> Self {
        Self { pos, decision: None }
    }

    pub(crate) fn decision(&self) -> Option<Decision> {
        self.decision
    }
}

impl<K: KeyType, V: DataType> DecisionMaker<K, V> for Rewrite {
    fn decide(&mut self, existing: Option<&V::Item>, _provided: Option<&V::Item>) -> Decision {
        let decision = if existing.is_none() {
            Decision::Abort
        } else {
            Decision::Put
        };
        self.decision = Some(decision);
        decision
    }

    fn decide_on_path(
        &mut self,
        existing: Option<&V::Item>,
        provided: Option<&V::Item>,
        path: &[CursorPos<K, V>],
    ) -> Decision {
        self.decision = Some(Decision::Abort);
        let on_path = match path.split_last() {
            Some((tip, ancestors)) => {
                if crate::codec::page_info::is_leaf(self.pos) {
                    tip.page.pos() == self.pos
                } else {
                    ancestors.iter().any(|p| p.page.pos() == self.pos)
                }
            }
            None => false,
        };
        if on_path {
            <Self as DecisionMaker<K, V>>::decide(self, existing, provided)
        } else {
            Decision::Abort
        }
    }

    fn select_value(&mut self, existing: Option<&V::Item>, _provided: Option<V::Item>) -> Option<V::Item> {
        existing.cloned()
    }

    fn reset(&mut self) {
        self.decision = None;
    }
}
