//! Structural differ between two rendered trees of the same slot.
//!
//! Whenever the shape is uncertain (key count, fragment count, row count)
//! the differ sends the whole next subtree instead of a partial patch.
//! Removals are never emitted: a shrinking key set changes the key count and
//! falls back to the whole tree.
//!
//! Rows under `d` are compared as a unit. A change in any row resends all
//! rows; clients merge `d` wholesale.
//!
//! A tree with fragments that becomes a placeholder-only list (no `s`) is
//! sent whole with an empty `s`, so the client drops its old fragments.

use crate::parts::{Part, Parts};

/// Compute the smallest tree that, merged onto `old`, reproduces `new`.
pub fn diff(old: &Parts, new: &Parts) -> Parts {
    if old == new {
        return Parts::default();
    }
    if old.statics.is_some() && new.statics.is_none() {
        return Parts {
            statics: Some(Vec::new()),
            ..new.clone()
        };
    }
    if old.key_count() != new.key_count() {
        return new.clone();
    }

    let mut out = Parts::default();

    if let Some(next) = &new.statics {
        match &old.statics {
            Some(prev) if prev.len() != next.len() => return new.clone(),
            Some(prev) if arrays_equal(prev, next) => {}
            _ => out.statics = Some(next.clone()),
        }
    }

    if let Some(next) = &new.rows {
        let unchanged = old
            .rows
            .as_ref()
            .is_some_and(|prev| arrays_equal(prev, next));
        if !unchanged {
            out.rows = Some(next.clone());
        }
    }

    for (index, next) in &new.slots {
        let patch = match old.slots.get(index) {
            Some(prev) => diff_part(prev, next),
            None => Some(next.clone()),
        };
        if let Some(patch) = patch {
            out.slots.insert(*index, patch);
        }
    }

    for (cid, next) in &new.components {
        match old.components.get(cid) {
            Some(prev) => {
                let patch = diff(prev, next);
                if !patch.is_empty() {
                    out.components.insert(*cid, patch);
                }
            }
            None => {
                out.components.insert(*cid, next.clone());
            }
        }
    }

    if let Some(title) = &new.title {
        if old.title.as_ref() != Some(title) {
            out.title = Some(title.clone());
        }
    }

    if !new.events.is_empty() && new.events != old.events {
        out.events = new.events.clone();
    }

    out
}

fn diff_part(prev: &Part, next: &Part) -> Option<Part> {
    match (prev, next) {
        (Part::Str(a), Part::Str(b)) if a == b => None,
        (Part::Cid(a), Part::Cid(b)) if a == b => None,
        (Part::Tree(a), Part::Tree(b)) => {
            let patch = diff(a, b);
            (!patch.is_empty()).then_some(Part::Tree(patch))
        }
        _ => Some(next.clone()),
    }
}

/// Element-wise equality used by [`arrays_equal`].
pub trait SequenceElement {
    fn element_eq(&self, other: &Self) -> bool;
}

impl SequenceElement for String {
    fn element_eq(&self, other: &Self) -> bool {
        self == other
    }
}

impl SequenceElement for Part {
    fn element_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Part::Str(a), Part::Str(b)) => a == b,
            (Part::Cid(a), Part::Cid(b)) => a == b,
            (Part::Tree(a), Part::Tree(b)) => diff(a, b).is_empty(),
            _ => false,
        }
    }
}

impl<T: SequenceElement> SequenceElement for Vec<T> {
    fn element_eq(&self, other: &Self) -> bool {
        arrays_equal(self, other)
    }
}

/// Two sequences are equal when they have the same length and every pair of
/// elements is equal; trees compare equal when their diff is empty.
pub fn arrays_equal<T: SequenceElement>(a: &[T], b: &[T]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.element_eq(y))
}
