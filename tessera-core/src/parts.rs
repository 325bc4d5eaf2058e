//! Rendered tree ("parts"): the wire shape of one evaluated template.
//!
//! ```text
//! {
//!   "0": "escaped text"            ← dynamic slot: string
//!   "1": 3                         ← dynamic slot: nested stateful unit handle
//!   "2": { "s": [..], "0": .. }    ← dynamic slot: embedded template
//!   "s": ["<div>", "</div>", ..]   ← literal fragments (slots + 1)
//!   "d": [[..], [..]]              ← rows sharing one "s"
//!   "c": { "3": { .. } }           ← stateful unit trees by handle
//!   "t": "Page title"              ← title, only when it changed
//!   "e": [["event", {..}]]         ← queued client push-events
//! }
//! ```
//!
//! The struct keeps each reserved key in its own typed field; the numbered
//! slots live in a `BTreeMap` so they serialize in index order.

use std::collections::BTreeMap;

use serde::ser::{SerializeMap, SerializeTuple};
use serde::{Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Handle identifying a stateful nested unit for the life of a connection.
pub type Cid = u32;

/// Errors raised while decoding a rendered tree from JSON.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PartsError {
    #[error("expected a JSON object for a rendered tree")]
    NotAnObject,
    #[error("invalid value under key '{0}'")]
    InvalidValue(String),
    #[error("unknown key '{0}' in rendered tree")]
    UnknownKey(String),
}

/// Value held by a dynamic slot or a row cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    /// Escaped text (or a flattened single-fragment template).
    Str(String),
    /// Reference to a stateful nested unit delivered under `c`.
    Cid(Cid),
    /// Embedded, non-stateful sub-template.
    Tree(Parts),
}

impl From<&str> for Part {
    fn from(s: &str) -> Self {
        Part::Str(s.to_string())
    }
}

impl From<String> for Part {
    fn from(s: String) -> Self {
        Part::Str(s)
    }
}

impl From<Parts> for Part {
    fn from(p: Parts) -> Self {
        Part::Tree(p)
    }
}

/// A client push-event queued during a render cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub event: String,
    pub payload: Value,
}

impl PushEvent {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// A rendered tree, or a diff between two rendered trees.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Parts {
    /// Numbered dynamic slots
    pub slots: BTreeMap<usize, Part>,
    /// `s`: literal fragments
    pub statics: Option<Vec<String>>,
    /// `d`: rows of a homogeneous list
    pub rows: Option<Vec<Vec<Part>>>,
    /// `c`: stateful nested unit trees (top level only)
    pub components: BTreeMap<Cid, Parts>,
    /// `t`: page title
    pub title: Option<String>,
    /// `e`: client push-events
    pub events: Vec<PushEvent>,
}

impl Parts {
    /// Tree with the given fragments and no slots yet.
    pub fn with_statics<S: Into<String>>(statics: impl IntoIterator<Item = S>) -> Self {
        Self {
            statics: Some(statics.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Builder-style slot insertion.
    pub fn slot(mut self, index: usize, part: impl Into<Part>) -> Self {
        self.slots.insert(index, part.into());
        self
    }

    pub fn get(&self, index: usize) -> Option<&Part> {
        self.slots.get(&index)
    }

    /// Number of keys this tree would carry on the wire.
    pub fn key_count(&self) -> usize {
        self.slots.len()
            + usize::from(self.statics.is_some())
            + usize::from(self.rows.is_some())
            + usize::from(!self.components.is_empty())
            + usize::from(self.title.is_some())
            + usize::from(!self.events.is_empty())
    }

    /// True when the tree carries no keys at all (the empty diff).
    pub fn is_empty(&self) -> bool {
        self.key_count() == 0
    }

    /// Merge a diff produced by [`crate::diff::diff`] onto this client-side copy.
    ///
    /// A diff whose `s` has a different length than ours is a whole
    /// replacement subtree; an empty `s` replaces it with one that has no
    /// fragments. `t` and `e` describe the cycle that produced them and are
    /// not retained.
    pub fn merge(&mut self, diff: &Parts) {
        let replaces = match (&self.statics, &diff.statics) {
            (_, None) => false,
            (Some(ours), Some(theirs)) => ours.len() != theirs.len(),
            (None, Some(_)) => true,
        };

        if replaces {
            self.statics = diff.statics.clone().filter(|s| !s.is_empty());
            self.rows = diff.rows.clone();
            self.slots = diff.slots.clone();
        } else {
            if let Some(statics) = &diff.statics {
                self.statics = Some(statics.clone());
            }
            if let Some(rows) = &diff.rows {
                self.rows = Some(rows.clone());
                self.slots.clear();
            } else if !diff.slots.is_empty() {
                self.rows = None;
            }
            for (index, patch) in &diff.slots {
                match (self.slots.get_mut(index), patch) {
                    (Some(Part::Tree(existing)), Part::Tree(sub)) => existing.merge(sub),
                    _ => {
                        self.slots.insert(*index, patch.clone());
                    }
                }
            }
        }

        for (cid, patch) in &diff.components {
            match self.components.get_mut(cid) {
                Some(existing) => existing.merge(patch),
                None => {
                    self.components.insert(*cid, patch.clone());
                }
            }
        }
    }

    /// Rebuild the markup this tree describes, resolving handles through `c`.
    pub fn to_html(&self) -> String {
        self.render_with(&self.components)
    }

    fn render_with(&self, components: &BTreeMap<Cid, Parts>) -> String {
        let statics: &[String] = self.statics.as_deref().unwrap_or(&[]);
        match &self.rows {
            Some(rows) => rows
                .iter()
                .map(|row| interleave(statics, row.iter(), components))
                .collect(),
            None => interleave(statics, self.slots.values(), components),
        }
    }

    /// Decode a tree from its JSON encoding.
    pub fn from_value(value: &Value) -> Result<Self, PartsError> {
        let object = value.as_object().ok_or(PartsError::NotAnObject)?;
        let mut parts = Parts::default();

        for (key, entry) in object {
            let invalid = || PartsError::InvalidValue(key.clone());
            match key.as_str() {
                "s" => {
                    let fragments = entry
                        .as_array()
                        .ok_or_else(invalid)?
                        .iter()
                        .map(|f| f.as_str().map(str::to_string).ok_or_else(invalid))
                        .collect::<Result<Vec<_>, _>>()?;
                    parts.statics = Some(fragments);
                }
                "d" => {
                    let rows = entry
                        .as_array()
                        .ok_or_else(invalid)?
                        .iter()
                        .map(|row| {
                            row.as_array()
                                .ok_or_else(invalid)?
                                .iter()
                                .map(part_from_value)
                                .collect::<Result<Vec<_>, _>>()
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    parts.rows = Some(rows);
                }
                "c" => {
                    for (cid, tree) in entry.as_object().ok_or_else(invalid)? {
                        let cid: Cid = cid.parse().map_err(|_| invalid())?;
                        parts.components.insert(cid, Parts::from_value(tree)?);
                    }
                }
                "t" => parts.title = Some(entry.as_str().ok_or_else(invalid)?.to_string()),
                "e" => {
                    for pair in entry.as_array().ok_or_else(invalid)? {
                        match pair.as_array().map(Vec::as_slice) {
                            Some([Value::String(event), payload]) => {
                                parts.events.push(PushEvent::new(event.clone(), payload.clone()))
                            }
                            _ => return Err(invalid()),
                        }
                    }
                }
                other => {
                    let index: usize = other
                        .parse()
                        .map_err(|_| PartsError::UnknownKey(other.to_string()))?;
                    parts.slots.insert(index, part_from_value(entry)?);
                }
            }
        }

        Ok(parts)
    }
}

fn part_from_value(value: &Value) -> Result<Part, PartsError> {
    match value {
        Value::String(s) => Ok(Part::Str(s.clone())),
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| Cid::try_from(n).ok())
            .map(Part::Cid)
            .ok_or_else(|| PartsError::InvalidValue(n.to_string())),
        Value::Object(_) => Parts::from_value(value).map(Part::Tree),
        other => Err(PartsError::InvalidValue(other.to_string())),
    }
}

fn interleave<'a>(
    statics: &[String],
    parts: impl Iterator<Item = &'a Part>,
    components: &BTreeMap<Cid, Parts>,
) -> String {
    let mut out = String::new();
    let mut fragments = statics.iter();
    if let Some(first) = fragments.next() {
        out.push_str(first);
    }
    for part in parts {
        out.push_str(&render_part(part, components));
        if let Some(fragment) = fragments.next() {
            out.push_str(fragment);
        }
    }
    out
}

fn render_part(part: &Part, components: &BTreeMap<Cid, Parts>) -> String {
    match part {
        Part::Str(s) => s.clone(),
        Part::Cid(cid) => components
            .get(cid)
            .map(|tree| tree.render_with(components))
            .unwrap_or_default(),
        Part::Tree(tree) => tree.render_with(components),
    }
}

// ── Serialization ────────────────────────────────────────────────

impl Serialize for Part {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Part::Str(s) => serializer.serialize_str(s),
            Part::Cid(cid) => serializer.serialize_u32(*cid),
            Part::Tree(tree) => tree.serialize(serializer),
        }
    }
}

impl Serialize for PushEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut pair = serializer.serialize_tuple(2)?;
        pair.serialize_element(&self.event)?;
        pair.serialize_element(&self.payload)?;
        pair.end()
    }
}

impl Serialize for Parts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.key_count()))?;
        for (index, part) in &self.slots {
            map.serialize_entry(&index.to_string(), part)?;
        }
        if let Some(statics) = &self.statics {
            map.serialize_entry("s", statics)?;
        }
        if let Some(rows) = &self.rows {
            map.serialize_entry("d", rows)?;
        }
        if !self.components.is_empty() {
            let by_key: BTreeMap<String, &Parts> = self
                .components
                .iter()
                .map(|(cid, tree)| (cid.to_string(), tree))
                .collect();
            map.serialize_entry("c", &by_key)?;
        }
        if let Some(title) = &self.title {
            map.serialize_entry("t", title)?;
        }
        if !self.events.is_empty() {
            map.serialize_entry("e", &self.events)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counter(n: &str) -> Parts {
        Parts::with_statics(["<div>", "</div>"]).slot(0, n)
    }

    #[test]
    fn test_serialize_simple_tree() {
        let value = serde_json::to_value(counter("0")).unwrap();
        assert_eq!(value, json!({"0": "0", "s": ["<div>", "</div>"]}));
    }

    #[test]
    fn test_serialize_reserved_keys() {
        let mut parts = Parts::with_statics(["<main>", "</main>"]).slot(0, Part::Cid(1));
        parts.components.insert(1, counter("7"));
        parts.title = Some("Home".into());
        parts.events.push(PushEvent::new("highlight", json!({"id": 3})));

        let value = serde_json::to_value(&parts).unwrap();
        assert_eq!(
            value,
            json!({
                "0": 1,
                "s": ["<main>", "</main>"],
                "c": {"1": {"0": "7", "s": ["<div>", "</div>"]}},
                "t": "Home",
                "e": [["highlight", {"id": 3}]]
            })
        );
    }

    #[test]
    fn test_from_value_matches_serialize() {
        let mut parts = Parts::with_statics(["<ul>", "</ul>"]);
        let mut list = Parts::with_statics(["<li>", "</li>"]);
        list.rows = Some(vec![vec!["a".into()], vec!["b".into()]]);
        parts.slots.insert(0, Part::Tree(list));

        let value = serde_json::to_value(&parts).unwrap();
        let decoded = Parts::from_value(&value).unwrap();
        assert_eq!(decoded, parts);
    }

    #[test]
    fn test_from_value_rejects_unknown_key() {
        let err = Parts::from_value(&json!({"x": "1"})).unwrap_err();
        assert_eq!(err, PartsError::UnknownKey("x".into()));
        assert_eq!(Parts::from_value(&json!([1])).unwrap_err(), PartsError::NotAnObject);
    }

    #[test]
    fn test_key_count_and_empty() {
        assert!(Parts::default().is_empty());
        assert_eq!(counter("1").key_count(), 2);
        assert_eq!(Parts::default().slot(0, "x").key_count(), 1);
    }

    #[test]
    fn test_merge_scalar_leaf() {
        let mut client = counter("0");
        client.merge(&Parts::default().slot(0, "1"));
        assert_eq!(client, counter("1"));
    }

    #[test]
    fn test_merge_complete_replaces() {
        let mut client = Parts::with_statics(["a", "b", "c"]).slot(0, "x").slot(1, "y");
        let next = Parts::with_statics(["<p>", "</p>"]).slot(0, "z");
        client.merge(&next);
        assert_eq!(client, next);
    }

    #[test]
    fn test_merge_components_per_handle() {
        let mut client = Parts::with_statics(["", ""]).slot(0, Part::Cid(1));
        client.components.insert(1, counter("0"));

        let mut diff = Parts::default();
        diff.components.insert(1, Parts::default().slot(0, "5"));
        diff.components.insert(2, counter("9"));
        client.merge(&diff);

        assert_eq!(client.components[&1], counter("5"));
        assert_eq!(client.components[&2], counter("9"));
    }

    #[test]
    fn test_to_html_rows_and_components() {
        let mut list = Parts::with_statics(["<li>", "</li>"]);
        list.rows = Some(vec![vec!["a".into()], vec!["b".into()]]);
        let mut parts = Parts::with_statics(["<ul>", "</ul>", ""])
            .slot(0, Part::Tree(list))
            .slot(1, Part::Cid(4));
        parts.components.insert(4, counter("c"));

        assert_eq!(parts.to_html(), "<ul><li>a</li><li>b</li></ul><div>c</div>");
    }
}
