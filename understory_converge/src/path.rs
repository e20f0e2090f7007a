// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Field paths and path-addressed access into a JSON document.
//!
//! Two spellings are in play:
//!
//! - **Declared / normalized paths** ([`FieldPath`]) name a field of the
//!   document shape. List markers and indices are dropped, so `items[].total`,
//!   `items[3].total` and `items.3.total` all normalize to `items.total`.
//! - **Concrete paths** (plain `&str`) address one value, with numeric
//!   segments indexing arrays: `items.3.total`. They are used with
//!   [`get_at`], [`set_at`] and [`remove_at`].

use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Declared spelling of the document root.
pub const ROOT_PATH: &str = "$root";

/// Marker that turns a declared path segment into a list-item scope.
pub const LIST_MARKER: &str = "[]";

/// Error returned for malformed declared paths.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid field path `{path}`: {reason}")]
pub struct PathError {
    /// The offending input.
    pub path: String,
    /// What is wrong with it.
    pub reason: &'static str,
}

/// A normalized field path (dot separated, no list markers, no indices).
///
/// The empty path is the document root.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPath(String);

impl FieldPath {
    /// The document root.
    #[must_use]
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Parses and normalizes a declared or concrete path.
    ///
    /// `$root` and the empty string denote the root.
    ///
    /// # Errors
    ///
    /// Fails on empty segments (`a..b`, leading/trailing dots) and on
    /// unbalanced list markers (`items[`).
    pub fn parse(input: &str) -> Result<Self, PathError> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed == ROOT_PATH {
            return Ok(Self::root());
        }
        let mut out = String::with_capacity(trimmed.len());
        for raw in trimmed.split('.') {
            let segment = strip_list_marker(raw).ok_or_else(|| PathError {
                path: input.to_owned(),
                reason: "unbalanced list marker",
            })?;
            if segment.is_empty() {
                if raw.is_empty() {
                    return Err(PathError {
                        path: input.to_owned(),
                        reason: "empty segment",
                    });
                }
                continue;
            }
            if is_index(segment) {
                continue;
            }
            if !out.is_empty() {
                out.push('.');
            }
            out.push_str(segment);
        }
        Ok(Self(out))
    }

    /// Returns `true` for the root path.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the normalized text (`""` for the root).
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates the segments (none for the root).
    pub fn segments(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.split('.').filter(|s| !s.is_empty())
    }

    /// Returns the number of segments.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Returns the parent path, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(match self.0.rfind('.') {
            Some(pos) => Self(self.0[..pos].to_owned()),
            None => Self::root(),
        })
    }

    /// Returns the non-root ancestors from the outermost inwards, excluding
    /// `self`.
    #[must_use]
    pub fn ancestors(&self) -> Vec<Self> {
        let mut out = Vec::new();
        let mut end = 0;
        while let Some(pos) = self.0[end..].find('.') {
            end += pos;
            out.push(Self(self.0[..end].to_owned()));
            end += 1;
        }
        out
    }

    /// Returns `true` if `self` is `other` or one of its ancestors.
    ///
    /// The root is a prefix of every path.
    #[must_use]
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        if self.is_root() {
            return true;
        }
        match other.0.strip_prefix(&self.0) {
            Some(rest) => rest.is_empty() || rest.starts_with('.'),
            None => false,
        }
    }

    /// Returns `true` if one path is a prefix of the other.
    ///
    /// Writing either path may change the value observed through the other.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }

    /// Appends a (normalized) relative path.
    #[must_use]
    pub fn join(&self, relative: &Self) -> Self {
        match (self.is_root(), relative.is_root()) {
            (_, true) => self.clone(),
            (true, false) => relative.clone(),
            (false, false) => Self(format!("{}.{}", self.0, relative.0)),
        }
    }
}

impl fmt::Debug for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldPath({self})")
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str(ROOT_PATH)
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Splits a declared list-item path at its list marker.
///
/// `items[].total` yields `("items", "total")` and `items[]` yields
/// `("items", "")`. Returns `None` when there is no marker.
#[must_use]
pub fn split_list_item(declared: &str) -> Option<(&str, &str)> {
    let pos = declared.find(LIST_MARKER)?;
    let list = &declared[..pos];
    let rest = &declared[pos + LIST_MARKER.len()..];
    Some((list, rest.strip_prefix('.').unwrap_or(rest)))
}

/// Counts list markers in a declared path.
#[must_use]
pub fn list_marker_count(declared: &str) -> usize {
    declared.matches(LIST_MARKER).count()
}

/// Joins two concrete path fragments with a dot, skipping empty sides.
#[must_use]
pub fn join_concrete(base: &str, tail: &str) -> String {
    match (base.is_empty(), tail.is_empty()) {
        (true, _) => tail.to_owned(),
        (false, true) => base.to_owned(),
        (false, false) => format!("{base}.{tail}"),
    }
}

/// Returns `true` if `path` names the root (`""` or `$root`).
#[must_use]
pub fn is_root_path(path: &str) -> bool {
    path.is_empty() || path == ROOT_PATH
}

fn is_index(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

/// Strips a trailing `[]` or `[n]` from a segment.
fn strip_list_marker(segment: &str) -> Option<&str> {
    match segment.find('[') {
        None if segment.contains(']') => None,
        None => Some(segment),
        Some(open) => {
            let inner = segment[open + 1..].strip_suffix(']')?;
            if inner.is_empty() || is_index(inner) {
                Some(&segment[..open])
            } else {
                None
            }
        }
    }
}

fn concrete_segments(path: &str) -> impl Iterator<Item = &str> + '_ {
    path.split('.').filter(|s| !s.is_empty())
}

/// Reads the value at a concrete path.
///
/// Numeric segments index arrays; `""` and `$root` return the root.
#[must_use]
pub fn get_at<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if is_root_path(path) {
        return Some(root);
    }
    let mut current = root;
    for segment in concrete_segments(path) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Mutable variant of [`get_at`].
pub fn get_at_mut<'a>(root: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    if is_root_path(path) {
        return Some(root);
    }
    let mut current = root;
    for segment in concrete_segments(path) {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Writes `value` at a concrete path, creating intermediate containers.
///
/// A missing intermediate becomes an array when the next segment is numeric
/// and an object otherwise. Non-container intermediates are replaced. An
/// array only grows by appending, so an index past its end is refused and
/// the value is left untouched. Returns `true` if the write happened.
pub fn set_at(root: &mut Value, path: &str, value: Value) -> bool {
    if is_root_path(path) {
        *root = value;
        return true;
    }
    let segments: Vec<&str> = concrete_segments(path).collect();
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return true;
    };
    if !writable(root, &segments) {
        return false;
    }
    let mut current = root;
    for (i, segment) in parents.iter().enumerate() {
        let next_is_index = is_index(segments[i + 1]);
        current = child_mut(current, segment, next_is_index);
    }
    match (current, last.parse::<usize>()) {
        (Value::Array(items), Ok(index)) => {
            if index == items.len() {
                items.push(value);
            } else {
                items[index] = value;
            }
        }
        (other, _) => {
            object_mut(other).insert((*last).to_owned(), value);
        }
    }
    true
}

/// Removes the value at a concrete path and returns it.
///
/// Object keys are removed; array elements are spliced out, so later rows
/// shift down by one.
pub fn remove_at(root: &mut Value, path: &str) -> Option<Value> {
    if is_root_path(path) {
        return Some(core::mem::take(root));
    }
    let (parent, last) = match path.rfind('.') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    };
    match get_at_mut(root, parent)? {
        Value::Object(map) => map.remove(last),
        Value::Array(items) => {
            let index = last.parse::<usize>().ok()?;
            (index < items.len()).then(|| items.remove(index))
        }
        _ => None,
    }
}

/// Checks that every array index along `segments` is at most one past the
/// end of the array it lands in, including arrays the write would create.
fn writable(root: &Value, segments: &[&str]) -> bool {
    let mut current = Some(root);
    for (i, segment) in segments.iter().enumerate() {
        current = match current {
            Some(Value::Array(items)) => match segment.parse::<usize>() {
                Ok(index) if index <= items.len() => items.get(index),
                Ok(_) => return false,
                Err(_) if is_index(segment) => return false,
                // A named segment turns the array into an object.
                Err(_) => None,
            },
            Some(Value::Object(map)) => map.get(*segment),
            // A scalar root is replaced by an object.
            Some(_) if i == 0 => None,
            // Missing or scalar children become an empty array before a
            // numeric segment.
            _ => {
                if is_index(segment) && segment.parse::<usize>() != Ok(0) {
                    return false;
                }
                None
            }
        };
    }
    true
}

fn child_mut<'a>(current: &'a mut Value, segment: &str, next_is_index: bool) -> &'a mut Value {
    match (current, segment.parse::<usize>()) {
        (Value::Array(items), Ok(index)) => {
            if index == items.len() {
                items.push(Value::Null);
            }
            let slot = &mut items[index];
            ensure_container(slot, next_is_index);
            slot
        }
        (other, _) => {
            let slot = object_mut(other)
                .entry(segment.to_owned())
                .or_insert(Value::Null);
            ensure_container(slot, next_is_index);
            slot
        }
    }
}

fn ensure_container(slot: &mut Value, as_array: bool) {
    let fits = if as_array {
        slot.is_array() || slot.is_object()
    } else {
        slot.is_object()
    };
    if !fits {
        *slot = if as_array {
            Value::Array(Vec::new())
        } else {
            Value::Object(Map::new())
        };
    }
}

fn object_mut(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was replaced with an object above"),
    }
}
