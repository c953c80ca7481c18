//! Virtual values: locally generated placeholders for server-produced data.
//!
//! A placeholder travels inside request payloads as a marker string:
//!
//! - `"[vdata-<ulid>]"`: the whole resolved value
//! - `"[vdata-<ulid>#/id]"`: a projection (JSON pointer) into the resolved value
//!
//! A marker may be the entire JSON string (replaced by the resolved JSON value,
//! whatever its type) or be embedded in a longer string such as a URL
//! (replaced by the resolved value's text form). The marker string is also the
//! dehydrated form, so a persisted payload carries everything needed to re-link
//! dependents after a restart.
//!
//! Projection pointers must not contain `]`.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use super::ids::{OperationId, VirtualId};

const MARKER_OPEN: &str = "[vdata-";

/// JSON pointer into a request descriptor or a resolved value.
///
/// The empty path addresses the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPath(String);

impl FieldPath {
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Parses a JSON pointer (`""` or `/a/b/0`).
    pub fn parse(pointer: &str) -> Option<Self> {
        if pointer.is_empty() || (pointer.starts_with('/') && !pointer.contains(']')) {
            Some(Self(pointer.to_string()))
        } else {
            None
        }
    }

    /// Appends one reference token, escaping `~` and `/`.
    pub fn push(&self, token: &str) -> Self {
        let escaped = token.replace('~', "~0").replace('/', "~1");
        Self(format!("{}/{}", self.0, escaped))
    }

    pub fn index(&self, index: usize) -> Self {
        Self(format!("{}/{}", self.0, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Parent path and the unescaped last token; `None` for the root.
    pub fn split_last(&self) -> Option<(FieldPath, String)> {
        let cut = self.0.rfind('/')?;
        let token = self.0[cut + 1..].replace("~1", "/").replace("~0", "~");
        Some((Self(self.0[..cut].to_string()), token))
    }

    /// Is `self` equal to `other` or nested below it?
    pub fn starts_with(&self, other: &FieldPath) -> bool {
        self.0 == other.0
            || (self.0.starts_with(other.0.as_str())
                && self.0.as_bytes().get(other.0.len()) == Some(&b'/'))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("/")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// A reference to a virtual value, optionally projected to one of its fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualRef {
    pub id: VirtualId,
    pub projection: FieldPath,
}

impl VirtualRef {
    pub fn new(id: VirtualId) -> Self {
        Self {
            id,
            projection: FieldPath::root(),
        }
    }

    pub fn projected(id: VirtualId, projection: FieldPath) -> Self {
        Self { id, projection }
    }

    /// Dehydrated marker text.
    pub fn marker(&self) -> String {
        if self.projection.is_root() {
            format!("[{}]", self.id)
        } else {
            format!("[{}#{}]", self.id, self.projection.as_str())
        }
    }

    /// Parses a string that consists of exactly one marker.
    pub fn parse_exact(s: &str) -> Option<Self> {
        let (found, start, end) = next_marker(s, 0)?;
        (start == 0 && end == s.len()).then_some(found)
    }

    /// Every marker embedded in `s`, in order of appearance.
    pub fn find_all(s: &str) -> Vec<Self> {
        let mut refs = Vec::new();
        let mut from = 0;
        while let Some((found, _, end)) = next_marker(s, from) {
            refs.push(found);
            from = end;
        }
        refs
    }

    /// Applies the projection to a resolved value. A missing field projects to `null`.
    pub fn project(&self, resolved: &Value) -> Value {
        if self.projection.is_root() {
            return resolved.clone();
        }
        resolved
            .pointer(self.projection.as_str())
            .cloned()
            .unwrap_or(Value::Null)
    }
}

impl fmt::Display for VirtualRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.marker())
    }
}

impl Serialize for VirtualRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.marker())
    }
}

/// Finds the next well-formed marker at or after byte `from`.
/// Returns the reference and its byte range.
fn next_marker(s: &str, from: usize) -> Option<(VirtualRef, usize, usize)> {
    let mut search = from;
    while let Some(rel) = s.get(search..)?.find(MARKER_OPEN) {
        let start = search + rel;
        let body_start = start + 1;
        let Some(close_rel) = s[body_start..].find(']') else {
            return None;
        };
        let end = body_start + close_rel + 1;
        let body = &s[body_start..end - 1];
        let (id_text, pointer) = match body.split_once('#') {
            Some((id, pointer)) => (id, pointer),
            None => (body, ""),
        };
        if let (Ok(id), Some(projection)) = (id_text.parse::<VirtualId>(), FieldPath::parse(pointer))
        {
            return Some((VirtualRef { id, projection }, start, end));
        }
        search = start + MARKER_OPEN.len();
    }
    None
}

/// Is this JSON value a placeholder marker (the whole value)?
pub fn is_virtual(value: &Value) -> bool {
    matches!(value, Value::String(s) if VirtualRef::parse_exact(s).is_some())
}

/// Walks `value` and records every marker with the path of the string holding it.
pub fn collect_refs(value: &Value, path: &FieldPath, out: &mut Vec<(VirtualRef, FieldPath)>) {
    match value {
        Value::String(s) => {
            for found in VirtualRef::find_all(s) {
                out.push((found, path.clone()));
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                collect_refs(item, &path.index(i), out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                collect_refs(item, &path.push(key), out);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

/// Text used when a resolved value is spliced into a larger string.
fn splice_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replaces every marker of `id` inside `value` with the (projected) resolved value.
/// Returns how many markers were replaced.
pub fn substitute(value: &mut Value, id: VirtualId, resolved: &Value) -> usize {
    match value {
        Value::String(s) => {
            if let Some(found) = VirtualRef::parse_exact(s) {
                if found.id == id {
                    *value = found.project(resolved);
                    return 1;
                }
                return 0;
            }
            let mut replaced = 0;
            let mut out = String::with_capacity(s.len());
            let mut cursor = 0;
            let mut from = 0;
            while let Some((found, start, end)) = next_marker(s, from) {
                if found.id == id {
                    out.push_str(&s[cursor..start]);
                    out.push_str(&splice_text(&found.project(resolved)));
                    cursor = end;
                    replaced += 1;
                }
                from = end;
            }
            if replaced > 0 {
                out.push_str(&s[cursor..]);
                *s = out;
            }
            replaced
        }
        Value::Array(items) => items
            .iter_mut()
            .map(|item| substitute(item, id, resolved))
            .sum(),
        Value::Object(map) => map
            .values_mut()
            .map(|item| substitute(item, id, resolved))
            .sum(),
        Value::Null | Value::Bool(_) | Value::Number(_) => 0,
    }
}

/// Rewrites the field at `path` for a resolved placeholder.
///
/// Markers of `id` inside the field are substituted in place. Otherwise the
/// whole resolved value is written at `path`, creating the last key of an
/// existing object. Returns how many locations changed.
pub fn rewrite_field(
    value: &mut Value,
    path: &FieldPath,
    id: VirtualId,
    resolved: &Value,
) -> usize {
    if let Some(current) = value.pointer_mut(path.as_str()) {
        let replaced = substitute(current, id, resolved);
        if replaced > 0 {
            return replaced;
        }
        *current = resolved.clone();
        return 1;
    }
    let Some((parent, key)) = path.split_last() else {
        return 0;
    };
    match value.pointer_mut(parent.as_str()) {
        Some(Value::Object(map)) => {
            map.insert(key, resolved.clone());
            1
        }
        _ => 0,
    }
}

/// One field of one operation waiting for a virtual value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dependent {
    pub operation_id: OperationId,
    pub path: FieldPath,
}

/// A placeholder for a value the server has not produced yet.
///
/// Serializes as its bare marker, so it can be dropped straight into
/// `serde_json::json!` payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualValue {
    pub id: VirtualId,

    /// Expected structure of the eventual value (objects/arrays of leaves).
    pub shape: Value,

    /// Set once, on resolution.
    pub resolved: Option<Value>,

    /// Back-references only; the registry owns the operations.
    pub dependents: BTreeSet<Dependent>,

    /// Operation whose response resolves this value, if any.
    pub producer: Option<OperationId>,
}

impl VirtualValue {
    pub fn new(id: VirtualId, shape: Value) -> Self {
        Self {
            id,
            shape,
            resolved: None,
            dependents: BTreeSet::new(),
            producer: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    pub fn reference(&self) -> VirtualRef {
        VirtualRef::new(self.id)
    }

    /// The bare marker as a JSON value.
    pub fn placeholder(&self) -> Value {
        Value::String(self.reference().marker())
    }

    /// Marker for one top-level field of the eventual value.
    pub fn field(&self, key: &str) -> Value {
        Value::String(VirtualRef::projected(self.id, FieldPath::root().push(key)).marker())
    }

    /// The shape with every leaf replaced by its projection marker, so callers
    /// can read fields optimistically before resolution.
    pub fn view(&self) -> Value {
        fn render(id: VirtualId, shape: &Value, path: &FieldPath) -> Value {
            match shape {
                Value::Object(map) => Value::Object(
                    map.iter()
                        .map(|(key, child)| (key.clone(), render(id, child, &path.push(key))))
                        .collect(),
                ),
                Value::Array(items) => Value::Array(
                    items
                        .iter()
                        .enumerate()
                        .map(|(i, child)| render(id, child, &path.index(i)))
                        .collect(),
                ),
                _ => Value::String(VirtualRef::projected(id, path.clone()).marker()),
            }
        }
        render(self.id, &self.shape, &FieldPath::root())
    }
}

impl Serialize for VirtualValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.reference().serialize(serializer)
    }
}
