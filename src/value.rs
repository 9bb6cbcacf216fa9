//! Tree value helpers: path segments, path resolution, join keys, ordering
//!
//! The tree model itself is `serde_json::Value`. This module adds the pieces the
//! engine needs on top of it.

use crate::errors::ErrorKind;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

// One path token: a dotted name or a bracketed index
static SEGMENT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([^.\[\]]+)|\[(\d+)\]|(\[[^\]]*\]?)").unwrap()
});

/// One step of a path from the root of a tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => write!(f, "{}", k),
            PathSegment::Index(i) => write!(f, "[{}]", i),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(s: &str) -> Self {
        PathSegment::Key(s.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(s: String) -> Self {
        PathSegment::Key(s)
    }
}

impl From<usize> for PathSegment {
    fn from(i: usize) -> Self {
        PathSegment::Index(i)
    }
}

/// Render a path the way it would be written in dot notation
pub fn display_path(path: &[PathSegment]) -> String {
    let mut out = String::new();
    for segment in path {
        match segment {
            PathSegment::Key(k) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(k);
            }
            PathSegment::Index(i) => out.push_str(&format!("[{}]", i)),
        }
    }
    if out.is_empty() {
        out.push('$');
    }
    out
}

/// Parse a dot-notation path such as `users.0.name` or `users[0].name`
///
/// All-digit dotted segments become indices. Empty segments are ignored.
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>, ErrorKind> {
    let mut segments = Vec::new();
    let mut consumed = 0;

    for caps in SEGMENT_REGEX.captures_iter(path) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
        // Anything skipped between tokens must be separators
        if path[consumed..whole.start].chars().any(|c| c != '.') {
            return Err(ErrorKind::Configuration(format!("malformed path '{}'", path)));
        }
        consumed = whole.end;

        if let Some(name) = caps.get(1) {
            let name = name.as_str();
            if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
                match name.parse::<usize>() {
                    Ok(i) => segments.push(PathSegment::Index(i)),
                    Err(_) => segments.push(PathSegment::Key(name.to_string())),
                }
            } else {
                segments.push(PathSegment::Key(name.to_string()));
            }
        } else if let Some(index) = caps.get(2) {
            let i = index.as_str().parse::<usize>().map_err(|_| {
                ErrorKind::Configuration(format!("index out of range in path '{}'", path))
            })?;
            segments.push(PathSegment::Index(i));
        } else {
            return Err(ErrorKind::Configuration(format!("malformed path '{}'", path)));
        }
    }

    if path[consumed..].chars().any(|c| c != '.') {
        return Err(ErrorKind::Configuration(format!("malformed path '{}'", path)));
    }

    Ok(segments)
}

/// Anything that can name a path: dot notation or explicit segments
pub trait IntoPath {
    fn into_path(self) -> Vec<PathSegment>;
}

impl IntoPath for &str {
    /// Unparseable text is kept as a single literal key
    fn into_path(self) -> Vec<PathSegment> {
        parse_path(self).unwrap_or_else(|_| vec![PathSegment::Key(self.to_string())])
    }
}

impl IntoPath for String {
    fn into_path(self) -> Vec<PathSegment> {
        self.as_str().into_path()
    }
}

impl IntoPath for Vec<PathSegment> {
    fn into_path(self) -> Vec<PathSegment> {
        self
    }
}

impl IntoPath for &[PathSegment] {
    fn into_path(self) -> Vec<PathSegment> {
        self.to_vec()
    }
}

impl<const N: usize> IntoPath for [PathSegment; N] {
    fn into_path(self) -> Vec<PathSegment> {
        self.to_vec()
    }
}

/// Follow one segment from a value
pub fn step<'a>(value: &'a Value, segment: &PathSegment) -> Option<&'a Value> {
    match (value, segment) {
        (Value::Object(obj), PathSegment::Key(k)) => obj.get(k),
        // Numeric keys on objects are looked up by their text
        (Value::Object(obj), PathSegment::Index(i)) => obj.get(&i.to_string()),
        (Value::Array(arr), PathSegment::Index(i)) => arr.get(*i),
        _ => None,
    }
}

/// Follow a full path, returning the first segment that could not be resolved on failure
pub fn resolve<'a>(value: &'a Value, path: &[PathSegment]) -> Result<&'a Value, usize> {
    let mut current = value;
    for (position, segment) in path.iter().enumerate() {
        current = step(current, segment).ok_or(position)?;
    }
    Ok(current)
}

/// Short name for the shape of a value, used in error messages
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Text form used by string-building transforms
///
/// Strings are verbatim, null is empty, containers are compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Natural ordering used by the Min/Max merge policies
///
/// Returns `None` when the two values are not comparable.
pub fn natural_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return Some(x.cmp(&y));
            }
            if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                return Some(x.cmp(&y));
            }
            x.as_f64()?.partial_cmp(&y.as_f64()?)
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Null => 0u8.hash(state),
        Value::Bool(b) => {
            1u8.hash(state);
            b.hash(state);
        }
        Value::Number(n) => match n.as_f64().filter(|_| n.is_f64()) {
            // 0.0 and -0.0 compare equal
            Some(f) => {
                6u8.hash(state);
                let f = if f == 0.0 { 0.0f64 } else { f };
                f.to_bits().hash(state);
            }
            None => {
                2u8.hash(state);
                n.to_string().hash(state);
            }
        },
        Value::String(s) => {
            3u8.hash(state);
            s.hash(state);
        }
        Value::Array(arr) => {
            4u8.hash(state);
            arr.len().hash(state);
            for item in arr {
                hash_value(item, state);
            }
        }
        Value::Object(obj) => {
            // Object equality ignores entry order, so hashing must too
            5u8.hash(state);
            obj.len().hash(state);
            let mut entries: Vec<_> = obj.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (k, v) in entries {
                k.hash(state);
                hash_value(v, state);
            }
        }
    }
}

/// The tuple of join-key values identifying a row within a table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JoinKey(pub Vec<Value>);

impl JoinKey {
    pub fn new(parts: Vec<Value>) -> Self {
        JoinKey(parts)
    }

    /// The key used for errors that cannot be tied to a row
    pub fn unknown() -> Self {
        JoinKey(Vec::new())
    }

    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Hash for JoinKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for part in &self.0 {
            hash_value(part, state);
        }
    }
}

impl fmt::Display for JoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", part)?;
        }
        if self.0.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}

impl<V: Into<Value>> From<Vec<V>> for JoinKey {
    fn from(parts: Vec<V>) -> Self {
        JoinKey(parts.into_iter().map(Into::into).collect())
    }
}
