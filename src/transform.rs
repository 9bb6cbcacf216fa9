//! Lazy, composable value expressions evaluated against a [`Context`]
//!
//! Building a transform never touches data; evaluation happens only when the
//! row evaluator calls [`Transform::evaluate`].
//!
//! ```rust
//! use smelter::transform::{concat, get, get_from_parent, literal};
//!
//! let label = concat(vec![get_from_parent("id", 1), literal("/"), get("id")]);
//! assert_eq!(label.label(), "concat(get_from_parent(id, 1), literal(\"/\"), get(id))");
//! ```

use crate::context::Context;
use crate::errors::ExtractionError;
use crate::value::{self, display_path, IntoPath, PathSegment};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

type EvalFn = dyn for<'a> Fn(&Context<'a>) -> Result<Value, ExtractionError> + Send + Sync;

/// A named, cloneable expression from a context to a value
#[derive(Clone)]
pub struct Transform {
    label: Arc<str>,
    eval: Arc<EvalFn>,
}

impl Transform {
    /// Wrap a closure as a transform
    ///
    /// The closure must depend only on the context it is given.
    pub fn from_fn<F>(label: impl Into<String>, f: F) -> Self
    where
        F: for<'a> Fn(&Context<'a>) -> Result<Value, ExtractionError> + Send + Sync + 'static,
    {
        Transform {
            label: Arc::from(label.into()),
            eval: Arc::new(f),
        }
    }

    pub fn evaluate(&self, ctx: &Context<'_>) -> Result<Value, ExtractionError> {
        (*self.eval)(ctx)
    }

    /// Human-readable description used in error reports
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Transform").field(&self.label).finish()
    }
}

impl From<Value> for Transform {
    fn from(v: Value) -> Self {
        literal(v)
    }
}

impl From<&str> for Transform {
    fn from(s: &str) -> Self {
        literal(s)
    }
}

/// Build a transform factory with curried arguments
///
/// The returned function captures its argument at declaration time; the
/// context is supplied later when the transform is evaluated.
///
/// ```rust
/// use smelter::transform::factory;
/// use smelter::value::stringify;
/// use serde_json::Value;
///
/// let upper_field = factory("upper", |ctx, field: &String| {
///     Ok(Value::String(stringify(&ctx.node()[field.as_str()]).to_uppercase()))
/// });
/// let name = upper_field("name".to_string());
/// assert_eq!(name.label(), "upper(\"name\")");
/// ```
pub fn factory<A, F>(name: &'static str, f: F) -> impl Fn(A) -> Transform
where
    A: fmt::Debug + Send + Sync + 'static,
    F: for<'a> Fn(&Context<'a>, &A) -> Result<Value, ExtractionError> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    move |args: A| {
        let f = Arc::clone(&f);
        let label = format!("{}({:?})", name, args);
        Transform::from_fn(label, move |ctx| (*f)(ctx, &args))
    }
}

fn navigate(base: &Value, path: &[PathSegment], origin: &str) -> Result<Value, ExtractionError> {
    value::resolve(base, path).cloned().map_err(|failed_at| {
        ExtractionError::new(format!(
            "'{}' not found from {} (missing at '{}')",
            display_path(path),
            origin,
            display_path(&path[..=failed_at])
        ))
    })
}

/// Value at `path` below the current node; fails if absent
pub fn get(path: impl IntoPath) -> Transform {
    let path = path.into_path();
    let label = format!("get({})", display_path(&path));
    Transform::from_fn(label, move |ctx| navigate(ctx.node(), &path, "node"))
}

/// Like [`get`], but an absent path yields `null`
pub fn get_or_null(path: impl IntoPath) -> Transform {
    let path = path.into_path();
    let label = format!("get_or_null({})", display_path(&path));
    Transform::from_fn(label, move |ctx| {
        Ok(value::resolve(ctx.node(), &path).cloned().unwrap_or(Value::Null))
    })
}

/// Value at `path` below the root of the tree
pub fn get_from_root(path: impl IntoPath) -> Transform {
    let path = path.into_path();
    let label = format!("get_from_root({})", display_path(&path));
    Transform::from_fn(label, move |ctx| navigate(ctx.root_value(), &path, "root"))
}

fn ancestor<'c, 'a>(ctx: &'c Context<'a>, depth: usize) -> Result<&'c Context<'a>, ExtractionError> {
    ctx.ancestor(depth).ok_or_else(|| {
        ExtractionError::new(format!(
            "no ancestor {} levels up (context has {})",
            depth,
            ctx.depth()
        ))
    })
}

/// Value at `path` below the node `depth` navigation levels up
pub fn get_from_parent(path: impl IntoPath, depth: usize) -> Transform {
    let path = path.into_path();
    let label = format!("get_from_parent({}, {})", display_path(&path), depth);
    Transform::from_fn(label, move |ctx| {
        let parent = ancestor(ctx, depth)?;
        navigate(parent.node(), &path, "parent")
    })
}

fn key_at(ctx: &Context<'_>, depth: usize) -> Result<Value, ExtractionError> {
    let target = ancestor(ctx, depth)?;
    target
        .key()
        .map(|k| Value::String(k.to_string()))
        .ok_or_else(|| ExtractionError::new("context was not produced by keyed iteration"))
}

fn index_at(ctx: &Context<'_>, depth: usize) -> Result<Value, ExtractionError> {
    let target = ancestor(ctx, depth)?;
    target
        .index()
        .map(|i| Value::from(i as u64))
        .ok_or_else(|| ExtractionError::new("context was not produced by indexed iteration"))
}

/// Object key that produced the current context
pub fn key() -> Transform {
    Transform::from_fn("key()", |ctx| key_at(ctx, 0))
}

/// Array index that produced the current context
pub fn index() -> Transform {
    Transform::from_fn("index()", |ctx| index_at(ctx, 0))
}

pub fn parent_key(depth: usize) -> Transform {
    Transform::from_fn(format!("parent_key({})", depth), move |ctx| key_at(ctx, depth))
}

pub fn parent_index(depth: usize) -> Transform {
    Transform::from_fn(format!("parent_index({})", depth), move |ctx| index_at(ctx, depth))
}

/// The whole current subtree
pub fn node() -> Transform {
    Transform::from_fn("node()", |ctx| Ok(ctx.node().clone()))
}

pub fn literal(v: impl Into<Value>) -> Transform {
    let v = v.into();
    let label = format!("literal({})", v);
    Transform::from_fn(label, move |_| Ok(v.clone()))
}

/// Scratch value bound on the context by a traversal `bind` step
pub fn slot(name: impl Into<String>) -> Transform {
    let name = name.into();
    let label = format!("slot({})", name);
    Transform::from_fn(label, move |ctx| {
        ctx.slot(&name)
            .cloned()
            .ok_or_else(|| ExtractionError::new(format!("slot '{}' is not bound", name)))
    })
}

fn join_labels(parts: &[Transform]) -> String {
    parts.iter().map(Transform::label).collect::<Vec<_>>().join(", ")
}

/// String concatenation of every part; fails if any part fails
pub fn concat(parts: Vec<Transform>) -> Transform {
    let label = format!("concat({})", join_labels(&parts));
    Transform::from_fn(label, move |ctx| {
        let mut out = String::new();
        for part in &parts {
            out.push_str(&value::stringify(&part.evaluate(ctx)?));
        }
        Ok(Value::String(out))
    })
}

/// First alternative that neither fails nor yields null
pub fn coalesce(alternatives: Vec<Transform>) -> Transform {
    let label = format!("coalesce({})", join_labels(&alternatives));
    Transform::from_fn(label, move |ctx| {
        let mut last_error = None;
        for alternative in &alternatives {
            match alternative.evaluate(ctx) {
                Ok(Value::Null) => {}
                Ok(v) => return Ok(v),
                Err(e) => last_error = Some(e),
            }
        }
        Err(match last_error {
            Some(e) => ExtractionError::new(format!("every alternative failed or was null (last: {})", e)),
            None => ExtractionError::new("every alternative was null"),
        })
    })
}

/// Join the non-empty parts with `sep`; null, empty and failing parts are dropped
pub fn format_id(parts: Vec<Transform>, sep: impl Into<String>) -> Transform {
    let sep = sep.into();
    let label = format!("format_id({}; sep={:?})", join_labels(&parts), sep);
    Transform::from_fn(label, move |ctx| {
        let pieces: Vec<String> = parts
            .iter()
            .filter_map(|part| part.evaluate(ctx).ok())
            .map(|v| value::stringify(&v))
            .filter(|s| !s.is_empty())
            .collect();
        Ok(Value::String(pieces.join(&sep)))
    })
}

/// Length of a string, array or object; null for anything else
pub fn len_of(inner: Transform) -> Transform {
    let label = format!("len_of({})", inner.label());
    Transform::from_fn(label, move |ctx| {
        Ok(match inner.evaluate(ctx)? {
            Value::String(s) => Value::from(s.chars().count() as u64),
            Value::Array(arr) => Value::from(arr.len() as u64),
            Value::Object(obj) => Value::from(obj.len() as u64),
            _ => Value::Null,
        })
    })
}

/// Turn a failure of `inner` into null
pub fn maybe(inner: Transform) -> Transform {
    let label = format!("maybe({})", inner.label());
    Transform::from_fn(label, move |ctx| Ok(inner.evaluate(ctx).unwrap_or(Value::Null)))
}
