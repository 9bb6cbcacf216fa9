//! Immutable traversal position
//!
//! A `Context` records where the traversal engine currently stands: the root
//! being walked, the current node, the path from the root, a link to the
//! context one navigation level up, the key or index that produced it, and a
//! small write-once scratch map. Contexts are only created by the traversal
//! engine and are shared read-only through `Arc`.

use crate::errors::ExtractionError;
use crate::value::PathSegment;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Context<'a> {
    root: &'a Value,
    node: &'a Value,
    path: Vec<PathSegment>,
    parent: Option<Arc<Context<'a>>>,
    key: Option<String>,
    index: Option<usize>,
    slots: BTreeMap<String, Value>,
}

impl<'a> Context<'a> {
    /// The starting position of a pass: the root itself, with no parent
    pub(crate) fn root(root: &'a Value) -> Self {
        Context {
            root,
            node: root,
            path: Vec::new(),
            parent: None,
            key: None,
            index: None,
            slots: BTreeMap::new(),
        }
    }

    /// A new navigation level below `parent`, produced by iteration
    pub(crate) fn child(
        parent: &Arc<Context<'a>>,
        from: &Context<'a>,
        node: &'a Value,
        segment: Option<PathSegment>,
    ) -> Self {
        let mut path = from.path.clone();
        let (key, index) = match &segment {
            Some(PathSegment::Key(k)) => (Some(k.clone()), None),
            Some(PathSegment::Index(i)) => (None, Some(*i)),
            None => (None, None),
        };
        path.extend(segment);

        Context {
            root: from.root,
            node,
            path,
            parent: Some(Arc::clone(parent)),
            key,
            index,
            slots: from.slots.clone(),
        }
    }

    /// Same navigation level, moved down to `node` along `segments`
    pub(crate) fn descend(&self, node: &'a Value, segments: &[PathSegment]) -> Self {
        let mut moved = self.clone();
        moved.node = node;
        moved.path.extend(segments.iter().cloned());
        moved
    }

    /// Copy of this context with one more scratch binding
    ///
    /// Slots are write-once: binding a name twice fails.
    pub fn with_slot(&self, name: impl Into<String>, value: Value) -> Result<Self, ExtractionError> {
        let name = name.into();
        if self.slots.contains_key(&name) {
            return Err(ExtractionError::new(format!("slot '{}' is already bound", name)));
        }
        let mut bound = self.clone();
        bound.slots.insert(name, value);
        Ok(bound)
    }

    pub fn root_value(&self) -> &'a Value {
        self.root
    }

    pub fn node(&self) -> &'a Value {
        self.node
    }

    pub fn path(&self) -> &[PathSegment] {
        &self.path
    }

    pub fn parent(&self) -> Option<&Arc<Context<'a>>> {
        self.parent.as_ref()
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn slot(&self, name: &str) -> Option<&Value> {
        self.slots.get(name)
    }

    /// Walk `depth` parent links up; `depth == 0` is this context
    pub fn ancestor(&self, depth: usize) -> Option<&Context<'a>> {
        let mut current = self;
        for _ in 0..depth {
            current = current.parent.as_deref()?;
        }
        Some(current)
    }

    /// Number of parent links above this context
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self;
        while let Some(parent) = current.parent.as_deref() {
            depth += 1;
            current = parent;
        }
        depth
    }
}
