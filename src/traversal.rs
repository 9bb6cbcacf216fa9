//! Navigation programs and the lazy traversal engine
//!
//! A [`Program`] is a list of steps. [`traverse`] walks a tree with it
//! depth-first, left to right, yielding one [`Context`] per position the
//! program reaches. Descending moves within the current navigation level;
//! iterating opens a new level whose contexts point back at the level they
//! were iterated from.

use crate::context::Context;
use crate::errors::ErrorKind;
use crate::transform::Transform;
use crate::value::{self, display_path, IntoPath, PathSegment};
use serde_json::Value;
use std::sync::Arc;

/// How an iteration step treats the current node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterMode {
    /// Array elements or object entries; anything else is a type mismatch
    Items,
    /// The current node itself as the only element
    Single,
    /// `Items` for arrays and objects, `Single` otherwise
    Auto,
}

#[derive(Debug, Clone)]
pub enum Step {
    Descend {
        path: Vec<PathSegment>,
        /// A missing path yields nothing instead of an error
        optional: bool,
    },
    Iterate(IterMode),
    /// Evaluate a transform and keep the result in a context slot
    Bind { name: String, transform: Transform },
}

/// An ordered list of navigation steps
#[derive(Debug, Clone, Default)]
pub struct Program {
    steps: Vec<Step>,
}

impl Program {
    pub fn new() -> Self {
        Program { steps: Vec::new() }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn push(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn descend(self, path: impl IntoPath) -> Self {
        self.push(Step::Descend {
            path: path.into_path(),
            optional: false,
        })
    }

    /// Descend, treating a missing path as an empty iteration
    pub fn descend_optional(self, path: impl IntoPath) -> Self {
        self.push(Step::Descend {
            path: path.into_path(),
            optional: true,
        })
    }

    pub fn iterate(self, mode: IterMode) -> Self {
        self.push(Step::Iterate(mode))
    }

    /// Iterate whatever is there: elements, entries, or the node itself
    pub fn each(self) -> Self {
        self.iterate(IterMode::Auto)
    }

    pub fn items(self) -> Self {
        self.iterate(IterMode::Items)
    }

    pub fn single(self) -> Self {
        self.iterate(IterMode::Single)
    }

    pub fn bind(self, name: impl Into<String>, transform: Transform) -> Self {
        self.push(Step::Bind {
            name: name.into(),
            transform,
        })
    }
}

struct Frame<'a> {
    /// Context that opened the current navigation level
    level: Arc<Context<'a>>,
    current: Arc<Context<'a>>,
    step: usize,
}

/// Lazy depth-first walk over the positions a program reaches
pub struct Traverse<'a, 'p> {
    steps: &'p [Step],
    stack: Vec<Frame<'a>>,
}

/// Walk `root` with `program`, starting from the root context
pub fn traverse<'a, 'p>(root: &'a Value, program: &'p Program) -> Traverse<'a, 'p> {
    traverse_from(Arc::new(Context::root(root)), program)
}

/// Walk `program` starting at an existing context
///
/// Contexts produced by iteration use `start` as their parent.
pub fn traverse_from<'a, 'p>(start: Arc<Context<'a>>, program: &'p Program) -> Traverse<'a, 'p> {
    Traverse {
        steps: program.steps(),
        stack: vec![Frame {
            level: Arc::clone(&start),
            current: start,
            step: 0,
        }],
    }
}

impl<'a, 'p> Traverse<'a, 'p> {
    fn expand(&mut self, frame: Frame<'a>, mode: IterMode) -> Result<(), ErrorKind> {
        let node = frame.current.node();
        let mode = match (mode, node) {
            (IterMode::Auto, Value::Array(_) | Value::Object(_)) => IterMode::Items,
            (IterMode::Auto, _) => IterMode::Single,
            (mode, _) => mode,
        };

        let children: Vec<Context<'a>> = match (mode, node) {
            (IterMode::Items, Value::Array(arr)) => arr
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    Context::child(&frame.level, &frame.current, item, Some(PathSegment::Index(i)))
                })
                .collect(),
            (IterMode::Items, Value::Object(obj)) => obj
                .iter()
                .map(|(k, item)| {
                    Context::child(&frame.level, &frame.current, item, Some(PathSegment::Key(k.clone())))
                })
                .collect(),
            (IterMode::Items, other) => {
                return Err(ErrorKind::TypeMismatch {
                    at: display_path(frame.current.path()),
                    expected: "array or object".to_string(),
                    found: value::type_name(other).to_string(),
                });
            }
            _ => vec![Context::child(&frame.level, &frame.current, node, None)],
        };

        // Reversed so the first child is popped first
        for child in children.into_iter().rev() {
            let child = Arc::new(child);
            self.stack.push(Frame {
                level: Arc::clone(&child),
                current: child,
                step: frame.step + 1,
            });
        }
        Ok(())
    }
}

impl<'a, 'p> Iterator for Traverse<'a, 'p> {
    type Item = Result<Arc<Context<'a>>, ErrorKind>;

    fn next(&mut self) -> Option<Self::Item> {
        let steps = self.steps;
        loop {
            let frame = self.stack.pop()?;
            let Some(step) = steps.get(frame.step) else {
                return Some(Ok(frame.current));
            };

            match step {
                Step::Descend { path, optional } => {
                    match value::resolve(frame.current.node(), path) {
                        Ok(node) => {
                            let moved = Arc::new(frame.current.descend(node, path));
                            self.stack.push(Frame {
                                level: frame.level,
                                current: moved,
                                step: frame.step + 1,
                            });
                        }
                        Err(_) if *optional => continue,
                        Err(failed_at) => {
                            let mut full = frame.current.path().to_vec();
                            full.extend(path[..=failed_at].iter().cloned());
                            return Some(Err(ErrorKind::PathNotFound {
                                path: display_path(&full),
                            }));
                        }
                    }
                }
                Step::Iterate(mode) => {
                    if let Err(e) = self.expand(frame, *mode) {
                        return Some(Err(e));
                    }
                }
                Step::Bind { name, transform } => {
                    let bound = transform
                        .evaluate(&frame.current)
                        .and_then(|v| frame.current.with_slot(name.clone(), v));
                    match bound {
                        Ok(ctx) => {
                            let ctx = Arc::new(ctx);
                            let level = if Arc::ptr_eq(&frame.level, &frame.current) {
                                Arc::clone(&ctx)
                            } else {
                                frame.level
                            };
                            self.stack.push(Frame {
                                level,
                                current: ctx,
                                step: frame.step + 1,
                            });
                        }
                        Err(e) => return Some(Err(e.into())),
                    }
                }
            }
        }
    }
}
