//! # Smelter - declarative tree-to-table normalization
//!
//! Turns nested JSON-like trees into flat, keyed relational tables. A mapping
//! spec says where to walk (navigation programs), what to compute at each
//! position (field transforms), how rows with the same join key merge, and how
//! child rows point at their parents.
//!
//! ## Modules
//!
//! - **traversal** / **context**: lazy walks over a tree, yielding positions
//! - **transform**: composable expressions evaluated at a position
//! - **field** / **table**: row evaluation and the keyed merge/join store
//! - **relationships**: child-to-parent binding and parent-first table order
//! - **pipeline**: the declarative spec and the `run` entry point
//! - **output**: builders for typed instances and JSON Lines persistence
//!
//! ## Quick Start
//!
//! ```rust
//! use smelter::prelude::*;
//! use serde_json::json;
//!
//! # fn main() -> anyhow::Result<()> {
//! let data = json!({
//!     "users": [
//!         {"id": "u1", "name": "Alice", "posts": [{"id": "p1", "title": "Hello"}]}
//!     ]
//! });
//!
//! let spec = MappingSpec::new()
//!     .traversal(
//!         Traversal::new(Program::new().descend("users").each())
//!             .emit(TableEmit::new("users").field("id", get("id")).field("name", get("name")).join_on(["id"]))
//!             .nest(
//!                 Traversal::new(Program::new().descend("posts").each()).emit(
//!                     TableEmit::new("posts")
//!                         .field("id", get("id"))
//!                         .field("user_id", get_from_parent("id", 1))
//!                         .field("title", get("title"))
//!                         .join_on(["id"]),
//!                 ),
//!             ),
//!     )
//!     .link(RelationshipBinding::new("posts", "users").on("user_id", "id"));
//!
//! let result = run_mapping(&data, spec)?;
//!
//! let posts = materialize(&result, "posts", &MapBuilder)?;
//! assert_eq!(posts[&JoinKey::from(vec!["p1"])]["user_id"], json!("u1"));
//! assert_eq!(result.order, vec!["users", "posts"]);
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use serde_json::Value;
use std::io::BufRead;

pub mod context;
pub mod errors;
pub mod field;
pub mod output;
pub mod pipeline;
pub mod relationships;
pub mod table;
pub mod transform;
pub mod traversal;
pub mod value;

// Re-export commonly used types for convenience
pub use context::Context as TraversalContext;
pub use errors::{ErrorKind, ErrorPolicy, ExtractionError, PipelineError};
pub use field::{FieldSpec, MergePolicy};
pub use output::{persist, InstanceBuilder, JsonlDirWriter, RecordSink, StreamWriter, DEFAULT_BATCH_SIZE};
pub use pipeline::{MappingSpec, Pipeline, PipelineConfig, PipelineResult, TableEmit, Traversal};
pub use relationships::{Link, RelationshipBinding};
pub use table::Row;
pub use transform::Transform;
pub use traversal::{IterMode, Program};
pub use value::{JoinKey, PathSegment};

/// Everything needed to write and run a mapping
pub mod prelude {
    pub use crate::errors::{ErrorKind, ErrorPolicy, PipelineError};
    pub use crate::field::{FieldSpec, MergePolicy};
    pub use crate::output::{
        materialize, materialize_all, persist, InstanceBuilder, JsonlDirWriter, MapBuilder, RecordBuilder,
        RecordSink, StreamWriter, TypedBuilder, ValidatedBuilder, DEFAULT_BATCH_SIZE,
    };
    pub use crate::pipeline::{MappingSpec, Pipeline, PipelineConfig, PipelineResult, TableEmit, Traversal};
    pub use crate::relationships::RelationshipBinding;
    pub use crate::transform::{
        coalesce, concat, factory, format_id, get, get_from_parent, get_from_root, get_or_null, index, key, len_of,
        literal, maybe, node, parent_index, parent_key, slot, Transform,
    };
    pub use crate::traversal::{IterMode, Program};
    pub use crate::value::JoinKey;
    pub use crate::{read_roots, run_mapping};
}

/// Run a mapping against a single root with the default configuration
pub fn run_mapping(root: &Value, spec: MappingSpec) -> Result<PipelineResult, PipelineError> {
    Pipeline::new(spec, PipelineConfig::default())?.run(std::slice::from_ref(root))
}

/// Read one root per line from a JSON Lines stream
///
/// Blank lines are skipped.
pub fn read_roots<R: BufRead>(reader: R) -> Result<Vec<Value>> {
    let mut roots = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read line")?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value =
            serde_json::from_str(&line).with_context(|| format!("Failed to parse JSON on line {}", number + 1))?;
        roots.push(value);
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_mapping_from_json_lines() {
        let input = "{\"id\": 1, \"tags\": [\"a\", \"b\"]}\n\n{\"id\": 2, \"tags\": [\"b\"]}\n";
        let roots = read_roots(input.as_bytes()).unwrap();
        assert_eq!(roots.len(), 2);

        let spec = MappingSpec::new()
            .traversal(
                Traversal::new(Program::new().descend("tags").each()).emit(
                    TableEmit::new("tags")
                        .field("name", node())
                        .merged("seen_in", get_from_parent("id", 1), MergePolicy::Append)
                        .join_on(["name"]),
                ),
            )
            .traversal(
                Traversal::new(Program::new().descend("tags").each())
                    .on_root(1)
                    .emit(TableEmit::new("tags").field("name", node()).merged("seen_in", get_from_parent("id", 1), MergePolicy::Append)),
            );
        let result = Pipeline::new(spec, PipelineConfig::default()).unwrap().run(&roots).unwrap();

        let b = result.row("tags", &JoinKey::from(vec!["b"])).unwrap();
        assert_eq!(b.fields["seen_in"], json!([1, 2]));
        assert_eq!(result.table("tags").unwrap().len(), 2);
    }

    #[test]
    fn test_read_roots_reports_bad_line() {
        let err = read_roots("{}\n{oops\n".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
