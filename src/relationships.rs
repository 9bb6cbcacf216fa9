//! Child-to-parent row binding and dependency ordering of tables

use crate::errors::{ErrorKind, PipelineError};
use crate::table::{Table, TableStore};
use crate::value::JoinKey;
use serde::Serialize;
use serde_json::Value;

/// Declares that child rows point at parent rows through matching field values
///
/// ```rust
/// use smelter::relationships::RelationshipBinding;
///
/// let posts_to_users = RelationshipBinding::new("posts", "users").on("user_id", "id");
/// assert_eq!(posts_to_users.by, vec![("user_id".to_string(), "id".to_string())]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipBinding {
    pub child_table: String,
    pub parent_table: String,
    /// (child field, parent key field) pairs
    pub by: Vec<(String, String)>,
}

impl RelationshipBinding {
    pub fn new(child_table: impl Into<String>, parent_table: impl Into<String>) -> Self {
        RelationshipBinding {
            child_table: child_table.into(),
            parent_table: parent_table.into(),
            by: Vec::new(),
        }
    }

    pub fn on(mut self, child_field: impl Into<String>, parent_field: impl Into<String>) -> Self {
        self.by.push((child_field.into(), parent_field.into()));
        self
    }
}

/// One resolved child → parent binding
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Link {
    pub child_table: String,
    pub child_key: JoinKey,
    pub parent_table: String,
    pub parent_key: JoinKey,
}

#[derive(Debug, Default)]
pub struct Resolution {
    pub links: Vec<Link>,
    /// Non-fatal `UnresolvedRelationship` errors, one per unbound child row
    pub errors: Vec<PipelineError>,
}

/// Child field names ordered to line up with the parent's canonical key
pub fn child_fields_in_key_order(
    binding: &RelationshipBinding,
    parent_key_fields: &[String],
) -> Result<Vec<String>, ErrorKind> {
    let covers_key = binding.by.len() == parent_key_fields.len()
        && parent_key_fields
            .iter()
            .all(|k| binding.by.iter().filter(|(_, p)| p == k).count() == 1);
    if !covers_key {
        let declared: Vec<&str> = binding.by.iter().map(|(_, p)| p.as_str()).collect();
        return Err(ErrorKind::configuration(format!(
            "binding {} -> {} must map exactly the parent key [{}], got [{}]",
            binding.child_table,
            binding.parent_table,
            parent_key_fields.join(", "),
            declared.join(", ")
        )));
    }

    Ok(parent_key_fields
        .iter()
        .filter_map(|k| binding.by.iter().find(|(_, p)| p == k).map(|(c, _)| c.clone()))
        .collect())
}

fn lookup<'s>(store: &'s TableStore, name: &str) -> Result<&'s Table, PipelineError> {
    store.table(name).ok_or_else(|| {
        PipelineError::fatal(ErrorKind::configuration(format!(
            "relationship refers to unknown table '{}'",
            name
        )))
    })
}

/// Bind every child row of every binding to its parent row
///
/// Unknown tables or a binding that does not cover the parent key are fatal.
/// Children whose binding fields are missing or null stay unbound silently.
pub fn bind(bindings: &[RelationshipBinding], store: &TableStore) -> Result<Resolution, PipelineError> {
    let mut resolution = Resolution::default();

    for binding in bindings {
        let child = lookup(store, &binding.child_table)?;
        let parent = lookup(store, &binding.parent_table)?;
        let child_fields =
            child_fields_in_key_order(binding, parent.key_fields()).map_err(PipelineError::fatal)?;

        for (child_key, row) in child.rows() {
            let values: Option<Vec<Value>> = child_fields
                .iter()
                .map(|f| row.get(f).filter(|v| !v.is_null()).cloned())
                .collect();
            let Some(values) = values else {
                log::debug!(
                    "{} row {} has no value for its {} binding; left unbound",
                    binding.child_table,
                    child_key,
                    binding.parent_table
                );
                continue;
            };

            let parent_key = JoinKey::new(values);
            if parent.get(&parent_key).is_some() {
                resolution.links.push(Link {
                    child_table: binding.child_table.clone(),
                    child_key: child_key.clone(),
                    parent_table: binding.parent_table.clone(),
                    parent_key,
                });
            } else {
                resolution.errors.push(
                    PipelineError::new(
                        binding.child_table.clone(),
                        ErrorKind::UnresolvedRelationship {
                            parent_table: binding.parent_table.clone(),
                            parent_key,
                        },
                    )
                    .with_key(child_key.clone()),
                );
            }
        }
    }

    Ok(resolution)
}

/// Order tables so every parent comes before its children
///
/// Ties keep the order of `tables`. Any cycle, including a table bound to
/// itself, is an error listing the tables that could not be ordered.
pub fn emission_order(tables: &[String], bindings: &[RelationshipBinding]) -> Result<Vec<String>, ErrorKind> {
    let position = |name: &str| tables.iter().position(|t| t == name);

    let mut edges = Vec::with_capacity(bindings.len());
    for binding in bindings {
        let (Some(parent), Some(child)) = (position(&binding.parent_table), position(&binding.child_table)) else {
            return Err(ErrorKind::configuration(format!(
                "binding {} -> {} refers to an unknown table",
                binding.child_table, binding.parent_table
            )));
        };
        edges.push((parent, child));
    }

    let mut in_degree = vec![0usize; tables.len()];
    for &(_, child) in &edges {
        in_degree[child] += 1;
    }

    let mut placed = vec![false; tables.len()];
    let mut order = Vec::with_capacity(tables.len());
    while let Some(next) = (0..tables.len()).find(|&i| !placed[i] && in_degree[i] == 0) {
        placed[next] = true;
        order.push(tables[next].clone());
        for &(parent, child) in &edges {
            if parent == next {
                in_degree[child] -= 1;
            }
        }
    }

    if order.len() < tables.len() {
        let stuck = tables
            .iter()
            .zip(&placed)
            .filter(|(_, done)| !**done)
            .map(|(t, _)| t.clone())
            .collect();
        return Err(ErrorKind::RelationshipCycle { tables: stuck });
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{CandidateRow, CandidateValue, MergePolicy};
    use serde_json::json;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn insert(store: &mut TableStore, table: &str, key: Value, fields: &[(&str, Value, bool)]) {
        let values = fields
            .iter()
            .map(|(name, value, persisted)| CandidateValue {
                name: name.to_string(),
                value: value.clone(),
                persisted: *persisted,
                merge: MergePolicy::Overwrite,
            })
            .collect();
        let problems = store.upsert(
            table,
            CandidateRow {
                key: JoinKey::new(vec![key]),
                values,
            },
        );
        assert!(problems.is_empty());
    }

    fn blog_store() -> TableStore {
        let mut store = TableStore::new();
        store.declare("users", &names(&["id"])).unwrap();
        store.declare("posts", &names(&["id"])).unwrap();
        insert(&mut store, "users", json!("u1"), &[("id", json!("u1"), true)]);
        insert(&mut store, "posts", json!("p1"), &[("id", json!("p1"), true), ("user_id", json!("u1"), false)]);
        insert(&mut store, "posts", json!("p2"), &[("id", json!("p2"), true), ("user_id", json!("u9"), false)]);
        insert(&mut store, "posts", json!("p3"), &[("id", json!("p3"), true), ("user_id", Value::Null, false)]);
        store
    }

    #[test]
    fn test_bind_resolves_and_reports_missing_parents() {
        let store = blog_store();
        let bindings = vec![RelationshipBinding::new("posts", "users").on("user_id", "id")];
        let resolution = bind(&bindings, &store).unwrap();

        assert_eq!(
            resolution.links,
            vec![Link {
                child_table: "posts".into(),
                child_key: JoinKey::from(vec!["p1"]),
                parent_table: "users".into(),
                parent_key: JoinKey::from(vec!["u1"]),
            }]
        );
        // p2 points at a user that does not exist; p3 has no user at all
        assert_eq!(resolution.errors.len(), 1);
        assert_eq!(resolution.errors[0].row_key, Some(JoinKey::from(vec!["p2"])));
        assert!(matches!(resolution.errors[0].kind, ErrorKind::UnresolvedRelationship { .. }));
    }

    #[test]
    fn test_bind_rejects_partial_parent_key() {
        let store = blog_store();
        let bindings = vec![RelationshipBinding::new("posts", "users").on("user_id", "email")];
        let err = bind(&bindings, &store).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Configuration(_)));

        let unknown = vec![RelationshipBinding::new("posts", "teams").on("team_id", "id")];
        assert!(bind(&unknown, &store).is_err());
    }

    #[test]
    fn test_child_fields_follow_parent_key_order() {
        let binding = RelationshipBinding::new("c", "p").on("b_ref", "b").on("a_ref", "a");
        assert_eq!(
            child_fields_in_key_order(&binding, &names(&["a", "b"])).unwrap(),
            names(&["a_ref", "b_ref"])
        );
    }

    #[test]
    fn test_emission_order_parents_first() {
        let tables = names(&["comments", "posts", "tags", "users"]);
        let bindings = vec![
            RelationshipBinding::new("comments", "posts").on("post_id", "id"),
            RelationshipBinding::new("posts", "users").on("user_id", "id"),
        ];
        assert_eq!(
            emission_order(&tables, &bindings).unwrap(),
            names(&["tags", "users", "posts", "comments"])
        );
    }

    #[test]
    fn test_emission_order_detects_cycles() {
        let tables = names(&["a", "b", "c"]);
        let bindings = vec![
            RelationshipBinding::new("a", "b").on("b_id", "id"),
            RelationshipBinding::new("b", "a").on("a_id", "id"),
        ];
        assert_eq!(
            emission_order(&tables, &bindings),
            Err(ErrorKind::RelationshipCycle { tables: names(&["a", "b"]) })
        );

        let self_ref = vec![RelationshipBinding::new("c", "c").on("parent_id", "id")];
        assert!(emission_order(&tables, &self_ref).is_err());
    }
}
