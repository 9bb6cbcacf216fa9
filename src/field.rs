//! Field specs, merge policies, and the row evaluator

use crate::context::Context;
use crate::errors::{ErrorKind, ExtractionError};
use crate::transform::Transform;
use crate::value::{self, JoinKey};
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::fmt;

/// How a field combines values when several emissions hit the same row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MergePolicy {
    /// Last writer wins
    #[default]
    Overwrite,
    /// Numeric sum
    Add,
    /// Collect every value into an array
    Append,
    /// Concatenate arrays
    Extend,
    /// Smaller value by natural ordering; on a tie the stored value is kept,
    /// so `1` then `1.0` stays `1`
    Min,
    /// Larger value by natural ordering; ties keep the stored value
    Max,
    /// Keep the first non-null value
    FirstNonNull,
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergePolicy::Overwrite => "overwrite",
            MergePolicy::Add => "add",
            MergePolicy::Append => "append",
            MergePolicy::Extend => "extend",
            MergePolicy::Min => "min",
            MergePolicy::Max => "max",
            MergePolicy::FirstNonNull => "first_non_null",
        };
        f.write_str(name)
    }
}

fn mismatch(field: &str, expected: &str, found: &Value) -> ErrorKind {
    ErrorKind::TypeMismatch {
        at: format!("field '{}'", field),
        expected: expected.to_string(),
        found: value::type_name(found).to_string(),
    }
}

fn add_numbers(field: &str, old: &Value, new: &Value) -> Result<Value, ErrorKind> {
    let (Value::Number(a), Value::Number(b)) = (old, new) else {
        let offender = if old.is_number() { new } else { old };
        return Err(mismatch(field, "number", offender));
    };

    if let Some(sum) = a.as_i64().zip(b.as_i64()).and_then(|(x, y)| x.checked_add(y)) {
        return Ok(Value::from(sum));
    }
    if let Some(sum) = a.as_u64().zip(b.as_u64()).and_then(|(x, y)| x.checked_add(y)) {
        return Ok(Value::from(sum));
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| ErrorKind::Extraction(format!("field '{}': sum is not a finite number", field)))
}

impl MergePolicy {
    /// Combine a previously stored value (if any) with a new one
    ///
    /// `old` is `None` the first time a row sees the field.
    pub fn merge(&self, field: &str, old: Option<&Value>, new: Value) -> Result<Value, ErrorKind> {
        let old = old.filter(|v| !v.is_null());

        match self {
            MergePolicy::Overwrite => Ok(new),
            MergePolicy::FirstNonNull => Ok(old.cloned().unwrap_or(new)),
            MergePolicy::Add => match old {
                None => Ok(new),
                Some(old) if new.is_null() => Ok(old.clone()),
                Some(old) => add_numbers(field, old, &new),
            },
            MergePolicy::Append => Ok(match old {
                None => Value::Array(vec![new]),
                Some(Value::Array(items)) => {
                    let mut items = items.clone();
                    items.push(new);
                    Value::Array(items)
                }
                Some(scalar) => Value::Array(vec![scalar.clone(), new]),
            }),
            MergePolicy::Extend => {
                let more = match new {
                    Value::Array(more) => more,
                    Value::Null => Vec::new(),
                    other => return Err(mismatch(field, "array", &other)),
                };
                let mut items = match old {
                    None => Vec::new(),
                    Some(Value::Array(items)) => items.clone(),
                    Some(scalar) => vec![scalar.clone()],
                };
                items.extend(more);
                Ok(Value::Array(items))
            }
            MergePolicy::Min | MergePolicy::Max => {
                let Some(old) = old else {
                    return Ok(new);
                };
                if new.is_null() {
                    return Ok(old.clone());
                }
                let ordering = value::natural_cmp(old, &new).ok_or_else(|| ErrorKind::TypeMismatch {
                    at: format!("field '{}'", field),
                    expected: value::type_name(old).to_string(),
                    found: value::type_name(&new).to_string(),
                })?;
                let keep_old = match self {
                    MergePolicy::Min => ordering != Ordering::Greater,
                    _ => ordering != Ordering::Less,
                };
                Ok(if keep_old { old.clone() } else { new })
            }
        }
    }
}

/// A named output column computed by a transform
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub transform: Transform,
    /// Temporary fields take part in keys and relationships but are never materialized
    pub persisted: bool,
    pub merge: MergePolicy,
}

impl FieldSpec {
    /// A persisted field
    pub fn new(name: impl Into<String>, transform: impl Into<Transform>) -> Self {
        FieldSpec {
            name: name.into(),
            transform: transform.into(),
            persisted: true,
            merge: MergePolicy::Overwrite,
        }
    }

    /// A temporary field, used for joining and linking only
    pub fn temp(name: impl Into<String>, transform: impl Into<Transform>) -> Self {
        FieldSpec {
            persisted: false,
            ..FieldSpec::new(name, transform)
        }
    }

    pub fn with_merge(mut self, merge: MergePolicy) -> Self {
        self.merge = merge;
        self
    }
}

/// One evaluated field of a candidate row
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateValue {
    pub name: String,
    pub value: Value,
    pub persisted: bool,
    pub merge: MergePolicy,
}

/// A row ready to be merged into a table
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRow {
    pub key: JoinKey,
    /// In field-list order; failed fields are left out
    pub values: Vec<CandidateValue>,
}

/// A field whose transform failed
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFailure {
    pub field: String,
    pub transform: String,
    pub error: ExtractionError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Built {
        row: CandidateRow,
        failures: Vec<FieldFailure>,
    },
    /// The join key could not be computed; nothing is merged or reported
    Skipped { reason: String },
}

fn key_part_missing(v: &Value, empty_is_missing: bool) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => empty_is_missing && s.is_empty(),
        _ => false,
    }
}

/// Evaluate every field against `ctx` and assemble a candidate row
///
/// Each transform is evaluated exactly once. `join_on` names the fields whose
/// values form the key; when a name appears more than once, the last field with
/// that name is used.
pub fn build_row(
    ctx: &Context<'_>,
    fields: &[FieldSpec],
    join_on: &[String],
    empty_key_is_missing: bool,
) -> RowOutcome {
    let results: Vec<Result<Value, ExtractionError>> =
        fields.iter().map(|f| f.transform.evaluate(ctx)).collect();

    let mut key_parts = Vec::with_capacity(join_on.len());
    for name in join_on {
        let Some(position) = fields.iter().rposition(|f| &f.name == name) else {
            return RowOutcome::Skipped {
                reason: format!("join key field '{}' is not declared", name),
            };
        };
        match &results[position] {
            Ok(v) if !key_part_missing(v, empty_key_is_missing) => key_parts.push(v.clone()),
            Ok(_) => {
                return RowOutcome::Skipped {
                    reason: format!("join key field '{}' is empty", name),
                }
            }
            Err(e) => {
                return RowOutcome::Skipped {
                    reason: format!("join key field '{}' failed: {}", name, e),
                }
            }
        }
    }

    let mut values = Vec::with_capacity(fields.len());
    let mut failures = Vec::new();
    for (spec, result) in fields.iter().zip(results) {
        match result {
            Ok(value) => values.push(CandidateValue {
                name: spec.name.clone(),
                value,
                persisted: spec.persisted,
                merge: spec.merge,
            }),
            Err(error) => failures.push(FieldFailure {
                field: spec.name.clone(),
                transform: spec.transform.label().to_string(),
                error,
            }),
        }
    }

    RowOutcome::Built {
        row: CandidateRow {
            key: JoinKey::new(key_parts),
            values,
        },
        failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{get, get_or_null, literal};
    use crate::traversal::{traverse, Program};
    use serde_json::json;

    fn merge(policy: MergePolicy, old: Option<Value>, new: Value) -> Result<Value, ErrorKind> {
        policy.merge("f", old.as_ref(), new)
    }

    #[test]
    fn test_overwrite_and_first_non_null() {
        assert_eq!(merge(MergePolicy::Overwrite, Some(json!("a")), json!("b")).unwrap(), json!("b"));
        assert_eq!(merge(MergePolicy::FirstNonNull, Some(json!("a")), json!("b")).unwrap(), json!("a"));
        assert_eq!(merge(MergePolicy::FirstNonNull, Some(Value::Null), json!("b")).unwrap(), json!("b"));
        assert_eq!(merge(MergePolicy::FirstNonNull, None, Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn test_add() {
        assert_eq!(merge(MergePolicy::Add, None, json!(1)).unwrap(), json!(1));
        assert_eq!(merge(MergePolicy::Add, Some(json!(1)), json!(2)).unwrap(), json!(3));
        assert_eq!(merge(MergePolicy::Add, Some(json!(1.5)), json!(2)).unwrap(), json!(3.5));
        assert_eq!(merge(MergePolicy::Add, Some(json!(4)), Value::Null).unwrap(), json!(4));
        assert!(matches!(
            merge(MergePolicy::Add, Some(json!(1)), json!("x")),
            Err(ErrorKind::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_append_and_extend() {
        assert_eq!(merge(MergePolicy::Append, None, json!("a")).unwrap(), json!(["a"]));
        assert_eq!(merge(MergePolicy::Append, Some(json!(["a"])), json!("b")).unwrap(), json!(["a", "b"]));
        assert_eq!(merge(MergePolicy::Append, Some(json!("a")), json!("b")).unwrap(), json!(["a", "b"]));

        assert_eq!(merge(MergePolicy::Extend, None, json!([1, 2])).unwrap(), json!([1, 2]));
        assert_eq!(merge(MergePolicy::Extend, Some(json!([1])), json!([2, 3])).unwrap(), json!([1, 2, 3]));
        assert!(merge(MergePolicy::Extend, Some(json!([1])), json!(2)).is_err());
    }

    #[test]
    fn test_min_max() {
        assert_eq!(merge(MergePolicy::Min, Some(json!(3)), json!(1)).unwrap(), json!(1));
        assert_eq!(merge(MergePolicy::Max, Some(json!(3)), json!(1)).unwrap(), json!(3));
        assert_eq!(merge(MergePolicy::Max, Some(json!("apple")), json!("pear")).unwrap(), json!("pear"));
        assert_eq!(merge(MergePolicy::Min, None, json!(7)).unwrap(), json!(7));
        assert_eq!(merge(MergePolicy::Min, Some(json!(7)), Value::Null).unwrap(), json!(7));
        assert!(merge(MergePolicy::Min, Some(json!(7)), json!("7")).is_err());

        // equal values keep whichever representation arrived first
        assert_eq!(merge(MergePolicy::Min, Some(json!(1)), json!(1.0)).unwrap(), json!(1));
        assert_eq!(merge(MergePolicy::Max, Some(json!(1.0)), json!(1)).unwrap(), json!(1.0));
    }

    #[test]
    fn test_commutative_policies_ignore_order() {
        let values = [json!(4), json!(-2), json!(9), json!(1)];
        for policy in [MergePolicy::Add, MergePolicy::Min, MergePolicy::Max] {
            let fold = |vals: &[Value]| {
                vals.iter().fold(None, |acc: Option<Value>, v| {
                    Some(policy.merge("f", acc.as_ref(), v.clone()).unwrap())
                })
            };
            let mut reversed = values.to_vec();
            reversed.reverse();
            assert_eq!(fold(&values[..]), fold(&reversed[..]), "policy {}", policy);
        }
    }

    #[test]
    fn test_build_row_splits_key_and_failures() {
        let data = json!({"users": [{"id": "u1", "name": "Alice"}]});
        let program = Program::new().descend("users").items();
        let ctx = traverse(&data, &program).next().unwrap().unwrap();

        let fields = vec![
            FieldSpec::temp("id", get("id")),
            FieldSpec::new("name", get("name")),
            FieldSpec::new("email", get("email")),
            FieldSpec::new("source", literal("import")),
        ];
        let RowOutcome::Built { row, failures } = build_row(&ctx, &fields, &["id".to_string()], true) else {
            panic!("row should be built");
        };

        assert_eq!(row.key, JoinKey::from(vec!["u1"]));
        let names: Vec<&str> = row.values.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name", "source"]);
        assert!(!row.values[0].persisted);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].field, "email");
        assert_eq!(failures[0].transform, "get(email)");
    }

    #[test]
    fn test_build_row_skips_missing_keys() {
        let data = json!({"id": null, "code": ""});
        let program = Program::new();
        let ctx = traverse(&data, &program).next().unwrap().unwrap();

        let null_key = vec![FieldSpec::new("id", get_or_null("id"))];
        assert!(matches!(
            build_row(&ctx, &null_key, &["id".to_string()], true),
            RowOutcome::Skipped { .. }
        ));

        let failing_key = vec![FieldSpec::new("id", get("nope"))];
        assert!(matches!(
            build_row(&ctx, &failing_key, &["id".to_string()], true),
            RowOutcome::Skipped { .. }
        ));

        let empty_key = vec![FieldSpec::new("code", get("code"))];
        assert!(matches!(
            build_row(&ctx, &empty_key, &["code".to_string()], true),
            RowOutcome::Skipped { .. }
        ));
        assert!(matches!(
            build_row(&ctx, &empty_key, &["code".to_string()], false),
            RowOutcome::Built { .. }
        ));
    }
}
