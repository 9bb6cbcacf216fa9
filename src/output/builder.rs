use crate::pipeline::PipelineResult;
use crate::table::Row;
use crate::value::JoinKey;
use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::marker::PhantomData;

/// Turns a finished row into whatever the caller wants to hold
///
/// Only persisted fields are visible to builders.
pub trait InstanceBuilder {
    type Instance;

    fn build(&self, table: &str, row: &Row) -> Result<Self::Instance>;
}

/// Plain field maps
#[derive(Debug, Clone, Copy, Default)]
pub struct MapBuilder;

impl InstanceBuilder for MapBuilder {
    type Instance = Map<String, Value>;

    fn build(&self, _table: &str, row: &Row) -> Result<Self::Instance> {
        Ok(row.fields.clone())
    }
}

/// Deserializes the persisted fields into `T`
pub struct TypedBuilder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedBuilder<T> {
    pub fn new() -> Self {
        TypedBuilder { _marker: PhantomData }
    }
}

impl<T> Default for TypedBuilder<T> {
    fn default() -> Self {
        TypedBuilder::new()
    }
}

impl<T: DeserializeOwned> InstanceBuilder for TypedBuilder<T> {
    type Instance = T;

    fn build(&self, table: &str, row: &Row) -> Result<T> {
        serde_json::from_value(Value::Object(row.fields.clone()))
            .with_context(|| format!("Failed to build {} row {}", table, row.key))
    }
}

/// Deserializes into `T`, then runs a caller-supplied check
pub struct ValidatedBuilder<T, F> {
    check: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> ValidatedBuilder<T, F>
where
    F: Fn(&T) -> Result<()>,
{
    pub fn new(check: F) -> Self {
        ValidatedBuilder {
            check,
            _marker: PhantomData,
        }
    }
}

impl<T, F> InstanceBuilder for ValidatedBuilder<T, F>
where
    T: DeserializeOwned,
    F: Fn(&T) -> Result<()>,
{
    type Instance = T;

    fn build(&self, table: &str, row: &Row) -> Result<T> {
        let instance = TypedBuilder::<T>::new().build(table, row)?;
        (self.check)(&instance).with_context(|| format!("Invalid {} row {}", table, row.key))?;
        Ok(instance)
    }
}

/// A parent row a record points at
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParentRef {
    pub table: String,
    pub key: JoinKey,
}

/// A row ready for a persistence sink
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub table: String,
    pub key: JoinKey,
    pub data: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<ParentRef>,
}

/// Persistence records; parents are attached by [`crate::output::persist`]
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordBuilder;

impl InstanceBuilder for RecordBuilder {
    type Instance = Record;

    fn build(&self, table: &str, row: &Row) -> Result<Record> {
        Ok(Record {
            table: table.to_string(),
            key: row.key.clone(),
            data: row.fields.clone(),
            parents: Vec::new(),
        })
    }
}

/// Build one instance per row of `table`, keyed by join key
///
/// An unknown table yields an empty map.
pub fn materialize<B: InstanceBuilder>(
    result: &PipelineResult,
    table: &str,
    builder: &B,
) -> Result<IndexMap<JoinKey, B::Instance>> {
    let Some(rows) = result.table(table) else {
        return Ok(IndexMap::new());
    };
    rows.iter()
        .map(|(key, row)| Ok((key.clone(), builder.build(table, row)?)))
        .collect()
}

/// [`materialize`] every table, in emission order
pub fn materialize_all<B: InstanceBuilder>(
    result: &PipelineResult,
    builder: &B,
) -> Result<IndexMap<String, IndexMap<JoinKey, B::Instance>>> {
    result
        .order
        .iter()
        .map(|table| Ok((table.clone(), materialize(result, table, builder)?)))
        .collect()
}
