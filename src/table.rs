//! Keyed per-table row storage and the merge/join algorithm

use crate::errors::ErrorKind;
use crate::field::{CandidateRow, MergePolicy};
use crate::value::JoinKey;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// One logical row of a table
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Row {
    pub key: JoinKey,
    /// Persisted fields, in first-write order
    pub fields: Map<String, Value>,
    /// Temporary fields, kept for joining and linking
    #[serde(skip)]
    pub temps: Map<String, Value>,
}

impl Row {
    pub fn new(key: JoinKey) -> Self {
        Row {
            key,
            fields: Map::new(),
            temps: Map::new(),
        }
    }

    /// Look a field up among persisted fields first, then temporary ones
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).or_else(|| self.temps.get(name))
    }
}

/// Rows of one table plus what the store knows about its fields
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    key_fields: Vec<String>,
    policies: HashMap<String, MergePolicy>,
    rows: IndexMap<JoinKey, Row>,
}

impl Table {
    fn new(name: &str, key_fields: Vec<String>) -> Self {
        Table {
            name: name.to_string(),
            key_fields,
            policies: HashMap::new(),
            rows: IndexMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical join-key field names, as declared first
    pub fn key_fields(&self) -> &[String] {
        &self.key_fields
    }

    pub fn rows(&self) -> &IndexMap<JoinKey, Row> {
        &self.rows
    }

    pub fn get(&self, key: &JoinKey) -> Option<&Row> {
        self.rows.get(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// All tables of one pipeline run, in declaration order
#[derive(Debug, Clone, Default)]
pub struct TableStore {
    tables: IndexMap<String, Table>,
}

impl TableStore {
    pub fn new() -> Self {
        TableStore {
            tables: IndexMap::new(),
        }
    }

    /// Register a table's join key
    ///
    /// The first declaration is canonical; later ones must agree on arity.
    pub fn declare(&mut self, table: &str, key_fields: &[String]) -> Result<(), ErrorKind> {
        if let Some(existing) = self.tables.get(table) {
            if existing.key_fields.len() != key_fields.len() {
                return Err(ErrorKind::configuration(format!(
                    "table '{}' is keyed on {} field(s) but a later emission declares {}",
                    table,
                    existing.key_fields.len(),
                    key_fields.len()
                )));
            }
            return Ok(());
        }
        if key_fields.is_empty() {
            return Err(ErrorKind::configuration(format!("table '{}' has no join key", table)));
        }
        self.tables
            .insert(table.to_string(), Table::new(table, key_fields.to_vec()));
        Ok(())
    }

    /// Merge a candidate row into a table
    ///
    /// Returns the per-field problems; fields that fail to merge keep their
    /// previous value and the rest of the row is still applied.
    pub fn upsert(&mut self, table: &str, candidate: CandidateRow) -> Vec<ErrorKind> {
        let Some(Table {
            key_fields,
            policies,
            rows,
            ..
        }) = self.tables.get_mut(table)
        else {
            return vec![ErrorKind::configuration(format!("table '{}' was never declared", table))];
        };

        if candidate.key.len() != key_fields.len() {
            return vec![ErrorKind::configuration(format!(
                "table '{}' expects a {}-part key, got {}",
                table,
                key_fields.len(),
                candidate.key.len()
            ))];
        }

        let mut problems = Vec::new();
        let row = rows
            .entry(candidate.key.clone())
            .or_insert_with(|| Row::new(candidate.key));

        for value in candidate.values {
            let declared = *policies.entry(value.name.clone()).or_insert(value.merge);
            if declared != value.merge {
                problems.push(ErrorKind::MergeConflict {
                    field: value.name,
                    first: declared.to_string(),
                    second: value.merge.to_string(),
                });
                continue;
            }

            let target = if value.persisted {
                &mut row.fields
            } else {
                &mut row.temps
            };
            match value.merge.merge(&value.name, target.get(&value.name), value.value) {
                Ok(merged) => {
                    target.insert(value.name, merged);
                }
                Err(e) => problems.push(e),
            }
        }

        problems
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    /// Hand the rows over, keeping table and row order
    pub fn into_rows(self) -> IndexMap<String, IndexMap<JoinKey, Row>> {
        self.tables
            .into_iter()
            .map(|(name, table)| (name, table.rows))
            .collect()
    }
}
