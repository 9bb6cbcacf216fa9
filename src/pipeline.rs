//! Declarative mapping specs and the pipeline that runs them
//!
//! A [`MappingSpec`] lists traversals (each a navigation program, the table
//! emissions to run at every position it reaches, and nested traversals) plus
//! the relationship bindings between tables. [`Pipeline::new`] checks the spec
//! statically; [`Pipeline::run`] executes every pass, merges rows, resolves
//! relationships and returns a [`PipelineResult`].

use crate::context::Context;
use crate::errors::{ErrorCollector, ErrorKind, ErrorPolicy, ErrorTable, PipelineError};
use crate::field::{build_row, FieldSpec, MergePolicy, RowOutcome};
use crate::relationships::{self, Link, RelationshipBinding};
use crate::table::{Row, TableStore};
use crate::transform::Transform;
use crate::traversal::{traverse_from, Program};
use crate::value::{display_path, JoinKey};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Rows for one table, produced at every position of a traversal
#[derive(Debug, Clone)]
pub struct TableEmit {
    pub table: String,
    pub fields: Vec<FieldSpec>,
    /// Names of the fields forming the join key; empty means "use the table's key"
    pub join_on: Vec<String>,
    /// Overrides the pipeline-wide error policy for errors raised here
    pub error_policy: Option<ErrorPolicy>,
}

impl TableEmit {
    pub fn new(table: impl Into<String>) -> Self {
        TableEmit {
            table: table.into(),
            fields: Vec::new(),
            join_on: Vec::new(),
            error_policy: None,
        }
    }

    pub fn field(self, name: impl Into<String>, transform: impl Into<Transform>) -> Self {
        self.with(FieldSpec::new(name, transform))
    }

    pub fn temp(self, name: impl Into<String>, transform: impl Into<Transform>) -> Self {
        self.with(FieldSpec::temp(name, transform))
    }

    /// Persisted field with an explicit merge policy
    pub fn merged(self, name: impl Into<String>, transform: impl Into<Transform>, merge: MergePolicy) -> Self {
        self.with(FieldSpec::new(name, transform).with_merge(merge))
    }

    pub fn with(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    pub fn join_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.join_on = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = Some(policy);
        self
    }
}

/// One navigation program with what to emit along it
#[derive(Debug, Clone, Default)]
pub struct Traversal {
    /// Index of the input root; only used by top-level traversals
    pub root: usize,
    pub program: Program,
    pub emits: Vec<TableEmit>,
    /// Run from every context this traversal yields, before it moves on
    pub nested: Vec<Traversal>,
}

impl Traversal {
    pub fn new(program: Program) -> Self {
        Traversal {
            root: 0,
            program,
            emits: Vec::new(),
            nested: Vec::new(),
        }
    }

    pub fn on_root(mut self, root: usize) -> Self {
        self.root = root;
        self
    }

    pub fn emit(mut self, emit: TableEmit) -> Self {
        self.emits.push(emit);
        self
    }

    pub fn nest(mut self, traversal: Traversal) -> Self {
        self.nested.push(traversal);
        self
    }

    /// Where navigation errors of this traversal are reported
    fn error_site(&self) -> Option<(&str, Option<ErrorPolicy>)> {
        self.emits
            .first()
            .map(|e| (e.table.as_str(), e.error_policy))
            .or_else(|| self.nested.iter().find_map(Traversal::error_site))
    }
}

/// Everything a pipeline needs to know, in declaration order
#[derive(Debug, Clone, Default)]
pub struct MappingSpec {
    pub traversals: Vec<Traversal>,
    pub bindings: Vec<RelationshipBinding>,
}

impl MappingSpec {
    pub fn new() -> Self {
        MappingSpec::default()
    }

    pub fn traversal(mut self, traversal: Traversal) -> Self {
        self.traversals.push(traversal);
        self
    }

    pub fn link(mut self, binding: RelationshipBinding) -> Self {
        self.bindings.push(binding);
        self
    }
}

/// Run-wide settings
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub error_policy: ErrorPolicy,
    /// Treat an empty-string join-key part like null and skip the row
    pub empty_key_is_missing: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            error_policy: ErrorPolicy::Collect,
            empty_key_is_missing: true,
        }
    }
}

/// Normalized output of a run
#[derive(Debug, Clone, Default)]
pub struct PipelineResult {
    pub tables: IndexMap<String, IndexMap<JoinKey, Row>>,
    pub errors: ErrorTable,
    pub links: Vec<Link>,
    /// Tables with parents before children
    pub order: Vec<String>,
}

impl PipelineResult {
    pub fn table(&self, name: &str) -> Option<&IndexMap<JoinKey, Row>> {
        self.tables.get(name)
    }

    pub fn row(&self, table: &str, key: &JoinKey) -> Option<&Row> {
        self.tables.get(table)?.get(key)
    }

    /// Parent key a child row was bound to
    pub fn parent_of(&self, child_table: &str, child_key: &JoinKey, parent_table: &str) -> Option<&JoinKey> {
        self.links
            .iter()
            .find(|l| l.child_table == child_table && &l.child_key == child_key && l.parent_table == parent_table)
            .map(|l| &l.parent_key)
    }

    pub fn error_count(&self) -> usize {
        self.errors.values().flat_map(|rows| rows.values()).map(Vec::len).sum()
    }

    /// Errors as plain messages, grouped like `errors`
    pub fn error_messages(&self) -> IndexMap<String, IndexMap<JoinKey, Vec<String>>> {
        self.errors
            .iter()
            .map(|(table, rows)| {
                let rows = rows
                    .iter()
                    .map(|(key, errs)| (key.clone(), errs.iter().map(|e| e.kind.to_string()).collect()))
                    .collect();
                (table.clone(), rows)
            })
            .collect()
    }
}

/// A validated mapping spec, ready to run against input trees
#[derive(Debug, Clone)]
pub struct Pipeline {
    spec: MappingSpec,
    config: PipelineConfig,
    /// Canonical key fields per table, in declaration order
    table_keys: IndexMap<String, Vec<String>>,
    order: Vec<String>,
}

struct Validator {
    table_keys: IndexMap<String, Vec<String>>,
    field_policies: HashMap<(String, String), MergePolicy>,
}

impl Validator {
    fn check_traversal(&mut self, traversal: &mut Traversal) -> Result<(), ErrorKind> {
        for emit in &mut traversal.emits {
            self.check_emit(emit)?;
        }
        for nested in &mut traversal.nested {
            self.check_traversal(nested)?;
        }
        Ok(())
    }

    fn check_emit(&mut self, emit: &mut TableEmit) -> Result<(), ErrorKind> {
        match self.table_keys.get(&emit.table).cloned() {
            None => {
                if emit.join_on.is_empty() {
                    return Err(ErrorKind::configuration(format!("table '{}' has no join key", emit.table)));
                }
                self.table_keys.insert(emit.table.clone(), emit.join_on.clone());
            }
            Some(canonical) if emit.join_on.is_empty() => {
                emit.join_on = canonical;
            }
            Some(canonical) if canonical.len() != emit.join_on.len() => {
                return Err(ErrorKind::configuration(format!(
                    "table '{}' is keyed on [{}] but an emission joins on [{}]",
                    emit.table,
                    canonical.join(", "),
                    emit.join_on.join(", ")
                )));
            }
            Some(_) => {}
        }

        let declared = |name: &str| emit.fields.iter().any(|f| f.name == name);
        if let Some(unknown) = emit.join_on.iter().find(|k| !declared(k)) {
            return Err(ErrorKind::configuration(format!(
                "table '{}' joins on unknown field '{}'",
                emit.table, unknown
            )));
        }

        // Persisted and temporary declarations of one field may mix; each
        // value lands where its own emission puts it.
        for field in &emit.fields {
            let seen = *self
                .field_policies
                .entry((emit.table.clone(), field.name.clone()))
                .or_insert(field.merge);
            if seen != field.merge {
                return Err(ErrorKind::MergeConflict {
                    field: format!("{}.{}", emit.table, field.name),
                    first: seen.to_string(),
                    second: field.merge.to_string(),
                });
            }
        }
        Ok(())
    }

    fn check_binding(&self, binding: &RelationshipBinding) -> Result<(), ErrorKind> {
        let parent_key = self.table_keys.get(&binding.parent_table).ok_or_else(|| {
            ErrorKind::configuration(format!("binding refers to unknown table '{}'", binding.parent_table))
        })?;
        if !self.table_keys.contains_key(&binding.child_table) {
            return Err(ErrorKind::configuration(format!(
                "binding refers to unknown table '{}'",
                binding.child_table
            )));
        }
        relationships::child_fields_in_key_order(binding, parent_key)?;

        for (child_field, _) in &binding.by {
            let known = self
                .field_policies
                .contains_key(&(binding.child_table.clone(), child_field.clone()));
            if !known {
                return Err(ErrorKind::configuration(format!(
                    "binding uses unknown field '{}.{}'",
                    binding.child_table, child_field
                )));
            }
        }
        Ok(())
    }
}

impl Pipeline {
    /// Validate a spec: join keys, merge policies, bindings and table order
    pub fn new(spec: MappingSpec, config: PipelineConfig) -> Result<Self, PipelineError> {
        let mut spec = spec;
        let mut validator = Validator {
            table_keys: IndexMap::new(),
            field_policies: HashMap::new(),
        };

        for traversal in &mut spec.traversals {
            validator.check_traversal(traversal).map_err(PipelineError::fatal)?;
        }
        for binding in &spec.bindings {
            validator.check_binding(binding).map_err(PipelineError::fatal)?;
        }

        let tables: Vec<String> = validator.table_keys.keys().cloned().collect();
        let order = relationships::emission_order(&tables, &spec.bindings).map_err(PipelineError::fatal)?;

        Ok(Pipeline {
            spec,
            config,
            table_keys: validator.table_keys,
            order,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Tables with parents before children
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Run every traversal against `roots`, then resolve relationships
    pub fn run(&self, roots: &[Value]) -> Result<PipelineResult, PipelineError> {
        let mut store = TableStore::new();
        for (table, keys) in &self.table_keys {
            store.declare(table, keys).map_err(PipelineError::fatal)?;
        }
        let mut collector = ErrorCollector::new(self.config.error_policy);

        for (pass, traversal) in self.spec.traversals.iter().enumerate() {
            let root = roots.get(traversal.root).ok_or_else(|| {
                PipelineError::fatal(ErrorKind::configuration(format!(
                    "traversal {} reads root {} but only {} root(s) were given",
                    pass,
                    traversal.root,
                    roots.len()
                )))
            })?;
            log::debug!("pass {} starting on root {}", pass, traversal.root);
            self.run_traversal(Arc::new(Context::root(root)), traversal, &mut store, &mut collector)?;
        }

        let resolution = relationships::bind(&self.spec.bindings, &store)?;
        for error in resolution.errors {
            collector.record(error)?;
        }

        let tables = store.into_rows();
        log::info!(
            "pipeline finished: {} table(s), {} row(s), {} link(s), {} error(s)",
            tables.len(),
            tables.values().map(IndexMap::len).sum::<usize>(),
            resolution.links.len(),
            collector.len()
        );

        Ok(PipelineResult {
            tables,
            errors: collector.into_inner(),
            links: resolution.links,
            order: self.order.clone(),
        })
    }

    fn run_traversal<'a>(
        &self,
        start: Arc<Context<'a>>,
        traversal: &Traversal,
        store: &mut TableStore,
        collector: &mut ErrorCollector,
    ) -> Result<(), PipelineError> {
        for item in traverse_from(start, &traversal.program) {
            match item {
                Ok(ctx) => {
                    for emit in &traversal.emits {
                        self.emit_row(&ctx, emit, store, collector)?;
                    }
                    for nested in &traversal.nested {
                        self.run_traversal(Arc::clone(&ctx), nested, store, collector)?;
                    }
                }
                Err(kind) => {
                    let (table, policy) = traversal.error_site().unwrap_or(("", None));
                    collector.record_with(PipelineError::new(table, kind), policy)?;
                }
            }
        }
        Ok(())
    }

    fn emit_row(
        &self,
        ctx: &Context<'_>,
        emit: &TableEmit,
        store: &mut TableStore,
        collector: &mut ErrorCollector,
    ) -> Result<(), PipelineError> {
        let (row, failures) = match build_row(ctx, &emit.fields, &emit.join_on, self.config.empty_key_is_missing) {
            RowOutcome::Built { row, failures } => (row, failures),
            RowOutcome::Skipped { reason } => {
                log::warn!(
                    "skipping '{}' row at {}: {}",
                    emit.table,
                    display_path(ctx.path()),
                    reason
                );
                return Ok(());
            }
        };

        let key = row.key.clone();
        for failure in failures {
            let error = PipelineError::new(
                emit.table.clone(),
                ErrorKind::Extraction(format!("field '{}': {}", failure.field, failure.error)),
            )
            .with_key(key.clone())
            .with_transform(failure.transform);
            collector.record_with(error, emit.error_policy)?;
        }

        for kind in store.upsert(&emit.table, row) {
            let error = PipelineError::new(emit.table.clone(), kind).with_key(key.clone());
            collector.record_with(error, emit.error_policy)?;
        }
        Ok(())
    }
}
