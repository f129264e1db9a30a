//! Environment: one transaction's view of the world.
//!
//! An [`Env`] bundles the immutable model registry, the row store, the
//! access gate, the acting [`Context`] and a private value cache. One
//! env per transaction: concurrent transactions never share cache
//! entries, and dropping the env discards its cache (rollback).
//!
//! Onchange simulation runs in a scratch env layered over the real one:
//! reads fall through, writes and stale markers land in the scratch
//! cache only, and the whole layer is discarded when the edit ends.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use tracing::debug;

use terp_core::Context;

use crate::acl::{AccessGate, AccessMode};
use crate::cache::{Cache, CacheState};
use crate::error::OrmError;
use crate::model::{FieldDef, FieldKind};
use crate::recordset::Recordset;
use crate::registry::{Hop, ModelRegistry};
use crate::store::RowStore;
use crate::value::{Row, Value};

type StageKey = (String, i64, String);
pub(crate) type Stage = BTreeMap<StageKey, Value>;

pub(crate) struct EnvInner {
    registry: Arc<ModelRegistry>,
    store: Arc<dyn RowStore>,
    gate: Arc<AccessGate>,
    ctx: Context,
    cache: Cache,
    /// Read-through parent for scratch (onchange) environments.
    base: Option<Env>,
    scratch: bool,
    /// Staging areas of in-flight batch computations, innermost last.
    stage: RwLock<Vec<Stage>>,
    /// `(model, method)` pairs currently being computed, for
    /// re-entrancy detection during recursive fixed-point runs.
    computing: RwLock<BTreeSet<(String, String)>>,
}

#[derive(Clone)]
pub struct Env {
    inner: Arc<EnvInner>,
}

impl Env {
    pub fn new(
        registry: Arc<ModelRegistry>,
        store: Arc<dyn RowStore>,
        gate: Arc<AccessGate>,
        ctx: Context,
    ) -> Self {
        Self {
            inner: Arc::new(EnvInner {
                registry,
                store,
                gate,
                ctx,
                cache: Cache::new(),
                base: None,
                scratch: false,
                stage: RwLock::new(Vec::new()),
                computing: RwLock::new(BTreeSet::new()),
            }),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &dyn RowStore {
        self.inner.store.as_ref()
    }

    pub fn gate(&self) -> &AccessGate {
        &self.inner.gate
    }

    pub fn ctx(&self) -> &Context {
        &self.inner.ctx
    }

    pub(crate) fn is_scratch(&self) -> bool {
        self.inner.scratch
    }

    /// Same transaction, different acting context.
    pub fn with_context(&self, ctx: Context) -> Env {
        Self {
            inner: Arc::new(EnvInner {
                registry: self.inner.registry.clone(),
                store: self.inner.store.clone(),
                gate: self.inner.gate.clone(),
                ctx,
                cache: Cache::new(),
                base: Some(self.clone()),
                scratch: self.inner.scratch,
                stage: RwLock::new(Vec::new()),
                computing: RwLock::new(BTreeSet::new()),
            }),
        }
    }

    // ── Recordset construction ──────────────────────────────────────

    /// Wrap ids without validating existence; existence is checked
    /// lazily on first field access (or explicitly via `exists()`).
    pub fn browse(&self, model: &str, ids: &[i64]) -> Result<Recordset, OrmError> {
        if !self.inner.registry.has_model(model) {
            return Err(OrmError::UnknownModel(model.to_string()));
        }
        Ok(Recordset::new(self.clone(), model, ids))
    }

    // ── CRUD ────────────────────────────────────────────────────────

    fn check_writable(&self, model: &str, field: &str) -> Result<FieldDef, OrmError> {
        let f = self.inner.registry.field(model, field)?.clone();
        if f.compute.is_some() || f.related.is_some() {
            return Err(OrmError::Validation(format!(
                "cannot assign computed field {}.{} directly",
                model, field
            )));
        }
        if matches!(f.kind, FieldKind::One2many { .. }) {
            return Err(OrmError::Validation(format!(
                "cannot assign one2many {}.{}; write the inverse many2one instead",
                model, field
            )));
        }
        Ok(f)
    }

    pub fn create(&self, model: &str, values: Row) -> Result<Recordset, OrmError> {
        if self.inner.scratch {
            return Err(OrmError::Internal(
                "create is not allowed in an onchange environment".into(),
            ));
        }
        self.inner
            .gate
            .check(&self.inner.ctx, model, AccessMode::Create, &[])?;

        let mut row: Row = BTreeMap::new();
        for (k, v) in values {
            self.check_writable(model, &k)?;
            row.insert(k, v);
        }
        // Defaults for plain stored fields left unset.
        for (name, f) in self.inner.registry.fields(model)? {
            if f.store && f.compute.is_none() && f.related.is_none() && !row.contains_key(name) {
                if let Some(d) = &f.default {
                    row.insert(name.clone(), d.clone());
                }
            }
        }

        let id = self.inner.store.create(model, &row)?;
        for (k, v) in &row {
            self.inner.cache.insert(model, id, k, v.clone());
        }
        for k in row.keys() {
            self.propagate_stale(model, &[id], k)?;
        }
        self.browse(model, &[id])
    }

    pub fn write(&self, rs: &Recordset, values: &Row) -> Result<(), OrmError> {
        if self.inner.scratch {
            return Err(OrmError::Internal(
                "write is not allowed in an onchange environment".into(),
            ));
        }
        if rs.is_empty() {
            return Ok(());
        }
        self.inner
            .gate
            .check(&self.inner.ctx, rs.model(), AccessMode::Write, rs.ids())?;
        for k in values.keys() {
            self.check_writable(rs.model(), k)?;
        }

        // Stale out dependents reachable through the OLD relation
        // values (a reassigned many2one must invalidate the previous
        // parent as well as the new one).
        for k in values.keys() {
            self.propagate_stale(rs.model(), rs.ids(), k)?;
        }

        self.inner.store.write(rs.model(), rs.ids(), values)?;
        for id in rs.ids() {
            for (k, v) in values {
                self.inner.cache.insert(rs.model(), *id, k, v.clone());
            }
        }

        for k in values.keys() {
            self.propagate_stale(rs.model(), rs.ids(), k)?;
        }
        Ok(())
    }

    pub fn unlink(&self, rs: &Recordset) -> Result<(), OrmError> {
        if self.inner.scratch {
            return Err(OrmError::Internal(
                "unlink is not allowed in an onchange environment".into(),
            ));
        }
        if rs.is_empty() {
            return Ok(());
        }
        self.inner
            .gate
            .check(&self.inner.ctx, rs.model(), AccessMode::Unlink, rs.ids())?;

        // Every field of the vanishing rows is a potential dependency.
        let field_names: Vec<String> =
            self.inner.registry.fields(rs.model())?.keys().cloned().collect();
        for name in &field_names {
            self.propagate_stale(rs.model(), rs.ids(), name)?;
        }

        self.inner.store.delete(rs.model(), rs.ids())?;
        for id in rs.ids() {
            self.inner.cache.invalidate(Some(rs.model()), Some(*id), None);
        }
        Ok(())
    }

    // ── Cache plumbing ──────────────────────────────────────────────

    /// Probe the cache, falling through to the base layer of a scratch
    /// env on miss. A stale marker in the scratch layer shadows a valid
    /// base value.
    pub(crate) fn cache_get(&self, model: &str, id: i64, field: &str) -> CacheState {
        match self.inner.cache.get(model, id, field) {
            CacheState::Miss => match &self.inner.base {
                Some(base) => base.cache_get(model, id, field),
                None => CacheState::Miss,
            },
            state => state,
        }
    }

    pub(crate) fn cache_insert(&self, model: &str, id: i64, field: &str, value: Value) {
        self.inner.cache.insert(model, id, field, value);
    }

    /// Clear cached values: all of them, or every slot of the named
    /// fields. The full clear is the safety valve after bulk writes
    /// that bypassed the normal write path. Idempotent.
    pub fn invalidate_cache(&self, fields: Option<&[&str]>) {
        match fields {
            None => {
                debug!("cache: full invalidation");
                self.inner.cache.clear();
            }
            Some(names) => {
                for name in names {
                    self.inner.cache.invalidate(None, None, Some(name));
                }
            }
        }
    }

    // ── Staging (batch computation) ─────────────────────────────────

    pub(crate) fn begin_stage(&self) {
        self.inner.stage.write().unwrap().push(Stage::new());
    }

    pub(crate) fn abort_stage(&self) {
        self.inner.stage.write().unwrap().pop();
    }

    pub(crate) fn take_stage(&self) -> Stage {
        self.inner.stage.write().unwrap().pop().unwrap_or_default()
    }

    pub(crate) fn staged_get(&self, model: &str, id: i64, field: &str) -> Option<Value> {
        let stages = self.inner.stage.read().unwrap();
        for stage in stages.iter().rev() {
            if let Some(v) = stage.get(&(model.to_string(), id, field.to_string())) {
                return Some(v.clone());
            }
        }
        None
    }

    /// Assign a computed value. Only legal while a compute method
    /// invoked by the engine is running; the value lands in the staging
    /// layer and is committed to the cache all-or-nothing per batch.
    pub fn put_computed(
        &self,
        model: &str,
        id: i64,
        field: &str,
        value: Value,
    ) -> Result<(), OrmError> {
        let mut stages = self.inner.stage.write().unwrap();
        match stages.last_mut() {
            Some(stage) => {
                stage.insert((model.to_string(), id, field.to_string()), value);
                Ok(())
            }
            None => Err(OrmError::Internal(format!(
                "put_computed({}.{}) called outside a compute method",
                model, field
            ))),
        }
    }

    pub(crate) fn is_computing(&self, model: &str, method: &str) -> bool {
        self.inner
            .computing
            .read()
            .unwrap()
            .contains(&(model.to_string(), method.to_string()))
    }

    pub(crate) fn mark_computing(&self, model: &str, method: &str) {
        self.inner
            .computing
            .write()
            .unwrap()
            .insert((model.to_string(), method.to_string()));
    }

    pub(crate) fn unmark_computing(&self, model: &str, method: &str) {
        self.inner
            .computing
            .write()
            .unwrap()
            .remove(&(model.to_string(), method.to_string()));
    }

    // ── Invalidation walk ───────────────────────────────────────────

    /// Raw relational read used by the invalidation walk: cached values
    /// first, then the row store, without triggering computation.
    pub(crate) fn read_refs(
        &self,
        model: &str,
        ids: &[i64],
        field: &str,
    ) -> Result<Vec<i64>, OrmError> {
        let mut out = Vec::new();
        let mut uncached = Vec::new();
        for id in ids {
            match self.cache_get(model, *id, field) {
                CacheState::Hit(v) => out.extend(v.ref_ids()),
                _ => uncached.push(*id),
            }
        }
        if !uncached.is_empty() {
            for (_, row) in self.inner.store.read(model, &uncached)? {
                if let Some(v) = row.get(field) {
                    out.extend(v.ref_ids());
                }
            }
        }
        Ok(crate::recordset::dedup_ids(&out))
    }

    fn apply_hop(&self, hop: &Hop, ids: &[i64]) -> Result<Vec<i64>, OrmError> {
        match hop {
            Hop::Up { model, field } => self.read_refs(model, ids, field),
            Hop::Search { model, field } => self.inner.store.search_ref(model, field, ids),
        }
    }

    /// Mark every dependent of `(model, field)` stale, transitively,
    /// across models via the inverse dependents index.
    pub(crate) fn propagate_stale(
        &self,
        model: &str,
        ids: &[i64],
        field: &str,
    ) -> Result<(), OrmError> {
        let mut visited: BTreeSet<StageKey> = BTreeSet::new();
        let mut work: Vec<(String, Vec<i64>, String)> =
            vec![(model.to_string(), ids.to_vec(), field.to_string())];

        while let Some((m, ids, f)) = work.pop() {
            for dep in self.inner.registry.dependents(&m, &f) {
                let mut targets = ids.clone();
                for hop in &dep.walk {
                    targets = self.apply_hop(hop, &targets)?;
                    if targets.is_empty() {
                        break;
                    }
                }
                let fresh: Vec<i64> = targets
                    .into_iter()
                    .filter(|id| visited.insert((dep.model.clone(), *id, dep.field.clone())))
                    .collect();
                if fresh.is_empty() {
                    continue;
                }
                for id in &fresh {
                    self.inner.cache.mark_stale(&dep.model, *id, &dep.field);
                }
                work.push((dep.model.clone(), fresh, dep.field.clone()));
            }
        }
        Ok(())
    }

    // ── Onchange simulation ─────────────────────────────────────────

    fn scratch_env(&self) -> Env {
        Env {
            inner: Arc::new(EnvInner {
                registry: self.inner.registry.clone(),
                store: self.inner.store.clone(),
                gate: self.inner.gate.clone(),
                ctx: self.inner.ctx.clone(),
                cache: Cache::new(),
                base: Some(self.clone()),
                scratch: true,
                stage: RwLock::new(Vec::new()),
                computing: RwLock::new(BTreeSet::new()),
            }),
        }
    }

    /// Simulate in-memory edits on a single record and report which of
    /// the `watch` fields would change. The simulation runs against a
    /// scratch cache layer that is discarded on return — the row store
    /// is never touched.
    pub fn onchange(
        &self,
        rs: &Recordset,
        edits: &Row,
        watch: &[&str],
    ) -> Result<Row, OrmError> {
        let id = rs.single()?;
        let model = rs.model();

        // Pre-edit values, computed in the real environment.
        let mut before: BTreeMap<String, Value> = BTreeMap::new();
        for f in watch {
            before.insert((*f).to_string(), rs.get_one(f)?);
        }

        let scratch = self.scratch_env();
        let srs = scratch.browse(model, &[id])?;
        for (k, v) in edits {
            self.check_writable(model, k)?;
            // Old relation values first, then the new ones — both sides
            // of a reassignment go stale.
            scratch.propagate_stale(model, &[id], k)?;
            scratch.cache_insert(model, id, k, v.clone());
            scratch.propagate_stale(model, &[id], k)?;
        }

        let mut diff = Row::new();
        for f in watch {
            let after = srs.get_one(f)?;
            if Some(&after) != before.get(*f) {
                diff.insert((*f).to_string(), after);
            }
        }
        Ok(diff)
    }
}
