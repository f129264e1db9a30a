//! Field computation engine.
//!
//! The central performance invariant: computing a field over N records
//! invokes the declared compute method once per `(model, method)`
//! group, never once per record. Methods receive the full batch and are
//! expected to use batched reads internally.
//!
//! Results land in a staging layer and commit to the cache atomically
//! per batch — a failing method leaves no partial values behind.

use std::collections::{BTreeMap, BTreeSet};

use crate::acl::AccessMode;
use crate::cache::CacheState;
use crate::env::{Env, Stage};
use crate::error::OrmError;
use crate::model::{ComputeFn, FieldDef, FieldKind};
use crate::recordset::Recordset;
use crate::value::Value;

/// Resolve `field` for every record of `rs`, returning values in id
/// order. Fills cache gaps with a batched store read, a related-path
/// traversal or a batched compute, depending on the declaration.
pub(crate) fn fetch(env: &Env, rs: &Recordset, field: &str) -> Result<Vec<Value>, OrmError> {
    let model = rs.model();
    let fdef = env.registry().field(model, field)?.clone();
    env.gate().check(env.ctx(), model, AccessMode::Read, rs.ids())?;

    let mut stale: Vec<i64> = Vec::new();
    let mut missing: Vec<i64> = Vec::new();
    for id in rs.ids() {
        if env.staged_get(model, *id, field).is_some() {
            continue;
        }
        match env.cache_get(model, *id, field) {
            CacheState::Hit(_) => {}
            CacheState::Stale => stale.push(*id),
            CacheState::Miss => missing.push(*id),
        }
    }

    if !(stale.is_empty() && missing.is_empty()) {
        if fdef.related.is_some() {
            let mut gaps = missing.clone();
            gaps.extend_from_slice(&stale);
            resolve_related(env, model, &gaps, &fdef)?;
        } else if let Some(method) = fdef.compute.clone() {
            let mut to_compute = stale.clone();
            if fdef.store && !missing.is_empty() {
                // Stored computed values may already be persisted from
                // an earlier transaction; only compute the gaps.
                let rows = env.store().read(model, &missing)?;
                let mut found: BTreeSet<i64> = BTreeSet::new();
                for (id, row) in &rows {
                    found.insert(*id);
                    match row.get(field) {
                        Some(v) => env.cache_insert(model, *id, field, v.clone()),
                        None => to_compute.push(*id),
                    }
                }
                if let Some(id) = missing.iter().find(|id| !found.contains(*id)) {
                    return Err(OrmError::MissingRecord {
                        model: model.to_string(),
                        id: *id,
                    });
                }
            } else {
                to_compute.extend_from_slice(&missing);
            }
            if !to_compute.is_empty() {
                compute_batch(env, model, &to_compute, &fdef, &method)?;
            }
        } else {
            let mut gaps = missing.clone();
            gaps.extend_from_slice(&stale);
            match &fdef.kind {
                FieldKind::One2many { comodel, inverse } => {
                    resolve_one2many(env, model, &gaps, field, comodel, inverse)?;
                }
                _ => read_rows(env, model, &gaps)?,
            }
        }
    }

    let mut out = Vec::with_capacity(rs.len());
    for id in rs.ids() {
        if let Some(v) = env.staged_get(model, *id, field) {
            out.push(v);
            continue;
        }
        match env.cache_get(model, *id, field) {
            CacheState::Hit(v) => out.push(v),
            _ => {
                return Err(OrmError::Internal(format!(
                    "field {}.{} not resolved for record {}",
                    model, field, id
                )));
            }
        }
    }
    Ok(out)
}

/// Batch-read rows and fill the cache for every plain stored field.
/// Reading one field prefetches its siblings — the row was paid for.
fn read_rows(env: &Env, model: &str, ids: &[i64]) -> Result<(), OrmError> {
    let rows = env.store().read(model, ids)?;
    let mut found: BTreeSet<i64> = BTreeSet::new();
    let fields = env.registry().fields(model)?.clone();

    for (id, row) in &rows {
        found.insert(*id);
        for (name, f) in &fields {
            if f.compute.is_some()
                || f.related.is_some()
                || matches!(f.kind, FieldKind::One2many { .. })
            {
                continue;
            }
            if let CacheState::Hit(_) = env.cache_get(model, *id, name) {
                continue;
            }
            let value = row
                .get(name)
                .cloned()
                .or_else(|| f.default.clone())
                .unwrap_or(Value::Null);
            env.cache_insert(model, *id, name, value);
        }
    }

    if let Some(id) = ids.iter().find(|id| !found.contains(*id)) {
        return Err(OrmError::MissingRecord {
            model: model.to_string(),
            id: *id,
        });
    }
    Ok(())
}

/// Resolve a one2many by reading the comodel's inverse many2one —
/// one reverse scan and one batched row read for the whole gap set.
fn resolve_one2many(
    env: &Env,
    model: &str,
    ids: &[i64],
    field: &str,
    comodel: &str,
    inverse: &str,
) -> Result<(), OrmError> {
    let child_ids = env.store().search_ref(comodel, inverse, ids)?;
    let mut by_parent: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for (child_id, row) in env.store().read(comodel, &child_ids)? {
        if let Some(parent) = row.get(inverse).and_then(|v| v.as_ref_id()) {
            by_parent.entry(parent).or_default().push(child_id);
        }
    }
    for id in ids {
        let children = by_parent.remove(id).unwrap_or_default();
        env.cache_insert(model, *id, field, Value::RefList(children));
    }
    Ok(())
}

/// Resolve a related field by walking its many2one chain and copying
/// the target value into the related field's own cache slot. A null
/// reference anywhere along the path yields the field default.
fn resolve_related(env: &Env, model: &str, ids: &[i64], fdef: &FieldDef) -> Result<(), OrmError> {
    let path = fdef
        .related
        .as_ref()
        .ok_or_else(|| OrmError::Internal("resolve_related on non-related field".into()))?;
    let segs: Vec<&str> = path.split('.').collect();

    // (original id, current id on cur_model); records fall out of the
    // walk when a hop is null.
    let mut pairs: Vec<(i64, i64)> = ids.iter().map(|id| (*id, *id)).collect();
    let mut cur_model = model.to_string();

    for seg in &segs[..segs.len() - 1] {
        let cur_ids: Vec<i64> = pairs.iter().map(|(_, cur)| *cur).collect();
        let cur_rs = env.browse(&cur_model, &cur_ids)?;
        let refs = fetch(env, &cur_rs, seg)?;
        let by_id: BTreeMap<i64, Option<i64>> = cur_rs
            .ids()
            .iter()
            .zip(refs.iter())
            .map(|(id, v)| (*id, v.as_ref_id()))
            .collect();
        pairs = pairs
            .into_iter()
            .filter_map(|(orig, cur)| by_id.get(&cur).copied().flatten().map(|next| (orig, next)))
            .collect();
        let sdef = env.registry().field(&cur_model, seg)?;
        cur_model = match &sdef.kind {
            FieldKind::Many2one { comodel } => comodel.clone(),
            _ => {
                return Err(OrmError::Internal(format!(
                    "related path {:?} crosses non-many2one {}.{}",
                    path, cur_model, seg
                )));
            }
        };
    }

    let leaf = segs[segs.len() - 1];
    let target_ids: Vec<i64> = pairs.iter().map(|(_, cur)| *cur).collect();
    let target_rs = env.browse(&cur_model, &target_ids)?;
    let leaf_values = fetch(env, &target_rs, leaf)?;
    let by_target: BTreeMap<i64, Value> = target_rs
        .ids()
        .iter()
        .zip(leaf_values.into_iter())
        .map(|(id, v)| (*id, v))
        .collect();

    let resolved: BTreeMap<i64, Value> = pairs
        .iter()
        .filter_map(|(orig, cur)| by_target.get(cur).map(|v| (*orig, v.clone())))
        .collect();
    for id in ids {
        let value = resolved
            .get(id)
            .cloned()
            .or_else(|| fdef.default.clone())
            .unwrap_or(Value::Null);
        env.cache_insert(model, *id, &fdef.name, value);
    }
    Ok(())
}

/// Invoke the compute method once for the whole batch, verify that
/// every field it serves was assigned for every record, then commit the
/// stage to the cache (and write stored values back to the row store).
fn compute_batch(
    env: &Env,
    model: &str,
    ids: &[i64],
    fdef: &FieldDef,
    method: &str,
) -> Result<(), OrmError> {
    if env.is_computing(model, method) {
        // Re-entrant read while this method's own batch is running
        // (recursive fields reaching past the batch, or cyclic data).
        // Serve the current staged/cached state; genuinely unknown
        // records start from the default and converge in the outer
        // fixed-point loop.
        for id in ids {
            let usable = matches!(
                env.cache_get(model, *id, &fdef.name),
                CacheState::Hit(_)
            );
            if env.staged_get(model, *id, &fdef.name).is_none() && !usable {
                let seed = fdef.default.clone().unwrap_or(Value::Null);
                env.put_computed(model, *id, &fdef.name, seed)?;
            }
        }
        return Ok(());
    }

    let compute_fn = env.registry().compute_fn(model, method)?;
    let batch_ids = if fdef.recursive {
        expand_ancestors(env, model, ids, fdef)?
    } else {
        ids.to_vec()
    };
    let batch = env.browse(model, &batch_ids)?;
    let method_fields = env.registry().method_fields(model, method);

    env.mark_computing(model, method);
    env.begin_stage();

    let result = if fdef.recursive {
        run_fixed_point(env, model, &batch, fdef, &method_fields, &compute_fn)
    } else {
        compute_fn(env, &batch)
    };

    if let Err(e) = result {
        env.abort_stage();
        env.unmark_computing(model, method);
        return Err(e);
    }

    // Contract check: every served field assigned for every record.
    // Fields with a declared default are optional; everything else
    // missing is a programming error in the business model.
    for f in &method_fields {
        for id in batch.ids() {
            if env.staged_get(model, *id, &f.name).is_some() {
                continue;
            }
            match &f.default {
                Some(d) => env.put_computed(model, *id, &f.name, d.clone())?,
                None => {
                    env.abort_stage();
                    env.unmark_computing(model, method);
                    return Err(OrmError::ComputeUnset {
                        model: model.to_string(),
                        field: f.name.clone(),
                        method: method.to_string(),
                        id: *id,
                    });
                }
            }
        }
    }

    let stage = env.take_stage();
    env.unmark_computing(model, method);
    commit_stage(env, stage)
}

fn commit_stage(env: &Env, stage: Stage) -> Result<(), OrmError> {
    // Group stored values per record for batched write-back.
    let mut writeback: BTreeMap<(String, i64), crate::value::Row> = BTreeMap::new();

    for ((m, id, f), v) in &stage {
        env.cache_insert(m, *id, f, v.clone());
        if !env.is_scratch() {
            let def = env.registry().field(m, f)?;
            if def.store {
                writeback
                    .entry((m.clone(), *id))
                    .or_default()
                    .insert(f.clone(), v.clone());
            }
        }
    }

    for ((m, id), row) in &writeback {
        env.store().write(m, &[*id], row)?;
    }
    Ok(())
}

/// Run the compute method until no staged value changes. The iteration
/// cap is derived from the relation depth actually present in the data,
/// not a hardcoded constant, so termination is guaranteed and a
/// non-converging method is a loud engine error.
fn run_fixed_point(
    env: &Env,
    model: &str,
    batch: &Recordset,
    fdef: &FieldDef,
    method_fields: &[FieldDef],
    compute_fn: &ComputeFn,
) -> Result<(), OrmError> {
    let parent = recursive_parent_field(env, model, fdef);
    let cap = match &parent {
        Some(p) => relation_depth(env, model, batch.ids(), p)? + 1,
        None => batch.len(),
    };

    let mut prev: Option<BTreeMap<(i64, String), Value>> = None;
    for _ in 0..=cap {
        compute_fn(env, batch)?;
        let mut snap: BTreeMap<(i64, String), Value> = BTreeMap::new();
        for f in method_fields {
            for id in batch.ids() {
                if let Some(v) = env.staged_get(model, *id, &f.name) {
                    snap.insert((*id, f.name.clone()), v);
                }
            }
        }
        if prev.as_ref() == Some(&snap) {
            return Ok(());
        }
        prev = Some(snap);
    }

    Err(OrmError::Internal(format!(
        "recursive computation of {}.{} did not converge within the relation depth",
        model, fdef.name
    )))
}

/// The self-referencing many2one a recursive field iterates over, found
/// in its dependency paths.
fn recursive_parent_field(env: &Env, model: &str, fdef: &FieldDef) -> Option<String> {
    for path in &fdef.depends {
        let first = path.split('.').next()?;
        if let Ok(sdef) = env.registry().field(model, first) {
            if let FieldKind::Many2one { comodel } = &sdef.kind {
                if comodel == model {
                    return Some(first.to_string());
                }
            }
        }
    }
    None
}

/// Close the batch over its ancestor chain so the fixed point can
/// observe every record it depends on.
fn expand_ancestors(
    env: &Env,
    model: &str,
    ids: &[i64],
    fdef: &FieldDef,
) -> Result<Vec<i64>, OrmError> {
    let parent = match recursive_parent_field(env, model, fdef) {
        Some(p) => p,
        None => return Ok(ids.to_vec()),
    };
    let mut out: Vec<i64> = ids.to_vec();
    let mut seen: BTreeSet<i64> = ids.iter().copied().collect();
    let mut frontier = ids.to_vec();
    while !frontier.is_empty() {
        let parents = env.read_refs(model, &frontier, &parent)?;
        frontier = parents
            .into_iter()
            .filter(|id| seen.insert(*id))
            .collect();
        out.extend_from_slice(&frontier);
    }
    Ok(out)
}

/// Longest parent chain among `ids`, measured against the data (cycles
/// in the data terminate the walk rather than the process).
fn relation_depth(
    env: &Env,
    model: &str,
    ids: &[i64],
    parent_field: &str,
) -> Result<usize, OrmError> {
    let mut max_depth = 0;
    for id in ids {
        let mut depth = 0;
        let mut visited: BTreeSet<i64> = BTreeSet::new();
        visited.insert(*id);
        let mut cur = *id;
        loop {
            let parents = env.read_refs(model, &[cur], parent_field)?;
            match parents.first() {
                Some(p) if visited.insert(*p) => {
                    depth += 1;
                    cur = *p;
                }
                _ => break,
            }
        }
        max_depth = max_depth.max(depth);
    }
    Ok(max_depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::AccessGate;
    use crate::model::ModelDescriptor;
    use crate::registry::ModelRegistry;
    use crate::store::MemStore;
    use crate::value::row;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use terp_core::Context;

    /// Point-of-sale shaped fixture: orders with computed stored totals
    /// over their lines, a related partner name, a batch-counted virtual
    /// score on partners, and a recursive location tree.
    fn pos_env() -> (Env, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let score_calls = calls.clone();

        let partner = ModelDescriptor::new("res.partner")
            .fields(vec![
                FieldDef::char("name"),
                FieldDef::boolean("vip").with_default(Value::Bool(false)),
                FieldDef::float("score").computed("_compute_score", &["vip"]),
            ])
            .compute(
                "_compute_score",
                Arc::new(move |env, rs| {
                    score_calls.fetch_add(1, Ordering::SeqCst);
                    let vips = rs.get("vip")?;
                    for (id, vip) in rs.ids().iter().zip(vips.iter()) {
                        let score = if vip.truthy() { 10.0 } else { 1.0 };
                        env.put_computed("res.partner", *id, "score", Value::Float(score))?;
                    }
                    Ok(())
                }),
            );

        let order = ModelDescriptor::new("pos.order")
            .fields(vec![
                FieldDef::char("name"),
                FieldDef::many2one("partner_id", "res.partner"),
                FieldDef::char("partner_name").related_to("partner_id.name"),
                FieldDef::float("discount").with_default(Value::Float(0.0)),
                FieldDef::one2many("lines", "pos.order.line", "order_id"),
                FieldDef::float("amount_total")
                    .computed("_compute_amount", &["lines.price_subtotal", "discount"])
                    .stored(),
            ])
            .compute(
                "_compute_amount",
                Arc::new(|env, rs| {
                    for rec in rs.iter() {
                        let id = rec.single()?;
                        let lines = rec.related_set("lines")?;
                        let sum: f64 = lines
                            .get("price_subtotal")?
                            .iter()
                            .filter_map(|v| v.as_float())
                            .sum();
                        let discount = rec.get_one("discount")?.as_float().unwrap_or(0.0);
                        env.put_computed("pos.order", id, "amount_total", Value::Float(sum - discount))?;
                    }
                    Ok(())
                }),
            );

        let line = ModelDescriptor::new("pos.order.line")
            .fields(vec![
                FieldDef::many2one("order_id", "pos.order"),
                FieldDef::integer("qty").with_default(Value::Int(1)),
                FieldDef::float("price_unit").with_default(Value::Float(0.0)),
                FieldDef::float("price_subtotal")
                    .computed("_compute_subtotal", &["qty", "price_unit"])
                    .stored(),
            ])
            .compute(
                "_compute_subtotal",
                Arc::new(|env, rs| {
                    let qtys = rs.get("qty")?;
                    let units = rs.get("price_unit")?;
                    for ((id, q), u) in rs.ids().iter().zip(qtys.iter()).zip(units.iter()) {
                        let v = q.as_float().unwrap_or(0.0) * u.as_float().unwrap_or(0.0);
                        env.put_computed("pos.order.line", *id, "price_subtotal", Value::Float(v))?;
                    }
                    Ok(())
                }),
            );

        let location = ModelDescriptor::new("stock.location")
            .fields(vec![
                FieldDef::char("name"),
                FieldDef::many2one("location_id", "stock.location"),
                FieldDef::char("complete_name")
                    .computed(
                        "_compute_complete_name",
                        &["name", "location_id.complete_name"],
                    )
                    .recursive()
                    .with_default(Value::Str(String::new())),
            ])
            .compute(
                "_compute_complete_name",
                Arc::new(|env, rs| {
                    for rec in rs.iter() {
                        let id = rec.single()?;
                        let name = rec
                            .get_one("name")?
                            .as_str()
                            .unwrap_or_default()
                            .to_string();
                        let full = match rec.get_one("location_id")?.as_ref_id() {
                            Some(pid) => {
                                let parent = env.browse("stock.location", &[pid])?;
                                let pname = parent
                                    .get_one("complete_name")?
                                    .as_str()
                                    .unwrap_or_default()
                                    .to_string();
                                if pname.is_empty() {
                                    name
                                } else {
                                    format!("{} / {}", pname, name)
                                }
                            }
                            None => name,
                        };
                        env.put_computed("stock.location", id, "complete_name", Value::Str(full))?;
                    }
                    Ok(())
                }),
            );

        let registry =
            ModelRegistry::build(vec![partner, order, line, location]).unwrap();
        let env = Env::new(
            Arc::new(registry),
            Arc::new(MemStore::new()),
            Arc::new(AccessGate::allow_all()),
            Context::new(2),
        );
        (env, calls)
    }

    fn new_order(env: &Env) -> i64 {
        let order = env
            .create("pos.order", row(&[("name", Value::Str("order 1".into()))]))
            .unwrap();
        let oid = order.single().unwrap();
        env.create(
            "pos.order.line",
            row(&[
                ("order_id", Value::Ref(oid)),
                ("qty", Value::Int(1)),
                ("price_unit", Value::Float(5.0)),
            ]),
        )
        .unwrap();
        env.create(
            "pos.order.line",
            row(&[
                ("order_id", Value::Ref(oid)),
                ("qty", Value::Int(2)),
                ("price_unit", Value::Float(3.0)),
            ]),
        )
        .unwrap();
        oid
    }

    #[test]
    fn batch_of_fifty_invokes_compute_once() {
        let (env, calls) = pos_env();
        let mut ids = Vec::new();
        for i in 0..50 {
            let p = env
                .create(
                    "res.partner",
                    row(&[
                        ("name", Value::Str(format!("p{}", i))),
                        ("vip", Value::Bool(i % 2 == 0)),
                    ]),
                )
                .unwrap();
            ids.push(p.single().unwrap());
        }
        let rs = env.browse("res.partner", &ids).unwrap();
        let scores = rs.get("score").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scores.len(), 50);
        assert_eq!(scores[0], Value::Float(10.0));
        assert_eq!(scores[1], Value::Float(1.0));

        // Second read is served from cache.
        rs.get("score").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn singleton_compute_also_invokes_once() {
        let (env, calls) = pos_env();
        let p = env
            .create("res.partner", row(&[("name", Value::Str("solo".into()))]))
            .unwrap();
        assert_eq!(p.get_one("score").unwrap(), Value::Float(1.0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidation_forces_recompute() {
        let (env, calls) = pos_env();
        let p = env
            .create("res.partner", row(&[("name", Value::Str("x".into()))]))
            .unwrap();
        p.get_one("score").unwrap();
        env.invalidate_cache(Some(&["score"]));
        p.get_one("score").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn writing_a_dependency_updates_the_computed_value() {
        let (env, calls) = pos_env();
        let p = env
            .create("res.partner", row(&[("name", Value::Str("x".into()))]))
            .unwrap();
        assert_eq!(p.get_one("score").unwrap(), Value::Float(1.0));
        env.write(&p, &row(&[("vip", Value::Bool(true))])).unwrap();
        assert_eq!(p.get_one("score").unwrap(), Value::Float(10.0));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn order_total_sums_line_subtotals() {
        let (env, _) = pos_env();
        let oid = new_order(&env);
        let order = env.browse("pos.order", &[oid]).unwrap();
        assert_eq!(order.get_one("amount_total").unwrap(), Value::Float(11.0));
    }

    #[test]
    fn stored_computed_values_are_written_back() {
        let (env, _) = pos_env();
        let oid = new_order(&env);
        let order = env.browse("pos.order", &[oid]).unwrap();
        order.get_one("amount_total").unwrap();

        let rows = env.store().read("pos.order", &[oid]).unwrap();
        assert_eq!(rows[0].1.get("amount_total"), Some(&Value::Float(11.0)));
    }

    #[test]
    fn child_write_invalidates_parent_total() {
        let (env, _) = pos_env();
        let oid = new_order(&env);
        let order = env.browse("pos.order", &[oid]).unwrap();
        assert_eq!(order.get_one("amount_total").unwrap(), Value::Float(11.0));

        let lines = order.related_set("lines").unwrap();
        let second = env.browse("pos.order.line", &[lines.ids()[1]]).unwrap();
        env.write(&second, &row(&[("qty", Value::Int(3))])).unwrap();

        assert_eq!(order.get_one("amount_total").unwrap(), Value::Float(14.0));
    }

    #[test]
    fn same_model_dependency_invalidates_too() {
        let (env, _) = pos_env();
        let oid = new_order(&env);
        let order = env.browse("pos.order", &[oid]).unwrap();
        assert_eq!(order.get_one("amount_total").unwrap(), Value::Float(11.0));
        env.write(&order, &row(&[("discount", Value::Float(2.0))]))
            .unwrap();
        assert_eq!(order.get_one("amount_total").unwrap(), Value::Float(9.0));
    }

    #[test]
    fn reassigning_a_line_updates_both_orders() {
        let (env, _) = pos_env();
        let oid1 = new_order(&env);
        let order2 = env
            .create("pos.order", row(&[("name", Value::Str("order 2".into()))]))
            .unwrap();
        let oid2 = order2.single().unwrap();

        let order1 = env.browse("pos.order", &[oid1]).unwrap();
        assert_eq!(order1.get_one("amount_total").unwrap(), Value::Float(11.0));
        assert_eq!(order2.get_one("amount_total").unwrap(), Value::Float(0.0));

        // Move the 5.0 line over to the second order.
        let lines = order1.related_set("lines").unwrap();
        let moved = env.browse("pos.order.line", &[lines.ids()[0]]).unwrap();
        env.write(&moved, &row(&[("order_id", Value::Ref(oid2))]))
            .unwrap();

        assert_eq!(order1.get_one("amount_total").unwrap(), Value::Float(6.0));
        assert_eq!(order2.get_one("amount_total").unwrap(), Value::Float(5.0));
    }

    #[test]
    fn related_field_forwards_partner_name() {
        let (env, _) = pos_env();
        let partner = env
            .create("res.partner", row(&[("name", Value::Str("Ada".into()))]))
            .unwrap();
        let pid = partner.single().unwrap();
        let order = env
            .create(
                "pos.order",
                row(&[
                    ("name", Value::Str("o".into())),
                    ("partner_id", Value::Ref(pid)),
                ]),
            )
            .unwrap();
        assert_eq!(
            order.get_one("partner_name").unwrap(),
            Value::Str("Ada".into())
        );

        env.write(&partner, &row(&[("name", Value::Str("Grace".into()))]))
            .unwrap();
        assert_eq!(
            order.get_one("partner_name").unwrap(),
            Value::Str("Grace".into())
        );
    }

    #[test]
    fn related_through_null_reference_is_null() {
        let (env, _) = pos_env();
        let order = env
            .create("pos.order", row(&[("name", Value::Str("o".into()))]))
            .unwrap();
        assert_eq!(order.get_one("partner_name").unwrap(), Value::Null);
    }

    #[test]
    fn recursive_complete_name_walks_the_tree() {
        let (env, _) = pos_env();
        let a = env
            .create("stock.location", row(&[("name", Value::Str("A".into()))]))
            .unwrap();
        let b = env
            .create(
                "stock.location",
                row(&[
                    ("name", Value::Str("B".into())),
                    ("location_id", Value::Ref(a.single().unwrap())),
                ]),
            )
            .unwrap();
        let c = env
            .create(
                "stock.location",
                row(&[
                    ("name", Value::Str("C".into())),
                    ("location_id", Value::Ref(b.single().unwrap())),
                ]),
            )
            .unwrap();

        assert_eq!(
            c.get_one("complete_name").unwrap(),
            Value::Str("A / B / C".into())
        );

        // Renaming the root propagates down the chain.
        env.write(&a, &row(&[("name", Value::Str("Z".into()))])).unwrap();
        assert_eq!(
            c.get_one("complete_name").unwrap(),
            Value::Str("Z / B / C".into())
        );
        assert_eq!(
            b.get_one("complete_name").unwrap(),
            Value::Str("Z / B".into())
        );
    }

    #[test]
    fn onchange_previews_without_touching_the_store() {
        let (env, _) = pos_env();
        let oid = new_order(&env);
        let order = env.browse("pos.order", &[oid]).unwrap();
        assert_eq!(order.get_one("amount_total").unwrap(), Value::Float(11.0));

        let diff = env
            .onchange(
                &order,
                &row(&[("discount", Value::Float(2.0))]),
                &["amount_total"],
            )
            .unwrap();
        assert_eq!(diff.get("amount_total"), Some(&Value::Float(9.0)));

        // The real transaction is untouched.
        assert_eq!(order.get_one("amount_total").unwrap(), Value::Float(11.0));
        let rows = env.store().read("pos.order", &[oid]).unwrap();
        assert_eq!(rows[0].1.get("discount"), Some(&Value::Float(0.0)));
    }

    #[test]
    fn onchange_reports_nothing_when_watch_is_unaffected() {
        let (env, _) = pos_env();
        let oid = new_order(&env);
        let order = env.browse("pos.order", &[oid]).unwrap();
        let diff = env
            .onchange(
                &order,
                &row(&[("name", Value::Str("renamed".into()))]),
                &["amount_total"],
            )
            .unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn missing_record_read_fails() {
        let (env, _) = pos_env();
        let rs = env.browse("pos.order", &[404]).unwrap();
        let err = rs.get("name").unwrap_err();
        assert!(matches!(err, OrmError::MissingRecord { id: 404, .. }));
    }

    #[test]
    fn compute_leaving_a_record_unset_fails_the_whole_batch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cx_calls = calls.clone();
        let forgetful = ModelDescriptor::new("m")
            .fields(vec![
                FieldDef::char("name"),
                FieldDef::float("x").computed("_cx", &["name"]),
            ])
            .compute(
                "_cx",
                Arc::new(move |env, rs| {
                    cx_calls.fetch_add(1, Ordering::SeqCst);
                    // Only the first record gets a value.
                    if let Some(id) = rs.ids().first() {
                        env.put_computed("m", *id, "x", Value::Float(1.0))?;
                    }
                    Ok(())
                }),
            );
        let registry = ModelRegistry::build(vec![forgetful]).unwrap();
        let env = Env::new(
            Arc::new(registry),
            Arc::new(MemStore::new()),
            Arc::new(AccessGate::allow_all()),
            Context::new(2),
        );
        let a = env.create("m", row(&[("name", Value::Str("a".into()))])).unwrap();
        let b = env.create("m", row(&[("name", Value::Str("b".into()))])).unwrap();
        let both = a.union(&b).unwrap();

        let err = both.get("x").unwrap_err();
        assert!(matches!(err, OrmError::ComputeUnset { .. }));

        // All-or-nothing: the record that WAS assigned did not slip into
        // cache — reading it alone runs the method again.
        assert_eq!(a.get_one("x").unwrap(), Value::Float(1.0));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
