//! Model registry and field dependency graph.
//!
//! Built once at startup from [`ModelDescriptor`]s, immutable afterwards,
//! and passed explicitly into the engine — never an ambient global.
//!
//! Building resolves every dependency path hop by hop across comodels
//! and produces the **inverse dependents index**: for each
//! `(model, field)`, the computed fields elsewhere that must be marked
//! stale when it changes, together with the relation walk that maps
//! changed ids to dependent ids. Genuine cycles (not flagged
//! `recursive`) fail the build.

use std::collections::{BTreeMap, BTreeSet};

use tracing::info;

use crate::error::OrmError;
use crate::model::{ComputeFn, FieldDef, FieldKind, ModelDescriptor};

/// One hop of a relation walk, mapping ids of one model to ids of the
/// next model toward the dependent record.
#[derive(Debug, Clone)]
pub enum Hop {
    /// Read the many2one `field` on `model` rows (child → parent).
    Up { model: String, field: String },
    /// Find `model` rows whose relational `field` references the ids
    /// (batched reverse scan).
    Search { model: String, field: String },
}

/// An entry of the inverse dependents index: when the source field
/// changes on some records, `field` on `model` must be marked stale for
/// every record reached by applying `walk` to the changed ids.
#[derive(Debug, Clone)]
pub struct Dependent {
    pub model: String,
    pub field: String,
    pub walk: Vec<Hop>,
}

struct ModelSlot {
    fields: BTreeMap<String, FieldDef>,
    computes: BTreeMap<String, ComputeFn>,
}

/// The registry: model namespace, merged field definitions, compute
/// methods and the dependency graph (forward declarations on the field
/// defs, inverse index here).
pub struct ModelRegistry {
    models: BTreeMap<String, ModelSlot>,
    dependents: BTreeMap<(String, String), Vec<Dependent>>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ModelRegistry {
    /// Build the registry. Fails fast, with a descriptive error, on:
    /// unknown models/fields in dependency or related paths, compute
    /// methods referenced but not registered, invalid one2many inverses,
    /// and dependency cycles not flagged `recursive`.
    pub fn build(descriptors: Vec<ModelDescriptor>) -> Result<ModelRegistry, OrmError> {
        let mut models: BTreeMap<String, ModelSlot> = BTreeMap::new();

        for d in descriptors {
            if models.contains_key(&d.name) {
                return Err(OrmError::Validation(format!(
                    "model {} declared twice",
                    d.name
                )));
            }
            // Flat-namespace merge: later field sets win on collision.
            let mut fields = BTreeMap::new();
            for set in &d.sets {
                for f in &set.fields {
                    fields.insert(f.name.clone(), f.clone());
                }
            }
            models.insert(
                d.name,
                ModelSlot {
                    fields,
                    computes: d.computes,
                },
            );
        }

        let mut dependents: BTreeMap<(String, String), Vec<Dependent>> = BTreeMap::new();
        // Edges leaf → computed field, for cycle detection.
        let mut edges: BTreeMap<(String, String), Vec<(String, String)>> = BTreeMap::new();

        for (mname, slot) in &models {
            for (fname, f) in &slot.fields {
                if let Some(method) = &f.compute {
                    if !slot.computes.contains_key(method) {
                        return Err(OrmError::Validation(format!(
                            "field {}.{}: compute method {} is not registered",
                            mname, fname, method
                        )));
                    }
                }
                if f.compute.is_some() && f.related.is_some() {
                    return Err(OrmError::Validation(format!(
                        "field {}.{}: compute and related are mutually exclusive",
                        mname, fname
                    )));
                }

                match &f.kind {
                    FieldKind::One2many { comodel, inverse } => {
                        let co = models.get(comodel).ok_or_else(|| {
                            OrmError::Validation(format!(
                                "field {}.{}: unknown comodel {}",
                                mname, fname, comodel
                            ))
                        })?;
                        match co.fields.get(inverse).map(|inv| &inv.kind) {
                            Some(FieldKind::Many2one { comodel: target }) if target == mname => {}
                            _ => {
                                return Err(OrmError::Validation(format!(
                                    "field {}.{}: inverse {}.{} must be a many2one to {}",
                                    mname, fname, comodel, inverse, mname
                                )));
                            }
                        }
                        // Changing the child's inverse pointer moves it
                        // between parents: the parent's one2many cache
                        // slot goes stale.
                        dependents
                            .entry((comodel.clone(), inverse.clone()))
                            .or_default()
                            .push(Dependent {
                                model: mname.clone(),
                                field: fname.clone(),
                                walk: vec![Hop::Up {
                                    model: comodel.clone(),
                                    field: inverse.clone(),
                                }],
                            });
                    }
                    FieldKind::Many2one { comodel } | FieldKind::Many2many { comodel } => {
                        if !models.contains_key(comodel) {
                            return Err(OrmError::Validation(format!(
                                "field {}.{}: unknown comodel {}",
                                mname, fname, comodel
                            )));
                        }
                    }
                    _ => {}
                }

                let mut paths: Vec<String> = f.depends.clone();
                if let Some(rel) = &f.related {
                    paths.push(rel.clone());
                }
                for path in &paths {
                    resolve_path(&models, &mut dependents, &mut edges, mname, fname, path)?;
                }

                if let Some(rel) = &f.related {
                    validate_related_path(&models, mname, fname, rel)?;
                }
            }
        }

        detect_cycles(&models, &edges)?;

        info!(
            models = models.len(),
            dependents = dependents.len(),
            "model registry built"
        );

        Ok(ModelRegistry { models, dependents })
    }

    pub fn has_model(&self, model: &str) -> bool {
        self.models.contains_key(model)
    }

    fn slot(&self, model: &str) -> Result<&ModelSlot, OrmError> {
        self.models
            .get(model)
            .ok_or_else(|| OrmError::UnknownModel(model.to_string()))
    }

    /// All merged fields of a model, keyed by name.
    pub fn fields(&self, model: &str) -> Result<&BTreeMap<String, FieldDef>, OrmError> {
        Ok(&self.slot(model)?.fields)
    }

    pub fn field(&self, model: &str, name: &str) -> Result<&FieldDef, OrmError> {
        self.slot(model)?
            .fields
            .get(name)
            .ok_or_else(|| OrmError::UnknownField {
                model: model.to_string(),
                field: name.to_string(),
            })
    }

    pub fn compute_fn(&self, model: &str, method: &str) -> Result<ComputeFn, OrmError> {
        self.slot(model)?
            .computes
            .get(method)
            .cloned()
            .ok_or_else(|| {
                OrmError::Internal(format!("no compute method {} on {}", method, model))
            })
    }

    /// All fields served by one compute method on a model.
    pub fn method_fields(&self, model: &str, method: &str) -> Vec<FieldDef> {
        self.models
            .get(model)
            .map(|slot| {
                slot.fields
                    .values()
                    .filter(|f| f.compute.as_deref() == Some(method))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Inverse dependents of `(model, field)`.
    pub fn dependents(&self, model: &str, field: &str) -> &[Dependent] {
        self.dependents
            .get(&(model.to_string(), field.to_string()))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// Resolve one dependency path declared on `(model, field)`, registering
/// a dependent entry at every hop and a cycle-detection edge at the leaf.
fn resolve_path(
    models: &BTreeMap<String, ModelSlot>,
    dependents: &mut BTreeMap<(String, String), Vec<Dependent>>,
    edges: &mut BTreeMap<(String, String), Vec<(String, String)>>,
    model: &str,
    field: &str,
    path: &str,
) -> Result<(), OrmError> {
    let segs: Vec<&str> = path.split('.').collect();
    let mut cur_model = model.to_string();
    // Maps ids of `cur_model` to ids of `model`, built up as we descend.
    let mut walk: Vec<Hop> = Vec::new();

    for (i, seg) in segs.iter().enumerate() {
        let slot = models.get(&cur_model).ok_or_else(|| {
            OrmError::Validation(format!(
                "field {}.{}: dependency path {:?}: unknown model {}",
                model, field, path, cur_model
            ))
        })?;
        let sdef = slot.fields.get(*seg).ok_or_else(|| {
            OrmError::Validation(format!(
                "field {}.{}: dependency path {:?}: unknown field {}.{}",
                model, field, path, cur_model, seg
            ))
        })?;

        dependents
            .entry((cur_model.clone(), seg.to_string()))
            .or_default()
            .push(Dependent {
                model: model.to_string(),
                field: field.to_string(),
                walk: walk.clone(),
            });

        let last = i == segs.len() - 1;
        if last {
            if sdef.compute.is_some() || sdef.related.is_some() {
                edges
                    .entry((cur_model.clone(), seg.to_string()))
                    .or_default()
                    .push((model.to_string(), field.to_string()));
            }
            break;
        }

        let next_model = match &sdef.kind {
            FieldKind::One2many { comodel, inverse } => {
                walk.insert(
                    0,
                    Hop::Up {
                        model: comodel.clone(),
                        field: inverse.clone(),
                    },
                );
                comodel.clone()
            }
            FieldKind::Many2one { comodel } | FieldKind::Many2many { comodel } => {
                walk.insert(
                    0,
                    Hop::Search {
                        model: cur_model.clone(),
                        field: seg.to_string(),
                    },
                );
                comodel.clone()
            }
            _ => {
                return Err(OrmError::Validation(format!(
                    "field {}.{}: dependency path {:?}: {}.{} is not relational",
                    model, field, path, cur_model, seg
                )));
            }
        };
        cur_model = next_model;
    }

    Ok(())
}

/// Related paths forward a scalar through many2one hops only.
fn validate_related_path(
    models: &BTreeMap<String, ModelSlot>,
    model: &str,
    field: &str,
    path: &str,
) -> Result<(), OrmError> {
    let segs: Vec<&str> = path.split('.').collect();
    if segs.len() < 2 {
        return Err(OrmError::Validation(format!(
            "field {}.{}: related path {:?} must cross at least one relation",
            model, field, path
        )));
    }
    let mut cur_model = model.to_string();
    for seg in &segs[..segs.len() - 1] {
        let sdef = models
            .get(&cur_model)
            .and_then(|s| s.fields.get(*seg))
            .ok_or_else(|| {
                OrmError::Validation(format!(
                    "field {}.{}: related path {:?}: unknown field {}.{}",
                    model, field, path, cur_model, seg
                ))
            })?;
        match &sdef.kind {
            FieldKind::Many2one { comodel } => cur_model = comodel.clone(),
            _ => {
                return Err(OrmError::Validation(format!(
                    "field {}.{}: related path {:?}: {}.{} must be a many2one",
                    model, field, path, cur_model, seg
                )));
            }
        }
    }
    Ok(())
}

/// Depth-first cycle check over `(model, field)` nodes. A cycle is legal
/// only if every computed field on it is flagged `recursive`.
fn detect_cycles(
    models: &BTreeMap<String, ModelSlot>,
    edges: &BTreeMap<(String, String), Vec<(String, String)>>,
) -> Result<(), OrmError> {
    let mut done: BTreeSet<(String, String)> = BTreeSet::new();

    for start in edges.keys() {
        if done.contains(start) {
            continue;
        }
        let mut stack: Vec<((String, String), usize)> = vec![(start.clone(), 0)];
        let mut on_path: Vec<(String, String)> = vec![start.clone()];

        while let Some((node, next_idx)) = stack.pop() {
            let nexts = edges.get(&node).map(|v| v.as_slice()).unwrap_or(&[]);
            if next_idx >= nexts.len() {
                done.insert(node.clone());
                on_path.pop();
                continue;
            }
            stack.push((node.clone(), next_idx + 1));
            let succ = nexts[next_idx].clone();
            if let Some(pos) = on_path.iter().position(|n| n == &succ) {
                let cycle: Vec<(String, String)> = on_path[pos..].to_vec();
                let all_recursive = cycle.iter().all(|(m, f)| {
                    models
                        .get(m)
                        .and_then(|s| s.fields.get(f))
                        .map(|d| d.recursive)
                        .unwrap_or(false)
                });
                if !all_recursive {
                    let chain: Vec<String> =
                        cycle.iter().map(|(m, f)| format!("{}.{}", m, f)).collect();
                    return Err(OrmError::Validation(format!(
                        "cyclic field dependency: {} -> {}",
                        chain.join(" -> "),
                        chain[0]
                    )));
                }
                continue;
            }
            if done.contains(&succ) {
                continue;
            }
            on_path.push(succ.clone());
            stack.push((succ, 0));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldDef;
    use crate::value::Value;
    use std::sync::Arc;

    fn noop() -> ComputeFn {
        Arc::new(|_, _| Ok(()))
    }

    #[test]
    fn mixin_merge_is_last_wins() {
        let reg = ModelRegistry::build(vec![
            ModelDescriptor::new("res.partner")
                .fields(vec![FieldDef::char("name"), FieldDef::integer("color")])
                .mixin(
                    "portal.mixin",
                    vec![FieldDef::integer("color").with_default(Value::Int(7))],
                ),
        ])
        .unwrap();
        let color = reg.field("res.partner", "color").unwrap();
        assert_eq!(color.default, Some(Value::Int(7)));
    }

    #[test]
    fn unknown_dependency_field_fails_the_build() {
        let err = ModelRegistry::build(vec![
            ModelDescriptor::new("pos.order")
                .fields(vec![
                    FieldDef::float("total").computed("_compute_total", &["nope"]),
                ])
                .compute("_compute_total", noop()),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("unknown field pos.order.nope"));
    }

    #[test]
    fn missing_compute_method_fails_the_build() {
        let err = ModelRegistry::build(vec![ModelDescriptor::new("pos.order").fields(vec![
            FieldDef::float("total").computed("_compute_total", &[]),
        ])])
        .unwrap_err();
        assert!(err.to_string().contains("_compute_total"));
    }

    #[test]
    fn cycle_without_recursive_flag_is_rejected() {
        let err = ModelRegistry::build(vec![
            ModelDescriptor::new("m")
                .fields(vec![
                    FieldDef::float("a").computed("_ca", &["b"]),
                    FieldDef::float("b").computed("_cb", &["a"]),
                ])
                .compute("_ca", noop())
                .compute("_cb", noop()),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("cyclic field dependency"));
    }

    #[test]
    fn recursive_self_dependency_is_allowed() {
        let reg = ModelRegistry::build(vec![
            ModelDescriptor::new("stock.location")
                .fields(vec![
                    FieldDef::char("name"),
                    FieldDef::many2one("location_id", "stock.location"),
                    FieldDef::char("complete_name")
                        .computed("_compute_complete_name", &["name", "location_id.complete_name"])
                        .recursive()
                        .with_default(Value::Str(String::new())),
                ])
                .compute("_compute_complete_name", noop()),
        ]);
        assert!(reg.is_ok());
    }

    #[test]
    fn inverse_index_maps_child_field_to_parent_total() {
        let reg = ModelRegistry::build(vec![
            ModelDescriptor::new("pos.order")
                .fields(vec![
                    FieldDef::one2many("lines", "pos.order.line", "order_id"),
                    FieldDef::float("amount_total")
                        .computed("_compute_amount", &["lines.price_subtotal"])
                        .stored(),
                ])
                .compute("_compute_amount", noop()),
            ModelDescriptor::new("pos.order.line").fields(vec![
                FieldDef::float("price_subtotal"),
                FieldDef::many2one("order_id", "pos.order"),
            ]),
        ])
        .unwrap();

        let deps = reg.dependents("pos.order.line", "price_subtotal");
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].model, "pos.order");
        assert_eq!(deps[0].field, "amount_total");
        assert_eq!(deps[0].walk.len(), 1);

        // Editing the relation itself also invalidates the total.
        let deps = reg.dependents("pos.order", "lines");
        assert!(deps.iter().any(|d| d.field == "amount_total" && d.walk.is_empty()));
    }

    #[test]
    fn bad_one2many_inverse_fails_the_build() {
        let err = ModelRegistry::build(vec![
            ModelDescriptor::new("a").fields(vec![FieldDef::one2many("kids", "b", "parent")]),
            ModelDescriptor::new("b").fields(vec![FieldDef::char("parent")]),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("must be a many2one"));
    }
}
