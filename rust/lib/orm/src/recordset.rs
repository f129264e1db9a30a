//! Recordsets: ordered, deduplicated id collections bound to an
//! environment.
//!
//! A recordset is an immutable value object — set algebra produces new
//! recordsets, nothing mutates in place. It is always a collection;
//! scalar access goes through the explicit [`Recordset::single`].

use crate::env::Env;
use crate::error::OrmError;
use crate::value::Value;

#[derive(Clone)]
pub struct Recordset {
    env: Env,
    model: String,
    ids: Vec<i64>,
}

/// Order-preserving de-duplication.
pub(crate) fn dedup_ids(ids: &[i64]) -> Vec<i64> {
    let mut seen = std::collections::BTreeSet::new();
    ids.iter()
        .copied()
        .filter(|id| seen.insert(*id))
        .collect()
}

impl Recordset {
    pub(crate) fn new(env: Env, model: &str, ids: &[i64]) -> Self {
        Self {
            env,
            model: model.to_string(),
            ids: dedup_ids(ids),
        }
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    /// The sole id of this recordset; fails on any other size.
    pub fn single(&self) -> Result<i64, OrmError> {
        match self.ids.as_slice() {
            [id] => Ok(*id),
            other => Err(OrmError::MultipleRecords(other.len())),
        }
    }

    /// Iterate as singleton recordsets sharing this environment.
    pub fn iter(&self) -> impl Iterator<Item = Recordset> + '_ {
        self.ids.iter().map(move |id| Recordset {
            env: self.env.clone(),
            model: self.model.clone(),
            ids: vec![*id],
        })
    }

    fn check_model(&self, other: &Recordset) -> Result<(), OrmError> {
        if self.model != other.model {
            return Err(OrmError::ModelMismatch(
                self.model.clone(),
                other.model.clone(),
            ));
        }
        Ok(())
    }

    /// Union, preserving left-operand ordering.
    pub fn union(&self, other: &Recordset) -> Result<Recordset, OrmError> {
        self.check_model(other)?;
        let mut ids = self.ids.clone();
        ids.extend_from_slice(&other.ids);
        Ok(Recordset::new(self.env.clone(), &self.model, &ids))
    }

    /// Intersection: left ordering filtered by membership in the right.
    pub fn intersect(&self, other: &Recordset) -> Result<Recordset, OrmError> {
        self.check_model(other)?;
        let ids: Vec<i64> = self
            .ids
            .iter()
            .copied()
            .filter(|id| other.ids.contains(id))
            .collect();
        Ok(Recordset::new(self.env.clone(), &self.model, &ids))
    }

    /// Difference, preserving left-operand ordering.
    pub fn difference(&self, other: &Recordset) -> Result<Recordset, OrmError> {
        self.check_model(other)?;
        let ids: Vec<i64> = self
            .ids
            .iter()
            .copied()
            .filter(|id| !other.ids.contains(id))
            .collect();
        Ok(Recordset::new(self.env.clone(), &self.model, &ids))
    }

    /// Subset of ids that currently have a backing row. Never raises
    /// for missing ids — existence is exactly what it reports.
    pub fn exists(&self) -> Result<Recordset, OrmError> {
        let present = self.env.store().exists(&self.model, &self.ids)?;
        let ids: Vec<i64> = self
            .ids
            .iter()
            .copied()
            .filter(|id| present.contains(id))
            .collect();
        Ok(Recordset::new(self.env.clone(), &self.model, &ids))
    }

    /// Field values for every record, in id order. Triggers batched
    /// reads/computation for ids not in cache.
    pub fn get(&self, field: &str) -> Result<Vec<Value>, OrmError> {
        crate::compute::fetch(&self.env, self, field)
    }

    /// Scalar convenience accessor; requires exactly one record.
    pub fn get_one(&self, field: &str) -> Result<Value, OrmError> {
        self.single()?;
        Ok(self.get(field)?.remove(0))
    }

    /// Follow a relational field, returning the referenced records as
    /// one recordset on the comodel (order-preserving, deduplicated).
    pub fn related_set(&self, field: &str) -> Result<Recordset, OrmError> {
        let fdef = self.env.registry().field(&self.model, field)?;
        let comodel = fdef
            .kind
            .comodel()
            .ok_or_else(|| {
                OrmError::Validation(format!(
                    "{}.{} is not a relational field",
                    self.model, field
                ))
            })?
            .to_string();
        let values = self.get(field)?;
        let mut ids = Vec::new();
        for v in &values {
            ids.extend(v.ref_ids());
        }
        Ok(Recordset::new(self.env.clone(), &comodel, &ids))
    }
}

impl PartialEq for Recordset {
    fn eq(&self, other: &Self) -> bool {
        self.model == other.model && self.ids == other.ids
    }
}

impl std::fmt::Debug for Recordset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{:?}", self.model, self.ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::AccessGate;
    use crate::model::{FieldDef, ModelDescriptor};
    use crate::registry::ModelRegistry;
    use crate::store::MemStore;
    use std::sync::Arc;
    use terp_core::Context;

    fn env() -> Env {
        let registry = ModelRegistry::build(vec![
            ModelDescriptor::new("res.partner").fields(vec![FieldDef::char("name")]),
            ModelDescriptor::new("res.users").fields(vec![FieldDef::char("login")]),
        ])
        .unwrap();
        Env::new(
            Arc::new(registry),
            Arc::new(MemStore::new()),
            Arc::new(AccessGate::allow_all()),
            Context::new(2),
        )
    }

    #[test]
    fn browse_dedups_preserving_order() {
        let env = env();
        let rs = env.browse("res.partner", &[1, 2, 2, 3]).unwrap();
        assert_eq!(rs.ids(), &[1, 2, 3]);
    }

    #[test]
    fn union_is_idempotent() {
        let env = env();
        let a = env.browse("res.partner", &[3, 1]).unwrap();
        let b = env.browse("res.partner", &[2, 3]).unwrap();
        let ab = a.union(&b).unwrap();
        assert_eq!(ab.ids(), &[3, 1, 2]);
        assert_eq!(ab.union(&b).unwrap(), ab);
    }

    #[test]
    fn intersect_then_difference_is_empty() {
        let env = env();
        let a = env.browse("res.partner", &[1, 2, 3]).unwrap();
        let b = env.browse("res.partner", &[2, 3, 4]).unwrap();
        let both = a.intersect(&b).unwrap();
        assert_eq!(both.ids(), &[2, 3]);
        assert!(both.difference(&b).unwrap().is_empty());
    }

    #[test]
    fn difference_preserves_left_order() {
        let env = env();
        let a = env.browse("res.partner", &[5, 3, 1]).unwrap();
        let b = env.browse("res.partner", &[3]).unwrap();
        assert_eq!(a.difference(&b).unwrap().ids(), &[5, 1]);
    }

    #[test]
    fn cross_model_algebra_is_rejected() {
        let env = env();
        let a = env.browse("res.partner", &[1]).unwrap();
        let b = env.browse("res.users", &[1]).unwrap();
        assert!(matches!(a.union(&b), Err(OrmError::ModelMismatch(_, _))));
    }

    #[test]
    fn single_requires_exactly_one() {
        let env = env();
        assert_eq!(env.browse("res.partner", &[7]).unwrap().single().unwrap(), 7);
        let err = env.browse("res.partner", &[1, 2]).unwrap().single().unwrap_err();
        assert!(matches!(err, OrmError::MultipleRecords(2)));
        let err = env.browse("res.partner", &[]).unwrap().single().unwrap_err();
        assert!(matches!(err, OrmError::MultipleRecords(0)));
    }

    #[test]
    fn iteration_yields_singletons() {
        let env = env();
        let rs = env.browse("res.partner", &[1, 2]).unwrap();
        let singles: Vec<Recordset> = rs.iter().collect();
        assert_eq!(singles.len(), 2);
        assert_eq!(singles[0].ids(), &[1]);
        assert_eq!(singles[1].ids(), &[2]);
    }

    #[test]
    fn exists_filters_to_backed_rows() {
        let env = env();
        let created = env
            .create("res.partner", crate::value::row(&[("name", Value::Str("A".into()))]))
            .unwrap();
        let id = created.single().unwrap();
        let rs = env.browse("res.partner", &[id, 999]).unwrap();
        assert_eq!(rs.exists().unwrap().ids(), &[id]);
    }
}
