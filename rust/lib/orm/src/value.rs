use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A field value as held in the cache and the row store.
///
/// Relational values carry ids only — a record never embeds another
/// record. `Ref` is a many2one target, `RefList` a one2many/many2many
/// id set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ref(i64),
    RefList(Vec<i64>),
    Binary(Vec<u8>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Falsy check: null, false, 0, 0.0, "" and empty collections are
    /// all falsy — the semantics optional computed fields default to.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Ref(_) => true,
            Value::RefList(ids) => !ids.is_empty(),
            Value::Binary(b) => !b.is_empty(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric coercion: integers widen to floats.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_ref_id(&self) -> Option<i64> {
        match self {
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// Ids referenced by this value: one for `Ref`, all for `RefList`,
    /// none otherwise.
    pub fn ref_ids(&self) -> Vec<i64> {
        match self {
            Value::Ref(id) => vec![*id],
            Value::RefList(ids) => ids.clone(),
            _ => Vec::new(),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }
}

/// A partial or complete record as a field-name → value map.
pub type Row = BTreeMap<String, Value>;

/// Build a [`Row`] from field/value pairs.
pub fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
