//! Model and field declarations.
//!
//! Business modules describe their models with [`ModelDescriptor`]s:
//! a base field set plus optional mixin field sets, merged into one flat
//! namespace when the registry is built (last definition wins — explicit
//! override, no MRO). Compute methods are registered by name next to the
//! fields that reference them.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::env::Env;
use crate::error::OrmError;
use crate::recordset::Recordset;
use crate::value::Value;

/// Semantic type of a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Char,
    Text,
    Integer,
    Float,
    Boolean,
    Selection,
    Binary,
    Datetime,
    Many2one { comodel: String },
    One2many { comodel: String, inverse: String },
    Many2many { comodel: String },
}

impl FieldKind {
    /// Comodel of a relational kind, if any.
    pub fn comodel(&self) -> Option<&str> {
        match self {
            FieldKind::Many2one { comodel }
            | FieldKind::One2many { comodel, .. }
            | FieldKind::Many2many { comodel } => Some(comodel),
            _ => None,
        }
    }
}

/// A compute method: invoked once per batch of records, expected to
/// assign every field it serves for every record via
/// [`Env::put_computed`]. Compute methods use batched reads internally —
/// the engine never calls them per record.
pub type ComputeFn = Arc<dyn Fn(&Env, &Recordset) -> Result<(), OrmError> + Send + Sync>;

/// Declaration of one field on a model.
///
/// The `{store, compute, depends, related, recursive, default}` surface
/// is the contract business-model authors rely on; the engine honors
/// exactly these semantics.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,

    /// Whether the value is persisted in the row store. Plain fields
    /// default to true; computed fields to false unless `.stored()`.
    pub store: bool,

    /// Name of the compute method serving this field.
    pub compute: Option<String>,

    /// Dependency paths, possibly crossing relations
    /// (`"lines.price_subtotal"`).
    pub depends: Vec<String>,

    /// Path of a related (forwarding) field, e.g. `"partner_id.name"`.
    pub related: Option<String>,

    /// Allow this field in a dependency cycle; computation becomes
    /// fixed-point iteration bounded by the relation depth in the data.
    pub recursive: bool,

    /// Default value, also the fallback for optional computed fields a
    /// method legitimately leaves unset.
    pub default: Option<Value>,
}

impl FieldDef {
    fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            store: true,
            compute: None,
            depends: Vec::new(),
            related: None,
            recursive: false,
            default: None,
        }
    }

    pub fn char(name: &str) -> Self {
        Self::new(name, FieldKind::Char)
    }

    pub fn text(name: &str) -> Self {
        Self::new(name, FieldKind::Text)
    }

    pub fn integer(name: &str) -> Self {
        Self::new(name, FieldKind::Integer)
    }

    pub fn float(name: &str) -> Self {
        Self::new(name, FieldKind::Float)
    }

    pub fn boolean(name: &str) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    pub fn selection(name: &str) -> Self {
        Self::new(name, FieldKind::Selection)
    }

    pub fn binary(name: &str) -> Self {
        Self::new(name, FieldKind::Binary)
    }

    pub fn datetime(name: &str) -> Self {
        Self::new(name, FieldKind::Datetime)
    }

    pub fn many2one(name: &str, comodel: &str) -> Self {
        Self::new(
            name,
            FieldKind::Many2one {
                comodel: comodel.to_string(),
            },
        )
    }

    /// One2many fields are virtual: resolved through the comodel's
    /// inverse many2one, never stored in the row itself.
    pub fn one2many(name: &str, comodel: &str, inverse: &str) -> Self {
        let mut f = Self::new(
            name,
            FieldKind::One2many {
                comodel: comodel.to_string(),
                inverse: inverse.to_string(),
            },
        );
        f.store = false;
        f
    }

    pub fn many2many(name: &str, comodel: &str) -> Self {
        Self::new(
            name,
            FieldKind::Many2many {
                comodel: comodel.to_string(),
            },
        )
    }

    /// Mark as computed by `method` with the given dependency paths.
    /// Computed fields are virtual unless followed by `.stored()`.
    pub fn computed(mut self, method: &str, depends: &[&str]) -> Self {
        self.compute = Some(method.to_string());
        self.depends = depends.iter().map(|s| s.to_string()).collect();
        self.store = false;
        self
    }

    /// Persist the computed value in the row store.
    pub fn stored(mut self) -> Self {
        self.store = true;
        self
    }

    /// Forward the value reached through `path` (many2one hops).
    pub fn related_to(mut self, path: &str) -> Self {
        self.related = Some(path.to_string());
        self.store = false;
        self
    }

    /// Allow self-referencing dependencies (tree "complete name" style).
    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// A named group of fields contributed to a model — the base set or a
/// mixin. The origin label only serves diagnostics.
#[derive(Debug, Clone)]
pub struct FieldSet {
    pub origin: String,
    pub fields: Vec<FieldDef>,
}

/// Declarative description of one model, consumed by
/// [`crate::registry::ModelRegistry::build`].
pub struct ModelDescriptor {
    pub name: String,
    pub(crate) sets: Vec<FieldSet>,
    pub(crate) computes: BTreeMap<String, ComputeFn>,
}

impl ModelDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sets: Vec::new(),
            computes: BTreeMap::new(),
        }
    }

    /// The model's own field set.
    pub fn fields(mut self, fields: Vec<FieldDef>) -> Self {
        self.sets.push(FieldSet {
            origin: "base".to_string(),
            fields,
        });
        self
    }

    /// Add a mixin field set. Later sets override earlier ones on name
    /// collision.
    pub fn mixin(mut self, origin: &str, fields: Vec<FieldDef>) -> Self {
        self.sets.push(FieldSet {
            origin: origin.to_string(),
            fields,
        });
        self
    }

    /// Register a compute method under the name fields refer to.
    pub fn compute(mut self, method: &str, f: ComputeFn) -> Self {
        self.computes.insert(method.to_string(), f);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_fields_are_stored() {
        let f = FieldDef::char("name");
        assert!(f.store);
        assert!(f.compute.is_none());
    }

    #[test]
    fn computed_fields_are_virtual_unless_stored() {
        let f = FieldDef::float("total").computed("_compute_total", &["lines.price_subtotal"]);
        assert!(!f.store);
        let f = f.stored();
        assert!(f.store);
        assert_eq!(f.depends, vec!["lines.price_subtotal"]);
    }

    #[test]
    fn one2many_is_never_stored() {
        let f = FieldDef::one2many("lines", "pos.order.line", "order_id");
        assert!(!f.store);
        assert_eq!(f.kind.comodel(), Some("pos.order.line"));
    }
}
