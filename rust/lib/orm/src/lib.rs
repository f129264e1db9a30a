//! terp-orm — recordset and field-computation core.
//!
//! The engine business modules build on:
//!
//! - identity-mapped recordsets over rows addressed by opaque ids, with
//!   set algebra and lazy field access;
//! - a per-registry field dependency graph driving stale propagation,
//!   built once at startup and immutable afterwards;
//! - a batching computation engine for computed, related and recursive
//!   fields;
//! - a per-transaction value cache with scratch overlays for onchange
//!   simulation;
//! - a row store seam (in-memory and redb backends);
//! - an access-control gate with polymorphic delegation for attachments.
//!
//! Everything is passed explicitly — registry, store, gate, context —
//! there are no ambient globals.

pub mod acl;
pub mod attachment;
pub mod cache;
pub mod compute;
pub mod env;
pub mod error;
pub mod model;
pub mod recordset;
pub mod registry;
pub mod store;
pub mod value;

pub use acl::{AccessGate, AccessMode, AccessRule, AllowAll, DenyAll};
pub use attachment::{Attachments, NewAttachment};
pub use env::Env;
pub use error::OrmError;
pub use model::{ComputeFn, FieldDef, FieldKind, ModelDescriptor};
pub use recordset::Recordset;
pub use registry::ModelRegistry;
pub use store::{MemStore, RedbStore, RowStore};
pub use value::{Row, Value};
