//! Attachment metadata model and its content-store facade.
//!
//! An attachment row carries metadata only; the bytes live in a
//! [`ContentStore`] addressed by their SHA-1 checksum. Identical content
//! converges on one blob file, and deletion merely marks the name for
//! the deferred garbage-collection sweep.
//!
//! Access control is polymorphic: an attachment borrows the rules of
//! the record it is attached to. Reading one requires read access to
//! the target record; creating, modifying or deleting one requires
//! write access to it. Public attachments skip the read check.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use terp_blob::ContentStore;

use crate::acl::AccessMode;
use crate::env::Env;
use crate::error::OrmError;
use crate::model::{FieldDef, ModelDescriptor};
use crate::recordset::Recordset;
use crate::value::{Row, Value};

/// Input for [`Attachments::create`]: either raw bytes (a stored
/// binary) or an external URL.
pub struct NewAttachment {
    pub name: String,
    pub res_model: Option<String>,
    pub res_id: Option<i64>,
    pub public: bool,
    pub url: Option<String>,
    pub raw: Option<Vec<u8>>,
}

impl NewAttachment {
    pub fn binary(name: &str, raw: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            res_model: None,
            res_id: None,
            public: false,
            url: None,
            raw: Some(raw),
        }
    }

    pub fn url(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            res_model: None,
            res_id: None,
            public: false,
            url: Some(url.to_string()),
            raw: None,
        }
    }

    pub fn attached_to(mut self, res_model: &str, res_id: i64) -> Self {
        self.res_model = Some(res_model.to_string());
        self.res_id = Some(res_id);
        self
    }

    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }
}

/// Facade over the `ir.attachment` model and the content store.
pub struct Attachments {
    blobs: Arc<dyn ContentStore>,
}

impl Attachments {
    pub const MODEL: &'static str = "ir.attachment";

    /// The metadata model; hosts include it when building their
    /// registry.
    pub fn descriptor() -> ModelDescriptor {
        ModelDescriptor::new(Self::MODEL).fields(vec![
            FieldDef::char("name"),
            FieldDef::selection("kind").with_default(Value::Str("binary".into())),
            FieldDef::char("url"),
            FieldDef::char("res_model"),
            FieldDef::integer("res_id"),
            FieldDef::char("mimetype"),
            FieldDef::char("checksum"),
            FieldDef::char("store_fname"),
            FieldDef::integer("file_size").with_default(Value::Int(0)),
            FieldDef::boolean("public").with_default(Value::Bool(false)),
            FieldDef::datetime("create_date"),
        ])
    }

    pub fn new(blobs: Arc<dyn ContentStore>) -> Self {
        Self { blobs }
    }

    /// The delegated mode on the target record: reading an attachment
    /// needs read access, everything else needs write access.
    fn target_mode(mode: AccessMode) -> AccessMode {
        match mode {
            AccessMode::Read => AccessMode::Read,
            _ => AccessMode::Write,
        }
    }

    /// Check `mode` on existing attachments by delegating to the rules
    /// of their target records, batched per target model. Attachments
    /// without a target fall back to the gate's own `ir.attachment`
    /// rule, which already ran on the triggering operation.
    pub fn check(&self, env: &Env, mode: AccessMode, rs: &Recordset) -> Result<(), OrmError> {
        if env.ctx().is_superuser() || rs.is_empty() {
            return Ok(());
        }

        let rows = env.store().read(Self::MODEL, rs.ids())?;
        if rows.len() != rs.len() {
            let found: BTreeSet<i64> = rows.iter().map(|(id, _)| *id).collect();
            let id = rs.ids().iter().find(|id| !found.contains(*id)).copied();
            return Err(OrmError::MissingRecord {
                model: Self::MODEL.to_string(),
                id: id.unwrap_or_default(),
            });
        }

        let mut by_target: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        for (_, row) in &rows {
            if mode == AccessMode::Read
                && row.get("public").map(|v| v.truthy()).unwrap_or(false)
            {
                continue;
            }
            let res_model = row.get("res_model").and_then(|v| v.as_str());
            let res_id = row.get("res_id").and_then(|v| v.as_int());
            if let (Some(m), Some(r)) = (res_model, res_id) {
                by_target.entry(m.to_string()).or_default().push(r);
            }
        }

        let target = Self::target_mode(mode);
        for (model, ids) in &by_target {
            env.gate().check(env.ctx(), model, target, ids)?;
        }
        Ok(())
    }

    fn check_new_target(&self, env: &Env, na: &NewAttachment) -> Result<(), OrmError> {
        if let (Some(m), Some(r)) = (&na.res_model, na.res_id) {
            env.gate().check(env.ctx(), m, AccessMode::Write, &[r])?;
        }
        Ok(())
    }

    pub fn create(&self, env: &Env, na: NewAttachment) -> Result<Recordset, OrmError> {
        self.check_new_target(env, &na)?;

        let mut vals: Row = BTreeMap::new();
        vals.insert("name".into(), Value::Str(na.name.clone()));
        vals.insert("public".into(), Value::Bool(na.public));
        vals.insert(
            "create_date".into(),
            Value::Str(Utc::now().to_rfc3339()),
        );
        if let Some(m) = &na.res_model {
            vals.insert("res_model".into(), Value::Str(m.clone()));
        }
        if let Some(r) = na.res_id {
            vals.insert("res_id".into(), Value::Int(r));
        }

        match (&na.url, &na.raw) {
            (Some(url), _) => {
                vals.insert("kind".into(), Value::Str("url".into()));
                vals.insert("url".into(), Value::Str(url.clone()));
            }
            (None, Some(data)) => {
                let (checksum, fname) = self.blobs.add(data)?;
                debug!(name = %na.name, checksum = %checksum, size = data.len(), "attachment stored");
                vals.insert("kind".into(), Value::Str("binary".into()));
                vals.insert("checksum".into(), Value::Str(checksum));
                vals.insert("store_fname".into(), Value::Str(fname));
                vals.insert("file_size".into(), Value::Int(data.len() as i64));
                vals.insert(
                    "mimetype".into(),
                    Value::Str(guess_mimetype(data).to_string()),
                );
            }
            (None, None) => {
                return Err(OrmError::Validation(
                    "attachment needs either raw content or a url".into(),
                ));
            }
        }

        env.create(Self::MODEL, vals)
    }

    /// The stored bytes of one attachment. URL attachments have no
    /// stored content.
    pub fn raw(&self, env: &Env, rs: &Recordset) -> Result<Vec<u8>, OrmError> {
        rs.single()?;
        self.check(env, AccessMode::Read, rs)?;
        let kind = rs.get_one("kind")?;
        if kind.as_str() == Some("url") {
            return Err(OrmError::Validation(format!(
                "attachment {} is a url, it has no stored content",
                rs.ids()[0]
            )));
        }
        match rs.get_one("store_fname")?.as_str() {
            Some(fname) => Ok(self.blobs.read(fname)),
            None => Ok(Vec::new()),
        }
    }

    /// Replace the content of one attachment. The previous blob is
    /// marked for the sweep; the new content is deduplicated as usual.
    pub fn write_raw(&self, env: &Env, rs: &Recordset, data: &[u8]) -> Result<(), OrmError> {
        let id = rs.single()?;
        self.check(env, AccessMode::Write, rs)?;

        if let Some(old) = rs.get_one("store_fname")?.as_str() {
            self.blobs.mark_for_gc(old)?;
        }
        let (checksum, fname) = self.blobs.add(data)?;
        let vals = crate::value::row(&[
            ("kind", Value::Str("binary".into())),
            ("url", Value::Null),
            ("checksum", Value::Str(checksum)),
            ("store_fname", Value::Str(fname)),
            ("file_size", Value::Int(data.len() as i64)),
            ("mimetype", Value::Str(guess_mimetype(data).to_string())),
        ]);
        env.write(&env.browse(Self::MODEL, &[id])?, &vals)
    }

    /// Delete attachment rows. Blobs are only marked: content shared
    /// with surviving attachments stays on disk, and the sweep decides
    /// later using [`Attachments::live_checksums`].
    pub fn unlink(&self, env: &Env, rs: &Recordset) -> Result<(), OrmError> {
        if rs.is_empty() {
            return Ok(());
        }
        self.check(env, AccessMode::Unlink, rs)?;

        let mut fnames: Vec<String> = Vec::new();
        for (_, row) in env.store().read(Self::MODEL, rs.ids())? {
            if let Some(f) = row.get("store_fname").and_then(|v| v.as_str()) {
                fnames.push(f.to_string());
            }
        }
        env.unlink(rs)?;
        for fname in &fnames {
            self.blobs.mark_for_gc(fname)?;
        }
        Ok(())
    }

    /// Checksums still referenced by any attachment row — the live set
    /// the garbage-collection sweep must preserve.
    pub fn live_checksums(&self, env: &Env) -> Result<BTreeSet<String>, OrmError> {
        let ids = env.store().search_all(Self::MODEL)?;
        let mut live = BTreeSet::new();
        for (_, row) in env.store().read(Self::MODEL, &ids)? {
            if let Some(sum) = row.get("checksum").and_then(|v| v.as_str()) {
                live.insert(sum.to_string());
            }
        }
        Ok(live)
    }
}

/// Sniff a mimetype from magic bytes, falling back to `text/plain` for
/// valid UTF-8 and `application/octet-stream` otherwise.
pub fn guess_mimetype(data: &[u8]) -> &'static str {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if data.starts_with(b"\xff\xd8\xff") {
        "image/jpeg"
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        "image/gif"
    } else if data.starts_with(b"%PDF") {
        "application/pdf"
    } else if data.starts_with(b"PK\x03\x04") {
        "application/zip"
    } else if data.starts_with(b"<?xml") || data.starts_with(b"<svg") {
        if data.windows(4).take(256).any(|w| w == b"<svg") {
            "image/svg+xml"
        } else {
            "text/xml"
        }
    } else if std::str::from_utf8(data).is_ok() {
        "text/plain"
    } else {
        "application/octet-stream"
    }
}
