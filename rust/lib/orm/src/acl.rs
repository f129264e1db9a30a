//! Access-control gate.
//!
//! The engine does not ship an ACL policy of its own. It knows one
//! trait, [`AccessRule`], and the concrete rules are injected per model
//! at startup. The superuser context bypasses every check — a
//! documented escape hatch used by system jobs, not a bug.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use terp_core::Context;

use crate::error::OrmError;

/// Operation being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    Create,
    Unlink,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
            AccessMode::Create => "create",
            AccessMode::Unlink => "unlink",
        };
        f.write_str(s)
    }
}

/// Pluggable per-model access rule. Checks are batched: one call covers
/// all candidate ids of a model, never one call per row.
pub trait AccessRule: Send + Sync {
    fn check(
        &self,
        ctx: &Context,
        model: &str,
        mode: AccessMode,
        ids: &[i64],
    ) -> Result<(), OrmError>;
}

/// Allows everything. Used for tests and trusted embeddings.
pub struct AllowAll;

impl AccessRule for AllowAll {
    fn check(&self, _: &Context, _: &str, _: AccessMode, _: &[i64]) -> Result<(), OrmError> {
        Ok(())
    }
}

/// Denies everything. Used for tests.
pub struct DenyAll;

impl AccessRule for DenyAll {
    fn check(
        &self,
        ctx: &Context,
        model: &str,
        mode: AccessMode,
        _: &[i64],
    ) -> Result<(), OrmError> {
        Err(OrmError::AccessDenied(format!(
            "user {} may not {} {}",
            ctx.uid, mode, model
        )))
    }
}

/// Routes checks to the rule registered for each model, falling back to
/// a default rule. Superuser bypasses the lookup entirely.
pub struct AccessGate {
    default_rule: Arc<dyn AccessRule>,
    rules: BTreeMap<String, Arc<dyn AccessRule>>,
}

impl AccessGate {
    pub fn new(default_rule: Arc<dyn AccessRule>) -> Self {
        Self {
            default_rule,
            rules: BTreeMap::new(),
        }
    }

    /// A gate that allows everything by default.
    pub fn allow_all() -> Self {
        Self::new(Arc::new(AllowAll))
    }

    pub fn with_rule(mut self, model: &str, rule: Arc<dyn AccessRule>) -> Self {
        self.rules.insert(model.to_string(), rule);
        self
    }

    pub fn check(
        &self,
        ctx: &Context,
        model: &str,
        mode: AccessMode,
        ids: &[i64],
    ) -> Result<(), OrmError> {
        if ctx.is_superuser() {
            return Ok(());
        }
        let rule = self.rules.get(model).unwrap_or(&self.default_rule);
        rule.check(ctx, model, mode, ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superuser_bypasses_deny() {
        let gate = AccessGate::new(Arc::new(DenyAll));
        assert!(
            gate.check(&Context::superuser(), "res.partner", AccessMode::Unlink, &[1])
                .is_ok()
        );
        assert!(
            gate.check(&Context::new(2), "res.partner", AccessMode::Read, &[1])
                .is_err()
        );
    }

    #[test]
    fn per_model_rule_overrides_default() {
        let gate = AccessGate::allow_all().with_rule("account.move", Arc::new(DenyAll));
        let ctx = Context::new(2);
        assert!(gate.check(&ctx, "res.partner", AccessMode::Write, &[1]).is_ok());
        let err = gate
            .check(&ctx, "account.move", AccessMode::Write, &[1])
            .unwrap_err();
        assert!(err.to_string().contains("may not write account.move"));
    }
}
