//! Execution context for ORM operations.
//!
//! The context is an explicit value passed to every operation — never a
//! thread-local or a global. It carries the acting user, the superuser
//! escape hatch, and request-scoped flags (locale, feature switches).

use std::collections::BTreeMap;

/// The superuser id. Operations running as this user bypass all
/// access-control checks (documented escape hatch, used by system
/// jobs such as the filestore garbage collector).
pub const SUPERUSER_ID: i64 = 1;

/// Per-operation execution context.
#[derive(Debug, Clone)]
pub struct Context {
    /// Acting user id.
    pub uid: i64,

    /// Locale code, e.g. `en_US`. Affects value formatting only; the
    /// core engine never branches on it.
    pub lang: String,

    /// Request-scoped string flags (`active_test`, `bin_size`, ...).
    /// Consumed by business models; the core only carries them.
    pub flags: BTreeMap<String, String>,
}

impl Context {
    /// Context for a regular user.
    pub fn new(uid: i64) -> Self {
        Self {
            uid,
            lang: "en_US".to_string(),
            flags: BTreeMap::new(),
        }
    }

    /// Context for the superuser. Bypasses all access checks.
    pub fn superuser() -> Self {
        Self::new(SUPERUSER_ID)
    }

    /// Whether this context bypasses access control.
    pub fn is_superuser(&self) -> bool {
        self.uid == SUPERUSER_ID
    }

    /// Copy of this context with one flag set.
    pub fn with_flag(mut self, key: &str, value: &str) -> Self {
        self.flags.insert(key.to_string(), value.to_string());
        self
    }

    /// Look up a flag value.
    pub fn flag(&self, key: &str) -> Option<&str> {
        self.flags.get(key).map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superuser_detection() {
        assert!(Context::superuser().is_superuser());
        assert!(!Context::new(7).is_superuser());
    }

    #[test]
    fn flags_roundtrip() {
        let ctx = Context::new(2).with_flag("active_test", "0");
        assert_eq!(ctx.flag("active_test"), Some("0"));
        assert_eq!(ctx.flag("missing"), None);
    }
}
