//! Store key layout
//!
//! Every key is `{prefix}{namespace}:{scope}:{name}` or, for singletons,
//! `{prefix}{name}`. Scope and name components are percent-encoded so the
//! `:` separator never appears inside them, which keeps keys collision-free
//! across namespaces and lets [`KeyCodec::parse_context`] split them back.

use crate::common::utils::{decode_key, encode_key, validate_key};
use crate::common::Result;

pub const LIBRARY_NAMESPACE: &str = "library";
pub const CONTEXT_NAMESPACE: &str = "context";

/// Maps logical keys to store keys under a fixed prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    prefix: String,
}

impl KeyCodec {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `{prefix}{namespace}:{scope}:{name}`
    pub fn key(&self, namespace: &str, scope: &str, name: &str) -> String {
        format!(
            "{}{}:{}:{}",
            self.prefix,
            namespace,
            encode_key(scope),
            encode_key(name)
        )
    }

    /// `{prefix}{name}` for singleton resources and the leader lock
    pub fn singleton(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// `{prefix}library:{type}:{path}`; `/` is kept so paths stay listable
    pub fn library(&self, entry_type: &str, path: &str) -> Result<String> {
        validate_key(entry_type)?;
        validate_key(path)?;
        Ok(self.key(LIBRARY_NAMESPACE, entry_type, path))
    }

    /// Prefix of every entry below `dir` (the type root when `dir` is empty)
    pub fn library_prefix(&self, entry_type: &str, dir: &str) -> String {
        let root = format!(
            "{}{}:{}:",
            self.prefix,
            LIBRARY_NAMESPACE,
            encode_key(entry_type)
        );
        if dir.is_empty() {
            root
        } else {
            format!("{}{}/", root, encode_key(dir))
        }
    }

    /// Library path of a store key of the given type
    pub fn parse_library(&self, entry_type: &str, key: &str) -> Option<String> {
        let rest = key.strip_prefix(&self.library_prefix(entry_type, ""))?;
        decode_key(rest).ok()
    }

    /// `{prefix}context:{scope}:{key}`
    pub fn context(&self, scope: &str, key: &str) -> Result<String> {
        validate_key(scope)?;
        validate_key(key)?;
        Ok(self.key(CONTEXT_NAMESPACE, scope, key))
    }

    /// Prefix shared by every key of one scope
    pub fn context_scope_prefix(&self, scope: &str) -> String {
        format!(
            "{}{}:{}:",
            self.prefix,
            CONTEXT_NAMESPACE,
            encode_key(scope)
        )
    }

    /// Prefix shared by every context key
    pub fn context_prefix(&self) -> String {
        format!("{}{}:", self.prefix, CONTEXT_NAMESPACE)
    }

    /// Split a context store key into `(scope, key)`
    pub fn parse_context(&self, key: &str) -> Option<(String, String)> {
        let rest = key.strip_prefix(&self.context_prefix())?;
        let (scope, name) = rest.split_once(':')?;
        Some((decode_key(scope).ok()?, decode_key(name).ok()?))
    }
}
