use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::KernelError;

/// Length of a hex-encoded SHA-256 record key.
pub const KEY_HEX_LEN: usize = 64;

const KEY_DELIMITER: &str = "-";

/// Stable opaque identifier of a stored record.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct RecordKey(String);

impl RecordKey {
    /// Parse a record key from its hex form.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] unless `raw` is exactly 64 lowercase hex characters.
    pub fn parse(raw: &str) -> Result<Self, KernelError> {
        let well_formed = raw.len() == KEY_HEX_LEN
            && raw.bytes().all(|byte| matches!(byte, b'0'..=b'9' | b'a'..=b'f'));
        if !well_formed {
            return Err(KernelError::Validation(format!(
                "record key `{raw}` MUST be {KEY_HEX_LEN} lowercase hex characters"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RecordKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RecordKey {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RecordKey> for String {
    fn from(value: RecordKey) -> Self {
        value.0
    }
}

/// Derive a record key from an ordered tuple of fields.
///
/// Fields are joined with `-` before hashing, so callers must keep field order fixed. A field
/// that itself contains the delimiter can collide with a different split of the same text.
#[must_use]
pub fn derive_key(parts: &[&str]) -> RecordKey {
    let joined = parts.join(KEY_DELIMITER);
    RecordKey(hex::encode(Sha256::digest(joined.as_bytes())))
}

/// Per-namespace secret material mixed into bug keys.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct NamespaceKeys(BTreeMap<String, String>);

impl NamespaceKeys {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, namespace: impl Into<String>, key: impl Into<String>) -> Self {
        self.0.insert(namespace.into(), key.into());
        self
    }

    #[must_use]
    pub fn get(&self, namespace: &str) -> Option<&str> {
        self.0.get(namespace).map(String::as_str)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl FromIterator<(String, String)> for NamespaceKeys {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

// Secrets stay out of logs and panic messages.
impl Debug for NamespaceKeys {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

/// Identity of a bug: namespace, stored title and zero-based duplicate sequence.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BugKeyInput<'a> {
    pub namespace: &'a str,
    pub title: &'a str,
    pub seq: u64,
}

/// Identity of a build reported by a CI manager.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BuildKeyInput<'a> {
    pub namespace: &'a str,
    pub build_id: &'a str,
}

/// Identity of one reporting stage of a bug.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReportingKeyInput<'a> {
    pub bug_key: &'a RecordKey,
    pub reporting: &'a str,
}

/// Derives record keys from typed identity tuples.
#[derive(Debug, Clone, Default)]
pub struct KeyDeriver {
    keys: NamespaceKeys,
}

impl KeyDeriver {
    #[must_use]
    pub fn new(keys: NamespaceKeys) -> Self {
        Self { keys }
    }

    #[must_use]
    pub fn namespace_keys(&self) -> &NamespaceKeys {
        &self.keys
    }

    #[must_use]
    pub fn knows_namespace(&self, namespace: &str) -> bool {
        self.keys.get(namespace).is_some()
    }

    /// Derive the primary key of a bug.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for an empty namespace and
    /// [`KernelError::UnknownNamespace`] when no secret is configured for it.
    pub fn bug_key(&self, input: BugKeyInput<'_>) -> Result<RecordKey, KernelError> {
        require_namespace(input.namespace, "bug")?;
        let secret = self
            .keys
            .get(input.namespace)
            .ok_or_else(|| KernelError::UnknownNamespace(input.namespace.to_string()))?;
        let seq = input.seq.to_string();
        Ok(derive_key(&[secret, input.namespace, input.title, &seq]))
    }
}

/// Derive the key of a build record.
///
/// # Errors
/// Returns [`KernelError::Validation`] when the namespace is empty.
pub fn build_key(input: BuildKeyInput<'_>) -> Result<RecordKey, KernelError> {
    require_namespace(input.namespace, "build")?;
    Ok(derive_key(&[input.namespace, input.build_id]))
}

/// Derive the key of a bug's reporting entry.
#[must_use]
pub fn reporting_key(input: ReportingKeyInput<'_>) -> RecordKey {
    derive_key(&[input.bug_key.as_str(), input.reporting])
}

/// Hex SHA-256 over length-prefixed `(namespace, kind, content)`.
///
/// Used to find an already stored copy of a text blob.
#[must_use]
pub fn content_digest(namespace: &str, kind: &str, content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    for field in [namespace.as_bytes(), kind.as_bytes(), content] {
        let len = u64::try_from(field.len()).unwrap_or(u64::MAX);
        hasher.update(len.to_be_bytes());
        hasher.update(field);
    }
    hex::encode(hasher.finalize())
}

fn require_namespace(namespace: &str, what: &str) -> Result<(), KernelError> {
    if namespace.is_empty() {
        return Err(KernelError::Validation(format!(
            "namespace MUST be provided when deriving a {what} key"
        )));
    }
    Ok(())
}
