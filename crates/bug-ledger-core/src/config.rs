use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::key::{KeyDeriver, NamespaceKeys};
use crate::resolve::DEFAULT_MAX_HOPS;
use crate::text::TextLimits;
use crate::KernelError;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NamespaceConfig {
    pub key: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ResolverConfig {
    pub max_hops: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { max_hops: DEFAULT_MAX_HOPS }
    }
}

/// Crashes kept per bug before the least useful one is evicted.
pub const DEFAULT_MAX_CRASHES: usize = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CrashConfig {
    pub max_crashes: usize,
}

impl Default for CrashConfig {
    fn default() -> Self {
        Self { max_crashes: DEFAULT_MAX_CRASHES }
    }
}

/// Ledger settings shared by the CLI and the service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct LedgerConfig {
    pub namespaces: BTreeMap<String, NamespaceConfig>,
    pub resolver: ResolverConfig,
    pub text_limits: TextLimits,
    pub crashes: CrashConfig,
}

impl LedgerConfig {
    /// Check settings that serde alone cannot express.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for blank namespace names or keys and for a zero hop or
    /// crash cap.
    pub fn validate(&self) -> Result<(), KernelError> {
        for (name, namespace) in &self.namespaces {
            if name.trim().is_empty() {
                return Err(KernelError::Validation(
                    "namespace names MUST be non-empty".to_string(),
                ));
            }
            if namespace.key.trim().is_empty() {
                return Err(KernelError::Validation(format!(
                    "namespace `{name}` MUST configure a non-empty key"
                )));
            }
        }
        if self.resolver.max_hops == 0 {
            return Err(KernelError::Validation("resolver.max_hops MUST be >= 1".to_string()));
        }
        if self.crashes.max_crashes == 0 {
            return Err(KernelError::Validation("crashes.max_crashes MUST be >= 1".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn key_deriver(&self) -> KeyDeriver {
        KeyDeriver::new(
            self.namespaces
                .iter()
                .map(|(name, namespace)| (name.clone(), namespace.key.clone()))
                .collect::<NamespaceKeys>(),
        )
    }
}
