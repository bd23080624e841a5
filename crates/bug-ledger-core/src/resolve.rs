//! Following duplicate pointers to the canonical bug.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bug::BugRecord;
use crate::key::RecordKey;
use crate::KernelError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Default bound on duplicate pointers followed in one resolution.
pub const DEFAULT_MAX_HOPS: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("record not found")]
    NotFound,
    #[error("storage error: {0}")]
    Storage(#[source] BoxError),
}

/// Read access to bug records by key.
pub trait BugLookup {
    /// Load the bug stored under `key`.
    ///
    /// # Errors
    /// Returns [`LookupError::NotFound`] when no bug has this key and
    /// [`LookupError::Storage`] for any other failure of the backing store.
    fn get_bug(&self, key: &RecordKey) -> Result<BugRecord, LookupError>;
}

impl<T: BugLookup + ?Sized> BugLookup for &T {
    fn get_bug(&self, key: &RecordKey) -> Result<BugRecord, LookupError> {
        (**self).get_bug(key)
    }
}

impl BugLookup for BTreeMap<RecordKey, BugRecord> {
    fn get_bug(&self, key: &RecordKey) -> Result<BugRecord, LookupError> {
        self.get(key).cloned().ok_or(LookupError::NotFound)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(
        "bug {key} ({namespace}/{title} seq={seq}) is marked duplicate of missing bug {missing}"
    )]
    DanglingDuplicate {
        namespace: String,
        title: String,
        seq: u64,
        key: RecordKey,
        missing: RecordKey,
    },
    #[error("failed to get dup bug {missing} for {key}: {source}")]
    Storage {
        key: RecordKey,
        missing: RecordKey,
        #[source]
        source: BoxError,
    },
    #[error("duplicate chain from {start} returns to {key} after {hops} hops")]
    CycleDetected { start: RecordKey, key: RecordKey, hops: usize },
    #[error("duplicate chain from {start} is longer than {max_hops} hops")]
    ChainTooDeep { start: RecordKey, max_hops: usize },
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// Terminal bug of a duplicate chain and how it was reached.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Resolution {
    pub key: RecordKey,
    pub bug: BugRecord,
    pub hops: usize,
}

pub struct CanonicalResolver<'a, L: ?Sized> {
    lookup: &'a L,
    max_hops: usize,
}

impl<'a, L: BugLookup + ?Sized> CanonicalResolver<'a, L> {
    #[must_use]
    pub fn new(lookup: &'a L) -> Self {
        Self { lookup, max_hops: DEFAULT_MAX_HOPS }
    }

    #[must_use]
    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    /// Follow `dup_of` pointers from `bug`, stored under `start`, until a non-duplicate bug is
    /// reached.
    ///
    /// A bug that is not a duplicate is returned as-is with `start` and no store access.
    ///
    /// # Errors
    /// Returns [`ResolveError::DanglingDuplicate`] when a pointer names a missing bug,
    /// [`ResolveError::Storage`] when the store fails, [`ResolveError::CycleDetected`] or
    /// [`ResolveError::ChainTooDeep`] for malformed chains, and [`ResolveError::Kernel`] when
    /// a duplicate has no pointer.
    pub fn resolve(&self, start: RecordKey, bug: BugRecord) -> Result<Resolution, ResolveError> {
        let mut visited = BTreeSet::from([start.clone()]);
        let mut current_key = start.clone();
        let mut current = bug;
        let mut hops = 0_usize;

        while current.is_duplicate() {
            let Some(target) = current.dup_of.clone() else {
                return Err(KernelError::Validation(format!(
                    "bug {current_key} is a duplicate without dup_of"
                ))
                .into());
            };
            if !visited.insert(target.clone()) {
                return Err(ResolveError::CycleDetected { start, key: target, hops });
            }
            if hops >= self.max_hops {
                return Err(ResolveError::ChainTooDeep { start, max_hops: self.max_hops });
            }

            let next = match self.lookup.get_bug(&target) {
                Ok(next) => next,
                Err(LookupError::NotFound) => {
                    return Err(ResolveError::DanglingDuplicate {
                        namespace: current.namespace,
                        title: current.title,
                        seq: current.seq,
                        key: current_key,
                        missing: target,
                    });
                }
                Err(LookupError::Storage(source)) => {
                    return Err(ResolveError::Storage { key: current_key, missing: target, source });
                }
            };

            hops += 1;
            debug!(from = %current_key, to = %target, hops, "followed duplicate pointer");
            current_key = target;
            current = next;
        }

        Ok(Resolution { key: current_key, bug: current, hops })
    }
}
