use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bug_ledger_core::{
    reporting_key, BuildRecord, CrashRecord, KernelError, LedgerConfig, RecordKey,
    ReportingKeyInput, Resolution, TextId, TextKind,
};
use bug_ledger_store_sqlite::{SqliteStore, StoreError};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

pub use bug_ledger_store_sqlite::{
    CrashInput, IntegrityReport, SchemaStatus, StoredBug, TextRef,
};

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Load and validate a YAML ledger config.
///
/// # Errors
/// Returns an error when the file cannot be read, is not valid YAML, or fails validation.
pub fn load_config(path: &Path) -> Result<LedgerConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: LedgerConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config.validate().with_context(|| format!("invalid config file {}", path.display()))?;
    debug!(path = %path.display(), namespaces = config.namespaces.len(), "loaded ledger config");
    Ok(config)
}

/// True when any error in the chain is a store lookup miss.
#[must_use]
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<StoreError>().is_some_and(StoreError::is_not_found))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateBugRequest {
    pub namespace: String,
    pub title: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub first_time: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarkDuplicateRequest {
    pub namespace: String,
    /// Display title of the bug being marked.
    pub title: String,
    /// Display title of the bug it duplicates.
    pub dup_of: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CanonicalBug {
    pub requested_key: RecordKey,
    pub canonical: StoredBug,
    pub hops: usize,
}

impl CanonicalBug {
    fn from_resolution(requested_key: RecordKey, resolution: Resolution) -> Self {
        Self {
            requested_key,
            canonical: StoredBug::new(resolution.key, resolution.bug),
            hops: resolution.hops,
        }
    }
}

/// Key of one reporting entry of a bug, e.g. its upstream mailing list report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BugReportingKey {
    pub bug_key: RecordKey,
    pub reporting: String,
    pub reporting_key: RecordKey,
}

#[derive(Debug, Clone)]
pub struct LedgerApi {
    db_path: PathBuf,
    config: LedgerConfig,
}

impl LedgerApi {
    #[must_use]
    pub fn new(db_path: PathBuf, config: LedgerConfig) -> Self {
        Self { db_path, config }
    }

    #[must_use]
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open_with_config(&self.db_path, &self.config)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run the store's health checks.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or checked.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Write a `SQLite` backup of the ledger to `out_file`.
    ///
    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        let store = self.open_migrated()?;
        store.backup_database(out_file)
    }

    /// Replace the ledger with the contents of a backup file.
    ///
    /// # Errors
    /// Returns an error when the backup is missing or cannot be restored.
    pub fn restore(&self, in_file: &Path) -> Result<()> {
        let mut store = self.open_store()?;
        store.restore_database(in_file)
    }

    /// Create a new bug with the next free sequence number for its title.
    ///
    /// # Errors
    /// Returns an error when the namespace is unknown or the write fails.
    pub fn create_bug(&self, input: CreateBugRequest) -> Result<StoredBug> {
        let mut store = self.open_migrated()?;
        let now = input.first_time.unwrap_or_else(OffsetDateTime::now_utc);
        Ok(store.create_bug(&input.namespace, &input.title, now)?)
    }

    /// Load a bug by its display title.
    ///
    /// # Errors
    /// Returns a not-found error when no such bug exists.
    pub fn show_bug(&self, namespace: &str, display_title: &str) -> Result<StoredBug> {
        let store = self.open_migrated()?;
        find_existing(&store, namespace, display_title)
    }

    /// Resolve the bug shown as `display_title` to its canonical bug.
    ///
    /// # Errors
    /// Returns an error when the bug is missing or its duplicate chain is broken.
    pub fn canonical_bug(&self, namespace: &str, display_title: &str) -> Result<CanonicalBug> {
        let store = self.open_migrated()?;
        let requested = find_existing(&store, namespace, display_title)?;
        let resolution = store.canonical_bug(&requested.key)?;
        Ok(CanonicalBug::from_resolution(requested.key, resolution))
    }

    /// Mark one bug as a duplicate of another, both named by display title.
    ///
    /// # Errors
    /// Returns an error when either bug is missing or the marking conflicts.
    pub fn mark_duplicate(&self, input: &MarkDuplicateRequest) -> Result<StoredBug> {
        let mut store = self.open_migrated()?;
        let dup = find_existing(&store, &input.namespace, &input.title)?;
        let target = find_existing(&store, &input.namespace, &input.dup_of)?;
        Ok(store.mark_duplicate(&dup.key, &target.key)?)
    }

    /// Derive the key under which the bug shown as `display_title` is tracked in `reporting`.
    ///
    /// # Errors
    /// Returns a validation error for a blank reporting name and a not-found error when the bug
    /// does not exist.
    pub fn reporting_key(
        &self,
        namespace: &str,
        display_title: &str,
        reporting: &str,
    ) -> Result<BugReportingKey> {
        if reporting.trim().is_empty() {
            return Err(KernelError::Validation("reporting MUST be non-empty".to_string()).into());
        }
        let store = self.open_migrated()?;
        let bug = find_existing(&store, namespace, display_title)?;
        let key = reporting_key(ReportingKeyInput { bug_key: &bug.key, reporting });
        Ok(BugReportingKey {
            bug_key: bug.key,
            reporting: reporting.to_string(),
            reporting_key: key,
        })
    }

    /// Store or replace a build record.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn add_build(&self, build: &BuildRecord) -> Result<RecordKey> {
        let mut store = self.open_migrated()?;
        Ok(store.put_build(build)?)
    }

    /// Load a build by CI id.
    ///
    /// # Errors
    /// Returns a not-found error when no such build exists.
    pub fn show_build(&self, namespace: &str, id: &str) -> Result<BuildRecord> {
        let store = self.open_migrated()?;
        Ok(store.load_build(namespace, id)?)
    }

    /// Store a text blob.
    ///
    /// # Errors
    /// Returns an error when the namespace is empty or persistence fails.
    pub fn put_text(&self, namespace: &str, kind: TextKind, content: &[u8]) -> Result<TextRef> {
        let store = self.open_migrated()?;
        Ok(store.put_text(namespace, kind, content)?)
    }

    /// Load a text blob, optionally requiring a specific kind.
    ///
    /// # Errors
    /// Returns a not-found error when the blob does not exist.
    pub fn get_text(&self, namespace: &str, kind: Option<TextKind>, id: TextId) -> Result<Vec<u8>> {
        let store = self.open_migrated()?;
        let content = match kind {
            Some(kind) => store.get_text_of_kind(namespace, kind, id)?,
            None => store.get_text(namespace, id)?,
        };
        Ok(content)
    }

    /// Record a crash against the bug shown as `display_title`.
    ///
    /// # Errors
    /// Returns an error when the bug is missing or the crash cannot be stored.
    pub fn add_crash(
        &self,
        namespace: &str,
        display_title: &str,
        input: &CrashInput,
    ) -> Result<CrashRecord> {
        let mut store = self.open_migrated()?;
        let bug = find_existing(&store, namespace, display_title)?;
        Ok(store.record_crash(&bug.key, input)?)
    }

    /// Crashes of the bug shown as `display_title`, oldest first.
    ///
    /// # Errors
    /// Returns an error when the bug is missing or rows cannot be read.
    pub fn list_crashes(&self, namespace: &str, display_title: &str) -> Result<Vec<CrashRecord>> {
        let store = self.open_migrated()?;
        let bug = find_existing(&store, namespace, display_title)?;
        Ok(store.list_crashes(&bug.key)?)
    }
}

fn find_existing(store: &SqliteStore, namespace: &str, display_title: &str) -> Result<StoredBug> {
    store.find_bug(namespace, display_title)?.ok_or_else(|| {
        StoreError::NotFound { kind: "bug", key: format!("{namespace}/{display_title}") }.into()
    })
}

#[cfg(test)]
mod tests {
    use bug_ledger_core::{BugStatus, NamespaceConfig, TextLimits};

    use super::*;

    fn unique_temp_path(ext: &str) -> PathBuf {
        std::env::temp_dir().join(format!("bug-ledger-api-{}.{ext}", ulid::Ulid::new()))
    }

    fn fixture_config() -> LedgerConfig {
        let mut config = LedgerConfig::default();
        config
            .namespaces
            .insert("upstream".to_string(), NamespaceConfig { key: "api-secret".to_string() });
        config
    }

    fn fixture_api() -> (LedgerApi, PathBuf) {
        let db_path = unique_temp_path("sqlite3");
        (LedgerApi::new(db_path.clone(), fixture_config()), db_path)
    }

    fn create(api: &LedgerApi, title: &str) -> Result<StoredBug> {
        api.create_bug(CreateBugRequest {
            namespace: "upstream".to_string(),
            title: title.to_string(),
            first_time: None,
        })
    }

    // Test IDs: TAPI-001
    #[test]
    fn load_config_reads_yaml_and_applies_defaults() -> Result<()> {
        let path = unique_temp_path("yaml");
        fs::write(
            &path,
            "namespaces:\n  upstream:\n    key: s3cret\n\
             resolver:\n  max_hops: 4\n\
             text_limits:\n  repro_c: 100\n\
             crashes:\n  max_crashes: 5\n",
        )?;

        let config = load_config(&path)?;
        assert_eq!(config.namespaces.get("upstream").map(|ns| ns.key.as_str()), Some("s3cret"));
        assert_eq!(config.resolver.max_hops, 4);
        assert_eq!(config.crashes.max_crashes, 5);
        assert_eq!(config.text_limits.repro_c, Some(100));
        assert_eq!(config.text_limits.crash_log, TextLimits::default().crash_log);

        fs::write(&path, "namespaces:\n  upstream:\n    key: ''\n")?;
        assert!(load_config(&path).is_err());
        assert!(load_config(&unique_temp_path("yaml")).is_err());

        let _ = fs::remove_file(&path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn migrate_dry_run_reports_pending_versions() -> Result<()> {
        let (api, db_path) = fixture_api();
        let planned = api.migrate(true)?;
        assert_eq!(planned.would_apply_versions, vec![1, 2]);
        assert_eq!(planned.after_version, None);

        let applied = api.migrate(false)?;
        assert_eq!(applied.up_to_date, Some(true));
        assert_eq!(api.schema_status()?.pending_versions, Vec::<i64>::new());

        let _ = fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn duplicate_marking_and_canonical_lookup_round_trip() -> Result<()> {
        let (api, db_path) = fixture_api();
        create(&api, "KASAN: use-after-free in foo")?;
        let second = create(&api, "KASAN: use-after-free in foo")?;
        assert_eq!(second.display_title, "KASAN: use-after-free in foo (2)");
        let canonical = create(&api, "KASAN: use-after-free in bar")?;

        let marked = api.mark_duplicate(&MarkDuplicateRequest {
            namespace: "upstream".to_string(),
            title: "KASAN: use-after-free in foo (2)".to_string(),
            dup_of: "KASAN: use-after-free in bar".to_string(),
        })?;
        assert_eq!(marked.bug.status, BugStatus::Duplicate);

        let resolved = api.canonical_bug("upstream", "KASAN: use-after-free in foo (2)")?;
        assert_eq!(resolved.requested_key, second.key);
        assert_eq!(resolved.canonical.key, canonical.key);
        assert_eq!(resolved.hops, 1);

        let _ = fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn missing_bug_is_reported_as_not_found() -> Result<()> {
        let (api, db_path) = fixture_api();
        let err = match api.show_bug("upstream", "no such bug") {
            Ok(bug) => panic!("expected not found, got {bug:?}"),
            Err(err) => err,
        };
        assert!(is_not_found(&err));
        assert!(err.to_string().contains("upstream/no such bug"));

        let unknown_ns = match api.show_bug("android", "title") {
            Ok(bug) => panic!("expected unknown namespace, got {bug:?}"),
            Err(err) => err,
        };
        assert!(!is_not_found(&unknown_ns));

        let _ = fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn crashes_texts_and_builds_flow_through_api() -> Result<()> {
        let (api, db_path) = fixture_api();
        create(&api, "WARNING in baz")?;

        let crash = api.add_crash(
            "upstream",
            "WARNING in baz",
            &CrashInput {
                manager: "ci-upstream".to_string(),
                build_id: "b1".to_string(),
                time: OffsetDateTime::now_utc(),
                maintainers: Vec::new(),
                log: b"console output".to_vec(),
                report: b"WARNING: CPU: 0 PID: 1 at baz".to_vec(),
                repro_opts: Vec::new(),
                repro_syz: Vec::new(),
                repro_c: Vec::new(),
            },
        )?;
        assert_eq!(api.list_crashes("upstream", "WARNING in baz")?, vec![crash.clone()]);
        assert_eq!(
            api.get_text("upstream", Some(TextKind::CrashLog), crash.log)?,
            b"console output".to_vec()
        );
        assert!(api
            .get_text("upstream", Some(TextKind::ReproC), crash.log)
            .is_err_and(|err| is_not_found(&err)));

        let config = api.put_text("upstream", TextKind::KernelConfig, b"CONFIG_KASAN=y")?;
        let build = BuildRecord {
            namespace: "upstream".to_string(),
            id: "b1".to_string(),
            manager: "ci-upstream".to_string(),
            kernel_config: config.id,
            ..BuildRecord::default()
        };
        api.add_build(&build)?;
        assert_eq!(api.show_build("upstream", "b1")?, build);
        assert!(api.show_build("upstream", "b2").is_err_and(|err| is_not_found(&err)));

        let _ = fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-006
    #[test]
    fn reporting_key_is_derived_from_stored_bug_key() -> Result<()> {
        let (api, db_path) = fixture_api();
        create(&api, "INFO: rcu detected stall")?;
        let second = create(&api, "INFO: rcu detected stall")?;

        let upstream = api.reporting_key("upstream", "INFO: rcu detected stall (2)", "upstream")?;
        assert_eq!(upstream.bug_key, second.key);
        assert_eq!(upstream.reporting, "upstream");
        assert_eq!(
            upstream.reporting_key,
            reporting_key(ReportingKeyInput { bug_key: &second.key, reporting: "upstream" })
        );

        let moderation =
            api.reporting_key("upstream", "INFO: rcu detected stall (2)", "moderation")?;
        assert_ne!(moderation.reporting_key, upstream.reporting_key);
        let first = api.reporting_key("upstream", "INFO: rcu detected stall", "upstream")?;
        assert_ne!(first.reporting_key, upstream.reporting_key);

        assert!(api
            .reporting_key("upstream", "INFO: rcu detected stall (9)", "upstream")
            .is_err_and(|err| is_not_found(&err)));
        let blank = match api.reporting_key("upstream", "INFO: rcu detected stall", " ") {
            Ok(key) => panic!("expected blank reporting to fail, got {key:?}"),
            Err(err) => err,
        };
        assert!(!is_not_found(&blank));
        assert!(blank.to_string().contains("reporting MUST be non-empty"));

        let _ = fs::remove_file(&db_path);
        Ok(())
    }
}
