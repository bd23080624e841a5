use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use bug_ledger_core::text::stored_slice;
use bug_ledger_core::{
    build_key, content_digest, decode_text, encode_text, parse_title, BugKeyInput, BugLookup,
    BugRecord, BugStatus, BuildKeyInput, BuildRecord, CanonicalResolver, CrashId, CrashRecord,
    KernelError, KeyDeriver, LedgerConfig, LookupError, RecordKey, ReproLevel, Resolution,
    ResolveError, TextCodecError, TextId, TextKind, TextLimits, TitleError, DEFAULT_MAX_CRASHES,
    DEFAULT_MAX_HOPS,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS bugs (
  bug_key TEXT PRIMARY KEY,
  namespace TEXT NOT NULL,
  title TEXT NOT NULL,
  seq INTEGER NOT NULL CHECK (seq >= 0),
  status INTEGER NOT NULL CHECK (status IN (0, 1000, 1001, 1002)),
  dup_of TEXT,
  num_crashes INTEGER NOT NULL CHECK (num_crashes >= 0),
  num_repro INTEGER NOT NULL CHECK (num_repro >= 0),
  repro_level TEXT NOT NULL CHECK (repro_level IN ('none','syz','c')),
  first_time TEXT NOT NULL,
  last_time TEXT NOT NULL,
  closed TEXT,
  UNIQUE(namespace, title, seq),
  CHECK ((status = 1002) = (dup_of IS NOT NULL))
);

CREATE TABLE IF NOT EXISTS builds (
  build_key TEXT PRIMARY KEY,
  namespace TEXT NOT NULL,
  build_id TEXT NOT NULL,
  manager TEXT NOT NULL,
  os TEXT NOT NULL,
  arch TEXT NOT NULL,
  vm_arch TEXT NOT NULL,
  syzkaller_commit TEXT NOT NULL,
  compiler_id TEXT NOT NULL,
  kernel_repo TEXT NOT NULL,
  kernel_branch TEXT NOT NULL,
  kernel_commit TEXT NOT NULL,
  kernel_config INTEGER NOT NULL CHECK (kernel_config >= 0),
  UNIQUE(namespace, build_id)
);

CREATE TABLE IF NOT EXISTS texts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  namespace TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('CrashLog','CrashReport','ReproSyz','ReproC','KernelConfig')),
  digest TEXT NOT NULL,
  raw_len INTEGER NOT NULL CHECK (raw_len >= 0),
  stored_len INTEGER NOT NULL CHECK (stored_len >= 0),
  compressed BLOB NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE(namespace, kind, digest)
);

CREATE INDEX IF NOT EXISTS idx_bugs_namespace_title ON bugs(namespace, title);
CREATE INDEX IF NOT EXISTS idx_bugs_dup_of ON bugs(dup_of);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS crashes (
  crash_id TEXT PRIMARY KEY,
  bug_key TEXT NOT NULL,
  manager TEXT NOT NULL,
  build_id TEXT NOT NULL,
  time TEXT NOT NULL,
  maintainers_json TEXT NOT NULL,
  log INTEGER NOT NULL CHECK (log >= 0),
  report INTEGER NOT NULL CHECK (report >= 0),
  repro_opts BLOB NOT NULL,
  repro_syz INTEGER NOT NULL CHECK (repro_syz >= 0),
  repro_c INTEGER NOT NULL CHECK (repro_c >= 0),
  report_len INTEGER NOT NULL CHECK (report_len >= 0),
  FOREIGN KEY (bug_key) REFERENCES bugs(bug_key)
);

CREATE INDEX IF NOT EXISTS idx_crashes_bug_time ON crashes(bug_key, time);
";

const MIGRATIONS: [(i64, &str); 2] = [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)];

const BUG_COLUMNS: &str = "namespace, title, seq, status, dup_of, num_crashes, num_repro, \
                           repro_level, first_time, last_time, closed";

const BUILD_COLUMNS: &str = "namespace, build_id, manager, os, arch, vm_arch, syzkaller_commit, \
                             compiler_id, kernel_repo, kernel_branch, kernel_commit, kernel_config";

const CRASH_COLUMNS: &str = "crash_id, bug_key, manager, build_id, time, maintainers_json, log, \
                             report, repro_opts, repro_syz, repro_c, report_len";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Title(#[from] TitleError),
    #[error(transparent)]
    Codec(#[from] TextCodecError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid crash maintainers json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid timestamp: {0}")]
    Time(String),
    #[error("corrupt {table} row: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

impl StoreError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub struct SqliteStore {
    conn: Connection,
    deriver: KeyDeriver,
    text_limits: TextLimits,
    max_hops: usize,
    max_crashes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub dangling_duplicates: Vec<String>,
    pub schema_status: SchemaStatus,
}

/// A bug together with its key and rendered display title.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredBug {
    pub key: RecordKey,
    pub display_title: String,
    pub bug: BugRecord,
}

impl StoredBug {
    #[must_use]
    pub fn new(key: RecordKey, bug: BugRecord) -> Self {
        Self { key, display_title: bug.display_title(), bug }
    }
}

/// Result of storing one text blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextRef {
    pub id: TextId,
    pub kind: TextKind,
    pub raw_len: usize,
    pub stored_len: usize,
    pub truncated: bool,
    pub deduplicated: bool,
}

impl TextRef {
    fn absent(kind: TextKind) -> Self {
        Self {
            id: TextId::NONE,
            kind,
            raw_len: 0,
            stored_len: 0,
            truncated: false,
            deduplicated: false,
        }
    }

    #[must_use]
    pub fn link(&self) -> Option<String> {
        bug_ledger_core::text_link(self.kind, self.id)
    }
}

/// Raw crash data as received from a CI manager. Empty texts are stored as absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashInput {
    pub manager: String,
    pub build_id: String,
    pub time: OffsetDateTime,
    pub maintainers: Vec<String>,
    pub log: Vec<u8>,
    pub report: Vec<u8>,
    pub repro_opts: Vec<u8>,
    pub repro_syz: Vec<u8>,
    pub repro_c: Vec<u8>,
}

impl SqliteStore {
    /// Open a SQLite-backed bug ledger and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path, deriver: KeyDeriver) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            deriver,
            text_limits: TextLimits::default(),
            max_hops: DEFAULT_MAX_HOPS,
            max_crashes: DEFAULT_MAX_CRASHES,
        })
    }

    /// Open a store with the namespaces, text caps and resolver bound from `config`.
    ///
    /// # Errors
    /// Returns an error when the config is invalid or the database cannot be opened.
    pub fn open_with_config(path: &Path, config: &LedgerConfig) -> Result<Self> {
        config.validate().context("invalid ledger config")?;
        Ok(Self::open(path, config.key_deriver())?
            .with_text_limits(config.text_limits)
            .with_max_hops(config.resolver.max_hops)
            .with_max_crashes(config.crashes.max_crashes))
    }

    #[must_use]
    pub fn with_text_limits(mut self, text_limits: TextLimits) -> Self {
        self.text_limits = text_limits;
        self
    }

    #[must_use]
    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    /// Cap on stored crashes per bug. Values below one are treated as one.
    #[must_use]
    pub fn with_max_crashes(mut self, max_crashes: usize) -> Self {
        self.max_crashes = max_crashes.max(1);
        self
    }

    #[must_use]
    pub fn key_deriver(&self) -> &KeyDeriver {
        &self.deriver
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when the database is newer than this build or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let current = current_schema_version(&self.conn)?;
        if current > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {current}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (version, sql) in MIGRATIONS {
            if version <= current {
                continue;
            }
            let tx = self
                .conn
                .transaction()
                .with_context(|| format!("failed to start migration v{version} transaction"))?;
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
            record_schema_version(&tx, version)?;
            tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
            info!(version, "applied schema migration");
        }

        Ok(())
    }

    /// Create a new open bug, allocating the next unused sequence number for its title.
    ///
    /// # Errors
    /// Returns [`StoreError::Kernel`] when the record is invalid or the namespace has no key, and
    /// [`StoreError::Sqlite`] when the transaction fails.
    pub fn create_bug(
        &mut self,
        namespace: &str,
        title: &str,
        now: OffsetDateTime,
    ) -> Result<StoredBug, StoreError> {
        let template = BugRecord::new(namespace, title, 0, now);
        template.validate()?;
        template.key(&self.deriver)?;

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let max_seq: Option<i64> = tx.query_row(
            "SELECT MAX(seq) FROM bugs WHERE namespace = ?1 AND title = ?2",
            params![namespace, title],
            |row| row.get(0),
        )?;
        let seq = match max_seq {
            None => 0,
            Some(max) => from_sql_u64("bugs", "seq", max)?.checked_add(1).ok_or_else(|| {
                StoreError::Conflict(format!("no sequence numbers left for `{title}`"))
            })?,
        };

        let bug = BugRecord { seq, ..template };
        let key = bug.key(&self.deriver)?;
        upsert_bug(&tx, &key, &bug)?;
        tx.commit()?;

        info!(namespace, title, seq, key = %key, "created bug");
        Ok(StoredBug::new(key, bug))
    }

    /// Insert or replace a bug under its derived key.
    ///
    /// Duplicate links are owned by [`SqliteStore::mark_duplicate`]: this call never sets
    /// `Duplicate` and never clears or moves an existing `dup_of`.
    ///
    /// # Errors
    /// Returns [`StoreError::Kernel`] for invalid records, [`StoreError::Conflict`] when the write
    /// would create, change or clear a duplicate link, and [`StoreError::Sqlite`] on write failure.
    pub fn put_bug(&mut self, bug: &BugRecord) -> Result<RecordKey, StoreError> {
        bug.validate()?;
        let key = bug.key(&self.deriver)?;

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stored = load_bug(&tx, &key)?;
        match stored {
            Some(stored) if stored.status == BugStatus::Duplicate => {
                if bug.status != BugStatus::Duplicate || bug.dup_of != stored.dup_of {
                    return Err(StoreError::Conflict(format!(
                        "bug {key} is a duplicate; its status and dup_of cannot change"
                    )));
                }
            }
            _ if bug.status == BugStatus::Duplicate => {
                return Err(StoreError::Conflict(format!(
                    "bug {key} can only become a duplicate through mark_duplicate"
                )));
            }
            _ => {}
        }
        upsert_bug(&tx, &key, bug)?;
        tx.commit()?;
        Ok(key)
    }

    /// Load a bug by key.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the row cannot be read or decoded.
    pub fn get_bug(&self, key: &RecordKey) -> Result<Option<BugRecord>, StoreError> {
        load_bug(&self.conn, key)
    }

    /// Look a bug up by the title users see, e.g. `WARNING in foo (2)`.
    ///
    /// # Errors
    /// Returns [`StoreError::Title`] for malformed suffixes and [`StoreError::Kernel`] when the
    /// namespace has no key.
    pub fn find_bug(
        &self,
        namespace: &str,
        display_title: &str,
    ) -> Result<Option<StoredBug>, StoreError> {
        let (title, seq) = parse_title(display_title)?;
        let key = self.deriver.bug_key(BugKeyInput { namespace, title: &title, seq })?;
        Ok(load_bug(&self.conn, &key)?.map(|bug| StoredBug::new(key, bug)))
    }

    /// Load a bug and follow its duplicate chain to the canonical bug.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] for an unknown key and [`StoreError::Resolve`] for broken
    /// chains.
    pub fn canonical_bug(&self, key: &RecordKey) -> Result<Resolution, StoreError> {
        let bug = load_bug(&self.conn, key)?.ok_or_else(|| bug_not_found(key))?;
        let lookup = ConnLookup(&self.conn);
        let resolution = CanonicalResolver::new(&lookup)
            .with_max_hops(self.max_hops)
            .resolve(key.clone(), bug)?;
        Ok(resolution)
    }

    /// Mark `dup_key` as a duplicate of the canonical bug behind `target_key`.
    ///
    /// The pointer always targets the end of the target's chain, so chains stay one hop deep
    /// for bugs marked through this call.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] for unknown keys, [`StoreError::Conflict`] when the bug is
    /// already a duplicate or would point at itself, and [`StoreError::Resolve`] when the target
    /// chain is broken.
    pub fn mark_duplicate(
        &mut self,
        dup_key: &RecordKey,
        target_key: &RecordKey,
    ) -> Result<StoredBug, StoreError> {
        if dup_key == target_key {
            return Err(StoreError::Conflict(format!("bug {dup_key} cannot duplicate itself")));
        }

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut bug = load_bug(&tx, dup_key)?.ok_or_else(|| bug_not_found(dup_key))?;
        if let Some(existing) = &bug.dup_of {
            return Err(StoreError::Conflict(format!(
                "bug {dup_key} is already a duplicate of {existing}"
            )));
        }
        let target = load_bug(&tx, target_key)?.ok_or_else(|| bug_not_found(target_key))?;

        let lookup = ConnLookup(&tx);
        let canonical = CanonicalResolver::new(&lookup)
            .with_max_hops(self.max_hops)
            .resolve(target_key.clone(), target)?;
        if canonical.key == *dup_key {
            return Err(StoreError::Conflict(format!(
                "bug {target_key} already resolves to {dup_key}"
            )));
        }

        bug.status = BugStatus::Duplicate;
        bug.dup_of = Some(canonical.key.clone());
        upsert_bug(&tx, dup_key, &bug)?;
        tx.commit()?;

        info!(
            bug = %dup_key,
            canonical = %canonical.key,
            hops = canonical.hops,
            "marked bug as duplicate"
        );
        Ok(StoredBug::new(dup_key.clone(), bug))
    }

    /// Insert or replace a build under its `(namespace, id)` key.
    ///
    /// # Errors
    /// Returns [`StoreError::Kernel`] for invalid builds and [`StoreError::Sqlite`] on write
    /// failure.
    pub fn put_build(&mut self, build: &BuildRecord) -> Result<RecordKey, StoreError> {
        build.validate()?;
        let key = build.key()?;
        self.conn.execute(
            &format!(
                "INSERT INTO builds(build_key, {BUILD_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(build_key) DO UPDATE SET
                   manager = excluded.manager,
                   os = excluded.os,
                   arch = excluded.arch,
                   vm_arch = excluded.vm_arch,
                   syzkaller_commit = excluded.syzkaller_commit,
                   compiler_id = excluded.compiler_id,
                   kernel_repo = excluded.kernel_repo,
                   kernel_branch = excluded.kernel_branch,
                   kernel_commit = excluded.kernel_commit,
                   kernel_config = excluded.kernel_config"
            ),
            params![
                key.as_str(),
                build.namespace,
                build.id,
                build.manager,
                build.os,
                build.arch,
                build.vm_arch,
                build.syzkaller_commit,
                build.compiler_id,
                build.kernel_repo,
                build.kernel_branch,
                build.kernel_commit,
                to_sql_u64("builds", "kernel_config", build.kernel_config.0)?,
            ],
        )?;
        Ok(key)
    }

    /// Load the build a manager reported as `id`.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] naming `namespace/id` when no such build exists.
    pub fn load_build(&self, namespace: &str, id: &str) -> Result<BuildRecord, StoreError> {
        let key = build_key(BuildKeyInput { namespace, build_id: id })?;
        let row = self
            .conn
            .query_row(
                &format!("SELECT {BUILD_COLUMNS} FROM builds WHERE build_key = ?1"),
                params![key.as_str()],
                |row| {
                    Ok((
                        BuildRecord {
                            namespace: row.get(0)?,
                            id: row.get(1)?,
                            manager: row.get(2)?,
                            os: row.get(3)?,
                            arch: row.get(4)?,
                            vm_arch: row.get(5)?,
                            syzkaller_commit: row.get(6)?,
                            compiler_id: row.get(7)?,
                            kernel_repo: row.get(8)?,
                            kernel_branch: row.get(9)?,
                            kernel_commit: row.get(10)?,
                            kernel_config: TextId::NONE,
                        },
                        row.get::<_, i64>(11)?,
                    ))
                },
            )
            .optional()?;

        let Some((mut build, kernel_config)) = row else {
            return Err(StoreError::NotFound { kind: "build", key: format!("{namespace}/{id}") });
        };
        build.kernel_config = TextId(from_sql_u64("builds", "kernel_config", kernel_config)?);
        Ok(build)
    }

    /// Store a text blob, truncating it to the kind's cap and reusing an identical stored copy.
    ///
    /// # Errors
    /// Returns [`StoreError::Kernel`] for an empty namespace and [`StoreError::Codec`] or
    /// [`StoreError::Sqlite`] when the blob cannot be written.
    pub fn put_text(
        &self,
        namespace: &str,
        kind: TextKind,
        content: &[u8],
    ) -> Result<TextRef, StoreError> {
        insert_text(&self.conn, &self.text_limits, namespace, kind, content)
    }

    /// Load a text blob. The sentinel id yields empty content.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] when no blob with this id exists in `namespace`.
    pub fn get_text(&self, namespace: &str, id: TextId) -> Result<Vec<u8>, StoreError> {
        load_text(&self.conn, namespace, None, id)
    }

    /// Like [`SqliteStore::get_text`] but also requires the blob to be of `kind`.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] when no blob of this kind has this id in `namespace`.
    pub fn get_text_of_kind(
        &self,
        namespace: &str,
        kind: TextKind,
        id: TextId,
    ) -> Result<Vec<u8>, StoreError> {
        load_text(&self.conn, namespace, Some(kind), id)
    }

    /// Store a crash with its texts and fold it into the owning bug's counters.
    ///
    /// At most `max_crashes` crashes are kept per bug. Past the cap, older crashes are evicted
    /// least informative first: no reproducer before a syz reproducer before a C reproducer, then
    /// oldest first. The crash being recorded is never evicted and the bug's counters keep
    /// counting every crash seen.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] for an unknown bug, [`StoreError::Kernel`] for invalid
    /// crash fields, and storage errors from the blob store or `SQLite`.
    pub fn record_crash(
        &mut self,
        bug_key: &RecordKey,
        input: &CrashInput,
    ) -> Result<CrashRecord, StoreError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut bug = load_bug(&tx, bug_key)?.ok_or_else(|| bug_not_found(bug_key))?;
        let namespace = bug.namespace.clone();
        let limits = &self.text_limits;

        let log = insert_text(&tx, limits, &namespace, TextKind::CrashLog, &input.log)?;
        let report = insert_text(&tx, limits, &namespace, TextKind::CrashReport, &input.report)?;
        let repro_syz = insert_text(&tx, limits, &namespace, TextKind::ReproSyz, &input.repro_syz)?;
        let repro_c = insert_text(&tx, limits, &namespace, TextKind::ReproC, &input.repro_c)?;

        let crash = CrashRecord {
            crash_id: CrashId::new(),
            bug_key: bug_key.clone(),
            manager: input.manager.clone(),
            build_id: input.build_id.clone(),
            time: input.time,
            maintainers: input.maintainers.clone(),
            log: log.id,
            report: report.id,
            repro_opts: input.repro_opts.clone(),
            repro_syz: repro_syz.id,
            repro_c: repro_c.id,
            report_len: u64::try_from(input.report.len()).unwrap_or(u64::MAX),
        };
        crash.validate()?;

        tx.execute(
            &format!(
                "INSERT INTO crashes({CRASH_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                crash.crash_id.to_string(),
                crash.bug_key.as_str(),
                crash.manager,
                crash.build_id,
                rfc3339(crash.time)?,
                serde_json::to_string(&crash.maintainers)?,
                to_sql_u64("crashes", "log", crash.log.0)?,
                to_sql_u64("crashes", "report", crash.report.0)?,
                crash.repro_opts,
                to_sql_u64("crashes", "repro_syz", crash.repro_syz.0)?,
                to_sql_u64("crashes", "repro_c", crash.repro_c.0)?,
                to_sql_u64("crashes", "report_len", crash.report_len)?,
            ],
        )?;

        bug.num_crashes = bug.num_crashes.saturating_add(1);
        if crash.time > bug.last_time {
            bug.last_time = crash.time;
        }
        let level = crash.repro_level();
        if level != ReproLevel::None {
            bug.num_repro = bug.num_repro.saturating_add(1);
            bug.repro_level = bug.repro_level.max(level);
        }
        upsert_bug(&tx, bug_key, &bug)?;
        let evicted = evict_crashes(&tx, bug_key, &crash.crash_id, self.max_crashes)?;
        tx.commit()?;

        debug!(bug = %bug_key, crash = %crash.crash_id, repro = level.as_str(), "recorded crash");
        if evicted > 0 {
            info!(bug = %bug_key, evicted, max_crashes = self.max_crashes, "evicted old crashes");
        }
        Ok(crash)
    }

    /// Crashes of a bug, oldest first.
    ///
    /// # Errors
    /// Returns [`StoreError`] when rows cannot be read or decoded.
    pub fn list_crashes(&self, bug_key: &RecordKey) -> Result<Vec<CrashRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CRASH_COLUMNS} FROM crashes WHERE bug_key = ?1 ORDER BY time ASC, crash_id ASC"
        ))?;
        let rows = stmt.query_map(params![bug_key.as_str()], CrashRow::from_row)?;

        let mut crashes = Vec::new();
        for row in rows {
            crashes.push(row?.into_record()?);
        }
        Ok(crashes)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()
    }

    /// Run quick-check, foreign-key-check, dangling duplicate and schema status checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;
        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        let dangling_duplicates = if schema_status.current_version >= 1 {
            dangling_duplicates(&self.conn)?
        } else {
            Vec::new()
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            dangling_duplicates,
            schema_status,
        })
    }
}

impl BugLookup for SqliteStore {
    fn get_bug(&self, key: &RecordKey) -> Result<BugRecord, LookupError> {
        ConnLookup(&self.conn).get_bug(key)
    }
}

/// Resolver view over a connection or an open transaction.
struct ConnLookup<'c>(&'c Connection);

impl BugLookup for ConnLookup<'_> {
    fn get_bug(&self, key: &RecordKey) -> Result<BugRecord, LookupError> {
        match load_bug(self.0, key) {
            Ok(Some(bug)) => Ok(bug),
            Ok(None) => Err(LookupError::NotFound),
            Err(err) => Err(LookupError::Storage(Box::new(err))),
        }
    }
}

struct BugRow {
    namespace: String,
    title: String,
    seq: i64,
    status: i64,
    dup_of: Option<String>,
    num_crashes: i64,
    num_repro: i64,
    repro_level: String,
    first_time: String,
    last_time: String,
    closed: Option<String>,
}

impl BugRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            namespace: row.get(0)?,
            title: row.get(1)?,
            seq: row.get(2)?,
            status: row.get(3)?,
            dup_of: row.get(4)?,
            num_crashes: row.get(5)?,
            num_repro: row.get(6)?,
            repro_level: row.get(7)?,
            first_time: row.get(8)?,
            last_time: row.get(9)?,
            closed: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<BugRecord, StoreError> {
        let status = BugStatus::from_code(self.status).ok_or_else(|| StoreError::Corrupt {
            table: "bugs",
            detail: format!("unknown status code {}", self.status),
        })?;
        let repro_level =
            ReproLevel::parse(&self.repro_level).ok_or_else(|| StoreError::Corrupt {
                table: "bugs",
                detail: format!("unknown repro_level {}", self.repro_level),
            })?;

        Ok(BugRecord {
            namespace: self.namespace,
            title: self.title,
            seq: from_sql_u64("bugs", "seq", self.seq)?,
            status,
            dup_of: self.dup_of.as_deref().map(RecordKey::parse).transpose()?,
            num_crashes: from_sql_u64("bugs", "num_crashes", self.num_crashes)?,
            num_repro: from_sql_u64("bugs", "num_repro", self.num_repro)?,
            repro_level,
            first_time: parse_rfc3339(&self.first_time)?,
            last_time: parse_rfc3339(&self.last_time)?,
            closed: self.closed.as_deref().map(parse_rfc3339).transpose()?,
        })
    }
}

struct CrashRow {
    crash_id: String,
    bug_key: String,
    manager: String,
    build_id: String,
    time: String,
    maintainers_json: String,
    log: i64,
    report: i64,
    repro_opts: Vec<u8>,
    repro_syz: i64,
    repro_c: i64,
    report_len: i64,
}

impl CrashRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            crash_id: row.get(0)?,
            bug_key: row.get(1)?,
            manager: row.get(2)?,
            build_id: row.get(3)?,
            time: row.get(4)?,
            maintainers_json: row.get(5)?,
            log: row.get(6)?,
            report: row.get(7)?,
            repro_opts: row.get(8)?,
            repro_syz: row.get(9)?,
            repro_c: row.get(10)?,
            report_len: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<CrashRecord, StoreError> {
        let crash_id = Ulid::from_string(&self.crash_id).map_err(|err| StoreError::Corrupt {
            table: "crashes",
            detail: format!("invalid crash_id {}: {err}", self.crash_id),
        })?;

        Ok(CrashRecord {
            crash_id: CrashId(crash_id),
            bug_key: RecordKey::parse(&self.bug_key)?,
            manager: self.manager,
            build_id: self.build_id,
            time: parse_rfc3339(&self.time)?,
            maintainers: serde_json::from_str(&self.maintainers_json)?,
            log: TextId(from_sql_u64("crashes", "log", self.log)?),
            report: TextId(from_sql_u64("crashes", "report", self.report)?),
            repro_opts: self.repro_opts,
            repro_syz: TextId(from_sql_u64("crashes", "repro_syz", self.repro_syz)?),
            repro_c: TextId(from_sql_u64("crashes", "repro_c", self.repro_c)?),
            report_len: from_sql_u64("crashes", "report_len", self.report_len)?,
        })
    }
}

fn load_bug(conn: &Connection, key: &RecordKey) -> Result<Option<BugRecord>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {BUG_COLUMNS} FROM bugs WHERE bug_key = ?1"),
            params![key.as_str()],
            BugRow::from_row,
        )
        .optional()?;
    row.map(BugRow::into_record).transpose()
}

fn evict_crashes(
    conn: &Connection,
    bug_key: &RecordKey,
    keep: &CrashId,
    max_crashes: usize,
) -> Result<usize, StoreError> {
    let stored: i64 = conn.query_row(
        "SELECT COUNT(*) FROM crashes WHERE bug_key = ?1",
        params![bug_key.as_str()],
        |row| row.get(0),
    )?;
    let cap = i64::try_from(max_crashes).unwrap_or(i64::MAX);
    if stored <= cap {
        return Ok(0);
    }

    let evicted = conn.execute(
        "DELETE FROM crashes WHERE crash_id IN (
           SELECT crash_id FROM crashes
           WHERE bug_key = ?1 AND crash_id != ?2
           ORDER BY (repro_c != 0) ASC, (repro_syz != 0) ASC, time ASC, crash_id ASC
           LIMIT ?3
         )",
        params![bug_key.as_str(), keep.to_string(), stored - cap],
    )?;
    Ok(evicted)
}

fn upsert_bug(conn: &Connection, key: &RecordKey, bug: &BugRecord) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO bugs(bug_key, {BUG_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(bug_key) DO UPDATE SET
               status = excluded.status,
               dup_of = excluded.dup_of,
               num_crashes = excluded.num_crashes,
               num_repro = excluded.num_repro,
               repro_level = excluded.repro_level,
               first_time = excluded.first_time,
               last_time = excluded.last_time,
               closed = excluded.closed"
        ),
        params![
            key.as_str(),
            bug.namespace,
            bug.title,
            to_sql_u64("bugs", "seq", bug.seq)?,
            bug.status.code(),
            bug.dup_of.as_ref().map(RecordKey::as_str),
            to_sql_u64("bugs", "num_crashes", bug.num_crashes)?,
            to_sql_u64("bugs", "num_repro", bug.num_repro)?,
            bug.repro_level.as_str(),
            rfc3339(bug.first_time)?,
            rfc3339(bug.last_time)?,
            bug.closed.map(rfc3339).transpose()?,
        ],
    )?;
    Ok(())
}

fn insert_text(
    conn: &Connection,
    limits: &TextLimits,
    namespace: &str,
    kind: TextKind,
    content: &[u8],
) -> Result<TextRef, StoreError> {
    if namespace.trim().is_empty() {
        return Err(KernelError::Validation(
            "namespace MUST be provided when storing text".to_string(),
        )
        .into());
    }
    if content.is_empty() {
        return Ok(TextRef::absent(kind));
    }

    let cap = limits.cap(kind);
    let stored = stored_slice(content, cap);
    let digest = content_digest(namespace, kind.as_str(), stored);

    let (found, deduplicated) = match find_text(conn, namespace, kind, &digest)? {
        Some(found) => (Some(found), true),
        None => {
            let encoded = encode_text(content, cap)?;
            let inserted = conn.execute(
                "INSERT INTO texts(namespace, kind, digest, raw_len, stored_len, compressed,
                   created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(namespace, kind, digest) DO NOTHING",
                params![
                    namespace,
                    kind.as_str(),
                    digest,
                    to_sql_len(encoded.raw_len)?,
                    to_sql_len(encoded.stored_len)?,
                    encoded.compressed,
                    rfc3339(OffsetDateTime::now_utc())?,
                ],
            )?;
            (find_text(conn, namespace, kind, &digest)?, inserted == 0)
        }
    };

    let found = found.ok_or_else(|| StoreError::Corrupt {
        table: "texts",
        detail: format!("text {digest} vanished after insert"),
    })?;
    if deduplicated {
        debug!(namespace, kind = kind.as_str(), id = %found.id, "reused stored text");
    }

    // On reuse the lengths describe the stored blob, which may differ from this input's length
    // when both truncate to the same prefix.
    Ok(TextRef {
        id: found.id,
        kind,
        raw_len: found.raw_len,
        stored_len: found.stored_len,
        truncated: found.stored_len < found.raw_len,
        deduplicated,
    })
}

struct FoundText {
    id: TextId,
    raw_len: usize,
    stored_len: usize,
}

fn find_text(
    conn: &Connection,
    namespace: &str,
    kind: TextKind,
    digest: &str,
) -> Result<Option<FoundText>, StoreError> {
    let row: Option<(i64, i64, i64)> = conn
        .query_row(
            "SELECT id, raw_len, stored_len FROM texts
             WHERE namespace = ?1 AND kind = ?2 AND digest = ?3",
            params![namespace, kind.as_str(), digest],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    row.map(|(id, raw_len, stored_len)| {
        Ok(FoundText {
            id: TextId(from_sql_u64("texts", "id", id)?),
            raw_len: from_sql_len("raw_len", raw_len)?,
            stored_len: from_sql_len("stored_len", stored_len)?,
        })
    })
    .transpose()
}

fn load_text(
    conn: &Connection,
    namespace: &str,
    kind: Option<TextKind>,
    id: TextId,
) -> Result<Vec<u8>, StoreError> {
    if id.is_none() {
        return Ok(Vec::new());
    }
    let not_found = || StoreError::NotFound { kind: "text", key: format!("{namespace}/{id}") };
    let Ok(raw_id) = i64::try_from(id.0) else {
        return Err(not_found());
    };

    let row: Option<(String, Vec<u8>)> = conn
        .query_row(
            "SELECT kind, compressed FROM texts WHERE id = ?1 AND namespace = ?2",
            params![raw_id, namespace],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((stored_kind, compressed)) = row else {
        return Err(not_found());
    };
    if kind.is_some_and(|kind| kind.as_str() != stored_kind) {
        return Err(not_found());
    }

    Ok(decode_text(&compressed)?)
}

fn dangling_duplicates(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT b.bug_key FROM bugs b
             WHERE b.dup_of IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM bugs t WHERE t.bug_key = b.dup_of)
             ORDER BY b.bug_key ASC",
        )
        .context("failed to prepare dangling duplicate query")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut keys = Vec::new();
    for row in rows {
        keys.push(row?);
    }
    Ok(keys)
}

fn bug_not_found(key: &RecordKey) -> StoreError {
    StoreError::NotFound { kind: "bug", key: key.to_string() }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn to_sql_u64(table: &'static str, column: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt {
        table,
        detail: format!("{column}={value} does not fit in an INTEGER column"),
    })
}

fn to_sql_len(value: usize) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt {
        table: "texts",
        detail: format!("length {value} does not fit in an INTEGER column"),
    })
}

fn from_sql_len(column: &str, value: i64) -> Result<usize, StoreError> {
    usize::try_from(value).map_err(|_| StoreError::Corrupt {
        table: "texts",
        detail: format!("{column}={value} is not a valid length"),
    })
}

fn from_sql_u64(table: &'static str, column: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt {
        table,
        detail: format!("{column}={value} is negative"),
    })
}

fn rfc3339(value: OffsetDateTime) -> Result<String, StoreError> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::Time(err.to_string()))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::Time(format!("{value}: {err}")))
}
