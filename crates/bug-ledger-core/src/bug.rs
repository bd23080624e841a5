use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::key::{build_key, BugKeyInput, BuildKeyInput, KeyDeriver, RecordKey};
use crate::text::{text_link, TextId, TextKind};
use crate::title::format_title;
use crate::KernelError;

/// Upper bound for string fields stored on bug and build records.
pub const MAX_STRING_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BugStatus {
    Open,
    Fixed,
    Invalid,
    Duplicate,
}

impl BugStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Fixed => "fixed",
            Self::Invalid => "invalid",
            Self::Duplicate => "duplicate",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "fixed" => Some(Self::Fixed),
            "invalid" => Some(Self::Invalid),
            "duplicate" => Some(Self::Duplicate),
            _ => None,
        }
    }

    /// Numeric status code used by the dashboard datastore.
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::Open => 0,
            Self::Fixed => 1000,
            Self::Invalid => 1001,
            Self::Duplicate => 1002,
        }
    }

    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Open),
            1000 => Some(Self::Fixed),
            1001 => Some(Self::Invalid),
            1002 => Some(Self::Duplicate),
            _ => None,
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum ReproLevel {
    #[default]
    None,
    Syz,
    C,
}

impl ReproLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Syz => "syz",
            Self::C => "c",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "syz" => Some(Self::Syz),
            "c" => Some(Self::C),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BugRecord {
    pub namespace: String,
    pub title: String,
    pub seq: u64,
    pub status: BugStatus,
    pub dup_of: Option<RecordKey>,
    pub num_crashes: u64,
    pub num_repro: u64,
    pub repro_level: ReproLevel,
    #[serde(with = "time::serde::rfc3339")]
    pub first_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub closed: Option<OffsetDateTime>,
}

impl BugRecord {
    /// A freshly reported open bug with no crashes recorded yet.
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        title: impl Into<String>,
        seq: u64,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            title: title.into(),
            seq,
            status: BugStatus::Open,
            dup_of: None,
            num_crashes: 0,
            num_repro: 0,
            repro_level: ReproLevel::None,
            first_time: now,
            last_time: now,
            closed: None,
        }
    }

    #[must_use]
    pub fn display_title(&self) -> String {
        format_title(&self.title, self.seq)
    }

    #[must_use]
    pub fn key_input(&self) -> BugKeyInput<'_> {
        BugKeyInput { namespace: &self.namespace, title: &self.title, seq: self.seq }
    }

    /// Derive this bug's primary key.
    ///
    /// # Errors
    /// Returns [`KernelError`] when the namespace is empty or unconfigured.
    pub fn key(&self, deriver: &KeyDeriver) -> Result<RecordKey, KernelError> {
        deriver.bug_key(self.key_input())
    }

    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        self.status == BugStatus::Duplicate
    }

    /// Validate a bug record before it is persisted.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when identity fields are missing or too long, the
    /// duplicate pointer disagrees with the status, or timestamps are out of order.
    pub fn validate(&self) -> Result<(), KernelError> {
        require_field("namespace", &self.namespace)?;
        require_field("title", &self.title)?;

        match (self.status, &self.dup_of) {
            (BugStatus::Duplicate, None) => {
                return Err(KernelError::Validation(
                    "dup_of MUST be set when status is duplicate".to_string(),
                ));
            }
            (status, Some(_)) if status != BugStatus::Duplicate => {
                return Err(KernelError::Validation(format!(
                    "dup_of MUST be empty when status is {}",
                    status.as_str()
                )));
            }
            _ => {}
        }

        if self.last_time < self.first_time {
            return Err(KernelError::Validation(
                "last_time MUST NOT precede first_time".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct BuildRecord {
    pub namespace: String,
    pub manager: String,
    pub id: String,
    pub os: String,
    pub arch: String,
    pub vm_arch: String,
    pub syzkaller_commit: String,
    pub compiler_id: String,
    pub kernel_repo: String,
    pub kernel_branch: String,
    pub kernel_commit: String,
    pub kernel_config: TextId,
}

impl BuildRecord {
    /// Derive the build's key from `(namespace, id)`.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the namespace is empty.
    pub fn key(&self) -> Result<RecordKey, KernelError> {
        build_key(BuildKeyInput { namespace: &self.namespace, build_id: &self.id })
    }

    /// Validate a build record before it is persisted.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when identity fields are missing or any string field
    /// exceeds [`MAX_STRING_LEN`].
    pub fn validate(&self) -> Result<(), KernelError> {
        require_field("namespace", &self.namespace)?;
        require_field("id", &self.id)?;
        for (name, value) in [
            ("manager", &self.manager),
            ("os", &self.os),
            ("arch", &self.arch),
            ("vm_arch", &self.vm_arch),
            ("syzkaller_commit", &self.syzkaller_commit),
            ("compiler_id", &self.compiler_id),
            ("kernel_repo", &self.kernel_repo),
            ("kernel_branch", &self.kernel_branch),
            ("kernel_commit", &self.kernel_commit),
        ] {
            check_len(name, value)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn kernel_config_link(&self) -> Option<String> {
        text_link(TextKind::KernelConfig, self.kernel_config)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CrashId(pub Ulid);

impl CrashId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CrashId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CrashId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One observed crash of a bug, with references into the text blob store.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CrashRecord {
    pub crash_id: CrashId,
    pub bug_key: RecordKey,
    pub manager: String,
    pub build_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    #[serde(default)]
    pub maintainers: Vec<String>,
    pub log: TextId,
    pub report: TextId,
    #[serde(default)]
    pub repro_opts: Vec<u8>,
    pub repro_syz: TextId,
    pub repro_c: TextId,
    pub report_len: u64,
}

impl CrashRecord {
    /// Reproducer level implied by which reproducer texts are attached.
    #[must_use]
    pub fn repro_level(&self) -> ReproLevel {
        if !self.repro_c.is_none() {
            ReproLevel::C
        } else if !self.repro_syz.is_none() {
            ReproLevel::Syz
        } else {
            ReproLevel::None
        }
    }

    /// Validate a crash record before it is persisted.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the manager is missing or a string field exceeds
    /// [`MAX_STRING_LEN`].
    pub fn validate(&self) -> Result<(), KernelError> {
        require_field("manager", &self.manager)?;
        check_len("build_id", &self.build_id)?;
        for maintainer in &self.maintainers {
            check_len("maintainer", maintainer)?;
        }
        Ok(())
    }

    /// Locators for every attached text, in log/report/syz/C order.
    #[must_use]
    pub fn text_links(&self) -> Vec<(TextKind, String)> {
        [
            (TextKind::CrashLog, self.log),
            (TextKind::CrashReport, self.report),
            (TextKind::ReproSyz, self.repro_syz),
            (TextKind::ReproC, self.repro_c),
        ]
        .into_iter()
        .filter_map(|(kind, id)| text_link(kind, id).map(|link| (kind, link)))
        .collect()
    }
}

fn require_field(name: &str, value: &str) -> Result<(), KernelError> {
    if value.trim().is_empty() {
        return Err(KernelError::Validation(format!("{name} MUST be provided")));
    }
    check_len(name, value)
}

fn check_len(name: &str, value: &str) -> Result<(), KernelError> {
    if value.len() > MAX_STRING_LEN {
        return Err(KernelError::Validation(format!(
            "{name} MUST be at most {MAX_STRING_LEN} bytes, got {}",
            value.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;
    use crate::key::{derive_key, NamespaceKeys};

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn mk_bug(title: &str, seq: u64) -> BugRecord {
        BugRecord::new("upstream", title, seq, fixture_time())
    }

    fn assert_validation_error_contains(result: Result<(), KernelError>, expected: &str) {
        let err = match result {
            Ok(()) => panic!("expected validation error containing: {expected}"),
            Err(err) => err,
        };
        assert!(err.to_string().contains(expected), "error `{err}` did not contain `{expected}`");
    }

    // Test IDs: TBUG-001
    #[test]
    fn status_codes_match_dashboard_values() {
        for status in [BugStatus::Open, BugStatus::Fixed, BugStatus::Invalid, BugStatus::Duplicate]
        {
            assert_eq!(BugStatus::from_code(status.code()), Some(status));
            assert_eq!(BugStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BugStatus::Duplicate.code(), 1002);
        assert_eq!(BugStatus::from_code(7), None);
    }

    // Test IDs: TBUG-002
    #[test]
    fn display_title_uses_one_based_suffix() {
        assert_eq!(mk_bug("INFO: task hung", 0).display_title(), "INFO: task hung");
        assert_eq!(mk_bug("INFO: task hung", 2).display_title(), "INFO: task hung (3)");
    }

    // Test IDs: TBUG-003
    #[test]
    fn validate_requires_dup_pointer_exactly_for_duplicates() {
        let mut bug = mk_bug("title", 0);
        assert!(bug.validate().is_ok());

        bug.status = BugStatus::Duplicate;
        assert_validation_error_contains(bug.validate(), "dup_of MUST be set");

        bug.dup_of = Some(derive_key(&["target"]));
        assert!(bug.validate().is_ok());

        bug.status = BugStatus::Fixed;
        assert_validation_error_contains(
            bug.validate(),
            "dup_of MUST be empty when status is fixed",
        );
    }

    // Test IDs: TBUG-004
    #[test]
    fn validate_rejects_missing_identity_and_bad_times() {
        let mut bug = mk_bug(" ", 0);
        assert_validation_error_contains(bug.validate(), "title MUST be provided");

        bug.title = "x".repeat(MAX_STRING_LEN + 1);
        assert_validation_error_contains(bug.validate(), "title MUST be at most");

        bug.title = "ok".to_string();
        bug.last_time = bug.first_time - Duration::seconds(1);
        assert_validation_error_contains(bug.validate(), "last_time MUST NOT precede");
    }

    // Test IDs: TBUG-005
    #[test]
    fn bug_key_matches_deriver() -> Result<(), KernelError> {
        let deriver = KeyDeriver::new(NamespaceKeys::new().with("upstream", "secret"));
        let bug = mk_bug("general protection fault in baz", 1);
        assert_eq!(
            bug.key(&deriver)?,
            derive_key(&["secret", "upstream", "general protection fault in baz", "1"])
        );
        Ok(())
    }

    // Test IDs: TBUG-006
    #[test]
    fn build_validate_bounds_string_fields() -> Result<(), KernelError> {
        let mut build = BuildRecord {
            namespace: "upstream".to_string(),
            id: "build-1".to_string(),
            ..BuildRecord::default()
        };
        build.validate()?;
        assert_eq!(build.key()?, derive_key(&["upstream", "build-1"]));
        assert_eq!(build.kernel_config_link(), None);

        build.kernel_commit = "c".repeat(MAX_STRING_LEN + 1);
        assert_validation_error_contains(build.validate(), "kernel_commit MUST be at most");

        build.kernel_commit.clear();
        build.namespace.clear();
        assert_validation_error_contains(build.validate(), "namespace MUST be provided");
        Ok(())
    }

    // Test IDs: TBUG-007
    #[test]
    fn crash_links_skip_absent_texts() {
        let crash = CrashRecord {
            crash_id: CrashId::new(),
            bug_key: derive_key(&["bug"]),
            manager: "ci-upstream".to_string(),
            build_id: "build-1".to_string(),
            time: fixture_time(),
            maintainers: vec![],
            log: TextId(4),
            report: TextId::NONE,
            repro_opts: vec![],
            repro_syz: TextId(9),
            repro_c: TextId::NONE,
            report_len: 0,
        };

        assert!(crash.validate().is_ok());
        assert_eq!(crash.repro_level(), ReproLevel::Syz);
        assert_eq!(
            crash.text_links(),
            vec![
                (TextKind::CrashLog, "/text?tag=CrashLog&id=4".to_string()),
                (TextKind::ReproSyz, "/text?tag=ReproSyz&id=9".to_string()),
            ]
        );

        let mut unnamed = crash;
        unnamed.manager.clear();
        assert_validation_error_contains(unnamed.validate(), "manager MUST be provided");
    }
}
