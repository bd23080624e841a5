//! Text blob references and the gzip codec used to store them.

use std::fmt::{Display, Formatter};
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

/// Reference to a stored text blob. `TextId::NONE` means "no text attached".
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(transparent)]
pub struct TextId(pub u64);

impl TextId {
    pub const NONE: Self = Self(0);

    #[must_use]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl Display for TextId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TextKind {
    CrashLog,
    CrashReport,
    ReproSyz,
    ReproC,
    KernelConfig,
}

impl TextKind {
    pub const ALL: [Self; 5] =
        [Self::CrashLog, Self::CrashReport, Self::ReproSyz, Self::ReproC, Self::KernelConfig];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CrashLog => "CrashLog",
            Self::CrashReport => "CrashReport",
            Self::ReproSyz => "ReproSyz",
            Self::ReproC => "ReproC",
            Self::KernelConfig => "KernelConfig",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl Display for TextKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relative locator used by presentation code to fetch a text blob.
#[must_use]
pub fn text_link(kind: TextKind, id: TextId) -> Option<String> {
    if id.is_none() {
        return None;
    }
    Some(format!("/text?tag={}&id={}", kind.as_str(), id.0))
}

/// Per-kind size caps in bytes. `None` stores content of any size.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct TextLimits {
    pub crash_log: Option<usize>,
    pub crash_report: Option<usize>,
    pub repro_syz: Option<usize>,
    pub repro_c: Option<usize>,
    pub kernel_config: Option<usize>,
}

impl Default for TextLimits {
    fn default() -> Self {
        Self {
            crash_log: Some(1 << 20),
            crash_report: Some(64 << 10),
            repro_syz: Some(64 << 10),
            repro_c: Some(64 << 10),
            kernel_config: Some(4 << 20),
        }
    }
}

impl TextLimits {
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            crash_log: None,
            crash_report: None,
            repro_syz: None,
            repro_c: None,
            kernel_config: None,
        }
    }

    #[must_use]
    pub fn cap(&self, kind: TextKind) -> Option<usize> {
        match kind {
            TextKind::CrashLog => self.crash_log,
            TextKind::CrashReport => self.crash_report,
            TextKind::ReproSyz => self.repro_syz,
            TextKind::ReproC => self.repro_c,
            TextKind::KernelConfig => self.kernel_config,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TextCodecError {
    #[error("failed to compress text: {0}")]
    Compress(#[source] std::io::Error),
    #[error("failed to decompress text: {0}")]
    Decompress(#[source] std::io::Error),
}

/// Compressed blob plus the lengths needed to report truncation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EncodedText {
    pub compressed: Vec<u8>,
    pub raw_len: usize,
    pub stored_len: usize,
}

impl EncodedText {
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.stored_len < self.raw_len
    }
}

/// The part of `content` that fits under `cap`.
#[must_use]
pub fn stored_slice(content: &[u8], cap: Option<usize>) -> &[u8] {
    match cap {
        Some(cap) if content.len() > cap => &content[..cap],
        _ => content,
    }
}

/// Truncate `content` to `cap` and gzip the remainder.
///
/// # Errors
/// Returns [`TextCodecError::Compress`] when the encoder fails.
pub fn encode_text(content: &[u8], cap: Option<usize>) -> Result<EncodedText, TextCodecError> {
    let stored = stored_slice(content, cap);
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(stored).map_err(TextCodecError::Compress)?;
    let compressed = encoder.finish().map_err(TextCodecError::Compress)?;
    Ok(EncodedText { compressed, raw_len: content.len(), stored_len: stored.len() })
}

/// Inflate a blob produced by [`encode_text`].
///
/// # Errors
/// Returns [`TextCodecError::Decompress`] when the bytes are not valid gzip.
pub fn decode_text(compressed: &[u8]) -> Result<Vec<u8>, TextCodecError> {
    let mut decoder = GzDecoder::new(compressed);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(TextCodecError::Decompress)?;
    Ok(out)
}
