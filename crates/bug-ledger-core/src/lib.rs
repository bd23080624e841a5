pub mod bug;
pub mod config;
pub mod key;
pub mod resolve;
pub mod text;
pub mod title;

pub use bug::{BugRecord, BugStatus, BuildRecord, CrashId, CrashRecord, ReproLevel, MAX_STRING_LEN};
pub use config::{CrashConfig, LedgerConfig, NamespaceConfig, ResolverConfig, DEFAULT_MAX_CRASHES};
pub use key::{
    build_key, content_digest, derive_key, reporting_key, BugKeyInput, BuildKeyInput, KeyDeriver,
    NamespaceKeys, RecordKey, ReportingKeyInput, KEY_HEX_LEN,
};
pub use resolve::{
    BoxError, BugLookup, CanonicalResolver, LookupError, Resolution, ResolveError,
    DEFAULT_MAX_HOPS,
};
pub use text::{
    decode_text, encode_text, text_link, EncodedText, TextCodecError, TextId, TextKind, TextLimits,
};
pub use title::{format_title, parse_title, TitleError, MAX_DISPLAY_SEQ};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("namespace `{0}` has no configured key")]
    UnknownNamespace(String),
}
