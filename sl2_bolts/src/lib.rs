/*!
Shared bits of the sl2 fuzzing agent: the crate-wide [`Error`], a [`log`] sink on stderr and
stable hashing helpers used to fingerprint intercepted calls.
*/

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
))]
#![cfg_attr(test, deny(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_must_use,
))]

use core::{
    fmt::{self, Display},
    num::{ParseIntError, TryFromIntError},
    time,
};
use std::{
    io,
    string::FromUtf8Error,
    time::{SystemTime, UNIX_EPOCH},
};

use log::{Metadata, Record};
use sha2::{Digest, Sha256};

/// Length of a hex encoded SHA-256 digest, as produced by [`sha256_hex`].
pub const HASH_LEN: usize = 64;

/// Main error struct for the sl2 agent
#[derive(Debug)]
pub enum Error {
    /// Serialization error
    Serialize(String),
    /// File or socket related error
    File(io::Error),
    /// Optional val was supposed to be set, but isn't.
    EmptyOptional(String),
    /// Key not in Map
    KeyNotFound(String),
    /// You're holding it wrong
    IllegalState(String),
    /// The argument passed to this method or function is not valid
    IllegalArgument(String),
    /// The performed action is not supported by the current platform backend
    Unsupported(String),
    /// Something else happened
    Unknown(String),
}

impl Error {
    /// Serialization error
    #[must_use]
    pub fn serialize<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Serialize(arg.into())
    }
    /// File related error
    #[must_use]
    pub fn file(arg: io::Error) -> Self {
        Error::File(arg)
    }
    /// Optional val was supposed to be set, but isn't.
    #[must_use]
    pub fn empty_optional<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::EmptyOptional(arg.into())
    }
    /// Key not in Map
    #[must_use]
    pub fn key_not_found<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::KeyNotFound(arg.into())
    }
    /// You're holding it wrong
    #[must_use]
    pub fn illegal_state<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalState(arg.into())
    }
    /// The argument passed to this method or function is not valid
    #[must_use]
    pub fn illegal_argument<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalArgument(arg.into())
    }
    /// This operation is not supported by the platform backend
    #[must_use]
    pub fn unsupported<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Unsupported(arg.into())
    }
    /// Something else happened
    #[must_use]
    pub fn unknown<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Unknown(arg.into())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Serialize(s) => write!(f, "Error in Serialization: `{0}`", &s),
            Self::File(err) => write!(f, "File IO failed: {:?}", &err),
            Self::EmptyOptional(s) => write!(f, "Optional value `{0}` was not set", &s),
            Self::KeyNotFound(s) => write!(f, "Key `{0}` not found", &s),
            Self::IllegalState(s) => write!(f, "Illegal state: {0}", &s),
            Self::IllegalArgument(s) => write!(f, "Illegal argument: {0}", &s),
            Self::Unsupported(s) => write!(f, "The operation is not supported: '{0}'", &s),
            Self::Unknown(s) => write!(f, "Unknown error: {0}", &s),
        }
    }
}

impl std::error::Error for Error {}

impl From<postcard::Error> for Error {
    fn from(err: postcard::Error) -> Self {
        Self::serialize(format!("{err:?}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialize(format!("{err:?}"))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::file(err)
    }
}

impl From<FromUtf8Error> for Error {
    fn from(err: FromUtf8Error) -> Self {
        Self::unknown(format!("Could not convert byte / utf-8: {err:?}"))
    }
}

impl From<ParseIntError> for Error {
    fn from(err: ParseIntError) -> Self {
        Self::unknown(format!("Failed to parse Int: {err:?}"))
    }
}

impl From<TryFromIntError> for Error {
    fn from(err: TryFromIntError) -> Self {
        Self::illegal_state(format!("Expected conversion failed: {err:?}"))
    }
}

impl From<uuid::Error> for Error {
    fn from(err: uuid::Error) -> Self {
        Self::illegal_argument(format!("Invalid uuid: {err}"))
    }
}

/// Current time
#[must_use]
#[inline]
pub fn current_time() -> time::Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Hex encoded SHA-256 of all `parts`, fed in order.
///
/// Used to fingerprint the arguments of an intercepted call, so the value has to stay stable
/// across runs and machines.
#[must_use]
pub fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

/// The agent's logger
pub static SL2_STDERR_LOGGER: SimpleStderrLogger = SimpleStderrLogger::new();

/// Logs to stderr as `[<seconds>.<millis>] <LEVEL> <target>: <message>`.
///
/// The agent lives inside somebody else's process, so stderr is usually the only stream the
/// coordinator's supervisor reliably captures.
#[derive(Debug, Default)]
pub struct SimpleStderrLogger {}

impl SimpleStderrLogger {
    /// A logger; register [`SL2_STDERR_LOGGER`] through [`SimpleStderrLogger::set_logger`]
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }

    /// Make [`SL2_STDERR_LOGGER`] the process' logger. Fails if one is registered already.
    pub fn set_logger() -> Result<(), Error> {
        log::set_logger(&SL2_STDERR_LOGGER)
            .map_err(|_| Error::illegal_state("a logger is already registered"))
    }

    /// One log line, without the trailing newline
    #[must_use]
    pub fn format(now: time::Duration, record: &Record) -> String {
        format!(
            "[{}.{:03}] {} {}: {}",
            now.as_secs(),
            now.subsec_millis(),
            record.level(),
            record.target(),
            record.args()
        )
    }
}

impl log::Log for SimpleStderrLogger {
    #[inline]
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{}", Self::format(current_time(), record));
        }
    }

    fn flush(&self) {}
}
