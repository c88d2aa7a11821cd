use std::fmt;

/// Configuration-time errors, surfaced to the user at startup (spec.md §7
/// "Configuration error"). Hand-rolled rather than `anyhow` because callers
/// (the CLI, and tests) need to match on the kind, not just print it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A flag or env var carried a value that could not be parsed.
    InvalidArgument { flag: &'static str, message: String },
    /// Two or more flags that are mutually exclusive were both supplied.
    Conflict { flags: Vec<&'static str> },
    /// A flag requires another flag that was not supplied.
    MissingDependency { flag: &'static str, requires: &'static str },
    /// No message-source flag was supplied at all.
    NoMessageSource,
    /// A required value was absent.
    Missing { flag: &'static str },
    /// `sz://core-settings/...` pointer could not be resolved.
    PointerNotFound(String),
    /// The core-settings document was not valid JSON / not loaded.
    CoreSettingsUnavailable(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidArgument { flag, message } => {
                write!(f, "invalid value for {flag}: {message}")
            }
            ConfigError::Conflict { flags } => {
                write!(f, "mutually exclusive flags supplied together: {}", flags.join(", "))
            }
            ConfigError::MissingDependency { flag, requires } => {
                write!(f, "{flag} requires {requires}")
            }
            ConfigError::NoMessageSource => write!(
                f,
                "no message source configured (one of --sqs-info-uri, --rabbit-info-uri, --database-info-queue is required)"
            ),
            ConfigError::Missing { flag } => write!(f, "missing required value: {flag}"),
            ConfigError::PointerNotFound(p) => write!(f, "core-settings pointer not found: {p}"),
            ConfigError::CoreSettingsUnavailable(why) => {
                write!(f, "core-settings document unavailable: {why}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
