//! Command-line/env configuration for the data-mart replicator.
//!
//! Not part of the core budget (spec.md §1 lists CLI parsing and
//! configuration loading as out-of-scope external collaborators) but still
//! built with the same ambient stack as the core: explicit data types,
//! `serde_json` for the engine-settings document, hand-rolled validation
//! instead of reflection.

pub mod error;
pub mod options;
pub mod rate;
pub mod uri;

pub use error::ConfigError;
pub use options::{CoreLogLevel, Environment, MessageSource, Options, ParsedArgs, RawArgs};
pub use rate::{ProcessingRate, RateProfile};
pub use uri::{ConnectionUri, PostgresUri, ResolvedUri, SqliteUri};
