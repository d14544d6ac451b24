//! shelf-core - shared primitives for the shelfd daemon.
//!
//! Leaf building blocks with no runtime dependencies: normalization and
//! scene-tag matching, path-segment safety, the structured operator event
//! log, and the configuration documents with their validation, migration,
//! and bootstrap machinery.

pub mod config;
pub mod eventlog;
pub mod normalize;
pub mod pathsafe;

pub use config::{
    bootstrap, ConfigBundle, ConfigPaths, EquivalenceGroup, EquivalentsDoc, SceneTagsDoc,
    Settings, SourcePriorityDoc, ValidationError, ValidationProfile,
};
pub use eventlog::{EventLog, EventLogger, LogLevel, RollingFileSink};
pub use normalize::{normalize_title_key, normalize_token_key, SceneTagMatcher};
pub use pathsafe::{escape_segment, unescape_segment};
