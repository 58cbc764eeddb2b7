//! kmirror core: kind identifiers, the kind registry, configuration, errors and the
//! seams (object store, capability resolver, diff sink) the engine is written against.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod kind;
pub mod mem;
pub mod meta;
pub mod registry;
pub mod store;

pub use config::{LabelSelector, MirrorConfig, NameMatcher, DEFAULT_QUEUE_CAP, DEFAULT_WARMUP};
pub use error::{MirrorError, MirrorResult};
pub use kind::{KindDescriptor, KindId, Scope, VersionRank};
pub use meta::FINALIZER;
pub use registry::KindRegistry;
pub use store::{CapabilityResolver, ChangeEvent, ChangeKind, DiffSink, ObjectStore};
