//! kmirror sync: the eligibility filter, finalizer guard, kind sanitizer and mirror engine,
//! plus the bootstrap pass and the producer/consumer pipeline that drive them.

#![forbid(unsafe_code)]

pub mod bootstrap;
pub mod engine;
pub mod filter;
pub mod finalizer;
pub mod pipeline;
pub mod sanitize;

pub use bootstrap::{run_once, BootstrapReport, KindOutcome, Tally};
pub use engine::{Engine, Outcome};
pub use filter::{build_registry, Filter, DENY_NAMES};
pub use finalizer::FinalizerGuard;
pub use pipeline::{CancelHandle, Pipeline, PipelineHandle, PipelineStats};
pub use sanitize::{sanitize, Rule};
