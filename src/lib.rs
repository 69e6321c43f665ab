//! loftsman — a build-action planner.
//!
//! Given a repository of package specs and a plan naming the components
//! to produce, the planner expands each plan entry into the transitive
//! closure of concrete actions it implies (checkouts, source assembly,
//! downloads, builds, installs, tests, uploads), inserting Decision
//! nodes wherever two realisations of the same outcome are possible.
//! A second pass resolves every decision and prunes the graph down to a
//! cycle-free execution DAG in which every edge means "must run before".
//!
//! The planner performs no work itself: executing the resulting DAG is
//! the job of a downstream executor, which typically drives the
//! busy-aware topological iterator and uses [`Fingerprint`]s to decide
//! between reuse and rebuild.

pub mod action;
pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod planner;
pub mod platform;
pub mod spec;
pub mod util;

pub use action::{Action, Choice, Decision, DecisionKind};
pub use error::{PlanError, Result};
pub use fingerprint::{Fingerprint, FingerprintDiff, FINGERPRINT_VERSION};
pub use graph::Dag;
pub use planner::schedule::{
    always_create_source_resolver, always_download_source_resolver, decision_error,
};
pub use planner::{ActionDag, PlanArgs, PlanContext, PlanEntry, PlanTag};
pub use platform::{Platform, PlatformEnv};
pub use spec::{Primitive, Sandbox, SpecInstance, SpecManifest, SpecRepository};
