//! Nodes of the planner's action DAG.
//!
//! Every variant carries a deterministic uid derived from its payload, so
//! two planning runs over identical inputs produce identical graphs.

pub mod decision;

use std::fmt;
use std::rc::Rc;

use crate::spec::package::{RepoData, SourceBuilder, SourceRef};
use crate::spec::SpecInstance;

pub use decision::{Choice, Decision, DecisionKind, Trigger};

/// One unit of plannable work (or the Root sentinel, or a Decision).
#[derive(Debug, Clone)]
pub enum Action {
    /// Terminal sink of the final DAG; "executes" once everything else did.
    Root,
    /// Obtain one named source artefact, by whatever means.
    GetSource(Rc<SourceBuilder>),
    /// Retrieve a source from the artefact store. Always a leaf.
    DownloadSource(Rc<SourceBuilder>),
    /// Place a source into the workspace of `spec`.
    InstallSource {
        uid: String,
        spec: Rc<SpecInstance>,
        source: SourceRef,
    },
    /// Assemble one source artefact from repository checkouts.
    CreateSource {
        spec: Rc<SpecInstance>,
        source_name: String,
    },
    /// Aggregate of all CreateSource actions of one spec.
    CreateSources(Rc<SpecInstance>),
    /// VCS checkout of one repository. Always a leaf.
    Checkout { repo_name: String, repo: RepoData },
    Build(Rc<SpecInstance>),
    Test(Rc<SpecInstance>),
    Install(Rc<SpecInstance>),
    /// Retrieve a pre-built binary package. Always a leaf.
    DownloadBinary(Rc<SpecInstance>),
    UploadBinaryComponent(Rc<SpecInstance>),
    UploadSourceComponent(Rc<SpecInstance>),
    UploadSource {
        spec: Rc<SpecInstance>,
        source_name: String,
    },
    /// Unresolved choice between two realisations of the same outcome.
    /// Present only in the expansion DAG.
    Decision(Rc<Decision>),
}

impl Action {
    /// Deterministic unique identifier of this action.
    pub fn uid(&self) -> String {
        match self {
            Action::Root => "root".to_string(),
            Action::GetSource(b) => format!("source_get.{}", b.name),
            Action::DownloadSource(b) => format!("download.{}", b.name),
            Action::InstallSource { uid, .. } => uid.clone(),
            Action::CreateSource { spec, source_name } => {
                format!("{}.{}", spec.uid, source_name)
            }
            Action::CreateSources(spec) => format!("{}.sources", spec.uid),
            Action::Checkout { repo_name, .. } => format!("checkout.{}", repo_name),
            Action::Build(spec) | Action::Test(spec) | Action::Install(spec) => spec.uid.clone(),
            Action::DownloadBinary(spec) => replace_last_segment(&spec.uid, "download_bin"),
            Action::UploadBinaryComponent(spec) | Action::UploadSourceComponent(spec) => {
                replace_last_segment(&spec.uid, "upload_bin")
            }
            Action::UploadSource { spec, source_name } => {
                format!("{}.{}", replace_last_segment(&spec.uid, "upload_src"), source_name)
            }
            Action::Decision(d) => d.uid.clone(),
        }
    }

    /// Spec instance this action operates on, if any.
    pub fn spec(&self) -> Option<&Rc<SpecInstance>> {
        match self {
            Action::InstallSource { spec, .. }
            | Action::CreateSource { spec, .. }
            | Action::CreateSources(spec)
            | Action::Build(spec)
            | Action::Test(spec)
            | Action::Install(spec)
            | Action::DownloadBinary(spec)
            | Action::UploadBinaryComponent(spec)
            | Action::UploadSourceComponent(spec)
            | Action::UploadSource { spec, .. } => Some(spec),
            _ => None,
        }
    }

    pub fn is_upload(&self) -> bool {
        matches!(
            self,
            Action::UploadBinaryComponent(_)
                | Action::UploadSourceComponent(_)
                | Action::UploadSource { .. }
        )
    }

    pub fn as_decision(&self) -> Option<&Rc<Decision>> {
        match self {
            Action::Decision(d) => Some(d),
            _ => None,
        }
    }
}

/// Replace the last dotted segment of an uid.
fn replace_last_segment(uid: &str, segment: &str) -> String {
    match uid.rfind('.') {
        Some(pos) => format!("{}.{}", &uid[..pos], segment),
        None => segment.to_string(),
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Root => write!(f, "root node"),
            Action::GetSource(b) => write!(f, "get source {}", b.name),
            Action::DownloadSource(b) => write!(f, "download source {}", b.name),
            Action::InstallSource { source, .. } => {
                write!(f, "install source {}", source.name)
            }
            Action::CreateSource { source_name, .. } => {
                write!(f, "create source {}", source_name)
            }
            Action::CreateSources(spec) => {
                write!(f, "create all sources for {}", spec.name())
            }
            Action::Checkout { repo_name, .. } => write!(f, "checkout {}", repo_name),
            Action::Build(spec) | Action::Test(spec) | Action::Install(spec) => {
                write!(
                    f,
                    "{} {} for {}",
                    spec.kind,
                    spec.name(),
                    spec.env.platform()
                )?;
                if let Some(q) = &spec.qualifier {
                    write!(f, " (qualifier={})", q)?;
                }
                Ok(())
            }
            Action::DownloadBinary(spec) => {
                write!(f, "download binary of {}", spec.name())
            }
            Action::UploadBinaryComponent(spec) => {
                write!(f, "upload binary package of {}", spec.name())
            }
            Action::UploadSourceComponent(spec) => {
                write!(f, "upload source metadata of {}", spec.name())
            }
            Action::UploadSource { source_name, .. } => {
                write!(f, "upload source {}", source_name)
            }
            Action::Decision(d) => write!(f, "decision for {}", d.initiator),
        }
    }
}
