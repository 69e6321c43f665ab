//! Source packages, source builders and repository records.

use serde::Deserialize;

/// A named VCS repository, as declared in `repositories.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepoData {
    pub vcs: String,
    pub url: String,
    #[serde(default)]
    pub revision: Option<String>,
}

/// Recipe for producing one named source artefact.
///
/// A managed builder assembles the artefact from repository checkouts; an
/// unmanaged one has no local assembly and can only be downloaded from
/// the store (typical for third party archives).
#[derive(Debug, Clone, Deserialize)]
pub struct SourceBuilder {
    pub name: String,
    /// Names of the repositories needed to assemble the source.
    #[serde(default)]
    pub checkout: Vec<String>,
    #[serde(default = "default_managed")]
    pub managed: bool,
}

fn default_managed() -> bool {
    true
}

/// Reference to a source artefact from a spec's source list, together
/// with where it should land in the workspace.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRef {
    pub name: String,
    /// Subdirectory of the workspace source dir to extract into.
    #[serde(default)]
    pub dest: Option<String>,
}
