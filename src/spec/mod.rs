//! Spec manifests and their repository.
//!
//! A spec describes how one component is built, tested, installed and
//! packaged, and which other specs it depends on. Specs are declarative
//! TOML files; a directory of them plus a `repositories.toml` forms a
//! [`SpecRepository`]. The planner loads specs into memoised
//! [`SpecInstance`]s keyed by name, platforms, qualifier and kind.

pub mod deps;
pub mod package;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::Deserialize;
use tracing::debug;

use crate::error::{PlanError, Result};
use crate::platform::PlatformEnv;

pub use deps::Dependency;
pub use package::{RepoData, SourceBuilder, SourceRef};

/// The kinds of work a spec can support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Primitive {
    Build,
    Install,
    Test,
    Source,
}

impl Primitive {
    pub fn as_str(&self) -> &'static str {
        match self {
            Primitive::Build => "build",
            Primitive::Install => "install",
            Primitive::Test => "test",
            Primitive::Source => "source",
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One spec, as declared in its TOML manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct SpecManifest {
    pub name: String,
    /// Name of the workspace the spec's actions execute in; defaults to
    /// the spec name. Two instances sharing a build space share a uid.
    #[serde(default)]
    pub build_space_name: Option<String>,
    /// Name of the publishable artefact, if any.
    #[serde(default)]
    pub component: Option<String>,
    /// Whether the spec produces a binary package.
    #[serde(default)]
    pub package: bool,
    /// Primitives the spec implements (`source` is implied by declaring
    /// source builders).
    #[serde(default)]
    pub primitives: Vec<Primitive>,
    #[serde(default)]
    pub build_deps: Vec<Dependency>,
    #[serde(default)]
    pub install_deps: Vec<Dependency>,
    #[serde(default)]
    pub test_deps: Vec<Dependency>,
    #[serde(default)]
    pub source_deps: Vec<Dependency>,
    #[serde(default)]
    pub build_source_list: Vec<SourceRef>,
    #[serde(default)]
    pub install_source_list: Vec<SourceRef>,
    #[serde(default)]
    pub test_source_list: Vec<SourceRef>,
    /// Builders for the source artefacts this spec provides.
    #[serde(default)]
    pub source_pkg_build: Vec<SourceBuilder>,
}

impl SpecManifest {
    pub fn from_str(content: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(content).map_err(|e| {
            PlanError::with_origin(format!("invalid spec manifest: {}", e), "spec.load")
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PlanError::with_origin(
                format!("failed to read {}: {}", path.display(), e),
                "spec.load",
            )
        })?;
        Self::from_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        let name_re = regex::Regex::new(r"^[a-z0-9][a-z0-9_-]*$").unwrap();
        if !name_re.is_match(&self.name) {
            return Err(PlanError::with_origin(
                format!(
                    "invalid spec name '{}': must match [a-z0-9][a-z0-9_-]*",
                    self.name
                ),
                "spec.load",
            ));
        }

        for (label, deps) in [
            ("build_deps", &self.build_deps),
            ("install_deps", &self.install_deps),
            ("test_deps", &self.test_deps),
            ("source_deps", &self.source_deps),
        ] {
            let mut seen = HashSet::new();
            for dep in deps {
                dep.kind()?;
                if !seen.insert(dep.local_name()) {
                    return Err(PlanError::with_origin(
                        format!(
                            "spec {} has two {} entries with the same local_name ({})",
                            self.name,
                            label,
                            dep.local_name()
                        ),
                        "spec.load",
                    ));
                }
            }
        }

        for builder in &self.source_pkg_build {
            if builder.managed && builder.checkout.is_empty() {
                return Err(PlanError::with_origin(
                    format!(
                        "spec {}: managed source builder {} declares no checkout",
                        self.name, builder.name
                    ),
                    "spec.load",
                ));
            }
        }
        Ok(())
    }

    pub fn build_space_name(&self) -> &str {
        self.build_space_name.as_deref().unwrap_or(&self.name)
    }

    /// Dependencies declared for a primitive.
    pub fn deps(&self, primitive: Primitive) -> &[Dependency] {
        match primitive {
            Primitive::Build => &self.build_deps,
            Primitive::Install => &self.install_deps,
            Primitive::Test => &self.test_deps,
            Primitive::Source => &self.source_deps,
        }
    }

    /// Sources to install for a primitive.
    pub fn source_list(&self, primitive: Primitive) -> &[SourceRef] {
        match primitive {
            Primitive::Build => &self.build_source_list,
            Primitive::Install => &self.install_source_list,
            Primitive::Test => &self.test_source_list,
            Primitive::Source => &[],
        }
    }
}

/// An addressable collection of spec manifests and named repositories.
pub struct SpecRepository {
    specs: std::collections::HashMap<String, Rc<SpecManifest>>,
    /// Repository name to checkout data, from `repositories.toml`.
    pub repos: std::collections::HashMap<String, RepoData>,
}

#[derive(Debug, Deserialize)]
struct RepositoriesFile {
    #[serde(default)]
    repositories: std::collections::HashMap<String, RepoData>,
}

impl Default for SpecRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl SpecRepository {
    pub fn new() -> Self {
        Self {
            specs: std::collections::HashMap::new(),
            repos: std::collections::HashMap::new(),
        }
    }

    /// Load every `*.toml` spec manifest in `dir`, plus the optional
    /// `repositories.toml` describing named checkouts.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(PlanError::with_origin(
                format!("spec directory {} does not exist", dir.display()),
                "spec.repository",
            ));
        }

        let mut repo = Self::new();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| {
                PlanError::with_origin(
                    format!("cannot list {}: {}", dir.display(), e),
                    "spec.repository",
                )
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("toml"))
            .collect();
        paths.sort();

        for path in paths {
            if path.file_name().and_then(|s| s.to_str()) == Some("repositories.toml") {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    PlanError::with_origin(
                        format!("failed to read {}: {}", path.display(), e),
                        "spec.repository",
                    )
                })?;
                let file: RepositoriesFile = toml::from_str(&content).map_err(|e| {
                    PlanError::with_origin(
                        format!("invalid repositories file {}: {}", path.display(), e),
                        "spec.repository",
                    )
                })?;
                repo.repos.extend(file.repositories);
                continue;
            }
            let manifest = SpecManifest::from_file(&path)?;
            repo.add_spec(manifest);
        }
        debug!("loaded {} specs from {}", repo.specs.len(), dir.display());
        Ok(repo)
    }

    /// Register a manifest programmatically.
    pub fn add_spec(&mut self, manifest: SpecManifest) {
        self.specs.insert(manifest.name.clone(), Rc::new(manifest));
    }

    pub fn add_repo(&mut self, name: impl Into<String>, data: RepoData) {
        self.repos.insert(name.into(), data);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn load(&self, name: &str) -> Result<Rc<SpecManifest>> {
        self.specs.get(name).cloned().ok_or_else(|| {
            PlanError::with_origin(format!("unknown spec {}", name), "spec.repository")
        })
    }
}

/// Opaque workspace description handed through to spec instances; the
/// planner core never reads it.
#[derive(Debug)]
pub struct Sandbox {
    pub root: PathBuf,
}

/// One loaded spec, specialised by platforms, qualifier and primitive.
///
/// Instances are memoised by the planning context: loading the same
/// instance key twice yields the same object.
#[derive(Debug)]
pub struct SpecInstance {
    manifest: Rc<SpecManifest>,
    pub kind: Primitive,
    pub qualifier: Option<String>,
    pub env: PlatformEnv,
    /// Set when the instance was loaded to create one specific source.
    pub source_name: Option<String>,
    /// Identifier of the instance's build space and of its primitive
    /// actions: `machine.platform.build_space_name.kind`.
    pub uid: String,
    sandbox: Option<Rc<Sandbox>>,
}

impl SpecInstance {
    pub fn new(
        manifest: Rc<SpecManifest>,
        kind: Primitive,
        qualifier: Option<String>,
        env: PlatformEnv,
        source_name: Option<String>,
        sandbox: Option<Rc<Sandbox>>,
    ) -> Self {
        let uid = format!(
            "{}.{}.{}.{}",
            env.build.machine,
            env.platform(),
            manifest.build_space_name(),
            kind
        );
        Self {
            manifest,
            kind,
            qualifier,
            env,
            source_name,
            uid,
            sandbox,
        }
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn manifest(&self) -> &SpecManifest {
        &self.manifest
    }

    pub fn sandbox(&self) -> Option<&Rc<Sandbox>> {
        self.sandbox.as_ref()
    }

    pub fn component(&self) -> Option<&str> {
        self.manifest.component.as_deref()
    }

    /// Whether the spec produces a publishable binary package.
    pub fn has_package(&self) -> bool {
        self.manifest.package && self.manifest.component.is_some()
    }

    /// Whether the spec supports `primitive`. `source` is supported iff
    /// the spec declares source builders.
    pub fn has_primitive(&self, primitive: Primitive) -> bool {
        match primitive {
            Primitive::Source => !self.manifest.source_pkg_build.is_empty(),
            other => self.manifest.primitives.contains(&other),
        }
    }

    pub fn deps(&self, primitive: Primitive) -> &[Dependency] {
        self.manifest.deps(primitive)
    }

    pub fn source_list(&self, primitive: Primitive) -> &[SourceRef] {
        self.manifest.source_list(primitive)
    }

    pub fn source_pkg_build(&self) -> &[SourceBuilder] {
        &self.manifest.source_pkg_build
    }
}
