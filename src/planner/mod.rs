//! Plan expansion: turning plan entries into the action DAG.
//!
//! [`PlanContext`] owns the expansion state. Each plan entry is expanded
//! into the transitive closure of actions its spec implies; wherever the
//! closure admits two realisations of the same outcome a [`Decision`]
//! node is inserted, to be resolved by the scheduling pass in
//! [`schedule`](PlanContext::schedule).

pub mod schedule;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::action::{Action, Choice, Decision, DecisionKind};
use crate::error::{PlanError, Result};
use crate::graph::Dag;
use crate::platform::{Platform, PlatformEnv};
use crate::spec::{
    Dependency, Primitive, Sandbox, SourceBuilder, SpecInstance, SpecRepository,
};

/// Plan-local arguments recorded on tagged vertices.
pub type PlanArgs = BTreeMap<String, String>;

/// Provenance of a vertex: the plan entry that introduced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanTag {
    /// Source location token, e.g. `plan.txt:3`, quoted verbatim in
    /// diagnostics.
    pub plan_line: String,
    pub plan_args: PlanArgs,
}

/// The DAG produced and consumed by the planner.
pub type ActionDag = Dag<Action, PlanTag>;

/// One already-parsed entry of the plan.
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub name: String,
    pub primitive: Primitive,
    /// Environment to load the spec under; the context default if unset.
    pub env: Option<PlatformEnv>,
    pub qualifier: Option<String>,
    /// When set, only these source packages are assembled by a `source`
    /// entry.
    pub source_packages: Option<Vec<String>>,
    /// Whether uploads to the store should be planned.
    pub upload: bool,
    pub plan_line: Option<String>,
    pub plan_args: Option<PlanArgs>,
}

impl PlanEntry {
    pub fn new(name: impl Into<String>, primitive: Primitive) -> Self {
        Self {
            name: name.into(),
            primitive,
            env: None,
            qualifier: None,
            source_packages: None,
            upload: true,
            plan_line: None,
            plan_args: None,
        }
    }

    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }

    pub fn with_plan_line(mut self, plan_line: impl Into<String>) -> Self {
        self.plan_line = Some(plan_line.into());
        if self.plan_args.is_none() {
            self.plan_args = Some(PlanArgs::new());
        }
        self
    }

    pub fn with_upload(mut self, upload: bool) -> Self {
        self.upload = upload;
        self
    }
}

/// Memoisation key for spec instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InstanceKey {
    name: String,
    build: Platform,
    host: Platform,
    target: Platform,
    qualifier: Option<String>,
    kind: Primitive,
    source_name: Option<String>,
}

/// Parameters of one recursive expansion step.
#[derive(Debug, Clone)]
struct SpecRequest {
    name: String,
    env: PlatformEnv,
    primitive: Primitive,
    qualifier: Option<String>,
    source_packages: Option<Vec<String>>,
    expand_build: bool,
    source_name: Option<String>,
    plan_line: Option<String>,
    plan_args: Option<PlanArgs>,
    upload: bool,
}

impl SpecRequest {
    fn new(name: impl Into<String>, env: PlatformEnv, primitive: Primitive) -> Self {
        Self {
            name: name.into(),
            env,
            primitive,
            qualifier: None,
            source_packages: None,
            expand_build: true,
            source_name: None,
            plan_line: None,
            plan_args: None,
            upload: false,
        }
    }
}

/// Expansion context: spec cache, known sources, dependency bookkeeping
/// and the expansion DAG itself.
pub struct PlanContext {
    repo: SpecRepository,
    default_env: PlatformEnv,
    reject_duplicates: bool,
    sandbox: Option<Rc<Sandbox>>,
    /// The expansion DAG, Decision nodes included.
    pub tree: ActionDag,
    cache: HashMap<InstanceKey, Rc<SpecInstance>>,
    /// Per spec uid, the dependencies walked so far keyed by local name.
    dependencies: HashMap<String, IndexMap<String, (Dependency, Rc<SpecInstance>)>>,
    /// Source name to (declaring spec name, builder).
    sources: HashMap<String, (String, Rc<SourceBuilder>)>,
}

impl PlanContext {
    /// Create a context over a spec repository.
    ///
    /// `default_env` stands in for plan entries that do not force an
    /// environment (pass `None` for the local machine). With
    /// `reject_duplicates`, two plan entries landing in the same build
    /// space fail expansion.
    pub fn new(
        repo: SpecRepository,
        default_env: Option<PlatformEnv>,
        reject_duplicates: bool,
    ) -> Self {
        let mut tree = ActionDag::new();
        let root = Action::Root;
        tree.update_vertex(&root.uid(), Some(root), std::iter::empty(), false)
            .ok();
        Self {
            repo,
            default_env: default_env.unwrap_or_else(PlatformEnv::local),
            reject_duplicates,
            sandbox: None,
            tree,
            cache: HashMap::new(),
            dependencies: HashMap::new(),
            sources: HashMap::new(),
        }
    }

    /// Attach a sandbox; instances loaded from now on record it.
    pub fn bind_sandbox(&mut self, sandbox: Sandbox) {
        self.sandbox = Some(Rc::new(sandbox));
    }

    pub fn default_env(&self) -> &PlatformEnv {
        &self.default_env
    }

    pub fn repository(&self) -> &SpecRepository {
        &self.repo
    }

    /// Dependencies registered for a spec uid, keyed by local name.
    pub fn dependencies(
        &self,
        spec_uid: &str,
    ) -> Option<&IndexMap<String, (Dependency, Rc<SpecInstance>)>> {
        self.dependencies.get(spec_uid)
    }

    /// Load a spec instance, memoised on the full instance key.
    fn load(
        &mut self,
        name: &str,
        env: Option<&PlatformEnv>,
        qualifier: Option<&str>,
        kind: Primitive,
        source_name: Option<&str>,
    ) -> Result<Rc<SpecInstance>> {
        let env = env.unwrap_or(&self.default_env).clone();
        let key = InstanceKey {
            name: name.to_string(),
            build: env.build.clone(),
            host: env.host.clone(),
            target: env.target.clone(),
            qualifier: qualifier.map(str::to_string),
            kind,
            source_name: source_name.map(str::to_string),
        };

        if let Some(instance) = self.cache.get(&key) {
            return Ok(instance.clone());
        }

        let manifest = self.repo.load(name)?;
        let instance = Rc::new(SpecInstance::new(
            manifest,
            kind,
            qualifier.map(str::to_string),
            env,
            source_name.map(str::to_string),
            self.sandbox.clone(),
        ));

        // Fresh instance, fresh dependency table for its uid.
        self.dependencies
            .insert(instance.uid.clone(), IndexMap::new());

        // Sources declared by the spec become addressable as soon as any
        // instance of it is loaded.
        for builder in instance.source_pkg_build() {
            self.sources.insert(
                builder.name.clone(),
                (name.to_string(), Rc::new(builder.clone())),
            );
        }

        self.cache.insert(key, instance.clone());
        Ok(instance)
    }

    /// Insert an action with the given predecessors (existing
    /// predecessors are kept).
    fn add(&mut self, action: &Action, predecessors: &[&Action]) -> Result<()> {
        let preds: Vec<String> = predecessors.iter().map(|a| a.uid()).collect();
        self.tree
            .update_vertex(&action.uid(), Some(action.clone()), preds, false)
    }

    /// Add predecessors to an existing action.
    fn connect(&mut self, action: &Action, predecessors: &[&Action]) -> Result<()> {
        let preds: Vec<String> = predecessors.iter().map(|a| a.uid()).collect();
        self.tree.update_vertex(&action.uid(), None, preds, false)
    }

    /// Insert `root -> decision -> {left, right}`.
    fn add_decision(
        &mut self,
        kind: DecisionKind,
        root: &Action,
        left: &Action,
        right: &Action,
    ) -> Result<()> {
        let decision = Action::Decision(Rc::new(Decision::new(
            kind,
            root,
            left.clone(),
            right.clone(),
        )));
        self.add(&decision, &[left, right])?;
        self.connect(root, &[&decision])
    }

    pub fn contains(&self, action: &Action) -> bool {
        self.tree.contains(&action.uid())
    }

    pub fn get(&self, uid: &str) -> Option<&Action> {
        self.tree.get(uid)
    }

    /// Predecessor actions of `action` in the expansion DAG.
    fn predecessors(&self, action: &Action) -> Vec<Action> {
        self.tree
            .get_predecessors(&action.uid())
            .iter()
            .filter_map(|uid| self.tree.get(uid).cloned())
            .collect()
    }

    /// Tag a vertex with the plan entry that introduced it, rejecting
    /// collisions of two entries on one build space when configured to.
    fn link_to_plan(&mut self, uid: &str, plan_line: &str, plan_args: &PlanArgs) -> Result<()> {
        if self.reject_duplicates {
            if let Some(previous) = self.tree.get_tag(uid) {
                if previous.plan_line != plan_line {
                    return Err(PlanError::new(format!(
                        "entries {} and {} conflict because they result in \
                         the same build space (id: {}). Check your \
                         build_space_name property or your qualifiers",
                        previous.plan_line, plan_line, uid
                    ))
                    .uid(uid));
                }
            }
        }
        self.tree.add_tag(
            uid,
            PlanTag {
                plan_line: plan_line.to_string(),
                plan_args: plan_args.clone(),
            },
        );
        Ok(())
    }

    /// Expand one plan entry and connect its subtree under Root.
    ///
    /// A `build` entry commits any dominating build-or-download decision
    /// to the build side and, when the spec publishes a component and
    /// uploads are wanted, plans the upload of the built component. An
    /// `install` entry commits dominating decisions to the download side.
    pub fn add_plan_entry(&mut self, entry: &PlanEntry) -> Result<Action> {
        let mut request = SpecRequest::new(
            entry.name.clone(),
            entry.env.clone().unwrap_or_else(|| self.default_env.clone()),
            entry.primitive,
        );
        request.qualifier = entry.qualifier.clone();
        request.source_packages = entry.source_packages.clone();
        request.plan_line = entry.plan_line.clone();
        request.plan_args = entry.plan_args.clone();
        request.upload = entry.upload;

        let result = self.add_spec(request)?;
        self.connect(&Action::Root, &[&result])?;

        match entry.primitive {
            Primitive::Build => {
                let mut build_action: Option<Action> = None;
                for pred in self.predecessors(&result) {
                    if let Action::Decision(decision) = &pred {
                        if decision.kind == DecisionKind::BuildOrDownload {
                            decision.set_decision(Decision::BUILD, entry.plan_line.as_deref());
                            build_action = self.get(&decision.left()).cloned();
                        }
                    }
                }
                if build_action.is_none() && matches!(result, Action::Build(_)) {
                    build_action = Some(result.clone());
                }

                if let Some(build_action) = build_action {
                    let spec = build_action.spec().cloned();
                    if let Some(spec) = spec {
                        if spec.component().is_some() && entry.upload {
                            let upload = if spec.has_package() {
                                Action::UploadBinaryComponent(spec)
                            } else {
                                Action::UploadSourceComponent(spec)
                            };
                            self.add(&upload, &[])?;
                            if let (Some(line), Some(args)) = (&entry.plan_line, &entry.plan_args)
                            {
                                self.link_to_plan(&upload.uid(), line, args)?;
                            }
                            self.connect(&Action::Root, &[&upload])?;
                            self.connect(&upload, &[&build_action])?;
                        }
                    }
                }
            }
            Primitive::Install => {
                for pred in self.predecessors(&result) {
                    if let Action::Decision(decision) = &pred {
                        if decision.kind == DecisionKind::BuildOrDownload {
                            decision.set_decision(Decision::INSTALL, entry.plan_line.as_deref());
                        }
                    }
                }
            }
            Primitive::Test | Primitive::Source => {}
        }
        Ok(result)
    }

    /// Recursively expand one spec/primitive into its action subtree.
    fn add_spec(&mut self, request: SpecRequest) -> Result<Action> {
        debug!(
            "add spec: name:{} qualifier:{:?} primitive:{}",
            request.name, request.qualifier, request.primitive
        );
        let spec = self.load(
            &request.name,
            Some(&request.env),
            request.qualifier.as_deref(),
            request.primitive,
            request.source_name.as_deref(),
        )?;

        // Root action for this spec/primitive. A source request without a
        // specific source name becomes an aggregate with one child per
        // managed builder; the aggregate's presence in the DAG also
        // short-circuits the rest of the expansion below.
        let result = match request.primitive {
            Primitive::Source => {
                if !spec.has_primitive(Primitive::Source) {
                    return Err(PlanError::new(format!(
                        "spec {} does not support primitive source",
                        request.name
                    )));
                }
                match &request.source_name {
                    Some(source_name) => Action::CreateSource {
                        spec: spec.clone(),
                        source_name: source_name.clone(),
                    },
                    None => {
                        let result = Action::CreateSources(spec.clone());
                        self.add(&result, &[])?;

                        for builder in spec.source_pkg_build().to_vec() {
                            if let Some(only) = &request.source_packages {
                                if !only.contains(&builder.name) {
                                    // excluded by the plan entry
                                    continue;
                                }
                            }
                            if !builder.managed {
                                // nothing to assemble locally
                                continue;
                            }
                            let mut sub_request = SpecRequest::new(
                                request.name.clone(),
                                request.env.clone(),
                                Primitive::Source,
                            );
                            sub_request.source_name = Some(builder.name.clone());
                            sub_request.plan_line = request.plan_line.clone();
                            sub_request.plan_args = request.plan_args.clone();
                            sub_request.upload = request.upload;
                            let sub_result = self.add_spec(sub_request)?;
                            self.connect(&result, &[&sub_result])?;
                        }
                        result
                    }
                }
            }
            Primitive::Build => Action::Build(spec.clone()),
            Primitive::Test => Action::Test(spec.clone()),
            Primitive::Install => Action::Install(spec.clone()),
        };
        let result_uid = result.uid();

        // Register the plan line even when the action was already added
        // through another dependency.
        if let (Some(line), Some(args)) = (&request.plan_line, &request.plan_args) {
            self.link_to_plan(&result_uid, line, args)?;
        }

        // An install of a spec with no binary package is really a build:
        // rewrite implicit requests, reject explicit ones.
        if request.primitive == Primitive::Install
            && !spec.has_package()
            && spec.has_primitive(Primitive::Build)
        {
            if let (Some(line), Some(_)) = (&request.plan_line, &request.plan_args) {
                return Err(PlanError::new(format!(
                    "error in plan at {}: install should be replaced by build - \
                     the spec {} has a build primitive but does not define a package",
                    line,
                    spec.name()
                )));
            }
            let mut rewritten = request;
            rewritten.primitive = Primitive::Build;
            rewritten.expand_build = false;
            return self.add_spec(rewritten);
        }

        // Building a packaged spec implies installing the package.
        if request.expand_build && request.primitive == Primitive::Build && spec.has_package() {
            let mut rewritten = request;
            rewritten.primitive = Primitive::Install;
            rewritten.plan_args = None;
            return self.add_spec(rewritten);
        }

        // Already expanded through another path.
        if self.tree.contains(&result_uid) {
            return Ok(result);
        }

        if !spec.has_primitive(request.primitive) {
            return Err(PlanError::new(format!(
                "spec {} does not support primitive {}",
                request.name, request.primitive
            )));
        }

        self.add(&result, &[])?;

        match request.primitive {
            Primitive::Install => {
                // install -> decision -> {build, download binary}
                let download_action = Action::DownloadBinary(spec.clone());
                self.add(&download_action, &[])?;

                if spec.has_primitive(Primitive::Build) {
                    let mut build_request = SpecRequest::new(
                        request.name.clone(),
                        request.env.clone(),
                        Primitive::Build,
                    );
                    build_request.qualifier = request.qualifier.clone();
                    build_request.expand_build = false;
                    build_request.plan_line = request.plan_line.clone();
                    build_request.upload = request.upload;
                    let build_action = self.add_spec(build_request)?;
                    self.add_decision(
                        DecisionKind::BuildOrDownload,
                        &result,
                        &build_action,
                        &download_action,
                    )?;
                } else {
                    self.connect(&result, &[&download_action])?;
                }
            }
            Primitive::Source => {
                if let Some(source_name) = &request.source_name {
                    if request.upload {
                        let upload = Action::UploadSource {
                            spec: spec.clone(),
                            source_name: source_name.clone(),
                        };
                        self.add(&upload, &[])?;
                        if let (Some(line), Some(args)) = (&request.plan_line, &request.plan_args)
                        {
                            self.link_to_plan(&upload.uid(), line, args)?;
                        }
                        self.connect(&Action::Root, &[&upload])?;
                        self.connect(&upload, &[&result])?;
                    }

                    let builders: Vec<SourceBuilder> = spec
                        .source_pkg_build()
                        .iter()
                        .filter(|b| &b.name == source_name)
                        .cloned()
                        .collect();
                    for builder in builders {
                        for repo_name in &builder.checkout {
                            let repo_data =
                                self.repo.repos.get(repo_name).cloned().ok_or_else(|| {
                                    PlanError::with_origin(
                                        format!("unknown repository {}", repo_name),
                                        "expand",
                                    )
                                })?;
                            let checkout = Action::Checkout {
                                repo_name: repo_name.clone(),
                                repo: repo_data,
                            };
                            self.add(&checkout, &[])?;
                            self.connect(&result, &[&checkout])?;
                        }
                    }
                }
            }
            Primitive::Build | Primitive::Test => {}
        }

        self.expand_dependencies(&spec, &result, &request)?;
        self.expand_source_list(&spec, &result, &request)?;

        Ok(result)
    }

    /// Walk the `<primitive>_deps` of a spec.
    fn expand_dependencies(
        &mut self,
        spec: &Rc<SpecInstance>,
        result: &Action,
        request: &SpecRequest,
    ) -> Result<()> {
        let deps: Vec<Dependency> = spec.deps(request.primitive).to_vec();

        for dep in &deps {
            let kind = dep.kind()?;

            if kind == Primitive::Source {
                // No action node: the dependency is loaded only to make
                // its source builders addressable.
                let child = self.load(&dep.name, None, None, Primitive::Source, None)?;
                self.add_dep(spec, dep, child)?;
                continue;
            }

            let mut child_request = SpecRequest::new(
                dep.name.clone(),
                dep.environment(spec, &self.default_env),
                kind,
            );
            child_request.qualifier = dep.qualifier.clone();
            child_request.plan_line = request.plan_line.clone();
            child_request.upload = request.upload;
            let child_action = self.add_spec(child_request)?;

            let child_instance = child_action.spec().cloned().ok_or_else(|| {
                PlanError::with_origin(
                    format!("dependency {} expanded to a spec-less action", dep.name),
                    "expand",
                )
            })?;
            self.add_dep(spec, dep, child_instance)?;

            if kind == Primitive::Build && matches!(child_action, Action::Install(_)) {
                // The build tree dependency resolved to an install
                // subtree (the target has a package): expect the user to
                // choose the build side.
                for pred in self.predecessors(&child_action) {
                    if let Action::Decision(decision) = &pred {
                        if decision.kind == DecisionKind::BuildOrDownload {
                            decision.add_trigger(
                                result,
                                Choice::Left,
                                request.plan_line.as_deref().unwrap_or("unknown line"),
                            );
                            break;
                        }
                    }
                }
            }

            self.connect(result, &[&child_action])?;
        }
        Ok(())
    }

    /// Walk the `<primitive>_source_list` of a spec, planning the
    /// installation and retrieval of each source.
    fn expand_source_list(
        &mut self,
        spec: &Rc<SpecInstance>,
        result: &Action,
        request: &SpecRequest,
    ) -> Result<()> {
        let source_list = spec.source_list(request.primitive).to_vec();
        if source_list.is_empty() {
            return Ok(());
        }

        let source_dep_names: HashSet<String> = spec
            .deps(request.primitive)
            .iter()
            .filter(|d| d.kind().ok() == Some(Primitive::Source))
            .map(|d| d.name.clone())
            .collect();

        let result_uid = result.uid();
        let uid_base = match result_uid.rfind('.') {
            Some(pos) => &result_uid[..pos],
            None => result_uid.as_str(),
        };

        for source in &source_list {
            if let Some((declaring_spec, builder)) = self.sources.get(&source.name) {
                // Advisory only: sources reachable without a source_pkg
                // dependency still resolve, but the spec author probably
                // forgot the declaration. Unmanaged sources are exempt.
                if declaring_spec != spec.name()
                    && !source_dep_names.contains(declaring_spec)
                    && builder.managed
                {
                    warn!(
                        "{} ({}): source {} coming from {} but there is no \
                         source_pkg dependency for {} in {}_deps",
                        spec.name(),
                        request.primitive,
                        source.name,
                        declaring_spec,
                        declaring_spec,
                        request.primitive
                    );
                }
            }

            let install_action = Action::InstallSource {
                uid: format!("{}.source_install.{}", uid_base, source.name),
                spec: spec.clone(),
                source: source.clone(),
            };
            self.add(&install_action, &[])?;
            self.connect(result, &[&install_action])?;

            let (declaring_spec, builder) = match self.sources.get(&source.name) {
                Some((declaring_spec, builder)) => (declaring_spec.clone(), builder.clone()),
                None => {
                    return Err(PlanError::with_origin(
                        format!(
                            "source {} does not exist (referenced by {})",
                            source.name, result_uid
                        ),
                        "expand",
                    ));
                }
            };

            let get_action = Action::GetSource(builder.clone());
            if self.tree.contains(&get_action.uid()) {
                self.connect(&install_action, &[&get_action])?;
                continue;
            }
            self.add(&get_action, &[])?;
            self.connect(&install_action, &[&get_action])?;

            let download_action = Action::DownloadSource(builder.clone());
            self.add(&download_action, &[])?;

            if !builder.managed {
                // Only the store can provide an unmanaged source.
                self.connect(&get_action, &[&download_action])?;
            } else {
                let mut source_request = SpecRequest::new(
                    declaring_spec,
                    self.default_env.clone(),
                    Primitive::Source,
                );
                source_request.source_name = Some(source.name.clone());
                source_request.plan_line = request.plan_line.clone();
                source_request.upload = request.upload;
                let source_action = self.add_spec(source_request)?;

                for repo_name in &builder.checkout {
                    let repo_data = self.repo.repos.get(repo_name).cloned().ok_or_else(|| {
                        PlanError::with_origin(
                            format!("unknown repository {}", repo_name),
                            "expand",
                        )
                    })?;
                    let checkout = Action::Checkout {
                        repo_name: repo_name.clone(),
                        repo: repo_data,
                    };
                    self.add(&checkout, &[])?;
                    self.connect(&source_action, &[&checkout])?;
                }
                self.add_decision(
                    DecisionKind::CreateSourceOrDownload,
                    &get_action,
                    &source_action,
                    &download_action,
                )?;
            }
        }
        Ok(())
    }

    /// Record a walked dependency on its parent, failing on local name
    /// clashes.
    fn add_dep(
        &mut self,
        parent: &Rc<SpecInstance>,
        dep: &Dependency,
        instance: Rc<SpecInstance>,
    ) -> Result<()> {
        let table = self.dependencies.entry(parent.uid.clone()).or_default();
        if table.contains_key(dep.local_name()) {
            return Err(PlanError::with_origin(
                format!(
                    "the spec {} has two dependencies with the same local_name \
                     attribute ({})",
                    parent.name(),
                    dep.local_name()
                ),
                "expand",
            ));
        }
        table.insert(dep.local_name().to_string(), (dep.clone(), instance));
        Ok(())
    }
}
