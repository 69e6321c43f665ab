//! End-to-end planning scenarios over a small literal spec repository.

use std::collections::HashSet;

use loftsman::spec::RepoData;
use loftsman::{
    always_create_source_resolver, always_download_source_resolver, decision_error, Action,
    ActionDag, PlanContext, PlanEntry, PlatformEnv, Primitive, Result, SpecManifest,
    SpecRepository,
};

fn repo_data(name: &str) -> RepoData {
    RepoData {
        vcs: "git".to_string(),
        url: format!("https://example.com/{}.git", name),
        revision: Some("master".to_string()),
    }
}

fn fixture_repository() -> SpecRepository {
    let specs = [
        // source-only spec: one managed source from one repository
        r#"
name = "spec1"

[[source_pkg_build]]
name = "spec1-src"
checkout = ["spec1-git"]
"#,
        // buildable spec consuming its own source
        r#"
name = "spec2"
primitives = ["build"]

[[build_source_list]]
name = "spec2-src"

[[source_pkg_build]]
name = "spec2-src"
checkout = ["spec2-git"]
"#,
        // build + install + binary package + component
        r#"
name = "spec3"
primitives = ["build", "install"]
package = true
component = "spec3"
"#,
        // component without a binary package: source component upload
        r#"
name = "spec5"
primitives = ["build"]
component = "spec5"
"#,
        // build only; install requests are rewritten to build
        r#"
name = "spec6"
primitives = ["build"]
"#,
        // no dependencies at all
        r#"
name = "spec7"
primitives = ["build"]
"#,
        // references a source nobody declares
        r#"
name = "spec8"
primitives = ["build"]

[[build_source_list]]
name = "ghost-src"
"#,
        // source dependency makes spec2's sources addressable
        r#"
name = "spec9"
primitives = ["build"]

[[build_deps]]
name = "spec2"
require = "source_pkg"

[[build_source_list]]
name = "spec2-src"
"#,
        // build tree dependency on a packaged spec
        r#"
name = "spec10"
primitives = ["build"]

[[build_deps]]
name = "spec3"
require = "build_tree"
"#,
        // installation dependency on a packaged spec
        r#"
name = "spec11"
primitives = ["build"]

[[build_deps]]
name = "spec3"
require = "installation"
"#,
        // mixes a managed and an unmanaged source
        r#"
name = "spec12"
primitives = ["build"]

[[build_deps]]
name = "spec1"
require = "source_pkg"

[[build_deps]]
name = "thirdparty"
require = "source_pkg"

[[build_source_list]]
name = "spec1-src"

[[build_source_list]]
name = "unmanaged-src"
"#,
        // install without a build primitive: plain binary download
        r#"
name = "spec13"
primitives = ["install"]
"#,
        // only an unmanaged (third party) source
        r#"
name = "thirdparty"

[[source_pkg_build]]
name = "unmanaged-src"
managed = false
"#,
        // managed source whose repository is not registered
        r#"
name = "spec14"

[[source_pkg_build]]
name = "spec14-src"
checkout = ["spec14-git"]
"#,
        // uses spec1's source without declaring a source_pkg dependency
        r#"
name = "spec15"
primitives = ["build"]

[[build_source_list]]
name = "spec1-src"
"#,
    ];

    let mut repo = SpecRepository::new();
    for spec in specs {
        repo.add_spec(SpecManifest::from_str(spec).unwrap());
    }
    repo.add_repo("spec1-git", repo_data("spec1"));
    repo.add_repo("spec2-git", repo_data("spec2"));
    repo
}

fn context() -> PlanContext {
    context_with(true)
}

fn context_with(reject_duplicates: bool) -> PlanContext {
    let mut env = PlatformEnv::local();
    env.set_build("x86-linux", "mylinux");
    PlanContext::new(fixture_repository(), Some(env), reject_duplicates)
}

fn vertex_set(dag: &ActionDag) -> HashSet<String> {
    dag.ids().cloned().collect()
}

fn refusing_resolver(
    action: &Action,
    decision: &loftsman::Decision,
) -> Result<bool> {
    Err(decision_error(action, decision))
}

#[test]
fn test_source_only_plan() {
    // one source entry: assemble, checkout and upload the source package
    let mut ctx = context();
    ctx.add_plan_entry(&PlanEntry::new("spec1", Primitive::Source))
        .unwrap();
    let result = ctx.schedule(&always_create_source_resolver).unwrap();
    assert_eq!(
        vertex_set(&result),
        [
            "root",
            "mylinux.x86-linux.spec1.source.spec1-src",
            "mylinux.x86-linux.spec1.source.sources",
            "checkout.spec1-git",
            "mylinux.x86-linux.spec1.upload_src.spec1-src",
        ]
        .into_iter()
        .map(String::from)
        .collect::<HashSet<_>>()
    );
}

#[test]
fn test_build_without_primitive_fails() {
    let mut ctx = context();
    let err = ctx
        .add_plan_entry(&PlanEntry::new("spec1", Primitive::Build))
        .unwrap_err();
    assert!(err
        .message
        .contains("spec spec1 does not support primitive build"));
}

#[test]
fn test_build_with_sources() {
    let mut ctx = context();
    ctx.add_plan_entry(&PlanEntry::new("spec2", Primitive::Build))
        .unwrap();
    assert_eq!(ctx.tree.len(), 9, "{}", ctx.tree.as_dot());

    let result = ctx.schedule(&always_download_source_resolver).unwrap();
    assert_eq!(
        vertex_set(&result),
        [
            "root",
            "mylinux.x86-linux.spec2.build",
            "source_get.spec2-src",
            "mylinux.x86-linux.spec2.source_install.spec2-src",
            "download.spec2-src",
        ]
        .into_iter()
        .map(String::from)
        .collect::<HashSet<_>>()
    );
}

#[test]
fn test_build_with_sources_created_from_checkout() {
    let mut ctx = context();
    ctx.add_plan_entry(&PlanEntry::new("spec2", Primitive::Build))
        .unwrap();
    let result = ctx.schedule(&always_create_source_resolver).unwrap();
    let keys = vertex_set(&result);
    assert!(keys.contains("mylinux.x86-linux.spec2.source.spec2-src"));
    assert!(keys.contains("checkout.spec2-git"));
    assert!(!keys.contains("download.spec2-src"));
}

#[test]
fn test_explicit_install_without_package_rejected() {
    let mut ctx = context();
    let err = ctx
        .add_plan_entry(
            &PlanEntry::new("spec2", Primitive::Install).with_plan_line("install_plan.txt:2"),
        )
        .unwrap_err();
    assert!(
        err.message.contains(
            "error in plan at install_plan.txt:2: install should be replaced by build"
        ),
        "{}",
        err.message
    );
}

#[test]
fn test_undecided_source_reported() {
    let mut ctx = context();
    ctx.add_plan_entry(&PlanEntry::new("spec2", Primitive::Build))
        .unwrap();
    let err = ctx.schedule(&refusing_resolver).unwrap_err();
    assert!(
        err.message
            .contains("cannot decide what to do for resolving source_get.spec2-src"),
        "{}",
        err.message
    );
}

#[test]
fn test_build_with_implicit_install() {
    // building a packaged spec schedules build, install and the upload
    let mut ctx = context();
    ctx.add_plan_entry(&PlanEntry::new("spec3", Primitive::Build))
        .unwrap();
    assert_eq!(ctx.tree.len(), 6, "{}", ctx.tree.as_dot());

    let result = ctx.schedule(&always_download_source_resolver).unwrap();
    assert_eq!(
        vertex_set(&result),
        [
            "root",
            "mylinux.x86-linux.spec3.build",
            "mylinux.x86-linux.spec3.install",
            "mylinux.x86-linux.spec3.upload_bin",
        ]
        .into_iter()
        .map(String::from)
        .collect::<HashSet<_>>()
    );
}

#[test]
fn test_install_only() {
    let mut ctx = context();
    ctx.add_plan_entry(&PlanEntry::new("spec3", Primitive::Install))
        .unwrap();
    let result = ctx.schedule(&always_download_source_resolver).unwrap();
    assert_eq!(
        vertex_set(&result),
        [
            "root",
            "mylinux.x86-linux.spec3.download_bin",
            "mylinux.x86-linux.spec3.install",
        ]
        .into_iter()
        .map(String::from)
        .collect::<HashSet<_>>()
    );
}

#[test]
fn test_test_primitive() {
    // spec3 does not declare test; use a dedicated manifest
    let mut repo = SpecRepository::new();
    repo.add_spec(
        SpecManifest::from_str(
            r#"
name = "spec4"
primitives = ["build", "install", "test"]
package = true
component = "spec4"
"#,
        )
        .unwrap(),
    );
    let mut env = PlatformEnv::local();
    env.set_build("x86-linux", "mylinux");
    let mut ctx = PlanContext::new(repo, Some(env), true);
    ctx.add_plan_entry(&PlanEntry::new("spec4", Primitive::Test))
        .unwrap();
    let result = ctx.schedule(&always_download_source_resolver).unwrap();
    assert_eq!(
        vertex_set(&result),
        ["root", "mylinux.x86-linux.spec4.test"]
            .into_iter()
            .map(String::from)
            .collect::<HashSet<_>>()
    );
}

#[test]
fn test_source_component_upload() {
    // component without binary package publishes source metadata
    let mut ctx = context();
    ctx.add_plan_entry(&PlanEntry::new("spec5", Primitive::Build))
        .unwrap();
    let result = ctx.schedule(&always_download_source_resolver).unwrap();
    assert_eq!(
        vertex_set(&result),
        [
            "root",
            "mylinux.x86-linux.spec5.build",
            "mylinux.x86-linux.spec5.upload_bin",
        ]
        .into_iter()
        .map(String::from)
        .collect::<HashSet<_>>()
    );
}

#[test]
fn test_install_rewritten_to_build() {
    let mut ctx = context();
    ctx.add_plan_entry(&PlanEntry::new("spec6", Primitive::Install))
        .unwrap();
    // a second entry with a different qualifier lands in the same build
    // space and merges
    ctx.add_plan_entry(
        &PlanEntry::new("spec6", Primitive::Install).with_qualifier("myqualif"),
    )
    .unwrap();
    assert_eq!(ctx.tree.len(), 2);

    let result = ctx.schedule(&always_download_source_resolver).unwrap();
    assert_eq!(
        vertex_set(&result),
        ["root", "mylinux.x86-linux.spec6.build"]
            .into_iter()
            .map(String::from)
            .collect::<HashSet<_>>()
    );
}

#[test]
fn test_no_deps_spec() {
    let mut ctx = context();
    ctx.add_plan_entry(&PlanEntry::new("spec7", Primitive::Build))
        .unwrap();
    let result = ctx.schedule(&always_download_source_resolver).unwrap();
    assert_eq!(result.len(), 2);
}

#[test]
fn test_unknown_source_fails_expansion() {
    let mut ctx = context();
    let err = ctx
        .add_plan_entry(&PlanEntry::new("spec8", Primitive::Build))
        .unwrap_err();
    assert!(
        err.message.contains("source ghost-src does not exist"),
        "{}",
        err.message
    );
}

#[test]
fn test_source_dependency_exposes_sources() {
    let mut ctx = context();
    ctx.add_plan_entry(&PlanEntry::new("spec9", Primitive::Build))
        .unwrap();
    let result = ctx.schedule(&always_download_source_resolver).unwrap();
    assert!(vertex_set(&result).contains("download.spec2-src"));
}

#[test]
fn test_conflicting_build_and_install_entries() {
    let mut ctx = context();
    ctx.add_plan_entry(
        &PlanEntry::new("spec3", Primitive::Install).with_plan_line("myplan:1"),
    )
    .unwrap();
    ctx.add_plan_entry(&PlanEntry::new("spec3", Primitive::Build).with_plan_line("myplan:2"))
        .unwrap();
    assert!(ctx.schedule(&always_download_source_resolver).is_err());
}

#[test]
fn test_build_tree_dependency_requires_explicit_build() {
    let mut ctx = context();
    ctx.add_plan_entry(&PlanEntry::new("spec10", Primitive::Build).with_plan_line("myplan:1"))
        .unwrap();

    // the build_tree dependency on spec3 needs an explicit plan entry
    let err = ctx.schedule(&always_download_source_resolver).unwrap_err();
    assert!(
        err.message.contains("has a build_tree dependency on spec3"),
        "{}",
        err.message
    );
    assert!(
        err.message
            .contains(r#"build("spec3", build="x86-linux")"#),
        "{}",
        err.message
    );
}

#[test]
fn test_build_tree_dependency_conflicts_with_install_entry() {
    let mut ctx = context();
    ctx.add_plan_entry(&PlanEntry::new("spec10", Primitive::Build).with_plan_line("myplan:1"))
        .unwrap();
    ctx.add_plan_entry(
        &PlanEntry::new("spec3", Primitive::Install).with_plan_line("myplan:2"),
    )
    .unwrap();

    let err = ctx.schedule(&always_download_source_resolver).unwrap_err();
    assert!(
        err.message.contains("explicit DownloadBinary decision"),
        "{}",
        err.message
    );
    assert!(err.message.contains("myplan:2"), "{}", err.message);
    assert!(err.message.contains("myplan:1"), "{}", err.message);
}

#[test]
fn test_installation_dependency_suggests_both_fixes() {
    let mut ctx = context();
    ctx.add_plan_entry(&PlanEntry::new("spec11", Primitive::Build).with_plan_line("myplan:1"))
        .unwrap();

    let err = ctx.schedule(&always_download_source_resolver).unwrap_err();
    assert!(
        err.message.contains(
            r#"Please either add build("spec3", build="x86-linux") or install("spec3", build="x86-linux") in the plan"#
        ),
        "{}",
        err.message
    );
    assert!(err.uid.is_some());
    assert!(err
        .initiators
        .contains(&"mylinux.x86-linux.spec11.build".to_string()));

    // adding the install entry settles the decision
    ctx.add_plan_entry(
        &PlanEntry::new("spec3", Primitive::Install).with_plan_line("myplan:2"),
    )
    .unwrap();
    let result = ctx.schedule(&always_download_source_resolver).unwrap();
    assert!(vertex_set(&result).contains("mylinux.x86-linux.spec3.download_bin"));
}

#[test]
fn test_unmanaged_source_is_download_only() {
    let mut ctx = context();
    ctx.add_plan_entry(&PlanEntry::new("spec12", Primitive::Build))
        .unwrap();
    let result = ctx.schedule(&always_download_source_resolver).unwrap();
    let keys = vertex_set(&result);
    assert!(keys.contains("download.spec1-src"));
    assert!(keys.contains("download.unmanaged-src"));
}

#[test]
fn test_unmanaged_source_has_no_create_action() {
    let mut ctx = context();
    ctx.add_plan_entry(&PlanEntry::new("thirdparty", Primitive::Source))
        .unwrap();
    let result = ctx.schedule(&always_download_source_resolver).unwrap();
    // only the aggregate remains; nothing is assembled locally
    assert_eq!(result.len(), 2, "{}", result.as_dot());
}

#[test]
fn test_install_without_build_primitive() {
    let mut ctx = context();
    ctx.add_plan_entry(&PlanEntry::new("spec13", Primitive::Install))
        .unwrap();
    let result = ctx.schedule(&always_download_source_resolver).unwrap();
    assert_eq!(
        vertex_set(&result),
        [
            "root",
            "mylinux.x86-linux.spec13.download_bin",
            "mylinux.x86-linux.spec13.install",
        ]
        .into_iter()
        .map(String::from)
        .collect::<HashSet<_>>()
    );
}

#[test]
fn test_undeclared_source_spec_is_advisory_only() {
    // warns, but the plan still expands and schedules
    tracing_subscriber::fmt()
        .with_env_filter("loftsman=debug")
        .try_init()
        .ok();

    let mut ctx = context();
    ctx.add_plan_entry(&PlanEntry::new("spec1", Primitive::Source))
        .unwrap();
    ctx.add_plan_entry(&PlanEntry::new("spec15", Primitive::Build))
        .unwrap();
    let result = ctx.schedule(&always_download_source_resolver).unwrap();
    assert!(vertex_set(&result).contains("download.spec1-src"));
}

#[test]
fn test_unknown_repository_fails_expansion() {
    let mut ctx = context();
    let err = ctx
        .add_plan_entry(&PlanEntry::new("spec14", Primitive::Source))
        .unwrap_err();
    assert!(
        err.message.contains("unknown repository spec14-git"),
        "{}",
        err.message
    );
}

#[test]
fn test_duplicate_build_space_rejected() {
    let mut ctx = context_with(true);
    ctx.add_plan_entry(&PlanEntry::new("spec3", Primitive::Build).with_plan_line("plan.txt:1"))
        .unwrap();
    let err = ctx
        .add_plan_entry(
            &PlanEntry::new("spec3", Primitive::Build).with_plan_line("plan.txt:3"),
        )
        .unwrap_err();
    assert!(
        err.message
            .contains("conflict because they result in the same build space"),
        "{}",
        err.message
    );
    assert!(err.message.contains("plan.txt:1"));
    assert!(err.message.contains("plan.txt:3"));
}

#[test]
fn test_duplicate_build_space_allowed_when_not_rejecting() {
    let mut ctx = context_with(false);
    ctx.add_plan_entry(&PlanEntry::new("spec3", Primitive::Build).with_plan_line("plan.txt:1"))
        .unwrap();
    ctx.add_plan_entry(&PlanEntry::new("spec3", Primitive::Build).with_plan_line("plan.txt:3"))
        .unwrap();
}

#[test]
fn test_execution_dag_invariants() {
    // no decisions, subset of expansion, acyclic, root-connected
    let mut ctx = context();
    ctx.add_plan_entry(&PlanEntry::new("spec9", Primitive::Build))
        .unwrap();
    ctx.add_plan_entry(&PlanEntry::new("spec3", Primitive::Build))
        .unwrap();
    let result = ctx.schedule(&always_download_source_resolver).unwrap();

    result.check().unwrap();
    for (uid, action) in result.iter() {
        assert!(
            !matches!(action, Action::Decision(_)),
            "decision {} left in execution DAG",
            uid
        );
        assert!(ctx.tree.contains(uid), "{} not in expansion DAG", uid);
    }

    let reachable = result.get_closure("root");
    for uid in result.ids() {
        if uid != "root" {
            assert!(reachable.contains(uid), "{} unreachable from root", uid);
        }
    }
}

#[test]
fn test_plan_tags_survive_scheduling() {
    let mut ctx = context();
    ctx.add_plan_entry(&PlanEntry::new("spec3", Primitive::Build).with_plan_line("myplan:1"))
        .unwrap();
    let result = ctx.schedule(&always_download_source_resolver).unwrap();
    let tag = result
        .get_tag("mylinux.x86-linux.spec3.build")
        .expect("tagged vertex lost its tag");
    assert_eq!(tag.plan_line, "myplan:1");
}

#[test]
fn test_repository_loaded_from_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("spec1.toml"),
        r#"
name = "spec1"

[[source_pkg_build]]
name = "spec1-src"
checkout = ["spec1-git"]
"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("repositories.toml"),
        r#"
[repositories.spec1-git]
vcs = "git"
url = "https://example.com/spec1.git"
revision = "master"
"#,
    )
    .unwrap();

    let repo = SpecRepository::from_dir(dir.path()).unwrap();
    let mut env = PlatformEnv::local();
    env.set_build("x86-linux", "mylinux");
    let mut ctx = PlanContext::new(repo, Some(env), true);
    ctx.add_plan_entry(&PlanEntry::new("spec1", Primitive::Source))
        .unwrap();
    let result = ctx.schedule(&always_create_source_resolver).unwrap();
    assert!(vertex_set(&result).contains("checkout.spec1-git"));
}
