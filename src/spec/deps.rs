//! Dependency declarations between specs.

use serde::Deserialize;

use crate::error::{PlanError, Result};
use crate::platform::PlatformEnv;

use super::{Primitive, SpecInstance};

/// A dependency of one spec on another, as declared in a manifest's
/// `build_deps` / `install_deps` / `test_deps` / `source_deps` tables.
#[derive(Debug, Clone, Deserialize)]
pub struct Dependency {
    /// Name of the spec depended upon.
    pub name: String,
    /// Key under which the loaded dependency is exposed on the parent.
    /// Defaults to `name`; must be unique within one spec instance.
    #[serde(default)]
    pub local_name: Option<String>,
    /// `build_tree` (a local build is required), `installation` (the
    /// installed result is enough) or `source_pkg` (only the dependency's
    /// source builders are needed).
    #[serde(default = "default_require")]
    pub require: String,
    #[serde(default)]
    pub qualifier: Option<String>,
    /// Platform remapping hints. The value `"default"` maps the slot to
    /// the context's default build platform.
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    /// Track the dependency's source metadata in the local metadata.
    #[serde(default)]
    pub track: bool,
}

fn default_require() -> String {
    "build_tree".to_string()
}

impl Dependency {
    pub fn local_name(&self) -> &str {
        self.local_name.as_deref().unwrap_or(&self.name)
    }

    /// Primitive used when loading the dependency.
    pub fn kind(&self) -> Result<Primitive> {
        match self.require.as_str() {
            "build_tree" => Ok(Primitive::Build),
            "installation" => Ok(Primitive::Install),
            "source_pkg" => Ok(Primitive::Source),
            other => Err(PlanError::with_origin(
                format!(
                    "require should be build_tree, installation or source_pkg not {}",
                    other
                ),
                "spec.dependency",
            )),
        }
    }

    /// Environment the dependency should be loaded with: the parent's
    /// environment with the declared slots remapped.
    pub fn environment(&self, parent: &SpecInstance, default_env: &PlatformEnv) -> PlatformEnv {
        let remap = |hint: &Option<String>| -> Option<String> {
            hint.as_ref().map(|name| {
                if name == "default" {
                    default_env.build.platform.clone()
                } else {
                    name.clone()
                }
            })
        };

        let mut env = parent.env.clone();
        env.set_env(
            remap(&self.build).as_deref(),
            remap(&self.host).as_deref(),
            remap(&self.target).as_deref(),
        );
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::SpecManifest;
    use std::rc::Rc;

    fn parent() -> SpecInstance {
        let manifest = SpecManifest::from_str(
            r#"
name = "parent"
primitives = ["build"]
"#,
        )
        .unwrap();
        let mut env = PlatformEnv::local();
        env.set_build("x86-linux", "node1");
        SpecInstance::new(Rc::new(manifest), Primitive::Build, None, env, None, None)
    }

    #[test]
    fn test_kind_mapping() {
        let dep: Dependency = toml::from_str(r#"name = "child""#).unwrap();
        assert_eq!(dep.kind().unwrap(), Primitive::Build);
        assert_eq!(dep.local_name(), "child");

        let dep: Dependency =
            toml::from_str(r#"name = "child"
require = "installation""#).unwrap();
        assert_eq!(dep.kind().unwrap(), Primitive::Install);

        let dep: Dependency =
            toml::from_str(r#"name = "child"
require = "source_pkg""#).unwrap();
        assert_eq!(dep.kind().unwrap(), Primitive::Source);

        let dep: Dependency =
            toml::from_str(r#"name = "child"
require = "sideways""#).unwrap();
        assert!(dep.kind().is_err());
    }

    #[test]
    fn test_environment_remap() {
        let parent = parent();
        let mut default_env = PlatformEnv::local();
        default_env.set_build("x86_64-linux", "host0");

        let dep: Dependency = toml::from_str(
            r#"
name = "child"
build = "default"
target = "arm-elf"
"#,
        )
        .unwrap();
        let env = dep.environment(&parent, &default_env);
        assert_eq!(env.build.platform, "x86_64-linux");
        assert_eq!(env.host.platform, "x86-linux");
        assert_eq!(env.target.platform, "arm-elf");
    }

    #[test]
    fn test_environment_no_hints_inherits_parent() {
        let parent = parent();
        let default_env = PlatformEnv::local();
        let dep: Dependency = toml::from_str(r#"name = "child""#).unwrap();
        let env = dep.environment(&parent, &default_env);
        assert_eq!(env, parent.env);
    }
}
