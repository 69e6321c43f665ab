//! Platform descriptions for plan entries and dependency remapping.

use std::ffi::CStr;

/// One platform slot (build, host or target) of an environment.
///
/// `platform` is the canonical platform string (e.g. `x86_64-linux`),
/// `machine` the name of the machine the slot refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    pub platform: String,
    pub machine: String,
}

impl Platform {
    pub fn new(platform: impl Into<String>, machine: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            machine: machine.into(),
        }
    }

    /// Platform of the machine the planner runs on.
    pub fn local() -> Self {
        Self {
            platform: format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS),
            machine: hostname(),
        }
    }
}

/// The (build, host, target) triple under which a spec instance is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlatformEnv {
    pub build: Platform,
    pub host: Platform,
    pub target: Platform,
}

impl PlatformEnv {
    /// Environment describing a native build on the local machine.
    pub fn local() -> Self {
        let p = Platform::local();
        Self {
            build: p.clone(),
            host: p.clone(),
            target: p,
        }
    }

    /// Force the build platform; host and target follow it.
    pub fn set_build(&mut self, platform: &str, machine: &str) {
        self.build = Platform::new(platform, machine);
        self.host = self.build.clone();
        self.target = self.build.clone();
    }

    /// Override individual slots by platform name. A `None` slot is kept
    /// unchanged; overridden slots keep the current machine name.
    pub fn set_env(&mut self, build: Option<&str>, host: Option<&str>, target: Option<&str>) {
        if let Some(name) = build {
            self.build = Platform::new(name, self.build.machine.clone());
        }
        if let Some(name) = host {
            self.host = Platform::new(name, self.host.machine.clone());
        }
        if let Some(name) = target {
            self.target = Platform::new(name, self.target.machine.clone());
        }
    }

    /// Platform label used in action uids: the target platform (equal to
    /// the build platform outside of cross compilation).
    pub fn platform(&self) -> &str {
        &self.target.platform
    }
}

/// Kernel release of the local host, used as the `os_version` fingerprint
/// element.
pub fn os_version() -> String {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return "unknown".to_string();
    }
    unsafe { CStr::from_ptr(uts.release.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Hostname of the local machine.
pub fn hostname() -> String {
    let mut buf = [0 as libc::c_char; 256];
    if unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len()) } != 0 {
        return "localhost".to_string();
    }
    // gethostname does not guarantee termination on truncation
    buf[buf.len() - 1] = 0;
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_env_is_native() {
        let env = PlatformEnv::local();
        assert_eq!(env.build, env.host);
        assert_eq!(env.host, env.target);
        assert!(!env.platform().is_empty());
    }

    #[test]
    fn test_set_build_propagates() {
        let mut env = PlatformEnv::local();
        env.set_build("x86_64-linux", "builder1");
        assert_eq!(env.build.machine, "builder1");
        assert_eq!(env.target.platform, "x86_64-linux");
        assert_eq!(env.platform(), "x86_64-linux");
    }

    #[test]
    fn test_set_env_partial_override() {
        let mut env = PlatformEnv::local();
        env.set_build("x86_64-linux", "builder1");
        env.set_env(None, None, Some("arm-elf"));
        assert_eq!(env.build.platform, "x86_64-linux");
        assert_eq!(env.target.platform, "arm-elf");
        assert_eq!(env.target.machine, "builder1");
    }

    #[test]
    fn test_os_version_not_empty() {
        assert!(!os_version().is_empty());
    }
}
