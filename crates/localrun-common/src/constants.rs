// Well-known names, paths and platform detection shared by every crate.

use std::fmt;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Operating system platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsPlatform {
    Linux,
    MacOS,
    Windows,
}

impl fmt::Display for OsPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label_name())
    }
}

impl OsPlatform {
    /// Name used for `RUNNER_OS`, matching hosted runners.
    pub fn label_name(&self) -> &'static str {
        match self {
            OsPlatform::Linux => "Linux",
            OsPlatform::MacOS => "macOS",
            OsPlatform::Windows => "Windows",
        }
    }
}

/// CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    X86,
    X64,
    Arm,
    Arm64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label_name())
    }
}

impl Architecture {
    /// Name used for `RUNNER_ARCH`, matching hosted runners.
    pub fn label_name(&self) -> &'static str {
        match self {
            Architecture::X86 => "X86",
            Architecture::X64 => "X64",
            Architecture::Arm => "ARM",
            Architecture::Arm64 => "ARM64",
        }
    }
}

// ---------------------------------------------------------------------------
// Platform detection (compile-time)
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Linux;
#[cfg(target_os = "macos")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::MacOS;
#[cfg(target_os = "windows")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Windows;
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Linux;

#[cfg(target_arch = "x86")]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::X86;
#[cfg(target_arch = "x86_64")]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::X64;
#[cfg(target_arch = "arm")]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::Arm;
#[cfg(target_arch = "aarch64")]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::Arm64;
#[cfg(not(any(
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "arm",
    target_arch = "aarch64"
)))]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::X64;

// ---------------------------------------------------------------------------
// Top-level constants
// ---------------------------------------------------------------------------

#[cfg(target_os = "windows")]
pub const PATH_VARIABLE: &str = "Path";
#[cfg(not(target_os = "windows"))]
pub const PATH_VARIABLE: &str = "PATH";

/// Variable always set to `"true"` so steps can detect a local run.
pub const LOCAL_RUN_MARKER: &str = "ACT";

/// Pseudo-image that selects host-process execution instead of a container.
pub const SELF_HOSTED_IMAGE: &str = "-self-hosted";

/// Prefix of every job container and volume name.
pub const CONTAINER_NAME_PREFIX: &str = "act";

/// Maximum nesting of composite actions.
pub const COMPOSITE_ACTIONS_MAX_DEPTH: usize = 9;

/// Container paths and volumes.
pub mod container {
    /// Default host path of the container daemon control socket.
    pub const DEFAULT_DAEMON_SOCKET: &str = "/var/run/docker.sock";
    /// Where the daemon socket is mounted inside the job container.
    pub const DAEMON_SOCKET_TARGET: &str = "/var/run/docker.sock";
    /// Default scratch directory inside the sandbox.
    pub const DEFAULT_ACT_PATH: &str = "/var/run/act";
    /// Shared tool-cache volume and its mount point.
    pub const TOOLCACHE_VOLUME: &str = "act-toolcache";
    pub const TOOLCACHE_PATH: &str = "/toolcache";
    /// Keeps the job container alive between execs.
    pub const KEEPALIVE_ENTRYPOINT: [&str; 3] = ["/usr/bin/tail", "-f", "/dev/null"];
    pub const NETWORK_MODE: &str = "host";
    /// File read to seed the job environment after start.
    pub const ETC_ENVIRONMENT: &str = "/etc/environment";
}

/// Files exchanged between step processes and the orchestrator, relative to
/// the scratch directory.
pub mod file_commands {
    pub const EVENT: &str = "workflow/event.json";
    pub const ENV: &str = "workflow/envs.txt";
    pub const PATH: &str = "workflow/paths.txt";
    pub const OUTPUT: &str = "workflow/outputcmd.txt";
    pub const STATE: &str = "workflow/statecmd.txt";
}

/// Environment variable names.
pub mod variables {
    pub const CI: &str = "CI";
    pub const GITHUB_OUTPUT: &str = "GITHUB_OUTPUT";
    pub const GITHUB_STATE: &str = "GITHUB_STATE";
    pub const GITHUB_ENV: &str = "GITHUB_ENV";
    pub const GITHUB_PATH: &str = "GITHUB_PATH";
    pub const RUNNER_TOOL_CACHE: &str = "RUNNER_TOOL_CACHE";
    pub const RUNNER_OS: &str = "RUNNER_OS";
    pub const RUNNER_ARCH: &str = "RUNNER_ARCH";
    pub const RUNNER_TEMP: &str = "RUNNER_TEMP";
    pub const RUNNER_PERFLOG: &str = "RUNNER_PERFLOG";
    pub const RUNNER_TRACKING_ID: &str = "RUNNER_TRACKING_ID";
    pub const ACTIONS_RUNTIME_URL: &str = "ACTIONS_RUNTIME_URL";
    pub const ACTIONS_RUNTIME_TOKEN: &str = "ACTIONS_RUNTIME_TOKEN";
    pub const IMAGE_OS: &str = "ImageOS";

    /// Secrets used as registry credentials when the job container declares none.
    pub const DOCKER_USERNAME: &str = "DOCKER_USERNAME";
    pub const DOCKER_PASSWORD: &str = "DOCKER_PASSWORD";
    pub const GITHUB_TOKEN: &str = "GITHUB_TOKEN";
}

/// Defaults applied to the provider context when nothing else supplies them.
pub mod defaults {
    pub const RUN_ID: &str = "1";
    pub const RUN_NUMBER: &str = "1";
    pub const RUN_ATTEMPT: &str = "1";
    pub const RETENTION_DAYS: &str = "0";
    pub const RUNNER_PERFLOG: &str = "/dev/null";
    pub const ACTOR: &str = "nektos/act";
    pub const GITHUB_INSTANCE: &str = "github.com";
    pub const DEFAULT_BRANCH: &str = "main";
    pub const ARTIFACT_SERVER_PORT: &str = "34567";
    pub const ARTIFACT_RUNTIME_TOKEN: &str = "token";

    /// Environment seeded into every job container at creation.
    pub const CONTAINER_TOOL_CACHE: &str = "/opt/hostedtoolcache";
    pub const CONTAINER_OS: &str = "Linux";
    pub const CONTAINER_TEMP: &str = "/tmp";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_labels() {
        assert_eq!(OsPlatform::MacOS.to_string(), "macOS");
        assert_eq!(Architecture::Arm64.label_name(), "ARM64");
        assert!(!CURRENT_PLATFORM.label_name().is_empty());
    }

    #[test]
    fn test_file_commands_live_under_workflow() {
        for name in [
            file_commands::EVENT,
            file_commands::ENV,
            file_commands::PATH,
            file_commands::OUTPUT,
            file_commands::STATE,
        ] {
            assert!(name.starts_with("workflow/"));
        }
    }
}
