// Runner configuration: every knob the job engine reads, loaded once and
// shared read-only as `Arc<Config>` for the lifetime of a run.

use crate::constants::defaults;
use anyhow::{Context, Result};
use localrun_sdk::IOUtil;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Settings for one invocation of the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Host path of the repository being run.
    pub workdir: PathBuf,
    /// Bind-mount `workdir` into the container instead of copying it.
    pub bind_workdir: bool,
    /// Name of the triggering event (`push`, `pull_request`, ...).
    pub event_name: String,
    /// Path of the event payload file, if one was supplied.
    pub event_path: Option<PathBuf>,
    pub default_branch: String,
    pub reuse_containers: bool,
    pub force_pull: bool,
    pub force_remote_checkout: bool,
    /// Log raw step output at info level instead of debug.
    pub log_output: bool,
    pub env: HashMap<String, String>,
    pub secrets: HashMap<String, String>,
    /// Runner label → image. Keys are lower-case after `normalize`.
    pub platforms: HashMap<String, String>,
    pub privileged: bool,
    pub userns_mode: String,
    pub container_architecture: String,
    pub container_daemon_socket: String,
    pub use_gitignore: bool,
    pub github_instance: String,
    pub github_server_url: String,
    pub github_api_server_url: String,
    pub github_graphql_api_server_url: String,
    pub auto_remove: bool,
    pub artifact_server_path: String,
    pub artifact_server_port: String,
    pub container_cap_add: Vec<String>,
    pub container_cap_drop: Vec<String>,
    pub actor: String,
    /// Allocate a terminal for container processes. Decided once by the caller.
    pub allocate_terminal: bool,
    /// Root for host-mode scratch directories. Defaults to the user cache dir.
    pub action_cache_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            bind_workdir: false,
            event_name: String::new(),
            event_path: None,
            default_branch: defaults::DEFAULT_BRANCH.to_string(),
            reuse_containers: false,
            force_pull: false,
            force_remote_checkout: false,
            log_output: false,
            env: HashMap::new(),
            secrets: HashMap::new(),
            platforms: HashMap::new(),
            privileged: false,
            userns_mode: String::new(),
            container_architecture: String::new(),
            container_daemon_socket: String::new(),
            use_gitignore: true,
            github_instance: defaults::GITHUB_INSTANCE.to_string(),
            github_server_url: String::new(),
            github_api_server_url: String::new(),
            github_graphql_api_server_url: String::new(),
            auto_remove: false,
            artifact_server_path: String::new(),
            artifact_server_port: defaults::ARTIFACT_SERVER_PORT.to_string(),
            container_cap_add: Vec::new(),
            container_cap_drop: Vec::new(),
            actor: String::new(),
            allocate_terminal: false,
            action_cache_dir: None,
        }
    }
}

impl Config {
    /// Load a configuration file. `.yml`/`.yaml` files are parsed as YAML,
    /// anything else as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yml") | Some("yaml")
        );
        let config: Config = if is_yaml {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config '{}'", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config '{}'", path.display()))?
        };

        tracing::debug!("Loaded config from {}", path.display());
        Ok(config.normalize())
    }

    /// Lower-case platform labels so lookups are case-insensitive.
    pub fn normalize(mut self) -> Self {
        self.platforms = self
            .platforms
            .into_iter()
            .map(|(label, image)| (label.to_lowercase(), image))
            .collect();
        self
    }

    /// Add a `label=image` platform mapping.
    pub fn add_platform(&mut self, label: &str, image: &str) {
        self.platforms.insert(label.to_lowercase(), image.to_string());
    }

    /// The daemon socket to bind into job containers.
    pub fn daemon_socket(&self) -> &str {
        if self.container_daemon_socket.is_empty() {
            crate::constants::container::DEFAULT_DAEMON_SOCKET
        } else {
            &self.container_daemon_socket
        }
    }

    /// The working directory as seen from inside a container.
    ///
    /// Windows drive paths are translated to the `/mnt/<drive>/...` form.
    pub fn container_workdir(&self) -> String {
        let raw = self.workdir.to_string_lossy().to_string();
        let mut chars = raw.chars();
        match (chars.next(), chars.next()) {
            (Some(drive), Some(':')) if drive.is_ascii_alphabetic() => {
                let rest = raw[2..].replace('\\', "/");
                format!(
                    "/mnt/{}/{}",
                    drive.to_ascii_lowercase(),
                    rest.trim_start_matches('/')
                )
            }
            _ => raw,
        }
    }

    /// Directory holding host-mode scratch trees.
    pub fn action_cache_dir(&self) -> PathBuf {
        match self.action_cache_dir {
            Some(ref dir) => dir.clone(),
            None => IOUtil::user_cache_dir().join("act"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.github_instance, "github.com");
        assert_eq!(config.default_branch, "main");
        assert_eq!(config.artifact_server_port, "34567");
        assert_eq!(config.daemon_socket(), "/var/run/docker.sock");
    }

    #[test]
    fn test_load_yaml_lowercases_platforms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(
            &path,
            "platforms:\n  Ubuntu-Latest: node:16-buster-slim\nbind-workdir: true\nenv:\n  A: \"1\"\n",
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.platforms.get("ubuntu-latest").map(String::as_str),
            Some("node:16-buster-slim")
        );
        assert!(config.bind_workdir);
        assert_eq!(config.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(config.github_instance, "github.com");
    }

    #[test]
    fn test_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"reuse-containers": true, "actor": "me"}"#).unwrap();
        let config = Config::load(&path).unwrap();
        assert!(config.reuse_containers);
        assert_eq!(config.actor, "me");
    }

    #[test]
    fn test_load_invalid_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_container_workdir() {
        let mut config = Config::default();
        config.workdir = PathBuf::from("/home/me/repo");
        assert_eq!(config.container_workdir(), "/home/me/repo");
        config.workdir = PathBuf::from(r"C:\Users\me\repo");
        assert_eq!(config.container_workdir(), "/mnt/c/Users/me/repo");
    }
}
