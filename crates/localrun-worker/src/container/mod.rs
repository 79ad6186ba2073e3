// Container lifecycle contract.
//
// A `Container` is the sandbox a job's steps run in. The orchestrator drives
// it through Pull → Create → Start → seed env → Exec/Copy → Remove → Close,
// wrapping each call in a pipeline unit. Drivers report failures untouched;
// recovery decisions (such as treating a missing volume as removed) belong
// to the caller.

pub mod archive;
pub mod docker_command_manager;
pub mod host_container;
#[cfg(test)]
pub mod testing;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use localrun_common::constants::{variables, PATH_VARIABLE};
use localrun_sdk::{ExecContext, ProcessInvoker, TraceWriter};

use crate::file_command_manager::FileCommandManager;

pub use docker_command_manager::DockerDriver;
pub use host_container::HostContainer;

/// Failures a driver reports in a form the orchestrator can inspect.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("'{command}' failed with exit code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("container I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Whether `err` is, or wraps, a `NotFound`.
    pub fn is_not_found(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<ContainerError>(),
                Some(ContainerError::NotFound { .. })
            )
        })
    }
}

/// A file to place inside the sandbox, relative to a destination directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub mode: u32,
    pub body: String,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, mode: u32, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode,
            body: body.into(),
        }
    }
}

/// Everything needed to create a job container.
#[derive(Clone, Default)]
pub struct NewContainerInput {
    pub image: String,
    pub username: String,
    pub password: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub working_dir: String,
    /// `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// `host:container[:mode]` bind specs.
    pub binds: Vec<String>,
    /// Named volume → mount point.
    pub mounts: HashMap<String, String>,
    pub name: String,
    pub network_mode: String,
    pub privileged: bool,
    pub userns_mode: String,
    pub platform: String,
    pub hostname: String,
    pub allocate_terminal: bool,
    /// Receives process output.
    pub output: Option<Arc<dyn TraceWriter>>,
}

impl std::fmt::Debug for NewContainerInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewContainerInput")
            .field("image", &self.image)
            .field("name", &self.name)
            .field("working_dir", &self.working_dir)
            .field("binds", &self.binds)
            .field("mounts", &self.mounts)
            .field("network_mode", &self.network_mode)
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

/// A sandbox steps execute in.
#[async_trait]
pub trait Container: Send + Sync {
    async fn pull(&self, ctx: &ExecContext, force_pull: bool) -> Result<()>;

    async fn create(&self, ctx: &ExecContext, cap_add: &[String], cap_drop: &[String])
        -> Result<()>;

    async fn start(&self, ctx: &ExecContext, attach: bool) -> Result<()>;

    /// Add the image's configured environment for keys `env` does not set yet.
    async fn update_from_image_env(
        &self,
        ctx: &ExecContext,
        env: &mut HashMap<String, String>,
    ) -> Result<()>;

    async fn exec(
        &self,
        ctx: &ExecContext,
        command: &[String],
        env: &HashMap<String, String>,
        user: &str,
        workdir: &str,
    ) -> Result<()>;

    async fn copy(&self, ctx: &ExecContext, dest_path: &str, files: &[FileEntry]) -> Result<()>;

    async fn copy_dir(
        &self,
        ctx: &ExecContext,
        dest_path: &str,
        src_path: &Path,
        use_gitignore: bool,
    ) -> Result<()>;

    /// A tar archive of the file or directory at `src_path`.
    /// A missing path is `ContainerError::NotFound`.
    async fn get_container_archive(&self, ctx: &ExecContext, src_path: &str) -> Result<Vec<u8>>;

    async fn remove(&self, ctx: &ExecContext) -> Result<()>;

    async fn close(&self, ctx: &ExecContext) -> Result<()>;

    /// Merge the key/value file at `src_path` into `env`. A missing file
    /// contributes nothing.
    async fn update_from_env(
        &self,
        ctx: &ExecContext,
        src_path: &str,
        env: &mut HashMap<String, String>,
    ) -> Result<()> {
        let content = match self.get_container_archive(ctx, src_path).await {
            Ok(tar) => archive::read_first_file(&tar)?,
            Err(e) if ContainerError::is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e),
        };
        env.extend(FileCommandManager::parse_key_values(&content));
        Ok(())
    }

    /// Prepend every entry of the file named by `GITHUB_PATH` to `PATH`.
    async fn update_from_path(&self, ctx: &ExecContext, env: &mut HashMap<String, String>) -> Result<()> {
        let Some(path_file) = env.get(variables::GITHUB_PATH).cloned() else {
            return Ok(());
        };
        let content = match self.get_container_archive(ctx, &path_file).await {
            Ok(tar) => archive::read_first_file(&tar)?,
            Err(e) if ContainerError::is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in FileCommandManager::parse_paths(&content) {
            let joined = match env.get(PATH_VARIABLE) {
                Some(existing) if !existing.is_empty() => format!("{entry}:{existing}"),
                _ => entry,
            };
            env.insert(PATH_VARIABLE.to_string(), joined);
        }
        Ok(())
    }
}

/// Creates containers and manages the volumes they share.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    fn new_container(&self, input: NewContainerInput) -> Arc<dyn Container>;

    /// Remove a named volume. A volume that does not exist is
    /// `ContainerError::NotFound`.
    async fn remove_volume(&self, ctx: &ExecContext, name: &str, force: bool) -> Result<()>;
}

struct ProcessTraceWriter;

impl TraceWriter for ProcessTraceWriter {
    fn info(&self, message: &str) {
        tracing::info!(target: "process", "{}", message);
    }

    fn verbose(&self, message: &str) {
        tracing::debug!(target: "process", "{}", message);
    }
}

/// Run a process to completion, forwarding stdout and stderr line by line to
/// `output`. A non-zero exit is an error.
pub(crate) async fn run_streamed(
    file_name: &str,
    arguments: &[String],
    working_directory: &str,
    environment: Option<&HashMap<String, String>>,
    output: Arc<dyn TraceWriter>,
    ctx: &ExecContext,
) -> Result<()> {
    let mut invoker = ProcessInvoker::new(Arc::new(ProcessTraceWriter));

    let mut forwards = Vec::new();
    for mut rx in [invoker.take_stdout_receiver(), invoker.take_stderr_receiver()]
        .into_iter()
        .flatten()
    {
        let output = output.clone();
        forwards.push(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                output.info(&event.data);
            }
        }));
    }

    let result = invoker
        .execute(
            working_directory,
            file_name,
            arguments,
            environment,
            true,
            false,
            ctx.cancel_token(),
        )
        .await;

    // The forwarders finish once the invoker's senders are gone.
    drop(invoker);
    for forward in forwards {
        let _ = forward.await;
    }
    result.map(|_| ())
}

/// `KEY=VALUE` list from a map, sorted for stable argument order.
pub fn env_list(env: &HashMap<String, String>) -> Vec<String> {
    let mut list: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    list.sort();
    list
}

#[cfg(test)]
mod tests {
    use super::testing::MockContainer;
    use super::*;

    #[test]
    fn test_not_found_detection_through_context() {
        let err = anyhow::Error::from(ContainerError::NotFound {
            kind: "volume",
            name: "v".into(),
        })
        .context("removing volume");
        assert!(ContainerError::is_not_found(&err));
        assert!(!ContainerError::is_not_found(&anyhow::anyhow!("other")));
    }

    #[tokio::test]
    async fn test_update_from_env_parses_file() {
        let container = MockContainer::new();
        container.put_file("/etc/environment", "LANG=C.UTF-8\nMULTI<<EOF\na\nb\nEOF\n");
        let mut env = HashMap::new();
        container
            .update_from_env(&ExecContext::default(), "/etc/environment", &mut env)
            .await
            .unwrap();
        assert_eq!(env["LANG"], "C.UTF-8");
        assert_eq!(env["MULTI"], "a\nb");
    }

    #[tokio::test]
    async fn test_update_from_env_missing_file_is_empty() {
        let container = MockContainer::new();
        let mut env = HashMap::new();
        container
            .update_from_env(&ExecContext::default(), "/nope", &mut env)
            .await
            .unwrap();
        assert!(env.is_empty());
    }

    #[tokio::test]
    async fn test_update_from_path_prepends() {
        let container = MockContainer::new();
        container.put_file("/var/run/act/workflow/paths.txt", "/opt/a\n/opt/b\n");
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), "/usr/bin".to_string());
        env.insert(
            "GITHUB_PATH".to_string(),
            "/var/run/act/workflow/paths.txt".to_string(),
        );
        container
            .update_from_path(&ExecContext::default(), &mut env)
            .await
            .unwrap();
        assert_eq!(env["PATH"], "/opt/b:/opt/a:/usr/bin");
    }

    #[test]
    fn test_env_list_sorted() {
        let mut env = HashMap::new();
        env.insert("B".to_string(), "2".to_string());
        env.insert("A".to_string(), "1".to_string());
        assert_eq!(env_list(&env), vec!["A=1", "B=2"]);
    }
}
