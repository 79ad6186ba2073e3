// Docker-backed containers driven through the docker CLI.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use localrun_sdk::{ExecContext, ProcessInvoker, TraceWriter, TracingTraceWriter};
use parking_lot::Mutex;

use super::{
    archive, env_list, run_streamed, Container, ContainerDriver, ContainerError, FileEntry,
    NewContainerInput,
};

/// Docker CLI trace writer.
struct DockerTraceWriter;

impl TraceWriter for DockerTraceWriter {
    fn info(&self, message: &str) {
        tracing::info!(target: "docker", "{}", message);
    }

    fn verbose(&self, message: &str) {
        tracing::debug!(target: "docker", "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "docker", "{}", message);
    }
}

/// Thin wrapper over the docker binary.
#[derive(Debug, Clone)]
struct DockerCli {
    docker_path: Arc<str>,
}

impl DockerCli {
    /// Run to completion and return raw stdout. A non-zero exit becomes
    /// `ContainerError::CommandFailed` carrying stderr.
    async fn output(&self, args: &[String], stdin: Option<Vec<u8>>, ctx: &ExecContext) -> Result<Vec<u8>> {
        let invoker = ProcessInvoker::new(Arc::new(DockerTraceWriter));
        let captured = invoker
            .capture(&self.docker_path, args, stdin, ctx.cancel_token())
            .await
            .with_context(|| format!("Docker command failed: {} {}", self.docker_path, args.join(" ")))?;

        if captured.exit_code != 0 {
            return Err(ContainerError::CommandFailed {
                command: format!("docker {}", args.first().map(String::as_str).unwrap_or_default()),
                exit_code: captured.exit_code,
                stderr: captured.stderr,
            }
            .into());
        }
        Ok(captured.stdout)
    }

    async fn output_text(&self, args: &[String], ctx: &ExecContext) -> Result<String> {
        let stdout = self.output(args, None, ctx).await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    async fn stream(&self, args: &[String], output: Arc<dyn TraceWriter>, ctx: &ExecContext) -> Result<()> {
        run_streamed(&self.docker_path, args, "", None, output, ctx).await
    }
}

/// Creates docker containers and removes docker volumes.
pub struct DockerDriver {
    cli: DockerCli,
}

impl DockerDriver {
    /// Resolve `docker` on `PATH`, falling back to the bare name.
    pub fn new() -> Self {
        let docker_path = which::which("docker")
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "docker".to_string());
        Self::with_path(docker_path)
    }

    pub fn with_path(docker_path: impl Into<String>) -> Self {
        Self {
            cli: DockerCli {
                docker_path: Arc::from(docker_path.into()),
            },
        }
    }

    pub fn docker_path(&self) -> &str {
        &self.cli.docker_path
    }
}

impl Default for DockerDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    fn new_container(&self, input: NewContainerInput) -> Arc<dyn Container> {
        Arc::new(DockerContainer {
            cli: self.cli.clone(),
            input,
            id: Mutex::new(None),
        })
    }

    async fn remove_volume(&self, ctx: &ExecContext, name: &str, force: bool) -> Result<()> {
        let listed = self
            .cli
            .output_text(&args(&["volume", "ls", "--format", "{{.Name}}"]), ctx)
            .await?;
        if !listed.lines().any(|line| line.trim() == name) {
            return Err(ContainerError::NotFound {
                kind: "volume",
                name: name.to_string(),
            }
            .into());
        }

        let mut rm = args(&["volume", "rm"]);
        if force {
            rm.push("--force".to_string());
        }
        rm.push(name.to_string());
        tracing::debug!(target: "docker", "Removing volume {}", name);
        self.cli.output(&rm, None, ctx).await?;
        Ok(())
    }
}

/// A job container managed with `docker create/start/exec/cp/rm`.
pub struct DockerContainer {
    cli: DockerCli,
    input: NewContainerInput,
    id: Mutex<Option<String>>,
}

impl DockerContainer {
    fn output_writer(&self) -> Arc<dyn TraceWriter> {
        self.input
            .output
            .clone()
            .unwrap_or_else(|| Arc::new(TracingTraceWriter::new("container")))
    }

    fn id(&self) -> Result<String> {
        self.id
            .lock()
            .clone()
            .with_context(|| format!("container '{}' has not been created", self.input.name))
    }

    async fn image_exists(&self, ctx: &ExecContext) -> bool {
        let inspect = args(&["image", "inspect", "--format", "{{.Id}}", &self.input.image]);
        self.cli.output(&inspect, None, ctx).await.is_ok()
    }

    async fn login(&self, ctx: &ExecContext) -> Result<()> {
        let mut login = vec!["login".to_string()];
        if let Some(host) = registry_host(&self.input.image) {
            login.push(host.to_string());
        }
        login.extend(args(&["--username", &self.input.username, "--password-stdin"]));
        self.cli
            .output(&login, Some(self.input.password.clone().into_bytes()), ctx)
            .await
            .context("docker login failed")?;
        Ok(())
    }

    async fn find_existing(&self, ctx: &ExecContext) -> Result<Option<String>> {
        let filter = format!("name=^/{}$", self.input.name);
        let found = self
            .cli
            .output_text(&args(&["ps", "-a", "-q", "--filter", &filter]), ctx)
            .await?;
        Ok(found.lines().next().map(str::to_string))
    }

    fn resolve_workdir(&self, workdir: &str) -> String {
        if workdir.is_empty() {
            self.input.working_dir.clone()
        } else if workdir.starts_with('/') || self.input.working_dir.is_empty() {
            workdir.to_string()
        } else {
            format!("{}/{}", self.input.working_dir.trim_end_matches('/'), workdir)
        }
    }

    async fn copy_tar(&self, ctx: &ExecContext, dest_path: &str, tar: Vec<u8>) -> Result<()> {
        let target = format!("{}:{}", self.id()?, dest_path);
        self.cli
            .output(&args(&["cp", "-", &target]), Some(tar), ctx)
            .await
            .with_context(|| format!("failed to copy content to container '{}'", dest_path))?;
        Ok(())
    }
}

#[async_trait]
impl Container for DockerContainer {
    async fn pull(&self, ctx: &ExecContext, force_pull: bool) -> Result<()> {
        if !force_pull && self.image_exists(ctx).await {
            tracing::debug!(target: "docker", "Image exists? true - skipping pull of {}", self.input.image);
            return Ok(());
        }

        if !self.input.username.is_empty() {
            self.login(ctx).await?;
        }

        tracing::info!(target: "docker", "docker pull image={} platform={}", self.input.image, self.input.platform);
        let mut pull = vec!["pull".to_string()];
        if !self.input.platform.is_empty() {
            pull.extend(args(&["--platform", &self.input.platform]));
        }
        pull.push(self.input.image.clone());
        self.cli.stream(&pull, self.output_writer(), ctx).await
    }

    async fn create(&self, ctx: &ExecContext, cap_add: &[String], cap_drop: &[String]) -> Result<()> {
        if self.id.lock().is_some() {
            return Ok(());
        }

        if let Some(existing) = self.find_existing(ctx).await? {
            tracing::debug!(target: "docker", "Found container {} for name {}", existing, self.input.name);
            *self.id.lock() = Some(existing);
            return Ok(());
        }

        tracing::info!(target: "docker", "docker create image={} name={}", self.input.image, self.input.name);
        let create = build_create_args(&self.input, cap_add, cap_drop);
        let id = self.cli.output_text(&create, ctx).await?;
        tracing::debug!(target: "docker", "Created container name={} id={}", self.input.name, id);
        *self.id.lock() = Some(id);
        Ok(())
    }

    async fn start(&self, ctx: &ExecContext, attach: bool) -> Result<()> {
        let id = self.id()?;
        tracing::info!(target: "docker", "docker run image={} name={}", self.input.image, self.input.name);
        let mut start = vec!["start".to_string()];
        if attach {
            start.push("--attach".to_string());
        }
        start.push(id);
        self.cli.stream(&start, self.output_writer(), ctx).await
    }

    async fn update_from_image_env(&self, ctx: &ExecContext, env: &mut HashMap<String, String>) -> Result<()> {
        let inspect = args(&["image", "inspect", "--format", "{{json .Config.Env}}", &self.input.image]);
        let raw = self.cli.output_text(&inspect, ctx).await?;
        let entries: Option<Vec<String>> =
            serde_json::from_str(&raw).context("failed to parse image environment")?;
        for entry in entries.unwrap_or_default() {
            if let Some((key, value)) = entry.split_once('=') {
                env.entry(key.to_string()).or_insert_with(|| value.to_string());
            }
        }
        Ok(())
    }

    async fn exec(
        &self,
        ctx: &ExecContext,
        command: &[String],
        env: &HashMap<String, String>,
        user: &str,
        workdir: &str,
    ) -> Result<()> {
        let id = self.id()?;
        let workdir = self.resolve_workdir(workdir);
        tracing::debug!(target: "docker", "Exec command '{}' in '{}'", command.join(" "), workdir);

        let mut exec = vec!["exec".to_string()];
        for kv in env_list(env) {
            exec.push("-e".to_string());
            exec.push(kv);
        }
        if !user.is_empty() {
            exec.extend(args(&["-u", user]));
        }
        if !workdir.is_empty() {
            exec.extend(args(&["-w", &workdir]));
        }
        if self.input.allocate_terminal {
            exec.push("-t".to_string());
        }
        exec.push(id);
        exec.extend(command.iter().cloned());

        self.cli.stream(&exec, self.output_writer(), ctx).await
    }

    async fn copy(&self, ctx: &ExecContext, dest_path: &str, files: &[FileEntry]) -> Result<()> {
        tracing::debug!(target: "docker", "Writing {} file(s) to {}", files.len(), dest_path);
        let tar = archive::build_files(files)?;
        self.copy_tar(ctx, dest_path, tar).await
    }

    async fn copy_dir(&self, ctx: &ExecContext, dest_path: &str, src_path: &Path, use_gitignore: bool) -> Result<()> {
        tracing::info!(target: "docker", "docker cp src={} dst={}", src_path.display(), dest_path);
        self.exec(ctx, &args(&["mkdir", "-p", dest_path]), &HashMap::new(), "", "")
            .await?;

        let src = src_path.to_path_buf();
        let tar = tokio::task::spawn_blocking(move || archive::build_directory(&src, use_gitignore))
            .await
            .context("archive task failed")??;
        self.copy_tar(ctx, dest_path, tar).await
    }

    async fn get_container_archive(&self, ctx: &ExecContext, src_path: &str) -> Result<Vec<u8>> {
        let source = format!("{}:{}", self.id()?, src_path);
        let err = match self.cli.output(&args(&["cp", &source, "-"]), None, ctx).await {
            Ok(tar) => return Ok(tar),
            Err(e) => e,
        };
        let missing = matches!(
            err.downcast_ref::<ContainerError>(),
            Some(ContainerError::CommandFailed { stderr, .. })
                if stderr.contains("Could not find") || stderr.contains("No such")
        );
        if missing {
            return Err(ContainerError::NotFound {
                kind: "file",
                name: src_path.to_string(),
            }
            .into());
        }
        Err(err)
    }

    /// Remove the container, looking it up by name when this handle never
    /// created or adopted one. A container that is already gone is not an
    /// error.
    async fn remove(&self, ctx: &ExecContext) -> Result<()> {
        let known = self.id.lock().clone();
        let id = match known {
            Some(id) => id,
            None if self.input.name.is_empty() => return Ok(()),
            None => match self.find_existing(ctx).await? {
                Some(id) => id,
                None => return Ok(()),
            },
        };
        tracing::debug!(target: "docker", "Removing container name={} id={}", self.input.name, id);
        if let Err(err) = self
            .cli
            .output(&args(&["rm", "--force", "--volumes", &id]), None, ctx)
            .await
        {
            let gone = matches!(
                err.downcast_ref::<ContainerError>(),
                Some(ContainerError::CommandFailed { stderr, .. }) if stderr.contains("No such container")
            );
            if !gone {
                return Err(err);
            }
            tracing::debug!(target: "docker", "Container {} already removed", id);
        }
        *self.id.lock() = None;
        Ok(())
    }

    async fn close(&self, _ctx: &ExecContext) -> Result<()> {
        Ok(())
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// The registry host of an image reference, when it names one explicitly.
fn registry_host(image: &str) -> Option<&str> {
    let (first, _) = image.split_once('/')?;
    if first.contains('.') || first.contains(':') || first == "localhost" {
        Some(first)
    } else {
        None
    }
}

/// Arguments for `docker create`.
fn build_create_args(input: &NewContainerInput, cap_add: &[String], cap_drop: &[String]) -> Vec<String> {
    let mut create = vec!["create".to_string()];

    if !input.name.is_empty() {
        create.extend(args(&["--name", &input.name]));
    }
    if let Some(entrypoint) = input.entrypoint.first() {
        create.extend(args(&["--entrypoint", entrypoint]));
    }
    if !input.working_dir.is_empty() {
        create.extend(args(&["-w", &input.working_dir]));
    }
    for kv in &input.env {
        create.extend(args(&["-e", kv]));
    }
    for bind in &input.binds {
        create.extend(args(&["-v", bind]));
    }
    let mut mounts: Vec<_> = input.mounts.iter().collect();
    mounts.sort();
    for (source, target) in mounts {
        create.push("--mount".to_string());
        create.push(format!("type=volume,source={},target={}", source, target));
    }
    if !input.network_mode.is_empty() {
        create.extend(args(&["--network", &input.network_mode]));
    }
    if input.privileged {
        create.push("--privileged".to_string());
    }
    if !input.userns_mode.is_empty() {
        create.extend(args(&["--userns", &input.userns_mode]));
    }
    if !input.platform.is_empty() {
        create.extend(args(&["--platform", &input.platform]));
    }
    if !input.hostname.is_empty() {
        create.extend(args(&["--hostname", &input.hostname]));
    }
    for cap in cap_add {
        create.extend(args(&["--cap-add", cap]));
    }
    for cap in cap_drop {
        create.extend(args(&["--cap-drop", cap]));
    }
    if input.allocate_terminal {
        create.push("-t".to_string());
    }

    create.push(input.image.clone());
    create.extend(input.entrypoint.iter().skip(1).cloned());
    create.extend(input.cmd.iter().cloned());
    create
}
