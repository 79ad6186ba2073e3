// Runs job steps directly on the host, inside a per-job scratch directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use localrun_common::constants::PATH_VARIABLE;
use localrun_sdk::{ExecContext, IOUtil, TraceWriter};

use super::{archive, run_streamed, Container, ContainerError, FileEntry};

/// A "container" that is the host itself.
///
/// The scratch directory holds `act/` (file commands), `hostexecutor/` and
/// `tmp/`, and is deleted on the first `remove` or `close`.
pub struct HostContainer {
    workdir: PathBuf,
    misc_dir: PathBuf,
    output: Arc<dyn TraceWriter>,
    cleaned: AtomicBool,
}

impl HostContainer {
    /// Create the scratch layout under `misc_dir`, world-writable.
    pub fn create(workdir: PathBuf, misc_dir: PathBuf, output: Arc<dyn TraceWriter>) -> Result<Self> {
        for dir in ["act", "hostexecutor", "tmp"] {
            IOUtil::ensure_shared_directory(&misc_dir.join(dir))?;
        }
        Ok(Self {
            workdir,
            misc_dir,
            output,
            cleaned: AtomicBool::new(false),
        })
    }

    pub fn misc_dir(&self) -> &Path {
        &self.misc_dir
    }

    /// Where file commands live.
    pub fn act_path(&self) -> PathBuf {
        self.misc_dir.join("act")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.misc_dir.join("tmp")
    }

    fn resolve(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            return self.workdir.clone();
        }
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.workdir.join(candidate)
        }
    }

    fn cleanup_once(&self) -> Result<()> {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!(target: "host", "Removing {}", self.misc_dir.display());
        IOUtil::delete_directory(&self.misc_dir)
    }
}

#[async_trait]
impl Container for HostContainer {
    async fn pull(&self, _ctx: &ExecContext, _force_pull: bool) -> Result<()> {
        Ok(())
    }

    async fn create(&self, _ctx: &ExecContext, _cap_add: &[String], _cap_drop: &[String]) -> Result<()> {
        Ok(())
    }

    async fn start(&self, _ctx: &ExecContext, _attach: bool) -> Result<()> {
        Ok(())
    }

    async fn update_from_image_env(&self, _ctx: &ExecContext, _env: &mut HashMap<String, String>) -> Result<()> {
        Ok(())
    }

    async fn exec(
        &self,
        ctx: &ExecContext,
        command: &[String],
        env: &HashMap<String, String>,
        _user: &str,
        workdir: &str,
    ) -> Result<()> {
        let (program, arguments) = command.split_first().context("empty command")?;
        let cwd = self.resolve(workdir);

        let search_path = env
            .get(PATH_VARIABLE)
            .cloned()
            .or_else(|| std::env::var(PATH_VARIABLE).ok());
        let resolved = which::which_in(program, search_path, &cwd)
            .with_context(|| format!("Cannot find: {} in PATH", program))?;

        tracing::debug!(target: "host", "Exec command '{}' in '{}'", command.join(" "), cwd.display());
        run_streamed(
            &resolved.to_string_lossy(),
            arguments,
            &cwd.to_string_lossy(),
            Some(env),
            self.output.clone(),
            ctx,
        )
        .await
    }

    async fn copy(&self, _ctx: &ExecContext, dest_path: &str, files: &[FileEntry]) -> Result<()> {
        let dest = self.resolve(dest_path);
        for file in files {
            IOUtil::write_file_with_mode(&dest.join(&file.name), file.body.as_bytes(), file.mode)?;
        }
        Ok(())
    }

    async fn copy_dir(&self, _ctx: &ExecContext, dest_path: &str, src_path: &Path, use_gitignore: bool) -> Result<()> {
        let dest = self.resolve(dest_path);
        let src = src_path.to_path_buf();
        tracing::info!(target: "host", "Copying {} to {}", src.display(), dest.display());

        tokio::task::spawn_blocking(move || copy_tree(&src, &dest, use_gitignore))
            .await
            .context("copy task failed")?
    }

    async fn get_container_archive(&self, _ctx: &ExecContext, src_path: &str) -> Result<Vec<u8>> {
        let path = self.resolve(src_path);
        if path.is_dir() {
            return archive::build_directory(&path, false);
        }
        let body = match std::fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ContainerError::NotFound {
                    kind: "file",
                    name: src_path.to_string(),
                }
                .into())
            }
            Err(e) => return Err(ContainerError::Io(e).into()),
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        archive::build_files(&[FileEntry::new(name, 0o644, String::from_utf8_lossy(&body))])
    }

    async fn remove(&self, _ctx: &ExecContext) -> Result<()> {
        self.cleanup_once()
    }

    async fn close(&self, _ctx: &ExecContext) -> Result<()> {
        self.cleanup_once()
    }
}

fn copy_tree(src: &Path, dest: &Path, use_gitignore: bool) -> Result<()> {
    std::fs::create_dir_all(dest).with_context(|| format!("Failed to create '{}'", dest.display()))?;
    for rel in archive::walk_source(src, use_gitignore)? {
        let from = src.join(&rel);
        let to = dest.join(&rel);
        let meta = std::fs::symlink_metadata(&from)?;
        if meta.is_dir() {
            std::fs::create_dir_all(&to).with_context(|| format!("Failed to create '{}'", to.display()))?;
        } else if meta.is_file() {
            std::fs::copy(&from, &to)
                .with_context(|| format!("Failed to copy '{}' to '{}'", from.display(), to.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use localrun_sdk::NullTraceWriter;

    fn host(root: &Path) -> HostContainer {
        HostContainer::create(root.join("work"), root.join("misc"), Arc::new(NullTraceWriter)).unwrap()
    }

    #[test]
    fn test_create_layout() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path());
        assert!(host.act_path().is_dir());
        assert!(host.temp_dir().is_dir());
        assert!(host.misc_dir().join("hostexecutor").is_dir());
    }

    #[tokio::test]
    async fn test_copy_and_archive() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path());
        let ctx = ExecContext::default();
        let act = host.act_path().to_string_lossy().into_owned();
        host.copy(&ctx, &act, &[FileEntry::new("workflow/envs.txt", 0o666, "A=1\n")])
            .await
            .unwrap();

        let mut env = HashMap::new();
        host.update_from_env(&ctx, &format!("{act}/workflow/envs.txt"), &mut env)
            .await
            .unwrap();
        assert_eq!(env["A"], "1");

        let missing = host.get_container_archive(&ctx, &format!("{act}/nope")).await.unwrap_err();
        assert!(ContainerError::is_not_found(&missing));
    }

    #[tokio::test]
    async fn test_cleanup_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path());
        let ctx = ExecContext::default();
        host.remove(&ctx).await.unwrap();
        assert!(!host.misc_dir().exists());
        std::fs::create_dir_all(host.misc_dir()).unwrap();
        host.close(&ctx).await.unwrap();
        assert!(host.misc_dir().exists());
    }

    #[tokio::test]
    async fn test_copy_dir() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("nested/file.txt"), "hi").unwrap();
        let host = host(dir.path());
        host.copy_dir(&ExecContext::default(), "copied", &src, false)
            .await
            .unwrap();
        let copied = dir.path().join("work/copied/nested/file.txt");
        assert_eq!(std::fs::read_to_string(copied).unwrap(), "hi");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_runs_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("work")).unwrap();
        let host = host(dir.path());
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        let command = vec!["sh".to_string(), "-c".to_string(), "echo ok > marker".to_string()];
        host.exec(&ExecContext::default(), &command, &env, "", "")
            .await
            .unwrap();
        assert!(dir.path().join("work/marker").exists());

        let failing = vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()];
        assert!(host.exec(&ExecContext::default(), &failing, &env, "", "").await.is_err());
    }
}
