// In-memory container and driver that record every call.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use localrun_sdk::ExecContext;
use parking_lot::Mutex;

use super::{archive, Container, ContainerDriver, ContainerError, FileEntry, NewContainerInput};

pub type MockFs = Arc<Mutex<HashMap<String, String>>>;
pub type ExecHook =
    Arc<dyn Fn(&[String], &HashMap<String, String>, &MockFs) -> Result<()> + Send + Sync>;

#[derive(Default)]
pub struct MockContainer {
    log: Mutex<Vec<String>>,
    fs: MockFs,
    failures: Mutex<HashMap<String, String>>,
    image_env: Mutex<Vec<(String, String)>>,
    exec_hook: Mutex<Option<ExecHook>>,
    exec_env: Mutex<Vec<HashMap<String, String>>>,
}

impl MockContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn put_file(&self, path: &str, body: &str) {
        self.fs.lock().insert(path.to_string(), body.to_string());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.fs.lock().get(path).cloned()
    }

    /// Make every call to `op` fail with `message`.
    pub fn fail_on(&self, op: &str, message: &str) {
        self.failures.lock().insert(op.to_string(), message.to_string());
    }

    pub fn set_image_env(&self, key: &str, value: &str) {
        self.image_env.lock().push((key.to_string(), value.to_string()));
    }

    pub fn on_exec(&self, hook: ExecHook) {
        *self.exec_hook.lock() = Some(hook);
    }

    /// The environment passed to each `exec`, in call order.
    pub fn exec_envs(&self) -> Vec<HashMap<String, String>> {
        self.exec_env.lock().clone()
    }

    fn record(&self, op: &str, detail: String) -> Result<()> {
        let entry = if detail.is_empty() {
            op.to_string()
        } else {
            format!("{op} {detail}")
        };
        self.log.lock().push(entry);
        match self.failures.lock().get(op) {
            Some(message) => Err(anyhow::anyhow!("{}", message)),
            None => Ok(()),
        }
    }
}

fn join(dest: &str, name: &str) -> String {
    format!("{}/{}", dest.trim_end_matches('/'), name.trim_start_matches('/'))
}

#[async_trait]
impl Container for MockContainer {
    async fn pull(&self, _ctx: &ExecContext, force_pull: bool) -> Result<()> {
        self.record("pull", format!("force={force_pull}"))
    }

    async fn create(&self, _ctx: &ExecContext, cap_add: &[String], cap_drop: &[String]) -> Result<()> {
        self.record("create", format!("add={} drop={}", cap_add.join(","), cap_drop.join(",")))
    }

    async fn start(&self, _ctx: &ExecContext, attach: bool) -> Result<()> {
        self.record("start", format!("attach={attach}"))
    }

    async fn update_from_image_env(&self, _ctx: &ExecContext, env: &mut HashMap<String, String>) -> Result<()> {
        self.record("update_from_image_env", String::new())?;
        for (key, value) in self.image_env.lock().iter() {
            env.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Ok(())
    }

    async fn exec(
        &self,
        _ctx: &ExecContext,
        command: &[String],
        env: &HashMap<String, String>,
        user: &str,
        workdir: &str,
    ) -> Result<()> {
        let mut detail = command.join(" ");
        if !user.is_empty() {
            detail.push_str(&format!(" user={user}"));
        }
        if !workdir.is_empty() {
            detail.push_str(&format!(" workdir={workdir}"));
        }
        self.exec_env.lock().push(env.clone());
        self.record("exec", detail)?;
        let hook = self.exec_hook.lock().clone();
        match hook {
            Some(hook) => hook(command, env, &self.fs),
            None => Ok(()),
        }
    }

    async fn copy(&self, _ctx: &ExecContext, dest_path: &str, files: &[FileEntry]) -> Result<()> {
        let names: Vec<String> = files
            .iter()
            .map(|f| format!("{}:{:o}", f.name, f.mode))
            .collect();
        self.record("copy", format!("{} {}", dest_path, names.join(",")))?;
        let mut fs = self.fs.lock();
        for file in files {
            fs.insert(join(dest_path, &file.name), file.body.clone());
        }
        Ok(())
    }

    async fn copy_dir(&self, _ctx: &ExecContext, dest_path: &str, src_path: &Path, use_gitignore: bool) -> Result<()> {
        self.record(
            "copy_dir",
            format!("{} <- {} gitignore={}", dest_path, src_path.display(), use_gitignore),
        )
    }

    async fn get_container_archive(&self, _ctx: &ExecContext, src_path: &str) -> Result<Vec<u8>> {
        match self.fs.lock().get(src_path) {
            Some(body) => archive::build_files(&[FileEntry::new("file", 0o644, body.clone())]),
            None => Err(ContainerError::NotFound {
                kind: "file",
                name: src_path.to_string(),
            }
            .into()),
        }
    }

    async fn remove(&self, _ctx: &ExecContext) -> Result<()> {
        self.record("remove", String::new())
    }

    async fn close(&self, _ctx: &ExecContext) -> Result<()> {
        self.record("close", String::new())
    }
}

/// Hands out one shared `MockContainer` and tracks named volumes.
pub struct MockDriver {
    container: Arc<MockContainer>,
    volumes: Mutex<HashSet<String>>,
    inputs: Mutex<Vec<NewContainerInput>>,
    volume_failure: Mutex<Option<String>>,
}

impl MockDriver {
    pub fn new(container: Arc<MockContainer>) -> Self {
        Self {
            container,
            volumes: Mutex::new(HashSet::new()),
            inputs: Mutex::new(Vec::new()),
            volume_failure: Mutex::new(None),
        }
    }

    pub fn add_volume(&self, name: &str) {
        self.volumes.lock().insert(name.to_string());
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.volumes.lock().contains(name)
    }

    pub fn fail_volume_removal(&self, message: &str) {
        *self.volume_failure.lock() = Some(message.to_string());
    }

    /// Every input `new_container` was called with.
    pub fn inputs(&self) -> Vec<NewContainerInput> {
        self.inputs.lock().clone()
    }
}

#[async_trait]
impl ContainerDriver for MockDriver {
    fn new_container(&self, input: NewContainerInput) -> Arc<dyn Container> {
        self.container.log.lock().push(format!("new_container {}", input.name));
        self.inputs.lock().push(input);
        self.container.clone()
    }

    async fn remove_volume(&self, _ctx: &ExecContext, name: &str, force: bool) -> Result<()> {
        self.container
            .log
            .lock()
            .push(format!("volume_rm {name} force={force}"));
        if let Some(message) = self.volume_failure.lock().clone() {
            anyhow::bail!("{}", message);
        }
        if self.volumes.lock().remove(name) {
            Ok(())
        } else {
            Err(ContainerError::NotFound {
                kind: "volume",
                name: name.to_string(),
            }
            .into())
        }
    }
}
