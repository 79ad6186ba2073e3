// Workflow and action documents, deserialized with serde.
//
// Only the fields the job engine reads are modelled; validation of the
// documents is left to whatever produced them.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};

/// Deserialize a map whose scalar values may be strings, numbers or bools.
fn string_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<HashMap<String, serde_yaml::Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, yaml_scalar_to_string(&v)))
        .collect())
}

fn yaml_scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// `continue-on-error` accepts a bool or the strings `"true"`/`"false"`.
fn loose_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_yaml::Value::Bool(b)) => b,
        Some(serde_yaml::Value::String(s)) => {
            localrun_sdk::StringUtil::convert_to_bool(&s).unwrap_or(false)
        }
        _ => false,
    })
}

/// A condition attached to a job or step. Empty means `success()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct IfExpression(pub String);

impl IfExpression {
    pub fn value(&self) -> &str {
        &self.0
    }
}

/// A workflow document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "string_map")]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub jobs: HashMap<String, Job>,
}

impl Workflow {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow '{}'", path.display()))?;
        let mut workflow: Workflow = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse workflow '{}'", path.display()))?;
        if workflow.name.is_empty() {
            workflow.name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
        }
        Ok(workflow)
    }
}

/// `runs-on` may be a single label or a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RunsOn {
    Label(String),
    Labels(Vec<String>),
}

/// `container` may be an image name or a full block.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ContainerDecl {
    Image(String),
    Spec(ContainerSpec),
}

fn container_decl<'de, D>(deserializer: D) -> Result<Option<ContainerSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        Option::<ContainerDecl>::deserialize(deserializer)?.map(|decl| match decl {
            ContainerDecl::Image(image) => ContainerSpec {
                image,
                ..ContainerSpec::default()
            },
            ContainerDecl::Spec(spec) => spec,
        }),
    )
}

/// A job's container block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerSpec {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub credentials: Option<HashMap<String, String>>,
    #[serde(default)]
    pub options: String,
    #[serde(default, deserialize_with = "string_map")]
    pub env: HashMap<String, String>,
}

/// One job of a workflow.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Job {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub runs_on: Option<RunsOn>,
    #[serde(default, deserialize_with = "container_decl")]
    pub container: Option<ContainerSpec>,
    #[serde(default, deserialize_with = "string_map")]
    pub env: HashMap<String, String>,
    #[serde(default, rename = "if")]
    pub if_expr: IfExpression,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, deserialize_with = "string_map")]
    pub outputs: HashMap<String, String>,
}

impl Job {
    /// Runner labels in declared order.
    pub fn runs_on(&self) -> Vec<String> {
        match self.runs_on {
            Some(RunsOn::Label(ref label)) => vec![label.clone()],
            Some(RunsOn::Labels(ref labels)) => labels.clone(),
            None => Vec::new(),
        }
    }

    pub fn container(&self) -> Option<&ContainerSpec> {
        self.container.as_ref()
    }

    /// Job-level environment.
    pub fn environment(&self) -> &HashMap<String, String> {
        &self.env
    }
}

/// How a step is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepType {
    /// `run:` shell script.
    Run,
    /// `uses: ./path` action in the repository.
    UsesActionLocal,
    /// `uses: owner/repo@ref`.
    UsesActionRemote,
    /// `uses: docker://image`.
    UsesDockerUrl,
    /// Both or neither of `run` and `uses`.
    Invalid,
}

/// One step of a job or composite action.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Step {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "if")]
    pub if_expr: IfExpression,
    #[serde(default)]
    pub uses: String,
    #[serde(default)]
    pub run: String,
    #[serde(default)]
    pub shell: String,
    #[serde(default)]
    pub working_directory: String,
    #[serde(default, deserialize_with = "string_map")]
    pub env: HashMap<String, String>,
    #[serde(default, deserialize_with = "string_map")]
    pub with: HashMap<String, String>,
    #[serde(default, deserialize_with = "loose_bool")]
    pub continue_on_error: bool,
}

impl Step {
    pub fn step_type(&self) -> StepType {
        match (self.run.is_empty(), self.uses.is_empty()) {
            (false, true) => StepType::Run,
            (true, false) if self.uses.starts_with("./") => StepType::UsesActionLocal,
            (true, false) if self.uses.starts_with("docker://") => StepType::UsesDockerUrl,
            (true, false) => StepType::UsesActionRemote,
            _ => StepType::Invalid,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.name.is_empty() {
            write!(f, "{}", self.name)
        } else if !self.uses.is_empty() {
            write!(f, "{}", self.uses)
        } else if !self.run.is_empty() {
            write!(f, "{}", self.run.lines().next().unwrap_or_default())
        } else {
            write!(f, "{}", self.id)
        }
    }
}

/// `owner/repo[/path]@ref` reference from a `uses:` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAction {
    pub org: String,
    pub repo: String,
    pub path: String,
    pub reference: String,
}

impl RemoteAction {
    pub fn parse(uses: &str) -> Option<Self> {
        let (target, reference) = uses.split_once('@')?;
        let mut parts = target.splitn(3, '/');
        let org = parts.next().filter(|s| !s.is_empty())?;
        let repo = parts.next().filter(|s| !s.is_empty())?;
        let path = parts.next().unwrap_or_default();
        Some(Self {
            org: org.to_string(),
            repo: repo.to_string(),
            path: path.to_string(),
            reference: reference.to_string(),
        })
    }

    /// `actions/checkout` with no sub-path.
    pub fn is_checkout(&self) -> bool {
        self.org == "actions" && self.repo == "checkout" && self.path.is_empty()
    }
}

/// An `action.yml` document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Action {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: HashMap<String, ActionInput>,
    #[serde(default)]
    pub outputs: HashMap<String, ActionOutput>,
    pub runs: ActionRuns,
}

impl Action {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read action '{}'", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse action '{}'", path.display()))
    }

    pub fn is_composite(&self) -> bool {
        self.runs.using.eq_ignore_ascii_case("composite")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionInput {
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "loose_bool")]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionOutput {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionRuns {
    #[serde(default)]
    pub using: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// The workflow plus the id of the job being run.
#[derive(Debug, Clone)]
pub struct Run {
    pub workflow: Workflow,
    pub job_id: String,
    job: Job,
}

impl Run {
    pub fn new(workflow: Workflow, job_id: &str) -> Result<Self> {
        let job = workflow
            .jobs
            .get(job_id)
            .cloned()
            .with_context(|| format!("Job '{}' not found in workflow '{}'", job_id, workflow.name))?;
        Ok(Self {
            workflow,
            job_id: job_id.to_string(),
            job,
        })
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Display name of the job: its `name:` or its id.
    pub fn job_name(&self) -> &str {
        self.job.name.as_deref().unwrap_or(&self.job_id)
    }
}
