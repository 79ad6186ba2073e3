// The `github` expression context and its `GITHUB_*` environment projection.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::Path;

use localrun_common::constants::{defaults, variables};
use localrun_common::Config;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::git_info::GitRepo;
use crate::model::{RemoteAction, Step, StepType};

/// The `github` context available in expressions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubContext {
    pub event: Map<String, Value>,
    pub event_path: String,
    pub workflow: String,
    pub run_id: String,
    pub run_number: String,
    pub run_attempt: String,
    pub actor: String,
    pub repository: String,
    pub event_name: String,
    pub sha: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub ref_name: String,
    pub ref_type: String,
    pub head_ref: String,
    pub base_ref: String,
    pub token: String,
    pub workspace: String,
    pub action: String,
    pub action_path: String,
    pub action_ref: String,
    pub action_repository: String,
    pub job: String,
    pub repository_owner: String,
    pub retention_days: String,
    pub runner_perflog: String,
    pub runner_tracking_id: String,
    pub server_url: String,
    pub api_url: String,
    pub graphql_url: String,
}

/// Job state the context is computed from.
#[derive(Debug, Clone, Copy)]
pub struct ContextSources<'a> {
    pub config: &'a Config,
    pub workflow_name: &'a str,
    pub job_id: &'a str,
    pub act_path: &'a str,
    pub event_json: &'a str,
    pub current_step: &'a str,
    pub action_path: &'a str,
    pub action_ref: &'a str,
    pub action_repository: &'a str,
}

/// Inputs to the environment projection that are not part of the context.
#[derive(Debug, Clone, Copy)]
pub struct GithubEnvSources<'a> {
    pub config: &'a Config,
    pub act_path: &'a str,
    pub job_name: &'a str,
    /// Runner labels, already interpolated, in declared order.
    pub runner_labels: &'a [String],
}

impl GithubContext {
    /// Build the context for a job.
    ///
    /// A `base` document that parses as a context is returned as is; an
    /// unparseable one is ignored and the defaults are computed.
    pub fn build(sources: &ContextSources<'_>, base: Option<&str>) -> Self {
        if let Some(raw) = base.filter(|raw| !raw.trim().is_empty()) {
            match serde_json::from_str::<GithubContext>(raw) {
                Ok(ctx) => return ctx,
                Err(e) => tracing::debug!(target: "job", "Ignoring unparseable base context: {}", e),
            }
        }

        let config = sources.config;
        let env = |key: &str| config.env.get(key).cloned().unwrap_or_default();

        let mut ctx = GithubContext {
            event_path: format!("{}/{}", sources.act_path, localrun_common::constants::file_commands::EVENT),
            workflow: sources.workflow_name.to_string(),
            run_id: env("GITHUB_RUN_ID"),
            run_number: env("GITHUB_RUN_NUMBER"),
            run_attempt: env("GITHUB_RUN_ATTEMPT"),
            actor: config.actor.clone(),
            event_name: config.event_name.clone(),
            workspace: config.container_workdir(),
            action: sources.current_step.to_string(),
            token: config.secrets.get(variables::GITHUB_TOKEN).cloned().unwrap_or_default(),
            action_path: sources.action_path.to_string(),
            action_ref: sources.action_ref.to_string(),
            action_repository: sources.action_repository.to_string(),
            job: sources.job_id.to_string(),
            repository_owner: env("GITHUB_REPOSITORY_OWNER"),
            retention_days: env("GITHUB_RETENTION_DAYS"),
            runner_perflog: env(variables::RUNNER_PERFLOG),
            runner_tracking_id: env(variables::RUNNER_TRACKING_ID),
            ..Default::default()
        };
        ctx.apply_defaults(config, sources.event_json);
        ctx
    }

    fn apply_defaults(&mut self, config: &Config, event_json: &str) {
        fill(&mut self.run_id, defaults::RUN_ID);
        fill(&mut self.run_number, defaults::RUN_NUMBER);
        fill(&mut self.run_attempt, defaults::RUN_ATTEMPT);
        fill(&mut self.retention_days, defaults::RETENTION_DAYS);
        fill(&mut self.runner_perflog, defaults::RUNNER_PERFLOG);
        fill(&mut self.actor, defaults::ACTOR);

        match GitRepo::discover(&config.workdir).and_then(|repo| repo.github_slug(&config.github_instance)) {
            Ok(slug) => {
                if self.repository_owner.is_empty() {
                    self.repository_owner = slug.split('/').next().unwrap_or_default().to_string();
                }
                self.repository = slug;
            }
            Err(e) => tracing::warn!(target: "job", "unable to get git repo: {:#}", e),
        }

        if !event_json.trim().is_empty() {
            match serde_json::from_str::<Map<String, Value>>(event_json) {
                Ok(event) => self.event = event,
                Err(e) => tracing::error!(target: "job", "Unable to unmarshal event '{}': {}", event_json, e),
            }
        }

        if self.event_name == "pull_request" || self.event_name == "pull_request_target" {
            self.base_ref = as_string(nested_map_lookup(&self.event, &["pull_request", "base", "ref"]));
            self.head_ref = as_string(nested_map_lookup(&self.event, &["pull_request", "head", "ref"]));
        }

        self.set_ref_and_sha(&config.default_branch, &config.workdir);
    }

    /// Derive `ref` and `sha` from the event, falling back to the checkout.
    pub fn set_ref_and_sha(&mut self, default_branch: &str, repo_path: &Path) {
        match self.event_name.as_str() {
            "pull_request_target" => {
                self.git_ref = format!("refs/heads/{}", self.base_ref);
                self.sha = as_string(nested_map_lookup(&self.event, &["pull_request", "base", "sha"]));
            }
            "pull_request" | "pull_request_review" | "pull_request_review_comment" => {
                self.git_ref = format!("refs/pull/{}/merge", as_string(self.event.get("number")));
            }
            "deployment" | "deployment_status" => {
                self.git_ref = as_string(nested_map_lookup(&self.event, &["deployment", "ref"]));
                self.sha = as_string(nested_map_lookup(&self.event, &["deployment", "sha"]));
            }
            "release" => {
                self.git_ref = format!(
                    "refs/tags/{}",
                    as_string(nested_map_lookup(&self.event, &["release", "tag_name"]))
                );
            }
            "push" | "create" | "workflow_dispatch" => {
                self.git_ref = as_string(self.event.get("ref"));
            }
            _ => {
                let branch = as_string(nested_map_lookup(&self.event, &["repository", "default_branch"]));
                if !branch.is_empty() {
                    self.git_ref = format!("refs/heads/{}", branch);
                }
            }
        }

        let repo = GitRepo::discover(repo_path);

        if self.git_ref.is_empty() {
            match repo.as_ref().map_err(|e| anyhow::anyhow!("{:#}", e)).and_then(|r| r.head_ref()) {
                Ok(git_ref) => self.git_ref = git_ref,
                Err(e) => tracing::warn!(target: "job", "unable to get git ref: {:#}", e),
            }

            let branch = if default_branch.is_empty() { "master" } else { default_branch };
            self.with_default_branch(branch);

            if self.git_ref.is_empty() {
                self.git_ref = format!(
                    "refs/heads/{}",
                    as_string(nested_map_lookup(&self.event, &["repository", "default_branch"]))
                );
            }
        }

        if self.sha.is_empty() {
            match repo.and_then(|r| r.head_revision()) {
                Ok(sha) => self.sha = sha,
                Err(e) => tracing::warn!(target: "job", "unable to get git revision: {:#}", e),
            }
        }

        self.ref_name = extract_ref_name(&self.git_ref);
        self.ref_type = extract_ref_type(&self.git_ref);
    }

    /// Record `branch` as the repository default branch in the event payload
    /// unless the payload already names one.
    fn with_default_branch(&mut self, branch: &str) {
        let repository = self
            .event
            .entry("repository")
            .or_insert_with(|| Value::Object(Map::new()));
        if !repository.is_object() {
            tracing::warn!(target: "job", "unable to set default branch, event repository is not an object");
            return;
        }
        if let Value::Object(repo) = repository {
            if !matches!(repo.get("default_branch"), Some(Value::String(_))) {
                repo.insert("default_branch".to_string(), Value::String(branch.to_string()));
            }
        }
    }

    /// Whether `step` checks out this repository at this ref, which the
    /// job has already materialised locally.
    pub fn is_local_checkout(&self, step: &Step) -> bool {
        if step.step_type() != StepType::UsesActionRemote {
            return false;
        }
        let Some(action) = RemoteAction::parse(&step.uses) else {
            return false;
        };
        if !action.is_checkout() {
            return false;
        }
        if matches!(step.with.get("repository"), Some(repo) if *repo != self.repository) {
            return false;
        }
        if matches!(step.with.get("ref"), Some(r) if *r != self.git_ref) {
            return false;
        }
        true
    }

    /// Project the context into the variables every step process sees.
    pub fn with_github_env(&self, env: &mut HashMap<String, String>, sources: &GithubEnvSources<'_>) {
        use localrun_common::constants::file_commands;

        let config = sources.config;
        let mut set = |key: &str, value: &str| {
            env.insert(key.to_string(), value.to_string());
        };

        set(variables::CI, "true");
        set(variables::GITHUB_ENV, &format!("{}/{}", sources.act_path, file_commands::ENV));
        set(variables::GITHUB_PATH, &format!("{}/{}", sources.act_path, file_commands::PATH));
        set("GITHUB_WORKFLOW", &self.workflow);
        set("GITHUB_RUN_ID", &self.run_id);
        set("GITHUB_RUN_NUMBER", &self.run_number);
        set("GITHUB_RUN_ATTEMPT", &self.run_attempt);
        set("GITHUB_ACTION", &self.action);
        set("GITHUB_ACTION_PATH", &self.action_path);
        set("GITHUB_ACTION_REPOSITORY", &self.action_repository);
        set("GITHUB_ACTION_REF", &self.action_ref);
        set("GITHUB_ACTIONS", "true");
        set("GITHUB_ACTOR", &self.actor);
        set("GITHUB_REPOSITORY", &self.repository);
        set("GITHUB_EVENT_NAME", &self.event_name);
        set("GITHUB_EVENT_PATH", &self.event_path);
        set("GITHUB_WORKSPACE", &self.workspace);
        set("GITHUB_SHA", &self.sha);
        set("GITHUB_REF", &self.git_ref);
        set("GITHUB_REF_NAME", &self.ref_name);
        set("GITHUB_REF_TYPE", &self.ref_type);
        set("GITHUB_HEAD_REF", &self.head_ref);
        set("GITHUB_BASE_REF", &self.base_ref);
        set(variables::GITHUB_TOKEN, &self.token);
        set("GITHUB_JOB", sources.job_name);
        set("GITHUB_REPOSITORY_OWNER", &self.repository_owner);
        set("GITHUB_RETENTION_DAYS", &self.retention_days);
        set(variables::RUNNER_PERFLOG, &self.runner_perflog);
        set(variables::RUNNER_TRACKING_ID, &self.runner_tracking_id);

        let (server, api, graphql) = endpoints(config);
        set("GITHUB_SERVER_URL", &server);
        set("GITHUB_API_URL", &api);
        set("GITHUB_GRAPHQL_URL", &graphql);

        if !config.artifact_server_path.is_empty() {
            let runtime_url = std::env::var(variables::ACTIONS_RUNTIME_URL)
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| format!("http://{}:{}/", outbound_ip(), config.artifact_server_port));
            let runtime_token = std::env::var(variables::ACTIONS_RUNTIME_TOKEN)
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| defaults::ARTIFACT_RUNTIME_TOKEN.to_string());
            set(variables::ACTIONS_RUNTIME_URL, &runtime_url);
            set(variables::ACTIONS_RUNTIME_TOKEN, &runtime_token);
        }

        for label in sources.runner_labels.iter().filter(|l| !l.is_empty()) {
            set(variables::IMAGE_OS, &image_os(label));
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn fill(field: &mut String, default: &str) {
    if field.is_empty() {
        *field = default.to_string();
    }
}

/// Server, API and GraphQL endpoints. Each explicitly configured URL
/// overrides its own default.
fn endpoints(config: &Config) -> (String, String, String) {
    let (mut server, mut api, mut graphql) = if config.github_instance == defaults::GITHUB_INSTANCE {
        (
            "https://github.com".to_string(),
            "https://api.github.com".to_string(),
            "https://api.github.com/graphql".to_string(),
        )
    } else {
        (
            format!("https://{}", config.github_instance),
            format!("https://{}/api/v3", config.github_instance),
            format!("https://{}/api/graphql", config.github_instance),
        )
    };
    if !config.github_server_url.is_empty() {
        server = config.github_server_url.clone();
    }
    if !config.github_api_server_url.is_empty() {
        api = config.github_api_server_url.clone();
    }
    if !config.github_graphql_api_server_url.is_empty() {
        graphql = config.github_graphql_api_server_url.clone();
    }
    (server, api, graphql)
}

/// `ImageOS` hint for a runner label: `ubuntu-22.04` → `ubuntu22`.
fn image_os(label: &str) -> String {
    if label == "ubuntu-latest" {
        return "ubuntu20".to_string();
    }
    let without_hyphen = label.replacen('-', "", 1);
    without_hyphen
        .split('.')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// The address other hosts would reach this machine on.
pub fn outbound_ip() -> IpAddr {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Follow `keys` through nested objects. Absent on a missing key or when an
/// intermediate value is not an object.
pub fn nested_map_lookup<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    let (first, rest) = keys.split_first()?;
    let value = map.get(*first)?;
    if rest.is_empty() {
        return Some(value);
    }
    match value {
        Value::Object(inner) => nested_map_lookup(inner, rest),
        _ => None,
    }
}

/// Render a scalar as a string; anything else is empty.
pub fn as_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{:.0}", f),
            _ => n.to_string(),
        },
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// `refs/heads/main` → `main`, `refs/tags/v1` → `v1`.
fn extract_ref_name(git_ref: &str) -> String {
    for prefix in ["refs/heads/", "refs/tags/", "refs/pull/"] {
        if let Some(name) = git_ref.strip_prefix(prefix) {
            return name.to_string();
        }
    }
    git_ref.to_string()
}

fn extract_ref_type(git_ref: &str) -> String {
    if git_ref.starts_with("refs/heads/") {
        "branch".to_string()
    } else if git_ref.starts_with("refs/tags/") {
        "tag".to_string()
    } else {
        String::new()
    }
}
