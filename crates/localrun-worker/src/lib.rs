// localrun-worker: the job engine.
//
// Architecture:
//   RunContext::executor → start_job_container → per-step StepRunner
//     → composite_child/composite_executor for local composite actions
//     → interpolate_outputs → stop/close

pub mod container;
pub mod expressions;
pub mod file_command_manager;
pub mod git_info;
pub mod github_context;
pub mod model;
pub mod naming;
pub mod run_context;
pub mod steps_context;
pub mod steps_runner;
