// localrun-sdk: foundation layer for the local workflow runner.
// No dependencies on other localrun crates. Provides the executor pipeline,
// process spawning and small file-system and string helpers.

pub mod executor;
pub mod io_util;
pub mod process_invoker;
pub mod string_util;
pub mod trace;

// Re-export commonly used items at crate root
pub use executor::{ExecContext, Executor, PipelineError};
pub use io_util::IOUtil;
pub use process_invoker::{CapturedOutput, ProcessExitCodeError, ProcessInvoker};
pub use string_util::{SplitError, StringUtil};
pub use trace::{NullTraceWriter, TraceWriter, TracingTraceWriter};
