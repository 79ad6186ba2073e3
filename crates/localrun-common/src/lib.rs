// localrun-common: shared services for the local workflow runner.
// Depends on `localrun-sdk`.

pub mod config;
pub mod constants;
pub mod exceptions;
pub mod logging;
pub mod secret_masker;
pub mod step_status;
pub mod util;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use config::Config;
pub use constants::{Architecture, OsPlatform, CURRENT_ARCHITECTURE, CURRENT_PLATFORM};
pub use exceptions::ConfigurationError;
pub use secret_masker::SecretMasker;
pub use step_status::StepStatus;
pub use logging::{init_subscriber, LogFormat, Tracing};
pub use util::var_util::VarUtil;
