// Diagnostics setup: the global `tracing` subscriber and a secret-masking
// `TraceWriter` used for raw step output.

use crate::secret_masker::SecretMasker;
use localrun_sdk::TraceWriter;
use tracing_subscriber::EnvFilter;

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` overrides the default level, which is `info` or `debug` when
/// `verbose` is set.
pub fn init_subscriber(format: LogFormat, verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(e) = result {
        eprintln!("tracing subscriber already installed: {e}");
    }
}

/// Forwards step output to `tracing` after masking secrets.
///
/// Lines are emitted at `info` when `log_output` is set, otherwise at `debug`.
#[derive(Debug, Clone)]
pub struct Tracing {
    name: String,
    secret_masker: SecretMasker,
    log_output: bool,
}

impl Tracing {
    pub fn new(name: impl Into<String>, secret_masker: SecretMasker, log_output: bool) -> Self {
        Self {
            name: name.into(),
            secret_masker,
            log_output,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl TraceWriter for Tracing {
    fn info(&self, message: &str) {
        let masked = self.secret_masker.mask_secrets(message);
        if self.log_output {
            tracing::info!(target: "step", job = %self.name, raw_output = true, "{}", masked);
        } else {
            tracing::debug!(target: "step", job = %self.name, raw_output = true, "{}", masked);
        }
    }

    fn verbose(&self, message: &str) {
        let masked = self.secret_masker.mask_secrets(message);
        tracing::debug!(target: "step", job = %self.name, "{}", masked);
    }

    fn warning(&self, message: &str) {
        let masked = self.secret_masker.mask_secrets(message);
        tracing::warn!(target: "step", job = %self.name, "{}", masked);
    }

    fn error(&self, message: &str) {
        let masked = self.secret_masker.mask_secrets(message);
        tracing::error!(target: "step", job = %self.name, "{}", masked);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_writer_does_not_panic_without_subscriber() {
        let masker = SecretMasker::new();
        masker.add_value("hunter2");
        let writer = Tracing::new("ci/build", masker, true);
        writer.info("password is hunter2");
        writer.verbose("verbose");
        writer.warning("warn");
        writer.error("err");
        assert_eq!(writer.name(), "ci/build");
    }

    #[test]
    fn test_init_subscriber_twice_is_harmless() {
        init_subscriber(LogFormat::Text, false);
        init_subscriber(LogFormat::Json, true);
    }
}
