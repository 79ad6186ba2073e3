// Replaces registered secret values in log text with `***`.

use parking_lot::RwLock;
use std::sync::Arc;

const MASK: &str = "***";

/// Thread-safe set of secret values. Clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    // Kept sorted longest first so a secret containing another is masked whole.
    secrets: Arc<RwLock<Vec<String>>>,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a masker from the values of a secrets map.
    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a String>) -> Self {
        let masker = Self::new();
        for value in values {
            masker.add_value(value);
        }
        masker
    }

    /// Register a secret. Blank values are ignored. Each line of a
    /// multi-line secret is also registered on its own.
    pub fn add_value(&self, secret: &str) {
        let trimmed = secret.trim();
        if trimmed.is_empty() {
            return;
        }

        let mut secrets = self.secrets.write();
        let candidates = std::iter::once(trimmed).chain(
            trimmed
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && *line != trimmed),
        );
        for candidate in candidates {
            if !secrets.iter().any(|s| s == candidate) {
                secrets.push(candidate.to_string());
            }
        }
        secrets.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    /// Return `input` with every registered secret replaced.
    pub fn mask_secrets(&self, input: &str) -> String {
        let secrets = self.secrets.read();
        let mut result = input.to_string();
        for secret in secrets.iter() {
            if result.contains(secret.as_str()) {
                result = result.replace(secret.as_str(), MASK);
            }
        }
        result
    }

    pub fn secret_count(&self) -> usize {
        self.secrets.read().len()
    }
}
