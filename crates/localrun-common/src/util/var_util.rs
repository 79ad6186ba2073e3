// Platform-aware environment helpers.

use crate::constants::{OsPlatform, CURRENT_ARCHITECTURE, CURRENT_PLATFORM};
use std::collections::HashMap;

pub struct VarUtil;

impl VarUtil {
    /// `RUNNER_OS` value for the host.
    pub fn os() -> &'static str {
        CURRENT_PLATFORM.label_name()
    }

    /// `RUNNER_ARCH` value for the host.
    pub fn os_architecture() -> &'static str {
        CURRENT_ARCHITECTURE.label_name()
    }

    /// Layer maps left to right; later maps win on duplicate keys.
    ///
    /// Keys compare case-insensitively on Windows.
    pub fn merge_env<'a>(
        layers: impl IntoIterator<Item = &'a HashMap<String, String>>,
    ) -> HashMap<String, String> {
        let mut merged: HashMap<String, String> = HashMap::new();
        for layer in layers {
            for (key, value) in layer {
                if CURRENT_PLATFORM == OsPlatform::Windows {
                    let existing = merged
                        .keys()
                        .find(|k| k.eq_ignore_ascii_case(key))
                        .cloned();
                    if let Some(k) = existing {
                        merged.remove(&k);
                    }
                }
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Snapshot of the current process environment.
    pub fn process_env() -> HashMap<String, String> {
        std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .filter(|(k, _)| !k.is_empty())
            .collect()
    }
}
