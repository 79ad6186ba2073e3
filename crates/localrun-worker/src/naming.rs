// Deterministic, length-bounded names for job containers and volumes.

use localrun_sdk::StringUtil;
use once_cell::sync::Lazy;
use regex::Regex;

static NON_ALPHANUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new("[^a-zA-Z0-9]").expect("Invalid name regex"));

/// A trailing `-<digits>`, usually a matrix index.
static MATRIX_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new("-[0-9]+$").expect("Invalid suffix regex"));

static HYPHEN_RUN: Lazy<Regex> = Lazy::new(|| Regex::new("-{2,}").expect("Invalid hyphen regex"));

/// Build a daemon-safe name from ordered parts.
///
/// Every part but the last is truncated to `30 / parts - 1` characters. A
/// trailing `-<digits>` on such a part is kept whole and its length comes
/// out of the budget. The result has no doubled, leading or trailing
/// hyphens and is identical for identical input.
pub fn create_container_name(parts: &[&str]) -> String {
    if parts.is_empty() {
        return String::new();
    }

    let part_len = (30 / parts.len()).saturating_sub(1);
    let mut name: Vec<String> = Vec::with_capacity(parts.len() + 1);

    for (i, part) in parts.iter().enumerate() {
        let sanitized = NON_ALPHANUMERIC.replace_all(part, "-");
        if i == parts.len() - 1 {
            name.push(sanitized.into_owned());
            continue;
        }

        match MATRIX_SUFFIX.find(part) {
            Some(suffix) => {
                let budget = part_len.saturating_sub(suffix.as_str().len());
                name.push(StringUtil::trim_to_len(&sanitized, budget).to_string());
                name.push(suffix.as_str().to_string());
            }
            None => name.push(StringUtil::trim_to_len(&sanitized, part_len).to_string()),
        }
    }

    let joined = name.join("-");
    HYPHEN_RUN
        .replace_all(&joined, "-")
        .trim_matches('-')
        .to_string()
}
