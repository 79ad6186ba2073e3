// Parsers for the flat files steps write to publish environment variables,
// PATH entries, outputs and state back to the job.

/// Parses file-command payloads.
pub struct FileCommandManager;

impl FileCommandManager {
    /// Parse `KEY=VALUE` lines and `KEY<<DELIMITER` heredoc blocks.
    ///
    /// Entries are returned in file order; a later duplicate key overrides
    /// an earlier one when collected into a map. Values are kept verbatim.
    /// Lines that match neither form are skipped.
    pub fn parse_key_values(content: &str) -> Vec<(String, String)> {
        let mut entries = Vec::new();
        let mut lines = content.lines();

        while let Some(line) = lines.next() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.trim().is_empty() {
                continue;
            }

            if let Some((name, delimiter)) = Self::heredoc_header(line) {
                let mut value_lines = Vec::new();
                let mut terminated = false;
                for value_line in lines.by_ref() {
                    let value_line = value_line.strip_suffix('\r').unwrap_or(value_line);
                    if value_line == delimiter {
                        terminated = true;
                        break;
                    }
                    value_lines.push(value_line);
                }
                if terminated {
                    entries.push((name.to_string(), value_lines.join("\n")));
                } else {
                    tracing::warn!(
                        target: "step",
                        "Unterminated heredoc for '{}' (delimiter '{}')",
                        name,
                        delimiter
                    );
                }
            } else if let Some((name, value)) = line.split_once('=') {
                let name = name.trim();
                if name.is_empty() {
                    tracing::debug!(target: "step", "Skipping entry with empty name: {}", line);
                    continue;
                }
                entries.push((name.to_string(), value.to_string()));
            } else {
                tracing::debug!(target: "step", "Skipping unrecognized line: {}", line);
            }
        }

        entries
    }

    /// Parse a `GITHUB_PATH` payload: one directory per non-blank line.
    pub fn parse_paths(content: &str) -> Vec<String> {
        content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// `NAME<<DELIM` where the delimiter is word characters or `-`.
    fn heredoc_header(line: &str) -> Option<(&str, &str)> {
        let (name, delimiter) = line.split_once("<<")?;
        let name = name.trim();
        let delimiter = delimiter.trim();
        if name.is_empty() || name.contains('=') || delimiter.is_empty() {
            return None;
        }
        if !delimiter
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            return None;
        }
        Some((name, delimiter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_simple() {
        let entries = FileCommandManager::parse_key_values("MY_VAR=hello\nOTHER=a=b\n");
        assert_eq!(
            entries,
            vec![
                ("MY_VAR".to_string(), "hello".to_string()),
                ("OTHER".to_string(), "a=b".to_string())
            ]
        );
    }

    #[test]
    fn test_parse_heredoc() {
        let entries =
            FileCommandManager::parse_key_values("MY_VAR<<EOF\nline1\nline2\nEOF\nNEXT=1\n");
        let map: HashMap<_, _> = entries.into_iter().collect();
        assert_eq!(map["MY_VAR"], "line1\nline2");
        assert_eq!(map["NEXT"], "1");
    }

    #[test]
    fn test_parse_heredoc_with_equals_in_body() {
        let entries = FileCommandManager::parse_key_values("json<<ghadelim_1\n{\"a\":1}\nx=y\nghadelim_1\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, "{\"a\":1}\nx=y");
    }

    #[test]
    fn test_unterminated_heredoc_dropped() {
        let entries = FileCommandManager::parse_key_values("A<<EOF\nnever closed\n");
        assert!(entries.is_empty());
    }

    #[test]
    fn test_values_kept_verbatim() {
        let entries = FileCommandManager::parse_key_values("SPACED=  padded  \r\n");
        assert_eq!(entries[0].1, "  padded  ");
    }

    #[test]
    fn test_later_duplicate_wins_in_map() {
        let map: HashMap<_, _> = FileCommandManager::parse_key_values("A=1\nA=2\n")
            .into_iter()
            .collect();
        assert_eq!(map["A"], "2");
    }

    #[test]
    fn test_parse_paths() {
        let paths = FileCommandManager::parse_paths("/usr/local/bin\n\n  /opt/custom \n");
        assert_eq!(paths, vec!["/usr/local/bin", "/opt/custom"]);
    }
}
