/// Error returned when a shell-style string cannot be split into words.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    #[error("unterminated quote in '{0}'")]
    UnterminatedQuote(String),
    #[error("trailing escape character in '{0}'")]
    TrailingEscape(String),
}

/// String helpers.
pub struct StringUtil;

impl StringUtil {
    /// Convert a string to a boolean.
    ///
    /// `"1"`, `"true"` are true and `"0"`, `"false"` are false (case-insensitive).
    /// Returns `None` for anything else.
    pub fn convert_to_bool(value: &str) -> Option<bool> {
        match value.trim().to_lowercase().as_str() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        }
    }

    /// Split a string into words the way a POSIX shell lexes them:
    /// whitespace separates words, single quotes are literal, double quotes
    /// group with backslash escapes, a bare backslash escapes the next char.
    pub fn split_shell_words(input: &str) -> Result<Vec<String>, SplitError> {
        let mut words = Vec::new();
        let mut current = String::new();
        let mut in_word = false;
        let mut in_single_quote = false;
        let mut in_double_quote = false;
        let mut escape_next = false;

        for ch in input.chars() {
            if escape_next {
                current.push(ch);
                escape_next = false;
                in_word = true;
                continue;
            }

            match ch {
                '\\' if !in_single_quote => {
                    escape_next = true;
                }
                '\'' if !in_double_quote => {
                    in_single_quote = !in_single_quote;
                    in_word = true;
                }
                '"' if !in_single_quote => {
                    in_double_quote = !in_double_quote;
                    in_word = true;
                }
                c if c.is_whitespace() && !in_single_quote && !in_double_quote => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                _ => {
                    current.push(ch);
                    in_word = true;
                }
            }
        }

        if escape_next {
            return Err(SplitError::TrailingEscape(input.to_string()));
        }
        if in_single_quote || in_double_quote {
            return Err(SplitError::UnterminatedQuote(input.to_string()));
        }
        if in_word {
            words.push(current);
        }

        Ok(words)
    }

    /// Truncate to at most `len` bytes, never splitting a character.
    pub fn trim_to_len(value: &str, len: usize) -> &str {
        if value.len() <= len {
            return value;
        }
        let mut end = len;
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        &value[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_to_bool() {
        assert_eq!(StringUtil::convert_to_bool("TRUE"), Some(true));
        assert_eq!(StringUtil::convert_to_bool("0"), Some(false));
        assert_eq!(StringUtil::convert_to_bool("yes"), None);
        assert_eq!(StringUtil::convert_to_bool(""), None);
    }

    #[test]
    fn test_split_simple() {
        let words = StringUtil::split_shell_words("--hostname  box -v /a:/b").unwrap();
        assert_eq!(words, vec!["--hostname", "box", "-v", "/a:/b"]);
    }

    #[test]
    fn test_split_quotes() {
        let words = StringUtil::split_shell_words(r#"a "b c" 'd e' f\ g"#).unwrap();
        assert_eq!(words, vec!["a", "b c", "d e", "f g"]);
    }

    #[test]
    fn test_split_empty_quoted_word() {
        let words = StringUtil::split_shell_words(r#"--label "" x"#).unwrap();
        assert_eq!(words, vec!["--label", "", "x"]);
    }

    #[test]
    fn test_split_errors() {
        assert!(matches!(
            StringUtil::split_shell_words("--hostname 'unterminated"),
            Err(SplitError::UnterminatedQuote(_))
        ));
        assert!(matches!(
            StringUtil::split_shell_words("trailing\\"),
            Err(SplitError::TrailingEscape(_))
        ));
    }

    #[test]
    fn test_trim_to_len() {
        assert_eq!(StringUtil::trim_to_len("abcdef", 3), "abc");
        assert_eq!(StringUtil::trim_to_len("ab", 3), "ab");
        assert_eq!(StringUtil::trim_to_len("abc", 0), "");
    }
}
