// Typed configuration faults the job engine surfaces to its caller.

/// A job definition or configuration that cannot be executed as written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("invalid property count for key 'credentials:'")]
    InvalidCredentialCount,

    #[error("container.credentials cannot be empty")]
    EmptyCredentials,

    #[error("failed to interpolate container.credentials.{field}")]
    CredentialInterpolation { field: &'static str },

    #[error("no platform image for runner labels [{}]", labels.join(", "))]
    MissingPlatform { labels: Vec<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            ConfigurationError::CredentialInterpolation { field: "password" }.to_string(),
            "failed to interpolate container.credentials.password"
        );
        assert_eq!(
            ConfigurationError::MissingPlatform {
                labels: vec!["a".into(), "b".into()]
            }
            .to_string(),
            "no platform image for runner labels [a, b]"
        );
    }
}
