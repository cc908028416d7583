use crate::config::SessionConfig;

/// How the pipeline treats a request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    /// Never carries a token (token endpoints, registration)
    Public,
    /// Carries a token, but a 401 is passed through without refreshing
    RefreshExempt,
    Protected,
}

/// Prefix-based endpoint classification. Paths are relative to the API base.
#[derive(Debug, Clone)]
pub struct EndpointPolicy {
    public: Vec<String>,
    refresh_exempt: Vec<String>,
}

impl EndpointPolicy {
    pub fn new(public: Vec<String>, refresh_exempt: Vec<String>) -> Self {
        Self {
            public,
            refresh_exempt,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.public_paths.clone(), config.refresh_exempt_paths.clone())
    }

    pub fn classify(&self, path: &str) -> EndpointClass {
        let matches = |prefixes: &[String]| prefixes.iter().any(|p| path.starts_with(p.as_str()));
        if matches(&self.public) {
            EndpointClass::Public
        } else if matches(&self.refresh_exempt) {
            EndpointClass::RefreshExempt
        } else {
            EndpointClass::Protected
        }
    }
}

impl Default for EndpointPolicy {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}
