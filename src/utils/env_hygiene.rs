/// Environment hygiene for sandbox children
///
/// The child environment is built from nothing: the supervisor's own variables
/// (database URLs, cloud credentials, tokens) are never inherited.
use crate::config::types::{Result, RuleboxError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Deterministic search path for tools the child may invoke
pub const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Environment construction policy
#[derive(Debug, Clone)]
pub struct EnvPolicy {
    /// Set deterministic HOME/TMPDIR
    pub set_deterministic_home: bool,
    /// Set deterministic locale
    pub set_deterministic_locale: bool,
    /// Operator variables copied through verbatim (logging verbosity only)
    pub passthrough: Vec<String>,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        EnvPolicy {
            set_deterministic_home: true,
            set_deterministic_locale: true,
            passthrough: vec!["RUST_LOG".to_string()],
        }
    }
}

/// Builder for a curated child environment
#[derive(Debug, Clone)]
pub struct EnvHygiene {
    policy: EnvPolicy,
    vars: BTreeMap<String, String>,
    import_path: Vec<PathBuf>,
}

impl EnvHygiene {
    pub fn new(policy: EnvPolicy) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert("PATH".to_string(), SANDBOX_PATH.to_string());

        if policy.set_deterministic_home {
            vars.insert("HOME".to_string(), "/tmp".to_string());
            vars.insert("TMPDIR".to_string(), "/tmp".to_string());
        }

        if policy.set_deterministic_locale {
            vars.insert("LANG".to_string(), "C.UTF-8".to_string());
            vars.insert("LC_ALL".to_string(), "C.UTF-8".to_string());
        }

        // Interpreter behaviour: no user site-packages, no bytecode litter in
        // the job directory, unbuffered stdout for the line protocol.
        vars.insert("PYTHONNOUSERSITE".to_string(), "1".to_string());
        vars.insert("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string());
        vars.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());

        EnvHygiene {
            policy,
            vars,
            import_path: Vec::new(),
        }
    }

    /// Put `dir` in front of the deterministic PATH (the interpreter's bin directory)
    pub fn prepend_path(&mut self, dir: &Path) -> &mut Self {
        let current = self
            .vars
            .get("PATH")
            .cloned()
            .unwrap_or_else(|| SANDBOX_PATH.to_string());
        self.vars
            .insert("PATH".to_string(), format!("{}:{}", dir.display(), current));
        self
    }

    /// Append a directory to the isolated import path, in priority order
    pub fn push_import_path(&mut self, dir: PathBuf) -> &mut Self {
        self.import_path.push(dir);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.vars.insert(key.to_string(), value.into());
        self
    }

    /// Copy allow-listed operator variables from `lookup`
    pub fn with_passthrough<F>(&mut self, lookup: F) -> &mut Self
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in &self.policy.passthrough {
            if let Some(value) = lookup(key) {
                self.vars.insert(key.clone(), value);
            }
        }
        self
    }

    /// Final, validated environment map
    pub fn build(&self) -> Result<BTreeMap<String, String>> {
        let mut env_map = self.vars.clone();

        if !self.import_path.is_empty() {
            let joined = self
                .import_path
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(":");
            env_map.insert("PYTHONPATH".to_string(), joined);
        }

        for (key, value) in &env_map {
            if key.contains('\0') || value.contains('\0') || key.contains('=') {
                return Err(RuleboxError::LaunchFailure(format!(
                    "environment entry {} is malformed",
                    key
                )));
            }
        }

        let warnings = validate_environment_safety(&env_map);
        if !warnings.is_empty() {
            return Err(RuleboxError::LaunchFailure(warnings.join("; ")));
        }

        Ok(env_map)
    }
}

/// Flag variables that must never reach untrusted code
pub fn validate_environment_safety(env_map: &BTreeMap<String, String>) -> Vec<String> {
    let mut warnings = Vec::new();

    for key in env_map.keys() {
        let upper = key.to_ascii_uppercase();
        let credential_like = upper.contains("PASSWORD")
            || upper.contains("SECRET")
            || upper.contains("TOKEN")
            || upper.ends_with("_KEY")
            || upper == "DATABASE_URL"
            || upper.starts_with("AWS_");
        if credential_like {
            warnings.push(format!("Credential-like environment variable present: {}", key));
        }
        if upper.starts_with("LD_") {
            warnings.push(format!("Dangerous environment variable present: {}", key));
        }
    }

    if let Some(path) = env_map.get("PATH") {
        if path.contains("..") || path.contains('~') {
            warnings.push("PATH contains relative or home directory references".to_string());
        }
    }

    warnings
}
