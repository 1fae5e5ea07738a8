/// Build references and the rule package manifest
use crate::config::types::{Result, RuleboxError};
use crate::observability::scores::{is_valid_label, FieldVocabulary};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const PACKAGE_DIR: &str = "package";

fn default_interpreter() -> String {
    "env/bin/python".to_string()
}

fn default_output_name() -> String {
    "normalized.csv".to_string()
}

/// A provisioned build: an interpreter environment plus a rule package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRef {
    pub build_id: String,
    pub root: PathBuf,
}

impl BuildRef {
    pub fn new(build_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            build_id: build_id.into(),
            root: root.into(),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn package_dir(&self) -> PathBuf {
        self.root.join(PACKAGE_DIR)
    }

    pub fn load_manifest(&self) -> Result<RulePackageManifest> {
        RulePackageManifest::load(&self.manifest_path())
    }

    /// Absolute interpreter path; relative manifest entries resolve against the build root.
    pub fn resolve_interpreter(&self, manifest: &RulePackageManifest) -> Result<PathBuf> {
        let declared = Path::new(&manifest.interpreter);
        let path = if declared.is_absolute() {
            declared.to_path_buf()
        } else {
            self.root.join(declared)
        };
        if !path.exists() {
            return Err(RuleboxError::LaunchFailure(format!(
                "interpreter {} not found in build {}",
                path.display(),
                self.build_id
            )));
        }
        Ok(path)
    }
}

/// `manifest.json` at the build root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulePackageManifest {
    /// Arguments passed to the interpreter, relative to the job directory
    pub entrypoint: Vec<String>,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Field vocabulary for mapping decisions
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default = "default_output_name")]
    pub output_name: String,
}

impl RulePackageManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RuleboxError::Config(format!("Failed to read manifest {}: {}", path.display(), e))
        })?;
        let manifest: RulePackageManifest = serde_json::from_str(&content)
            .map_err(|e| RuleboxError::Config(format!("Invalid manifest: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.entrypoint.is_empty() {
            return Err(RuleboxError::Config(
                "manifest entrypoint must not be empty".to_string(),
            ));
        }
        let mut components = Path::new(&self.output_name).components();
        let plain_name = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !plain_name {
            return Err(RuleboxError::Config(format!(
                "manifest output_name {:?} must be a plain file name",
                self.output_name
            )));
        }
        if let Some(bad) = self.fields.iter().find(|f| !is_valid_label(f)) {
            return Err(RuleboxError::Config(format!(
                "manifest field label {:?} is not allowed",
                bad
            )));
        }
        Ok(())
    }

    pub fn vocabulary(&self) -> FieldVocabulary {
        FieldVocabulary::new(&self.fields)
    }
}
