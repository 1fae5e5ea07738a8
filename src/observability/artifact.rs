/// Structured audit artifact (`logs/artifact.json`)
///
/// The artifact records decisions by coordinate only: table bounds, column
/// indices, field labels from the package vocabulary, scores, issue codes.
/// Cell values and free-text messages from rule code are never stored.
/// Every write goes through [`write_json_atomic`], so readers see either the
/// previous checkpoint or the new one.
use crate::config::types::{FailureKind, Result, RuleboxError};
use crate::observability::scores::{
    is_valid_label, normalize, FieldVocabulary, NormalizedScore, ScoreValue,
};
use crate::sandbox::deps::InstalledDependency;
use crate::utils::atomic::write_json_atomic;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ARTIFACT_SCHEMA: &str = "rulebox.artifact.v1";

fn is_valid_version(version: &str) -> bool {
    !version.is_empty()
        && version.len() <= 64
        && version
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'+' | b'-' | b'_' | b'!'))
}

/// `exit N`, `signal N` or `unknown`
fn is_exit_detail(detail: &str) -> bool {
    if detail == "unknown" {
        return true;
    }
    match detail.split_once(' ') {
        Some(("exit" | "signal", n)) => n.parse::<i32>().is_ok(),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Running,
    Ok,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageRecord {
    pub name: String,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Where a table was found; coordinates only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableDecision {
    pub sheet_index: u32,
    pub header_row: u32,
    pub first_data_row: u32,
    pub last_data_row: u32,
    pub column_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingDecision {
    pub table_index: u32,
    pub column_index: u32,
    /// `None` for a column the pipeline left unmapped
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "NormalizedScore::is_empty")]
    pub score: NormalizedScore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationIssue {
    pub row: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    pub code: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactSummary {
    pub tables: u32,
    pub mapped_columns: u32,
    pub unmapped_columns: u32,
    pub issues_info: u32,
    pub issues_warning: u32,
    pub issues_error: u32,
    pub stages_ok: u32,
    pub stages_failed: u32,
}

/// Why the run failed, in taxonomy terms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactError {
    #[serde(flatten)]
    pub failure: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Short exit description such as `exit 1` or `signal 9`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Artifact {
    pub schema: String,
    pub job_id: String,
    pub status: ArtifactStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub dependencies: Vec<InstalledDependency>,
    #[serde(default)]
    pub stages: Vec<StageRecord>,
    #[serde(default)]
    pub tables: Vec<TableDecision>,
    #[serde(default)]
    pub mappings: Vec<MappingDecision>,
    #[serde(default)]
    pub issues: Vec<ValidationIssue>,
    #[serde(default)]
    pub summary: ArtifactSummary,
    /// Protocol records rejected at the boundary
    #[serde(default)]
    pub dropped_records: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ArtifactError>,
}

impl Artifact {
    pub fn new(job_id: &str) -> Self {
        Self {
            schema: ARTIFACT_SCHEMA.to_string(),
            job_id: job_id.to_string(),
            status: ArtifactStatus::InProgress,
            updated_at: Utc::now(),
            dependencies: Vec::new(),
            stages: Vec::new(),
            tables: Vec::new(),
            mappings: Vec::new(),
            issues: Vec::new(),
            summary: ArtifactSummary::default(),
            dropped_records: 0,
            error: None,
        }
    }

    /// Parse an artifact and check its schema tag
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let artifact: Artifact = serde_json::from_slice(bytes)?;
        if artifact.schema != ARTIFACT_SCHEMA {
            return Err(RuleboxError::Process(format!(
                "unexpected artifact schema {}",
                artifact.schema
            )));
        }
        Ok(artifact)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_slice(&bytes)
    }

    /// Load an artifact the sandbox could have rewritten. Anything the writer
    /// would have refused makes the whole file unusable.
    pub fn load_checked(path: &Path, job_id: &str, vocabulary: &FieldVocabulary) -> Result<Self> {
        let artifact = Self::load(path)?;
        if artifact.job_id != job_id {
            return Err(RuleboxError::Process(format!(
                "artifact belongs to job {}",
                artifact.job_id
            )));
        }
        if !artifact.conforms(vocabulary) {
            return Err(RuleboxError::Process(
                "artifact holds records the writer would reject".to_string(),
            ));
        }
        Ok(artifact)
    }

    /// True when every label and free-form slot matches what the writer admits
    pub fn conforms(&self, vocabulary: &FieldVocabulary) -> bool {
        let label_ok = |l: &Option<String>| l.as_deref().map_or(true, is_valid_label);
        let stages_ok = self
            .stages
            .iter()
            .all(|s| is_valid_label(&s.name) && label_ok(&s.code));
        let mappings_ok = self.mappings.iter().all(|m| {
            m.field.as_deref().map_or(true, |f| vocabulary.accepts(f))
                && m.score.best.map_or(true, f64::is_finite)
                && m
                    .score
                    .candidates
                    .iter()
                    .all(|(field, value)| vocabulary.accepts(field) && value.is_finite())
        });
        let issues_ok = self.issues.iter().all(|i| is_valid_label(&i.code));
        let dependencies_ok = self
            .dependencies
            .iter()
            .all(|d| is_valid_label(&d.name) && is_valid_version(&d.version));
        let error_ok = self.error.as_ref().map_or(true, |e| {
            label_ok(&e.stage) && label_ok(&e.code) && e.exit.as_deref().map_or(true, is_exit_detail)
        });
        stages_ok && mappings_ok && issues_ok && dependencies_ok && error_ok
    }

    fn recompute_summary(&mut self) {
        let mut summary = ArtifactSummary {
            tables: self.tables.len() as u32,
            ..Default::default()
        };
        for mapping in &self.mappings {
            if mapping.field.is_some() {
                summary.mapped_columns += 1;
            } else {
                summary.unmapped_columns += 1;
            }
        }
        for issue in &self.issues {
            match issue.severity {
                Severity::Info => summary.issues_info += 1,
                Severity::Warning => summary.issues_warning += 1,
                Severity::Error => summary.issues_error += 1,
            }
        }
        for stage in &self.stages {
            match stage.status {
                StageStatus::Ok => summary.stages_ok += 1,
                StageStatus::Failed => summary.stages_failed += 1,
                StageStatus::Running => {}
            }
        }
        self.summary = summary;
    }
}

/// In-memory artifact plus the file it checkpoints to
pub struct ArtifactWriter {
    path: PathBuf,
    artifact: Artifact,
    vocabulary: FieldVocabulary,
}

impl ArtifactWriter {
    pub fn new(path: &Path, job_id: &str, vocabulary: FieldVocabulary) -> Self {
        Self {
            path: path.to_path_buf(),
            artifact: Artifact::new(job_id),
            vocabulary,
        }
    }

    /// Continue from an existing checkpoint. One that is missing, foreign or
    /// fails [`Artifact::conforms`] is replaced by a fresh artifact.
    pub fn resume(path: &Path, job_id: &str, vocabulary: FieldVocabulary) -> Self {
        let artifact = match Artifact::load_checked(path, job_id, &vocabulary) {
            Ok(existing) => existing,
            Err(e) => {
                if path.exists() {
                    warn!("job {}: discarding checkpoint {}: {}", job_id, path.display(), e);
                }
                Artifact::new(job_id)
            }
        };
        Self {
            path: path.to_path_buf(),
            artifact,
            vocabulary,
        }
    }

    pub fn artifact(&self) -> &Artifact {
        &self.artifact
    }

    pub fn set_dependencies(&mut self, dependencies: Vec<InstalledDependency>) {
        self.artifact.dependencies = dependencies;
    }

    /// Count a record that was rejected before reaching the artifact
    pub fn drop_record(&mut self) {
        self.artifact.dropped_records += 1;
    }

    pub fn stage_started(&mut self, stage: &str) -> bool {
        if !is_valid_label(stage) {
            self.drop_record();
            return false;
        }
        self.artifact.stages.push(StageRecord {
            name: stage.to_string(),
            status: StageStatus::Running,
            code: None,
            started_at: Utc::now(),
            finished_at: None,
        });
        true
    }

    /// Close the most recent running record for `stage`; `code` marks a failure.
    pub fn stage_finished(&mut self, stage: &str, code: Option<&str>) -> bool {
        if !is_valid_label(stage) || code.is_some_and(|c| !is_valid_label(c)) {
            self.drop_record();
            return false;
        }
        let now = Utc::now();
        let status = if code.is_some() {
            StageStatus::Failed
        } else {
            StageStatus::Ok
        };

        let open = self
            .artifact
            .stages
            .iter_mut()
            .rev()
            .find(|s| s.name == stage && s.status == StageStatus::Running);
        match open {
            Some(record) => {
                record.status = status;
                record.code = code.map(str::to_string);
                record.finished_at = Some(now);
            }
            None => self.artifact.stages.push(StageRecord {
                name: stage.to_string(),
                status,
                code: code.map(str::to_string),
                started_at: now,
                finished_at: Some(now),
            }),
        }
        true
    }

    pub fn add_table(&mut self, table: TableDecision) -> bool {
        let coherent = table.first_data_row <= table.last_data_row
            && table.header_row < table.first_data_row
            && table.column_count > 0;
        if !coherent {
            self.drop_record();
            return false;
        }
        self.artifact.tables.push(table);
        true
    }

    /// Record a column decision; the field must belong to the vocabulary.
    pub fn add_mapping(
        &mut self,
        table_index: u32,
        column_index: u32,
        field: Option<&str>,
        score: Option<&ScoreValue>,
    ) -> bool {
        let table_known = (table_index as usize) < self.artifact.tables.len();
        let field_ok = field.map_or(true, |f| self.vocabulary.accepts(f));
        if !table_known || !field_ok {
            self.drop_record();
            return false;
        }
        let score = score
            .map(|s| normalize(s, field, &self.vocabulary))
            .unwrap_or_default();
        self.artifact.mappings.push(MappingDecision {
            table_index,
            column_index,
            field: field.map(str::to_string),
            score,
        });
        true
    }

    pub fn add_issue(
        &mut self,
        row: u32,
        column: Option<u32>,
        code: &str,
        severity: Severity,
    ) -> bool {
        if !is_valid_label(code) {
            self.drop_record();
            return false;
        }
        self.artifact.issues.push(ValidationIssue {
            row,
            column,
            code: code.to_string(),
            severity,
        });
        true
    }

    pub fn mark_succeeded(&mut self) {
        self.artifact.status = ArtifactStatus::Succeeded;
        self.artifact.error = None;
    }

    /// Record a failure. The first recorded error wins; later callers only
    /// fill in details that are still missing.
    pub fn mark_failed(&mut self, error: ArtifactError) {
        self.artifact.status = ArtifactStatus::Failed;
        match &mut self.artifact.error {
            Some(existing) => {
                if existing.stage.is_none() {
                    existing.stage = error.stage;
                }
                if existing.code.is_none() {
                    existing.code = error.code;
                }
                if existing.exit.is_none() {
                    existing.exit = error.exit;
                }
            }
            None => self.artifact.error = Some(error),
        }
        for stage in &mut self.artifact.stages {
            if stage.status == StageStatus::Running {
                stage.status = StageStatus::Failed;
            }
        }
    }

    /// Write the current state atomically
    pub fn checkpoint(&mut self) -> Result<()> {
        self.artifact.updated_at = Utc::now();
        self.artifact.recompute_summary();
        write_json_atomic(&self.path, &self.artifact)?;
        debug!(
            "artifact checkpoint for job {} ({:?})",
            self.artifact.job_id, self.artifact.status
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ResourceKind;
    use std::collections::BTreeMap;

    fn writer(dir: &Path) -> ArtifactWriter {
        ArtifactWriter::new(
            &dir.join("artifact.json"),
            "job-1",
            FieldVocabulary::new(&["first_name".to_string(), "email".to_string()]),
        )
    }

    fn table() -> TableDecision {
        TableDecision {
            sheet_index: 0,
            header_row: 0,
            first_data_row: 1,
            last_data_row: 3,
            column_count: 3,
        }
    }

    #[test]
    fn checkpoint_round_trips_with_summary() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(dir.path());
        assert!(w.stage_started("detect_tables"));
        assert!(w.add_table(table()));
        assert!(w.stage_finished("detect_tables", None));
        assert!(w.add_mapping(0, 0, Some("first_name"), Some(&ScoreValue::Scalar(0.9))));
        assert!(w.add_mapping(0, 1, Some("email"), None));
        assert!(w.add_mapping(0, 2, None, None));
        assert!(w.add_issue(2, Some(1), "invalid_email", Severity::Warning));
        w.mark_succeeded();
        w.checkpoint().unwrap();

        let loaded = Artifact::load(&dir.path().join("artifact.json")).unwrap();
        assert_eq!(loaded.status, ArtifactStatus::Succeeded);
        assert_eq!(loaded.summary.tables, 1);
        assert_eq!(loaded.summary.mapped_columns, 2);
        assert_eq!(loaded.summary.unmapped_columns, 1);
        assert_eq!(loaded.summary.issues_warning, 1);
        assert_eq!(loaded.summary.stages_ok, 1);
        assert_eq!(loaded.mappings[0].score.best, Some(0.9));
    }

    #[test]
    fn out_of_vocabulary_and_free_text_records_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(dir.path());
        w.add_table(table());
        assert!(!w.add_mapping(0, 0, Some("ssn"), None));
        assert!(!w.add_mapping(5, 0, Some("email"), None));
        assert!(!w.add_issue(1, None, "value 'John Smith' is not valid", Severity::Error));
        assert!(!w.stage_started("stage with spaces"));
        assert_eq!(w.artifact().dropped_records, 4);
        assert!(w.artifact().mappings.is_empty());
        assert!(w.artifact().issues.is_empty());
    }

    #[test]
    fn incoherent_table_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(dir.path());
        let mut bad = table();
        bad.first_data_row = 5;
        assert!(!w.add_table(bad));
        assert_eq!(w.artifact().dropped_records, 1);
    }

    #[test]
    fn map_scores_drop_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(dir.path());
        w.add_table(table());
        let mut map = BTreeMap::new();
        map.insert("email".to_string(), 0.5);
        map.insert("secret_field".to_string(), 0.9);
        w.add_mapping(0, 1, Some("email"), Some(&ScoreValue::ByField(map)));
        let score = &w.artifact().mappings[0].score;
        assert_eq!(score.candidates.len(), 1);
        assert_eq!(score.best, Some(0.5));
    }

    #[test]
    fn failure_closes_running_stages_and_keeps_first_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(dir.path());
        w.stage_started("map_columns");
        w.mark_failed(ArtifactError {
            failure: FailureKind::ResourceLimitExceeded {
                resource: ResourceKind::Cpu,
            },
            stage: Some("map_columns".to_string()),
            code: None,
            exit: None,
        });
        w.mark_failed(ArtifactError {
            failure: FailureKind::UserCodeException,
            stage: None,
            code: None,
            exit: Some("exit 11".to_string()),
        });
        w.checkpoint().unwrap();

        let loaded = Artifact::load(&dir.path().join("artifact.json")).unwrap();
        let error = loaded.error.unwrap();
        assert_eq!(
            error.failure,
            FailureKind::ResourceLimitExceeded {
                resource: ResourceKind::Cpu
            }
        );
        assert_eq!(error.exit.as_deref(), Some("exit 11"));
        assert_eq!(loaded.stages[0].status, StageStatus::Failed);
        assert_eq!(loaded.summary.stages_failed, 1);
    }

    #[test]
    fn error_entry_flattens_failure_kind() {
        let error = ArtifactError {
            failure: FailureKind::Timeout,
            stage: None,
            code: None,
            exit: Some("signal 9".to_string()),
        };
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["exit"], "signal 9");
    }

    #[test]
    fn resume_keeps_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(dir.path());
        w.stage_started("detect_tables");
        w.checkpoint().unwrap();

        let path = dir.path().join("artifact.json");
        let resumed = ArtifactWriter::resume(&path, "job-1", FieldVocabulary::default());
        assert_eq!(resumed.artifact().stages.len(), 1);

        let other = ArtifactWriter::resume(&path, "job-2", FieldVocabulary::default());
        assert!(other.artifact().stages.is_empty());
    }

    fn rewritten(dir: &Path, json: serde_json::Value) -> ArtifactWriter {
        let path = dir.join("artifact.json");
        std::fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();
        let vocabulary = FieldVocabulary::new(&["email".to_string(), "phone".to_string()]);
        ArtifactWriter::resume(&path, "job-1", vocabulary)
    }

    fn base(extra: serde_json::Value) -> serde_json::Value {
        let mut json = serde_json::json!({
            "schema": ARTIFACT_SCHEMA,
            "job_id": "job-1",
            "status": "in_progress",
            "updated_at": "2024-01-01T00:00:00Z",
        });
        for (key, value) in extra.as_object().unwrap() {
            json[key] = value.clone();
        }
        json
    }

    #[test]
    fn resume_discards_checkpoints_the_writer_would_refuse() {
        let dir = tempfile::tempdir().unwrap();
        let secret = "ada.lovelace@private.example";
        let hostile = [
            serde_json::json!({"stages": [{"name": secret, "status": "running",
                "started_at": "2024-01-01T00:00:00Z"}]}),
            serde_json::json!({"issues": [{"row": 1, "code": secret, "severity": "error"}]}),
            serde_json::json!({"tables": [{"sheet_index": 0, "header_row": 0, "first_data_row": 1,
                "last_data_row": 2, "column_count": 1}],
                "mappings": [{"table_index": 0, "column_index": 0, "field": "salary"}]}),
            serde_json::json!({"mappings": [{"table_index": 0, "column_index": 0, "field": "email",
                "score": {"candidates": {secret: 0.5}}}]}),
            serde_json::json!({"dependencies": [{"name": "openpyxl", "version": secret}]}),
            serde_json::json!({"error": {"kind": "timeout", "exit": secret}}),
            serde_json::json!({"note": secret}),
        ];
        for extra in hostile {
            let writer = rewritten(dir.path(), base(extra.clone()));
            assert_eq!(writer.artifact(), &Artifact {
                updated_at: writer.artifact().updated_at,
                ..Artifact::new("job-1")
            }, "{}", extra);
        }
    }

    #[test]
    fn resume_keeps_a_conforming_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = rewritten(
            dir.path(),
            base(serde_json::json!({
                "stages": [{"name": "detect_table", "status": "running",
                    "started_at": "2024-01-01T00:00:00Z"}],
                "dependencies": [{"name": "openpyxl", "version": "3.1.2"}],
                "dropped_records": 2,
            })),
        );
        assert_eq!(writer.artifact().stages.len(), 1);
        assert_eq!(writer.artifact().dropped_records, 2);

        writer.mark_failed(ArtifactError {
            failure: FailureKind::Timeout,
            stage: None,
            code: None,
            exit: Some("signal 9".to_string()),
        });
        writer.checkpoint().unwrap();
        let vocabulary = FieldVocabulary::new(&["email".to_string()]);
        assert!(Artifact::load_checked(&dir.path().join("artifact.json"), "job-1", &vocabulary).is_ok());
    }

    #[test]
    fn wrong_schema_is_rejected() {
        let mut artifact = Artifact::new("j");
        artifact.schema = "something.else".to_string();
        let bytes = serde_json::to_vec(&artifact).unwrap();
        assert!(Artifact::from_slice(&bytes).is_err());
    }
}
