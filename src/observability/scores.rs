/// Normalization of mapping scores reported by rule code
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Score as it arrives on the wire: a bare number or per-field numbers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScoreValue {
    Scalar(f64),
    ByField(BTreeMap<String, f64>),
}

/// Fixed record shape written to the artifact
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NormalizedScore {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub candidates: BTreeMap<String, f64>,
}

impl NormalizedScore {
    pub fn is_empty(&self) -> bool {
        self.best.is_none() && self.candidates.is_empty()
    }
}

/// Labels allowed in the artifact: `[A-Za-z0-9_.-]{1,64}`
pub fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 64
        && label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// Closed set of field labels a rule package declares
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldVocabulary {
    fields: Vec<String>,
}

impl FieldVocabulary {
    pub fn new(fields: &[String]) -> Self {
        let mut fields: Vec<String> = fields
            .iter()
            .filter(|f| is_valid_label(f))
            .cloned()
            .collect();
        fields.sort();
        fields.dedup();
        Self { fields }
    }

    /// An empty vocabulary accepts any well-formed label.
    pub fn accepts(&self, label: &str) -> bool {
        is_valid_label(label)
            && (self.fields.is_empty()
                || self
                    .fields
                    .binary_search_by(|f| f.as_str().cmp(label))
                    .is_ok())
    }
}

/// Reduce a wire score to `{best, candidates}`.
///
/// Non-finite numbers and labels outside the vocabulary are dropped. `best` is
/// the mapped field's candidate when there is one, otherwise the highest candidate.
pub fn normalize(
    score: &ScoreValue,
    field: Option<&str>,
    vocabulary: &FieldVocabulary,
) -> NormalizedScore {
    match score {
        ScoreValue::Scalar(value) => NormalizedScore {
            best: value.is_finite().then_some(*value),
            candidates: BTreeMap::new(),
        },
        ScoreValue::ByField(map) => {
            let candidates: BTreeMap<String, f64> = map
                .iter()
                .filter(|(label, value)| value.is_finite() && vocabulary.accepts(label))
                .map(|(label, value)| (label.clone(), *value))
                .collect();

            let best = field
                .and_then(|f| candidates.get(f).copied())
                .or_else(|| candidates.values().copied().reduce(f64::max));

            NormalizedScore { best, candidates }
        }
    }
}
