use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::AppError;

/// Raw submission body from the API.
///
/// Both the `answers` mapping and the legacy `question`/`response` pair are
/// accepted here; [`SubmissionInput::answer_input`] resolves which one was sent.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionInput {
    #[serde(default)]
    pub company_id: Option<Value>,
    #[serde(default)]
    pub survey_id: Option<Value>,
    #[serde(default)]
    pub respondent_id: Option<Value>,
    #[serde(default)]
    pub answers: Option<Value>,
    #[serde(default)]
    pub question: Option<Value>,
    /// `Some(Value::Null)` when the client sent an explicit `null`.
    #[serde(default, deserialize_with = "explicit_value")]
    pub response: Option<Value>,
}

fn explicit_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// The two answer shapes a client may submit.
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerInput {
    Mapping(serde_json::Map<String, Value>),
    Legacy { question: String, response: Value },
}

impl AnswerInput {
    /// Normalize to the single mapping shape used for storage and aggregation.
    pub fn into_answers(self) -> Answers {
        match self {
            AnswerInput::Mapping(map) => map.into_iter().collect(),
            AnswerInput::Legacy { question, response } => {
                let mut answers = Answers::new();
                answers.insert(question, response);
                answers
            }
        }
    }
}

/// Question id -> submitted value, exactly as the client sent it.
pub type Answers = BTreeMap<String, Value>;

impl SubmissionInput {
    /// Resolve which answer shape was sent. `answers` wins over the legacy pair.
    pub fn answer_input(&self) -> Result<AnswerInput, AppError> {
        match &self.answers {
            Some(Value::Object(map)) => Ok(AnswerInput::Mapping(map.clone())),
            Some(Value::Null) | None => {
                let question = self
                    .question
                    .as_ref()
                    .and_then(id_string)
                    .ok_or(AppError::MissingFields)?;
                let response = self.response.clone().ok_or(AppError::MissingFields)?;
                Ok(AnswerInput::Legacy { question, response })
            }
            Some(_) => Err(AppError::MalformedAnswers),
        }
    }
}

/// Stringify an opaque identifier. Strings and numbers are accepted;
/// empty strings, null, booleans and containers count as absent.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A stored survey response. Immutable once inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub id: String,
    pub company_id: String,
    pub survey_id: String,
    pub respondent_id: Option<String>,
    pub answers: Answers,
    pub created_at: DateTime<Utc>,
}

/// Optional company/survey restriction for record lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFilter {
    #[serde(default)]
    pub company_id: Option<String>,
    #[serde(default)]
    pub survey_id: Option<String>,
}

impl ResponseFilter {
    /// Empty query values mean "no restriction".
    pub fn normalized(self) -> Self {
        Self {
            company_id: self.company_id.filter(|s| !s.is_empty()),
            survey_id: self.survey_id.filter(|s| !s.is_empty()),
        }
    }

    pub fn matches(&self, record: &ResponseRecord) -> bool {
        self.company_id.as_ref().map_or(true, |c| *c == record.company_id)
            && self.survey_id.as_ref().map_or(true, |s| *s == record.survey_id)
    }
}

/// Body of `POST /api/login`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginInput {
    #[serde(default)]
    pub company_id: Option<Value>,
}

/// "Something changed" notice fanned out after a successful submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub survey_id: String,
    pub company_id: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&ResponseRecord> for ChangeEvent {
    fn from(record: &ResponseRecord) -> Self {
        Self {
            survey_id: record.survey_id.clone(),
            company_id: record.company_id.clone(),
            timestamp: record.created_at,
        }
    }
}

/// Per-question score inside a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionScore {
    pub question_id: String,
    pub average: f64,
    pub positive_percentage: f64,
}

/// Roll-up for one module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryMetrics {
    pub positive_average: f64,
    pub total_questions: usize,
    pub response_count: usize,
    pub trend: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSummary {
    pub question_scores: Vec<QuestionScore>,
    pub section_data: Vec<Value>,
    pub summary_metrics: SummaryMetrics,
}

impl ModuleSummary {
    pub fn empty(response_count: usize) -> Self {
        Self {
            summary_metrics: SummaryMetrics {
                response_count,
                ..SummaryMetrics::default()
            },
            ..Self::default()
        }
    }
}

/// The three fixed module summaries, keyed by module name on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregates {
    #[serde(rename = "ai-readiness")]
    pub ai_readiness: ModuleSummary,
    pub leadership: ModuleSummary,
    #[serde(rename = "employee-experience")]
    pub employee_experience: ModuleSummary,
}

/// `GET /api/aggregates` body
#[derive(Debug, Serialize, Deserialize)]
pub struct AggregatesResponse {
    pub ok: bool,
    pub aggregates: Aggregates,
}

/// `POST /api/responses` body
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmissionResponse {
    pub ok: bool,
    pub response: ResponseRecord,
}
