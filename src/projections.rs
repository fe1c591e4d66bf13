use std::collections::BTreeMap;

use serde_json::Value;

use crate::models::{Aggregates, ModuleSummary, QuestionScore, ResponseRecord};

/// Default cap on records scanned per aggregation.
pub const MAX_SCANNED_RECORDS: usize = 10_000;

const EMPLOYEE_THRESHOLD: f64 = 7.0;
const DEFAULT_THRESHOLD: f64 = 4.0;

/// The three fixed survey modules questions are routed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurveyModule {
    AiReadiness,
    Leadership,
    EmployeeExperience,
}

impl SurveyModule {
    /// Route a question id by prefix. Unknown prefixes belong to no module.
    pub fn for_question(question_id: &str) -> Option<Self> {
        if question_id.starts_with("ai-") {
            Some(SurveyModule::AiReadiness)
        } else if question_id.starts_with("leadership-") {
            Some(SurveyModule::Leadership)
        } else if question_id.starts_with("ee-") || question_id.starts_with("employee") {
            Some(SurveyModule::EmployeeExperience)
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SurveyModule::AiReadiness => "ai-readiness",
            SurveyModule::Leadership => "leadership",
            SurveyModule::EmployeeExperience => "employee-experience",
        }
    }
}

/// Minimum value counted as favorable for a question.
///
/// Decided on the text before the first hyphen, so `employeeX-1` routes to
/// employee-experience but still uses the default threshold.
pub fn positive_threshold(question_id: &str) -> f64 {
    match question_id.split('-').next() {
        Some("ee") | Some("employee") => EMPLOYEE_THRESHOLD,
        _ => DEFAULT_THRESHOLD,
    }
}

/// Coerce a submitted answer to a number. Non-finite results are rejected.
pub fn numeric_value(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Some(0.0);
            }
            trimmed.parse::<f64>().ok()?
        }
        Value::Bool(b) => f64::from(u8::from(*b)),
        // a blank answer counts as zero
        Value::Null => 0.0,
        Value::Array(_) | Value::Object(_) => return None,
    };
    number.is_finite().then_some(number)
}

/// Round to one decimal place.
pub fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Running totals for one question id.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuestionStat {
    pub sum: f64,
    pub count: usize,
    pub positive_count: usize,
}

impl QuestionStat {
    fn record(&mut self, value: f64, threshold: f64) {
        self.sum += value;
        self.count += 1;
        if value >= threshold {
            self.positive_count += 1;
        }
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn positive_percentage(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            round_tenth(self.positive_count as f64 / self.count as f64 * 100.0)
        }
    }
}

/// Projects per-module survey aggregates from stored responses.
///
/// Stateless: every call recomputes from the records it is given.
pub struct AggregateProjector {
    stats: BTreeMap<String, QuestionStat>,
    scanned: usize,
}

impl AggregateProjector {
    pub fn new() -> Self {
        Self {
            stats: BTreeMap::new(),
            scanned: 0,
        }
    }

    pub fn project<'a, I>(records: I) -> Aggregates
    where
        I: IntoIterator<Item = &'a ResponseRecord>,
    {
        let mut projector = Self::new();
        for record in records {
            projector.ingest(record);
        }
        projector.finish()
    }

    pub fn ingest(&mut self, record: &ResponseRecord) {
        self.scanned += 1;

        for (question_id, raw) in &record.answers {
            let Some(value) = numeric_value(raw) else {
                continue;
            };
            self.stats
                .entry(question_id.clone())
                .or_default()
                .record(value, positive_threshold(question_id));
        }
    }

    pub fn finish(self) -> Aggregates {
        let mut aggregates = Aggregates {
            ai_readiness: ModuleSummary::empty(self.scanned),
            leadership: ModuleSummary::empty(self.scanned),
            employee_experience: ModuleSummary::empty(self.scanned),
        };

        for (question_id, stat) in self.stats {
            let Some(module) = SurveyModule::for_question(&question_id) else {
                continue;
            };
            let score = QuestionScore {
                average: stat.average(),
                positive_percentage: stat.positive_percentage(),
                question_id,
            };
            module_mut(&mut aggregates, module).question_scores.push(score);
        }

        for summary in [
            &mut aggregates.ai_readiness,
            &mut aggregates.leadership,
            &mut aggregates.employee_experience,
        ] {
            roll_up(summary);
        }

        aggregates
    }
}

impl Default for AggregateProjector {
    fn default() -> Self {
        Self::new()
    }
}

pub fn module_mut(aggregates: &mut Aggregates, module: SurveyModule) -> &mut ModuleSummary {
    match module {
        SurveyModule::AiReadiness => &mut aggregates.ai_readiness,
        SurveyModule::Leadership => &mut aggregates.leadership,
        SurveyModule::EmployeeExperience => &mut aggregates.employee_experience,
    }
}

fn roll_up(summary: &mut ModuleSummary) {
    let scores = &summary.question_scores;
    summary.summary_metrics.total_questions = scores.len();
    summary.summary_metrics.positive_average = if scores.is_empty() {
        0.0
    } else {
        let mean = scores.iter().map(|q| q.positive_percentage).sum::<f64>() / scores.len() as f64;
        round_tenth(mean + f64::EPSILON)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Answers;
    use chrono::Utc;
    use serde_json::json;

    fn record(answers: Value) -> ResponseRecord {
        let answers: Answers = serde_json::from_value(answers).unwrap();
        ResponseRecord {
            id: "r".to_string(),
            company_id: "c1".to_string(),
            survey_id: "s1".to_string(),
            respondent_id: None,
            answers,
            created_at: Utc::now(),
        }
    }

    fn score<'a>(summary: &'a ModuleSummary, question_id: &str) -> &'a QuestionScore {
        summary
            .question_scores
            .iter()
            .find(|q| q.question_id == question_id)
            .unwrap()
    }

    #[test]
    fn test_empty_input_yields_zeroed_modules() {
        let records: Vec<ResponseRecord> = Vec::new();
        let aggregates = AggregateProjector::project(&records);

        for summary in [
            &aggregates.ai_readiness,
            &aggregates.leadership,
            &aggregates.employee_experience,
        ] {
            assert!(summary.question_scores.is_empty());
            assert_eq!(summary.summary_metrics.total_questions, 0);
            assert_eq!(summary.summary_metrics.positive_average, 0.0);
            assert_eq!(summary.summary_metrics.response_count, 0);
        }
    }

    #[test]
    fn test_ai_example_half_positive() {
        let records = vec![record(json!({"ai-1": 8, "ai-2": 2}))];
        let aggregates = AggregateProjector::project(&records);
        let ai = &aggregates.ai_readiness;

        assert_eq!(ai.question_scores.len(), 2);
        assert_eq!(score(ai, "ai-1").positive_percentage, 100.0);
        assert_eq!(score(ai, "ai-2").positive_percentage, 0.0);
        assert_eq!(ai.summary_metrics.positive_average, 50.0);
        assert_eq!(ai.summary_metrics.total_questions, 2);
        assert_eq!(ai.summary_metrics.response_count, 1);
    }

    #[test]
    fn test_employee_threshold_boundary() {
        let records = vec![record(json!({"ee-1": 7, "employee-2": 6}))];
        let aggregates = AggregateProjector::project(&records);
        let ee = &aggregates.employee_experience;

        assert_eq!(score(ee, "ee-1").positive_percentage, 100.0);
        assert_eq!(score(ee, "employee-2").positive_percentage, 0.0);
    }

    #[test]
    fn test_default_threshold_boundary() {
        let records = vec![record(json!({"leadership-1": 4, "leadership-2": 3}))];
        let aggregates = AggregateProjector::project(&records);
        let lead = &aggregates.leadership;

        assert_eq!(score(lead, "leadership-1").positive_percentage, 100.0);
        assert_eq!(score(lead, "leadership-2").positive_percentage, 0.0);
    }

    #[test]
    fn test_threshold_uses_prefix_before_first_hyphen() {
        assert_eq!(positive_threshold("ee-1"), 7.0);
        assert_eq!(positive_threshold("employee-engagement-3"), 7.0);
        assert_eq!(positive_threshold("employeeX-1"), 4.0);
        assert_eq!(positive_threshold("ai-1"), 4.0);
        assert_eq!(positive_threshold("free"), 4.0);
    }

    #[test]
    fn test_module_routing() {
        assert_eq!(SurveyModule::for_question("ai-1"), Some(SurveyModule::AiReadiness));
        assert_eq!(SurveyModule::for_question("leadership-2"), Some(SurveyModule::Leadership));
        assert_eq!(SurveyModule::for_question("ee-3"), Some(SurveyModule::EmployeeExperience));
        assert_eq!(SurveyModule::for_question("employeeX-1"), Some(SurveyModule::EmployeeExperience));
        assert_eq!(SurveyModule::for_question("ai"), None);
        assert_eq!(SurveyModule::for_question("culture-1"), None);
        assert_eq!(SurveyModule::EmployeeExperience.name(), "employee-experience");
    }

    #[test]
    fn test_unclassified_questions_dropped() {
        let records = vec![record(json!({"culture-1": 9, "ai-1": 5}))];
        let aggregates = AggregateProjector::project(&records);

        assert_eq!(aggregates.ai_readiness.question_scores.len(), 1);
        assert!(aggregates.leadership.question_scores.is_empty());
        assert!(aggregates.employee_experience.question_scores.is_empty());
    }

    #[test]
    fn test_non_numeric_answer_counts_response_only() {
        let records = vec![
            record(json!({"ai-1": "n/a"})),
            record(json!({"ai-1": "6", "ai-2": {"v": 1}})),
        ];
        let aggregates = AggregateProjector::project(&records);
        let ai = &aggregates.ai_readiness;

        assert_eq!(ai.summary_metrics.response_count, 2);
        assert_eq!(ai.question_scores.len(), 1);
        assert_eq!(score(ai, "ai-1").average, 6.0);
        assert_eq!(aggregates.leadership.summary_metrics.response_count, 2);
    }

    #[test]
    fn test_null_answer_scores_zero() {
        let records = vec![record(json!({"ai-1": null})), record(json!({"ai-1": 8}))];
        let aggregates = AggregateProjector::project(&records);
        let ai = score(&aggregates.ai_readiness, "ai-1");

        assert_eq!(ai.average, 4.0);
        assert_eq!(ai.positive_percentage, 50.0);
    }

    #[test]
    fn test_averages_and_rounding() {
        let records = vec![
            record(json!({"ai-1": 5})),
            record(json!({"ai-1": 1})),
            record(json!({"ai-1": 3})),
        ];
        let aggregates = AggregateProjector::project(&records);
        let ai = score(&aggregates.ai_readiness, "ai-1");

        assert_eq!(ai.average, 3.0);
        // 1 of 3 positive
        assert_eq!(ai.positive_percentage, 33.3);
    }

    #[test]
    fn test_positive_average_is_mean_of_percentages() {
        let records = vec![
            record(json!({"ee-1": 9, "ee-2": 8, "ee-3": 1})),
            record(json!({"ee-1": 2, "ee-2": 8, "ee-3": 1})),
            record(json!({"ee-1": 10, "ee-2": 8, "ee-3": 1})),
        ];
        let aggregates = AggregateProjector::project(&records);
        let metrics = &aggregates.employee_experience.summary_metrics;

        // (66.7 + 100 + 0) / 3
        assert_eq!(metrics.positive_average, 55.6);
        assert_eq!(metrics.total_questions, 3);
    }

    #[test]
    fn test_question_scores_ordered_by_id() {
        let records = vec![record(json!({"ai-b": 4, "ai-a": 4, "ai-c": 4}))];
        let aggregates = AggregateProjector::project(&records);
        let ids: Vec<_> = aggregates
            .ai_readiness
            .question_scores
            .iter()
            .map(|q| q.question_id.as_str())
            .collect();
        assert_eq!(ids, vec!["ai-a", "ai-b", "ai-c"]);
    }

    #[test]
    fn test_numeric_value_coercion() {
        assert_eq!(numeric_value(&json!(3)), Some(3.0));
        assert_eq!(numeric_value(&json!(2.5)), Some(2.5));
        assert_eq!(numeric_value(&json!(" 7 ")), Some(7.0));
        assert_eq!(numeric_value(&json!(true)), Some(1.0));
        assert_eq!(numeric_value(&json!("n/a")), None);
        assert_eq!(numeric_value(&json!("")), Some(0.0));
        assert_eq!(numeric_value(&json!("   ")), Some(0.0));
        assert_eq!(numeric_value(&json!("Infinity")), None);
        assert_eq!(numeric_value(&json!("NaN")), None);
        assert_eq!(numeric_value(&json!(null)), Some(0.0));
        assert_eq!(numeric_value(&json!([1])), None);
    }

    #[test]
    fn test_positive_percentage_in_range() {
        let records: Vec<_> = (0..11)
            .map(|v| record(json!({"ai-1": v, "ee-1": v, "leadership-1": v})))
            .collect();
        let aggregates = AggregateProjector::project(&records);

        for summary in [
            &aggregates.ai_readiness,
            &aggregates.leadership,
            &aggregates.employee_experience,
        ] {
            for q in &summary.question_scores {
                assert!((0.0..=100.0).contains(&q.positive_percentage));
                assert_eq!(q.positive_percentage, round_tenth(q.positive_percentage));
            }
        }
    }
}
