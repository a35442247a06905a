//! Request classification and entity extraction.
//!
//! Keyword and regex rules run first. Only when none match does the orchestrator ask the
//! language model for a structured classification ([`ModelClassification`]); without a model
//! the request is GENERAL.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::shared::{ActionType, Entities, Environment, Intent, QueryKind};

static ACTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:please\s+|can\s+you\s+|could\s+you\s+)?(re-?run|restart|hold|release|cancel|execute|submit|run|kill)\b",
    )
    .expect("action pattern is valid")
});

static JOB_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bjobs?\s+(?:named\s+|called\s+)?([A-Za-z0-9_#.\-]+)").expect("job pattern is valid")
});

static JOB_LIST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:of|between|for|jobs?)\s+(?:jobs?\s+)?([A-Za-z0-9_#.\-]+(?:\s*(?:,|\band\b)\s*(?:jobs?\s+)?[A-Za-z0-9_#.\-]+)+)",
    )
    .expect("job list pattern is valid")
});

static LIST_SPLIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*(?:,|\band\b)\s*(?:jobs?\s+)?").expect("split pattern is valid"));

static WORKSTATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:workstation|agent|server)\s+([A-Za-z0-9_\-]+)").expect("workstation pattern is valid")
});

static ERROR_CODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:rc|return\s+code|error\s+code|abend(?:\s+code)?)\s*[=:]?\s*([A-Za-z]?\d{1,5}[A-Za-z]?)\b")
        .expect("error code pattern is valid")
});

static ENVIRONMENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:in|on|against)\s+(prod|production|test|qa|uat|staging|dev|development)\b|\b(prod|production|test|qa|uat|staging|dev|development)\s+(?:env|environment)\b",
    )
    .expect("environment pattern is valid")
});

static LIMIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\btop\s+(\d{1,3})\b").expect("limit pattern is valid"));

/// Upper-case identifiers with a digit or underscore (`PAYROLL_DAILY`, `ETL01`).
static BARE_JOB_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([A-Z][A-Z0-9#.\-]*(?:_[A-Z0-9#.\-]+)+|[A-Z]+[0-9][A-Z0-9_#.\-]*)\b")
        .expect("identifier pattern is valid")
});

static SINGLE_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_#.\-]+$").expect("token pattern is valid"));

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "that", "this", "these", "those", "which", "in", "on",
    "for", "of", "to", "and", "with", "status", "failed", "failing", "running", "depend",
    "depends", "that's", "have", "has", "did", "do", "does", "named", "called",
];

const TROUBLESHOOT_WORDS: &[&str] = &[
    "why", "fail", "abend", "error", "troubleshoot", "diagnose", "broken", "root cause",
];

const STATUS_WORDS: &[&str] = &[
    "status", "state of", "is job", "running", "did job", "how is", "check job", "progress",
];

pub const CLASSIFIER_SYSTEM_PROMPT: &str = "You classify operator requests for a workload automation system. \
Reply with one JSON object: {\"intent\": \"STATUS|TROUBLESHOOT|QUERY|ACTION|GENERAL\", \"job\": string|null, \
\"workstation\": string|null, \"error_code\": string|null, \"action\": \"rerun|hold|release|cancel|execute|kill\"|null, \
\"environment\": \"production|test|development\"|null, \
\"query\": \"dependencies|impact|critical_jobs|common_dependencies|workstations\"|null}. No prose.";

fn is_stopword(token: &str) -> bool {
    STOPWORDS.iter().any(|s| s.eq_ignore_ascii_case(token))
}

fn clean(token: &str) -> Option<String> {
    let t = token.trim_matches(|c: char| c == '.' || c == '-');
    (!t.is_empty() && !is_stopword(t)).then(|| t.to_string())
}

fn parse_environment(word: &str) -> Option<Environment> {
    match word.to_ascii_lowercase().as_str() {
        "prod" | "production" => Some(Environment::Production),
        "test" | "qa" | "uat" | "staging" => Some(Environment::Test),
        "dev" | "development" => Some(Environment::Development),
        _ => None,
    }
}

fn query_kind(lower: &str) -> Option<QueryKind> {
    if lower.contains("common dependenc") || lower.contains("shared dependenc") || lower.contains("in common") {
        Some(QueryKind::CommonDependencies)
    } else if lower.contains("critical job") || lower.contains("most critical") || lower.contains("most depended") {
        Some(QueryKind::CriticalJobs)
    } else if lower.contains("impact")
        || lower.contains("downstream")
        || lower.contains("what depends on")
        || lower.contains("who depends on")
        || lower.contains("affected")
    {
        Some(QueryKind::Impact)
    } else if lower.contains("depend")
        || lower.contains("upstream")
        || lower.contains("predecessor")
        || lower.contains("prerequisite")
    {
        Some(QueryKind::Dependencies)
    } else if lower.contains("workstation") || lower.contains("runs on") || lower.contains("where does") {
        Some(QueryKind::Workstations)
    } else {
        None
    }
}

/// A single bare identifier: the whole reply (`PAYROLL_DAILY`) or an upper-case job-like token.
pub fn bare_identifier(text: &str) -> Option<String> {
    let trimmed = text.trim().trim_end_matches(['.', '!', '?']);
    if SINGLE_TOKEN_RE.is_match(trimmed) {
        return clean(trimmed);
    }
    BARE_JOB_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1).and_then(|m| clean(m.as_str())))
        .next()
}

/// Everything the rules can find in `text`.
pub fn extract_entities(text: &str) -> Entities {
    let mut entities = Entities::default();

    let mut jobs: Vec<String> = Vec::new();
    if let Some(list) = JOB_LIST_RE.captures(text).and_then(|c| c.get(1)) {
        for part in LIST_SPLIT_RE.split(list.as_str()) {
            if let Some(job) = clean(part) {
                if !jobs.contains(&job) {
                    jobs.push(job);
                }
            }
        }
    }
    if jobs.is_empty() {
        if let Some(job) = JOB_RE
            .captures_iter(text)
            .filter_map(|c| c.get(1).and_then(|m| clean(m.as_str())))
            .next()
        {
            jobs.push(job);
        }
    }
    if jobs.is_empty() {
        if let Some(job) = BARE_JOB_RE
            .captures_iter(text)
            .filter_map(|c| c.get(1).and_then(|m| clean(m.as_str())))
            .next()
        {
            jobs.push(job);
        }
    }
    let mut iter = jobs.into_iter();
    entities.job = iter.next();
    entities.jobs = iter.collect();

    entities.workstation = WORKSTATION_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| clean(m.as_str()))
        .map(|w| w.to_ascii_uppercase());
    entities.error_code = ERROR_CODE_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_uppercase());
    entities.environment = ENVIRONMENT_RE.captures(text).and_then(|c| {
        c.get(1)
            .or_else(|| c.get(2))
            .and_then(|m| parse_environment(m.as_str()))
    });
    entities.limit = LIMIT_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());
    entities
}

/// Rule-based classification. `None` when no rule applies.
pub fn classify(text: &str) -> Option<(Intent, Entities)> {
    let mut entities = extract_entities(text);
    let lower = text.to_lowercase();

    if let Some(verb) = ACTION_RE.captures(text).and_then(|c| c.get(1)) {
        entities.action = ActionType::parse(verb.as_str());
        return Some((Intent::Action, entities));
    }
    if TROUBLESHOOT_WORDS.iter().any(|w| lower.contains(w)) {
        return Some((Intent::Troubleshoot, entities));
    }
    if let Some(kind) = query_kind(&lower) {
        entities.query = Some(kind);
        return Some((Intent::Query, entities));
    }
    if STATUS_WORDS.iter().any(|w| lower.contains(w)) {
        return Some((Intent::Status, entities));
    }
    None
}

/// The one question to ask when a required entity is missing.
pub fn missing_entity(intent: Intent, entities: &Entities) -> Option<String> {
    let needs_job = |verb: &str| {
        entities
            .job
            .is_none()
            .then(|| format!("Which job name should I {}?", verb))
    };
    match intent {
        Intent::Status => needs_job("check"),
        Intent::Troubleshoot => needs_job("troubleshoot"),
        Intent::Action => match (&entities.job, entities.action) {
            (None, Some(action)) => Some(format!("Which job name should I {}?", action.as_str())),
            (None, None) => Some("Which job name should I act on, and which action should I take?".to_string()),
            (Some(job), None) => Some(format!(
                "Which action should I take on job {} (rerun, hold, release, cancel, execute or kill)?",
                job
            )),
            (Some(_), Some(_)) => None,
        },
        Intent::Query => match entities.query.unwrap_or(QueryKind::Dependencies) {
            QueryKind::Dependencies | QueryKind::Impact => needs_job("analyze"),
            QueryKind::CommonDependencies if entities.all_jobs().len() < 2 => Some(
                "Which job names should I compare? Please name at least two jobs.".to_string(),
            ),
            _ => None,
        },
        Intent::General => None,
    }
}

/// Entities from a clarification reply: the usual rules, then a bare identifier for the job.
pub fn clarification_entities(intent: Intent, entities: &Entities, reply: &str) -> Entities {
    let mut found = extract_entities(reply);
    if entities.job.is_none() && found.job.is_none() {
        found.job = bare_identifier(reply);
    }
    if intent == Intent::Action && entities.action.is_none() {
        found.action = reply
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '-')
            .find_map(ActionType::parse);
    }
    found
}

/// JSON shape requested from the model when the rules do not match.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelClassification {
    pub intent: String,
    #[serde(default)]
    pub job: Option<String>,
    #[serde(default)]
    pub workstation: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
}

impl ModelClassification {
    /// Unknown intents become GENERAL; rule-extracted entities fill the gaps.
    pub fn into_parts(self, text: &str) -> (Intent, Entities) {
        let intent = Intent::parse(&self.intent).unwrap_or(Intent::General);
        let query = self.query.as_deref().and_then(|q| {
            serde_json::from_value::<QueryKind>(serde_json::Value::String(q.trim().to_ascii_lowercase())).ok()
        });
        let mut entities = Entities {
            job: self.job.and_then(|j| clean(&j)),
            workstation: self.workstation.map(|w| w.trim().to_ascii_uppercase()),
            error_code: self.error_code,
            action: self.action.as_deref().and_then(ActionType::parse),
            environment: self.environment.as_deref().and_then(parse_environment),
            query,
            ..Entities::default()
        };
        entities.merge(extract_entities(text));
        (intent, entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_actions_at_start_only() {
        let (intent, e) = classify("please rerun job PAYROLL_DAILY in prod").unwrap();
        assert_eq!(intent, Intent::Action);
        assert_eq!(e.action, Some(ActionType::Rerun));
        assert_eq!(e.job.as_deref(), Some("PAYROLL_DAILY"));
        assert_eq!(e.environment, Some(Environment::Production));

        let (intent, _) = classify("did the rerun of job X succeed? status please").unwrap();
        assert_eq!(intent, Intent::Status);
    }

    #[test]
    fn troubleshoot_wins_over_status() {
        let (intent, e) = classify("why did job ETL_LOAD fail with rc=8").unwrap();
        assert_eq!(intent, Intent::Troubleshoot);
        assert_eq!(e.error_code.as_deref(), Some("8"));
    }

    #[test]
    fn query_kinds() {
        let (_, e) = classify("what depends on job EXTRACT").unwrap();
        assert_eq!(e.query, Some(QueryKind::Impact));
        let (_, e) = classify("what does job REPORT depend on").unwrap();
        assert_eq!(e.query, Some(QueryKind::Dependencies));
        let (_, e) = classify("show the top 5 critical jobs").unwrap();
        assert_eq!(e.query, Some(QueryKind::CriticalJobs));
        assert_eq!(e.limit, Some(5));
        let (_, e) = classify("common dependencies of jobs LOAD_A and LOAD_B").unwrap();
        assert_eq!(e.query, Some(QueryKind::CommonDependencies));
        assert_eq!(e.all_jobs(), vec!["LOAD_A", "LOAD_B"]);
    }

    #[test]
    fn stopwords_are_not_jobs() {
        let e = extract_entities("show jobs that are running");
        assert!(e.job.is_none());
    }

    #[test]
    fn missing_job_question_names_it() {
        let (intent, e) = classify("what is the status?").unwrap();
        assert_eq!(intent, Intent::Status);
        let q = missing_entity(intent, &e).unwrap();
        assert!(q.contains("job name"));
    }

    #[test]
    fn clarification_accepts_bare_identifier() {
        let e = clarification_entities(Intent::Status, &Entities::default(), "payroll_daily");
        assert_eq!(e.job.as_deref(), Some("payroll_daily"));
    }

    #[test]
    fn no_rule_matches_small_talk() {
        assert!(classify("hello there").is_none());
    }

    #[test]
    fn model_classification_falls_back_to_general() {
        let c = ModelClassification {
            intent: "WEATHER".into(),
            ..Default::default()
        };
        assert_eq!(c.into_parts("hello").0, Intent::General);
    }
}
