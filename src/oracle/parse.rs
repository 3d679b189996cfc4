//! Extraction and strict validation of model answers.
//!
//! Models wrap JSON in prose or code fences and drift on field spelling.
//! The first JSON object in the text is taken; each field is then checked
//! for presence, type, enum spelling and range. Anything off is an
//! `InvalidResponse` and the caller retries.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::verdict::{
    Complexity, CompletionVerdict, PlanningDecision, StallRecommendation, StallStatus,
    StallVerdict,
};
use super::OracleError;
use crate::task::TaskStatus;

fn fenced_block() -> &'static Regex {
    static FENCED: OnceLock<Regex> = OnceLock::new();
    FENCED.get_or_init(|| {
        Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").expect("valid regex")
    })
}

fn invalid(message: impl Into<String>) -> OracleError {
    OracleError::InvalidResponse(message.into())
}

/// Find the first balanced `{...}` in `text`, honouring string literals.
fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Pull the first JSON object out of a model answer.
pub fn extract_object(text: &str) -> Result<Map<String, Value>, OracleError> {
    let candidate = fenced_block()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .or_else(|| first_balanced_object(text))
        .ok_or_else(|| invalid("no JSON object in response"))?;

    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(obj)) => Ok(obj),
        Ok(_) => Err(invalid("response JSON is not an object")),
        Err(e) => Err(invalid(format!("response JSON does not parse: {}", e))),
    }
}

fn field<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .find_map(|name| obj.get(*name))
        .filter(|v| !v.is_null())
}

fn required_bool(obj: &Map<String, Value>, names: &[&str]) -> Result<bool, OracleError> {
    match field(obj, names) {
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => Ok(true),
        Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => Ok(false),
        Some(other) => Err(invalid(format!("{} must be a boolean, got {}", names[0], other))),
        None => Err(invalid(format!("missing {}", names[0]))),
    }
}

fn required_str<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Result<&'a str, OracleError> {
    match field(obj, names) {
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(other) => Err(invalid(format!("{} must be a string, got {}", names[0], other))),
        None => Err(invalid(format!("missing {}", names[0]))),
    }
}

fn optional_text(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    match field(obj, names)? {
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.trim().to_string()),
        other => Some(other.to_string()),
    }
}

fn confidence(obj: &Map<String, Value>) -> Result<f64, OracleError> {
    let value = field(obj, &["confidence"])
        .ok_or_else(|| invalid("missing confidence"))?
        .as_f64()
        .ok_or_else(|| invalid("confidence must be a number"))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(format!("confidence {} outside [0, 1]", value)));
    }
    Ok(value)
}

fn rationale(obj: &Map<String, Value>) -> String {
    optional_text(obj, &["rationale", "reasoning", "reason"]).unwrap_or_default()
}

pub fn planning(text: &str) -> Result<PlanningDecision, OracleError> {
    let obj = extract_object(text)?;
    let raw_complexity = required_str(&obj, &["complexity"])?;
    let complexity = Complexity::parse(raw_complexity)
        .ok_or_else(|| invalid(format!("unknown complexity '{}'", raw_complexity)))?;

    Ok(PlanningDecision {
        needs_planning: required_bool(&obj, &["needs_planning", "needsPlanning"])?,
        complexity,
        rationale: rationale(&obj),
        size_estimate: optional_text(&obj, &["size_estimate", "sizeEstimate"]),
        confidence: confidence(&obj)?,
        fallback: false,
    })
}

pub fn completion(text: &str) -> Result<CompletionVerdict, OracleError> {
    let obj = extract_object(text)?;
    let actually_complete = required_bool(&obj, &["actually_complete", "actuallyComplete"])?;

    let issues = match field(&obj, &["issues"]) {
        None => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.trim().to_string()),
                other => Err(invalid(format!("issue must be a string, got {}", other))),
            })
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect(),
        Some(other) => return Err(invalid(format!("issues must be an array, got {}", other))),
    };

    let recommended_status = match optional_text(&obj, &["recommended_status", "recommendedStatus"]) {
        None if actually_complete => TaskStatus::Completed,
        None if issues.is_empty() => TaskStatus::NeedsReview,
        None => TaskStatus::Incomplete,
        Some(raw) => match TaskStatus::parse_external(&raw) {
            Some(
                status @ (TaskStatus::Completed | TaskStatus::NeedsReview | TaskStatus::Incomplete),
            ) => status,
            _ => return Err(invalid(format!("unsupported recommended_status '{}'", raw))),
        },
    };

    Ok(CompletionVerdict {
        actually_complete,
        confidence: confidence(&obj)?,
        issues,
        recommended_status,
        rationale: rationale(&obj),
        fallback: false,
    })
}

pub fn stall(text: &str) -> Result<StallVerdict, OracleError> {
    let obj = extract_object(text)?;

    let raw_status = required_str(&obj, &["status"])?;
    let status = match raw_status.trim().to_lowercase().as_str() {
        "progressing" => StallStatus::Progressing,
        "stuck" => StallStatus::Stuck,
        "unclear" => StallStatus::Unclear,
        other => return Err(invalid(format!("unknown stall status '{}'", other))),
    };

    let raw_recommendation = required_str(&obj, &["recommendation"])?;
    let recommendation = match raw_recommendation.trim().to_lowercase().as_str() {
        "continue" => StallRecommendation::Continue,
        "interrupt" => StallRecommendation::Interrupt,
        "restart" => StallRecommendation::Restart,
        other => return Err(invalid(format!("unknown recommendation '{}'", other))),
    };

    Ok(StallVerdict {
        status,
        recommendation,
        suggested_message: optional_text(&obj, &["suggested_message", "suggestedMessage"]),
        confidence: confidence(&obj)?,
        rationale: rationale(&obj),
        fallback: false,
    })
}
