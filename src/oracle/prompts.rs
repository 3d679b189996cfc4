//! Prompt templates for the three oracle questions.
//!
//! Each prompt opens with a distinct question line so transcripts (and
//! scripted test backends) can tell them apart.

use std::time::Duration;

use crate::session::Evidence;
use crate::util::truncate_chars;

pub const PLANNING_HEADER: &str = "Decide whether this coding task needs an up-front plan.";
pub const COMPLETION_HEADER: &str = "Decide whether this coding task was actually completed.";
pub const STALL_HEADER: &str = "A coding agent has produced no new output for a while.";

const MAX_EVIDENCE_CHARS: usize = 6_000;

pub fn planning(identity: &str, description: &str) -> String {
    format!(
        r#"{header}

Project: {identity}
Task:
{description}

Respond with a JSON object containing:
- "needs_planning": true if a human should approve a written plan before an agent starts
- "complexity": one of "trivial", "simple", "moderate", "complex", "very-complex"
  - trivial: single command or one-line edit
  - simple: a few steps in one or two files
  - moderate: several files, some design decisions
  - complex: many files, architectural decisions, new tests
  - very-complex: large refactoring or cross-cutting changes
- "rationale": one or two sentences
- "size_estimate": rough size such as "1 hour" or "3 files"
- "confidence": number from 0.0 to 1.0

Respond with ONLY the JSON object, no other text."#,
        header = PLANNING_HEADER,
        identity = identity,
        description = description.trim(),
    )
}

pub fn completion(identity: &str, description: &str, evidence: &Evidence) -> String {
    format!(
        r#"{header}

Project: {identity}
Task:
{description}

Change summary:
{changes}

Recent agent output (including any test runs):
{output}

Be skeptical: an agent saying it is done is not evidence that it is done.
Respond with a JSON object containing:
- "actually_complete": true only if the changes fully accomplish the task
- "confidence": number from 0.0 to 1.0
- "issues": array of concrete remaining problems (empty if none)
- "recommended_status": one of "completed", "incomplete", "needs_review"
- "rationale": one or two sentences

Respond with ONLY the JSON object, no other text."#,
        header = COMPLETION_HEADER,
        identity = identity,
        description = description.trim(),
        changes = truncate_chars(&evidence.change_summary, MAX_EVIDENCE_CHARS),
        output = or_none(&truncate_tail(&evidence.test_output, MAX_EVIDENCE_CHARS)),
    )
}

pub fn stall(
    identity: &str,
    description: &str,
    elapsed: Duration,
    idle: Duration,
    tail: &[String],
) -> String {
    format!(
        r#"{header}

Project: {identity}
Task:
{description}

Running for {elapsed} minutes; idle for {idle} minutes.

Last output lines:
{output}

Is the agent still making progress (for example waiting on a long build), stuck
in a loop, or waiting for input?
Respond with a JSON object containing:
- "status": one of "progressing", "stuck", "unclear"
- "recommendation": one of "continue", "interrupt", "restart"
- "suggested_message": guidance to send the agent if recommending "interrupt"
- "confidence": number from 0.0 to 1.0
- "rationale": one or two sentences

Respond with ONLY the JSON object, no other text."#,
        header = STALL_HEADER,
        identity = identity,
        description = description.trim(),
        elapsed = elapsed.as_secs() / 60,
        idle = idle.as_secs() / 60,
        output = or_none(&truncate_tail(&tail.join("\n"), MAX_EVIDENCE_CHARS)),
    )
}

fn or_none(text: &str) -> String {
    if text.trim().is_empty() {
        "(none)".to_string()
    } else {
        text.to_string()
    }
}

/// Keep the end of `text`, where the latest output is.
fn truncate_tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().skip(count - max_chars).collect();
    format!("...{}", kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_have_distinct_headers() {
        let evidence = Evidence {
            change_summary: "M src/lib.rs".to_string(),
            test_output: String::new(),
        };
        let plan = planning("p1", "fix typo");
        let done = completion("p1", "fix typo", &evidence);
        let stalled = stall(
            "p1",
            "fix typo",
            Duration::from_secs(1200),
            Duration::from_secs(600),
            &[],
        );

        assert!(plan.starts_with(PLANNING_HEADER));
        assert!(done.starts_with(COMPLETION_HEADER));
        assert!(done.contains("M src/lib.rs"));
        assert!(done.contains("(none)"));
        assert!(stalled.starts_with(STALL_HEADER));
        assert!(stalled.contains("idle for 10 minutes"));
    }

    #[test]
    fn tail_truncation_keeps_the_end() {
        assert_eq!(truncate_tail("abcdef", 3), "...def");
        assert_eq!(truncate_tail("abc", 3), "abc");
    }
}
