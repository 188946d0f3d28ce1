//! Prompt and feedback formatting.
//!
//! These strings are part of the contract the supervised agent sees, so
//! they are built here as pure functions and asserted in tests without
//! driving a real PTY.

use crate::types::{VerifyHistoryEntry, WorkUnit};
use crate::verify::CheckOutcome;

/// Header of the re-injected feedback block.
pub const VERIFICATION_FAILED_HEADER: &str = "HOMER VERIFICATION FAILED";

const LAST_FAILURE_CAP: usize = 500;
const DIGEST_CAP: usize = 200;

/// System prompt injected at spawn: the completion protocol.
pub fn system_prompt(agent_id: &str) -> String {
    format!(
        "You are {}, an autonomous coding agent working in this repository.\n\
         \n\
         Completion protocol:\n\
         - When your task is fully implemented and the project checks pass, print HOMER_DONE on its own line.\n\
         - If you cannot proceed, print HOMER_BLOCKED: <short reason>.\n\
         - Never print these tokens in any other situation.",
        agent_id
    )
}

/// Task prompt: what to build, the acceptance criteria, work already done
/// by completed sibling subtasks, and the memory context.
pub fn task_prompt(
    unit: &WorkUnit,
    completed_siblings: &[String],
    memory_context: &str,
) -> String {
    let mut out = String::new();
    match unit {
        WorkUnit::Story {
            id,
            title,
            description,
            criteria,
            ..
        } => {
            out.push_str(&format!("Your task ({}): {}\n", id, title));
            if !description.is_empty() {
                out.push_str(&format!("\n{}\n", description));
            }
            if !criteria.is_empty() {
                out.push_str("\nAcceptance criteria:\n");
                for c in criteria {
                    out.push_str(&format!("- {}\n", c));
                }
            }
        }
        WorkUnit::Subtask {
            id,
            parent_id,
            criterion,
            title,
        } => {
            out.push_str(&format!(
                "Your task ({}): {}\nThis is one criterion of story {}:\n- {}\n",
                id, title, parent_id, criterion
            ));
        }
        WorkUnit::Issue {
            number,
            title,
            body,
            ..
        } => {
            out.push_str(&format!("Your task (issue #{}): {}\n", number, title));
            if !body.is_empty() {
                out.push_str(&format!("\n{}\n", body));
            }
        }
    }

    if !completed_siblings.is_empty() {
        out.push_str("\nAlready completed by earlier subtasks (do not redo):\n");
        for sibling in completed_siblings {
            out.push_str(&format!("- {}\n", sibling));
        }
    }

    if !memory_context.is_empty() {
        out.push('\n');
        out.push_str(memory_context);
        out.push('\n');
    }

    out.push_str("\nPrint HOMER_DONE when finished, or HOMER_BLOCKED: <reason> if stuck.\n");
    out
}

/// The feedback block written to the child after a failed verification.
pub fn verification_feedback(
    failed: &[&CheckOutcome],
    criteria: &[String],
    history: &[VerifyHistoryEntry],
    rule_hints: &str,
) -> String {
    let mut out = format!("{}\n\nThe following checks failed:\n", VERIFICATION_FAILED_HEADER);
    for check in failed {
        out.push_str(&format!("\n[{}] `{}`\n{}\n", check.name, check.command, check.output));
    }

    if !criteria.is_empty() {
        out.push_str("\nAcceptance criteria for this task:\n");
        for c in criteria {
            out.push_str(&format!("- {}\n", c));
        }
    }

    if !history.is_empty() {
        out.push_str("\nPrevious attempts:\n");
        for entry in history {
            out.push_str(&format!(
                "- attempt {}: failed {}\n",
                entry.attempt,
                entry.failed_checks.join(", ")
            ));
        }
    }

    if !rule_hints.is_empty() {
        out.push('\n');
        out.push_str(rule_hints);
        out.push('\n');
    }

    out.push_str("\nFix the failures above, then print HOMER_DONE again.\n");
    out
}

/// The hand-off header a replacement agent receives on reroute.
pub fn reroute_prompt(
    unit: &WorkUnit,
    prior_attempts: u32,
    last_failure: &str,
    digests: &[String],
    memory_context: &str,
) -> String {
    let mut out = String::from("REROUTE: you are taking over a task another agent could not finish.\n\n");
    out.push_str(&format!("Task: {}\n", unit.title()));
    out.push_str(&format!("Prior verification attempts: {}\n", prior_attempts));

    if !last_failure.is_empty() {
        out.push_str(&format!("\nLast failure:\n{}\n", truncate(last_failure, LAST_FAILURE_CAP)));
    }

    if !digests.is_empty() {
        out.push_str("\nError digests from prior attempts:\n");
        for digest in digests {
            out.push_str(&format!("- {}\n", truncate(digest, DIGEST_CAP)));
        }
    }

    if !memory_context.is_empty() {
        out.push('\n');
        out.push_str(memory_context);
        out.push('\n');
    }

    out.push_str(
        "\nRules:\n\
         - Do not repeat the approaches described above; try a different angle.\n\
         - Read the failing output before editing anything.\n\
         - Print HOMER_DONE when the task is complete and verified, or HOMER_BLOCKED: <reason> if you cannot proceed.\n",
    );
    out
}

/// Digest of the verify history, re-prepended to the output buffer on trim
/// so retries keep their failure context.
pub fn verify_digest(history: &[VerifyHistoryEntry]) -> String {
    if history.is_empty() {
        return String::new();
    }
    let mut out = String::from("[verify history]\n");
    for entry in history {
        out.push_str(&format!(
            "attempt {}: {} | {}\n",
            entry.attempt,
            entry.failed_checks.join(", "),
            truncate(&entry.output_head, DIGEST_CAP)
        ));
    }
    out
}

/// Preamble written to a resumed agent.
pub fn resume_preamble(agent_id: &str, tail: &[String]) -> String {
    let mut out = format!("Continue previous work as {}.\n", agent_id);
    if !tail.is_empty() {
        out.push_str("\nWhere you left off:\n");
        for line in tail.iter().take(15) {
            out.push_str(&format!("  {}\n", line));
        }
    }
    out.push_str("\nPrint HOMER_DONE when finished, or HOMER_BLOCKED: <reason> if stuck.\n");
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s[..cut].to_string()
}
