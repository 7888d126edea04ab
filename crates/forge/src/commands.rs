// Command grammar parsed from forge comments
//
// Case-insensitive, anchored at the start of the comment body:
//   /implement  or  /lgtm   -> approve the plan
//   /revise <feedback>      -> revise the plan with the captured text
//
// Everything else is ignored by the command parser but may still count as
// actionable feedback during code review.

use regex::Regex;
use std::sync::OnceLock;

use crate::Comment;

/// Reactions that approve a plan when left on the plan comment
pub const APPROVAL_REACTIONS: &[&str] = &["+1", "rocket", "heart", "hooray"];

/// A parsed plan command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueCommand {
    /// `/implement` or `/lgtm`
    ApprovePlan,
    /// `/revise <feedback>`
    RevisePlan(String),
}

fn approve_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^/(implement|lgtm)\s*$").expect("static regex")
    })
}

fn revise_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)^/revise\s+(.+)$").expect("static regex"))
}

fn answer_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*(?:[-*]\s*)?(\d+)[.):]\s+(.+)$").expect("static regex"))
}

/// Parse a plan command from a comment body
pub fn parse_command(body: &str) -> Option<IssueCommand> {
    let trimmed = body.trim();

    if approve_re().is_match(trimmed) {
        return Some(IssueCommand::ApprovePlan);
    }
    if let Some(captures) = revise_re().captures(trimmed) {
        let feedback = captures.get(1).map(|m| m.as_str().trim().to_string())?;
        return Some(IssueCommand::RevisePlan(feedback));
    }
    None
}

/// Parse a numbered answer block from a comment body
///
/// Lines like `1. use system preference` or `- 2) yes` map the 1-based
/// question index to the answer text. A comment with no matching lines is
/// not an answer block.
pub fn parse_answer_block(body: &str) -> Vec<(usize, String)> {
    answer_line_re()
        .captures_iter(body)
        .filter_map(|captures| {
            let index: usize = captures.get(1)?.as_str().parse().ok()?;
            let answer = captures.get(2)?.as_str().trim().to_string();
            (index > 0 && !answer.is_empty()).then_some((index, answer))
        })
        .collect()
}

/// Whether a reaction kind approves the plan
pub fn is_approval_reaction(kind: &str) -> bool {
    APPROVAL_REACTIONS.contains(&kind)
}

/// Whether the agent should act on a PR comment during code review
///
/// True when the comment mentions the agent handle, is an inline
/// code-review comment, or is a `/revise` command.
pub fn is_actionable_feedback(comment: &Comment, agent_handle: &str) -> bool {
    if comment
        .body
        .to_lowercase()
        .contains(&agent_handle.to_lowercase())
    {
        return true;
    }
    if comment.is_review_comment {
        return true;
    }
    matches!(parse_command(&comment.body), Some(IssueCommand::RevisePlan(_)))
}

/// Format actionable PR feedback as context for a feedback job
///
/// `/revise` bodies contribute only their captured text.
pub fn format_feedback(comments: &[Comment], agent_handle: &str) -> String {
    let mut parts = Vec::new();

    for comment in comments {
        if !is_actionable_feedback(comment, agent_handle) {
            continue;
        }

        let kind = if comment.is_review_comment {
            "Code comment"
        } else {
            "Comment"
        };

        let body = match parse_command(&comment.body) {
            Some(IssueCommand::RevisePlan(feedback)) => feedback,
            _ => comment.body.clone(),
        };

        parts.push(format!("## {kind} from @{}\n{body}", comment.author));
    }

    parts.join("\n\n---\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn comment(body: &str, is_review: bool) -> Comment {
        Comment {
            id: 1,
            body: body.to_string(),
            author: "reviewer".to_string(),
            created_at: Utc::now(),
            url: "https://forge.test/c/1".to_string(),
            is_review_comment: is_review,
        }
    }

    #[test]
    fn test_approve_commands() {
        assert_eq!(parse_command("/implement"), Some(IssueCommand::ApprovePlan));
        assert_eq!(parse_command("/lgtm"), Some(IssueCommand::ApprovePlan));
        assert_eq!(parse_command("/LGTM"), Some(IssueCommand::ApprovePlan));
        assert_eq!(parse_command("  /implement  "), Some(IssueCommand::ApprovePlan));
    }

    #[test]
    fn test_revise_command_captures_feedback() {
        assert_eq!(
            parse_command("/revise Use system preference"),
            Some(IssueCommand::RevisePlan("Use system preference".to_string()))
        );
        // Multi-line feedback is captured whole
        assert_eq!(
            parse_command("/revise first line\nsecond line"),
            Some(IssueCommand::RevisePlan("first line\nsecond line".to_string()))
        );
    }

    #[test]
    fn test_non_commands_are_ignored() {
        assert_eq!(parse_command("looks good to me"), None);
        assert_eq!(parse_command("/implement this tomorrow"), None);
        assert_eq!(parse_command("/revise"), None);
        assert_eq!(parse_command("please /implement"), None);
    }

    #[test]
    fn test_answer_block_parsing() {
        let answers = parse_answer_block("1. Use system preference\n2) dark only\n- 3: yes");
        assert_eq!(
            answers,
            vec![
                (1, "Use system preference".to_string()),
                (2, "dark only".to_string()),
                (3, "yes".to_string()),
            ]
        );

        assert!(parse_answer_block("no numbered lines here").is_empty());
    }

    #[test]
    fn test_approval_reactions() {
        for kind in ["+1", "rocket", "heart", "hooray"] {
            assert!(is_approval_reaction(kind));
        }
        assert!(!is_approval_reaction("eyes"));
        assert!(!is_approval_reaction("-1"));
    }

    #[test]
    fn test_actionable_feedback_rules() {
        assert!(is_actionable_feedback(&comment("hey @foreman fix this", false), "@foreman"));
        assert!(is_actionable_feedback(&comment("@FOREMAN please", false), "@foreman"));
        assert!(is_actionable_feedback(&comment("inline nit", true), "@foreman"));
        assert!(is_actionable_feedback(&comment("/revise tighten this", false), "@foreman"));
        assert!(!is_actionable_feedback(&comment("general discussion", false), "@foreman"));
    }

    #[test]
    fn test_format_feedback_uses_revise_text_only() {
        let comments = vec![
            comment("/revise tighten the error handling", false),
            comment("unrelated chatter", false),
            comment("rename this variable", true),
        ];

        let formatted = format_feedback(&comments, "@foreman");
        assert!(formatted.contains("tighten the error handling"));
        assert!(!formatted.contains("/revise"));
        assert!(!formatted.contains("unrelated chatter"));
        assert!(formatted.contains("## Code comment from @reviewer"));
    }
}
