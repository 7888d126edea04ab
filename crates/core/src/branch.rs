// Branch-name derivation: a pure function of (issue number, title, task type)

use crate::task::TaskType;

/// Words dropped from branch slugs
const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "is", "are", "was", "were",
];

/// Maximum words kept in the slug
const MAX_WORDS: usize = 8;

/// Maximum slug length in characters (truncated at a word boundary)
const MAX_SLUG_LEN: usize = 50;

/// Derive a deterministic branch name of the form
/// `<prefix>/<issue_number>-<slug>`
///
/// The slug is the lowercased title with punctuation dropped, separators
/// collapsed to single hyphens, stop words removed, at most eight words and
/// at most fifty characters (cut at a word boundary).
pub fn derive_branch_name(issue_number: i64, title: &str, task_type: TaskType) -> String {
    let prefix = task_type.branch_prefix();
    let slug = slugify(title);

    if slug.is_empty() {
        format!("{prefix}/{issue_number}")
    } else {
        format!("{prefix}/{issue_number}-{slug}")
    }
}

fn slugify(title: &str) -> String {
    let lowered = title.to_lowercase();

    // Keep alphanumerics and separators; drop the rest
    let cleaned: String = lowered
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c
            } else if c == ' ' || c == '_' || c == '-' {
                ' '
            } else {
                '\0'
            }
        })
        .filter(|c| *c != '\0')
        .collect();

    let words: Vec<&str> = cleaned
        .split_whitespace()
        .filter(|w| !STOP_WORDS.contains(w))
        .take(MAX_WORDS)
        .collect();

    let mut slug = String::new();
    for word in words {
        let next_len = if slug.is_empty() {
            word.len()
        } else {
            slug.len() + 1 + word.len()
        };
        if next_len > MAX_SLUG_LEN {
            break;
        }
        if !slug.is_empty() {
            slug.push('-');
        }
        slug.push_str(word);
    }

    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_derivation() {
        assert_eq!(
            derive_branch_name(12, "Add dark mode toggle", TaskType::Feature),
            "feature/12-add-dark-mode-toggle"
        );
    }

    #[test]
    fn test_bugfix_prefix_is_fix() {
        assert_eq!(
            derive_branch_name(3, "Crash on empty input", TaskType::Bugfix),
            "fix/3-crash-empty-input"
        );
    }

    #[test]
    fn test_stop_words_removed() {
        assert_eq!(
            derive_branch_name(7, "Fix the bug in the parser", TaskType::Bugfix),
            "fix/7-fix-bug-parser"
        );
    }

    #[test]
    fn test_punctuation_and_separators_collapse() {
        assert_eq!(
            derive_branch_name(9, "Update  README.md -- badly_formatted!!", TaskType::Docs),
            "docs/9-update-readmemd-badly-formatted"
        );
    }

    #[test]
    fn test_word_limit() {
        let title = "one two three four five six seven eight nine ten";
        let branch = derive_branch_name(1, title, TaskType::Chore);
        assert_eq!(branch, "chore/1-one-two-three-four-five-six-seven-eight");
    }

    #[test]
    fn test_length_limit_cuts_at_word_boundary() {
        let title = "implement comprehensive verification infrastructure refactoring";
        let branch = derive_branch_name(4, title, TaskType::Refactor);
        let slug = branch.strip_prefix("refactor/4-").unwrap();
        assert!(slug.len() <= 50);
        assert!(!slug.ends_with('-'));
        // No word is cut in half: the slug is a prefix of the full word list
        assert!(slug.starts_with("implement-comprehensive"));
    }

    #[test]
    fn test_empty_slug_falls_back_to_number() {
        assert_eq!(derive_branch_name(5, "!!!", TaskType::Feature), "feature/5");
    }

    #[test]
    fn test_deterministic() {
        let a = derive_branch_name(42, "Add retry logic", TaskType::Feature);
        let b = derive_branch_name(42, "Add retry logic", TaskType::Feature);
        assert_eq!(a, b);
    }
}
