// Keyword extraction and matching for routing user messages to active tasks

/// Common UI/code terms worth routing on
const ROUTING_TERMS: &[&str] = &[
    "background",
    "header",
    "footer",
    "button",
    "color",
    "style",
    "layout",
    "font",
    "image",
    "icon",
    "nav",
    "navbar",
    "sidebar",
    "menu",
    "form",
    "input",
    "modal",
    "dialog",
    "card",
    "table",
    "list",
    "api",
    "endpoint",
    "route",
    "auth",
    "login",
    "signup",
    "database",
    "schema",
    "test",
    "bug",
    "fix",
    "feature",
];

/// Extract routing keywords from a user message
///
/// Looks for domain names, `owner/repo` references and common technical
/// terms. Keywords are lowercased and deduplicated, preserving first
/// occurrence order.
pub fn extract_keywords(message: &str) -> Vec<String> {
    let lower = message.to_lowercase();
    let mut keywords: Vec<String> = Vec::new();

    let mut push = |kw: String| {
        if !keywords.contains(&kw) {
            keywords.push(kw);
        }
    };

    // Domain-like tokens (example.com, understanding.news)
    for token in lower.split(|c: char| c.is_whitespace() || c == ',' || c == '(' || c == ')') {
        let token = token.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '.' && c != '/' && c != '-' && c != '_');
        if token.is_empty() {
            continue;
        }

        if is_domain_like(token) {
            push(token.to_string());
        } else if is_repo_like(token) {
            push(token.to_string());
        }
    }

    // Known technical terms
    for term in ROUTING_TERMS {
        if lower.contains(term) {
            push((*term).to_string());
        }
    }

    keywords
}

/// Score the overlap between a message's keywords and a task's keywords
///
/// Returns a confidence in `[0.0, 1.0]`: the fraction of the task's keywords
/// present in the message.
pub fn keyword_overlap(message_keywords: &[String], task_keywords: &[String]) -> f64 {
    if task_keywords.is_empty() {
        return 0.0;
    }
    let hits = task_keywords
        .iter()
        .filter(|kw| message_keywords.contains(kw))
        .count();
    hits as f64 / task_keywords.len() as f64
}

fn is_domain_like(token: &str) -> bool {
    const TLDS: &[&str] = &[".com", ".org", ".net", ".io", ".dev", ".news", ".app", ".co"];
    token.contains('.')
        && !token.starts_with('.')
        && TLDS.iter().any(|tld| token.ends_with(tld))
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

fn is_repo_like(token: &str) -> bool {
    let mut parts = token.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(repo), None) => {
            !owner.is_empty()
                && !repo.is_empty()
                && owner
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
                && repo
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        }
        _ => false,
    }
}
