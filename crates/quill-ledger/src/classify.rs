//! Best-effort classification of failure messages.
//!
//! Used only when the executing collaborator did not classify a failure
//! itself. Matching is by keyword and can misclassify; a collaborator-supplied
//! category always wins.

use std::sync::LazyLock;

use regex::Regex;

use crate::job::ErrorCategory;

/// A category plus a short type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub error_type: String,
}

impl Classification {
    fn new(category: ErrorCategory, error_type: &str) -> Self {
        Self {
            category,
            error_type: error_type.to_string(),
        }
    }
}

/// Ordered rules: the first match wins, so account rules are checked before
/// the broader infrastructure patterns.
static RULES: LazyLock<Vec<(Regex, ErrorCategory, &'static str)>> = LazyLock::new(|| {
    let rule = |pattern: &str, category, error_type| {
        (
            Regex::new(&format!("(?i){pattern}")).unwrap(),
            category,
            error_type,
        )
    };
    vec![
        rule(r"suspend", ErrorCategory::Account, "suspended"),
        rule(r"\bbann?ed\b|\bban\b", ErrorCategory::Account, "banned"),
        rule(r"captcha|are you a robot|verify (that )?you", ErrorCategory::Account, "captcha"),
        rule(
            r"logged[ _-]?out|log[ _-]?in required|not logged in|session expired|sign[ _-]?in required",
            ErrorCategory::Account,
            "logged_out",
        ),
        rule(r"account (is )?(locked|disabled|deactivated)", ErrorCategory::Account, "locked"),
        rule(r"timed? ?out|deadline exceeded", ErrorCategory::Infrastructure, "timeout"),
        rule(
            r"connection (refused|reset|closed|aborted)|network (is )?unreachable|broken pipe|dns",
            ErrorCategory::Infrastructure,
            "connection",
        ),
        rule(
            r"crash|device (not found|offline|disconnected)|backend (down|unavailable)|\badb\b",
            ErrorCategory::Infrastructure,
            "backend_crash",
        ),
        rule(
            r"verification (race|mismatch)|not yet visible|stale element",
            ErrorCategory::Infrastructure,
            "verification_race",
        ),
        rule(r"proxy|\b50[234]\b|service unavailable", ErrorCategory::Infrastructure, "upstream"),
    ]
});

/// Classify a failure message.
///
/// Messages that match no rule are `unknown`/`unclassified`.
pub fn classify_error(message: &str) -> Classification {
    RULES
        .iter()
        .find(|(re, _, _)| re.is_match(message))
        .map(|(_, category, error_type)| Classification::new(*category, error_type))
        .unwrap_or_else(|| Classification::new(ErrorCategory::Unknown, "unclassified"))
}

/// Resolve the category/type pair to record for a failure: the caller's
/// classification when present, otherwise [`classify_error`].
pub fn resolve(
    category: Option<ErrorCategory>,
    error_type: Option<&str>,
    message: &str,
) -> Classification {
    match category {
        Some(category) => Classification {
            category,
            error_type: error_type.unwrap_or_default().to_string(),
        },
        None => {
            let guessed = classify_error(message);
            match error_type.filter(|t| !t.is_empty()) {
                Some(t) => Classification::new(guessed.category, t),
                None => guessed,
            }
        }
    }
}
