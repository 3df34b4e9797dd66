//! Read-only gate for generated statements.
//!
//! A conservative lexical filter, not a parser. The statement is uppercased and
//! split into word tokens (runs of letters, digits and `_`); it is accepted
//! only when no token is on the denylist and at least one token is `SELECT`.
//!
//! Things this deliberately does not understand: statement separators,
//! comments and string literals. A denylisted word inside a literal rejects
//! the statement; that is the fail-closed direction.

use std::fmt;

/// Keywords that reject a statement wherever they appear as a whole word.
pub const DENIED_KEYWORDS: &[&str] = &[
    "DROP", "DELETE", "UPDATE", "INSERT", "TRUNCATE", "ALTER", "CREATE", "GRANT", "REVOKE",
];

/// Keyword that must appear for a statement to be accepted.
pub const REQUIRED_KEYWORD: &str = "SELECT";

/// Message stored for every rejection, whatever rule fired.
pub const REJECTION_MESSAGE: &str = "only read-only statements are permitted";

/// Why a statement was rejected. Logged, never shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    /// A denylisted keyword appeared as a whole word.
    DeniedKeyword(&'static str),
    /// No `SELECT` token was found.
    MissingSelect,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeniedKeyword(kw) => write!(f, "denied keyword {kw}"),
            Self::MissingSelect => write!(f, "no SELECT keyword"),
        }
    }
}

/// Outcome of classifying a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Safe to hand to the executor.
    Accepted,
    /// Must not run.
    Rejected(RejectionReason),
}

impl Verdict {
    /// Returns true for [`Verdict::Accepted`].
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Classifies a sanitized statement.
pub fn classify(sql: &str) -> Verdict {
    let upper = sql.to_uppercase();
    let mut saw_select = false;

    for token in tokens(&upper) {
        if let Some(kw) = DENIED_KEYWORDS.iter().find(|kw| **kw == token) {
            return Verdict::Rejected(RejectionReason::DeniedKeyword(kw));
        }
        if token == REQUIRED_KEYWORD {
            saw_select = true;
        }
    }

    if saw_select {
        Verdict::Accepted
    } else {
        Verdict::Rejected(RejectionReason::MissingSelect)
    }
}

/// Returns true if the statement may be executed.
pub fn is_read_only(sql: &str) -> bool {
    classify(sql).is_accepted()
}

/// Splits into word tokens. Everything that is not a word character separates.
fn tokens(upper: &str) -> impl Iterator<Item = &str> {
    upper
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
}
