//! Response sanitizing for LLM outputs.
//!
//! Turns raw generated text into a single candidate statement: strips code
//! fences and one wrapping pair of quotes, then rewrites double-quoted string
//! literals to single quotes. The quote rewrite is a regex heuristic sitting
//! behind [`QuoteNormalizer`] so a tokenizer-based implementation can replace
//! it without touching callers.
//!
//! Sanitizing never fails; at worst the input comes back with only fences and
//! outer quotes removed.

use regex::{Captures, Regex};
use std::sync::LazyLock;

/// First tokens that mark a fence line as SQL rather than a language tag.
const STATEMENT_STARTS: &[&str] = &["SELECT", "WITH", "VALUES", "TABLE", "EXPLAIN"];

/// Double-quoted literal directly after `=`, `IN (`, `LIKE`, `ILIKE` or a comma.
static VALUE_POSITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(=\s*|\bIN\s*\(|\bLIKE\s+|\bILIKE\s+|,\s*)"([^"]+)""#)
        .expect("value position pattern is valid")
});

/// `WHERE|AND|OR|HAVING <identifier> = "<literal>"`.
static PREDICATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(WHERE|AND|OR|HAVING)\s+(\w+)\s*=\s*"([^"]+)""#)
        .expect("predicate pattern is valid")
});

/// Any remaining double-quoted run.
static DOUBLE_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"]+)""#).expect("double quoted pattern is valid"));

/// Content that looks like an identifier: leading capital, then word characters.
static IDENTIFIER_LIKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][a-zA-Z0-9_]*$").expect("identifier pattern is valid"));

/// Rewrites string literal quoting in a candidate statement.
pub trait QuoteNormalizer: Send + Sync {
    /// Returns the statement with literals single-quoted.
    fn normalize(&self, sql: &str) -> String;
}

/// Regex-based quote rewriting.
///
/// Known limitation: a literal that happens to look like an identifier
/// (`"Almaty"`) outside a value position is left double-quoted, and a
/// lowercase identifier outside a value position is single-quoted.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicQuoteNormalizer;

impl QuoteNormalizer for HeuristicQuoteNormalizer {
    fn normalize(&self, sql: &str) -> String {
        let sql = VALUE_POSITION.replace_all(sql, "${1}'${2}'");
        let sql = PREDICATE.replace_all(&sql, "${1} ${2} = '${3}'");

        DOUBLE_QUOTED
            .replace_all(&sql, |caps: &Captures<'_>| {
                let content = &caps[1];
                if content.contains('.') || IDENTIFIER_LIKE.is_match(content) {
                    caps[0].to_string()
                } else {
                    format!("'{content}'")
                }
            })
            .into_owned()
    }
}

/// Extracts a candidate statement from raw model output.
#[derive(Debug, Clone, Default)]
pub struct SqlSanitizer<N = HeuristicQuoteNormalizer> {
    normalizer: N,
}

impl SqlSanitizer<HeuristicQuoteNormalizer> {
    /// Creates a sanitizer with the default quote heuristic.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<N: QuoteNormalizer> SqlSanitizer<N> {
    /// Creates a sanitizer with a custom quote normalizer.
    pub fn with_normalizer(normalizer: N) -> Self {
        Self { normalizer }
    }

    /// Runs every cleaning step in order.
    pub fn sanitize(&self, raw: &str) -> String {
        let text = raw.trim();
        let text = strip_code_fence(text).trim();
        let text = strip_outer_quotes(text).trim();
        self.normalizer.normalize(text)
    }
}

/// Sanitizes raw model output with the default heuristic.
pub fn sanitize_sql(raw: &str) -> String {
    SqlSanitizer::new().sanitize(raw)
}

/// Removes the markers of a fence wrapping the whole text, with or without
/// a language tag. A fence with prose around it is not a wrapper, so such
/// text is returned unchanged and left for the validator to judge.
fn strip_code_fence(text: &str) -> &str {
    match text.strip_prefix("```") {
        Some(rest) => skip_language_tag(rest.strip_suffix("```").unwrap_or(rest)),
        None => text,
    }
}

/// Drops a `sql`-style tag that sits alone on the fence line.
fn skip_language_tag(block: &str) -> &str {
    let Some((first_line, rest)) = block.split_once('\n') else {
        // Single line: only a leading `sql ` prefix can be a tag.
        let trimmed = block.trim_start();
        return match trimmed.get(..4) {
            Some(prefix) if prefix.eq_ignore_ascii_case("sql ") => &trimmed[4..],
            _ => block,
        };
    };

    let tag = first_line.trim();
    let is_tag = tag.is_empty()
        || (tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+'))
            && !STATEMENT_STARTS
                .iter()
                .any(|kw| kw.eq_ignore_ascii_case(tag)));

    if is_tag {
        rest
    } else {
        block
    }
}

/// Removes exactly one matching pair of quotes wrapping the whole text.
fn strip_outer_quotes(text: &str) -> &str {
    for quote in ['\'', '"'] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            return &text[1..text.len() - 1];
        }
    }
    text
}
