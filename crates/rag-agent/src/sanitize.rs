//! Scrubbing of error text before it reaches a client.
//!
//! Backend errors carry DSNs, hostnames and debug representations of
//! driver objects. None of that may appear in an `error` event.

use std::sync::LazyLock;

use regex::Regex;

/// Default cap on user-visible error messages, in characters.
pub const DEFAULT_MAX_CHARS: usize = 240;

static DSN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[a-z][a-z0-9+.\-]*://[^\s'\x22<>]+").expect("DSN_RE regex should compile")
});
static OBJECT_REPR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<[^<>]*\bobject at 0x[0-9a-fA-F]+>").expect("OBJECT_REPR_RE regex should compile")
});
static HEX_ADDR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b0x[0-9a-fA-F]{6,}\b").expect("HEX_ADDR_RE regex should compile"));
static SECRET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(password|passwd|api[_-]?key|token|secret)\s*[=:]\s*\S+")
        .expect("SECRET_RE regex should compile")
});
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("WHITESPACE_RE regex should compile"));

/// Replace backend identifiers with generic text and cap the length.
///
/// The cap counts characters, not bytes, and appends `…` when it cuts.
pub fn sanitize_message(raw: &str, max_chars: usize) -> String {
    let s = OBJECT_REPR_RE.replace_all(raw, "<backend object>");
    let s = DSN_RE.replace_all(&s, "<endpoint>");
    let s = SECRET_RE.replace_all(&s, "$1=<redacted>");
    let s = HEX_ADDR_RE.replace_all(&s, "<addr>");
    let s = WHITESPACE_RE.replace_all(s.trim(), " ");

    if s.chars().count() <= max_chars {
        return s.into_owned();
    }
    let mut out: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}
