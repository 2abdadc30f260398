use std::sync::LazyLock;

use regex::Regex;

static DISALLOWED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_\s-]").unwrap());
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

const FALLBACK_STEM: &str = "video";

/// Turns a video title into an ASCII filename stem.
///
/// Drops everything except letters, digits, underscores, whitespace and
/// hyphens, then joins whitespace runs with a single underscore.
pub fn sanitize_title(title: &str) -> String {
    let kept = DISALLOWED_RE.replace_all(title, "");
    let joined = WS_RE.replace_all(&kept, "_");
    if joined.trim_matches('_').is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        joined.into_owned()
    }
}

pub fn download_filename(title: &str, extension: &str) -> String {
    format!("{}.{extension}", sanitize_title(title))
}
