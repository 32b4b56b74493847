use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;

/// Longest unterminated marker tail held back between deltas before it is
/// released as ordinary text.
const MAX_PENDING_MARKER_CHARS: usize = 64;

fn marker_regex() -> &'static Regex {
    static MARKERS: OnceLock<Regex> = OnceLock::new();
    MARKERS.get_or_init(|| {
        // 【4:0†notes.pdf】 and [4:0†source]
        Regex::new(r"【[^【】]*】|\[\d+(?::\d+)?†[^\[\]]*\]").expect("citation marker pattern")
    })
}

fn pending_regex() -> &'static Regex {
    static PENDING: OnceLock<Regex> = OnceLock::new();
    PENDING.get_or_init(|| {
        Regex::new(r"(?:【[^【】]*|\[\d*(?::\d*)?(?:†[^\[\]]*)?)$").expect("pending marker pattern")
    })
}

/// Removes vendor citation markers. Idempotent; text without markers is
/// returned borrowed and unchanged.
pub fn strip_citations(text: &str) -> Cow<'_, str> {
    let markers = marker_regex();
    if !markers.is_match(text) {
        return Cow::Borrowed(text);
    }
    // Removing one marker can join the halves of another.
    let mut current = markers.replace_all(text, "").into_owned();
    while markers.is_match(&current) {
        current = markers.replace_all(&current, "").into_owned();
    }
    Cow::Owned(current)
}

/// Splits `text` into a releasable prefix and a tail that may be the start
/// of a citation marker continued by the next delta.
pub fn split_pending_marker(text: &str) -> (&str, &str) {
    match pending_regex().find(text) {
        Some(found) if text[found.start()..].chars().count() <= MAX_PENDING_MARKER_CHARS => {
            text.split_at(found.start())
        }
        _ => (text, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_both_bracket_conventions() {
        assert_eq!(
            strip_citations("Niche down first【4:0†icp.pdf】. Then post daily[2:1†source]."),
            "Niche down first. Then post daily."
        );
        assert_eq!(strip_citations("see [12†notes]"), "see ");
    }

    #[test]
    fn leaves_plain_text_alone() {
        let text = "Post 3x a week [not a citation] and track saves.";
        assert!(matches!(strip_citations(text), Cow::Borrowed(_)));
        assert_eq!(strip_citations(text), text);
    }

    #[test]
    fn stripping_is_idempotent() {
        for text in [
            "a【1†x】b",
            "nested 【【1†x】】 marker",
            "[1†a][2:3†b] tail",
            "no markers at all",
        ] {
            let once = strip_citations(text).into_owned();
            assert_eq!(strip_citations(&once), once);
        }
    }

    #[test]
    fn holds_back_unterminated_marker_tail() {
        assert_eq!(split_pending_marker("Great hook【4:0"), ("Great hook", "【4:0"));
        assert_eq!(split_pending_marker("list item [3"), ("list item ", "[3"));
        assert_eq!(split_pending_marker("done."), ("done.", ""));
        let long = format!("x【{}", "y".repeat(100));
        assert_eq!(split_pending_marker(&long), (long.as_str(), ""));
    }
}
