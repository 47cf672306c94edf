//! `<think>` tag extraction.
//!
//! reasoning models emit an internal-monologue section wrapped in literal
//! `<think>`/`</think>` markers ahead of the visible answer. we capture the
//! first delimited region as the reasoning annotation and strip every
//! complete region from the visible content. case sensitive, first match
//! wins; an unmatched opener (stream cut off mid-think, etc.) is left
//! verbatim rather than guessed at.

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// partition a raw completion buffer into `(content, reasoning)`.
///
/// - `reasoning`: trimmed interior of the first `<think>…</think>` pair,
///   `None` when no pair exists or the interior trims to empty.
/// - `content`: the buffer with every complete tagged region (tags
///   inclusive) removed, then trimmed. interior whitespace is preserved.
pub fn split_reasoning(raw: &str) -> (String, Option<String>) {
    let mut reasoning = None;
    let mut first = true;
    let mut content = String::with_capacity(raw.len());
    let mut rest = raw;

    loop {
        let Some(open) = rest.find(THINK_OPEN) else {
            content.push_str(rest);
            break;
        };
        let interior_at = open + THINK_OPEN.len();
        let Some(close) = rest[interior_at..].find(THINK_CLOSE) else {
            // unmatched opener: leave the tail as-is
            content.push_str(rest);
            break;
        };
        let close = interior_at + close;

        content.push_str(&rest[..open]);
        if first {
            first = false;
            let interior = rest[interior_at..close].trim();
            if !interior.is_empty() {
                reasoning = Some(interior.to_string());
            }
        }
        rest = &rest[close + THINK_CLOSE.len()..];
    }

    (content.trim().to_string(), reasoning)
}

/// the shareable view of a partially received buffer: complete tagged
/// regions removed, everything from an unclosed `<think>` opener on held
/// back, and a trailing partial opener (`"<thi"`) held back until it
/// resolves. for any sequence of appends to `raw`, the result only ever
/// grows by extension, so callers can diff against what they already
/// forwarded.
pub fn visible_prefix(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    loop {
        match rest.find(THINK_OPEN) {
            Some(open) => {
                out.push_str(&rest[..open]);
                let interior_at = open + THINK_OPEN.len();
                match rest[interior_at..].find(THINK_CLOSE) {
                    Some(close) => {
                        rest = &rest[interior_at + close + THINK_CLOSE.len()..];
                    }
                    // inside an open region: nothing after the opener is
                    // visible until the closer arrives
                    None => return out,
                }
            }
            None => {
                let hold = partial_open_len(rest);
                out.push_str(&rest[..rest.len() - hold]);
                return out;
            }
        }
    }
}

/// longest suffix of `s` that is a proper prefix of `<think>`.
fn partial_open_len(s: &str) -> usize {
    let max = (THINK_OPEN.len() - 1).min(s.len());
    (1..=max)
        .rev()
        .find(|&n| s.ends_with(&THINK_OPEN[..n]))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn no_tags_passes_through_trimmed() {
        let (content, reasoning) = split_reasoning("  hello there \n");
        assert_eq!(content, "hello there");
        assert_eq!(reasoning, None);
    }

    #[test]
    fn extracts_first_region() {
        let (content, reasoning) = split_reasoning("A<think>B</think>C");
        assert_eq!(content, "AC");
        assert_eq!(reasoning.as_deref(), Some("B"));
    }

    #[test]
    fn interior_newlines_are_allowed() {
        let raw = "<think>line one\nline two\n</think>the answer";
        let (content, reasoning) = split_reasoning(raw);
        assert_eq!(content, "the answer");
        assert_eq!(reasoning.as_deref(), Some("line one\nline two"));
    }

    #[test]
    fn first_pair_wins_but_all_pairs_are_stripped() {
        let raw = "a<think>one</think>b<think>two</think>c";
        let (content, reasoning) = split_reasoning(raw);
        assert_eq!(content, "abc");
        assert_eq!(reasoning.as_deref(), Some("one"));
    }

    #[test]
    fn empty_interior_counts_as_absent() {
        let (content, reasoning) = split_reasoning("x<think> \n </think>y");
        assert_eq!(content, "xy");
        assert_eq!(reasoning, None);

        // an empty first interior still claims the "first pair" slot
        let (content, reasoning) = split_reasoning("<think></think>a<think>late</think>b");
        assert_eq!(content, "ab");
        assert_eq!(reasoning, None);
    }

    #[test]
    fn unmatched_opener_is_left_verbatim() {
        let raw = "answer so far <think>never closed";
        let (content, reasoning) = split_reasoning(raw);
        assert_eq!(content, "answer so far <think>never closed");
        assert_eq!(reasoning, None);
    }

    #[test]
    fn close_without_open_is_left_verbatim() {
        let (content, reasoning) = split_reasoning("odd</think> tail");
        assert_eq!(content, "odd</think> tail");
        assert_eq!(reasoning, None);
    }

    #[test]
    fn region_spanning_whole_buffer_yields_empty_content() {
        let (content, reasoning) = split_reasoning("<think>all of it</think>");
        assert_eq!(content, "");
        assert_eq!(reasoning.as_deref(), Some("all of it"));
    }

    #[test]
    fn visible_prefix_removes_complete_regions() {
        assert_eq!(visible_prefix("a<think>x</think>b"), "ab");
        assert_eq!(visible_prefix("plain text"), "plain text");
    }

    #[test]
    fn visible_prefix_holds_back_open_region() {
        assert_eq!(visible_prefix("a<think>not yet closed"), "a");
        assert_eq!(visible_prefix("<think>"), "");
    }

    #[test]
    fn visible_prefix_holds_back_partial_opener() {
        assert_eq!(visible_prefix("abc<thi"), "abc");
        assert_eq!(visible_prefix("abc<"), "abc");
        // a suffix that cannot become an opener is visible
        assert_eq!(visible_prefix("abc<thx"), "abc<thx");
    }

    #[test]
    fn visible_prefix_grows_by_extension_under_appends() {
        let fragments = ["Hi", " <thi", "nk>secret", "</think>", " there"];
        let mut raw = String::new();
        let mut prev = String::new();
        for f in fragments {
            raw.push_str(f);
            let vis = visible_prefix(&raw);
            assert!(vis.starts_with(&prev), "{vis:?} must extend {prev:?}");
            prev = vis;
        }
        assert_eq!(prev, "Hi  there");
    }
}
