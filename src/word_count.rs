use std::sync::LazyLock;

use regex::Regex;

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));
static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid space regex"));
static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\w+\b").expect("valid word regex"));

/// Counts words in plain or HTML-tagged text.
///
/// Tags are replaced by a space so `<p>a</p><p>b</p>` counts two words.
pub fn count_words(text: &str) -> usize {
    if text.trim().is_empty() {
        return 0;
    }
    let stripped = TAG_RE.replace_all(text, " ");
    let collapsed = SPACE_RE.replace_all(stripped.trim(), " ");
    WORD_RE.find_iter(&collapsed).count()
}

/// Running word count over text that only grows at the end.
///
/// Text up to the last whitespace outside a tag is settled and never scanned
/// again, so words and tags split across chunks are still counted once.
#[derive(Debug, Clone, Default)]
pub struct WordTally {
    settled_bytes: usize,
    settled_words: usize,
}

impl WordTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts `text`, which must extend the text given to the previous call.
    pub fn update(&mut self, text: &str) -> usize {
        if text.len() < self.settled_bytes || !text.is_char_boundary(self.settled_bytes) {
            self.reset();
        }
        let tail = &text[self.settled_bytes..];
        if let Some(cut) = settle_point(tail) {
            self.settled_words += count_words(&tail[..cut]);
            self.settled_bytes += cut;
        }
        self.settled_words + count_words(&text[self.settled_bytes..])
    }

    pub fn reset(&mut self) {
        self.settled_bytes = 0;
        self.settled_words = 0;
    }
}

/// Byte offset just past the last whitespace in `text` that is not inside a tag.
fn settle_point(text: &str) -> Option<usize> {
    let mut in_tag = false;
    let mut cut = None;
    for (i, c) in text.char_indices() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if c.is_whitespace() && !in_tag => cut = Some(i + c.len_utf8()),
            _ => {}
        }
    }
    cut
}

// ============================================================================
// Reconciliation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Match,
    WithinTolerance { local: usize, server: usize },
    Diverged { local: usize, server: usize },
}

/// Compares the local count against a server-declared one.
///
/// `tolerance` is a fraction of the larger count. Divergence is logged only.
pub fn reconcile(local: usize, server: usize, tolerance: f64) -> Reconciliation {
    if local == server {
        return Reconciliation::Match;
    }
    let diff = local.abs_diff(server) as f64;
    let allowed = (local.max(server) as f64 * tolerance).max(1.0);
    if diff <= allowed {
        log::debug!("word count drift within tolerance: local={} server={}", local, server);
        Reconciliation::WithinTolerance { local, server }
    } else {
        log::warn!("⚠️  word count diverged: local={} server={}", local, server);
        Reconciliation::Diverged { local, server }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_and_whitespace() {
        assert_eq!(count_words(""), 0);
        assert_eq!(count_words("   \n\t "), 0);
    }

    #[test]
    fn test_html_stripped() {
        assert_eq!(count_words("<p>Hello world</p>"), 2);
        assert_eq!(count_words("<h2>Intro</h2><p>One two</p>"), 3);
        assert_eq!(count_words("<br/>"), 0);
    }

    #[test]
    fn test_punctuation_and_spacing() {
        assert_eq!(count_words("Hello,   world!  It's\nfine."), 5);
        let s = "a b c";
        assert_eq!(count_words(s), count_words(s));
    }

    #[test]
    fn test_tally_matches_full_count_for_any_chunking() {
        let text = "<h2>Intro</h2><p>Hello wonderful world, it's   a\nfine day.</p><p>Next <em>part</em> here</p> tail";
        for size in 1..9 {
            let mut tally = WordTally::new();
            let mut buffer = String::new();
            for chunk in text.as_bytes().chunks(size) {
                buffer.push_str(std::str::from_utf8(chunk).unwrap());
                assert_eq!(tally.update(&buffer), count_words(&buffer), "chunk size {}: {:?}", size, buffer);
            }
        }
    }

    #[test]
    fn test_tally_settles_and_resets() {
        let mut tally = WordTally::new();
        assert_eq!(tally.update("one two thr"), 3);
        assert_eq!(tally.settled_bytes, "one two ".len());
        assert_eq!(tally.update("one two three four"), 4);

        tally.reset();
        assert_eq!(tally.update("fresh"), 1);
        assert_eq!(tally.update(""), 0);
    }

    #[test]
    fn test_reconcile() {
        assert_eq!(reconcile(100, 100, 0.05), Reconciliation::Match);
        assert!(matches!(
            reconcile(100, 103, 0.05),
            Reconciliation::WithinTolerance { .. }
        ));
        assert!(matches!(reconcile(100, 150, 0.05), Reconciliation::Diverged { .. }));
    }
}
