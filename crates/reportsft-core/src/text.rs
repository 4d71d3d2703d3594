//! Paragraph segmentation for extracted report text.

use once_cell::sync::Lazy;
use regex::Regex;

/// Paragraphs with this many words or fewer are dropped.
pub const DEFAULT_MIN_WORDS: usize = 10;

/// Number of preceding paragraphs handed to the model as context.
pub const DEFAULT_CONTEXT_PARAGRAPHS: usize = 2;

/// Expand common typographic ligatures found in PDFs.
pub fn expand_ligatures(text: &str) -> String {
    text.replace('\u{FB00}', "ff")
        .replace('\u{FB01}', "fi")
        .replace('\u{FB02}', "fl")
        .replace('\u{FB03}', "ffi")
        .replace('\u{FB04}', "ffl")
        .replace(['\u{FB05}', '\u{FB06}'], "st")
}

/// Collapse every run of whitespace into a single space and trim the ends.
pub fn clean_text(text: &str) -> String {
    static WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
    WS.replace_all(text, " ").trim().to_string()
}

/// Split extracted text into paragraphs.
///
/// Paragraphs are separated by a blank line. Pieces that are empty, or that
/// have `min_words` words or fewer, are dropped. Survivors are returned with
/// ligatures expanded and whitespace collapsed.
pub fn split_paragraphs(text: &str, min_words: usize) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n");
    normalized
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter(|p| p.split_whitespace().count() > min_words)
        .map(|p| clean_text(&expand_ligatures(p)))
        .collect()
}

/// The up-to-`size` paragraphs immediately preceding `index`, in document order.
pub fn context_window(paragraphs: &[String], index: usize, size: usize) -> &[String] {
    let end = index.min(paragraphs.len());
    let start = end.saturating_sub(size);
    &paragraphs[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn clean_text_collapses_whitespace() {
        assert_eq!(clean_text("  a\n b\t\tc  "), "a b c");
        assert_eq!(clean_text(""), "");
    }

    #[test]
    fn split_keeps_only_long_paragraphs() {
        let text = format!("{}\n\n{}\n\n\n\n{}", words(11), words(10), words(25));
        let paras = split_paragraphs(&text, DEFAULT_MIN_WORDS);
        assert_eq!(paras.len(), 2);
        assert_eq!(paras[0], words(11));
        assert_eq!(paras[1], words(25));
    }

    #[test]
    fn split_joins_wrapped_lines() {
        let text = "The Reserve Bank issued new guidelines\non prepaid payment instruments\nfor all regulated entities this year.";
        let paras = split_paragraphs(text, DEFAULT_MIN_WORDS);
        assert_eq!(
            paras,
            vec![
                "The Reserve Bank issued new guidelines on prepaid payment instruments for all regulated entities this year."
            ]
        );
    }

    #[test]
    fn split_handles_crlf_and_ligatures() {
        let text = format!("{} e\u{FB03}cient\r\n\r\n{}", words(11), words(3));
        let paras = split_paragraphs(&text, DEFAULT_MIN_WORDS);
        assert_eq!(paras.len(), 1);
        assert!(paras[0].ends_with("efficient"));
    }

    #[test]
    fn split_of_blank_text_is_empty() {
        assert!(split_paragraphs("\n\n  \n\n", DEFAULT_MIN_WORDS).is_empty());
    }

    #[test]
    fn context_window_takes_preceding_paragraphs() {
        let paras: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        assert!(context_window(&paras, 0, 2).is_empty());
        assert_eq!(context_window(&paras, 1, 2), &paras[0..1]);
        assert_eq!(context_window(&paras, 3, 2), &paras[1..3]);
        assert_eq!(context_window(&paras, 3, 0).len(), 0);
    }
}
