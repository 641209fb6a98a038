//! Content-Derived Stock Classifier
//!
//! Scans the text of a successfully fetched page for stock-state phrases.
//! Matchers run in a fixed precedence order over normalized text; the first
//! match wins. Evaluated only on pages the verifier classified `ok`.

use regex::Regex;
use scraper::Html;

use crate::models::outcome::StockSignal;

enum Pattern {
    Phrase(&'static str),
    /// Regex with an optional numeric capture for the remaining count.
    Count(Regex),
}

enum MatcherKind {
    OutOfStock,
    LowStock,
    InStock,
}

struct SignalMatcher {
    kind: MatcherKind,
    patterns: Vec<Pattern>,
}

/// Ordered matcher set. Out-of-stock wording dominates low-stock wording,
/// which dominates in-stock wording; pages matching nothing are `unknown`.
pub struct StockMatcher {
    matchers: Vec<SignalMatcher>,
}

impl Default for StockMatcher {
    fn default() -> Self {
        let count_patterns = [
            r"only\s+(\d+)\s+left",
            r"(\d+)\s+(?:items?|units?)\s+left",
            r"last\s+(\d+)\s+remaining",
        ]
        .iter()
        .map(|p| Pattern::Count(Regex::new(p).unwrap()))
        .collect::<Vec<_>>();

        let mut low_patterns = count_patterns;
        low_patterns.push(Pattern::Phrase("low stock"));
        low_patterns.push(Pattern::Phrase("almost gone"));
        low_patterns.push(Pattern::Phrase("last one"));

        Self {
            matchers: vec![
                SignalMatcher {
                    kind: MatcherKind::OutOfStock,
                    patterns: vec![
                        Pattern::Phrase("out of stock"),
                        Pattern::Phrase("sold out"),
                        Pattern::Phrase("currently unavailable"),
                        Pattern::Phrase("no longer available"),
                        Pattern::Phrase("discontinued"),
                    ],
                },
                SignalMatcher {
                    kind: MatcherKind::LowStock,
                    patterns: low_patterns,
                },
                SignalMatcher {
                    kind: MatcherKind::InStock,
                    patterns: vec![
                        Pattern::Phrase("in stock"),
                        Pattern::Phrase("add to cart"),
                        Pattern::Phrase("add to basket"),
                        Pattern::Phrase("buy now"),
                    ],
                },
            ],
        }
    }
}

impl StockMatcher {
    /// Classify a raw HTML page body.
    pub fn classify(&self, html: &str) -> StockSignal {
        let text = normalize_page_text(html);
        for matcher in &self.matchers {
            for pattern in &matcher.patterns {
                let count = match pattern {
                    Pattern::Phrase(phrase) => {
                        if text.contains(phrase) {
                            Some(1)
                        } else {
                            None
                        }
                    }
                    Pattern::Count(regex) => regex.captures(&text).map(|caps| {
                        caps.get(1)
                            .and_then(|m| m.as_str().parse::<u32>().ok())
                            .unwrap_or(1)
                    }),
                };
                if let Some(count) = count {
                    return match matcher.kind {
                        MatcherKind::OutOfStock => StockSignal::OutOfStock,
                        MatcherKind::LowStock => StockSignal::LowStock { count },
                        MatcherKind::InStock => StockSignal::InStock,
                    };
                }
            }
        }
        StockSignal::Unknown
    }
}

/// Strip markup and normalize for matching: visible text only, lowercased,
/// whitespace collapsed.
fn normalize_page_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let text: Vec<&str> = document.root_element().text().collect();
    text.join(" ")
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
