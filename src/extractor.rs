//! Parses the rendered results page into `MarketResult` records.
//!
//! Markup drift (missing label or value elements, short value strings) is
//! tolerated by defaulting to empty strings; nothing here returns an error.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::types::MarketResult;

/// Every immediate child element of the results container, whatever its tag.
static ENTRY_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".satta-main-result > *").expect("valid entry selector"));
static LABEL_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h4").expect("valid label selector"));
static VALUE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("span").expect("valid value selector"));

/// Separator between the open, jodi and close segments of the value field.
const NUMBER_DELIMITER: char = '-';

/// Extract all market entries from `html` in document order.
pub fn extract(html: &str, captured_at: DateTime<Utc>) -> Vec<MarketResult> {
    let doc = Html::parse_document(html);
    let mut visited = 0usize;

    let results: Vec<MarketResult> = doc
        .select(&ENTRY_SELECTOR)
        .enumerate()
        .filter_map(|(i, entry)| {
            visited += 1;
            let result = parse_entry(entry, i as u32 + 1, captured_at);
            let keep = !result.market_name.is_empty() || !result.raw_numbers.is_empty();
            keep.then_some(result)
        })
        .collect();

    debug!(visited, kept = results.len(), "Extracted market entries");
    results
}

fn parse_entry(entry: ElementRef<'_>, position: u32, captured_at: DateTime<Utc>) -> MarketResult {
    let market_name = descendant_text(entry, &LABEL_SELECTOR);
    let raw_numbers = descendant_text(entry, &VALUE_SELECTOR);
    let [open, jodi, close] = split_numbers(&raw_numbers);
    let raw_text = entry.text().collect::<String>().trim().to_string();

    MarketResult {
        market_name,
        raw_numbers,
        open,
        jodi,
        close,
        raw_text,
        position,
        captured_at,
    }
}

/// Concatenated text of every descendant matching `selector`, trimmed.
fn descendant_text(entry: ElementRef<'_>, selector: &Selector) -> String {
    entry
        .select(selector)
        .flat_map(|el| el.text())
        .collect::<String>()
        .trim()
        .to_string()
}

/// `"599-39-568"` → `["599", "39", "568"]`. Missing segments are empty,
/// anything past the third is dropped.
pub fn split_numbers(raw: &str) -> [String; 3] {
    let mut parts = raw.split(NUMBER_DELIMITER);
    let mut next = || parts.next().unwrap_or_default().to_string();
    [next(), next(), next()]
}
