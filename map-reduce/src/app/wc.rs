//! Word count over long words.

use crate::{App, KeyValue};

/// Words shorter than this many bytes are dropped.
pub const MIN_WORD_LEN: usize = 8;

pub fn map(_source: &str, contents: &str) -> Vec<KeyValue> {
    contents
        .split_whitespace()
        .filter(|w| w.len() >= MIN_WORD_LEN)
        .map(|w| KeyValue::new(w, "1"))
        .collect()
}

pub fn reduce(_key: &str, values: &[String]) -> String {
    values.len().to_string()
}

pub fn app() -> App {
    App { map, reduce }
}
