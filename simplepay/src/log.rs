//! Structured transaction log records.
//!
//! Every component describes what it did as a [`LogRecord`]: a flat, ordered
//! list of `(key, value)` pairs plus the correlation fields order reference,
//! transaction id, interface name and timestamp. Nested JSON is flattened
//! with underscore-joined paths (`payment.card.number` becomes
//! `payment_card_number`).
//!
//! Secret-bearing keys are dropped while the record is built, so no
//! [`Logger`] implementation can ever see them. Long digit runs that look
//! like card numbers are masked down to their last four digits.
//!
//! Records are handed to a [`Logger`]. [`TracingLogger`] forwards them as
//! `tracing` events on the `simplepay::transaction` target; [`MemoryLogger`]
//! keeps them for inspection. Writing log files is left to the application,
//! which can use [`LogRecord::lines`] for the classic pipe-separated format.
//!
//! # Examples
//!
//! ```
//! use serde_json::json;
//! use simplepay::log::LogRecord;
//!
//! let record = LogRecord::new("start")
//!     .with_order_ref("101")
//!     .with_value("", &json!({"payment": {"card": {"cardSecret": "s3cr3t", "holder": "A"}}}));
//!
//! assert_eq!(record.get("payment_card_holder"), Some("A"));
//! assert!(record.get("payment_card_cardSecret").is_none());
//! ```

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Keys never written to a record, compared without case.
pub const DENYLIST: &[&str] = &["cardSecret", "secretKey", "secret_key", "merchantKey"];

/// Sink for log records.
pub trait Logger: Send + Sync {
    /// Accepts one record.
    fn log(&self, record: &LogRecord);
}

impl<L: Logger + ?Sized> Logger for Arc<L> {
    fn log(&self, record: &LogRecord) {
        (**self).log(record);
    }
}

impl<L: Logger + ?Sized> Logger for &L {
    fn log(&self, record: &LogRecord) {
        (**self).log(record);
    }
}

/// One log record with its correlation fields.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Merchant order reference.
    pub order_ref: String,
    /// Gateway transaction id.
    pub transaction_id: String,
    /// Interface that produced the record, e.g. `start` or `backref`.
    pub interface: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    entries: Vec<(String, String)>,
}

impl LogRecord {
    /// Creates an empty record stamped with the current time.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            order_ref: String::new(),
            transaction_id: String::new(),
            interface: interface.into(),
            timestamp: Utc::now(),
            entries: Vec::new(),
        }
    }

    /// Sets the order reference.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_order_ref(mut self, order_ref: impl Into<String>) -> Self {
        self.order_ref = order_ref.into();
        self
    }

    /// Sets the transaction id.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = transaction_id.into();
        self
    }

    /// Overrides the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Appends one entry unless its key is denylisted.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_entry(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.push(key.into(), value.to_string());
        self
    }

    /// Flattens `value` under `prefix` and appends every leaf.
    ///
    /// An empty prefix flattens an object's keys at top level. Array
    /// elements are keyed by index. Denylisted keys are skipped together
    /// with everything below them, as is everything under a denylisted prefix.
    #[must_use]
    pub fn with_value(mut self, prefix: &str, value: &Value) -> Self {
        if is_denied_path(prefix) {
            return self;
        }
        self.flatten(prefix.to_owned(), value);
        self
    }

    fn flatten(&mut self, path: String, value: &Value) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    if is_denied_path(key) {
                        continue;
                    }
                    self.flatten(join(&path, key), child);
                }
            }
            Value::Array(items) => {
                for (index, child) in items.iter().enumerate() {
                    self.flatten(join(&path, &index.to_string()), child);
                }
            }
            Value::String(text) => self.push(path, text.clone()),
            Value::Null => self.push(path, String::new()),
            other => self.push(path, other.to_string()),
        }
    }

    fn push(&mut self, key: String, value: String) {
        if key.is_empty() || is_denied_path(&key) {
            return;
        }
        self.entries.push((key, mask_card_numbers(&value)));
    }

    /// Entries in insertion order.
    #[must_use]
    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    /// Value of the first entry with `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(name, _)| name == key).map(|(_, value)| value.as_str())
    }

    /// Renders `orderRef|transactionId|interface|timestamp|key|value`, one line per entry.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        let stamp = self.timestamp.format("%Y-%m-%d %H:%M:%S");
        self.entries
            .iter()
            .map(|(key, value)| {
                format!(
                    "{}|{}|{}|{stamp}|{key}|{}",
                    self.order_ref,
                    self.transaction_id,
                    self.interface,
                    value.replace(['\r', '\n'], " ")
                )
            })
            .collect()
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() { key.to_owned() } else { format!("{path}_{key}") }
}

/// `true` when any `_`-separated run of segments in `path` is denylisted.
fn is_denied_path(path: &str) -> bool {
    let segments: Vec<String> = path.split('_').map(str::to_ascii_lowercase).collect();
    DENYLIST.iter().any(|denied| {
        let needle: Vec<String> = denied.split('_').map(str::to_ascii_lowercase).collect();
        segments.windows(needle.len()).any(|window| window == needle.as_slice())
    })
}

/// Copy of `value` with every denylisted key removed, at any depth.
#[must_use]
pub fn redact_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !is_denied_path(key))
                .map(|(key, child)| (key.clone(), redact_json(child)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_json).collect()),
        other => other.clone(),
    }
}

/// Redacts JSON text for logging. Text that is not JSON is returned unchanged.
#[must_use]
pub fn redact_json_text(text: &str) -> String {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => redact_json(&value).to_string(),
        _ => text.to_owned(),
    }
}

/// Masks digit runs of 13 to 19 characters, keeping the last four digits.
#[must_use]
pub fn mask_card_numbers(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut run = String::new();

    let flush = |run: &mut String, output: &mut String| {
        if (13..=19).contains(&run.len()) {
            let keep = run.len() - 4;
            output.extend(std::iter::repeat_n('X', keep));
            output.push_str(run.get(keep..).unwrap_or_default());
        } else {
            output.push_str(run);
        }
        run.clear();
    };

    for ch in input.chars() {
        if ch.is_ascii_digit() {
            run.push(ch);
        } else {
            flush(&mut run, &mut output);
            output.push(ch);
        }
    }
    flush(&mut run, &mut output);
    output
}

/// Forwards records to `tracing`, one event per entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, record: &LogRecord) {
        for (key, value) in &record.entries {
            tracing::info!(
                target: "simplepay::transaction",
                order_ref = %record.order_ref,
                transaction_id = %record.transaction_id,
                interface = %record.interface,
                timestamp = %record.timestamp.to_rfc3339(),
                key = %key,
                value = %value,
                "LOG"
            );
        }
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogger {
    /// Creates an empty logger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record received so far.
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Every rendered line of every record.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.records().iter().flat_map(LogRecord::lines).collect()
    }
}

impl Logger for MemoryLogger {
    fn log(&self, record: &LogRecord) {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).push(record.clone());
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_flatten_nested_paths() {
        let record = LogRecord::new("start").with_value(
            "",
            &json!({"orderRef": "101", "items": [{"ref": "A"}, {"ref": "B"}], "total": 12.5}),
        );
        assert_eq!(record.get("orderRef"), Some("101"));
        assert_eq!(record.get("items_0_ref"), Some("A"));
        assert_eq!(record.get("items_1_ref"), Some("B"));
        assert_eq!(record.get("total"), Some("12.5"));
    }

    #[test]
    fn test_card_secret_never_logged() {
        let record = LogRecord::new("start")
            .with_value("", &json!({"payment": {"card": {"cardSecret": "x", "last4": "1111"}}}))
            .with_value("payment_card", &json!({"CARDSECRET": "y"}))
            .with_entry("payment_card_cardSecret", "z")
            .with_value("payment_card_cardSecret", &json!("w"));

        assert!(record.entries().iter().all(|(key, _)| !key.to_lowercase().contains("cardsecret")));
        assert_eq!(record.get("payment_card_last4"), Some("1111"));
    }

    #[test]
    fn test_denylisted_segment_anywhere_in_path_dropped() {
        let record = LogRecord::new("start")
            .with_value("payment_card_cardSecret", &json!({"value": "s3cr3t"}))
            .with_entry("cardSecret_raw", "s3cr3t2")
            .with_entry("HUF_SECRET_KEY_old", "k")
            .with_value("", &json!({"wrap": {"cardSecret_copy": "s3cr3t3"}, "secret": "kept"}));

        assert_eq!(record.entries(), &[("secret".to_owned(), "kept".to_owned())]);
        assert!(record.lines().iter().all(|line| !line.contains("s3cr3t")));
    }

    #[test]
    fn test_secret_key_entries_dropped() {
        let record = LogRecord::new("config").with_entry("HUF_SECRET_KEY", "k").with_entry("secretKey", "k");
        assert!(record.entries().is_empty());
    }

    #[test]
    fn test_redact_json_text() {
        let text = r#"{"orderRef":"1","card":{"cardSecret":"x","last4":"1111"}}"#;
        let redacted = redact_json_text(text);
        assert!(!redacted.contains("cardSecret"));
        assert!(redacted.contains("last4"));
        assert_eq!(redact_json_text("plain"), "plain");
    }

    #[test]
    fn test_mask_card_numbers() {
        assert_eq!(mask_card_numbers("card 4908366099900425 ok"), "card XXXXXXXXXXXX0425 ok");
        assert_eq!(mask_card_numbers("order 101010514"), "order 101010514");
    }

    #[test]
    fn test_lines_format() {
        let record = LogRecord::new("finish")
            .with_order_ref("101")
            .with_transaction_id("5000")
            .with_timestamp(Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap())
            .with_entry("callState", "PREPARE")
            .with_entry("note", "a\nb");
        assert_eq!(
            record.lines(),
            ["101|5000|finish|2024-03-01 12:30:05|callState|PREPARE", "101|5000|finish|2024-03-01 12:30:05|note|a b"]
        );
    }

    #[test]
    fn test_memory_logger_shared() {
        let logger = Arc::new(MemoryLogger::new());
        let shared: Arc<MemoryLogger> = Arc::clone(&logger);
        shared.log(&LogRecord::new("ipn").with_entry("k", "v"));
        assert_eq!(logger.records().len(), 1);
        assert_eq!(logger.lines().len(), 1);
    }
}
