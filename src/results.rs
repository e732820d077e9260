//! Result set of a test run and the milestones reported while building it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Serialize, Serializer};
use tracing::warn;

use crate::message::TestKind;

/// Client-side upload estimate, then the server-reported upload rate (kbit/s).
pub const C2S_RATE: &str = "c2s_rate";
/// Upload rate computed from the bytes this client sent (kbit/s).
pub const C2S_CLIENT_RATE: &str = "c2s_client_rate";
/// Download rate measured by this client (kbit/s).
pub const S2C_RATE: &str = "s2c_rate";
/// Download rate as reported by the server, kept for comparison.
pub const S2C_SERVER_RATE: &str = "s2c_server_rate";

/// Key under which interval reports for `test` are stored.
pub fn rate_key(test: TestKind) -> &'static str {
    match test {
        TestKind::C2s => C2S_RATE,
        _ => S2C_RATE,
    }
}

/// A single result variable.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// Computed by this client.
    Number(f64),
    /// Sent by the server, kept verbatim.
    Text(String),
}

impl Value {
    /// Numeric view; text values are parsed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Text view; `None` for numbers.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Number(_) => None,
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

/// Variables collected during a run. Later writes replace earlier ones;
/// nothing is ever removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Results {
    vars: BTreeMap<String, Value>,
}

impl Results {
    /// An empty result set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `name`, replacing any earlier value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// Numeric value of `name`, parsing text values.
    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Merge newline-delimited `name: value` pairs, as carried by `MSG_RESULTS`.
    ///
    /// Names are trimmed; values are kept as sent. Lines without a `": "`
    /// separator are skipped.
    pub fn merge_lines(&mut self, text: &str) {
        for line in text.split('\n') {
            if line.trim().is_empty() {
                continue;
            }
            match line.split_once(": ") {
                Some((name, value)) => self.insert(name.trim(), value),
                None => warn!(line, "skipping result line without a separator"),
            }
        }
    }

    /// Merge one web100 `Name: Value` line, dropping line breaks from the value.
    ///
    /// Returns `false` when the line has no separator.
    pub fn merge_variable(&mut self, line: &str) -> bool {
        let Some((name, value)) = line.split_once(": ") else {
            return false;
        };
        let value: String = value.chars().filter(|c| !matches!(c, '\r' | '\n')).collect();
        self.insert(name, value);
        true
    }
}

/// Named milestones reported to the caller while a run progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    /// `TEST_PREPARE` arrived.
    Preparing(TestKind),
    /// `TEST_START` arrived.
    Running(TestKind),
    /// A periodic rate estimate was stored under the test's rate key.
    Interval(TestKind),
    /// The sub-test handled `TEST_FINALIZE`.
    Finished(TestKind),
    /// The server logged out after every sub-test.
    FinishedAll,
}

impl StateChange {
    /// Label such as `preparing_c2s` or `finished_all`.
    pub fn label(&self) -> String {
        match self {
            StateChange::Preparing(t) => format!("preparing_{}", t.label()),
            StateChange::Running(t) => format!("running_{}", t.label()),
            StateChange::Interval(t) => format!("interval_{}", t.label()),
            StateChange::Finished(t) => format!("finished_{}", t.label()),
            StateChange::FinishedAll => "finished_all".to_owned(),
        }
    }

    pub fn test(&self) -> Option<TestKind> {
        match self {
            StateChange::Preparing(t)
            | StateChange::Running(t)
            | StateChange::Interval(t)
            | StateChange::Finished(t) => Some(*t),
            StateChange::FinishedAll => None,
        }
    }
}

impl fmt::Display for StateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl Serialize for StateChange {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_results_message() {
        let mut results = Results::new();
        results.merge_lines("MinRTT: 5\nMaxRTT: 20\n");

        assert_eq!(results.text("MinRTT"), Some("5"));
        assert_eq!(results.text("MaxRTT"), Some("20"));
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn later_writes_win() {
        let mut results = Results::new();
        results.insert(C2S_RATE, 10.0);
        results.merge_lines("c2s_rate: 99");
        assert_eq!(results.text(C2S_RATE), Some("99"));
        assert_eq!(results.number(C2S_RATE), Some(99.0));
    }

    #[test]
    fn result_values_keep_everything_after_first_separator() {
        let mut results = Results::new();
        results.merge_lines(" Note : a: b\ngarbage");
        assert_eq!(results.text("Note"), Some("a: b"));
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn web100_line_drops_line_breaks() {
        let mut results = Results::new();
        assert!(results.merge_variable("CurMSS: 1448\r\n"));
        assert!(!results.merge_variable("no separator here"));
        assert_eq!(results.text("CurMSS"), Some("1448"));
    }

    #[test]
    fn labels() {
        assert_eq!(StateChange::Preparing(TestKind::C2s).label(), "preparing_c2s");
        assert_eq!(StateChange::Interval(TestKind::S2c).label(), "interval_s2c");
        assert_eq!(StateChange::Finished(TestKind::Meta).label(), "finished_meta");
        assert_eq!(StateChange::FinishedAll.label(), "finished_all");
    }

    #[test]
    fn serializes_as_flat_map() {
        let mut results = Results::new();
        results.insert(S2C_RATE, 1500.5);
        results.insert("MinRTT", "5");

        let json = serde_json::to_value(&results).unwrap();
        assert_eq!(json["s2c_rate"], 1500.5);
        assert_eq!(json["MinRTT"], "5");
    }
}
