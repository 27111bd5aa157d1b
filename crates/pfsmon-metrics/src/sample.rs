use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One timestamped measurement from one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub host: String,
    pub subsystem: String,
    pub key: String,
    pub value: f64,
}

impl MetricSample {
    pub fn new(
        host: impl Into<String>,
        subsystem: impl Into<String>,
        key: impl Into<String>,
        value: f64,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            host: host.into(),
            subsystem: subsystem.into(),
            key: key.into(),
            value,
        }
    }

    /// Render as one line-protocol point:
    /// `<key>,host=<host>,subsystem=<subsystem> value=<value> <ns>`
    pub fn to_line_protocol(&self) -> String {
        let nanos = self
            .timestamp
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.timestamp.timestamp_millis() * 1_000_000);
        format!(
            "{},host={},subsystem={} value={} {}",
            escape(&self.key),
            escape(&self.host),
            escape(&self.subsystem),
            self.value,
            nanos
        )
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, ',' | ' ' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
