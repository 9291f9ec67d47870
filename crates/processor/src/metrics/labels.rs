//! Label sets for processor metrics

use prometheus_client::encoding::EncodeLabelSet;

/// Why a reading or event was diverted (`missing_field`, `window_closed`, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct ReasonLabels {
    pub reason: String,
}

impl ReasonLabels {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Alert severity
#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct SeverityLabels {
    pub severity: String,
}

impl SeverityLabels {
    pub fn new(severity: impl Into<String>) -> Self {
        Self {
            severity: severity.into(),
        }
    }
}

/// Downstream sink name
#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct SinkLabels {
    pub sink: String,
}

impl SinkLabels {
    pub fn new(sink: impl Into<String>) -> Self {
        Self { sink: sink.into() }
    }
}
