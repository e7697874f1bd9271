//! Reconstructs structured messages from raw worker rows.
//!
//! The worker announces field names once per topic and then only sends
//! values, so the parser keeps the headers it has seen. Sample output also
//! embeds a short textual sub-protocol at the end of warm-up:
//!
//! ```text
//! SAMPLE ["lp__", "accept_stat__", ..., "y"]      header (cached, not emitted)
//! SAMPLE "Adaptation terminated"                  -> Adapting
//! SAMPLE "Step size = 0.809818"
//! SAMPLE "Diagonal elements of inverse mass matrix:"  -> MassMatrix
//! SAMPLE 0.961989                                 last adaptation row -> Normal
//! SAMPLE [-3.16e-06, 0.99, ..., 0.0025]           draw, zipped with header
//! ```
//!
//! A parser instance covers exactly one run.

use super::message::{Feature, RawValue, Topic, WriterMessage, WriterRecord};

/// Line after which exactly one more adaptation row follows.
pub const MASS_MATRIX_MARKER: &str = "Diagonal elements of inverse mass matrix:";

/// Where the sample stream is with respect to the adaptation report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SamplePhase {
    /// Numeric rows are draws.
    #[default]
    Normal,
    /// Inside the textual adaptation report.
    Adapting,
    /// Marker seen; the next row holds the mass-matrix diagonal.
    MassMatrix,
}

#[derive(Debug, Default)]
pub struct WriterParser {
    sample_header: Option<Vec<String>>,
    diagnostic_header: Option<Vec<String>>,
    phase: SamplePhase,
}

impl WriterParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> SamplePhase {
        self.phase
    }

    pub fn sample_header(&self) -> Option<&[String]> {
        self.sample_header.as_deref()
    }

    /// Convert one raw row. Returns `None` for headers and blank rows.
    pub fn parse(&mut self, record: WriterRecord) -> Option<WriterMessage> {
        if record.values.is_empty() || record.is_blank() {
            return None;
        }
        match record.topic {
            Topic::Logger => Some(WriterMessage::strings(
                Topic::Logger,
                record.values.iter().map(RawValue::to_text),
            )),
            Topic::Initialization => Some(Self::unnamed(Topic::Initialization, &record)),
            Topic::Sample => self.parse_sample(record),
            Topic::Diagnostic => self.parse_diagnostic(record),
        }
    }

    fn parse_sample(&mut self, record: WriterRecord) -> Option<WriterMessage> {
        let Some(header) = &self.sample_header else {
            self.sample_header = Some(Self::header(&record));
            return None;
        };

        match self.phase {
            SamplePhase::Normal if record.is_numeric() => {
                Some(Self::zipped(Topic::Sample, header, &record))
            }
            SamplePhase::Normal | SamplePhase::Adapting => {
                // Any text row while drawing opens (or continues) the
                // adaptation report; numeric rows inside it are unnamed.
                self.phase = if Self::is_marker(&record) {
                    SamplePhase::MassMatrix
                } else {
                    SamplePhase::Adapting
                };
                Some(Self::unnamed(Topic::Sample, &record))
            }
            SamplePhase::MassMatrix => {
                self.phase = SamplePhase::Normal;
                Some(Self::unnamed(Topic::Sample, &record))
            }
        }
    }

    fn parse_diagnostic(&mut self, record: WriterRecord) -> Option<WriterMessage> {
        let Some(header) = &self.diagnostic_header else {
            self.diagnostic_header = Some(Self::header(&record));
            return None;
        };
        if record.is_numeric() {
            Some(Self::zipped(Topic::Diagnostic, header, &record))
        } else {
            Some(Self::unnamed(Topic::Diagnostic, &record))
        }
    }

    fn header(record: &WriterRecord) -> Vec<String> {
        record.values.iter().map(RawValue::to_text).collect()
    }

    fn is_marker(record: &WriterRecord) -> bool {
        matches!(record.values.first(), Some(RawValue::Text(s)) if s.trim() == MASS_MATRIX_MARKER)
    }

    fn zipped(topic: Topic, header: &[String], record: &WriterRecord) -> WriterMessage {
        let feature = header
            .iter()
            .zip(&record.values)
            .filter_map(|(name, value)| value.as_number().map(|v| Feature::named(name.clone(), v)))
            .collect();
        WriterMessage::new(topic, feature)
    }

    /// Numbers stay numbers, text stays text, no names attached.
    fn unnamed(topic: Topic, record: &WriterRecord) -> WriterMessage {
        let feature = record
            .values
            .iter()
            .map(|value| match value {
                RawValue::Number(n) => Feature::double(*n),
                RawValue::Text(s) => Feature::string(s.clone()),
            })
            .collect();
        WriterMessage::new(topic, feature)
    }
}
