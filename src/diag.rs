//! Structured diagnostics.
//!
//! Every recoverable condition met while building a tune is reported
//! through this channel and never aborts the run: the builder repairs
//! what it can (auto-close, adopt the larger duration, drop the
//! reference) and keeps going.

use serde::Serialize;
use thiserror::Error;

use crate::model::{SourceSpan, SymId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Warning,
    Error,
}

/// What went wrong.  The taxonomy mirrors the recovery applied:
/// structural problems are auto-closed, duration mismatches adopt the
/// larger time, measure checks never alter timing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiagKind {
    #[error("no end of tuplet")]
    UnterminatedTuplet,
    #[error("no end of voice overlay")]
    UnterminatedOverlay,
    #[error("voice overlay already started")]
    NestedOverlay,
    #[error("erroneous end of voice overlay")]
    StrayOverlayEnd,
    #[error("no note in voice overlay")]
    EmptyOverlay,
    #[error("wrong duration in voice overlay (got {got}, expected {expected})")]
    OverlayDurationMismatch { got: i32, expected: i32 },
    #[error("bad measure duration")]
    BadMeasureDuration,
    #[error("bad staff definition")]
    BadStaffSpec,
    #[error("cannot clone the wildcard voice in the tune body")]
    WildcardVoiceInBody,
    #[error("mix of document and voice transposition")]
    MixedTransposition,
}

/// One reported condition.  `sym` points into the tune arena when the
/// condition is attached to an already linked symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagKind,
    pub sym: Option<SymId>,
    pub span: Option<SourceSpan>,
}

impl Diagnostic {
    pub fn new(severity: Severity, kind: DiagKind) -> Self {
        Diagnostic { severity, kind, sym: None, span: None }
    }

    pub fn with_sym(mut self, sym: SymId) -> Self {
        self.sym = Some(sym);
        self
    }

    pub fn with_span(mut self, span: SourceSpan) -> Self {
        self.span = Some(span);
        self
    }
}

/// Receives diagnostics as they are produced.  A plain `Vec` works as a
/// collector.
pub trait DiagSink {
    fn report(&mut self, diag: Diagnostic);
}

impl DiagSink for Vec<Diagnostic> {
    fn report(&mut self, diag: Diagnostic) {
        self.push(diag);
    }
}

/// Log a diagnostic, then hand it to the sink.
pub(crate) fn emit(sink: &mut impl DiagSink, diag: Diagnostic) {
    match diag.severity {
        Severity::Warning => log::warn!("{}", diag.kind),
        Severity::Error => log::error!("{}", diag.kind),
    }
    sink.report(diag);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_messages() {
        let k = DiagKind::OverlayDurationMismatch { got: 768, expected: 1152 };
        assert_eq!(
            k.to_string(),
            "wrong duration in voice overlay (got 768, expected 1152)"
        );
        assert_eq!(DiagKind::UnterminatedTuplet.to_string(), "no end of tuplet");
    }

    #[test]
    fn vec_collects() {
        let mut sink: Vec<Diagnostic> = Vec::new();
        sink.report(Diagnostic::new(Severity::Warning, DiagKind::BadMeasureDuration));
        assert_eq!(sink.len(), 1);
    }
}
