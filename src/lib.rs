//! tunelib — multi-pass construction engine for a symbolic tune model.
//!
//! An external lexer feeds typed [`Event`]s (notes, bars, keys, voice
//! and staff declarations...) into a [`TuneBuilder`], which links them
//! into per-voice symbol lists.  At the end of each tune the builder
//! merges the voices into one global time sequence, numbers the
//! measures and applies the base-40 transposition, producing a [`Tune`]
//! ready for a renderer or a player.
//!
//! # Example
//! ```
//! use tunelib::{Event, KeyState, NoteHead, TuneBuilder, BASE_LEN};
//!
//! let mut builder = TuneBuilder::default();
//! builder.event(Event::Key { key: KeyState::default(), has_sf: true });
//! builder.event(Event::Note {
//!     notes: vec![NoteHead::new(16, 0)], // middle C
//!     dur: BASE_LEN / 4,
//!     grace: false,
//!     beam_end: false,
//!     feathered: None,
//! });
//! builder.finish();
//! let tunes = builder.into_tunes();
//! assert_eq!(tunes.len(), 1);
//! assert!(tunes[0].ts_first.is_some());
//! ```

pub mod builder;
pub mod diag;
pub mod model;
pub mod transpose;

mod barnum;
mod overlay;
mod sequencer;
mod staves;

pub use builder::{Config, Event, Extension, TuneBuilder, VoiceParams};
pub use diag::{DiagKind, DiagSink, Diagnostic, Severity};
pub use model::*;

/// Run a whole event stream through a builder and collect the completed
/// tunes with the diagnostics met on the way.
pub fn build_tunes<I>(events: I, cfg: Config) -> (Vec<Tune>, Vec<Diagnostic>)
where
    I: IntoIterator<Item = Event>,
{
    let mut builder = TuneBuilder::new(cfg);
    for ev in events {
        builder.event(ev);
    }
    builder.finish();
    let diags = builder.take_diagnostics();
    (builder.into_tunes(), diags)
}

/// Serialize a built tune to a JSON string.
/// Useful for passing the model across process boundaries.
pub fn tune_to_json(tune: &Tune) -> Result<String, String> {
    serde_json::to_string_pretty(tune).map_err(|e| format!("JSON serialization error: {e}"))
}
