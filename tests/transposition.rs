//! Integration tests — transposition requested through voice parameters,
//! the document configuration and directives, checked on the built tunes.

use tunelib::model::acc;
use tunelib::{
    build_tunes, Config, Event, KeyState, NoteHead, SymType, TuneBuilder, VoiceParams, BASE_LEN,
};

const Q: i32 = BASE_LEN / 4;
const WHOLE_TONE: i32 = 6; // base-40

fn note(pit: i32, dur: i32) -> Event {
    Event::Note {
        notes: vec![NoteHead::new(pit, acc::NONE)],
        dur,
        grace: false,
        beam_end: false,
        feathered: None,
    }
}

fn key(sf: i32) -> Event {
    Event::Key {
        key: KeyState { sf, ..KeyState::default() },
        has_sf: true,
    }
}

fn pitches(t: &tunelib::Tune, v: usize) -> Vec<(i32, i8)> {
    t.voice_iter(v)
        .filter(|(_, s)| s.typ == SymType::Note)
        .map(|(_, s)| (s.notes[0].pit, s.notes[0].acc))
        .collect()
}

#[test]
fn voice_score_parameter_transposes_notes_and_key() {
    let mut b = TuneBuilder::default();
    b.event(key(0));
    b.event(Event::Voice {
        ids: vec!["T".to_string()],
        params: VoiceParams { transp: Some(WHOLE_TONE), ..Default::default() },
    });
    // C D E up a whole tone
    b.event(note(16, Q));
    b.event(note(17, Q));
    b.event(note(18, Q));
    b.finish();
    let tunes = b.into_tunes();
    let t = &tunes[0];
    assert_eq!(
        pitches(t, 0),
        vec![(17, acc::NONE), (18, acc::NONE), (19, acc::NONE)]
    );
    // C major became D major
    assert_eq!(t.voices[0].key.sf, 2);
}

#[test]
fn document_transposition_applies_to_the_default_voice() {
    let events = vec![key(0), note(16, Q), note(18, Q)];
    let cfg = Config { transpose: Some(WHOLE_TONE), ..Config::default() };
    let (tunes, diags) = build_tunes(events, cfg);
    assert!(diags.is_empty());
    assert_eq!(pitches(&tunes[0], 0), vec![(17, acc::NONE), (19, acc::NONE)]);
    assert_eq!(tunes[0].voices[0].key.sf, 2);
}

#[test]
fn transpose_directive_in_semitones() {
    let events = vec![
        Event::Directive { name: "transpose".to_string(), param: "2".to_string() },
        key(0),
        note(16, Q),
    ];
    let (tunes, _) = build_tunes(events, Config::default());
    assert_eq!(pitches(&tunes[0], 0), vec![(17, acc::NONE)]);
}

#[test]
fn explicit_accidentals_keep_their_spelling() {
    let mut b = TuneBuilder::default();
    b.event(key(0));
    b.event(Event::Voice {
        ids: vec!["T".to_string()],
        params: VoiceParams { transp: Some(WHOLE_TONE), ..Default::default() },
    });
    b.event(Event::Note {
        notes: vec![NoteHead::new(16, acc::SHARP)], // C#
        dur: Q,
        grace: false,
        beam_end: false,
        feathered: None,
    });
    b.finish();
    let tunes = b.into_tunes();
    // C# up a whole tone is D#
    assert_eq!(pitches(&tunes[0], 0), vec![(17, acc::SHARP)]);
}

#[test]
fn playback_transposition_leaves_the_spelling_alone() {
    let mut b = TuneBuilder::default();
    b.event(key(0));
    b.event(Event::Voice {
        ids: vec!["T".to_string()],
        params: VoiceParams { snd_transp: Some(WHOLE_TONE), ..Default::default() },
    });
    b.event(note(16, Q));
    b.finish();
    let tunes = b.into_tunes();
    let t = &tunes[0];
    assert_eq!(pitches(t, 0), vec![(16, acc::NONE)]);
    assert_eq!(t.voices[0].key.sf, 0);
    assert_eq!(t.voices[0].key.snd_transp, Some(WHOLE_TONE));
}

#[test]
fn bagpipe_key_is_exempt() {
    // a document transposition must not move a bagpipe voice
    let events = vec![
        Event::Key {
            key: KeyState { sf: 2, bagpipe: true, ..KeyState::default() },
            has_sf: true,
        },
        note(16, Q),
    ];
    let cfg = Config { transpose: Some(WHOLE_TONE), ..Config::default() };
    let (tunes, _) = build_tunes(events, cfg);
    assert_eq!(pitches(&tunes[0], 0), vec![(16, acc::NONE)]);
    assert_eq!(tunes[0].voices[0].key.sf, 2);
}

#[test]
fn mid_tune_key_change_keeps_transposing() {
    let mut b = TuneBuilder::default();
    b.event(key(0));
    b.event(Event::Voice {
        ids: vec!["T".to_string()],
        params: VoiceParams { transp: Some(WHOLE_TONE), ..Default::default() },
    });
    b.event(note(16, Q)); // C in C major -> D
    b.event(key(-1)); // to F major
    b.event(note(22, Q)); // B(b) in F major -> C natural-ish spelling in G major
    b.finish();
    let tunes = b.into_tunes();
    let t = &tunes[0];
    let ps = pitches(t, 0);
    assert_eq!(ps[0], (17, acc::NONE));
    assert_eq!(ps[1], (23, acc::NONE));
    // the linked key signature moved from F (-1) to G (1)
    let k = t
        .voice_iter(0)
        .find(|(_, s)| s.typ == SymType::Key)
        .and_then(|(_, s)| s.key.clone())
        .unwrap();
    assert_eq!(k.sf, 1);
}
