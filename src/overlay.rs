//! Voice overlays.
//!
//! An overlay plays a second melodic line on the staff of an existing
//! voice.  The extra line goes into a shadow voice (id of the base
//! voice with "o" appended) created on first use and placed right below
//! its base voice in the staff system.  A measure overlay ("&") rewinds
//! the shadow voice to the start of the current measure and ends at the
//! next bar line; a full overlay ("(& ... &)") rewinds to where it was
//! opened and ends at the closing parenthesis.

use crate::builder::{TuneBuilder, Vover};
use crate::diag::{DiagKind, Severity};
use crate::model::{BarInfo, SyVoice, SymType, Symbol};

impl TuneBuilder {
    /// Get or create a voice cloned from the current one: same keys,
    /// clef, meter and staff, empty symbol list.
    fn clone_voice(&mut self, id: &str) -> usize {
        if let Some(v) = self.tune.voices.iter().position(|p| p.id == id) {
            return v;
        }
        let cv = match self.curvoice {
            Some(v) => v,
            None => 0,
        };
        let v = self.tune.voices.len();
        let mut p = self.tune.voices[cv].clone();
        p.v = v;
        p.id = id.to_string();
        p.name = None;
        p.sym = None;
        p.last_sym = None;
        p.last_note = None;
        p.time = 0;
        p.second = false;
        p.floating = false;
        p.eoln = false;
        p.voice_down = None;
        p.is_new = false;
        self.tune.voices.push(p);
        v
    }

    /// Open a full overlay at the current time.
    pub(crate) fn vover_start(&mut self) {
        if self.vover.is_some() {
            self.report(Severity::Error, DiagKind::NestedOverlay);
            return;
        }
        let cv = self.ensure_voice();
        self.vover = Some(Vover {
            bar: None,
            v: cv,
            time: self.tune.voices[cv].time,
        });
    }

    /// Start the next overlay row: switch to the shadow voice, rewound
    /// to the overlay start time.
    pub(crate) fn vover_next(&mut self) {
        let cv = self.ensure_voice();
        match self.tune.voices[cv].last_note {
            Some(n) => self.tune.sym_mut(n).beam_end = true,
            None => {
                self.report(Severity::Error, DiagKind::EmptyOverlay);
                return;
            }
        }

        // the shadow voice rides right below its base voice
        let v2 = match self.tune.voices[cv].voice_down {
            Some(v2) => v2,
            None => {
                let id = format!("{}o", self.tune.voices[cv].id);
                let v2 = self.clone_voice(&id);
                self.tune.voices[cv].voice_down = Some(v2);
                self.tune.voices[v2].second = true;
                self.tune.voices[v2].time = 0;
                let (st, base_range) = match self.tune.systems[self.par_sy].voice(cv) {
                    Some(sv) => (sv.st, sv.range),
                    None => (self.tune.voices[cv].st, 0),
                };
                for sv in self.tune.systems[self.par_sy].voices.iter_mut().flatten() {
                    if sv.range > base_range {
                        sv.range += 1;
                    }
                }
                self.tune.systems[self.par_sy].set_voice(
                    v2,
                    SyVoice { st, range: base_range + 1, second: true },
                );
                self.tune.voices[v2].st = st;
                self.tune.voices[v2].cst = st;
                v2
            }
        };
        self.tune.voices[v2].ulen = self.tune.voices[cv].ulen;
        self.tune.voices[v2].dur_fact = self.tune.voices[cv].dur_fact;

        if self.vover.is_none() {
            // measure overlay: rewind to the start of the measure
            let vtime = self.tune.voices[v2].time;
            let mut bar = "|".to_string();
            let mut time = 0;
            let mut cur = self.tune.voices[cv].last_sym;
            while let Some(id) = cur {
                let s = self.tune.sym(id);
                if s.typ == SymType::Bar {
                    if let Some(b) = &s.bar {
                        bar = b.bar_type.clone();
                    }
                    time = s.time;
                    break;
                }
                if s.time <= vtime {
                    time = s.time;
                    break;
                }
                cur = s.prev;
            }
            self.vover = Some(Vover { bar: Some(bar), v: cv, time });
        } else if let Some(vo) = self.vover.as_ref() {
            let vo_v = vo.v;
            if cv != vo_v {
                let got = self.tune.voices[cv].time;
                let expected = self.tune.voices[vo_v].time;
                if got != expected {
                    self.report(
                        Severity::Error,
                        DiagKind::OverlayDurationMismatch { got, expected },
                    );
                    if got > expected {
                        self.tune.voices[vo_v].time = got;
                    }
                }
            }
        }

        let (vo_time, vo_bar) = match self.vover.as_ref() {
            Some(vo) => (vo.time, vo.bar.clone()),
            None => (0, None),
        };
        self.tune.voices[v2].time = vo_time;
        self.curvoice = Some(v2);

        // a measure overlay away from the tune start opens on an
        // invisible copy of the bar line
        if let Some(bt) = vo_bar {
            if vo_time > 0 {
                let mut s = Symbol::new(SymType::Bar);
                s.invisible = true;
                s.bar = Some(BarInfo::new(&bt));
                self.sym_link(s);
            }
        }
    }

    /// Close the overlay and return to the base voice.
    pub(crate) fn vover_end(&mut self) {
        let cv = match self.curvoice {
            Some(v) => v,
            None => return,
        };
        match self.tune.voices[cv].last_note {
            Some(n) => self.tune.sym_mut(n).beam_end = true,
            None => self.report(Severity::Error, DiagKind::EmptyOverlay),
        }
        let vo = match self.vover.take() {
            Some(vo) => vo,
            None => {
                self.report(Severity::Error, DiagKind::StrayOverlayEnd);
                return;
            }
        };
        let got = self.tune.voices[cv].time;
        let expected = self.tune.voices[vo.v].time;
        if got != expected {
            self.report(
                Severity::Error,
                DiagKind::OverlayDurationMismatch { got, expected },
            );
            if got > expected {
                self.tune.voices[vo.v].time = got;
            }
        }
        self.curvoice = Some(vo.v);
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::{Event, TuneBuilder};
    use crate::diag::DiagKind;
    use crate::model::{acc, BarInfo, KeyState, NoteHead, SymType, BASE_LEN};
    use pretty_assertions::assert_eq;

    const Q: i32 = BASE_LEN / 4;

    fn note(pit: i32, dur: i32) -> Event {
        Event::Note {
            notes: vec![NoteHead::new(pit, acc::NONE)],
            dur,
            grace: false,
            beam_end: false,
            feathered: None,
        }
    }

    fn start(b: &mut TuneBuilder) {
        b.event(Event::Key { key: KeyState::default(), has_sf: true });
    }

    #[test]
    fn measure_overlay_uses_a_shadow_voice() {
        let mut b = TuneBuilder::default();
        start(&mut b);
        b.event(note(16, Q));
        b.event(note(18, Q));
        b.event(Event::Overlay);
        b.event(note(12, Q));
        b.event(note(14, Q));
        b.event(Event::Bar { info: BarInfo::new("|"), invisible: false });
        let t = b.current_tune();
        assert_eq!(t.voices.len(), 2);
        assert_eq!(t.voices[1].id, "1o");
        assert!(t.voices[1].second);
        let times: Vec<i32> = t.voice_iter(1).map(|(_, s)| s.time).collect();
        assert_eq!(times, vec![0, Q]);
        // the closing bar belongs to the base voice
        let base: Vec<SymType> = t.voice_iter(0).map(|(_, s)| s.typ).collect();
        assert_eq!(base.last(), Some(&SymType::Bar));
        assert!(b.diagnostics().is_empty());
    }

    #[test]
    fn shadow_voice_sits_below_its_base() {
        let mut b = TuneBuilder::default();
        start(&mut b);
        b.event(note(16, Q));
        b.event(Event::Overlay);
        b.event(note(12, Q));
        b.event(Event::Bar { info: BarInfo::new("|"), invisible: false });
        let t = b.current_tune();
        let sv = t.systems[0].voices[1].unwrap();
        assert_eq!(sv.range, 1);
        assert!(sv.second);
        assert_eq!(sv.st, 0);
    }

    #[test]
    fn later_measure_overlay_opens_on_an_invisible_bar() {
        let mut b = TuneBuilder::default();
        start(&mut b);
        for _ in 0..4 {
            b.event(note(16, Q));
        }
        b.event(Event::Bar { info: BarInfo::new("|"), invisible: false });
        b.event(note(16, Q));
        b.event(note(18, Q));
        b.event(Event::Overlay);
        b.event(note(12, Q));
        b.event(note(14, Q));
        b.event(Event::Bar { info: BarInfo::new("|"), invisible: false });
        let t = b.current_tune();
        let shadow: Vec<(SymType, i32, bool)> = t
            .voice_iter(1)
            .map(|(_, s)| (s.typ, s.time, s.invisible))
            .collect();
        assert_eq!(
            shadow,
            vec![
                (SymType::Bar, 4 * Q, true),
                (SymType::Note, 4 * Q, false),
                (SymType::Note, 5 * Q, false),
            ]
        );
    }

    #[test]
    fn full_overlay_restores_the_base_voice() {
        let mut b = TuneBuilder::default();
        start(&mut b);
        b.event(Event::OverlayStart);
        b.event(note(16, Q));
        b.event(note(18, Q));
        b.event(Event::Overlay);
        b.event(note(12, Q));
        b.event(note(14, Q));
        b.event(Event::OverlayEnd);
        b.event(note(20, Q));
        let t = b.current_tune();
        assert!(b.diagnostics().is_empty());
        // the note after the overlay continues the base voice
        assert_eq!(t.voices[0].time, 3 * Q);
        assert_eq!(t.voices[1].time, 2 * Q);
    }

    #[test]
    fn row_duration_mismatch_adopts_the_larger_time() {
        let mut b = TuneBuilder::default();
        start(&mut b);
        b.event(Event::OverlayStart);
        b.event(note(16, Q));
        b.event(note(18, Q));
        b.event(Event::Overlay);
        b.event(note(12, Q));
        b.event(Event::OverlayEnd);
        assert!(b
            .diagnostics()
            .iter()
            .any(|d| d.kind == DiagKind::OverlayDurationMismatch { got: Q, expected: 2 * Q }));
        // the shorter row does not rewind the base voice
        assert_eq!(b.current_tune().voices[0].time, 2 * Q);
    }

    #[test]
    fn nested_overlay_is_rejected() {
        let mut b = TuneBuilder::default();
        start(&mut b);
        b.event(note(16, Q));
        b.event(Event::OverlayStart);
        b.event(Event::OverlayStart);
        assert!(b
            .diagnostics()
            .iter()
            .any(|d| d.kind == DiagKind::NestedOverlay));
    }

    #[test]
    fn stray_overlay_end_is_reported() {
        let mut b = TuneBuilder::default();
        start(&mut b);
        b.event(note(16, Q));
        b.event(Event::OverlayEnd);
        assert!(b
            .diagnostics()
            .iter()
            .any(|d| d.kind == DiagKind::StrayOverlayEnd));
    }

    #[test]
    fn overlay_without_notes_is_reported() {
        let mut b = TuneBuilder::default();
        start(&mut b);
        b.event(Event::Overlay);
        assert!(b
            .diagnostics()
            .iter()
            .any(|d| d.kind == DiagKind::EmptyOverlay));
    }

    #[test]
    fn unterminated_overlay_is_repaired_at_the_end() {
        let mut b = TuneBuilder::default();
        start(&mut b);
        b.event(note(16, Q));
        b.event(Event::Overlay);
        b.event(note(12, Q));
        b.finish();
        assert!(b
            .diagnostics()
            .iter()
            .any(|d| d.kind == DiagKind::UnterminatedOverlay));
        let tunes = b.into_tunes();
        assert_eq!(tunes.len(), 1);
    }
}
