//! Measure numbering.
//!
//! Runs over the global time sequence once it exists and writes a
//! number on every counting bar of the top symbol of its group.  An
//! anacrusis (a first measure shorter than the meter) makes its closing
//! bar number 0, so the first complete measure is measure 1.  Under a
//! free meter (no measure duration) bars are simply counted.

use crate::builder::Config;
use crate::diag::{self, DiagKind, Diagnostic, Severity};
use crate::model::{SymType, Tune};

pub(crate) fn set_bar_num(tune: &mut Tune, cfg: &Config, diags: &mut Vec<Diagnostic>) {
    let top = tune.systems[0].top_voice;
    let mut wmeasure = match tune.voices.get(top) {
        Some(p) => p.meter.wmeasure,
        None => return,
    };
    let mut bar_num = cfg.first_bar_num;
    let mut bar_tim = 0; // time origin of the numbering
    let mut ptim = 0; // time of the previous counted bar
    let mut rep_tim = 0; // first-ending reference (a number under free meter)

    // find the first counting symbol; a bar right at the start of the
    // tune is not counted
    let mut s_id;
    let mut cur = tune.ts_first;
    loop {
        let id = match cur {
            Some(i) => i,
            None => return,
        };
        match tune.sym(id).typ {
            SymType::Meter => {
                if let Some(m) = tune.sym(id).meter {
                    wmeasure = m.wmeasure;
                }
                cur = tune.sym(id).ts_next;
            }
            SymType::Clef | SymType::Key | SymType::StaffBreak | SymType::Staves
            | SymType::Tempo => {
                cur = tune.sym(id).ts_next;
            }
            SymType::Bar => {
                if let Some(n) = tune.sym(id).bar.as_ref().and_then(|b| b.num) {
                    bar_num = n; // explicit renumbering
                }
                s_id = id;
                break;
            }
            _ => {
                s_id = id;
                break;
            }
        }
    }

    // check for an anacrusis: a first bar earlier than one full measure
    // anchors the numbering on itself
    let mut probe = tune.sym(s_id).ts_next;
    while let Some(id) = probe {
        let s = tune.sym(id);
        if s.typ == SymType::Bar && s.time != 0 {
            if s.time < wmeasure {
                s_id = id;
                bar_tim = s.time;
            }
            break;
        }
        probe = s.ts_next;
    }

    let mut cur = Some(s_id);
    while let Some(id) = cur {
        cur = tune.sym(id).ts_next;
        if !tune.sym(id).seq_start {
            continue;
        }
        match tune.sym(id).typ {
            SymType::Meter => {
                let tim = tune.sym(id).time;
                if wmeasure != 1 {
                    bar_num += (tim - bar_tim) / wmeasure;
                }
                bar_tim = tim;
                if let Some(m) = tune.sym(id).meter {
                    wmeasure = m.wmeasure;
                }
            }
            SymType::Bar if !tune.sym(id).invisible => {
                let tim = tune.sym(id).time;
                let preset = tune.sym(id).bar.as_ref().and_then(|b| b.num);
                let dotted = tune.sym(id).bar.as_ref().map_or(false, |b| b.dotted);
                let text0 = tune
                    .sym(id)
                    .bar
                    .as_ref()
                    .and_then(|b| b.text.as_deref())
                    .and_then(|t| t.chars().next());

                if let Some(n) = preset {
                    // explicit renumbering: adopt and re-anchor
                    bar_num = n;
                    ptim = tim;
                    bar_tim = tim;
                } else if wmeasure == 1 {
                    // free meter: bars are just counted
                    if !dotted {
                        if let Some(c) = text0 {
                            if !cfg.contbarnb {
                                if c == '1' {
                                    rep_tim = bar_num;
                                } else {
                                    bar_num = rep_tim;
                                }
                            }
                        }
                        bar_num += 1;
                        if let Some(b) = tune.sym_mut(id).bar.as_mut() {
                            b.num = Some(bar_num);
                        }
                    }
                } else {
                    let elapsed = tim - bar_tim;
                    let mut n = bar_num + elapsed.div_euclid(wmeasure);
                    let mut rem = elapsed.rem_euclid(wmeasure);

                    let prev_mrest = tune
                        .sym(id)
                        .prev
                        .map_or(false, |p| tune.sym(p).typ == SymType::Mrest);
                    let has_next = tune.sym(id).next.is_some();
                    if cfg.checkbars
                        && ((rem != 0 && !dotted && has_next)
                            || (tim > ptim + wmeasure && !prev_mrest))
                    {
                        diag::emit(
                            diags,
                            Diagnostic::new(Severity::Warning, DiagKind::BadMeasureDuration)
                                .with_sym(id),
                        );
                    }
                    if tim > ptim + wmeasure {
                        // more than one measure: re-synchronize
                        rem = 0;
                        bar_tim = tim;
                        bar_num = n;
                    }
                    if let Some(c) = text0 {
                        if c == '1' {
                            // first repeat variant: remember where it starts
                            rep_tim = if cfg.contbarnb { bar_tim + rem } else { tim };
                            if rem == 0 {
                                if let Some(b) = tune.sym_mut(id).bar.as_mut() {
                                    b.num = Some(n);
                                }
                            }
                        } else {
                            // other variants restart from the first one
                            if cfg.contbarnb {
                                bar_tim = rep_tim;
                            } else {
                                bar_tim += tim - rep_tim;
                            }
                            let e2 = tim - bar_tim;
                            if e2.rem_euclid(wmeasure) == 0 {
                                n = bar_num + e2.div_euclid(wmeasure);
                                if let Some(b) = tune.sym_mut(id).bar.as_mut() {
                                    b.num = Some(n);
                                }
                            }
                        }
                    } else if let Some(b) = tune.sym_mut(id).bar.as_mut() {
                        b.num = Some(n);
                    }
                    if rem == 0 {
                        ptim = tim;
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BarInfo, Meter, SyVoice, SymId, Symbol, Voice, BASE_LEN};
    use crate::sequencer::sort_all;
    use pretty_assertions::assert_eq;

    const Q: i32 = BASE_LEN / 4;

    struct T(Tune);

    impl T {
        fn new() -> Self {
            let mut tune = Tune::new();
            tune.voices.push(Voice::new(0, "1"));
            tune.systems[0].set_voice(0, SyVoice { st: 0, range: 0, second: false });
            T(tune)
        }

        fn push(&mut self, s: Symbol) -> SymId {
            let mut s = s;
            s.prev = self.0.voices[0].last_sym;
            let id = self.0.add_sym(s);
            match self.0.voices[0].last_sym {
                Some(p) => self.0.sym_mut(p).next = Some(id),
                None => self.0.voices[0].sym = Some(id),
            }
            self.0.voices[0].last_sym = Some(id);
            id
        }

        fn note(&mut self, time: i32, dur: i32) -> SymId {
            let mut s = Symbol::new(SymType::Note);
            s.time = time;
            s.dur = dur;
            self.push(s)
        }

        fn bar(&mut self, time: i32) -> SymId {
            let mut s = Symbol::new(SymType::Bar);
            s.time = time;
            s.bar = Some(BarInfo::new("|"));
            self.push(s)
        }

        fn meter(&mut self, time: i32, m: Meter) -> SymId {
            let mut s = Symbol::new(SymType::Meter);
            s.time = time;
            s.meter = Some(m);
            self.push(s)
        }

        fn number(&mut self, cfg: &Config) -> Vec<Diagnostic> {
            let mut diags = Vec::new();
            sort_all(&mut self.0, None);
            set_bar_num(&mut self.0, cfg, &mut diags);
            diags
        }

        fn num(&self, id: SymId) -> Option<i32> {
            self.0.sym(id).bar.as_ref().and_then(|b| b.num)
        }
    }

    #[test]
    fn plain_measures() {
        let mut t = T::new();
        for b in 0..4 {
            t.note(b * Q, Q);
        }
        let b1 = t.bar(4 * Q);
        for b in 4..8 {
            t.note(b * Q, Q);
        }
        let b2 = t.bar(8 * Q);
        for b in 8..12 {
            t.note(b * Q, Q);
        }
        let diags = t.number(&Config::default());
        assert_eq!(t.num(b1), Some(1));
        assert_eq!(t.num(b2), Some(2));
        assert!(diags.is_empty());
    }

    #[test]
    fn anacrusis_counts_as_measure_zero() {
        let mut t = T::new();
        t.note(0, Q); // pickup of one quarter
        let b0 = t.bar(Q);
        for b in 0..4 {
            t.note((b + 1) * Q, Q);
        }
        let b1 = t.bar(5 * Q);
        t.note(5 * Q, Q);
        let diags = t.number(&Config::default());
        assert_eq!(t.num(b0), Some(0));
        assert_eq!(t.num(b1), Some(1));
        assert!(diags.is_empty());
    }

    #[test]
    fn explicit_number_re_anchors() {
        let mut t = T::new();
        for b in 0..4 {
            t.note(b * Q, Q);
        }
        let b1 = t.bar(4 * Q);
        if let Some(b) = t.0.sym_mut(b1).bar.as_mut() {
            b.num = Some(10);
        }
        for b in 4..8 {
            t.note(b * Q, Q);
        }
        let b2 = t.bar(8 * Q);
        t.number(&Config::default());
        assert_eq!(t.num(b1), Some(10));
        assert_eq!(t.num(b2), Some(11));
    }

    #[test]
    fn free_meter_counts_bars() {
        let mut t = T::new();
        t.0.voices[0].meter = Meter::none();
        t.note(0, Q);
        let b1 = t.bar(Q);
        t.note(Q, 3 * Q);
        let b2 = t.bar(4 * Q);
        t.note(4 * Q, Q);
        t.number(&Config::default());
        assert_eq!(t.num(b1), Some(1));
        assert_eq!(t.num(b2), Some(2));
    }

    #[test]
    fn leading_meter_sets_the_measure_length() {
        let mut t = T::new();
        // 3/4 declared up front: a bar after three quarters is a full
        // measure, not an anacrusis
        t.meter(0, Meter::new(3, 4));
        for b in 0..3 {
            t.note(b * Q, Q);
        }
        let b1 = t.bar(3 * Q);
        for b in 3..6 {
            t.note(b * Q, Q);
        }
        let b2 = t.bar(6 * Q);
        t.note(6 * Q, Q);
        let diags = t.number(&Config::default());
        assert_eq!(t.num(b1), Some(1));
        assert_eq!(t.num(b2), Some(2));
        assert!(diags.is_empty());
    }

    #[test]
    fn short_measure_is_reported() {
        let mut t = T::new();
        // a full first measure, then one a quarter short
        for b in 0..4 {
            t.note(b * Q, Q);
        }
        let b1 = t.bar(4 * Q);
        for b in 4..7 {
            t.note(b * Q, Q);
        }
        let b2 = t.bar(7 * Q);
        t.note(7 * Q, Q);
        let diags = t.number(&Config::default());
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagKind::BadMeasureDuration);
        assert_eq!(diags[0].sym, Some(b2));
        // the short bar does not count as a full measure
        assert_eq!(t.num(b1), Some(1));
        assert_eq!(t.num(b2), Some(1));
    }

    #[test]
    fn check_can_be_disabled() {
        let mut t = T::new();
        for b in 0..4 {
            t.note(b * Q, Q);
        }
        t.bar(4 * Q);
        for b in 4..7 {
            t.note(b * Q, Q);
        }
        t.bar(7 * Q);
        t.note(7 * Q, Q);
        let cfg = Config { checkbars: false, ..Config::default() };
        assert!(t.number(&cfg).is_empty());
    }

    #[test]
    fn repeat_variants_share_numbers() {
        let mut t = T::new();
        for b in 0..4 {
            t.note(b * Q, Q);
        }
        let b1 = t.bar(4 * Q);
        if let Some(b) = t.0.sym_mut(b1).bar.as_mut() {
            b.text = Some("1".to_string());
        }
        for b in 4..8 {
            t.note(b * Q, Q);
        }
        let b2 = t.bar(8 * Q);
        if let Some(b) = t.0.sym_mut(b2).bar.as_mut() {
            b.text = Some("2".to_string());
        }
        for b in 8..12 {
            t.note(b * Q, Q);
        }
        let b3 = t.bar(12 * Q);
        t.number(&Config::default());
        assert_eq!(t.num(b1), Some(1));
        assert_eq!(t.num(b2), Some(1)); // second ending restarts
        assert_eq!(t.num(b3), Some(2));
    }

    #[test]
    fn invisible_bars_are_skipped() {
        let mut t = T::new();
        for b in 0..4 {
            t.note(b * Q, Q);
        }
        let b1 = t.bar(4 * Q);
        t.0.sym_mut(b1).invisible = true;
        for b in 4..8 {
            t.note(b * Q, Q);
        }
        let b2 = t.bar(8 * Q);
        t.number(&Config::default());
        assert_eq!(t.num(b1), None);
        assert_eq!(t.num(b2), Some(2));
    }
}
