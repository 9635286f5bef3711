//! Staff system management.
//!
//! A staff directive describes which voices are visible, how they are
//! grouped into staves (braces, brackets, shared-staff parentheses) and
//! in which display order.  Each directive opens a new [`StaffSystem`];
//! the systems are chained in declaration order and the time sequencer
//! activates them as it meets their `Staves` symbols.

use crate::builder::{State, TuneBuilder};
use crate::diag::{DiagKind, Severity};
use crate::model::{flags, SyStaff, SyVoice, SymType, Tune};

/// Open a new staff system: fold the per-voice staff overrides into the
/// closing system, then clone its staves with cleared grouping flags.
/// Returns the new system index.
pub(crate) fn new_syst(tune: &mut Tune, old: usize) -> usize {
    for v in 0..tune.voices.len() {
        if let Some(sv) = tune.systems[old].voice(v) {
            let st = sv.st;
            let lines = tune.voices[v].stafflines.clone();
            let scale = tune.voices[v].staffscale;
            if st < tune.systems[old].staves.len() {
                tune.systems[old].staves[st].stafflines = lines;
                tune.systems[old].staves[st].staffscale = scale;
            }
        }
    }
    let mut sy = tune.systems[old].clone();
    sy.voices.clear();
    sy.top_voice = 0;
    for stf in &mut sy.staves {
        stf.flags = 0;
    }
    tune.systems.push(sy);
    tune.systems.len() - 1
}

/// The two implicit brace regroupings of the staff (non-score) form.
/// `{a b c}` puts the middle voice afloat between the outer staves and
/// `{a b c d}` pairs the voices two by two on shared staves.  Nothing
/// else is rewritten.
fn rewrite_braces(vf: &mut [(usize, u16)]) {
    for i in 0..vf.len() {
        let fl = vf[i].1;
        if fl & (flags::OPEN_BRACE | flags::OPEN_BRACE2) == 0 {
            continue;
        }
        // a one-voice brace stays as written
        if fl & (flags::OPEN_BRACE | flags::CLOSE_BRACE)
            == (flags::OPEN_BRACE | flags::CLOSE_BRACE)
            || fl & (flags::OPEN_BRACE2 | flags::CLOSE_BRACE2)
                == (flags::OPEN_BRACE2 | flags::CLOSE_BRACE2)
        {
            continue;
        }
        if i + 2 >= vf.len() || vf[i + 1].1 != 0 {
            continue;
        }
        if fl & flags::OPEN_PARENTH != 0 || vf[i + 2].1 & flags::OPEN_PARENTH != 0 {
            continue;
        }
        if vf[i + 2].1 & (flags::CLOSE_BRACE | flags::CLOSE_BRACE2) != 0 {
            // {a b c} -> {a *b c}
            vf[i + 1].1 |= flags::FL_VOICE;
        } else if i + 3 < vf.len()
            && vf[i + 2].1 == 0
            && vf[i + 3].1 & (flags::CLOSE_BRACE | flags::CLOSE_BRACE2) != 0
        {
            // {a b c d} -> {(a b) (c d)}
            vf[i].1 |= flags::OPEN_PARENTH;
            vf[i + 1].1 |= flags::CLOSE_PARENTH;
            vf[i + 2].1 |= flags::OPEN_PARENTH;
            vf[i + 3].1 |= flags::CLOSE_PARENTH;
        }
    }
}

impl TuneBuilder {
    /// Handle a staff/score directive.  `spec` lists the visible voices
    /// in display order with their grouping flag bits; `None` duplicates
    /// the current layout (used to re-synchronize the voices).  With the
    /// score form (`score_form`), bar lines cross to the next staff by
    /// default and no implicit brace regrouping happens.
    pub(crate) fn staves(&mut self, score_form: bool, spec: Option<Vec<(String, u16)>>) {
        // reject a bad directive before touching the systems
        if spec.as_ref().map_or(false, |s| s.is_empty()) {
            self.report(Severity::Error, DiagKind::BadStaffSpec);
            return;
        }

        let maxtime = self
            .tune
            .voices
            .iter()
            .map(|p| p.time)
            .max()
            .unwrap_or(0);

        if maxtime == 0 {
            // first directive of the tune: rebuild the initial system
            let sy = &mut self.tune.systems[self.par_sy];
            sy.staves.clear();
            sy.voices.clear();
            if spec.is_none() {
                return;
            }
        } else {
            if !self.tune.voices.is_empty() {
                self.voice_adj(true);
            }
            // link the system change in a voice the previous system sees,
            // so the sequencer meets it in order
            let v = (0..self.tune.voices.len())
                .find(|&v| self.tune.systems[self.par_sy].voice(v).is_some())
                .unwrap_or(0);
            self.tune.voices[v].time = maxtime;
            let sid = self.sym_add(v, SymType::Staves);

            if spec.is_none() {
                // no parameter: duplicate the system, re-synchronize all
                // the voice cursors and keep going
                let sy = self.tune.systems[self.par_sy].clone();
                self.tune.systems.push(sy);
                self.par_sy = self.tune.systems.len() - 1;
                self.tune.sym_mut(sid).sy = Some(self.par_sy);
                self.staves_found = maxtime;
                for p in &mut self.tune.voices {
                    p.time = maxtime;
                }
                self.curvoice = Some(self.tune.systems[self.par_sy].top_voice);
                return;
            }
            self.par_sy = new_syst(&mut self.tune, self.par_sy);
            self.tune.sym_mut(sid).sy = Some(self.par_sy);
        }
        self.staves_found = maxtime;

        let spec = match spec {
            Some(s) => s,
            None => return,
        };

        for p in &mut self.tune.voices {
            p.second = false;
            p.floating = false;
        }

        // resolve the voice ids and assign display ranges; overlay
        // shadow voices ride along right below their base voice
        let mut vf: Vec<(usize, u16)> = Vec::with_capacity(spec.len());
        let mut range = 0;
        for (id, fl) in &spec {
            let v = self.new_voice(id);
            self.tune.voices[v].time = maxtime;
            vf.push((v, *fl));
            let mut ov = Some(v);
            while let Some(v2) = ov {
                self.tune.systems[self.par_sy].set_voice(
                    v2,
                    SyVoice { st: 0, range, second: false },
                );
                range += 1;
                ov = self.tune.voices[v2].voice_down;
            }
        }
        self.tune.systems[self.par_sy].top_voice = vf[0].0;

        if !score_form {
            rewrite_braces(&mut vf);
        }

        // assign the staves
        let mut st: i32 = -1;
        let mut i = 0;
        while i < vf.len() {
            let v0 = vf[i].0;
            let mut fl = vf[i].1;
            // a parenthesis around a single voice is meaningless
            if fl & (flags::OPEN_PARENTH | flags::CLOSE_PARENTH)
                == (flags::OPEN_PARENTH | flags::CLOSE_PARENTH)
            {
                fl &= !(flags::OPEN_PARENTH | flags::CLOSE_PARENTH);
                vf[i].1 = fl;
            }
            if fl & flags::FL_VOICE != 0 {
                self.tune.voices[v0].floating = true;
                self.tune.voices[v0].second = true;
            } else {
                st += 1;
                let stu = st as usize;
                let lines = self.tune.voices[v0].stafflines.clone();
                let sy = &mut self.tune.systems[self.par_sy];
                if sy.staves.len() <= stu {
                    sy.staves.resize_with(stu + 1, SyStaff::default);
                    sy.staves[stu].stafflines = lines;
                }
                sy.staves[stu].flags = 0;
            }
            let stu = if st < 0 { 0 } else { st as usize };
            if self.tune.systems[self.par_sy].staves.is_empty() {
                self.tune.systems[self.par_sy].staves.push(SyStaff::default());
            }
            self.tune.voices[v0].st = stu;
            self.tune.voices[v0].cst = stu;
            if let Some(sv) = self.tune.systems[self.par_sy].voice_mut(v0) {
                sv.st = stu;
            }
            self.tune.systems[self.par_sy].staves[stu].flags |= fl;

            if fl & flags::OPEN_PARENTH != 0 {
                // shared staff: everything up to the closing parenthesis
                // becomes a second voice, except the marked master voice
                let mut master = v0;
                while i + 1 < vf.len() {
                    i += 1;
                    let (v2, fl2) = vf[i];
                    if fl2 & flags::MASTER_VOICE != 0 {
                        self.tune.voices[master].second = true;
                        master = v2;
                    } else {
                        self.tune.voices[v2].second = true;
                    }
                    self.tune.voices[v2].st = stu;
                    self.tune.voices[v2].cst = stu;
                    if let Some(sv) = self.tune.systems[self.par_sy].voice_mut(v2) {
                        sv.st = stu;
                    }
                    if fl2 & flags::CLOSE_PARENTH != 0 {
                        break;
                    }
                }
                let last = vf[i].1;
                self.tune.systems[self.par_sy].staves[stu].flags |= last;
            }
            i += 1;
        }
        let nstaff = if st < 0 { 0 } else { st as usize };
        self.tune.systems[self.par_sy].staves.truncate(nstaff + 1);

        // with the score form, bar lines cross to the next staff unless
        // stopped explicitly; the flag meaning is inverted
        if score_form {
            let sy = &mut self.tune.systems[self.par_sy];
            for st in 0..nstaff {
                sy.staves[st].flags ^= flags::STOP_BAR;
            }
        }

        // final fixups over the whole voice table
        let mut cur_st = 0;
        for v in 0..self.tune.voices.len() {
            let visible = self.tune.systems[self.par_sy].voice(v).is_some();
            if visible {
                cur_st = self.tune.voices[v].st;
            } else {
                // park invisible voices on the last seen staff
                self.tune.voices[v].st = cur_st;
            }

            // first system: the symbols linked before it were given
            // staff 0, fix them up
            if maxtime == 0 {
                let vst = self.tune.voices[v].st;
                let mut cur = self.tune.voices[v].sym;
                while let Some(id) = cur {
                    self.tune.sym_mut(id).st = vst;
                    cur = self.tune.sym(id).next;
                }
            }
            if !visible {
                continue;
            }

            // overlay shadow voices follow their base staff and stay
            // second voices
            let mut ov = self.tune.voices[v].voice_down;
            while let Some(v2) = ov {
                self.tune.voices[v2].st = cur_st;
                self.tune.voices[v2].cst = cur_st;
                self.tune.voices[v2].second = true;
                if let Some(sv) = self.tune.systems[self.par_sy].voice_mut(v2) {
                    sv.st = cur_st;
                    sv.second = true;
                }
                ov = self.tune.voices[v2].voice_down;
            }

            let second = self.tune.voices[v].second;
            if let Some(sv) = self.tune.systems[self.par_sy].voice_mut(v) {
                sv.second = second;
            }

            // repeat brackets are drawn once per bar-connected staff group
            let vst = self.tune.voices[v].st;
            if vst > 0
                && !self.tune.voices[v].norepbra
                && self.tune.systems[self.par_sy].staves[vst - 1].flags & flags::STOP_BAR == 0
            {
                self.tune.voices[v].norepbra = true;
            }
        }

        if maxtime == 0 && !self.tune.voices.is_empty() {
            self.voice_adj(true);
        }

        self.curvoice = if self.state == State::Body {
            Some(self.tune.systems[self.par_sy].top_voice)
        } else {
            None
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Voice;
    use pretty_assertions::assert_eq;

    fn f(fl: u16) -> (usize, u16) {
        (0, fl)
    }

    #[test]
    fn three_voice_brace_floats_the_middle() {
        let mut vf = vec![f(flags::OPEN_BRACE), f(0), f(flags::CLOSE_BRACE)];
        rewrite_braces(&mut vf);
        assert_eq!(vf[1].1, flags::FL_VOICE);
        assert_eq!(vf[0].1, flags::OPEN_BRACE);
    }

    #[test]
    fn four_voice_brace_pairs_staves() {
        let mut vf = vec![f(flags::OPEN_BRACE), f(0), f(0), f(flags::CLOSE_BRACE)];
        rewrite_braces(&mut vf);
        assert_eq!(vf[0].1, flags::OPEN_BRACE | flags::OPEN_PARENTH);
        assert_eq!(vf[1].1, flags::CLOSE_PARENTH);
        assert_eq!(vf[2].1, flags::OPEN_PARENTH);
        assert_eq!(vf[3].1, flags::CLOSE_BRACE | flags::CLOSE_PARENTH);
    }

    #[test]
    fn flagged_inner_voice_blocks_rewrite() {
        let orig = vec![
            f(flags::OPEN_BRACE),
            f(flags::OPEN_PARENTH),
            f(flags::CLOSE_PARENTH),
            f(flags::CLOSE_BRACE),
        ];
        let mut vf = orig.clone();
        rewrite_braces(&mut vf);
        assert_eq!(vf, orig);
    }

    #[test]
    fn short_spec_is_left_alone() {
        let mut vf = vec![f(flags::OPEN_BRACE), f(flags::CLOSE_BRACE)];
        let orig = vf.clone();
        rewrite_braces(&mut vf);
        assert_eq!(vf, orig);
    }

    #[test]
    fn new_syst_clears_grouping_flags() {
        let mut tune = Tune::new();
        tune.voices.push(Voice::new(0, "1"));
        tune.systems[0].set_voice(0, SyVoice { st: 0, range: 0, second: false });
        tune.systems[0].staves.push(SyStaff {
            stafflines: "|||||".to_string(),
            staffscale: 1.0,
            flags: flags::OPEN_BRACE | flags::STOP_BAR,
        });
        tune.voices[0].staffscale = 0.8;
        let sy = new_syst(&mut tune, 0);
        assert_eq!(sy, 1);
        assert_eq!(tune.systems[1].staves[0].flags, 0);
        assert_eq!(tune.systems[1].voices.iter().flatten().count(), 0);
        // the voice override lands in the closing system and is inherited
        assert_eq!(tune.systems[0].staves[0].staffscale, 0.8);
        assert_eq!(tune.systems[1].staves[0].staffscale, 0.8);
    }
}
