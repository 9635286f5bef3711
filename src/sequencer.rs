//! Global time sequencing.
//!
//! After a tune (or segment) is fully linked per voice, the sequencer
//! merges all the voice lists into one global sequence ordered by
//! `(time, weight)`, with ties broken by the display order of the active
//! staff system.  Symbols sharing time and weight form one simultaneity
//! group; the first symbol of each group carries `seq_start`.
//!
//! A small per-voice adjustment pass runs first: grace notes that would
//! sort after a bar at the same time are nudged back, and feathered
//! beams get their interpolated durations.

use crate::model::{Feather, SymId, SymType, Symbol, Tune};

/// Respace the notes under a feathered beam: durations interpolate
/// linearly between half the nominal value and one and a half times it,
/// shrinking (accel) or growing (rall) along the beam.  The last note
/// absorbs the integer rounding so the total duration is unchanged.
fn set_feathered_beam(tune: &mut Tune, s1: SymId) {
    let d = tune.sym(s1).dur;

    // find the end of the beam
    let mut n: i32 = 1;
    let mut last = s1;
    loop {
        let s = tune.sym(last);
        if s.beam_end {
            break;
        }
        match s.next {
            Some(nx) => {
                n += 1;
                last = nx;
            }
            None => break,
        }
    }
    if n <= 1 {
        tune.sym_mut(s1).feathered = None;
        return;
    }

    let b = d / 2; // smallest duration
    let a = d / (n - 1); // per-note delta
    let accel = tune.sym(s1).feathered == Some(Feather::Accel);
    let mut t = tune.sym(s1).time;
    let mut i = if accel { n - 1 } else { 0 };
    let mut cur = s1;
    while cur != last {
        let dd = a * i + b;
        let s = tune.sym_mut(cur);
        s.dur = dd;
        s.time = t;
        t += dd;
        cur = match s.next {
            Some(nx) => nx,
            None => break,
        };
        if accel {
            i -= 1;
        } else {
            i += 1;
        }
    }
    let s = tune.sym_mut(last);
    s.dur = s.time + s.dur - t;
    s.time = t;
}

/// Per-voice adjustment pass, run before sequencing and again at each
/// staff system change.  Symbols older than `staves_found` were already
/// adjusted by a previous pass and are skipped.
pub(crate) fn voice_adj(tune: &mut Tune, sys_chg: bool, staves_found: i32) {
    for v in 0..tune.voices.len() {
        if !sys_chg {
            tune.voices[v].eoln = false;
        }

        let mut cur = tune.voices[v].sym;
        while let Some(id) = cur {
            if tune.sym(id).time >= staves_found {
                break;
            }
            cur = tune.sym(id).next;
        }
        while let Some(id) = cur {
            let next = tune.sym(id).next;
            if tune.sym(id).typ == SymType::Grace {
                // bars weigh more than grace notes, so the sequencer
                // would put the grace group after a bar at the same
                // time; pull it just before
                if let Some(nx) = next {
                    if tune.sym(nx).typ == SymType::Bar {
                        tune.sym_mut(id).time -= 1;
                    }
                }
            } else if tune.sym(id).feathered.is_some() {
                set_feathered_beam(tune, id);
            }
            cur = next;
        }
    }
}

/// Merge the voice lists into the global time sequence.
///
/// A synthetic `Staves` symbol anchoring the first staff system is
/// prepended to the top voice; a tempo registered in the tune header, if
/// any, goes right after it.  Voices not visible in the active system
/// are left out until a system that shows them takes over.
pub(crate) fn sort_all(tune: &mut Tune, header_tempo: Option<Symbol>) {
    if tune.voices.is_empty() {
        return;
    }
    let top = tune.systems[0].top_voice;
    let head = match tune.voices[top].sym {
        Some(h) => h,
        None => return,
    };
    let fmt = tune.sym(head).fmt;

    // per-voice cursors, taken before the anchor is prepended
    let mut vtb: Vec<Option<SymId>> = tune.voices.iter().map(|p| p.sym).collect();
    // visible voices of the active system, in display order
    let mut vn: Vec<usize> = tune.systems[0].by_range();

    let mut anchor = Symbol::new(SymType::Staves);
    anchor.v = top;
    anchor.sy = Some(0);
    anchor.seq_start = true;
    anchor.fmt = fmt;
    anchor.next = Some(head);
    let anchor = tune.add_sym(anchor);
    tune.sym_mut(head).prev = Some(anchor);
    tune.voices[top].sym = Some(anchor);
    tune.ts_first = Some(anchor);
    let mut prev = anchor;

    if let Some(mut t) = header_tempo {
        t.v = top;
        t.st = 0;
        t.time = 0;
        t.fmt = fmt;
        t.prev = Some(anchor);
        t.next = Some(head);
        let tid = tune.add_sym(t);
        tune.sym_mut(head).prev = Some(tid);
        tune.sym_mut(anchor).next = Some(tid);
        vtb[top] = Some(tid);
    }

    let mut new_sy: Option<usize> = None;
    loop {
        if let Some(sy) = new_sy.take() {
            vn = tune.systems[sy].by_range();
        }

        // min (time, weight) over the cursors
        let mut time = i32::MAX;
        let mut wmin = u8::MAX;
        for &v in &vn {
            let sid = match vtb[v] {
                Some(s) => s,
                None => continue,
            };
            let s = tune.sym(sid);
            if s.time > time {
                continue;
            }
            let w = s.typ.weight();
            if s.time < time {
                time = s.time;
                wmin = w;
            } else if w < wmin {
                wmin = w;
            }
        }
        if time == i32::MAX {
            break; // all cursors exhausted
        }

        // link the matching group, ties broken by display order
        let mut first = true;
        for idx in 0..vn.len() {
            let v = vn[idx];
            let sid = match vtb[v] {
                Some(s) => s,
                None => continue,
            };
            if tune.sym(sid).time != time || tune.sym(sid).typ.weight() != wmin {
                continue;
            }
            if tune.sym(sid).typ == SymType::Staves {
                // system change takes effect for the next group
                new_sy = tune.sym(sid).sy;
            }
            tune.sym_mut(sid).seq_start = first;
            first = false;
            tune.sym_mut(sid).ts_prev = Some(prev);
            tune.sym_mut(prev).ts_next = Some(sid);
            prev = sid;
            vtb[v] = tune.sym(sid).next;
        }
    }
}
