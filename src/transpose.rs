//! Interval-exact pitch transposition in base-40.
//!
//! Base-40 encodes 40 positions per octave so that enharmonic spellings
//! stay distinct: each letter owns five chromatic slots (double flat to
//! double sharp), a whole tone is 6 steps, a diatonic semitone (E-F,
//! B-C) is 5 and an accidental is a plain +/-1 or +/-2 offset.  Interval
//! arithmetic is then integer addition: a perfect fifth is 23, a major
//! third 12, an octave 40.  The five slots between the double sharp of
//! one letter and the double flat of the next are unused; they are
//! canonicalized to the enharmonic spelling 4 steps up (a diminished
//! second) if they ever come out of an addition.
//!
//! The whole pass runs once over the built tune, after sequencing:
//! key signatures are transposed and respelled first, then every note
//! (grace and chord notes included) follows its active key.

use crate::model::{acc, KeyState, SymId, SymType, Tune};

/// Steps per octave.
pub const OCTAVE_B40: i32 = 40;

// Natural slot of each letter (index 0 = C).
const LETTER_B40: [i32; 7] = [2, 8, 14, 19, 25, 31, 37];

// Letter of each base-40 slot.
const B40_LETTER: [i8; 40] = [
    0, 0, 0, 0, 0, 1, 1, 1, 1, 1, //
    1, 2, 2, 2, 2, 2, 2, 3, 3, 3, //
    3, 3, 4, 4, 4, 4, 4, 4, 5, 5, //
    5, 5, 5, 5, 6, 6, 6, 6, 6, 6,
];

// Accidental of each base-40 slot (0 = natural).
const B40_ACC: [i8; 40] = [
    -2, -1, 0, 1, 2, 1, -2, -1, 0, 1, //
    2, 1, -2, -1, 0, 1, 2, -2, -1, 0, //
    1, 2, 1, -2, -1, 0, 1, 2, 1, -2, //
    -1, 0, 1, 2, 1, -2, -1, 0, 1, 2,
];

// Enharmonic correction of a key tonic: signed offset to the nearest
// slot whose major key has at most 7 sharps or flats.
const B40_KEY_ADJ: [i8; 40] = [
    -4, 0, 0, 0, 4, 8, -4, 0, 0, 4, //
    4, 8, -4, 0, 0, 4, 4, -4, -4, 0, //
    0, 4, 8, -4, 0, 0, 4, 4, 8, -4, //
    0, 0, 4, 4, 8, -4, 0, 0, 4, 4,
];

// Fifths of the major key on each tonic slot (only meaningful for
// canonical tonics; other entries are never consulted after adjustment).
const B40_SF: [i8; 40] = [
    0, -7, 0, 7, 0, 0, 0, -5, 2, 0, //
    0, 0, 0, -3, 4, 0, 0, 0, 0, -1, //
    6, 0, 0, 0, -6, 1, 0, 0, 0, 0, //
    -4, 3, 0, 0, 0, 0, -2, 5, 0, 0,
];

// Semitone count to base-40 interval, sharp and flat spellings.
const ISB40: [i32; 12] = [0, 1, 6, 7, 12, 17, 18, 23, 24, 29, 30, 35];
const IFB40: [i32; 12] = [0, 5, 6, 11, 12, 17, 22, 23, 28, 29, 34, 35];

// Tonic slot of the major key with `sf` fifths (index sf + 7).
const SF_B40: [i32; 15] = [1, 24, 7, 30, 13, 36, 19, 2, 25, 8, 31, 14, 37, 20, 3];

/// Letter index (0 = C) of a diatonic pitch number.
pub fn letter_of(pit: i32) -> usize {
    (pit + 19).rem_euclid(7) as usize
}

/// Encode a diatonic pitch + accidental as base-40.
/// Middle C (pit 16) is 202.
pub fn pit_to_b40(pit: i32, a: i8) -> i32 {
    let p = pit + 19;
    let mut b40 = p.div_euclid(7) * OCTAVE_B40 + LETTER_B40[p.rem_euclid(7) as usize];
    if a != acc::NONE && a != acc::NATURAL {
        b40 += a as i32;
    }
    b40
}

/// Diatonic pitch number of a base-40 value.
pub fn b40_to_pit(b40: i32) -> i32 {
    b40.div_euclid(OCTAVE_B40) * 7 + B40_LETTER[b40.rem_euclid(OCTAVE_B40) as usize] as i32 - 19
}

/// Accidental of a base-40 value (0 for natural slots).
pub fn b40_to_acc(b40: i32) -> i8 {
    B40_ACC[b40.rem_euclid(OCTAVE_B40) as usize]
}

/// Convert a transposition given in semitones to a base-40 interval,
/// spelling preference sharp or flat.  Out of the +/-3 octave range
/// returns `None`.
pub fn interval_from_semitones(semi: i32, flat: bool) -> Option<i32> {
    if !(-36..=36).contains(&semi) {
        return None;
    }
    let v = semi + 36;
    let tbl = if flat { &IFB40 } else { &ISB40 };
    Some((v / 12 - 3) * OCTAVE_B40 + tbl[(v % 12) as usize])
}

/// Per-letter accidental map of a key signature (index 0 = C).
pub fn key_map(sf: i32) -> [i8; 7] {
    const SHARPS: [usize; 7] = [3, 0, 4, 1, 5, 2, 6]; // F C G D A E B
    const FLATS: [usize; 7] = [6, 2, 5, 1, 4, 0, 3]; // B E A D G C F
    let mut map = [0i8; 7];
    if sf > 0 {
        for &l in SHARPS.iter().take(sf.min(7) as usize) {
            map[l] = acc::SHARP;
        }
    } else if sf < 0 {
        for &l in FLATS.iter().take((-sf).min(7) as usize) {
            map[l] = acc::FLAT;
        }
    }
    map
}

/// Tonic slot of the major key with the given fifths count.
pub fn sf_to_b40(sf: i32) -> i32 {
    SF_B40[(sf.clamp(-7, 7) + 7) as usize]
}

/// Transpose a key signature in place: move the tonic by the key's
/// interval, pull it back to a canonical spelling (folding the drift
/// into the interval so the notes follow), and rebuild fifths and the
/// accidental map.  Keys with an explicit accidental list and unkeyed
/// states keep their displayed spelling.
pub fn key_transp(sk: &mut KeyState) {
    if sk.acc_list.is_some() || sk.none {
        return;
    }
    let t = match sk.transp {
        Some(t) => t,
        None => return,
    };
    let mut n = (sk.b40 + 200 + t).rem_euclid(OCTAVE_B40);
    let d = B40_KEY_ADJ[n as usize] as i32;
    if d != 0 {
        sk.transp = Some(t + d);
        n = (n + d).rem_euclid(OCTAVE_B40);
    }
    sk.b40 = n;
    sk.old_sf = sk.sf;
    sk.sf = B40_SF[n as usize] as i32;
    sk.map = key_map(sk.sf);
}

// Sign of an accidental for contradiction checks; the natural sign and
// "no accidental" both count as neutral.
fn acc_sign(a: i8) -> i32 {
    match a {
        acc::NATURAL | acc::NONE => 0,
        x => x as i32,
    }
}

/// For transposition: look back in the measure (or across a tie over
/// the previous bar) for a note of the same pitch, and return its
/// accidental if found.
fn acc_same_pitch(tune: &Tune, sid: SymId, pit: i32) -> Option<i8> {
    let time = tune.sym(sid).time;
    let mut cur = tune.sym(sid).prev;
    while let Some(id) = cur {
        let s = tune.sym(id);
        match s.typ {
            SymType::Bar => {
                if s.time < time {
                    return None; // out of the measure
                }
                // only a tie from just before the bar still applies
                let mut p = s.prev;
                while let Some(pid) = p {
                    let ps = tune.sym(pid);
                    if ps.typ == SymType::Note {
                        if ps.time + ps.dur != time {
                            return None;
                        }
                        for n in &ps.notes {
                            if n.pit == pit && n.tie {
                                return Some(n.acc);
                            }
                        }
                        return None;
                    }
                    if ps.time < time {
                        return None;
                    }
                    p = ps.prev;
                }
                return None;
            }
            SymType::Note => {
                for n in &s.notes {
                    if n.pit == pit {
                        return Some(n.acc);
                    }
                }
            }
            _ => {}
        }
        cur = s.prev;
    }
    None
}

/// Transpose one note head against the active (already transposed) key.
fn note_transp(tune: &Tune, sid: SymId, sk: &KeyState, note: &mut crate::model::NoteHead) {
    let mut a = note.acc;
    if a == acc::NONE {
        if sk.acc_list.is_some() {
            // invisible accidental carried by the key's list
            a = sk.map[letter_of(note.pit)];
        }
    }

    let b40 = pit_to_b40(note.pit, a) + sk.transp.unwrap_or(0);
    note.pit = b40_to_pit(b40);

    if a == acc::NONE && sk.acc_list.is_none() && !sk.none {
        return; // implicit accidental follows the new key
    }

    let mut an = b40_to_acc(b40);
    if a != acc::NONE {
        if sk.acc_list.is_some() && sk.map[letter_of(note.pit)] == an {
            an = acc::NONE; // already in the key
        } else if an == acc::NONE {
            an = acc::NATURAL;
        }
    } else if sk.none {
        if acc_same_pitch(tune, sid, note.pit).is_some() {
            return; // accidental carried from earlier in the measure
        }
    } else if sk.acc_list.is_some() {
        if acc_same_pitch(tune, sid, note.pit).is_some() {
            return;
        }
        if sk.map[letter_of(note.pit)] != 0 {
            an = acc::NATURAL;
        }
    } else {
        return;
    }

    // A spelling contradiction (flat landing on a sharp slot or a fresh
    // double accidental) is respelled enharmonically: +/-4 in base-40
    // moves to the adjacent letter without changing the sounding pitch.
    let delta = if acc_sign(a) < 0 && acc_sign(an) > 0 {
        4
    } else if acc_sign(a) > 0 && acc_sign(an) < 0 {
        -4
    } else if an == acc::DBL_SHARP && a != acc::DBL_SHARP {
        4
    } else if an == acc::DBL_FLAT && a != acc::DBL_FLAT {
        -4
    } else {
        0
    };
    if delta != 0 {
        let nb = b40 + delta;
        note.pit = b40_to_pit(nb);
        an = b40_to_acc(nb);
        if an == acc::NONE && sk.map[letter_of(note.pit)] != 0 {
            an = acc::NATURAL;
        }
    }
    note.acc = an;
}

/// Transposition pass: adjust pitches and accidentals of every voice
/// that carries a display transposition.  Runs once, after sequencing.
/// Bagpipe and drum voices are exempt.
pub fn pit_adj(tune: &mut Tune) {
    for v in 0..tune.voices.len() {
        if tune.voices[v].vtransp.is_none() {
            continue;
        }
        if tune.voices[v].key.bagpipe || tune.voices[v].key.drum {
            continue;
        }

        // active transposed key while walking the voice
        let mut sk: Option<KeyState> = None;
        if tune.voices[v].key.transp.is_some() {
            let mut k = tune.voices[v].key.clone();
            key_transp(&mut k);
            k.old_sf = k.sf; // no naturals at start of tune
            tune.voices[v].key = k.clone();
            sk = Some(k);
        }

        let mut cur = tune.voices[v].sym;
        while let Some(mut id) = cur {
            if sk.is_none() {
                // search the next transposing key signature
                let mut probe = Some(id);
                let mut found = None;
                while let Some(i) = probe {
                    let s = tune.sym(i);
                    if s.typ == SymType::Key
                        && s.key.as_ref().map_or(false, |k| k.transp.is_some())
                    {
                        found = Some(i);
                        break;
                    }
                    probe = s.next;
                }
                match found {
                    Some(i) => id = i,
                    None => break,
                }
            }

            match tune.sym(id).typ {
                SymType::Note | SymType::Grace => {
                    if let Some(k) = &sk {
                        for i in 0..tune.sym(id).notes.len() {
                            let mut note = tune.sym(id).notes[i];
                            note_transp(tune, id, k, &mut note);
                            tune.sym_mut(id).notes[i] = note;
                        }
                    }
                }
                SymType::Key => {
                    let mut k2 = tune.sym(id).key.clone().unwrap_or_default();
                    // acc_list and unkeyed states keep their displayed
                    // signature; only a real signature is respelled
                    if k2.transp.is_some() && k2.acc_list.is_none() && !k2.none {
                        if let Some(k) = &sk {
                            k2.sf = k.sf;
                        }
                        key_transp(&mut k2);
                    }
                    let transposing = k2.transp.is_some();
                    tune.sym_mut(id).key = Some(k2.clone());
                    sk = if transposing { Some(k2) } else { None };
                }
                _ => {}
            }
            cur = tune.sym(id).next;
        }
    }
}
