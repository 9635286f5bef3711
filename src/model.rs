//! Data model for the symbolic tune representation.
//!
//! A tune is a contiguous arena of [`Symbol`]s.  Every symbol sits in two
//! doubly linked sequences at once: the chronological list of its owning
//! voice (`prev`/`next`) and the global cross-voice time sequence
//! (`ts_prev`/`ts_next`).  Links are stable arena indices, so relinking a
//! symbol (e.g. moving a clef before a bar) is a few index updates and
//! there are no ownership cycles.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Duration of a whole note, in time units.  All symbol times and
/// durations are integer multiples of `BASE_LEN / n`; a quarter note is
/// `BASE_LEN / 4` = 384 units.
pub const BASE_LEN: i32 = 1536;

/// Stable handle of a symbol in the tune arena.
pub type SymId = usize;

/// Accidental codes carried by note heads and key accidental lists.
/// `0` means "no explicit accidental" (the key signature applies).
pub mod acc {
    pub const DBL_FLAT: i8 = -2;
    pub const FLAT: i8 = -1;
    pub const NONE: i8 = 0;
    pub const SHARP: i8 = 1;
    pub const DBL_SHARP: i8 = 2;
    pub const NATURAL: i8 = 3;
}

/// Staff grouping flag bits, as received in a staff/score directive.
/// One bitmask per voice; see [`crate::staves`].
pub mod flags {
    pub const OPEN_BRACE: u16 = 0x0001;
    pub const CLOSE_BRACE: u16 = 0x0002;
    pub const OPEN_BRACKET: u16 = 0x0004;
    pub const CLOSE_BRACKET: u16 = 0x0008;
    pub const OPEN_PARENTH: u16 = 0x0010;
    pub const CLOSE_PARENTH: u16 = 0x0020;
    /// Bar lines do not cross to the next staff.
    pub const STOP_BAR: u16 = 0x0040;
    /// Floating voice ("*v"): drawn on the surrounding staves.
    pub const FL_VOICE: u16 = 0x0080;
    /// Second-level brace / bracket (nested grouping).
    pub const OPEN_BRACE2: u16 = 0x0100;
    pub const CLOSE_BRACE2: u16 = 0x0200;
    pub const OPEN_BRACKET2: u16 = 0x0400;
    pub const CLOSE_BRACKET2: u16 = 0x0800;
    /// Master voice of a parenthesis (shared-staff) group.
    pub const MASTER_VOICE: u16 = 0x1000;
}

/// Symbol type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymType {
    Bar,
    Clef,
    Custos,
    Grace,
    Key,
    Meter,
    Mrest,
    Note,
    Part,
    Rest,
    Space,
    Staves,
    StaffBreak,
    Tempo,
    Block,
    Remark,
}

impl SymType {
    /// Priority weight used by the time sequencer: at equal time, lower
    /// weights are linked first so that every symbol column comes out in
    /// a deterministic order (bars before notes, clefs before keys, ...).
    /// Weight 0 symbols are free floating and impose no ordering.
    pub fn weight(self) -> u8 {
        match self {
            SymType::Note | SymType::Rest | SymType::Mrest => 9,
            SymType::Custos => 8,
            SymType::StaffBreak => 7,
            SymType::Bar => 5,
            SymType::Grace | SymType::Space => 4,
            SymType::Meter => 3,
            SymType::Key => 2,
            SymType::Clef => 1,
            SymType::Part
            | SymType::Tempo
            | SymType::Staves
            | SymType::Block
            | SymType::Remark => 0,
        }
    }
}

/// Reference into the source text, carried for diagnostics and
/// renderer/editor synchronization.  The core never reads the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceSpan {
    pub start: usize,
    pub end: usize,
}

/// One note head of a note, chord or grace group.
///
/// `pit` is the diatonic pitch number: 16 = middle C, 17 = D, ...,
/// 22 = B, 23 = the C above.  `acc` is an [`acc`] code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteHead {
    pub pit: i32,
    pub acc: i8,
    /// Note is tied to the next one of the same pitch.
    pub tie: bool,
}

impl NoteHead {
    pub fn new(pit: i32, acc: i8) -> Self {
        NoteHead { pit, acc, tie: false }
    }
}

/// Bar line payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BarInfo {
    /// Bar glyph sequence, e.g. "|", "||", "|:", ":|".
    pub bar_type: String,
    /// Dotted bar: a measure continuation, exempt from duration checks.
    pub dotted: bool,
    /// Repeat variant text ("1", "2", "1,3"...).
    pub text: Option<String>,
    /// Measure number.  May be preset by the input stream (explicit
    /// renumbering); otherwise filled in by the bar numbering pass.
    pub num: Option<i32>,
}

impl BarInfo {
    pub fn new(bar_type: &str) -> Self {
        BarInfo {
            bar_type: bar_type.to_string(),
            ..Default::default()
        }
    }

    /// True for right-repeat bars (":|", "::"...), which keep clefs and
    /// grace notes on their left side.
    pub fn is_repeat_end(&self) -> bool {
        self.bar_type.starts_with(':')
    }
}

/// Meter (time signature) state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meter {
    pub beats: i32,
    pub beat_type: i32,
    /// Duration of one full measure in time units.  `1` encodes the
    /// free meter ("none"): no measure length, bars just counted.
    pub wmeasure: i32,
}

impl Meter {
    pub fn new(beats: i32, beat_type: i32) -> Self {
        Meter {
            beats,
            beat_type,
            wmeasure: BASE_LEN * beats / beat_type,
        }
    }

    /// Free meter: no measure duration checking.
    pub fn none() -> Self {
        Meter { beats: 0, beat_type: 0, wmeasure: 1 }
    }
}

impl Default for Meter {
    fn default() -> Self {
        Meter::new(4, 4)
    }
}

/// Clef state of a voice or a mid-tune clef change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clef {
    /// "G", "F", "C" or "auto".
    pub sign: String,
    pub line: i32,
    /// Octave transposition of the clef (e.g. -1 for the vocal tenor G clef).
    pub octave_change: i32,
    /// Mid-tune clef change, drawn small.
    pub small: bool,
}

impl Default for Clef {
    fn default() -> Self {
        Clef {
            sign: "auto".to_string(),
            line: 2,
            octave_change: 0,
            small: false,
        }
    }
}

/// Key signature state, including the transposition intervals attached
/// to it.  `transp` is a signed base-40 interval combining document,
/// voice and clef-shift transposition; `snd_transp` only affects
/// playback and never changes the displayed spelling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyState {
    /// Signed count of sharps (> 0) or flats (< 0).
    pub sf: i32,
    /// Previous `sf`, kept so the renderer can draw naturals.
    pub old_sf: i32,
    pub mode: Option<String>,
    /// Explicit accidental list of an exceptional key (replaces `sf`
    /// for spelling decisions when present).
    pub acc_list: Option<Vec<NoteHead>>,
    /// Per-letter accidental map derived from `sf` (index 0 = C).
    pub map: [i8; 7],
    /// Tonic reference pitch in base-40 (0..40).
    pub b40: i32,
    /// Display transposition, base-40 interval.
    pub transp: Option<i32>,
    /// Playback-only transposition, base-40 interval.
    pub snd_transp: Option<i32>,
    /// K:none — unkeyed state.
    pub none: bool,
    pub bagpipe: bool,
    pub drum: bool,
    /// Key change that must not be drawn (parameter/playback only).
    pub invisible: bool,
}

impl Default for KeyState {
    fn default() -> Self {
        KeyState {
            sf: 0,
            old_sf: 0,
            mode: None,
            acc_list: None,
            map: [0; 7],
            b40: 2, // C
            transp: None,
            snd_transp: None,
            none: false,
            bagpipe: false,
            drum: false,
            invisible: false,
        }
    }
}

/// Feathered beam direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Feather {
    /// Notes accelerate: durations shrink along the beam.
    Accel,
    /// Notes slow down: durations grow along the beam.
    Rall,
}

/// A symbol of the tune.  Per-type payloads are optional fields; only
/// the ones relevant to `typ` are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub typ: SymType,
    /// Owning voice index.
    pub v: usize,
    /// Staff index at link time.
    pub st: usize,
    /// Start time in time units.
    pub time: i32,
    /// Duration in time units (0 for non-sounding symbols).
    pub dur: i32,
    /// First symbol of its simultaneity group in the global sequence.
    pub seq_start: bool,

    // voice list links
    pub prev: Option<SymId>,
    pub next: Option<SymId>,
    // global time sequence links
    pub ts_prev: Option<SymId>,
    pub ts_next: Option<SymId>,

    /// Index of the format snapshot active when the symbol was linked.
    pub fmt: usize,
    pub span: Option<SourceSpan>,
    /// Starts a new music line (pending line end consumed at link time).
    pub soln: bool,
    /// Linked while the voice was a second voice of its staff.
    pub second: bool,
    /// Linked while the voice was floating.
    pub floating: bool,
    /// Grace element: does not advance the time cursor.
    pub grace: bool,
    pub beam_end: bool,
    pub feathered: Option<Feather>,
    pub invisible: bool,

    /// Note heads (Note, Grace, and chord notes).
    pub notes: Vec<NoteHead>,
    pub bar: Option<BarInfo>,
    pub key: Option<KeyState>,
    pub meter: Option<Meter>,
    pub clef: Option<Clef>,
    /// Staff system index (Staves symbols only).
    pub sy: Option<usize>,
    /// Part marker name attached at link time.
    pub part: Option<String>,
    /// Free text (Remark, Block).
    pub text: Option<String>,
    /// Quarter notes per minute (Tempo).
    pub qpm: Option<i32>,
}

impl Symbol {
    pub fn new(typ: SymType) -> Self {
        Symbol {
            typ,
            v: 0,
            st: 0,
            time: 0,
            dur: 0,
            seq_start: false,
            prev: None,
            next: None,
            ts_prev: None,
            ts_next: None,
            fmt: 0,
            span: None,
            soln: false,
            second: false,
            floating: false,
            grace: false,
            beam_end: false,
            feathered: None,
            invisible: false,
            notes: Vec::new(),
            bar: None,
            key: None,
            meter: None,
            clef: None,
            sy: None,
            part: None,
            text: None,
            qpm: None,
        }
    }
}

/// A voice: chronological symbol list plus the state the builder keeps
/// while linking symbols into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Voice {
    /// Voice id as written in the source ("1", "T", "Mel"...).
    pub id: String,
    /// Index in the voice table.
    pub v: usize,
    pub name: Option<String>,

    /// Head / tail of the chronological list.
    pub sym: Option<SymId>,
    pub last_sym: Option<SymId>,
    pub last_note: Option<SymId>,

    /// Time cursor: where the next linked symbol starts.
    pub time: i32,

    /// Key at start of tune.
    pub key: KeyState,
    /// Current key while building.
    pub ckey: KeyState,
    /// Current key without transposition.
    pub okey: KeyState,
    pub meter: Meter,
    pub wmeasure: i32,
    pub clef: Clef,

    /// Staff at start / current staff.
    pub st: usize,
    pub cst: usize,
    pub stafflines: String,
    pub staffscale: f64,

    /// Unit note length in time units.
    pub ulen: i32,
    /// Duration scale as a rational (num, den); (q, p) while a p:q:r
    /// tuplet is open.
    pub dur_fact: (i32, i32),

    pub second: bool,
    pub floating: bool,
    /// A line end was seen; the next linked symbol starts a music line.
    pub eoln: bool,
    /// Repeat brackets are not drawn over this voice.
    pub norepbra: bool,

    /// Display transposition (score= / instrument=), base-40.
    pub transp: Option<i32>,
    /// Clef shift transposition (shift=), base-40.
    pub shift: Option<i32>,
    /// Playback-only transposition, base-40.
    pub snd_transp: Option<i32>,
    pub snd_shift: Option<i32>,
    /// Combined display transposition, set when any of the above is.
    pub vtransp: Option<i32>,

    /// Overlay shadow voice, displayed right below this one.
    pub voice_down: Option<usize>,
    /// Voice created in this tune and not yet placed on a staff.
    pub is_new: bool,
}

impl Voice {
    pub fn new(v: usize, id: &str) -> Self {
        let meter = Meter::default();
        Voice {
            id: id.to_string(),
            v,
            name: None,
            sym: None,
            last_sym: None,
            last_note: None,
            time: 0,
            key: KeyState::default(),
            ckey: KeyState::default(),
            okey: KeyState::default(),
            wmeasure: meter.wmeasure,
            meter,
            clef: Clef::default(),
            st: 0,
            cst: 0,
            stafflines: "|||||".to_string(),
            staffscale: 1.0,
            ulen: BASE_LEN / 8,
            dur_fact: (1, 1),
            second: false,
            floating: false,
            eoln: false,
            norepbra: false,
            transp: None,
            shift: None,
            snd_transp: None,
            snd_shift: None,
            vtransp: None,
            voice_down: None,
            is_new: true,
        }
    }

    /// Scale a raw duration by the active duration factor.
    pub fn scale_dur(&self, dur: i32) -> i32 {
        let (num, den) = self.dur_fact;
        if num == den {
            dur
        } else {
            dur * num / den
        }
    }
}

/// Position of one voice inside a staff system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyVoice {
    /// Staff index.
    pub st: usize,
    /// Left-to-right ordinal of the voice in the system.
    pub range: usize,
    /// Second voice of its staff.
    pub second: bool,
}

/// One staff of a staff system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyStaff {
    pub stafflines: String,
    pub staffscale: f64,
    /// Grouping flag bits ([`flags`]).
    pub flags: u16,
}

impl Default for SyStaff {
    fn default() -> Self {
        SyStaff {
            stafflines: "|||||".to_string(),
            staffscale: 1.0,
            flags: 0,
        }
    }
}

/// A staff system: the voice-to-staff/range mapping and the staff
/// descriptors valid from one staff directive to the next.  Systems are
/// chained chronologically by their index in [`Tune::systems`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaffSystem {
    /// Indexed by voice number; `None` if the voice is not visible.
    pub voices: Vec<Option<SyVoice>>,
    pub staves: Vec<SyStaff>,
    /// Voice at the top of the system (display range 0).
    pub top_voice: usize,
}

impl StaffSystem {
    /// Voice numbers of the system, in display range order.
    pub fn by_range(&self) -> Vec<usize> {
        let mut vr: Vec<(usize, usize)> = self
            .voices
            .iter()
            .enumerate()
            .filter_map(|(v, sv)| sv.as_ref().map(|sv| (sv.range, v)))
            .collect();
        vr.sort_unstable();
        vr.into_iter().map(|(_, v)| v).collect()
    }

    pub(crate) fn set_voice(&mut self, v: usize, sv: SyVoice) {
        if self.voices.len() <= v {
            self.voices.resize(v + 1, None);
        }
        self.voices[v] = Some(sv);
    }

    pub(crate) fn voice(&self, v: usize) -> Option<&SyVoice> {
        self.voices.get(v).and_then(|sv| sv.as_ref())
    }

    pub(crate) fn voice_mut(&mut self, v: usize) -> Option<&mut SyVoice> {
        self.voices.get_mut(v).and_then(|sv| sv.as_mut())
    }
}

/// Format snapshot referenced by `Symbol::fmt`.  The builder pushes a
/// new snapshot whenever a formatting directive changes one of these;
/// symbols keep the index of the snapshot active at link time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fmt {
    /// Page scale.
    pub scale: f64,
    /// Width of a staff break, in output units.
    pub stbrk_width: f64,
}

impl Default for Fmt {
    fn default() -> Self {
        Fmt { scale: 1.0, stbrk_width: 14.0 }
    }
}

/// A fully built tune: the symbol arena, the voice table, the staff
/// system chain and the head of the global time sequence.  Renderer and
/// player consumers traverse via [`Tune::seq_iter`]/[`Tune::voice_iter`]
/// and must not mutate timing or ordering fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tune {
    pub syms: Vec<Symbol>,
    pub voices: Vec<Voice>,
    pub systems: Vec<StaffSystem>,
    pub fmts: Vec<Fmt>,
    /// First symbol of the global time sequence.
    pub ts_first: Option<SymId>,
    /// Header metadata (title, composer...), keyed by field name.
    pub info: BTreeMap<String, String>,
}

impl Tune {
    pub fn new() -> Self {
        Tune {
            syms: Vec::new(),
            voices: Vec::new(),
            systems: vec![StaffSystem::default()],
            fmts: vec![Fmt::default()],
            ts_first: None,
            info: BTreeMap::new(),
        }
    }

    pub fn sym(&self, id: SymId) -> &Symbol {
        &self.syms[id]
    }

    pub fn sym_mut(&mut self, id: SymId) -> &mut Symbol {
        &mut self.syms[id]
    }

    pub(crate) fn add_sym(&mut self, s: Symbol) -> SymId {
        self.syms.push(s);
        self.syms.len() - 1
    }

    /// Iterate the global time sequence from its head.
    pub fn seq_iter(&self) -> SeqIter<'_> {
        SeqIter { tune: self, next: self.ts_first }
    }

    /// Iterate the chronological list of one voice.
    pub fn voice_iter(&self, v: usize) -> VoiceIter<'_> {
        VoiceIter {
            tune: self,
            next: self.voices.get(v).and_then(|p| p.sym),
        }
    }
}

/// Iterator over the global time sequence.
pub struct SeqIter<'a> {
    tune: &'a Tune,
    next: Option<SymId>,
}

impl<'a> Iterator for SeqIter<'a> {
    type Item = (SymId, &'a Symbol);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let s = self.tune.sym(id);
        self.next = s.ts_next;
        Some((id, s))
    }
}

/// Iterator over one voice's chronological list.
pub struct VoiceIter<'a> {
    tune: &'a Tune,
    next: Option<SymId>,
}

impl<'a> Iterator for VoiceIter<'a> {
    type Item = (SymId, &'a Symbol);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let s = self.tune.sym(id);
        self.next = s.next;
        Some((id, s))
    }
}
