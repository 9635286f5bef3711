//! Tune construction.
//!
//! [`TuneBuilder`] receives the event stream of an external lexer and
//! builds the symbol arena, voice lists and staff systems of one or
//! more tunes.  The builder never parses music text: notes, bars, keys
//! and directives arrive as typed [`Event`]s.  On [`TuneBuilder::finish`]
//! the per-voice lists are adjusted, merged into the global time
//! sequence, bar-numbered and transposed, and the completed [`Tune`] is
//! collected.

use std::collections::HashMap;
use std::mem;

use crate::barnum;
use crate::diag::{self, DiagKind, Diagnostic, Severity};
use crate::model::{
    BarInfo, Clef, Feather, Fmt, KeyState, Meter, NoteHead, SourceSpan, SyStaff, SyVoice, SymId,
    SymType, Symbol, Tune, Voice, BASE_LEN,
};
use crate::sequencer;
use crate::transpose;

/// Document-level settings, the equivalent of the format directives
/// that apply before any tune starts.
#[derive(Debug, Clone)]
pub struct Config {
    /// Document transposition, base-40 interval.
    pub transpose: Option<i32>,
    /// Report measures whose duration does not match the meter.
    pub checkbars: bool,
    /// Continue the measure numbering through repeat variants.
    pub contbarnb: bool,
    /// Number of the first measure.
    pub first_bar_num: i32,
    /// Default unit note length, in time units.
    pub ulen: i32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            transpose: None,
            checkbars: true,
            contbarnb: false,
            first_bar_num: 0,
            ulen: BASE_LEN / 8,
        }
    }
}

/// Voice parameters carried by a voice declaration.
#[derive(Debug, Clone, Default)]
pub struct VoiceParams {
    pub name: Option<String>,
    pub stafflines: Option<String>,
    pub staffscale: Option<f64>,
    /// Display transposition (score= / instrument=), base-40.
    pub transp: Option<i32>,
    /// Clef shift transposition, base-40.
    pub shift: Option<i32>,
    /// Playback-only transposition, base-40.
    pub snd_transp: Option<i32>,
    pub snd_shift: Option<i32>,
}

/// One event of the input stream.  Events are `Clone` so that a
/// multi-voice declaration can replay a recorded range into each of its
/// voices.
#[derive(Debug, Clone)]
pub enum Event {
    Note {
        notes: Vec<NoteHead>,
        /// Raw duration in time units, before tuplet scaling.
        dur: i32,
        grace: bool,
        beam_end: bool,
        feathered: Option<Feather>,
    },
    Rest {
        dur: i32,
        invisible: bool,
    },
    /// Multi-measure rest.
    Mrest {
        measures: i32,
    },
    Bar {
        info: BarInfo,
        invisible: bool,
    },
    Clef(Clef),
    Key {
        key: KeyState,
        /// The declaration carries an explicit signature (as opposed to
        /// a parameter-only change).
        has_sf: bool,
    },
    Meter(Meter),
    /// Voice declaration; several ids clone the following music into
    /// each voice.
    Voice {
        ids: Vec<String>,
        params: VoiceParams,
    },
    /// Staff or score directive; `None` duplicates the current layout.
    Staves {
        score_form: bool,
        spec: Option<Vec<(String, u16)>>,
    },
    /// Start of a full voice overlay ("(&...&)").
    OverlayStart,
    /// Next overlay row ("&").
    Overlay,
    /// End of a full voice overlay (")").
    OverlayEnd,
    TupletStart {
        p: i32,
        q: i32,
        r: i32,
    },
    StaffBreak,
    Tempo {
        qpm: i32,
    },
    Part {
        name: String,
    },
    Space,
    Block {
        text: String,
    },
    Remark {
        text: String,
    },
    /// Header metadata field (title, composer...).
    Info {
        key: String,
        value: String,
    },
    /// End of a music line.
    LineEnd,
    /// Pseudo-comment; unknown names go to the extension registry.
    Directive {
        name: String,
        param: String,
    },
}

/// Pluggable handling of non-core directives and model hooks.
pub trait Extension {
    fn name(&self) -> &str;

    /// Handle a directive.  Return `true` when consumed.
    fn directive(&mut self, _name: &str, _param: &str) -> bool {
        false
    }

    /// Called after each staff directive has built its system.
    fn after_staves(&mut self, _sy: &crate::model::StaffSystem) {}

    /// Called just before / after the transposition pass of a tune.
    fn before_transpose(&mut self, _tune: &mut Tune) {}
    fn after_transpose(&mut self, _tune: &mut Tune) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Header,
    Body,
}

/// Pending voice overlay.
pub(crate) struct Vover {
    /// Bar type at overlay start; `None` for a full overlay.
    pub bar: Option<String>,
    /// Base voice.
    pub v: usize,
    /// Time the overlay rows restart from.
    pub time: i32,
}

/// Multi-voice declaration being recorded.
struct CloneState {
    ids: Vec<String>,
    params: VoiceParams,
    events: Vec<Event>,
}

/// The construction context of one tune (or tune segment).
pub struct TuneBuilder {
    pub(crate) tune: Tune,
    tunes: Vec<Tune>,
    pub(crate) cfg: Config,
    pub(crate) curvoice: Option<usize>,
    /// System under construction (index in `tune.systems`).
    pub(crate) par_sy: usize,
    /// Time of the last staff directive; -1 before the first one.
    pub(crate) staves_found: i32,
    pub(crate) state: State,
    pub(crate) vover: Option<Vover>,
    clone_state: Option<CloneState>,
    replaying: bool,
    /// Open tuplets: remaining note count per voice.
    tuplets: HashMap<usize, i32>,
    /// Deferred part markers by time; each attaches at most once.
    parts: HashMap<i32, (String, bool)>,
    header_tempo: Option<Symbol>,
    setbarnb: Option<i32>,
    base_key: KeyState,
    glovar_meter: Meter,
    cur_fmt: Fmt,
    fmt_dirty: bool,
    cur_span: Option<SourceSpan>,
    has_default: bool,
    star_params: Option<VoiceParams>,
    extensions: Vec<Box<dyn Extension>>,
    diags: Vec<Diagnostic>,
}

impl Default for TuneBuilder {
    fn default() -> Self {
        TuneBuilder::new(Config::default())
    }
}

impl TuneBuilder {
    pub fn new(cfg: Config) -> Self {
        TuneBuilder {
            tune: Tune::new(),
            tunes: Vec::new(),
            cfg,
            curvoice: None,
            par_sy: 0,
            staves_found: -1,
            state: State::Header,
            vover: None,
            clone_state: None,
            replaying: false,
            tuplets: HashMap::new(),
            parts: HashMap::new(),
            header_tempo: None,
            setbarnb: None,
            base_key: KeyState::default(),
            glovar_meter: Meter::default(),
            cur_fmt: Fmt::default(),
            fmt_dirty: false,
            cur_span: None,
            has_default: false,
            star_params: None,
            extensions: Vec::new(),
            diags: Vec::new(),
        }
    }

    pub fn register_extension(&mut self, ext: Box<dyn Extension>) {
        self.extensions.push(ext);
    }

    /// Source reference attached to the symbols linked from now on.
    pub fn set_source(&mut self, span: SourceSpan) {
        self.cur_span = Some(span);
    }

    /// The tune under construction (read-only).
    pub fn current_tune(&self) -> &Tune {
        &self.tune
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diags
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        mem::take(&mut self.diags)
    }

    /// Feed one event.
    pub fn event(&mut self, ev: Event) {
        // record the music range of a multi-voice declaration; the
        // declarations themselves end the range
        if self.clone_state.is_some() && !self.replaying {
            match ev {
                Event::Voice { .. } | Event::Staves { .. } => {}
                ref e => {
                    if let Some(cs) = self.clone_state.as_mut() {
                        cs.events.push(e.clone());
                    }
                }
            }
        }

        match ev {
            Event::Note { notes, dur, grace, beam_end, feathered } => {
                let cv = self.ensure_voice();
                let mut s = Symbol::new(if grace { SymType::Grace } else { SymType::Note });
                s.notes = notes;
                s.grace = grace;
                s.beam_end = beam_end;
                s.feathered = feathered;
                s.dur = if grace { dur } else { self.tune.voices[cv].scale_dur(dur) };
                let id = self.sym_link(s);
                if !grace {
                    self.tune.voices[cv].last_note = Some(id);
                    self.count_tuplet_note(cv);
                }
            }
            Event::Rest { dur, invisible } => {
                let cv = self.ensure_voice();
                let mut s = Symbol::new(SymType::Rest);
                s.dur = self.tune.voices[cv].scale_dur(dur);
                s.invisible = invisible;
                let id = self.sym_link(s);
                self.tune.voices[cv].last_note = Some(id);
                self.count_tuplet_note(cv);
            }
            Event::Mrest { measures } => {
                let cv = self.ensure_voice();
                let mut s = Symbol::new(SymType::Mrest);
                s.dur = self.tune.voices[cv].wmeasure * measures;
                s.text = Some(measures.to_string());
                self.sym_link(s);
            }
            Event::Bar { mut info, invisible } => {
                // a bar line ends a measure overlay
                if self.vover.as_ref().map_or(false, |vo| vo.bar.is_some()) {
                    self.vover_end();
                }
                self.ensure_voice();
                if info.num.is_none() {
                    info.num = self.setbarnb.take();
                }
                let mut s = Symbol::new(SymType::Bar);
                s.invisible = invisible;
                s.bar = Some(info);
                self.sym_link(s);
            }
            Event::Clef(clef) => self.get_clef(clef),
            Event::Key { key, has_sf } => self.get_key(key, has_sf),
            Event::Meter(meter) => self.get_meter(meter),
            Event::Voice { ids, params } => self.get_voice(&ids, &params),
            Event::Staves { score_form, spec } => {
                self.staves(score_form, spec);
                let mut exts = mem::take(&mut self.extensions);
                for e in &mut exts {
                    e.after_staves(&self.tune.systems[self.par_sy]);
                }
                self.extensions = exts;
            }
            Event::OverlayStart => self.vover_start(),
            Event::Overlay => self.vover_next(),
            Event::OverlayEnd => self.vover_end(),
            Event::TupletStart { p, q, r } => {
                let cv = self.ensure_voice();
                if p > 0 && q > 0 && r > 0 {
                    self.tune.voices[cv].dur_fact = (q, p);
                    self.tuplets.insert(cv, r);
                }
            }
            Event::StaffBreak => {
                self.ensure_voice();
                self.sym_link(Symbol::new(SymType::StaffBreak));
            }
            Event::Tempo { qpm } => {
                let mut s = Symbol::new(SymType::Tempo);
                s.qpm = Some(qpm);
                if self.state == State::Header {
                    self.header_tempo = Some(s);
                } else {
                    self.ensure_voice();
                    self.sym_link(s);
                }
            }
            Event::Part { name } => {
                let cv = self.ensure_voice();
                let tim = self.tune.voices[cv].time;
                self.parts.entry(tim).or_insert((name, false));
            }
            Event::Space => {
                self.ensure_voice();
                self.sym_link(Symbol::new(SymType::Space));
            }
            Event::Block { text } => {
                self.ensure_voice();
                let mut s = Symbol::new(SymType::Block);
                s.text = Some(text);
                self.sym_link(s);
            }
            Event::Remark { text } => {
                self.ensure_voice();
                let mut s = Symbol::new(SymType::Remark);
                s.text = Some(text);
                self.sym_link(s);
            }
            Event::Info { key, value } => {
                self.tune.info.insert(key, value);
            }
            Event::LineEnd => {
                if let Some(cv) = self.curvoice {
                    self.tune.voices[cv].eoln = true;
                }
            }
            Event::Directive { name, param } => self.directive(&name, &param),
        }
    }

    /// End the current tune: run the construction passes, collect the
    /// result and reset for the next tune.
    pub fn finish(&mut self) {
        self.end_tune(false);
    }

    /// End the current segment but keep the voice settings, so the next
    /// segment continues with the same keys, clefs and meters.
    pub fn end_segment(&mut self) {
        if self.state == State::Body {
            self.end_tune(true);
        }
    }

    /// Completed tunes, finishing any pending one.  Empty segments are
    /// left out.
    pub fn into_tunes(mut self) -> Vec<Tune> {
        if self.tune.voices.iter().any(|p| p.sym.is_some()) {
            self.finish();
        }
        self.tunes
    }

    // ── construction internals ──────────────────────────────────────

    pub(crate) fn report(&mut self, severity: Severity, kind: DiagKind) {
        diag::emit(&mut self.diags, Diagnostic::new(severity, kind));
    }

    fn fmt_index(&mut self) -> usize {
        if self.fmt_dirty {
            self.fmt_dirty = false;
            if self.tune.fmts.last() != Some(&self.cur_fmt) {
                self.tune.fmts.push(self.cur_fmt.clone());
            }
        }
        self.tune.fmts.len() - 1
    }

    fn create_voice(&mut self, id: &str) -> usize {
        let v = self.tune.voices.len();
        let mut p = Voice::new(v, id);
        p.key = self.base_key.clone();
        p.ckey = self.base_key.clone();
        p.okey = self.base_key.clone();
        p.meter = self.glovar_meter;
        p.wmeasure = self.glovar_meter.wmeasure;
        p.ulen = self.cfg.ulen;
        self.tune.voices.push(p);
        if let Some(sp) = self.star_params.clone() {
            self.apply_voice_params(v, &sp);
        }
        v
    }

    /// The current voice, creating the implicit default one on first
    /// need (music before any voice declaration).
    pub(crate) fn ensure_voice(&mut self) -> usize {
        if let Some(v) = self.curvoice {
            return v;
        }
        if self.tune.voices.is_empty() {
            let v = self.create_voice("1");
            self.has_default = true;
            self.place_new_voice(v);
            self.curvoice = Some(v);
            return v;
        }
        let v = self.tune.systems[self.par_sy].top_voice;
        self.curvoice = Some(v);
        v
    }

    /// Get or create a voice by id.  The first explicitly declared
    /// voice takes over the implicit default one if it has no music.
    pub(crate) fn new_voice(&mut self, id: &str) -> usize {
        if self.tune.voices.len() == 1 && self.has_default {
            self.has_default = false;
            if self.tune.voices[0].time == 0 {
                self.tune.voices[0].id = id.to_string();
                if self.cfg.transpose.is_some() && self.state == State::Body {
                    let sav = self.curvoice;
                    self.curvoice = Some(0);
                    self.set_transp();
                    self.curvoice = sav;
                }
                return 0;
            }
        }
        if let Some(v) = self.tune.voices.iter().position(|p| p.id == id) {
            return v;
        }
        self.create_voice(id)
    }

    /// Link a symbol at the current voice's time cursor.
    pub(crate) fn sym_link(&mut self, mut s: Symbol) -> SymId {
        let cv = self.ensure_voice();
        let tim = self.tune.voices[cv].time;
        s.v = cv;
        s.st = self.tune.voices[cv].cst;
        s.time = tim;
        s.fmt = self.fmt_index();
        if s.span.is_none() {
            s.span = self.cur_span;
        }
        if s.dur != 0 && !s.grace {
            self.tune.voices[cv].time += s.dur;
        }
        if self.tune.voices[cv].second {
            s.second = true;
        }
        if self.tune.voices[cv].floating {
            s.floating = true;
        }
        if self.tune.voices[cv].eoln {
            s.soln = true;
            self.tune.voices[cv].eoln = false;
        }
        if let Some((name, done)) = self.parts.get_mut(&tim) {
            if !*done {
                s.part = Some(name.clone());
                *done = true;
            }
        }
        s.prev = self.tune.voices[cv].last_sym;
        let id = self.tune.add_sym(s);
        match self.tune.voices[cv].last_sym {
            Some(p) => self.tune.sym_mut(p).next = Some(id),
            None => self.tune.voices[cv].sym = Some(id),
        }
        self.tune.voices[cv].last_sym = Some(id);
        id
    }

    /// Link a zero-duration symbol into an arbitrary voice, inheriting
    /// the source reference from a neighbor.
    pub fn sym_add(&mut self, v: usize, typ: SymType) -> SymId {
        let sav = self.curvoice;
        self.curvoice = Some(v);
        let id = self.sym_link(Symbol::new(typ));
        self.curvoice = sav;
        if self.tune.sym(id).span.is_none() {
            let span = self
                .tune
                .sym(id)
                .prev
                .or(self.tune.sym(id).next)
                .and_then(|n| self.tune.sym(n).span);
            self.tune.sym_mut(id).span = span;
        }
        id
    }

    fn count_tuplet_note(&mut self, cv: usize) {
        if let Some(left) = self.tuplets.get_mut(&cv) {
            *left -= 1;
            if *left <= 0 {
                self.tuplets.remove(&cv);
                self.tune.voices[cv].dur_fact = (1, 1);
            }
        }
    }

    /// True while only signature symbols (or nothing) were linked, so a
    /// clef/key/meter can replace the voice's initial state.
    fn is_voice_sig(&self) -> bool {
        let cv = match self.curvoice {
            Some(v) => v,
            None => return true,
        };
        let p = &self.tune.voices[cv];
        if p.last_sym.is_none() {
            return true;
        }
        if p.time != 0 {
            return false;
        }
        let mut cur = p.last_sym;
        while let Some(id) = cur {
            if self.tune.sym(id).typ.weight() != 0 {
                return false;
            }
            cur = self.tune.sym(id).prev;
        }
        true
    }

    fn get_clef(&mut self, clef: Clef) {
        let cv = self.ensure_voice();
        if self.is_voice_sig() {
            self.tune.voices[cv].clef = clef;
            return;
        }

        // mid-tune clef change, drawn small
        let mut clef = clef;
        clef.small = true;
        let mut s = Symbol::new(SymType::Clef);
        s.clef = Some(clef);
        let id = self.sym_link(s);

        // move the clef before an immediately preceding bar, unless the
        // bar is a right repeat
        let prev = self.tune.sym(id).prev;
        if let Some(p) = prev {
            let movable = self.tune.sym(p).typ == SymType::Bar
                && !self
                    .tune
                    .sym(p)
                    .bar
                    .as_ref()
                    .map_or(false, |b| b.is_repeat_end());
            if movable {
                let pp = self.tune.sym(p).prev;
                self.tune.sym_mut(id).next = Some(p);
                self.tune.sym_mut(id).prev = pp;
                match pp {
                    Some(ppid) => self.tune.sym_mut(ppid).next = Some(id),
                    None => self.tune.voices[cv].sym = Some(id),
                }
                self.tune.sym_mut(p).prev = Some(id);
                self.tune.sym_mut(p).next = None;
                self.tune.voices[cv].last_sym = Some(p);
                if self.tune.sym(id).soln {
                    // the line starts on the bar, not on the clef
                    self.tune.sym_mut(id).soln = false;
                    self.tune.voices[cv].eoln = true;
                }
            }
        }
    }

    fn get_key(&mut self, mut key: KeyState, mut has_sf: bool) {
        if self.state == State::Header {
            // first key signature: the tune header ends here
            if !has_sf && key.acc_list.is_none() {
                key.sf = 0;
                key.none = true;
            }
            has_sf = true;
            if self.tune.voices.is_empty() {
                self.ensure_voice();
            }
            for p in &mut self.tune.voices {
                p.key = key.clone();
                p.okey = key.clone();
                p.ckey = key.clone();
            }
            self.base_key = key.clone();
            self.state = State::Body;
            if self.curvoice.is_none() {
                self.curvoice = Some(self.tune.systems[self.par_sy].top_voice);
            }
        }

        let cv = self.ensure_voice();
        let transp = if !self.tune.voices[cv].ckey.bagpipe
            && !self.tune.voices[cv].ckey.drum
            && (self.cfg.transpose.is_some()
                || self.tune.voices[cv].transp.is_some()
                || self.tune.voices[cv].shift.is_some())
        {
            Some(
                self.cfg.transpose.unwrap_or(0)
                    + self.tune.voices[cv].transp.unwrap_or(0)
                    + self.tune.voices[cv].shift.unwrap_or(0),
            )
        } else {
            None
        };
        let sndtran = if self.tune.voices[cv].snd_transp.is_some()
            || self.tune.voices[cv].snd_shift.is_some()
        {
            Some(
                self.tune.voices[cv].snd_transp.unwrap_or(0)
                    + self.tune.voices[cv].snd_shift.unwrap_or(0),
            )
        } else {
            None
        };

        if !has_sf {
            if key.acc_list.is_none() && transp.is_none() {
                if sndtran.is_none() {
                    return; // parameter-only change, not a key signature
                }
                key.invisible = true; // playback only
            }
            key.sf = self.tune.voices[cv].okey.sf;
            key.b40 = self.tune.voices[cv].ckey.b40;
        } else {
            key.b40 = transpose::sf_to_b40(key.sf);
        }

        self.tune.voices[cv].okey = key.clone();
        if let Some(t) = transp {
            self.tune.voices[cv].vtransp = Some(t);
            key.transp = Some(t);
        }
        if let Some(t) = sndtran {
            key.snd_transp = Some(t);
        }

        key.old_sf = self.tune.voices[cv].ckey.sf;
        if key.acc_list.as_ref().map_or(true, |l| l.is_empty())
            && key.sf == 0
            && key.old_sf == 0
        {
            key.invisible = true; // nothing to draw
        }
        self.tune.voices[cv].ckey = key.clone();

        if self.is_voice_sig() {
            if key.none {
                key.sf = 0;
            }
            self.tune.voices[cv].key = key;
        } else {
            let mut s = Symbol::new(SymType::Key);
            s.invisible = key.invisible;
            s.key = Some(key);
            self.sym_link(s);
        }
    }

    fn get_meter(&mut self, meter: Meter) {
        if self.state == State::Header {
            self.glovar_meter = meter;
            for p in &mut self.tune.voices {
                p.meter = meter;
                p.wmeasure = meter.wmeasure;
            }
            return;
        }
        let cv = self.ensure_voice();
        self.tune.voices[cv].meter = meter;
        self.tune.voices[cv].wmeasure = meter.wmeasure;
        if !self.is_voice_sig() {
            let mut s = Symbol::new(SymType::Meter);
            s.meter = Some(meter);
            self.sym_link(s);
        }
    }

    fn get_voice(&mut self, ids: &[String], params: &VoiceParams) {
        if ids.is_empty() {
            return;
        }
        if self.clone_state.is_some() && !self.replaying {
            self.do_cloning();
        }

        if self.state == State::Header {
            for id in ids {
                if id == "*" {
                    self.star_params = Some(params.clone());
                    continue;
                }
                let v = self.new_voice(id);
                self.curvoice = Some(v);
                self.apply_voice_params(v, params);
                self.place_new_voice(v);
            }
            return;
        }

        if ids[0] == "*" {
            self.report(Severity::Error, DiagKind::WildcardVoiceInBody);
            return;
        }

        let v = self.new_voice(&ids[0]);
        self.curvoice = Some(v);
        if ids.len() > 1 && !self.replaying {
            self.clone_state = Some(CloneState {
                ids: ids[1..].to_vec(),
                params: params.clone(),
                events: Vec::new(),
            });
        }
        self.apply_voice_params(v, params);
        self.place_new_voice(v);
    }

    /// A voice first seen without any staff directive gets a staff of
    /// its own.
    fn place_new_voice(&mut self, v: usize) {
        if !self.tune.voices[v].is_new {
            return;
        }
        self.tune.voices[v].is_new = false;
        if self.staves_found < 0 {
            let lines = self.tune.voices[v].stafflines.clone();
            let sy = &mut self.tune.systems[self.par_sy];
            let st = sy.staves.len();
            sy.staves.push(SyStaff { stafflines: lines, ..Default::default() });
            sy.set_voice(v, SyVoice { st, range: v, second: false });
            self.tune.voices[v].st = st;
            self.tune.voices[v].cst = st;
        }
    }

    fn apply_voice_params(&mut self, v: usize, params: &VoiceParams) {
        if let Some(n) = &params.name {
            self.tune.voices[v].name = Some(n.clone());
        }
        if let Some(l) = &params.stafflines {
            self.tune.voices[v].stafflines = l.clone();
        }
        if let Some(sc) = params.staffscale {
            self.tune.voices[v].staffscale = sc;
        }
        if let Some(t) = params.transp {
            self.tune.voices[v].transp = Some(t);
        }
        if let Some(t) = params.shift {
            self.tune.voices[v].shift = Some(t);
        }
        if let Some(t) = params.snd_transp {
            self.tune.voices[v].snd_transp = Some(t);
        }
        if let Some(t) = params.snd_shift {
            self.tune.voices[v].snd_shift = Some(t);
        }
        if params.transp.is_some()
            || params.shift.is_some()
            || params.snd_transp.is_some()
            || params.snd_shift.is_some()
            || self.cfg.transpose.is_some()
        {
            let sav = self.curvoice;
            self.curvoice = Some(v);
            self.set_transp();
            self.curvoice = sav;
        }
    }

    /// Combine the document and voice transposition and store it in the
    /// active key signature of the current voice.
    fn set_transp(&mut self) {
        let cv = match self.curvoice {
            Some(v) => v,
            None => return,
        };
        if self.tune.voices[cv].ckey.bagpipe || self.tune.voices[cv].ckey.drum {
            return;
        }
        if self.cfg.transpose.is_some() && self.tune.voices[cv].shift.is_some() {
            self.report(Severity::Warning, DiagKind::MixedTransposition);
        }

        let p = &self.tune.voices[cv];
        let transp = if self.cfg.transpose.is_some() || p.transp.is_some() || p.shift.is_some() {
            Some(
                self.cfg.transpose.unwrap_or(0) + p.transp.unwrap_or(0) + p.shift.unwrap_or(0),
            )
        } else {
            None
        };
        let sndtran = if p.snd_transp.is_some() || p.snd_shift.is_some() {
            Some(p.snd_transp.unwrap_or(0) + p.snd_shift.unwrap_or(0))
        } else {
            None
        };
        if transp.is_none() && sndtran.is_none() {
            return;
        }
        if let Some(t) = transp {
            self.tune.voices[cv].vtransp = Some(t);
        }

        if self.is_voice_sig() {
            let mut k = self.tune.voices[cv].okey.clone();
            if let Some(t) = transp {
                k.transp = Some(t);
            }
            if let Some(t) = sndtran {
                k.snd_transp = Some(t);
            }
            self.tune.voices[cv].ckey = k.clone();
            if k.none {
                k.sf = 0;
            }
            self.tune.voices[cv].key = k;
            return;
        }

        // set the transposition on the previous key signature
        let mut cur = self.tune.voices[cv].last_sym;
        let mut target = None;
        while let Some(id) = cur {
            if self.tune.sym(id).typ == SymType::Key {
                target = Some(id);
                break;
            }
            cur = self.tune.sym(id).prev;
        }
        match target {
            Some(id) => {
                let k = match self.tune.sym_mut(id).key.as_mut() {
                    Some(k) => {
                        if let Some(t) = transp {
                            k.transp = Some(t);
                        }
                        if let Some(t) = sndtran {
                            k.snd_transp = Some(t);
                        }
                        k.clone()
                    }
                    None => return,
                };
                self.tune.voices[cv].ckey = k;
            }
            None => {
                if let Some(t) = transp {
                    self.tune.voices[cv].key.transp = Some(t);
                }
                if let Some(t) = sndtran {
                    self.tune.voices[cv].key.snd_transp = Some(t);
                }
                self.tune.voices[cv].ckey = self.tune.voices[cv].key.clone();
                if self.tune.voices[cv].key.none {
                    self.tune.voices[cv].key.sf = 0;
                }
            }
        }
    }

    /// Replay the recorded music range into each remaining voice of a
    /// multi-voice declaration.
    fn do_cloning(&mut self) {
        let cs = match self.clone_state.take() {
            Some(c) => c,
            None => return,
        };
        self.replaying = true;
        for id in &cs.ids {
            self.get_voice(std::slice::from_ref(id), &cs.params);
            for ev in &cs.events {
                self.event(ev.clone());
            }
        }
        self.replaying = false;
    }

    /// Per-voice adjustments; also flushes a pending multi-voice
    /// declaration.
    pub(crate) fn voice_adj(&mut self, sys_chg: bool) {
        if self.clone_state.is_some() && !self.replaying {
            self.do_cloning();
        }
        sequencer::voice_adj(&mut self.tune, sys_chg, self.staves_found);
    }

    fn parse_semitones(param: &str) -> Option<i32> {
        let p = param.trim();
        let (num, flat) = if let Some(stripped) = p.strip_suffix('#') {
            (stripped, false)
        } else if let Some(stripped) = p.strip_suffix('b') {
            (stripped, true)
        } else {
            (p, p.starts_with('-'))
        };
        let semi: i32 = num.trim().parse().ok()?;
        transpose::interval_from_semitones(semi, flat)
    }

    fn directive(&mut self, name: &str, param: &str) {
        match name {
            "transpose" => {
                self.cfg.transpose = Self::parse_semitones(param);
                if self.curvoice.is_some() {
                    self.set_transp();
                }
            }
            "setbarnb" => {
                if let Ok(n) = param.trim().parse() {
                    if self.state == State::Body {
                        self.setbarnb = Some(n);
                    } else {
                        self.cfg.first_bar_num = n;
                    }
                }
            }
            "contbarnb" => self.cfg.contbarnb = param.trim() != "0",
            "checkbars" => self.cfg.checkbars = param.trim() != "0",
            "scale" => {
                if let Ok(sc) = param.trim().parse() {
                    self.cur_fmt.scale = sc;
                    self.fmt_dirty = true;
                }
            }
            "stbrkwidth" => {
                if let Ok(w) = param.trim().parse() {
                    self.cur_fmt.stbrk_width = w;
                    self.fmt_dirty = true;
                }
            }
            _ => {
                let mut exts = mem::take(&mut self.extensions);
                let handled = exts.iter_mut().any(|e| e.directive(name, param));
                self.extensions = exts;
                if !handled {
                    log::debug!("unhandled directive %%{} {}", name, param);
                }
            }
        }
    }

    fn end_tune(&mut self, keep_voices: bool) {
        // repair what is still open
        if !self.tuplets.is_empty() {
            let voices: Vec<usize> = self.tuplets.keys().copied().collect();
            for v in voices {
                self.tune.voices[v].dur_fact = (1, 1);
            }
            self.tuplets.clear();
            self.report(Severity::Error, DiagKind::UnterminatedTuplet);
        }
        if self.vover.is_some() {
            self.report(Severity::Error, DiagKind::UnterminatedOverlay);
            self.vover_end();
        }

        self.voice_adj(false);
        sequencer::sort_all(&mut self.tune, self.header_tempo.take());

        if self.tune.ts_first.is_some() {
            barnum::set_bar_num(&mut self.tune, &self.cfg, &mut self.diags);

            let mut exts = mem::take(&mut self.extensions);
            for e in &mut exts {
                e.before_transpose(&mut self.tune);
            }
            transpose::pit_adj(&mut self.tune);
            for e in &mut exts {
                e.after_transpose(&mut self.tune);
            }
            self.extensions = exts;
        }

        let empty = self.tune.ts_first.is_none();
        if keep_voices {
            let mut next = Tune::new();
            next.systems = vec![self.tune.systems[self.par_sy].clone()];
            next.fmts = vec![self.cur_fmt.clone()];
            next.info = self.tune.info.clone();
            next.voices = self
                .tune
                .voices
                .iter()
                .map(|p| {
                    let mut p = p.clone();
                    p.time = 0;
                    p.sym = None;
                    p.last_sym = None;
                    p.last_note = None;
                    p.eoln = false;
                    p
                })
                .collect();
            let done = mem::replace(&mut self.tune, next);
            if !empty {
                self.tunes.push(done);
            }
            self.par_sy = 0;
            self.staves_found = 0;
        } else {
            let mut next = Tune::new();
            next.fmts = vec![self.cur_fmt.clone()];
            let done = mem::replace(&mut self.tune, next);
            if !empty {
                self.tunes.push(done);
            }
            self.par_sy = 0;
            self.staves_found = -1;
            self.curvoice = None;
            self.has_default = false;
            self.state = State::Header;
            self.base_key = KeyState::default();
            self.glovar_meter = Meter::default();
            self.star_params = None;
        }
        self.vover = None;
        self.clone_state = None;
        self.parts.clear();
        self.setbarnb = None;
        self.cur_span = None;
        self.fmt_dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::acc;
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

    fn bar() -> Event {
        Event::Bar { info: BarInfo::new("|"), invisible: false }
    }

    fn key(sf: i32) -> Event {
        Event::Key {
            key: KeyState { sf, ..KeyState::default() },
            has_sf: true,
        }
    }

    #[test]
    fn default_voice_and_time_cursor() {
        let mut b = TuneBuilder::default();
        b.event(key(0));
        b.event(note(16, Q));
        b.event(note(17, Q));
        let t = b.current_tune();
        assert_eq!(t.voices.len(), 1);
        assert_eq!(t.voices[0].id, "1");
        assert_eq!(t.voices[0].time, 2 * Q);
        let times: Vec<i32> = t.voice_iter(0).map(|(_, s)| s.time).collect();
        assert_eq!(times, vec![0, Q]);
    }

    #[test]
    fn grace_does_not_advance_time() {
        let mut b = TuneBuilder::default();
        b.event(key(0));
        b.event(Event::Note {
            notes: vec![NoteHead::new(20, acc::NONE)],
            dur: Q / 2,
            grace: true,
            beam_end: false,
            feathered: None,
        });
        b.event(note(16, Q));
        let t = b.current_tune();
        assert_eq!(t.voices[0].time, Q);
        let (_, g) = t.voice_iter(0).next().unwrap();
        assert_eq!(g.typ, SymType::Grace);
        assert_eq!(g.time, 0);
    }

    #[test]
    fn tuplet_scales_and_closes() {
        let mut b = TuneBuilder::default();
        b.event(key(0));
        b.event(Event::TupletStart { p: 3, q: 2, r: 3 });
        for _ in 0..3 {
            b.event(note(16, Q));
        }
        b.event(note(16, Q));
        let t = b.current_tune();
        let durs: Vec<i32> = t.voice_iter(0).map(|(_, s)| s.dur).collect();
        assert_eq!(durs, vec![Q * 2 / 3, Q * 2 / 3, Q * 2 / 3, Q]);
        assert_eq!(t.voices[0].dur_fact, (1, 1));
    }

    #[test]
    fn unterminated_tuplet_is_reported() {
        let mut b = TuneBuilder::default();
        b.event(key(0));
        b.event(Event::TupletStart { p: 3, q: 2, r: 3 });
        b.event(note(16, Q));
        b.finish();
        assert!(b
            .diagnostics()
            .iter()
            .any(|d| d.kind == DiagKind::UnterminatedTuplet));
    }

    #[test]
    fn parameter_only_key_is_not_linked() {
        let mut b = TuneBuilder::default();
        b.event(key(2));
        b.event(note(16, Q));
        b.event(Event::Key { key: KeyState::default(), has_sf: false });
        let t = b.current_tune();
        assert!(t.voice_iter(0).all(|(_, s)| s.typ != SymType::Key));
    }

    #[test]
    fn mid_tune_key_is_linked_with_old_sf() {
        let mut b = TuneBuilder::default();
        b.event(key(2));
        b.event(note(16, Q));
        b.event(key(-1));
        let t = b.current_tune();
        let k = t
            .voice_iter(0)
            .find(|(_, s)| s.typ == SymType::Key)
            .and_then(|(_, s)| s.key.clone())
            .unwrap();
        assert_eq!(k.sf, -1);
        assert_eq!(k.old_sf, 2);
    }

    #[test]
    fn clef_change_moves_before_the_bar() {
        let mut b = TuneBuilder::default();
        b.event(key(0));
        for _ in 0..4 {
            b.event(note(16, Q));
        }
        b.event(bar());
        b.event(Event::Clef(Clef { sign: "F".to_string(), line: 4, ..Clef::default() }));
        let t = b.current_tune();
        let types: Vec<SymType> = t.voice_iter(0).map(|(_, s)| s.typ).collect();
        assert_eq!(types[4], SymType::Clef);
        assert_eq!(types[5], SymType::Bar);
        let (_, clef) = t.voice_iter(0).nth(4).unwrap();
        assert_eq!(clef.clef.as_ref().map(|c| c.small), Some(true));
    }

    #[test]
    fn clef_stays_after_a_right_repeat() {
        let mut b = TuneBuilder::default();
        b.event(key(0));
        for _ in 0..4 {
            b.event(note(16, Q));
        }
        b.event(Event::Bar { info: BarInfo::new(":|"), invisible: false });
        b.event(Event::Clef(Clef { sign: "F".to_string(), line: 4, ..Clef::default() }));
        let t = b.current_tune();
        let types: Vec<SymType> = t.voice_iter(0).map(|(_, s)| s.typ).collect();
        assert_eq!(types[4], SymType::Bar);
        assert_eq!(types[5], SymType::Clef);
    }

    #[test]
    fn part_marker_attaches_once() {
        let mut b = TuneBuilder::default();
        b.event(key(0));
        b.event(Event::Part { name: "A".to_string() });
        b.event(note(16, Q));
        b.event(note(17, Q));
        let t = b.current_tune();
        let parts: Vec<Option<String>> = t.voice_iter(0).map(|(_, s)| s.part.clone()).collect();
        assert_eq!(parts, vec![Some("A".to_string()), None]);
    }

    #[test]
    fn multi_voice_declaration_clones_music() {
        let mut b = TuneBuilder::default();
        b.event(key(0));
        b.event(Event::Voice {
            ids: vec!["1".to_string(), "2".to_string()],
            params: VoiceParams::default(),
        });
        b.event(note(16, Q));
        b.event(note(18, Q));
        b.event(bar());
        b.event(Event::Voice { ids: vec!["1".to_string()], params: VoiceParams::default() });
        let t = b.current_tune();
        assert_eq!(t.voices.len(), 2);
        let v1: Vec<(SymType, i32)> = t.voice_iter(0).map(|(_, s)| (s.typ, s.time)).collect();
        let v2: Vec<(SymType, i32)> = t.voice_iter(1).map(|(_, s)| (s.typ, s.time)).collect();
        assert_eq!(v1, v2);
        assert_eq!(t.voices[1].time, 2 * Q);
    }

    #[test]
    fn wildcard_voice_in_body_is_rejected() {
        let mut b = TuneBuilder::default();
        b.event(key(0));
        b.event(Event::Voice { ids: vec!["*".to_string()], params: VoiceParams::default() });
        assert!(b
            .diagnostics()
            .iter()
            .any(|d| d.kind == DiagKind::WildcardVoiceInBody));
    }

    #[test]
    fn setbarnb_numbers_the_next_bar() {
        let mut b = TuneBuilder::default();
        b.event(key(0));
        for _ in 0..4 {
            b.event(note(16, Q));
        }
        b.event(Event::Directive { name: "setbarnb".to_string(), param: "9".to_string() });
        b.event(bar());
        let t = b.current_tune();
        let num = t
            .voice_iter(0)
            .find(|(_, s)| s.typ == SymType::Bar)
            .and_then(|(_, s)| s.bar.as_ref().and_then(|b| b.num));
        assert_eq!(num, Some(9));
    }

    #[test]
    fn finish_builds_the_sequence_and_numbers() {
        let mut b = TuneBuilder::default();
        b.event(key(0));
        for _ in 0..4 {
            b.event(note(16, Q));
        }
        b.event(bar());
        b.event(note(16, Q));
        b.finish();
        let tunes = b.into_tunes();
        assert_eq!(tunes.len(), 1);
        let t = &tunes[0];
        assert!(t.ts_first.is_some());
        let bar_num = t
            .seq_iter()
            .find(|(_, s)| s.typ == SymType::Bar)
            .and_then(|(_, s)| s.bar.as_ref().and_then(|b| b.num));
        assert_eq!(bar_num, Some(1));
    }

    #[test]
    fn empty_segment_is_discarded() {
        let mut b = TuneBuilder::default();
        b.event(key(0));
        b.finish();
        assert!(b.into_tunes().is_empty());
    }

    #[test]
    fn segment_end_keeps_voice_settings() {
        let mut b = TuneBuilder::default();
        b.event(key(2));
        b.event(note(16, Q));
        b.end_segment();
        b.event(note(17, Q));
        let t = b.current_tune();
        assert_eq!(t.voices[0].key.sf, 2);
        assert_eq!(t.voices[0].time, Q);
        let tunes = b.into_tunes();
        assert_eq!(tunes.len(), 2);
    }

    #[test]
    fn header_tempo_lands_at_the_start() {
        let mut b = TuneBuilder::default();
        b.event(Event::Tempo { qpm: 96 });
        b.event(key(0));
        b.event(note(16, Q));
        b.finish();
        let tunes = b.into_tunes();
        let t = &tunes[0];
        let second = t.seq_iter().nth(1).map(|(_, s)| s.typ);
        assert_eq!(second, Some(SymType::Tempo));
    }

    struct Marker {
        seen: std::rc::Rc<std::cell::RefCell<Vec<String>>>,
    }

    impl Extension for Marker {
        fn name(&self) -> &str {
            "marker"
        }

        fn directive(&mut self, name: &str, param: &str) -> bool {
            if name != "marker" {
                return false;
            }
            self.seen.borrow_mut().push(param.to_string());
            true
        }
    }

    #[test]
    fn unknown_directives_go_to_extensions() {
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut b = TuneBuilder::default();
        b.register_extension(Box::new(Marker { seen: seen.clone() }));
        b.event(Event::Directive { name: "marker".to_string(), param: "x".to_string() });
        b.event(Event::Directive { name: "other".to_string(), param: "y".to_string() });
        assert_eq!(*seen.borrow(), vec!["x".to_string()]);
    }
}
