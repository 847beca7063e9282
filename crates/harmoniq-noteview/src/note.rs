use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::LayoutConfig;
use crate::geom::Rect;

pub type NoteId = u64;

/// Number of key rows the piano roll spans.
pub const KEY_ROWS: u8 = 128;

/// Render-facing view of one note. Times and widths are in beats, heights in key rows.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoteDrawRecord {
    pub id: NoteId,
    pub time: f64,
    pub width: f64,
    pub height: f32,
    pub corner_radius: f32,
    pub pitch: u8,
    pub velocity: u8,
    pub channel: u8,
}

impl NoteDrawRecord {
    pub fn new(id: NoteId, time: f64, width: f64, pitch: u8, velocity: u8) -> Self {
        Self {
            id,
            time,
            width,
            height: 1.0,
            corner_radius: 2.0,
            pitch: pitch.min(KEY_ROWS - 1),
            velocity: velocity.min(127),
            channel: 0,
        }
    }

    /// `(time, pitch)` position of the note in musical space.
    pub fn position(&self) -> (f64, f32) {
        (self.time, self.pitch as f32)
    }

    pub fn end_time(&self) -> f64 {
        self.time + self.width
    }
}

/// Visible region and scale of the piano roll surface.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewportState {
    pub bounds_width: f64,
    pub bounds_height: f64,
    pub scroll_x: f64,
    pub scroll_y: f64,
    pub zoom: f64,
    pub vertical_zoom: f64,
}

impl Default for ViewportState {
    fn default() -> Self {
        Self {
            bounds_width: 1280.0,
            bounds_height: 720.0,
            scroll_x: 0.0,
            scroll_y: 0.0,
            zoom: 1.0,
            vertical_zoom: 1.0,
        }
    }
}

impl ViewportState {
    pub fn new(bounds_width: f64, bounds_height: f64) -> Self {
        Self {
            bounds_width,
            bounds_height,
            ..Self::default()
        }
    }

    pub fn with_scroll(mut self, scroll_x: f64, scroll_y: f64) -> Self {
        self.scroll_x = scroll_x;
        self.scroll_y = scroll_y;
        self
    }

    pub fn with_zoom(mut self, zoom: f64, vertical_zoom: f64) -> Self {
        self.zoom = zoom;
        self.vertical_zoom = vertical_zoom;
        self
    }

    /// The surface itself, origin at the top-left of the visible area.
    pub fn screen_rect(&self) -> Rect {
        Rect::new(0.0, 0.0, self.bounds_width, self.bounds_height)
    }

    /// The visible area expressed in unscrolled pixel space.
    pub fn world_rect(&self) -> Rect {
        Rect::new(
            self.scroll_x,
            self.scroll_y,
            self.bounds_width,
            self.bounds_height,
        )
    }

    /// Largest per-axis scroll distance between two viewports of the same size.
    pub fn scroll_distance(&self, other: &ViewportState) -> f64 {
        (self.scroll_x - other.scroll_x)
            .abs()
            .max((self.scroll_y - other.scroll_y).abs())
    }

    pub fn same_extent(&self, other: &ViewportState) -> bool {
        self.bounds_width == other.bounds_width
            && self.bounds_height == other.bounds_height
            && self.zoom == other.zoom
            && self.vertical_zoom == other.vertical_zoom
    }
}

/// Interaction state that influences note styling.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectionState {
    pub selected: HashSet<NoteId>,
    pub dragging: HashSet<NoteId>,
    pub resizing: HashSet<NoteId>,
}

impl SelectionState {
    pub fn is_selected(&self, id: NoteId) -> bool {
        self.selected.contains(&id)
    }

    pub fn is_manipulated(&self, id: NoteId) -> bool {
        self.dragging.contains(&id) || self.resizing.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty() && self.dragging.is_empty() && self.resizing.is_empty()
    }
}

/// Maps musical coordinates to unscrolled pixels for one zoom level.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Projection {
    pub pixels_per_beat: f64,
    pub key_height: f64,
    pub min_note_width: f64,
}

impl Projection {
    pub fn new(layout: &LayoutConfig, viewport: &ViewportState) -> Self {
        Self {
            pixels_per_beat: layout.pixels_per_beat * viewport.zoom,
            key_height: layout.key_height * viewport.vertical_zoom,
            min_note_width: layout.min_note_width,
        }
    }

    pub fn time_to_x(&self, time: f64) -> f64 {
        time * self.pixels_per_beat
    }

    pub fn x_to_time(&self, x: f64) -> f64 {
        if self.pixels_per_beat > 0.0 {
            x / self.pixels_per_beat
        } else {
            0.0
        }
    }

    pub fn pitch_to_y(&self, pitch: u8) -> f64 {
        f64::from(127u8.saturating_sub(pitch)) * self.key_height
    }

    /// Height of the full key range in pixels.
    pub fn content_height(&self) -> f64 {
        f64::from(KEY_ROWS) * self.key_height
    }

    /// World-space rect of a note. Positive widths are widened to `min_note_width`.
    pub fn world_rect(&self, note: &NoteDrawRecord) -> Rect {
        let mut width = note.width * self.pixels_per_beat;
        if width > 0.0 {
            width = width.max(self.min_note_width);
        }
        Rect::new(
            self.time_to_x(note.time),
            self.pitch_to_y(note.pitch),
            width,
            f64::from(note.height) * self.key_height,
        )
    }

    pub fn screen_rect(&self, note: &NoteDrawRecord, viewport: &ViewportState) -> Rect {
        self.world_rect(note)
            .translate(-viewport.scroll_x, -viewport.scroll_y)
    }
}

/// Incremental change notification emitted by a [`NoteSource`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NoteChange {
    Added(Vec<NoteId>),
    Removed(Vec<NoteId>),
    Updated(Vec<NoteId>),
    Reset,
}

/// Read access to the caller-owned note collection.
pub trait NoteSource {
    fn notes(&self) -> &[NoteDrawRecord];

    fn get(&self, id: NoteId) -> Option<&NoteDrawRecord>;

    /// Bumped on every mutation.
    fn generation(&self) -> u64;

    /// Takes the changes accumulated since the previous call.
    fn drain_changes(&mut self) -> Vec<NoteChange>;

    fn len(&self) -> usize {
        self.notes().len()
    }

    fn is_empty(&self) -> bool {
        self.notes().is_empty()
    }
}

/// In-memory [`NoteSource`] with O(1) lookup and removal.
#[derive(Clone, Debug, Default)]
pub struct VecNoteSource {
    notes: Vec<NoteDrawRecord>,
    positions: HashMap<NoteId, usize>,
    generation: u64,
    pending: Vec<NoteChange>,
}

impl VecNoteSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_notes(notes: impl IntoIterator<Item = NoteDrawRecord>) -> Self {
        let mut source = Self::new();
        source.load(notes);
        source.pending.clear();
        source
    }

    fn load(&mut self, notes: impl IntoIterator<Item = NoteDrawRecord>) {
        self.notes.clear();
        self.positions.clear();
        for note in notes {
            match self.positions.get(&note.id) {
                Some(&index) => self.notes[index] = note,
                None => {
                    self.positions.insert(note.id, self.notes.len());
                    self.notes.push(note);
                }
            }
        }
    }

    fn record(&mut self, change: NoteChange) {
        self.generation = self.generation.wrapping_add(1);
        let merged = match (self.pending.last_mut(), &change) {
            (Some(NoteChange::Added(ids)), NoteChange::Added(new)) => {
                ids.extend_from_slice(new);
                true
            }
            (Some(NoteChange::Removed(ids)), NoteChange::Removed(new)) => {
                ids.extend_from_slice(new);
                true
            }
            (Some(NoteChange::Updated(ids)), NoteChange::Updated(new)) => {
                ids.extend_from_slice(new);
                true
            }
            _ => false,
        };
        if !merged {
            self.pending.push(change);
        }
    }

    /// Inserts a note, replacing any existing note with the same id.
    pub fn insert(&mut self, note: NoteDrawRecord) {
        if let Some(&index) = self.positions.get(&note.id) {
            self.notes[index] = note;
            self.record(NoteChange::Updated(vec![note.id]));
            return;
        }
        self.positions.insert(note.id, self.notes.len());
        self.notes.push(note);
        self.record(NoteChange::Added(vec![note.id]));
    }

    pub fn update(&mut self, note: NoteDrawRecord) -> bool {
        let Some(&index) = self.positions.get(&note.id) else {
            return false;
        };
        self.notes[index] = note;
        self.record(NoteChange::Updated(vec![note.id]));
        true
    }

    pub fn remove(&mut self, id: NoteId) -> Option<NoteDrawRecord> {
        let index = self.positions.remove(&id)?;
        let removed = self.notes.swap_remove(index);
        if let Some(moved) = self.notes.get(index) {
            self.positions.insert(moved.id, index);
        }
        self.record(NoteChange::Removed(vec![id]));
        Some(removed)
    }

    /// Replaces the whole collection and queues a single `Reset`.
    pub fn replace_all(&mut self, notes: impl IntoIterator<Item = NoteDrawRecord>) {
        self.load(notes);
        self.generation = self.generation.wrapping_add(1);
        self.pending.clear();
        self.pending.push(NoteChange::Reset);
    }
}

impl NoteSource for VecNoteSource {
    fn notes(&self) -> &[NoteDrawRecord] {
        &self.notes
    }

    fn get(&self, id: NoteId) -> Option<&NoteDrawRecord> {
        self.positions.get(&id).map(|&index| &self.notes[index])
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn drain_changes(&mut self) -> Vec<NoteChange> {
        std::mem::take(&mut self.pending)
    }
}
