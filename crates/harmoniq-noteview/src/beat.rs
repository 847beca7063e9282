//! Fixed-resolution per-beat note textures for extreme zoom-out.
//!
//! Each texel is four 16-bit channels:
//! R colour id (`pitch % 12 + 1`, 0 when empty), G start and B end offset
//! inside the texel column in 1/65535 of its width, A velocity scaled to 65535.
//! Row `r` covers pitch `127 - r * 128 / rows`.

use std::collections::HashMap;
use std::ops::RangeInclusive;

use bytemuck::{Pod, Zeroable};

use crate::config::BeatCacheConfig;
use crate::note::{NoteDrawRecord, KEY_ROWS};

const CHANNEL_MAX: f32 = 65535.0;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct BeatTexel {
    pub channels: [u16; 4],
}

/// Decoded contents of a non-empty texel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TexelSample {
    /// Pitch class plus one.
    pub color_id: u8,
    /// Start inside the texel column, `0.0..=1.0`.
    pub start: f32,
    /// End inside the texel column, `1.0` when the note continues past it.
    pub end: f32,
    pub velocity: u8,
}

impl BeatTexel {
    pub const EMPTY: BeatTexel = BeatTexel { channels: [0; 4] };

    pub fn encode(pitch: u8, start: f32, end: f32, velocity: u8) -> Self {
        let offset = |value: f32| (value.clamp(0.0, 1.0) * CHANNEL_MAX).round() as u16;
        let velocity = u32::from(velocity.min(127));
        Self {
            channels: [
                u16::from(pitch % 12) + 1,
                offset(start),
                offset(end),
                ((velocity * 65535 + 63) / 127) as u16,
            ],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channels[0] == 0
    }

    pub fn decode(&self) -> Option<TexelSample> {
        if self.is_empty() {
            return None;
        }
        let [color, start, end, velocity] = self.channels;
        Some(TexelSample {
            color_id: color.min(12) as u8,
            start: f32::from(start) / CHANNEL_MAX,
            end: f32::from(end) / CHANNEL_MAX,
            velocity: ((u32::from(velocity) * 127 + 32767) / 65535) as u8,
        })
    }
}

#[derive(Clone, Debug)]
pub struct BeatTexture {
    beat: i64,
    width: u32,
    height: u32,
    texels: Vec<BeatTexel>,
    is_dirty: bool,
    last_used: u64,
    note_count: usize,
}

impl BeatTexture {
    fn new(beat: i64, width: u32, height: u32) -> Self {
        Self {
            beat,
            width,
            height,
            texels: vec![BeatTexel::EMPTY; width as usize * height as usize],
            is_dirty: true,
            last_used: 0,
            note_count: 0,
        }
    }

    pub fn beat(&self) -> i64 {
        self.beat
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    /// Logical use stamp; larger is more recent.
    pub fn last_used(&self) -> u64 {
        self.last_used
    }

    pub fn note_count(&self) -> usize {
        self.note_count
    }

    pub fn texel(&self, column: u32, row: u32) -> BeatTexel {
        if column >= self.width || row >= self.height {
            return BeatTexel::EMPTY;
        }
        self.texels[(row * self.width + column) as usize]
    }

    pub fn texels(&self) -> &[BeatTexel] {
        &self.texels
    }

    /// Texel payload ready for upload as an RGBA16 texture.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.texels)
    }

    pub fn memory_bytes(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn row_for_pitch(&self, pitch: u8) -> u32 {
        let from_top = u32::from(127u8.saturating_sub(pitch.min(KEY_ROWS - 1)));
        from_top * self.height / u32::from(KEY_ROWS)
    }

    fn rasterize<'a>(&mut self, notes: impl IntoIterator<Item = &'a NoteDrawRecord>) {
        self.texels.fill(BeatTexel::EMPTY);
        self.note_count = 0;
        let width = f64::from(self.width);
        let rows_per_key = f64::from(self.height) / f64::from(KEY_ROWS);
        let origin = self.beat as f64;

        for note in notes {
            let start = (note.time - origin).clamp(0.0, 1.0);
            let end = (note.end_time() - origin).clamp(0.0, 1.0);
            if !(end > start) {
                continue;
            }
            self.note_count += 1;

            let x0 = start * width;
            let x1 = end * width;
            let first_column = x0.floor() as u32;
            let end_column = (x1.ceil() as u32).min(self.width);
            let first_row = self.row_for_pitch(note.pitch);
            let span = (f64::from(note.height) * rows_per_key).round().max(1.0) as u32;
            let end_row = (first_row + span).min(self.height);

            for column in first_column..end_column {
                let left = (x0 - f64::from(column)).clamp(0.0, 1.0) as f32;
                let right = (x1 - f64::from(column)).clamp(0.0, 1.0) as f32;
                let texel = BeatTexel::encode(note.pitch, left, right, note.velocity);
                for row in first_row..end_row {
                    self.texels[(row * self.width + column) as usize] = texel;
                }
            }
        }
        self.is_dirty = false;
    }
}

/// LRU cache of [`BeatTexture`]s keyed by beat index.
#[derive(Debug)]
pub struct BeatTextureCache {
    textures: HashMap<i64, BeatTexture>,
    width: u32,
    height: u32,
    max_entries: usize,
    clock: u64,
    evicted: u64,
}

impl BeatTextureCache {
    pub fn new(config: &BeatCacheConfig) -> Self {
        Self {
            textures: HashMap::new(),
            width: config.texture_width.max(1),
            height: config.texture_height.max(1),
            max_entries: config.max_entries.max(1),
            clock: 0,
            evicted: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Renders `notes_in_beat` into the texture for `beat`, creating it if needed.
    pub fn update_beat_texture<'a>(
        &mut self,
        beat: i64,
        notes_in_beat: impl IntoIterator<Item = &'a NoteDrawRecord>,
    ) {
        let stamp = self.tick();
        let (width, height) = (self.width, self.height);
        let texture = self
            .textures
            .entry(beat)
            .or_insert_with(|| BeatTexture::new(beat, width, height));
        texture.rasterize(notes_in_beat);
        texture.last_used = stamp;
        self.cleanup();
    }

    pub fn mark_dirty(&mut self, beat: i64) -> bool {
        match self.textures.get_mut(&beat) {
            Some(texture) => {
                texture.is_dirty = true;
                true
            }
            None => false,
        }
    }

    /// Marks every cached beat overlapping `start..end` (in beats) dirty.
    pub fn mark_time_range_dirty(&mut self, start: f64, end: f64) {
        if !(start.is_finite() && end.is_finite()) {
            return;
        }
        let first = start.floor() as i64;
        let last = if end > start {
            (end.ceil() as i64 - 1).max(first)
        } else {
            first
        };
        if last - first > self.textures.len() as i64 {
            for texture in self.textures.values_mut() {
                if texture.beat >= first && texture.beat <= last {
                    texture.is_dirty = true;
                }
            }
            return;
        }
        for beat in first..=last {
            self.mark_dirty(beat);
        }
    }

    /// Looks up a texture and refreshes its use stamp.
    pub fn get(&mut self, beat: i64) -> Option<&BeatTexture> {
        let stamp = self.tick();
        let texture = self.textures.get_mut(&beat)?;
        texture.last_used = stamp;
        Some(texture)
    }

    /// Looks up a texture without touching LRU order.
    pub fn peek(&self, beat: i64) -> Option<&BeatTexture> {
        self.textures.get(&beat)
    }

    pub fn needs_update(&self, beat: i64) -> bool {
        self.textures.get(&beat).map_or(true, BeatTexture::is_dirty)
    }

    /// Renders every beat in `beats` from notes overlapping it.
    pub fn prerender_beats(
        &mut self,
        beats: RangeInclusive<i64>,
        notes: &[NoteDrawRecord],
    ) -> usize {
        let (first, last) = (*beats.start(), *beats.end());
        if first > last {
            return 0;
        }
        let mut per_beat: HashMap<i64, Vec<&NoteDrawRecord>> = HashMap::new();
        for note in notes {
            if !(note.width > 0.0) {
                continue;
            }
            let from = (note.time.floor() as i64).max(first);
            let to = ((note.end_time().ceil() as i64) - 1).min(last);
            for beat in from..=to {
                per_beat.entry(beat).or_default().push(note);
            }
        }
        let mut rendered = 0;
        for beat in first..=last {
            let slice = per_beat.remove(&beat).unwrap_or_default();
            self.update_beat_texture(beat, slice);
            rendered += 1;
        }
        tracing::debug!(first, last, rendered, "pre-rendered beat textures");
        rendered
    }

    /// Drops the least recently used half once the cache is over capacity.
    pub fn cleanup(&mut self) -> usize {
        if self.textures.len() <= self.max_entries {
            return 0;
        }
        let mut by_age: Vec<(u64, i64)> = self
            .textures
            .values()
            .map(|texture| (texture.last_used, texture.beat))
            .collect();
        by_age.sort_unstable();
        let remove = self.textures.len() / 2;
        for (_, beat) in by_age.into_iter().take(remove) {
            self.textures.remove(&beat);
        }
        self.evicted += remove as u64;
        tracing::debug!(
            removed = remove,
            remaining = self.textures.len(),
            "beat texture cache trimmed"
        );
        remove
    }

    pub fn dirty_beats(&self) -> Vec<i64> {
        let mut beats: Vec<i64> = self
            .textures
            .values()
            .filter(|texture| texture.is_dirty)
            .map(BeatTexture::beat)
            .collect();
        beats.sort_unstable();
        beats
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn clear(&mut self) {
        self.textures.clear();
    }

    pub fn memory_bytes(&self) -> usize {
        self.textures.values().map(BeatTexture::memory_bytes).sum()
    }
}
