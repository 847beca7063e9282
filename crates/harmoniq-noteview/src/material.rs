use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const TRANSPARENT: Color = Color::from_rgba(0, 0, 0, 0);

    pub const fn from_rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    pub const fn from_rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Channels as `0.0..=1.0` floats, alpha multiplied by `opacity`.
    pub fn to_normalized(self, opacity: f32) -> [f32; 4] {
        [
            f32::from(self.r) / 255.0,
            f32::from(self.g) / 255.0,
            f32::from(self.b) / 255.0,
            f32::from(self.a) / 255.0 * opacity.clamp(0.0, 1.0),
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub width: f32,
    pub color: Color,
}

impl Stroke {
    pub const fn new(width: f32, color: Color) -> Self {
        Self { width, color }
    }
}

/// Fill and border parameters shared by every item of a batch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Material {
    pub fill_color: Color,
    pub opacity: f32,
    pub border_color: Color,
    pub border_thickness: f32,
    pub has_border: bool,
}

/// Hashable identity of a [`Material`]; opacity is quantized to 1/1000.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MaterialKey {
    fill: Color,
    opacity: u16,
    border: Option<(Color, u32)>,
}

impl Material {
    pub fn fill(color: Color, opacity: f32) -> Self {
        Self {
            fill_color: color,
            opacity: opacity.clamp(0.0, 1.0),
            border_color: Color::TRANSPARENT,
            border_thickness: 0.0,
            has_border: false,
        }
    }

    pub fn bordered(color: Color, opacity: f32, border: Stroke) -> Self {
        Self {
            border_color: border.color,
            border_thickness: border.width,
            has_border: true,
            ..Self::fill(color, opacity)
        }
    }

    pub fn key(&self) -> MaterialKey {
        MaterialKey {
            fill: self.fill_color,
            opacity: (self.opacity.clamp(0.0, 1.0) * 1000.0).round() as u16,
            border: self
                .has_border
                .then(|| (self.border_color, self.border_thickness.to_bits())),
        }
    }
}

/// Standard piano colour scheme, one colour per pitch class starting at C.
pub const PIANO_PITCH_COLORS: [Color; 12] = [
    Color::from_rgb(255, 51, 51),
    Color::from_rgb(255, 153, 51),
    Color::from_rgb(255, 255, 51),
    Color::from_rgb(51, 255, 102),
    Color::from_rgb(51, 255, 255),
    Color::from_rgb(51, 102, 255),
    Color::from_rgb(153, 51, 255),
    Color::from_rgb(255, 51, 153),
    Color::from_rgb(179, 179, 179),
    Color::from_rgb(255, 204, 51),
    Color::from_rgb(204, 128, 51),
    Color::from_rgb(51, 204, 204),
];

/// Visual tokens for note rendering, resolved once when the theme loads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoteTheme {
    pub note_fill: Color,
    pub note_border: Stroke,
    pub note_selected_fill: Color,
    pub note_selected_border: Stroke,
    /// Lowest opacity a quiet note is drawn with.
    pub min_velocity_opacity: f32,
    /// Opacity multiplier while a note is dragged or resized.
    pub manipulated_boost: f32,
    pub medium_opacity: f32,
    pub medium_border: Stroke,
    pub low_fill: Color,
    pub low_opacity: f32,
    pub density_fill: Color,
    pub velocity_bar: Color,
    pub velocity_bar_selected: Color,
    pub min_velocity_bar_opacity: f32,
    /// Per pitch-class fills replacing `note_fill` for unselected notes.
    pub pitch_colors: Option<[Color; 12]>,
}

impl Default for NoteTheme {
    fn default() -> Self {
        Self::standard()
    }
}

impl NoteTheme {
    pub fn standard() -> Self {
        Self {
            note_fill: Color::from_rgb(0x4C, 0xAF, 0x50),
            note_border: Stroke::new(2.0, Color::from_rgb(0x2E, 0x7D, 0x32)),
            note_selected_fill: Color::from_rgb(0xFF, 0x98, 0x00),
            note_selected_border: Stroke::new(2.0, Color::from_rgb(0xF5, 0x7C, 0x00)),
            min_velocity_opacity: 0.7,
            manipulated_boost: 1.1,
            medium_opacity: 0.8,
            medium_border: Stroke::new(1.0, Color::from_rgb(0x2E, 0x7D, 0x32)),
            low_fill: Color::from_rgb(0x4C, 0xAF, 0x50),
            low_opacity: 0.7,
            density_fill: Color::from_rgb(0x4C, 0xAF, 0x50),
            velocity_bar: Color::from_rgb(0x4C, 0xAF, 0x50),
            velocity_bar_selected: Color::from_rgb(0xFF, 0x98, 0x00),
            min_velocity_bar_opacity: 0.4,
            pitch_colors: None,
        }
    }

    pub fn with_pitch_colors(mut self) -> Self {
        self.pitch_colors = Some(PIANO_PITCH_COLORS);
        self
    }

    pub fn fill_for_pitch(&self, pitch: u8) -> Color {
        match &self.pitch_colors {
            Some(colors) => colors[usize::from(pitch % 12)],
            None => self.note_fill,
        }
    }
}
