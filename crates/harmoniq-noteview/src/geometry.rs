//! Rounded-rectangle meshes shared by every note of the same size.

use std::collections::HashMap;
use std::f64::consts::{FRAC_PI_2, PI};
use std::mem::size_of;
use std::sync::Arc;

/// Size key of a cached mesh, quantized to 1/100 px so equal sizes hash equally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GeometryKey {
    width: i64,
    height: i64,
    corner_radius: i64,
}

const KEY_SCALE: f64 = 100.0;

fn quantize(value: f64) -> i64 {
    (value * KEY_SCALE).round() as i64
}

impl GeometryKey {
    pub fn new(width: f64, height: f64, corner_radius: f64) -> Self {
        Self {
            width: quantize(width),
            height: quantize(height),
            corner_radius: quantize(corner_radius.max(0.0)),
        }
    }

    pub fn width(&self) -> f64 {
        self.width as f64 / KEY_SCALE
    }

    pub fn height(&self) -> f64 {
        self.height as f64 / KEY_SCALE
    }

    pub fn corner_radius(&self) -> f64 {
        self.corner_radius as f64 / KEY_SCALE
    }
}

/// Triangle-fan mesh at the origin. Positions are in pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct Geometry {
    pub key: GeometryKey,
    pub vertices: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
}

impl Geometry {
    /// Tessellates a rounded rectangle with `segments` arc steps per corner.
    ///
    /// Perimeter vertices run clockwise in screen space starting at the top-left
    /// arc; the last vertex is the centre.
    pub fn rounded_rect(key: GeometryKey, segments: u32) -> Self {
        let segments = segments.max(1);
        let width = key.width();
        let height = key.height();
        let radius = key.corner_radius().min(width / 2.0).min(height / 2.0).max(0.0);

        let corners = [
            (radius, radius, PI),
            (width - radius, radius, PI + FRAC_PI_2),
            (width - radius, height - radius, 0.0),
            (radius, height - radius, FRAC_PI_2),
        ];
        let perimeter = 4 * (segments as usize + 1);
        let mut vertices = Vec::with_capacity(perimeter + 1);
        for (cx, cy, start) in corners {
            for step in 0..=segments {
                let angle = start + f64::from(step) * FRAC_PI_2 / f64::from(segments);
                vertices.push([
                    (cx + radius * angle.cos()) as f32,
                    (cy + radius * angle.sin()) as f32,
                ]);
            }
        }
        let centre = vertices.len() as u32;
        vertices.push([(width / 2.0) as f32, (height / 2.0) as f32]);

        let last = centre - 1;
        let mut indices = Vec::with_capacity(perimeter * 3);
        for i in 0..last {
            indices.extend_from_slice(&[i, i + 1, centre]);
        }
        indices.extend_from_slice(&[last, 0, centre]);

        Self {
            key,
            vertices,
            indices,
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn memory_bytes(&self) -> usize {
        self.vertices.len() * size_of::<[f32; 2]>() + self.indices.len() * size_of::<u32>()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GeometryCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub memory_bytes: usize,
}

impl GeometryCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Size-keyed mesh cache. Must be cleared when the pixel scale changes.
#[derive(Debug)]
pub struct GeometryCache {
    meshes: HashMap<GeometryKey, Arc<Geometry>>,
    segments: u32,
    hits: u64,
    misses: u64,
    memory_bytes: usize,
}

impl GeometryCache {
    pub fn new(segments: u32) -> Self {
        Self {
            meshes: HashMap::new(),
            segments: segments.max(1),
            hits: 0,
            misses: 0,
            memory_bytes: 0,
        }
    }

    pub fn get_or_create(&mut self, width: f64, height: f64, corner_radius: f64) -> Arc<Geometry> {
        self.get_or_create_key(GeometryKey::new(width, height, corner_radius))
    }

    pub fn get_or_create_key(&mut self, key: GeometryKey) -> Arc<Geometry> {
        if let Some(mesh) = self.meshes.get(&key) {
            self.hits += 1;
            return Arc::clone(mesh);
        }
        self.misses += 1;
        let mesh = Arc::new(Geometry::rounded_rect(key, self.segments));
        self.memory_bytes += mesh.memory_bytes();
        self.meshes.insert(key, Arc::clone(&mesh));
        mesh
    }

    /// Tessellates keys computed off-thread so the next frame only hits.
    pub fn warm(&mut self, keys: impl IntoIterator<Item = GeometryKey>) -> usize {
        let mut created = 0;
        for key in keys {
            if !self.meshes.contains_key(&key) {
                let mesh = Arc::new(Geometry::rounded_rect(key, self.segments));
                self.memory_bytes += mesh.memory_bytes();
                self.meshes.insert(key, mesh);
                created += 1;
            }
        }
        created
    }

    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }

    pub fn clear(&mut self) {
        if !self.meshes.is_empty() {
            tracing::debug!(entries = self.meshes.len(), "geometry cache cleared");
        }
        self.meshes.clear();
        self.memory_bytes = 0;
    }

    pub fn memory_bytes(&self) -> usize {
        self.memory_bytes
    }

    pub fn stats(&self) -> GeometryCacheStats {
        GeometryCacheStats {
            entries: self.meshes.len(),
            hits: self.hits,
            misses: self.misses,
            memory_bytes: self.memory_bytes,
        }
    }
}
