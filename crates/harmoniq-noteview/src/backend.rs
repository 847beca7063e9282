//! Draw contract between the render core and a presentation surface.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::beat::BeatTexture;
use crate::error::BackendError;
use crate::geom::Rect;
use crate::geometry::Geometry;
use crate::material::Material;

/// Per-instance vertex data, laid out for direct upload.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct InstanceData {
    pub offset: [f32; 2],
    pub size: [f32; 2],
    pub color: [f32; 4],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Pipeline {
    Notes,
    BeatTextures,
}

/// Consecutive instances drawn with the same mesh.
#[derive(Clone, Debug)]
pub struct MeshRun {
    pub geometry: Arc<Geometry>,
    pub first_instance: u32,
    pub instance_count: u32,
}

/// One material's worth of instanced draws.
#[derive(Clone, Copy, Debug)]
pub struct DrawSubmission<'a> {
    pub material: &'a Material,
    /// Position of `instances[0]` in the frame's shared instance buffer.
    pub instance_offset: u32,
    pub instances: &'a [InstanceData],
    pub geometry: &'a [MeshRun],
}

/// A cached beat texture placed on screen.
#[derive(Clone, Copy, Debug)]
pub struct BeatDraw<'a> {
    pub texture: &'a BeatTexture,
    pub rect: Rect,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GpuMemory {
    pub used: u64,
    pub allocated: u64,
}

/// Presentation surface. Owned and driven by the render thread only.
pub trait RenderBackend {
    fn begin_frame(&mut self, frame: u64) -> Result<(), BackendError>;

    fn bind_pipeline(&mut self, pipeline: Pipeline) -> Result<(), BackendError>;

    fn draw(&mut self, submission: &DrawSubmission<'_>) -> Result<(), BackendError>;

    fn draw_texture(&mut self, draw: &BeatDraw<'_>) -> Result<(), BackendError>;

    fn end_frame(&mut self) -> Result<(), BackendError>;

    fn memory_usage(&self) -> GpuMemory;
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedDraw {
    pub frame: u64,
    pub material: Material,
    pub instance_offset: u32,
    pub instance_count: u32,
    pub mesh_runs: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedTexture {
    pub frame: u64,
    pub beat: i64,
    pub rect: Rect,
}

/// Backend that records calls instead of drawing. Used for tests and tooling.
#[derive(Debug, Default)]
pub struct HeadlessBackend {
    frame: Option<u64>,
    bound: Option<Pipeline>,
    pub frames_begun: u64,
    pub frames_completed: u64,
    pub pipeline_binds: Vec<Pipeline>,
    pub draws: Vec<RecordedDraw>,
    pub textures: Vec<RecordedTexture>,
    pub instances: Vec<InstanceData>,
    memory_budget: Option<u64>,
    instance_capacity: u64,
    failures: Vec<BackendError>,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects instance uploads growing past `bytes`.
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// Queues an error returned by the next `begin_frame` calls, one per frame.
    pub fn fail_next(&mut self, error: BackendError) {
        self.failures.push(error);
    }

    pub fn clear_records(&mut self) {
        self.pipeline_binds.clear();
        self.draws.clear();
        self.textures.clear();
        self.instances.clear();
    }

    fn current_frame(&self) -> Result<u64, BackendError> {
        self.frame
            .ok_or_else(|| BackendError::submission("no frame in progress"))
    }
}

impl RenderBackend for HeadlessBackend {
    fn begin_frame(&mut self, frame: u64) -> Result<(), BackendError> {
        if !self.failures.is_empty() {
            return Err(self.failures.remove(0));
        }
        self.frame = Some(frame);
        self.bound = None;
        self.frames_begun += 1;
        self.instances.clear();
        Ok(())
    }

    fn bind_pipeline(&mut self, pipeline: Pipeline) -> Result<(), BackendError> {
        self.current_frame()?;
        self.bound = Some(pipeline);
        self.pipeline_binds.push(pipeline);
        Ok(())
    }

    fn draw(&mut self, submission: &DrawSubmission<'_>) -> Result<(), BackendError> {
        let frame = self.current_frame()?;
        if self.bound != Some(Pipeline::Notes) {
            return Err(BackendError::submission("note pipeline not bound"));
        }
        if submission.instance_offset as usize != self.instances.len() {
            return Err(BackendError::submission("instance offset out of sequence"));
        }
        let needed = ((self.instances.len() + submission.instances.len())
            * std::mem::size_of::<InstanceData>()) as u64;
        if let Some(budget) = self.memory_budget {
            if needed > budget {
                return Err(BackendError::OutOfMemory {
                    requested: needed,
                    available: budget,
                });
            }
        }
        self.instance_capacity = self.instance_capacity.max(needed);
        self.instances.extend_from_slice(submission.instances);
        self.draws.push(RecordedDraw {
            frame,
            material: *submission.material,
            instance_offset: submission.instance_offset,
            instance_count: submission.instances.len() as u32,
            mesh_runs: submission.geometry.len(),
        });
        Ok(())
    }

    fn draw_texture(&mut self, draw: &BeatDraw<'_>) -> Result<(), BackendError> {
        let frame = self.current_frame()?;
        if self.bound != Some(Pipeline::BeatTextures) {
            return Err(BackendError::submission("texture pipeline not bound"));
        }
        self.textures.push(RecordedTexture {
            frame,
            beat: draw.texture.beat(),
            rect: draw.rect,
        });
        Ok(())
    }

    fn end_frame(&mut self) -> Result<(), BackendError> {
        self.current_frame()?;
        self.frame = None;
        self.bound = None;
        self.frames_completed += 1;
        Ok(())
    }

    fn memory_usage(&self) -> GpuMemory {
        GpuMemory {
            used: (self.instances.len() * std::mem::size_of::<InstanceData>()) as u64,
            allocated: self.instance_capacity,
        }
    }
}
