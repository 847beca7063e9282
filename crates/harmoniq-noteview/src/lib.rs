//! Harmoniq Note View
//! ==================
//! Virtualized note rendering for the Harmoniq piano roll. The crate turns a
//! caller-owned note collection and a viewport into instanced draw
//! submissions: notes are culled through a world-space bucket index, grouped
//! into material batches at a level of detail picked from the visible count
//! and zoom, and handed to a [`RenderBackend`]. Far zoomed-out views can be
//! served from per-beat textures instead of individual notes.

pub mod backend;
pub mod batch;
pub mod beat;
pub mod config;
pub mod context;
pub mod culler;
pub mod error;
pub mod geom;
pub mod geometry;
pub mod lod;
pub mod material;
pub mod monitor;
pub mod note;
pub mod prepare;
pub mod profiling;
pub mod spatial;
pub mod submit;
pub mod tasks;
pub mod velocity;

pub use backend::{
    DrawSubmission, GpuMemory, HeadlessBackend, InstanceData, Pipeline, RenderBackend,
};
pub use batch::{BatchBuilder, BatchItem, RenderBatch};
pub use beat::{BeatTexel, BeatTexture, BeatTextureCache};
pub use config::RenderConfig;
pub use context::{FrameOutcome, FrameSummary, InvalidateReason, RenderContext};
pub use culler::{CullStats, ViewportCuller, VisibleNote};
pub use error::{BackendError, ConfigError, ConfigIoError, PrepareError};
pub use geom::{Point, Rect};
pub use geometry::{Geometry, GeometryCache, GeometryKey};
pub use lod::{select_strategy, DensityMap, LodSelector, LodStrategy};
pub use material::{Color, Material, NoteTheme, Stroke};
pub use monitor::{
    FrameMetrics, OptimizationSuggestion, PerformanceMonitor, PerformanceReport, Severity,
};
pub use note::{
    NoteChange, NoteDrawRecord, NoteId, NoteSource, Projection, SelectionState, VecNoteSource,
    ViewportState,
};
pub use prepare::{PrepareEvent, Preparer, VisibleSnapshot};
pub use spatial::SpatialIndex;
pub use submit::{BatchSubmitter, SubmitStats};
pub use tasks::{CancellationToken, ComputeThrottle, SnapshotSlot, TaskRegistry, Versioned};
