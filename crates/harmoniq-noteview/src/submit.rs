//! Double-buffered submission of batches to a [`RenderBackend`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{BeatDraw, DrawSubmission, InstanceData, MeshRun, Pipeline, RenderBackend};
use crate::batch::RenderBatch;
use crate::error::BackendError;
use crate::geometry::GeometryKey;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubmitStats {
    pub frame: u64,
    pub batches: usize,
    pub draw_calls: usize,
    pub instances: usize,
    pub texture_draws: usize,
    pub pipeline_binds: usize,
}

/// The frame being built and the frame last handed to the backend.
#[derive(Debug, Default)]
pub struct FrameBuffers {
    building: Vec<RenderBatch>,
    submitted: Vec<RenderBatch>,
    submitted_frame: Option<u64>,
}

impl FrameBuffers {
    pub fn building(&self) -> &[RenderBatch] {
        &self.building
    }

    pub fn submitted(&self) -> &[RenderBatch] {
        &self.submitted
    }

    pub fn submitted_frame(&self) -> Option<u64> {
        self.submitted_frame
    }

    fn swap(&mut self, frame: u64) {
        std::mem::swap(&mut self.building, &mut self.submitted);
        self.building.clear();
        self.submitted_frame = Some(frame);
    }
}

#[derive(Debug, Default)]
pub struct BatchSubmitter {
    buffers: FrameBuffers,
    next_frame: u64,
    instances: Vec<InstanceData>,
    runs: Vec<MeshRun>,
    order: Vec<usize>,
    last: SubmitStats,
}

impl BatchSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffers(&self) -> &FrameBuffers {
        &self.buffers
    }

    pub fn last_stats(&self) -> SubmitStats {
        self.last
    }

    /// Clears and hands out the building slot.
    pub fn begin_frame(&mut self) -> &mut Vec<RenderBatch> {
        self.buffers.building.clear();
        &mut self.buffers.building
    }

    /// Submits `batches` as the next frame.
    pub fn submit(
        &mut self,
        batches: Vec<RenderBatch>,
        target: &mut dyn RenderBackend,
    ) -> Result<SubmitStats, BackendError> {
        self.buffers.building = batches;
        self.submit_frame(&[], target)
    }

    /// Submits the building slot plus any beat textures, then swaps slots.
    ///
    /// An empty frame makes no backend calls. On error the building slot is
    /// discarded and the previously submitted frame is kept.
    pub fn submit_frame(
        &mut self,
        beats: &[BeatDraw<'_>],
        target: &mut dyn RenderBackend,
    ) -> Result<SubmitStats, BackendError> {
        let frame = self.next_frame;
        self.next_frame += 1;
        let mut stats = SubmitStats {
            frame,
            batches: self.buffers.building.len(),
            ..SubmitStats::default()
        };
        if self.buffers.building.iter().all(RenderBatch::is_empty) && beats.is_empty() {
            self.buffers.swap(frame);
            self.last = stats;
            return Ok(stats);
        }

        match self.encode(frame, beats, target, &mut stats) {
            Ok(()) => {
                self.buffers.swap(frame);
                self.last = stats;
                Ok(stats)
            }
            Err(err) => {
                self.buffers.building.clear();
                Err(err)
            }
        }
    }

    fn encode(
        &mut self,
        frame: u64,
        beats: &[BeatDraw<'_>],
        target: &mut dyn RenderBackend,
        stats: &mut SubmitStats,
    ) -> Result<(), BackendError> {
        target.begin_frame(frame)?;

        if self.buffers.building.iter().any(|batch| !batch.is_empty()) {
            target.bind_pipeline(Pipeline::Notes)?;
            stats.pipeline_binds += 1;
            let mut instance_offset = 0u32;
            for batch in &self.buffers.building {
                if batch.is_empty() {
                    continue;
                }
                let items = batch.items();

                // Instances sharing a mesh are written back to back.
                let mut rank: HashMap<GeometryKey, usize> = HashMap::new();
                for item in items {
                    let next = rank.len();
                    rank.entry(item.geometry.key).or_insert(next);
                }
                self.order.clear();
                self.order.extend(0..items.len());
                self.order.sort_by_key(|&i| rank[&items[i].geometry.key]);

                self.instances.clear();
                self.runs.clear();
                let material = batch.material();
                for &i in &self.order {
                    let item = &items[i];
                    let index = self.instances.len() as u32;
                    let extends = self
                        .runs
                        .last()
                        .is_some_and(|run| run.geometry.key == item.geometry.key);
                    if extends {
                        if let Some(run) = self.runs.last_mut() {
                            run.instance_count += 1;
                        }
                    } else {
                        self.runs.push(MeshRun {
                            geometry: Arc::clone(&item.geometry),
                            first_instance: index,
                            instance_count: 1,
                        });
                    }
                    self.instances.push(InstanceData {
                        offset: [item.rect.x as f32, item.rect.y as f32],
                        size: [item.rect.width as f32, item.rect.height as f32],
                        color: material
                            .fill_color
                            .to_normalized(material.opacity * item.alpha),
                    });
                }

                target.draw(&DrawSubmission {
                    material,
                    instance_offset,
                    instances: &self.instances,
                    geometry: &self.runs,
                })?;
                instance_offset += self.instances.len() as u32;
                stats.draw_calls += 1;
                stats.instances += self.instances.len();
            }
        }

        if !beats.is_empty() {
            target.bind_pipeline(Pipeline::BeatTextures)?;
            stats.pipeline_binds += 1;
            for beat in beats {
                target.draw_texture(beat)?;
                stats.texture_draws += 1;
            }
        }

        target.end_frame()
    }
}
