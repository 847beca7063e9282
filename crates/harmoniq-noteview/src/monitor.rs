//! Frame metrics history and the optimization advisor built on it.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Instant, SystemTime};

use crate::config::AdvisorConfig;
use crate::profiling::duration_ms;

/// Stage names recorded by [`crate::RenderContext`].
pub mod stage {
    /// Change notifications applied between frames, charged to the next frame.
    pub const SOURCE: &str = "source_changes";
    pub const SYNC: &str = "sync";
    pub const CULL: &str = "cull";
    pub const LOD: &str = "lod";
    pub const BATCH: &str = "batch";
    pub const BEAT_CACHE: &str = "beat_cache";
    pub const SUBMIT: &str = "submit";
}

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Clone, Debug, PartialEq)]
pub struct FrameMetrics {
    pub total_time_ms: f64,
    pub stage_times: BTreeMap<String, f64>,
    pub batch_count: usize,
    pub note_count: usize,
    pub gpu_memory_used: u64,
    pub gpu_memory_allocated: u64,
    pub cpu_memory_used: u64,
    pub timestamp: SystemTime,
}

impl Default for FrameMetrics {
    fn default() -> Self {
        Self {
            total_time_ms: 0.0,
            stage_times: BTreeMap::new(),
            batch_count: 0,
            note_count: 0,
            gpu_memory_used: 0,
            gpu_memory_allocated: 0,
            cpu_memory_used: 0,
            timestamp: SystemTime::UNIX_EPOCH,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PerformanceReport {
    pub frame_count: usize,
    pub average_frame_time_ms: f64,
    pub min_frame_time_ms: f64,
    pub max_frame_time_ms: f64,
    pub p95_frame_time_ms: f64,
    pub p99_frame_time_ms: f64,
    pub average_fps: f64,
    pub average_batch_count: f64,
    pub average_note_count: f64,
    /// Mean time per stage over the frames that recorded it.
    pub stage_averages_ms: BTreeMap<String, f64>,
    pub gpu_memory_used: u64,
    pub gpu_memory_allocated: u64,
    pub cpu_memory_used: u64,
}

impl fmt::Display for PerformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FPS: {:.1}, avg frame time: {:.2}ms, notes: {:.0}, batches: {:.0}",
            self.average_fps,
            self.average_frame_time_ms,
            self.average_note_count,
            self.average_batch_count
        )
    }
}

/// Sorted-input percentile using index `floor(p / 100 * n)` clamped to the last sample.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = (p * sorted.len() as f64 / 100.0) as usize;
    sorted[index.min(sorted.len() - 1)]
}

#[derive(Debug)]
pub struct PerformanceMonitor {
    history: VecDeque<FrameMetrics>,
    capacity: usize,
    current: Option<(Instant, FrameMetrics)>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(300)
    }
}

impl PerformanceMonitor {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            current: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn frame_count(&self) -> usize {
        self.history.len()
    }

    pub fn history(&self) -> impl Iterator<Item = &FrameMetrics> {
        self.history.iter()
    }

    pub fn in_frame(&self) -> bool {
        self.current.is_some()
    }

    pub fn begin_frame(&mut self) {
        if self.current.is_some() {
            tracing::debug!("frame metrics discarded: begin_frame called twice");
        }
        let metrics = FrameMetrics {
            timestamp: SystemTime::now(),
            ..FrameMetrics::default()
        };
        self.current = Some((Instant::now(), metrics));
    }

    fn current_mut(&mut self) -> Option<&mut FrameMetrics> {
        self.current.as_mut().map(|(_, metrics)| metrics)
    }

    /// Adds `ms` to `stage` for the current frame.
    pub fn record_stage_time(&mut self, stage: &str, ms: f64) {
        if let Some(metrics) = self.current_mut() {
            *metrics.stage_times.entry(stage.to_owned()).or_insert(0.0) += ms;
        }
    }

    pub fn record_batch_count(&mut self, count: usize) {
        if let Some(metrics) = self.current_mut() {
            metrics.batch_count = count;
        }
    }

    pub fn record_note_count(&mut self, count: usize) {
        if let Some(metrics) = self.current_mut() {
            metrics.note_count = count;
        }
    }

    pub fn record_gpu_memory_usage(&mut self, used: u64, allocated: u64) {
        if let Some(metrics) = self.current_mut() {
            metrics.gpu_memory_used = used;
            metrics.gpu_memory_allocated = allocated;
        }
    }

    pub fn record_cpu_memory_usage(&mut self, bytes: u64) {
        if let Some(metrics) = self.current_mut() {
            metrics.cpu_memory_used = bytes;
        }
    }

    /// Closes the current frame and returns its total time in milliseconds.
    pub fn end_frame(&mut self) -> Option<f64> {
        let (started, mut metrics) = self.current.take()?;
        metrics.total_time_ms = duration_ms(started.elapsed());
        let total = metrics.total_time_ms;
        self.push(metrics);
        Some(total)
    }

    /// Appends a frame measured elsewhere, e.g. replayed from a trace.
    pub fn record_frame(&mut self, metrics: FrameMetrics) {
        self.push(metrics);
    }

    fn push(&mut self, metrics: FrameMetrics) {
        while self.history.len() >= self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(metrics);
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.current = None;
    }

    pub fn report(&self) -> PerformanceReport {
        let Some(last) = self.history.back() else {
            return PerformanceReport::default();
        };
        let n = self.history.len() as f64;
        let mut times: Vec<f64> = self.history.iter().map(|m| m.total_time_ms).collect();
        times.sort_by(f64::total_cmp);
        let average = times.iter().sum::<f64>() / n;

        let mut stage_totals: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for metrics in &self.history {
            for (stage, ms) in &metrics.stage_times {
                let entry = stage_totals.entry(stage.clone()).or_insert((0.0, 0));
                entry.0 += ms;
                entry.1 += 1;
            }
        }

        PerformanceReport {
            frame_count: self.history.len(),
            average_frame_time_ms: average,
            min_frame_time_ms: times[0],
            max_frame_time_ms: times[times.len() - 1],
            p95_frame_time_ms: percentile(&times, 95.0),
            p99_frame_time_ms: percentile(&times, 99.0),
            average_fps: if average > 0.0 { 1000.0 / average } else { 0.0 },
            average_batch_count: self.history.iter().map(|m| m.batch_count as f64).sum::<f64>() / n,
            average_note_count: self.history.iter().map(|m| m.note_count as f64).sum::<f64>() / n,
            stage_averages_ms: stage_totals
                .into_iter()
                .map(|(stage, (total, count))| (stage, total / count as f64))
                .collect(),
            gpu_memory_used: last.gpu_memory_used,
            gpu_memory_allocated: last.gpu_memory_allocated,
            cpu_memory_used: last.cpu_memory_used,
        }
    }

    /// Emits the current report at `info` level.
    pub fn log_detailed_analysis(&self, title: &str) {
        let report = self.report();
        tracing::info!(
            target: "noteview::perf",
            title,
            frames = report.frame_count,
            avg_ms = report.average_frame_time_ms,
            fps = report.average_fps,
            min_ms = report.min_frame_time_ms,
            max_ms = report.max_frame_time_ms,
            p95_ms = report.p95_frame_time_ms,
            p99_ms = report.p99_frame_time_ms,
            batches = report.average_batch_count,
            notes = report.average_note_count,
            "render performance"
        );
        for (stage, ms) in &report.stage_averages_ms {
            tracing::info!(target: "noteview::perf", stage = %stage, avg_ms = *ms, "stage time");
        }
        tracing::info!(
            target: "noteview::perf",
            gpu_used_mb = report.gpu_memory_used as f64 / MIB,
            gpu_allocated_mb = report.gpu_memory_allocated as f64 / MIB,
            cpu_mb = report.cpu_memory_used as f64 / MIB,
            "memory"
        );
    }

    /// Logs the advisor output for the current report.
    pub fn log_suggestions(&self, config: &AdvisorConfig) -> Vec<OptimizationSuggestion> {
        let suggestions = optimization_suggestions(&self.report(), config);
        if suggestions.is_empty() {
            tracing::info!(target: "noteview::perf", "rendering performance is healthy");
        }
        for suggestion in &suggestions {
            tracing::info!(
                target: "noteview::perf",
                severity = ?suggestion.severity,
                title = %suggestion.title,
                description = %suggestion.description,
                recommendations = ?suggestion.recommendations,
                "optimization suggestion"
            );
        }
        suggestions
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Caution,
    Warning,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OptimizationSuggestion {
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub recommendations: Vec<String>,
}

impl OptimizationSuggestion {
    fn new(severity: Severity, title: &str, description: String, recommendations: &[&str]) -> Self {
        Self {
            severity,
            title: title.to_owned(),
            description,
            recommendations: recommendations.iter().map(|r| (*r).to_owned()).collect(),
        }
    }
}

/// Rule-based advice derived from a report. Pure; never touches renderer state.
pub fn optimization_suggestions(
    report: &PerformanceReport,
    config: &AdvisorConfig,
) -> Vec<OptimizationSuggestion> {
    let mut suggestions = Vec::new();
    if report.frame_count == 0 {
        return suggestions;
    }
    let target = config.target_frame_time_ms;

    if report.average_frame_time_ms > target * 1.2 {
        suggestions.push(OptimizationSuggestion::new(
            Severity::Warning,
            "Average frame time too high",
            format!(
                "average frame time {:.2}ms exceeds the {:.2}ms target",
                report.average_frame_time_ms, target
            ),
            &[
                "Reduce the number of notes rendered per frame",
                "Increase the batch size to improve throughput",
                "Check for memory leaks",
                "Optimize shader performance",
            ],
        ));
    }

    if report.max_frame_time_ms - report.min_frame_time_ms > target * 0.5 {
        suggestions.push(OptimizationSuggestion::new(
            Severity::Caution,
            "Unstable frame times",
            format!(
                "frame time ranges from {:.2}ms to {:.2}ms",
                report.min_frame_time_ms, report.max_frame_time_ms
            ),
            &[
                "Look for load spikes",
                "Spread computation across frames with time slicing",
                "Preload resources instead of loading them while rendering",
            ],
        ));
    }

    if report.p99_frame_time_ms > target * 2.0 {
        suggestions.push(OptimizationSuggestion::new(
            Severity::Warning,
            "High P99 frame time (stutter risk)",
            format!("1% of frames take longer than {:.2}ms", report.p99_frame_time_ms),
            &[
                "Cap the frame rate to avoid GPU overload",
                "Reduce expensive render operations",
                "Prefer a simpler render path",
            ],
        ));
    }

    if report.average_batch_count > config.max_batch_count {
        suggestions.push(OptimizationSuggestion::new(
            Severity::Warning,
            "Too many batches",
            format!("average batch count {:.0}", report.average_batch_count),
            &[
                "Merge similar render objects",
                "Raise the per-batch item limit",
                "Use more efficient data structures",
            ],
        ));
    }

    let gpu_mb = report.gpu_memory_used as f64 / MIB;
    if gpu_mb > config.gpu_memory_ceiling_mb {
        suggestions.push(OptimizationSuggestion::new(
            Severity::Caution,
            "High GPU memory usage",
            format!("{gpu_mb:.2}MB in use"),
            &[
                "Use texture compression",
                "Lower the level of detail",
                "Release unused resources",
            ],
        ));
    }

    suggestions
}
