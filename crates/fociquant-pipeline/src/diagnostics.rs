//! Pipeline diagnostics: timing, counts, and other metrics for each stage.
//!
//! Every call to
//! [`process_image_with_diagnostics`](crate::process_image_with_diagnostics)
//! collects diagnostics alongside the image summary. They are meant for
//! parameter tuning: how many instances the size filter removed, how
//! many foci the watershed produced, where the time went.
//!
//! Timestamps come from a caller-supplied [`Clock`] so the crate itself
//! never reads the system time. [`StdClock`] is the native
//! implementation.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Source of timestamps for stage timing.
pub trait Clock {
    /// Opaque point in time.
    type Instant;

    /// The current instant.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// [`Clock`] implementation backed by [`std::time::Instant`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}

/// Run `f` and time it with `clock`.
pub(crate) fn timed<C: Clock, T>(clock: &C, f: impl FnOnce() -> T) -> (T, Duration) {
    let start = clock.now();
    let value = f();
    (value, clock.elapsed(&start))
}

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected from one image pass.
///
/// The nucleus stages and the foci stages run concurrently, so stage
/// durations can sum to more than `total_duration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDiagnostics {
    /// Nucleus segmentation.
    pub segmentation: StageDiagnostics,
    /// Size filtering of raw nucleus instances.
    pub refine: StageDiagnostics,
    /// Watershed separation of touching nuclei plus the second size filter.
    pub nucleus_separation: StageDiagnostics,
    /// Foci thresholding, all channels.
    pub threshold: StageDiagnostics,
    /// Watershed separation of foci, all channels.
    pub foci_separation: StageDiagnostics,
    /// Colocalization (only when enabled).
    pub colocalization: Option<StageDiagnostics>,
    /// Parent assignment and per-nucleus roll-up.
    pub aggregation: StageDiagnostics,
    /// Total wall-clock duration of the image pass (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary counts across all stages.
    pub summary: PipelineSummary,
}

/// Diagnostics for a single pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics (counts, sizes, etc.).
    pub metrics: StageMetrics,
}

/// Stage-specific metrics that vary by pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Nucleus segmentation metrics.
    Segmentation {
        /// Backend that produced the instances.
        backend: String,
        /// Raw instances before size filtering.
        instance_count: usize,
    },
    /// Refinement metrics.
    Refine {
        /// Minimum instance size in pixels.
        min_object_size_px: u64,
        /// Instances removed by the size filter.
        removed_count: usize,
        /// Foreground pixels kept.
        kept_pixels: u64,
    },
    /// Nucleus separation metrics.
    NucleusSeparation {
        /// Nuclei after separation and the second size filter.
        nucleus_count: usize,
        /// Separated pieces dropped by the second size filter.
        dropped_count: usize,
    },
    /// Thresholding metrics.
    Threshold {
        /// Intensity threshold in native units.
        intensity_threshold: u32,
        /// Number of foci channels thresholded.
        channel_count: usize,
        /// Foreground pixels summed over channels.
        foreground_pixels: u64,
    },
    /// Foci separation metrics.
    FociSeparation {
        /// Foci objects summed over channels.
        object_count: usize,
    },
    /// Colocalization metrics.
    Colocalization {
        /// Channel sets requested.
        set_count: usize,
        /// Sets skipped with a warning.
        skipped_count: usize,
        /// Objects summed over the computed sets.
        object_count: usize,
    },
    /// Aggregation metrics.
    Aggregation {
        /// Objects assigned to a nucleus, all channel sets.
        assigned_count: u64,
        /// Objects outside every nucleus, all channel sets.
        unassigned_count: u64,
    },
}

/// High-level summary counts for one image pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSummary {
    /// Image width in pixels.
    pub image_width: u32,
    /// Image height in pixels.
    pub image_height: u32,
    /// Total pixel count.
    pub pixel_count: u64,
    /// Nuclei in the final table.
    pub nucleus_count: usize,
    /// Channel sets measured (foci channels plus colocalization sets).
    pub channel_set_count: usize,
}

impl PipelineDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Pipeline Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Image: {}x{} ({} pixels)",
            self.summary.image_width, self.summary.image_height, self.summary.pixel_count,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);

        let mut stages: Vec<(&str, &StageDiagnostics)> = vec![
            ("Segmentation", &self.segmentation),
            ("Refine", &self.refine),
            ("Nucleus Separation", &self.nucleus_separation),
            ("Threshold", &self.threshold),
            ("Foci Separation", &self.foci_separation),
        ];
        if let Some(ref coloc) = self.colocalization {
            stages.push(("Colocalization", coloc));
        }
        stages.push(("Aggregation", &self.aggregation));

        for (name, diag) in &stages {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        lines.push(format!(
            "Nuclei: {}  |  Channel sets: {}",
            self.summary.nucleus_count, self.summary.channel_set_count,
        ));

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Segmentation {
            backend,
            instance_count,
        } => format!("{backend}: {instance_count} instances"),
        StageMetrics::Refine {
            min_object_size_px,
            removed_count,
            kept_pixels,
        } => format!("min={min_object_size_px}px removed={removed_count} kept={kept_pixels}px"),
        StageMetrics::NucleusSeparation {
            nucleus_count,
            dropped_count,
        } => format!("{nucleus_count} nuclei ({dropped_count} dropped after split)"),
        StageMetrics::Threshold {
            intensity_threshold,
            channel_count,
            foreground_pixels,
        } => format!(
            "t={intensity_threshold} channels={channel_count} foreground={foreground_pixels}px",
        ),
        StageMetrics::FociSeparation { object_count } => format!("{object_count} objects"),
        StageMetrics::Colocalization {
            set_count,
            skipped_count,
            object_count,
        } => format!("{set_count} sets ({skipped_count} skipped), {object_count} objects"),
        StageMetrics::Aggregation {
            assigned_count,
            unassigned_count,
        } => format!("assigned={assigned_count} unassigned={unassigned_count}"),
    }
}
