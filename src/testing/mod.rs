//! Testability harness utilities.
//!
//! Synthetic click tracks (as onset times, waveform summaries, PCM or WAV
//! files) and scripted backends whose failures, delays and panics can be
//! dialled in by unit and integration tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use crate::analysis::WaveformSummary;
use crate::engine::backend::{
    DraftBuilder, DraftOptions, DraftOutcome, DraftTrack, ProgressCallback, SeparationBackend,
    SeparationCapability, SeparationOutput, SnapDraftBuilder,
};
use crate::error::BackendError;

/// Sample rate used for synthetic PCM; 80 frames per 10 ms bucket
pub const CLICK_SAMPLE_RATE: u32 = 8_000;

/// Evenly spaced click times
pub fn click_times(bpm: f64, count: usize, offset_seconds: f64) -> Vec<f64> {
    let interval = 60.0 / bpm;
    (0..count)
        .map(|i| offset_seconds + i as f64 * interval)
        .collect()
}

/// Click times displaced by up to `jitter_ms`, reproducible per `seed`
pub fn jittered_click_times(
    bpm: f64,
    count: usize,
    offset_seconds: f64,
    jitter_ms: f64,
    seed: u64,
) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    click_times(bpm, count, offset_seconds)
        .into_iter()
        .map(|t| {
            let jitter = if jitter_ms > 0.0 {
                rng.gen_range(-jitter_ms..=jitter_ms) / 1000.0
            } else {
                0.0
            };
            (t + jitter).max(0.0)
        })
        .collect()
}

/// Bucketed summary with a spike and short decay tail at each click
pub fn click_track_summary(
    times: &[f64],
    duration_seconds: f64,
    bucket_seconds: f64,
) -> WaveformSummary {
    const FLOOR: f32 = 0.02;
    const TAIL: [f32; 3] = [0.5, 0.25, 0.12];

    let buckets = (duration_seconds / bucket_seconds).ceil() as usize;
    let mut maxs = vec![FLOOR; buckets];
    for &t in times {
        let index = (t / bucket_seconds).round() as usize;
        if index >= buckets {
            continue;
        }
        maxs[index] = 1.0;
        for (k, level) in TAIL.iter().enumerate() {
            if let Some(slot) = maxs.get_mut(index + k + 1) {
                *slot = slot.max(*level);
            }
        }
    }
    let mins = maxs.iter().map(|m| -m).collect();

    WaveformSummary {
        sample_rate: CLICK_SAMPLE_RATE,
        bucket_seconds,
        mins,
        maxs,
        duration_seconds,
    }
}

/// Mono PCM with a decaying 1 kHz burst at each click over low noise
pub fn click_track_samples(times: &[f64], duration_seconds: f64, sample_rate: u32) -> Vec<f32> {
    let rate = sample_rate as f64;
    let len = (duration_seconds * rate).round() as usize;
    let mut rng = StdRng::seed_from_u64(11);
    let mut samples: Vec<f32> = (0..len).map(|_| rng.gen_range(-0.01..0.01)).collect();

    let burst = (0.02 * rate) as usize;
    let decay = 0.004 * rate;
    for &t in times {
        let start = (t * rate).round() as usize;
        for n in 0..burst {
            let Some(slot) = samples.get_mut(start + n) else {
                break;
            };
            let phase = 2.0 * std::f64::consts::PI * 1_000.0 * n as f64 / rate;
            *slot += ((-(n as f64) / decay).exp() * (phase + 0.5).sin()) as f32;
        }
    }
    samples
}

static WAV_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique temp path for a test WAV
pub fn temp_wav_path(name: &str) -> PathBuf {
    let n = WAV_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "rhythm_drafter_{}_{}_{}.wav",
        name,
        std::process::id(),
        n
    ))
}

/// Write mono 16-bit PCM to `path`
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<(), hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for sample in samples {
        writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    writer.finalize()
}

/// Write a click track WAV to a fresh temp file and return its path
///
/// Panics if the file cannot be written; test helper only.
pub fn write_click_wav(name: &str, bpm: f64, count: usize, offset_seconds: f64) -> PathBuf {
    let times = click_times(bpm, count, offset_seconds);
    let duration = offset_seconds + count as f64 * 60.0 / bpm + 0.5;
    let samples = click_track_samples(&times, duration, CLICK_SAMPLE_RATE);
    let path = temp_wav_path(name);
    if let Err(err) = write_wav(&path, &samples, CLICK_SAMPLE_RATE) {
        panic!("failed to write {}: {}", path.display(), err);
    }
    path
}

/// How a scripted model load behaves
#[derive(Debug, Clone)]
pub enum LoadBehavior {
    Ready,
    Fail(String),
    /// Never completes; exercises the load timeout
    Hang,
}

/// Separation backend with scripted probe, load and separation behaviour
#[derive(Debug, Clone)]
pub struct ScriptedSeparation {
    pub name: String,
    pub capability: SeparationCapability,
    pub load: LoadBehavior,
    /// Total separation time, spread over progress ticks
    pub separation_delay: Duration,
    pub separation_error: Option<String>,
}

impl Default for ScriptedSeparation {
    fn default() -> Self {
        Self {
            name: "scripted".to_string(),
            capability: SeparationCapability::Available,
            load: LoadBehavior::Ready,
            separation_delay: Duration::ZERO,
            separation_error: None,
        }
    }
}

impl ScriptedSeparation {
    pub fn failing_load() -> Self {
        Self {
            load: LoadBehavior::Fail("weights corrupted".to_string()),
            ..Self::default()
        }
    }

    pub fn hanging_load() -> Self {
        Self {
            load: LoadBehavior::Hang,
            ..Self::default()
        }
    }

    pub fn unavailable(reason: &str) -> Self {
        Self {
            capability: SeparationCapability::Unavailable {
                reason: reason.to_string(),
            },
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            separation_delay: delay,
            ..Self::default()
        }
    }

    pub fn failing_separation(reason: &str) -> Self {
        Self {
            separation_error: Some(reason.to_string()),
            ..Self::default()
        }
    }
}

impl SeparationBackend for ScriptedSeparation {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&self) -> SeparationCapability {
        self.capability.clone()
    }

    fn load_model<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), BackendError>> {
        async move {
            match &self.load {
                LoadBehavior::Ready => Ok(()),
                LoadBehavior::Fail(reason) => Err(BackendError::Failed {
                    reason: reason.clone(),
                }),
                LoadBehavior::Hang => {
                    futures::future::pending::<()>().await;
                    Ok(())
                }
            }
        }
        .boxed()
    }

    fn separate<'a>(
        &'a self,
        audio_path: &'a Path,
        cancel: &'a CancellationToken,
        progress: ProgressCallback,
    ) -> BoxFuture<'a, Result<SeparationOutput, BackendError>> {
        async move {
            const TICKS: u32 = 10;
            let tick = self.separation_delay / TICKS;
            for i in 1..=TICKS {
                if cancel.is_cancelled() {
                    return Err(BackendError::Cancelled);
                }
                if !tick.is_zero() {
                    tokio::time::sleep(tick).await;
                }
                progress(i as f32 / TICKS as f32);
            }
            if let Some(reason) = &self.separation_error {
                return Err(BackendError::Failed {
                    reason: reason.clone(),
                });
            }
            Ok(SeparationOutput {
                drums_path: audio_path.to_path_buf(),
                is_passthrough: false,
            })
        }
        .boxed()
    }
}

/// How a scripted draft builder behaves
#[derive(Debug, Clone)]
pub enum BuilderBehavior {
    /// Delegate to the grid-snapping builder
    Snap,
    Fail(String),
    Panic(String),
}

/// Draft builder that records the options it was called with
pub struct ScriptedDraftBuilder {
    behavior: BuilderBehavior,
    inner: SnapDraftBuilder,
    seen: Arc<Mutex<Vec<(DraftOptions, Option<PathBuf>)>>>,
}

impl ScriptedDraftBuilder {
    pub fn new(behavior: BuilderBehavior) -> Self {
        Self {
            behavior,
            inner: SnapDraftBuilder::new(),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn snapping() -> Self {
        Self::new(BuilderBehavior::Snap)
    }

    pub fn failing(reason: &str) -> Self {
        Self::new(BuilderBehavior::Fail(reason.to_string()))
    }

    pub fn panicking(message: &str) -> Self {
        Self::new(BuilderBehavior::Panic(message.to_string()))
    }

    /// Options and drum stem path of every call so far
    pub fn calls(&self) -> Vec<(DraftOptions, Option<PathBuf>)> {
        self.seen
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }
}

impl DraftBuilder for ScriptedDraftBuilder {
    fn generate<'a>(
        &'a self,
        track: &'a DraftTrack,
        options: &'a DraftOptions,
        progress: ProgressCallback,
        cancel: &'a CancellationToken,
        drum_stem_path: Option<&'a Path>,
    ) -> BoxFuture<'a, DraftOutcome> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((options.clone(), drum_stem_path.map(Path::to_path_buf)));
        }
        async move {
            match &self.behavior {
                BuilderBehavior::Snap => {
                    self.inner
                        .generate(track, options, progress, cancel, drum_stem_path)
                        .await
                }
                BuilderBehavior::Fail(reason) => DraftOutcome::failed(reason.clone()),
                BuilderBehavior::Panic(message) => panic!("{}", message),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_click_times_spacing() {
        let times = click_times(120.0, 4, 0.25);
        assert_eq!(times, vec![0.25, 0.75, 1.25, 1.75]);
    }

    #[test]
    fn test_jitter_is_bounded_and_reproducible() {
        let a = jittered_click_times(100.0, 20, 0.5, 8.0, 42);
        let b = jittered_click_times(100.0, 20, 0.5, 8.0, 42);
        assert_eq!(a, b);
        for (jittered, exact) in a.iter().zip(click_times(100.0, 20, 0.5)) {
            assert!((jittered - exact).abs() <= 0.008 + 1e-12);
        }
    }

    #[test]
    fn test_summary_places_spikes() {
        let summary = click_track_summary(&[0.5], 1.0, 0.01);
        assert_eq!(summary.bucket_count(), 100);
        assert_eq!(summary.maxs[50], 1.0);
        assert_eq!(summary.maxs[51], 0.5);
        assert_eq!(summary.maxs[49], 0.02);
        assert_eq!(summary.mins[50], -1.0);
    }

    #[test]
    fn test_click_wav_round_trips_through_hound() {
        let path = write_click_wav("harness", 120.0, 4, 0.25);
        let reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        let frames = reader.len();
        std::fs::remove_file(&path).ok();

        assert_eq!(spec.sample_rate, CLICK_SAMPLE_RATE);
        assert_eq!(spec.channels, 1);
        assert_eq!(frames as usize, (2.75 * CLICK_SAMPLE_RATE as f64) as usize);
    }
}
