// WAV decoder - reads PCM with hound and summarises it into waveform buckets

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::{DecodedAudio, PcmDecoder};
use crate::analysis::{WaveformSummary, CANCEL_CHECK_INTERVAL};
use crate::error::BackendError;

/// Decoder for uncompressed WAV files
#[derive(Debug, Clone)]
pub struct WavDecoder {
    bucket_seconds: f64,
    device_ready: bool,
}

impl WavDecoder {
    pub fn new(bucket_seconds: f64) -> Self {
        Self {
            bucket_seconds,
            device_ready: true,
        }
    }

    /// Report the playback device as (not) ready
    pub fn with_device_ready(mut self, ready: bool) -> Self {
        self.device_ready = ready;
        self
    }
}

impl PcmDecoder for WavDecoder {
    fn is_ready(&self) -> bool {
        self.device_ready
    }

    fn decode<'a>(
        &'a self,
        path: &'a Path,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<DecodedAudio, BackendError>> {
        let path: PathBuf = path.to_path_buf();
        let cancel = cancel.clone();
        let bucket_seconds = self.bucket_seconds;

        async move {
            let task = tokio::task::spawn_blocking(move || {
                decode_wav(&path, bucket_seconds, &cancel)
            });
            match task.await {
                Ok(result) => result,
                Err(err) => Err(BackendError::Failed {
                    reason: format!("decoder task failed: {err}"),
                }),
            }
        }
        .boxed()
    }
}

/// Blocking decode of a WAV file into a waveform summary
pub fn decode_wav(
    path: &Path,
    bucket_seconds: f64,
    cancel: &CancellationToken,
) -> Result<DecodedAudio, BackendError> {
    let mut reader = hound::WavReader::open(path).map_err(|err| BackendError::Io {
        details: format!("failed to open {}: {err}", path.display()),
    })?;
    let spec = reader.spec();
    if spec.channels == 0 {
        return Err(BackendError::Failed {
            reason: format!("{} has zero channels", path.display()),
        });
    }

    let read_error = |err: hound::Error| BackendError::Io {
        details: format!("error reading {}: {err}", path.display()),
    };

    let mut samples = Vec::with_capacity(reader.len() as usize);
    match spec.sample_format {
        hound::SampleFormat::Float => {
            for (i, sample) in reader.samples::<f32>().enumerate() {
                check_cancel(i, cancel)?;
                samples.push(sample.map_err(read_error)?);
            }
        }
        hound::SampleFormat::Int => match spec.bits_per_sample {
            16 => {
                for (i, sample) in reader.samples::<i16>().enumerate() {
                    check_cancel(i, cancel)?;
                    samples.push(sample.map_err(read_error)? as f32 / 32_768.0);
                }
            }
            bits @ (24 | 32) => {
                let scale = (1_i64 << (bits - 1)) as f32;
                for (i, sample) in reader.samples::<i32>().enumerate() {
                    check_cancel(i, cancel)?;
                    samples.push(sample.map_err(read_error)? as f32 / scale);
                }
            }
            bits => {
                return Err(BackendError::Failed {
                    reason: format!(
                        "unsupported bits_per_sample={} for {}",
                        bits,
                        path.display()
                    ),
                })
            }
        },
    }

    let waveform =
        WaveformSummary::from_samples(&samples, spec.channels, spec.sample_rate, bucket_seconds)
            .map_err(|err| BackendError::Failed {
                reason: err.to_string(),
            })?;

    tracing::debug!(
        path = %path.display(),
        sample_rate = spec.sample_rate,
        channels = spec.channels,
        buckets = waveform.bucket_count(),
        "decoded wav"
    );

    Ok(DecodedAudio {
        sample_rate: spec.sample_rate,
        waveform,
    })
}

fn check_cancel(index: usize, cancel: &CancellationToken) -> Result<(), BackendError> {
    if index % (CANCEL_CHECK_INTERVAL * 16) == 0 && cancel.is_cancelled() {
        return Err(BackendError::Cancelled);
    }
    Ok(())
}
