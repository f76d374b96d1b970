//! Local audio devices.
//!
//! `cpal` streams are not `Send` on every platform, so each stream lives on
//! its own OS thread for as long as its handle is alive. Dropping the handle
//! drops the stop channel, which ends the thread and releases the device.

use anyhow::Context;
use async_trait::async_trait;
use cpal::{
    FromSample, Sample, SampleFormat, SizedSample, StreamConfig,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use elevenlabs_realtime::AudioOutput;
use fourthwall_core::{
    audio_utils::{self, AGENT_PCM16_SAMPLE_RATE},
    error::MicError,
    voice::{MicTap, Microphone},
};
use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Observer, Producer, Split},
};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU32, Ordering},
    mpsc as std_mpsc,
};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

/// Frames fed to the resampler per call.
const RESAMPLER_CHUNK: usize = 480;
const MIC_CHANNEL_CAPACITY: usize = 64;
/// How much agent speech may be queued ahead of the speaker.
const OUTPUT_BUFFER_SECS: usize = 30;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Mono resampler that accepts arbitrarily sized input.
///
/// Input is buffered until a full resampler chunk is available. Equal rates
/// pass through untouched.
pub struct MonoResampler {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl MonoResampler {
    pub fn new(from_rate: f64, to_rate: f64) -> anyhow::Result<Self> {
        let inner = if (from_rate - to_rate).abs() < f64::EPSILON {
            None
        } else {
            Some(create_resampler(from_rate, to_rate, RESAMPLER_CHUNK)?)
        };
        Ok(Self {
            inner,
            pending: Vec::new(),
        })
    }

    pub fn push(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.inner.as_mut() else {
            return samples.to_vec();
        };
        self.pending.extend_from_slice(samples);

        let mut out = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            match resampler.process(&[chunk], None) {
                Ok(res) => out.extend_from_slice(&res[0]),
                Err(e) => {
                    warn!(error = %e, "Resampling failed; dropping audio.");
                    break;
                }
            }
        }
        out
    }
}

fn unavailable(e: impl std::fmt::Display) -> MicError {
    MicError::Unavailable(e.to_string())
}

/// The default input device.
#[derive(Default)]
pub struct CpalMicrophone;

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn acquire(&self) -> Result<Arc<dyn MicTap>, MicError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (chunks, _) = broadcast::channel(MIC_CHANNEL_CAPACITY);
        let level = Arc::new(AtomicU32::new(0));

        let capture = Capture {
            chunks: chunks.clone(),
            level: level.clone(),
        };
        std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || match capture.open() {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Blocks until every sender is gone.
                    let _ = stop_rx.recv();
                    drop(stream);
                    debug!("Microphone released.");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(unavailable)?;

        ready_rx
            .await
            .map_err(|_| MicError::Unavailable("capture thread exited".into()))??;

        Ok(Arc::new(CpalTap {
            chunks,
            level,
            _stop: stop_tx,
        }))
    }
}

struct CpalTap {
    chunks: broadcast::Sender<Arc<[i16]>>,
    level: Arc<AtomicU32>,
    _stop: std_mpsc::Sender<()>,
}

impl MicTap for CpalTap {
    fn level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<[i16]>> {
        self.chunks.subscribe()
    }
}

struct Capture {
    chunks: broadcast::Sender<Arc<[i16]>>,
    level: Arc<AtomicU32>,
}

impl Capture {
    fn open(self) -> Result<cpal::Stream, MicError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| MicError::Unavailable("no input device available".into()))?;
        let supported = device.default_input_config().map_err(unavailable)?;
        let config: StreamConfig = supported.config();
        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "Opening microphone."
        );

        let stream = match supported.sample_format() {
            SampleFormat::F32 => self.build::<f32>(&device, &config)?,
            SampleFormat::I16 => self.build::<i16>(&device, &config)?,
            SampleFormat::U16 => self.build::<u16>(&device, &config)?,
            other => {
                return Err(MicError::Unavailable(format!(
                    "unsupported sample format {other:?}"
                )));
            }
        };
        stream.play().map_err(unavailable)?;
        Ok(stream)
    }

    fn build<T>(self, device: &cpal::Device, config: &StreamConfig) -> Result<cpal::Stream, MicError>
    where
        T: SizedSample + Send + 'static,
        f32: FromSample<T>,
    {
        let channels = config.channels as usize;
        let mut resampler = MonoResampler::new(config.sample_rate.0 as f64, AGENT_PCM16_SAMPLE_RATE)
            .map_err(unavailable)?;
        let Capture { chunks, level } = self;

        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    let samples: Vec<f32> = data.iter().map(|&s| s.to_sample::<f32>()).collect();
                    let mono = audio_utils::downmix_to_mono(&samples, channels);
                    let resampled = resampler.push(&mono);
                    if resampled.is_empty() {
                        return;
                    }
                    let pcm16 = audio_utils::convert_f32_to_i16(&resampled);
                    level.store(audio_utils::rms_level(&pcm16).to_bits(), Ordering::Relaxed);
                    // No receivers just means no session is listening yet.
                    let _ = chunks.send(Arc::from(pcm16));
                },
                |err| error!(error = %err, "Microphone stream error."),
                None,
            )
            .map_err(unavailable)
    }
}

struct Playback {
    producer: HeapProd<f32>,
    resampler: MonoResampler,
}

/// Plays agent speech on the default output device.
pub struct CpalOutput {
    playback: Mutex<Playback>,
    flush: Arc<AtomicBool>,
    _stop: std_mpsc::Sender<()>,
}

impl CpalOutput {
    /// Opens the default output device. Blocks until the stream is running.
    pub fn open() -> anyhow::Result<Self> {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let flush = Arc::new(AtomicBool::new(false));

        let stream_flush = flush.clone();
        std::thread::Builder::new()
            .name("speaker".into())
            .spawn(move || match open_output_stream(stream_flush) {
                Ok((stream, producer, rate)) => {
                    let _ = ready_tx.send(Ok((producer, rate)));
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        let (producer, rate) = ready_rx.recv().context("Speaker thread exited")??;
        let resampler = MonoResampler::new(AGENT_PCM16_SAMPLE_RATE, rate as f64)?;
        Ok(Self {
            playback: Mutex::new(Playback {
                producer,
                resampler,
            }),
            flush,
            _stop: stop_tx,
        })
    }
}

fn open_output_stream(
    flush: Arc<AtomicBool>,
) -> anyhow::Result<(cpal::Stream, HeapProd<f32>, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .context("No default output device available")?;
    let supported = device.default_output_config()?;
    let config: StreamConfig = supported.config();
    let rate = config.sample_rate.0;
    info!(
        device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
        sample_rate = rate,
        channels = config.channels,
        "Opening speaker."
    );

    let (producer, consumer) = HeapRb::<f32>::new(rate as usize * OUTPUT_BUFFER_SECS).split();
    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_output::<f32>(&device, &config, consumer, flush)?,
        SampleFormat::I16 => build_output::<i16>(&device, &config, consumer, flush)?,
        SampleFormat::U16 => build_output::<u16>(&device, &config, consumer, flush)?,
        other => anyhow::bail!("Unsupported output sample format: {other:?}"),
    };
    stream.play()?;
    Ok((stream, producer, rate))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut consumer: HeapCons<f32>,
    flush: Arc<AtomicBool>,
) -> anyhow::Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = (config.channels as usize).max(1);
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            if flush.swap(false, Ordering::AcqRel) {
                consumer.clear();
            }
            for frame in data.chunks_mut(channels) {
                let sample = consumer.try_pop().unwrap_or(0.0);
                for out in frame.iter_mut() {
                    *out = T::from_sample(sample);
                }
            }
        },
        |err| error!(error = %err, "Speaker stream error."),
        None,
    )?;
    Ok(stream)
}

impl AudioOutput for CpalOutput {
    fn play(&self, pcm16: &[i16]) {
        let samples = audio_utils::convert_i16_to_f32(pcm16);
        let Ok(mut playback) = self.playback.lock() else {
            return;
        };
        let resampled = playback.resampler.push(&samples);
        let pushed = playback.producer.push_slice(&resampled);
        if pushed < resampled.len() {
            warn!(dropped = resampled.len() - pushed, "Playback buffer full.");
        }
    }

    fn interrupt(&self) {
        self.flush.store(true, Ordering::Release);
    }

    fn is_playing(&self) -> bool {
        self.playback
            .lock()
            .map(|p| !p.producer.is_empty())
            .unwrap_or(false)
    }
}
