use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use tokio::sync::{broadcast, oneshot};

use super::{CaptureGuard, LocalStream, MediaDevices, MediaError, MediaRequest};

/// G.711 runs at 8 kHz; frames are 20 ms.
pub const PCMU_RATE: u32 = 8_000;
pub const FRAME_SAMPLES: usize = 160;
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32_635;
/// Roughly half a second of output audio.
const MAX_PLAYBACK_QUEUE: usize = 24_000;

pub fn encode_ulaw(sample: i16) -> u8 {
    let mut s = sample as i32;
    let sign = if s < 0 {
        s = -s;
        0x80
    } else {
        0
    };
    s = s.min(ULAW_CLIP) + ULAW_BIAS;
    let top_bit = 31 - (s as u32).leading_zeros() as i32;
    let exponent = (top_bit - 7).clamp(0, 7);
    let mantissa = (s >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

pub fn decode_ulaw(byte: u8) -> i16 {
    let byte = !byte;
    let exponent = ((byte >> 4) & 0x07) as i32;
    let mantissa = (byte & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if byte & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Downmixed mono input at the device rate in, 20 ms PCMU frames out.
struct PcmuEncoder {
    step: f64,
    position: f64,
    acc: f32,
    count: u32,
    frame: Vec<u8>,
}

impl PcmuEncoder {
    fn new(device_rate: u32) -> Self {
        Self {
            step: device_rate as f64 / PCMU_RATE as f64,
            position: 0.0,
            acc: 0.0,
            count: 0,
            frame: Vec::with_capacity(FRAME_SAMPLES),
        }
    }

    fn push(&mut self, samples: &[f32], out: &mut Vec<Bytes>) {
        for &s in samples {
            self.acc += s;
            self.count += 1;
            self.position += 1.0;
            if self.position < self.step {
                continue;
            }
            self.position -= self.step;
            let mean = self.acc / self.count as f32;
            self.acc = 0.0;
            self.count = 0;
            let pcm = (mean.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            self.frame.push(encode_ulaw(pcm));
            if self.frame.len() == FRAME_SAMPLES {
                out.push(Bytes::from(std::mem::replace(
                    &mut self.frame,
                    Vec::with_capacity(FRAME_SAMPLES),
                )));
            }
        }
    }
}

struct AudioCapture {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureGuard for AudioCapture {
    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        CaptureGuard::stop(self);
    }
}

impl AudioCapture {
    /// Opens the default input device on its own thread (cpal streams are not
    /// `Send` everywhere) and reports once the stream is playing.
    async fn start(frames: broadcast::Sender<Bytes>) -> Result<Self, MediaError> {
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();
        let thread_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || capture_loop(frames, thread_stop, ready_tx))
            .map_err(|e| MediaError::Device(e.to_string()))?;

        let mut capture = Self {
            stop,
            thread: Some(thread),
        };
        match ready_rx.await {
            Ok(Ok(())) => Ok(capture),
            Ok(Err(e)) => {
                CaptureGuard::stop(&mut capture);
                Err(e)
            }
            Err(_) => Err(MediaError::Device("capture thread exited".to_string())),
        }
    }
}

fn capture_loop(
    frames: broadcast::Sender<Bytes>,
    stop: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<(), MediaError>>,
) {
    let (pcm_tx, pcm_rx) = std_mpsc::channel::<Vec<f32>>();
    let opened = open_input(pcm_tx);
    let (stream, rate) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(MediaError::Device(e.to_string())));
        return;
    }
    let _ = ready.send(Ok(()));
    tracing::info!(rate, "microphone capture started");

    let mut encoder = PcmuEncoder::new(rate);
    let mut encoded = Vec::new();
    while !stop.load(Ordering::SeqCst) {
        match pcm_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(samples) => {
                encoder.push(&samples, &mut encoded);
                for frame in encoded.drain(..) {
                    // No receivers just means nobody is connected yet.
                    let _ = frames.send(frame);
                }
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    drop(stream);
    tracing::info!("microphone capture stopped");
}

fn open_input(pcm_tx: std_mpsc::Sender<Vec<f32>>) -> Result<(cpal::Stream, u32), MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(MediaError::NotFound("microphone"))?;
    let supported = device
        .default_input_config()
        .map_err(|e| MediaError::Device(e.to_string()))?;
    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let rate = config.sample_rate.0;

    let stream = match format {
        SampleFormat::F32 => build_input_stream::<f32>(&device, &config, pcm_tx),
        SampleFormat::I16 => build_input_stream::<i16>(&device, &config, pcm_tx),
        SampleFormat::U16 => build_input_stream::<u16>(&device, &config, pcm_tx),
        other => Err(MediaError::Device(format!("unsupported sample format {:?}", other))),
    }?;
    Ok((stream, rate))
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    pcm_tx: std_mpsc::Sender<Vec<f32>>,
) -> Result<cpal::Stream, MediaError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let err_fn = |err: cpal::StreamError| tracing::warn!(error = %err, "input audio stream error");
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono: Vec<f32> = data
                    .chunks(channels)
                    .map(|frame| {
                        frame.iter().map(|s| s.to_sample::<f32>()).sum::<f32>() / frame.len() as f32
                    })
                    .collect();
                let _ = pcm_tx.send(mono);
            },
            err_fn,
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => MediaError::NotFound("microphone"),
            other => MediaError::Device(other.to_string()),
        })
}

/// Microphone through cpal. There is no camera backend, so video requests
/// are refused and the controller falls back to audio only.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn request(&self, request: MediaRequest) -> Result<LocalStream, MediaError> {
        if request.video {
            return Err(MediaError::NotFound("camera"));
        }
        if !request.audio {
            return Ok(LocalStream::detached(false, false));
        }
        let (frames, _) = broadcast::channel(64);
        let capture = AudioCapture::start(frames.clone()).await?;
        Ok(LocalStream::build(true, false, Some(frames), Some(Box::new(capture))))
    }
}

/// Plays PCMU from one remote stream on the default output device until
/// dropped.
pub struct AudioPlayback {
    queue: Arc<Mutex<VecDeque<f32>>>,
    repeat: usize,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AudioPlayback {
    /// Blocks until the output stream is running; call from a blocking context.
    pub fn start() -> Result<Self, MediaError> {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std_mpsc::channel();

        let thread_queue = queue.clone();
        let thread_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || playback_loop(thread_queue, thread_stop, ready_tx))
            .map_err(|e| MediaError::Device(e.to_string()))?;

        let (rate, channels) = ready_rx
            .recv()
            .map_err(|_| MediaError::Device("playback thread exited".to_string()))??;
        // Sample-and-hold upsampling, duplicated across output channels.
        let repeat = (rate / PCMU_RATE).max(1) as usize * channels;
        Ok(Self {
            queue,
            repeat,
            stop,
            thread: Some(thread),
        })
    }

    pub fn push_ulaw(&self, payload: &[u8]) {
        let Ok(mut queue) = self.queue.lock() else {
            return;
        };
        for &byte in payload {
            let sample = decode_ulaw(byte) as f32 / i16::MAX as f32;
            queue.extend(std::iter::repeat(sample).take(self.repeat));
        }
        let excess = queue.len().saturating_sub(MAX_PLAYBACK_QUEUE);
        queue.drain(..excess);
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn playback_loop(
    queue: Arc<Mutex<VecDeque<f32>>>,
    stop: Arc<AtomicBool>,
    ready: std_mpsc::Sender<Result<(u32, usize), MediaError>>,
) {
    let opened = open_output(queue);
    let (stream, rate, channels) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(MediaError::Device(e.to_string())));
        return;
    }
    let _ = ready.send(Ok((rate, channels)));
    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(50));
    }
    drop(stream);
}

fn open_output(queue: Arc<Mutex<VecDeque<f32>>>) -> Result<(cpal::Stream, u32, usize), MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(MediaError::NotFound("speaker"))?;
    let supported = device
        .default_output_config()
        .map_err(|e| MediaError::Device(e.to_string()))?;
    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let rate = config.sample_rate.0;
    let channels = config.channels.max(1) as usize;

    let stream = match format {
        SampleFormat::F32 => build_output_stream::<f32>(&device, &config, queue),
        SampleFormat::I16 => build_output_stream::<i16>(&device, &config, queue),
        SampleFormat::U16 => build_output_stream::<u16>(&device, &config, queue),
        other => Err(MediaError::Device(format!("unsupported sample format {:?}", other))),
    }?;
    Ok((stream, rate, channels))
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: Arc<Mutex<VecDeque<f32>>>,
) -> Result<cpal::Stream, MediaError>
where
    T: SizedSample + FromSample<f32>,
{
    let err_fn = |err: cpal::StreamError| tracing::warn!(error = %err, "output audio stream error");
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut queue = queue.lock().ok();
                for out in data.iter_mut() {
                    // Silence when nothing has arrived.
                    let sample = queue.as_mut().and_then(|q| q.pop_front()).unwrap_or(0.0);
                    *out = T::from_sample(sample);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| MediaError::Device(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulaw_silence_and_extremes() {
        assert_eq!(encode_ulaw(0), 0xFF);
        assert_eq!(decode_ulaw(0xFF), 0);
        assert!(decode_ulaw(encode_ulaw(i16::MAX)) > 30_000);
        assert!(decode_ulaw(encode_ulaw(i16::MIN + 1)) < -30_000);
    }

    #[test]
    fn ulaw_quantization_error_is_small() {
        for sample in [-12_000i16, -1_000, -50, 50, 1_000, 12_000] {
            let back = decode_ulaw(encode_ulaw(sample)) as i32;
            let err = (back - sample as i32).abs();
            assert!(err <= (sample as i32).abs() / 16 + 8, "{} -> {}", sample, back);
        }
    }

    #[test]
    fn encoder_emits_twenty_ms_frames() {
        let mut encoder = PcmuEncoder::new(48_000);
        let mut out = Vec::new();
        // 50 ms of input at 48 kHz
        encoder.push(&vec![0.25f32; 2_400], &mut out);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|frame| frame.len() == FRAME_SAMPLES));
    }
}
