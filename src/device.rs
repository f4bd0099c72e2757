//! Audio hardware collaborators.
//!
//! The session controller only sees these traits: a capture device that
//! emits fixed-size sample buffers on a steady cadence while running, and a
//! playback sink that plays scheduled buffers in submission order.  The
//! concrete devices here are what the CLI wires up: a synthetic tone source
//! and a raw-file sink.

use std::fs::{ File, OpenOptions };
use std::io::{ BufWriter, Write };
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{ interval, MissedTickBehavior };
use tracing::{ debug, info, warn };

use crate::error::AudioDeviceError;
use crate::pcm::{ AudioFormat, SampleBuffer };

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicPermission {
    Granted,
    Denied,
}

pub trait CaptureDevice: Send {
    fn permission(&self) -> MicPermission;

    /// Start delivering one buffer per hardware interval into `tx`.
    fn start(&mut self, tx: mpsc::Sender<SampleBuffer>) -> Result<(), AudioDeviceError>;

    /// Remove the capture tap.  No buffer is produced after this returns.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

pub trait PlaybackSink: Send {
    fn start(&mut self) -> Result<(), AudioDeviceError>;

    fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// Queue interleaved samples for playback after everything already queued.
    fn schedule(&mut self, samples: Vec<f32>) -> Result<(), AudioDeviceError>;
}

// ═══════════════════════════════════════════════════════════════════════
//  Synthetic capture
// ═══════════════════════════════════════════════════════════════════════

/// Sine-tone microphone (silence when `tone_hz == 0`), paced like real
/// hardware: `frame_samples` per buffer at the format's sample rate.
pub struct SyntheticCapture {
    format: AudioFormat,
    frame_samples: usize,
    tone_hz: f32,
    permission: MicPermission,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl SyntheticCapture {
    pub fn new(format: AudioFormat, frame_samples: usize, tone_hz: f32, permission: MicPermission) -> Self {
        Self {
            format,
            frame_samples: frame_samples.max(1),
            tone_hz,
            permission,
            task: None,
        }
    }

    fn buffer_interval(&self) -> Duration {
        self.format.frame_duration(self.frame_samples).max(Duration::from_millis(1))
    }
}

impl CaptureDevice for SyntheticCapture {
    fn permission(&self) -> MicPermission {
        self.permission
    }

    fn start(&mut self, tx: mpsc::Sender<SampleBuffer>) -> Result<(), AudioDeviceError> {
        if self.permission == MicPermission::Denied {
            return Err(AudioDeviceError::Start("microphone access refused".into()));
        }
        if self.task.is_some() {
            return Ok(());
        }

        let frames = self.frame_samples;
        let channels = self.format.channels.max(1) as usize;
        let step = if self.format.sample_rate == 0 {
            0.0
        } else {
            (self.tone_hz as f64) * std::f64::consts::TAU / (self.format.sample_rate as f64)
        };
        let period = self.buffer_interval();

        self.task = Some(
            tokio::spawn(async move {
                let mut tick = interval(period);
                tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
                let mut phase = 0.0f64;
                let mut buffers: u64 = 0;
                loop {
                    tick.tick().await;
                    let mut samples = Vec::with_capacity(frames * channels);
                    for _ in 0..frames {
                        let s = (phase.sin() * 0.3) as f32;
                        phase = (phase + step) % std::f64::consts::TAU;
                        for _ in 0..channels {
                            samples.push(s);
                        }
                    }
                    if tx.send(SampleBuffer::Float32(samples)).await.is_err() {
                        break;
                    }
                    buffers += 1;
                }
                debug!(buffers = buffers, "synthetic capture stopped");
            })
        );

        info!(
            sample_rate = self.format.sample_rate,
            frame_samples = self.frame_samples,
            tone_hz = self.tone_hz,
            "🎙️  capture started"
        );
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("🎙️  capture stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Raw-file playback
// ═══════════════════════════════════════════════════════════════════════

/// Playback sink that appends f32 LE samples to a file, or discards them
/// when no file is configured.
pub struct RawFilePlayback {
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    running: bool,
    samples_played: u64,
}

impl RawFilePlayback {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            writer: None,
            running: false,
            samples_played: 0,
        }
    }
}

impl PlaybackSink for RawFilePlayback {
    fn start(&mut self) -> Result<(), AudioDeviceError> {
        if self.running {
            return Ok(());
        }
        if let Some(path) = &self.path {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| AudioDeviceError::Start(format!("{}: {}", path.display(), e)))?;
            self.writer = Some(BufWriter::new(file));
        }
        self.running = true;
        info!(path = ?self.path, "🔊 playback started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!(error = %e, "playback flush failed");
            }
        }
        if self.running {
            info!(samples = self.samples_played, "🔊 playback stopped");
        }
        self.running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn schedule(&mut self, samples: Vec<f32>) -> Result<(), AudioDeviceError> {
        if !self.running {
            return Err(AudioDeviceError::Write("playback not running".into()));
        }
        if let Some(writer) = self.writer.as_mut() {
            for s in &samples {
                writer.write_all(&s.to_le_bytes()).map_err(|e| AudioDeviceError::Write(e.to_string()))?;
            }
        }
        self.samples_played += samples.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime
            ::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("walkie-{}-{}-{}.f32", tag, std::process::id(), nanos))
    }

    #[tokio::test]
    async fn test_synthetic_capture_emits_fixed_size_buffers() {
        let format = AudioFormat::mono(44_100);
        let mut capture = SyntheticCapture::new(format, 1024, 440.0, MicPermission::Granted);
        let (tx, mut rx) = mpsc::channel(8);

        capture.start(tx).unwrap();
        assert!(capture.is_running());

        for _ in 0..2 {
            let buf = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            assert_eq!(buf.len(), 1024);
            match buf {
                SampleBuffer::Float32(s) => assert!(s.iter().all(|v| v.abs() <= 0.3 + 1e-6)),
                SampleBuffer::Int16(_) => panic!("synthetic capture produces floats"),
            }
        }

        capture.stop();
        assert!(!capture.is_running());
    }

    #[test]
    fn test_denied_capture_never_starts() {
        let mut capture = SyntheticCapture::new(AudioFormat::mono(16_000), 256, 0.0, MicPermission::Denied);
        let (tx, _rx) = mpsc::channel(1);
        assert_eq!(capture.permission(), MicPermission::Denied);
        assert!(capture.start(tx).is_err());
        assert!(!capture.is_running());
    }

    #[test]
    fn test_file_playback_appends_samples() {
        let path = temp_path("playback");
        let mut sink = RawFilePlayback::new(Some(path.clone()));

        assert!(sink.schedule(vec![0.1]).is_err(), "schedule before start must fail");

        sink.start().unwrap();
        sink.schedule(vec![0.25, -0.5]).unwrap();
        sink.schedule(vec![1.0]).unwrap();
        assert_eq!(sink.samples_played, 3);
        sink.stop();

        let bytes = std::fs::read(&path).unwrap();
        let samples: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(samples, vec![0.25, -0.5, 1.0]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_playback_start_failure_is_reported() {
        let dir = std::env::temp_dir().join(format!("walkie-missing-{}", std::process::id()));
        let mut sink = RawFilePlayback::new(Some(dir.join("nested").join("out.f32")));
        assert!(matches!(sink.start(), Err(AudioDeviceError::Start(_))));
        assert!(!sink.is_running());
    }
}
