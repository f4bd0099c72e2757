/// Voice mailbox: asynchronous voice messages next to the live channels.
///
/// ```text
///  POST /send_message/?sender=..&receiver=..   multipart "file" (WAV)  → VoiceMessage
///  GET  /get_messages/<receiver>                                       → [VoiceMessage]
///  GET  /download_message/<filename>                                   → WAV bytes
/// ```
///
/// Takes are recorded from a `CaptureDevice`, run through the same PCM
/// codec as live audio, and wrapped as mono 16-bit WAV.

use hound::{ SampleFormat, WavReader, WavSpec, WavWriter };
use reqwest::multipart::{ Form, Part };
use reqwest::{ Client, StatusCode };
use serde::{ Deserialize, Serialize };
use std::io::Cursor;
use std::path::{ Path, PathBuf };
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{ debug, info };
use url::Url;

use crate::device::CaptureDevice;
use crate::error::MailboxError;
use crate::pcm::{ self, AudioFormat, SampleBuffer };

/// One stored voice message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceMessage {
    pub sender: String,
    pub receiver: String,
    pub filename: String,
}

#[derive(Clone)]
pub struct MailboxClient {
    client: Client,
    base: Url,
}

impl MailboxClient {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, MailboxError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base))
    }

    pub fn with_client(client: Client, base: Url) -> Self {
        Self { client, base }
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Upload a WAV take addressed to `receiver`.
    pub async fn send(&self, sender: &str, receiver: &str, wav: Vec<u8>) -> Result<VoiceMessage, MailboxError> {
        let size = wav.len();
        let part = Part::bytes(wav).file_name("take.wav").mime_str("audio/wav")?;
        let form = Form::new().part("file", part);

        let mut url = self.endpoint(&["send_message", ""]);
        url.query_pairs_mut().append_pair("sender", sender).append_pair("receiver", receiver);

        let response = self.client.post(url).multipart(form).send().await?.error_for_status()?;
        let message: VoiceMessage = response.json().await?;
        info!(to = %message.receiver, file = %message.filename, bytes = size, "📨 voice message sent");
        Ok(message)
    }

    /// Messages addressed to `receiver`, oldest first.
    pub async fn list(&self, receiver: &str) -> Result<Vec<VoiceMessage>, MailboxError> {
        let url = self.endpoint(&["get_messages", receiver]);
        debug!(url = %url, "listing voice messages");
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn download(&self, filename: &str) -> Result<Vec<u8>, MailboxError> {
        check_file_name(filename)?;
        let url = self.endpoint(&["download_message", filename]);
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(MailboxError::NotFound(filename.to_string()));
        }
        let body = response.error_for_status()?.bytes().await?;
        Ok(body.to_vec())
    }

    /// Download `filename` into `dir`.  The body must decode as WAV;
    /// returns the written path and the message length.
    pub async fn save(&self, filename: &str, dir: &Path) -> Result<(PathBuf, Duration), MailboxError> {
        let wav = self.download(filename).await?;
        let (samples, format) = decode_take(&wav)?;
        let frames = samples.len() / (format.channels.max(1) as usize);
        let length = format.frame_duration(frames);

        let path = dir.join(filename);
        tokio::fs::write(&path, &wav).await?;
        info!(path = %path.display(), bytes = wav.len(), secs = length.as_secs_f32(), "📥 voice message saved");
        Ok((path, length))
    }
}

/// Server-issued names are bare file names; anything with a path in it is
/// refused before it reaches a URL or the file system.
fn check_file_name(name: &str) -> Result<(), MailboxError> {
    let plain = !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\']);
    if plain { Ok(()) } else { Err(MailboxError::InvalidName(name.to_string())) }
}

// ═══════════════════════════════════════════════════════════════════════
//  Takes
// ═══════════════════════════════════════════════════════════════════════

/// Run `capture` for `length` and collect what it delivers.
pub async fn record_take(capture: &mut dyn CaptureDevice, length: Duration) -> Result<Vec<SampleBuffer>, MailboxError> {
    let (tx, mut rx) = mpsc::channel(64);
    capture.start(tx)?;

    let mut buffers = Vec::new();
    let deadline = tokio::time::sleep(length);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            Some(buffer) = rx.recv() => buffers.push(buffer),
        }
    }
    capture.stop();

    info!(buffers = buffers.len(), secs = length.as_secs_f32(), "🎙️  take recorded");
    Ok(buffers)
}

/// Wrap captured buffers as a mono 16-bit WAV.
pub fn encode_take(buffers: &[SampleBuffer], format: &AudioFormat) -> Result<Vec<u8>, MailboxError> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: format.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    let mut samples = 0usize;
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for buffer in buffers {
            for pair in pcm::encode(buffer, format).chunks_exact(2) {
                writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
                samples += 1;
            }
        }
        writer.finalize()?;
    }

    if samples == 0 {
        return Err(MailboxError::EmptyTake);
    }
    Ok(cursor.into_inner())
}

/// Decode a WAV message to interleaved float samples.
pub fn decode_take(wav: &[u8]) -> Result<(Vec<f32>, AudioFormat), MailboxError> {
    let reader = WavReader::new(Cursor::new(wav))?;
    let spec = reader.spec();
    let format = AudioFormat {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    };

    let samples = match spec.sample_format {
        SampleFormat::Int => {
            let full_scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| (v as f32) / full_scale))
                .collect::<Result<Vec<_>, _>>()?
        }
        SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<Vec<_>, _>>()?,
    };
    Ok((samples, format))
}
