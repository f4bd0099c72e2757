use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::pcm::AudioFormat;

/// Half-duplex push-to-talk client: one control link, one audio link,
/// channel directory over HTTP.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Config {
    /// Server host (and optional port)
    #[arg(long, env = "WALKIE_HOST", default_value = "127.0.0.1:8000")]
    pub host: String,

    /// Use wss:// and https:// instead of ws:// and http://
    #[arg(long, default_value_t = false)]
    pub secure: bool,

    /// Control link path
    #[arg(long, default_value = "/ws/control")]
    pub control_path: String,

    /// Audio link path
    #[arg(long, default_value = "/ws")]
    pub audio_path: String,

    /// Channel directory path
    #[arg(long, default_value = "/api/channels")]
    pub directory_path: String,

    /// Carry audio frames on the control link instead of a dedicated audio link
    #[arg(long, default_value_t = false)]
    pub shared_link: bool,

    /// Channel served on the bare endpoints (no channel path segment)
    #[arg(long, default_value = "Default")]
    pub default_channel: String,

    /// Channel to join at start-up (defaults to --default-channel)
    #[arg(long, env = "WALKIE_CHANNEL")]
    pub channel: Option<String>,

    // ── Voice mailbox ──────────────────────────────────────────────────

    /// Name this client sends and receives voice messages as
    #[arg(long, env = "WALKIE_USER", default_value = "walkie")]
    pub user: String,

    /// Base path of the voice mailbox endpoints
    #[arg(long, default_value = "/")]
    pub mailbox_path: String,

    /// Where downloaded voice messages are written
    #[arg(long, default_value = ".")]
    pub mailbox_dir: PathBuf,

    /// Length of a recorded voice message (seconds)
    #[arg(long, default_value_t = 3)]
    pub take_secs: u64,

    // ── Audio ──────────────────────────────────────────────────────────

    /// Capture / playback sample rate (Hz)
    #[arg(long, default_value_t = 44_100)]
    pub sample_rate: u32,

    /// Interleaved channels of the capture / playback hardware
    #[arg(long, default_value_t = 1)]
    pub audio_channels: u16,

    /// Samples per capture buffer (one wire frame per buffer)
    #[arg(long, default_value_t = 1024)]
    pub frame_samples: usize,

    /// Synthetic capture tone frequency in Hz (0 = silence)
    #[arg(long, default_value_t = 440.0)]
    pub tone_hz: f32,

    /// Append received audio (f32 LE) to this file
    #[arg(long)]
    pub playback_file: Option<PathBuf>,

    /// Behave as if microphone access was refused
    #[arg(long, default_value_t = false)]
    pub deny_microphone: bool,

    // ── Timing ─────────────────────────────────────────────────────────

    /// Silence after the last received frame that ends reception (ms)
    #[arg(long, default_value_t = 500)]
    pub silence_timeout_ms: u64,

    /// Interval of the silence check (ms)
    #[arg(long, default_value_t = 500)]
    pub silence_tick_ms: u64,

    /// How long a start request waits for start_ack / busy (ms)
    #[arg(long, default_value_t = 5_000)]
    pub reply_timeout_ms: u64,

    /// WebSocket connect timeout (ms)
    #[arg(long, default_value_t = 10_000)]
    pub connect_timeout_ms: u64,

    // ── Runtime ────────────────────────────────────────────────────────

    /// Size of the internal link / capture queues
    #[arg(long, default_value_t = 256)]
    pub channel_capacity: usize,

    /// Stats logging interval in seconds (0 = disabled)
    #[arg(long, default_value_t = 5)]
    pub stats_interval_secs: u64,
}

impl Config {
    fn ws_scheme(&self) -> &'static str {
        if self.secure { "wss" } else { "ws" }
    }

    fn http_scheme(&self) -> &'static str {
        if self.secure { "https" } else { "http" }
    }

    /// Channel selected at start-up.
    pub fn initial_channel(&self) -> String {
        self.channel.clone().unwrap_or_else(|| self.default_channel.clone())
    }

    /// `ws(s)://<host>/ws/control[/<channel>]`
    pub fn control_url(&self, channel: &str) -> Result<Url, url::ParseError> {
        self.endpoint(self.ws_scheme(), &self.control_path, self.channel_segment(channel))
    }

    /// `ws(s)://<host>/ws[/<channel>]`
    pub fn audio_url(&self, channel: &str) -> Result<Url, url::ParseError> {
        self.endpoint(self.ws_scheme(), &self.audio_path, self.channel_segment(channel))
    }

    /// `http(s)://<host>/api/channels`
    pub fn directory_url(&self) -> Result<Url, url::ParseError> {
        self.endpoint(self.http_scheme(), &self.directory_path, None)
    }

    /// `http(s)://<host>/`, base of `send_message/`, `get_messages/…`,
    /// `download_message/…`
    pub fn mailbox_url(&self) -> Result<Url, url::ParseError> {
        self.endpoint(self.http_scheme(), &self.mailbox_path, None)
    }

    pub fn take_length(&self) -> Duration {
        Duration::from_secs(self.take_secs.max(1))
    }

    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.audio_channels,
        }
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn silence_tick(&self) -> Duration {
        Duration::from_millis(self.silence_tick_ms.max(1))
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    fn channel_segment<'a>(&self, channel: &'a str) -> Option<&'a str> {
        if channel == self.default_channel { None } else { Some(channel) }
    }

    fn endpoint(&self, scheme: &str, path: &str, channel: Option<&str>) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&format!("{}://{}", scheme, self.host))?;
        url.set_path(path);
        if let Some(channel) = channel {
            // ws/http URLs always have a hierarchical path
            if let Ok(mut segments) = url.path_segments_mut() {
                segments.pop_if_empty().push(channel);
            }
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(extra: &[&str]) -> Config {
        let mut args = vec!["walkie", "--host", "example.org:9000"];
        args.extend_from_slice(extra);
        Config::parse_from(args)
    }

    #[test]
    fn test_default_channel_uses_bare_endpoints() {
        let c = config(&[]);
        assert_eq!(c.initial_channel(), "Default");
        assert_eq!(c.control_url("Default").unwrap().as_str(), "ws://example.org:9000/ws/control");
        assert_eq!(c.audio_url("Default").unwrap().as_str(), "ws://example.org:9000/ws");
    }

    #[test]
    fn test_channel_segment_is_percent_encoded() {
        let c = config(&["--secure"]);
        assert_eq!(
            c.control_url("Channel 3").unwrap().as_str(),
            "wss://example.org:9000/ws/control/Channel%203"
        );
        assert_eq!(c.audio_url("Lobby").unwrap().as_str(), "wss://example.org:9000/ws/Lobby");
        assert_eq!(c.directory_url().unwrap().as_str(), "https://example.org:9000/api/channels");
    }

    #[test]
    fn test_timing_defaults() {
        let c = config(&["--channel", "Lobby"]);
        assert_eq!(c.initial_channel(), "Lobby");
        assert_eq!(c.silence_timeout(), Duration::from_millis(500));
        assert_eq!(c.silence_tick(), Duration::from_millis(500));
        assert_eq!(c.audio_format(), AudioFormat::mono(44_100));
        assert_eq!(c.frame_samples, 1024);
    }

    #[test]
    fn test_mailbox_defaults() {
        let c = config(&[]);
        assert_eq!(c.user, "walkie");
        assert_eq!(c.mailbox_url().unwrap().as_str(), "http://example.org:9000/");
        assert_eq!(c.take_length(), Duration::from_secs(3));

        let c = config(&["--secure", "--mailbox-path", "/voice/", "--take-secs", "0"]);
        assert_eq!(c.mailbox_url().unwrap().as_str(), "https://example.org:9000/voice/");
        assert_eq!(c.take_length(), Duration::from_secs(1));
    }
}
