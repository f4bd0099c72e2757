/// Push-to-talk session state.
///
/// The `Session` aggregate is owned by the controller task and is the only
/// place the half-duplex rules live:
///
/// ```text
///   Idle ──press──▶ (pending) ──start_ack──▶ Transmitting ──release──▶ Idle
///    │                 │                        │  (stop_ack)
///    │               busy ──▶ Idle              └─ inbound frames dropped
///  frame
///    ▼
///   Receiving ──frame──▶ Receiving ──silence ≥ timeout (tick)──▶ Idle
/// ```
///
/// Every method is synchronous and takes `now` explicitly; the controller
/// performs the I/O each outcome asks for.

use chrono::Local;
use serde::Serialize;
use std::time::{ Duration, Instant };
use tracing::info;

use crate::device::MicPermission;
use crate::directory::ChannelDirectory;
use crate::error::SessionError;
use crate::protocol::ControlMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TalkState {
    Idle,
    /// Local capture is live and streaming.
    Transmitting,
    /// Remote audio arrived within the silence window.
    Receiving,
}

impl std::fmt::Display for TalkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TalkState::Idle => write!(f, "idle"),
            TalkState::Transmitting => write!(f, "transmitting"),
            TalkState::Receiving => write!(f, "receiving"),
        }
    }
}

/// What the controller must do after an inbound control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Floor granted: enable capture, answer the caller.
    StartGranted,
    /// Server says someone else is talking.
    StartRefused,
    /// `stop_ack`; capture must be off if we were still transmitting.
    StopConfirmed {
        was_transmitting: bool,
    },
    ChannelAnnounced {
        name: String,
        added: bool,
    },
    /// `start_ack` after the request was given up (timed out or
    /// withdrawn).  The server now thinks we hold the floor; hand it back.
    StaleGrant,
    /// Reply that matches nothing pending.
    Unexpected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Was transmitting: disable capture, send `stop`.
    StopTransmitting,
    /// Released before the floor was granted: send `stop`, forget the request.
    CancelPending,
    NotTalking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioVerdict {
    Play,
    /// Transmitting: never hand the frame to playback.
    Suppress,
}

/// What observers (UI, CLI) see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    pub talk: TalkState,
    pub is_connected: bool,
    pub is_transmitting: bool,
    pub is_receiving: bool,
    pub is_requesting: bool,
    pub selected_channel: String,
    pub channels: Vec<String>,
}

#[derive(Debug)]
pub struct Session {
    pub connection_state: ConnectionState,
    pub talk_state: TalkState,
    pub selected_channel: String,
    pub known_channels: ChannelDirectory,
    pub last_audio_received_at: Option<Instant>,
    /// When the outstanding `start` was sent.
    pending_start: Option<Instant>,
    silence_timeout: Duration,
    log: Vec<String>,
}

impl Session {
    pub fn new(channel: &str, silence_timeout: Duration) -> Self {
        Session {
            connection_state: ConnectionState::Disconnected,
            talk_state: TalkState::Idle,
            selected_channel: channel.to_string(),
            known_channels: ChannelDirectory::with_channel(channel),
            last_audio_received_at: None,
            pending_start: None,
            silence_timeout,
            log: Vec::new(),
        }
    }

    // ── Queries ────────────────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    pub fn is_transmitting(&self) -> bool {
        self.talk_state == TalkState::Transmitting
    }

    pub fn is_receiving(&self) -> bool {
        self.talk_state == TalkState::Receiving
    }

    pub fn is_requesting(&self) -> bool {
        self.pending_start.is_some()
    }

    pub fn log(&self) -> &[String] {
        &self.log
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection: self.connection_state,
            talk: self.talk_state,
            is_connected: self.is_connected(),
            is_transmitting: self.is_transmitting(),
            is_receiving: self.is_receiving(),
            is_requesting: self.is_requesting(),
            selected_channel: self.selected_channel.clone(),
            channels: self.known_channels.names(),
        }
    }

    /// Append to the session log (and the tracing output).
    pub fn record(&mut self, entry: impl Into<String>) {
        let entry = entry.into();
        info!(channel = %self.selected_channel, "{}", entry);
        self.log.push(format!("[{}] {}", Local::now().format("%H:%M:%S%.3f"), entry));
    }

    // ── Connection lifecycle ───────────────────────────────────────────

    pub fn begin_connecting(&mut self) {
        self.connection_state = ConnectionState::Connecting;
    }

    pub fn connected(&mut self) {
        self.connection_state = ConnectionState::Connected;
        let channel = self.selected_channel.clone();
        self.record(format!("Connected to {}", channel));
    }

    /// Drop back to Disconnected; all talk state resets.
    pub fn disconnected(&mut self, reason: &str) {
        let was = self.connection_state;
        self.connection_state = ConnectionState::Disconnected;
        self.talk_state = TalkState::Idle;
        self.pending_start = None;
        self.last_audio_received_at = None;
        if was != ConnectionState::Disconnected {
            self.record(format!("Disconnected ({})", reason));
        }
    }

    // ── Talk ───────────────────────────────────────────────────────────

    /// Guard for "press to talk".  On `Ok` the caller sends `start`.
    ///
    /// These are local fast-path rejections; the server's `busy` stays
    /// authoritative for who holds the floor.
    pub fn request_talk(&mut self, permission: MicPermission, now: Instant) -> Result<(), SessionError> {
        if permission == MicPermission::Denied {
            self.record("Microphone permission denied");
            return Err(SessionError::PermissionDenied);
        }
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        if self.is_transmitting() {
            return Err(SessionError::AlreadyTransmitting);
        }
        if self.pending_start.is_some() {
            return Err(SessionError::RequestPending);
        }
        self.pending_start = Some(now);
        self.record("Requesting to talk");
        Ok(())
    }

    /// "Release to stop".
    pub fn release_talk(&mut self) -> ReleaseOutcome {
        if self.is_transmitting() {
            self.talk_state = TalkState::Idle;
            self.record("Stopped transmitting");
            return ReleaseOutcome::StopTransmitting;
        }
        if self.pending_start.take().is_some() {
            self.record("Talk request withdrawn");
            return ReleaseOutcome::CancelPending;
        }
        ReleaseOutcome::NotTalking
    }

    /// Expire an unanswered `start`.  Returns `true` once per expiry.
    pub fn expire_pending(&mut self, now: Instant, reply_timeout: Duration) -> bool {
        match self.pending_start {
            Some(sent) if now.saturating_duration_since(sent) >= reply_timeout => {
                self.pending_start = None;
                self.record("No reply to talk request");
                true
            }
            _ => false,
        }
    }

    pub fn on_control(&mut self, msg: &ControlMessage) -> ControlOutcome {
        match msg {
            ControlMessage::StartAck => {
                if self.pending_start.take().is_none() {
                    if self.is_transmitting() {
                        return ControlOutcome::Unexpected;
                    }
                    self.record("Late talk grant, releasing");
                    return ControlOutcome::StaleGrant;
                }
                self.talk_state = TalkState::Transmitting;
                self.last_audio_received_at = None;
                self.record("Talk granted, transmitting");
                ControlOutcome::StartGranted
            }
            ControlMessage::Busy => {
                if self.pending_start.take().is_none() {
                    return ControlOutcome::Unexpected;
                }
                self.record("Channel busy");
                ControlOutcome::StartRefused
            }
            ControlMessage::StopAck => {
                let was_transmitting = self.is_transmitting();
                if was_transmitting {
                    self.talk_state = TalkState::Idle;
                }
                self.record("Stop acknowledged");
                ControlOutcome::StopConfirmed { was_transmitting }
            }
            ControlMessage::NewChannel(name) => {
                let added = self.known_channels.insert(name);
                if added {
                    self.record(format!("New channel: {}", name));
                }
                ControlOutcome::ChannelAnnounced { name: name.clone(), added }
            }
            ControlMessage::Start | ControlMessage::Stop => ControlOutcome::Unexpected,
        }
    }

    // ── Receive ────────────────────────────────────────────────────────

    /// Inbound audio frame.  Central half-duplex guard.
    pub fn on_audio_frame(&mut self, now: Instant) -> AudioVerdict {
        if self.is_transmitting() {
            return AudioVerdict::Suppress;
        }
        if self.talk_state != TalkState::Receiving {
            self.talk_state = TalkState::Receiving;
            self.record("Receiving audio");
        }
        self.last_audio_received_at = Some(now);
        AudioVerdict::Play
    }

    /// Periodic silence check.  Returns `true` on the Receiving → Idle edge.
    pub fn on_tick(&mut self, now: Instant) -> bool {
        if self.talk_state != TalkState::Receiving {
            return false;
        }
        let silent = match self.last_audio_received_at {
            Some(last) => now.saturating_duration_since(last) >= self.silence_timeout,
            None => true,
        };
        if silent {
            self.talk_state = TalkState::Idle;
            self.last_audio_received_at = None;
            self.record("Reception ended");
        }
        silent
    }

    // ── Channels ───────────────────────────────────────────────────────

    /// Validate a switch target.  `Ok(false)` means it is already selected
    /// and connected, so nothing needs to happen.
    pub fn check_switch(&self, name: &str) -> Result<bool, SessionError> {
        if !self.known_channels.contains(name) {
            return Err(SessionError::UnknownChannel(name.to_string()));
        }
        Ok(!(name == self.selected_channel && self.is_connected()))
    }

    pub fn select_channel(&mut self, name: &str) {
        self.selected_channel = name.to_string();
        self.record(format!("Selected channel {}", name));
    }

    /// Synthesize and locally add a new channel name.
    pub fn create_channel(&mut self) -> String {
        let name = self.known_channels.next_channel_name();
        self.known_channels.insert(&name);
        self.record(format!("Created channel {}", name));
        name
    }

    /// Replace known channels with a directory listing; the selected
    /// channel is always kept.
    pub fn apply_directory(&mut self, names: Vec<String>) {
        self.known_channels.replace(names);
        let selected = self.selected_channel.clone();
        self.known_channels.insert(&selected);
        let count = self.known_channels.len();
        self.record(format!("Channel list updated ({} channels)", count));
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
