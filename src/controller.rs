/// Session controller: the single writer of the `Session`.
///
/// Every input is a message into one task:
///
/// ```text
///  SessionHandle ──Command──────┐
///  Link readers  ──LinkMessage──┤
///  capture device ─SampleBuffer─┼──▶ select! loop ──▶ Session (state machine)
///  silence tick  ──Instant──────┤          │
///  directory fetch ─Internal────┘          ├──▶ ControlClient / AudioTransport
///                                          ├──▶ CaptureDevice / PlaybackSink
///                                          └──▶ watch<SessionSnapshot>
/// ```
///
/// Connection transitions (connect, disconnect, channel switch) are awaited
/// inline on this task, so at most one is ever in flight.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{ mpsc, oneshot, watch };
use tokio::time::{ interval, MissedTickBehavior };
use tracing::{ debug, info, warn };

use crate::config::Config;
use crate::device::{ CaptureDevice, PlaybackSink };
use crate::directory::DirectoryClient;
use crate::error::{ DirectoryError, SessionError, TransportError };
use crate::pcm::{ self, AudioFormat, SampleBuffer };
use crate::protocol::{ ControlMessage, InboundFrame };
use crate::session::{ AudioVerdict, ControlOutcome, ReleaseOutcome, Session, SessionSnapshot };
use crate::stats::Stats;
use crate::transport::{ Connection, LinkEvent, LinkMessage };

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    Connect(Reply<()>),
    Disconnect(Reply<()>),
    PressTalk(Reply<()>),
    ReleaseTalk(Reply<()>),
    SwitchChannel(String, Reply<()>),
    CreateChannel(Reply<String>),
    RefreshDirectory(Reply<Vec<String>>),
    EnteredBackground,
    BecameActive,
    AudioInterrupted,
    AudioInterruptionEnded,
    Log(oneshot::Sender<Vec<String>>),
    Shutdown,
}

/// Results of work spawned off the controller task.
enum Internal {
    Directory(Result<Vec<String>, DirectoryError>, Reply<Vec<String>>),
}

// ═══════════════════════════════════════════════════════════════════════
//  Handle
// ═══════════════════════════════════════════════════════════════════════

/// Cheap, clonable front door to the controller task.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.request(Command::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(Command::Disconnect).await
    }

    /// Ask for the floor.  Resolves when the server answers: `Ok` on
    /// `start_ack` (capture is live), `Err(Busy)` on `busy`.
    pub async fn press_talk(&self) -> Result<(), SessionError> {
        self.request(Command::PressTalk).await
    }

    pub async fn release_talk(&self) -> Result<(), SessionError> {
        self.request(Command::ReleaseTalk).await
    }

    pub async fn switch_channel(&self, name: &str) -> Result<(), SessionError> {
        let name = name.to_string();
        self.request(|reply| Command::SwitchChannel(name, reply)).await
    }

    /// Create a channel; it is visible locally before the server echoes it.
    pub async fn create_channel(&self) -> Result<String, SessionError> {
        self.request(Command::CreateChannel).await
    }

    pub async fn refresh_directory(&self) -> Result<Vec<String>, SessionError> {
        self.request(Command::RefreshDirectory).await
    }

    pub fn entered_background(&self) {
        let _ = self.commands.send(Command::EnteredBackground);
    }

    pub fn became_active(&self) {
        let _ = self.commands.send(Command::BecameActive);
    }

    pub fn audio_interrupted(&self) {
        let _ = self.commands.send(Command::AudioInterrupted);
    }

    pub fn audio_interruption_ended(&self) {
        let _ = self.commands.send(Command::AudioInterruptionEnded);
    }

    pub async fn log(&self) -> Result<Vec<String>, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Log(tx)).map_err(|_| SessionError::ControllerGone)?;
        rx.await.map_err(|_| SessionError::ControllerGone)
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| SessionError::ControllerGone)?;
        rx.await.map_err(|_| SessionError::ControllerGone)?
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Controller task
// ═══════════════════════════════════════════════════════════════════════

pub struct SessionController {
    config: Config,
    format: AudioFormat,
    session: Session,
    connection: Option<Connection>,
    generation: u64,
    capture: Box<dyn CaptureDevice>,
    playback: Box<dyn PlaybackSink>,
    directory: DirectoryClient,
    stats: Arc<Stats>,
    /// Caller waiting on the outstanding `start`.
    pending_reply: Option<Reply<()>>,
    link_tx: mpsc::Sender<LinkMessage>,
    link_rx: mpsc::Receiver<LinkMessage>,
    capture_tx: mpsc::Sender<SampleBuffer>,
    capture_rx: mpsc::Receiver<SampleBuffer>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    state_tx: watch::Sender<SessionSnapshot>,
}

impl SessionController {
    /// Spawn the controller task and return its handle.
    pub fn spawn(
        config: Config,
        capture: Box<dyn CaptureDevice>,
        playback: Box<dyn PlaybackSink>,
        directory: DirectoryClient,
        stats: Arc<Stats>
    ) -> (SessionHandle, tokio::task::JoinHandle<()>) {
        let session = Session::new(&config.initial_channel(), config.silence_timeout());
        let (state_tx, state_rx) = watch::channel(session.snapshot());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let capacity = config.channel_capacity.max(1);
        let (link_tx, link_rx) = mpsc::channel(capacity);
        let (capture_tx, capture_rx) = mpsc::channel(capacity);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let controller = SessionController {
            format: config.audio_format(),
            config,
            session,
            connection: None,
            generation: 0,
            capture,
            playback,
            directory,
            stats,
            pending_reply: None,
            link_tx,
            link_rx,
            capture_tx,
            capture_rx,
            internal_tx,
            internal_rx,
            state_tx,
        };

        let handle = tokio::spawn(controller.run(command_rx));
        (SessionHandle { commands: command_tx, state: state_rx }, handle)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut silence_tick = interval(self.config.silence_tick());
        silence_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(channel = %self.session.selected_channel, "🎛️  session controller started");

        loop {
            tokio::select! {
                maybe_cmd = commands.recv() => {
                    match maybe_cmd {
                        None | Some(Command::Shutdown) => break,
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }
                Some(msg) = self.link_rx.recv() => {
                    self.handle_link(msg).await;
                }
                Some(buffer) = self.capture_rx.recv() => {
                    self.handle_capture(buffer).await;
                }
                Some(internal) = self.internal_rx.recv() => {
                    self.handle_internal(internal);
                }
                _ = silence_tick.tick() => {
                    self.handle_tick(Instant::now());
                }
            }
            self.publish();
        }

        self.disconnect("shutdown");
        self.publish();
        info!("session controller stopped");
    }

    fn publish(&self) {
        let snapshot = self.session.snapshot();
        self.state_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    // ── Commands ───────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(reply) => {
                let result = self.connect().await;
                let _ = reply.send(result);
            }
            Command::Disconnect(reply) => {
                self.disconnect("requested");
                let _ = reply.send(Ok(()));
            }
            Command::PressTalk(reply) => self.press_talk(reply).await,
            Command::ReleaseTalk(reply) => {
                let result = self.stop_talking().await;
                let _ = reply.send(result);
            }
            Command::SwitchChannel(name, reply) => {
                let result = self.switch_channel(&name).await;
                let _ = reply.send(result);
            }
            Command::CreateChannel(reply) => {
                let name = self.create_channel().await;
                let _ = reply.send(Ok(name));
            }
            Command::RefreshDirectory(reply) => self.refresh_directory(reply),
            Command::EnteredBackground => {
                self.session.record("Entered background");
                self.disconnect("background");
            }
            Command::BecameActive => {
                if self.session.is_connected() {
                    debug!("became active, already connected");
                } else if let Err(e) = self.connect().await {
                    warn!(error = %e, "reconnect on activation failed");
                }
            }
            Command::AudioInterrupted => {
                self.session.record("Audio session interrupted");
                if let Err(e) = self.stop_talking().await {
                    warn!(error = %e, "stop on interruption failed");
                }
                self.playback.stop();
            }
            Command::AudioInterruptionEnded => {
                self.session.record("Audio session resumed");
                if self.session.is_connected() {
                    self.ensure_playback();
                }
            }
            Command::Log(reply) => {
                let _ = reply.send(self.session.log().to_vec());
            }
            Command::Shutdown => {}
        }
    }

    async fn connect(&mut self) -> Result<(), SessionError> {
        if self.connection.is_some() && self.session.is_connected() {
            return Ok(());
        }

        self.session.begin_connecting();
        self.publish();
        self.generation += 1;
        let channel = self.session.selected_channel.clone();

        let opened = Connection::open(
            &self.config,
            &channel,
            self.generation,
            self.link_tx.clone(),
            self.stats.clone()
        ).await;

        match opened {
            Ok(connection) => {
                self.connection = Some(connection);
                self.session.connected();
                self.ensure_playback();
                Ok(())
            }
            Err(e) => {
                self.stats.record_transport_error();
                self.session.disconnected(&e.to_string());
                Err(e.into())
            }
        }
    }

    /// Tear everything down: capture off, links closed, playback stopped,
    /// any waiting talk request answered.
    fn disconnect(&mut self, reason: &str) {
        self.stop_capture();
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        self.playback.stop();
        self.fail_pending(SessionError::NotConnected);
        self.session.disconnected(reason);
    }

    fn link_failed(&mut self, error: TransportError) {
        self.stats.record_transport_error();
        warn!(error = %error, "link failure, marking connection down");
        self.disconnect(&error.to_string());
    }

    async fn press_talk(&mut self, reply: Reply<()>) {
        let permission = self.capture.permission();
        if let Err(e) = self.session.request_talk(permission, Instant::now()) {
            let _ = reply.send(Err(e));
            return;
        }

        match self.send_control(ControlMessage::Start).await {
            Ok(()) => {
                self.pending_reply = Some(reply);
            }
            Err(e) => {
                self.session.release_talk();
                let _ = reply.send(Err(e.clone().into()));
                self.link_failed(e);
            }
        }
    }

    async fn stop_talking(&mut self) -> Result<(), SessionError> {
        match self.session.release_talk() {
            ReleaseOutcome::StopTransmitting => {
                self.stop_capture();
            }
            ReleaseOutcome::CancelPending => {
                self.fail_pending(SessionError::Withdrawn);
            }
            ReleaseOutcome::NotTalking => {
                return Ok(());
            }
        }

        if let Err(e) = self.send_control(ControlMessage::Stop).await {
            self.link_failed(e.clone());
            return Err(e.into());
        }
        Ok(())
    }

    async fn switch_channel(&mut self, name: &str) -> Result<(), SessionError> {
        if !self.session.check_switch(name)? {
            return Ok(());
        }
        self.disconnect("switching channel");
        self.session.select_channel(name);
        self.connect().await
    }

    async fn create_channel(&mut self) -> String {
        let name = self.session.create_channel();
        if self.session.is_connected() {
            if let Err(e) = self.send_control(ControlMessage::NewChannel(name.clone())).await {
                self.link_failed(e);
            }
        }
        name
    }

    fn refresh_directory(&mut self, reply: Reply<Vec<String>>) {
        let client = self.directory.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = client.fetch().await;
            let _ = tx.send(Internal::Directory(result, reply));
        });
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Directory(Ok(names), reply) => {
                self.session.apply_directory(names);
                let _ = reply.send(Ok(self.session.known_channels.names()));
            }
            Internal::Directory(Err(e), reply) => {
                warn!(error = %e, "channel directory refresh failed");
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    // ── Link events ────────────────────────────────────────────────────

    async fn handle_link(&mut self, msg: LinkMessage) {
        if msg.generation != self.generation || self.connection.is_none() {
            debug!(generation = msg.generation, link = %msg.role, "dropping event from stale link");
            return;
        }

        match msg.event {
            LinkEvent::Frame(InboundFrame::Control(control)) => self.handle_control(control).await,
            LinkEvent::Frame(InboundFrame::Audio(frame)) => self.handle_audio(frame),
            LinkEvent::Closed(None) => {
                self.disconnect(&format!("{} link closed by server", msg.role));
            }
            LinkEvent::Closed(Some(e)) => self.link_failed(e),
        }
    }

    async fn handle_control(&mut self, msg: ControlMessage) {
        debug!(msg = %msg, "control message received");
        match self.session.on_control(&msg) {
            ControlOutcome::StartGranted => {
                match self.start_capture() {
                    Ok(()) => {
                        self.answer_pending(Ok(()));
                    }
                    Err(e) => {
                        // floor was granted but we cannot talk; give it back
                        self.session.release_talk();
                        self.answer_pending(Err(e));
                        if let Err(e) = self.send_control(ControlMessage::Stop).await {
                            self.link_failed(e);
                        }
                    }
                }
            }
            ControlOutcome::StartRefused => {
                self.answer_pending(Err(SessionError::Busy));
            }
            ControlOutcome::StopConfirmed { was_transmitting } => {
                if was_transmitting {
                    self.stop_capture();
                }
            }
            ControlOutcome::ChannelAnnounced { name, added } => {
                debug!(channel = %name, added = added, "channel announcement merged");
            }
            ControlOutcome::StaleGrant => {
                warn!("talk granted after the request was given up, releasing floor");
                if let Err(e) = self.send_control(ControlMessage::Stop).await {
                    self.link_failed(e);
                }
            }
            ControlOutcome::Unexpected if msg.answers_start() => {
                self.stats.record_protocol_error();
                warn!(msg = %msg, talk = %self.session.talk_state, "reply with no talk request pending, ignored");
            }
            ControlOutcome::Unexpected => {
                self.stats.record_protocol_error();
                warn!(msg = %msg, "client-side token from server, ignored");
            }
        }
    }

    fn handle_audio(&mut self, frame: Bytes) {
        match self.session.on_audio_frame(Instant::now()) {
            AudioVerdict::Suppress => {
                self.stats.record_frame_suppressed();
                debug!(bytes = frame.len(), "transmitting, inbound frame dropped");
            }
            AudioVerdict::Play => {
                let samples = pcm::decode(&frame, &self.format);
                if samples.is_empty() {
                    return;
                }
                self.ensure_playback();
                if !self.playback.is_running() {
                    return;
                }
                let level = pcm::rms(&samples);
                if let Err(e) = self.playback.schedule(samples) {
                    warn!(error = %e, "playback schedule failed");
                    return;
                }
                debug!(bytes = frame.len(), rms = format!("{:.3}", level), "received and played audio");
            }
        }
    }

    // ── Capture ────────────────────────────────────────────────────────

    async fn handle_capture(&mut self, buffer: SampleBuffer) {
        if !self.session.is_transmitting() {
            debug!(samples = buffer.len(), "capture buffer after stop, dropped");
            return;
        }
        let Some(connection) = self.connection.as_ref() else {
            return;
        };

        let wire = Bytes::from(pcm::encode(&buffer, &self.format));
        let len = wire.len();
        let sent = connection.audio().send_frame(wire).await;
        match sent {
            Ok(outcome) => {
                debug!(bytes = len, outcome = ?outcome, "captured audio frame");
            }
            Err(e) => self.link_failed(e),
        }
    }

    fn start_capture(&mut self) -> Result<(), SessionError> {
        // buffers left over from an earlier transmission
        while self.capture_rx.try_recv().is_ok() {}
        self.capture.start(self.capture_tx.clone()).map_err(|e| {
            self.session.record(format!("Capture failed: {}", e));
            SessionError::from(e)
        })
    }

    fn stop_capture(&mut self) {
        if self.capture.is_running() {
            self.capture.stop();
        }
    }

    // ── Playback ───────────────────────────────────────────────────────

    /// Start playback if it is not running.  Failure leaves playback
    /// paused; the next received frame tries again.
    fn ensure_playback(&mut self) {
        if self.playback.is_running() {
            return;
        }
        if let Err(e) = self.playback.start() {
            warn!(error = %e, "playback unavailable, starting paused");
        }
    }

    // ── Timers ─────────────────────────────────────────────────────────

    fn handle_tick(&mut self, now: Instant) {
        self.session.on_tick(now);
        if self.session.expire_pending(now, self.config.reply_timeout()) {
            self.answer_pending(Err(SessionError::ReplyTimeout));
        }
    }

    // ── Helpers ────────────────────────────────────────────────────────

    async fn send_control(&mut self, msg: ControlMessage) -> Result<(), TransportError> {
        let Some(connection) = self.connection.as_ref() else {
            return Err(TransportError::Closed);
        };
        connection.control().send(&msg).await
    }

    fn answer_pending(&mut self, result: Result<(), SessionError>) {
        if let Some(reply) = self.pending_reply.take() {
            let _ = reply.send(result);
        }
    }

    fn fail_pending(&mut self, error: SessionError) {
        self.answer_pending(Err(error));
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
