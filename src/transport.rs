/// WebSocket links to the walkie-talkie server.
///
/// ```text
///                    ┌──────────── Link ────────────┐
///  ControlClient ──▶ │ outbound mpsc ─▶ writer task │ ──WS──▶ server
///  AudioTransport ─▶ │                              │
///                    │ reader task (receive loop)   │ ◀──WS── server
///                    └──────────────┬───────────────┘
///                                   ▼
///                       LinkMessage { generation, role, event }
///                                   ▼
///                            session controller
/// ```
///
/// Every link owns exactly one writer task, so concurrent senders (capture
/// frames, control messages, pongs) never interleave on the socket.  The
/// reader task classifies frames (text → `ControlMessage`, binary → audio),
/// re-arms after each one, and reports closure exactly once.

use bytes::Bytes;
use futures_util::{ SinkExt, StreamExt };
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{ debug, error, info, warn };
use url::Url;

use crate::config::Config;
use crate::error::TransportError;
use crate::protocol::{ ControlMessage, InboundFrame };
use crate::stats::Stats;

// ═══════════════════════════════════════════════════════════════════════
//  Events
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Control,
    Audio,
}

impl std::fmt::Display for LinkRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkRole::Control => write!(f, "control"),
            LinkRole::Audio => write!(f, "audio"),
        }
    }
}

#[derive(Debug)]
pub enum LinkEvent {
    Frame(InboundFrame),
    /// The link is gone.  `None` means a clean close from the server.
    Closed(Option<TransportError>),
}

/// Event tagged with the connection generation that produced it, so the
/// controller can ignore stragglers from a torn-down connection.
#[derive(Debug)]
pub struct LinkMessage {
    pub generation: u64,
    pub role: LinkRole,
    pub event: LinkEvent,
}

/// Result of handing an audio frame to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Sent,
    /// Empty frame, not put on the wire.
    Rejected,
}

// ═══════════════════════════════════════════════════════════════════════
//  Link
// ═══════════════════════════════════════════════════════════════════════

/// One WebSocket connection with its writer and reader tasks.
pub struct Link {
    role: LinkRole,
    url: String,
    outbound: mpsc::Sender<Message>,
    reader_handle: tokio::task::JoinHandle<()>,
    writer_handle: tokio::task::JoinHandle<()>,
}

impl Link {
    /// Connect and spawn the writer / reader tasks.
    pub async fn open(
        url: &Url,
        role: LinkRole,
        generation: u64,
        events: mpsc::Sender<LinkMessage>,
        stats: Arc<Stats>,
        connect_timeout: Duration,
        queue_capacity: usize
    ) -> Result<Self, TransportError> {
        let url_str = url.to_string();

        let connect = tokio_tungstenite::connect_async(url_str.as_str());
        let (ws_stream, response) = match tokio::time::timeout(connect_timeout, connect).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                return Err(TransportError::Connect { url: url_str, reason: e.to_string() });
            }
            Err(_) => {
                return Err(TransportError::Connect { url: url_str, reason: "timed out".into() });
            }
        };

        info!(
            link = %role,
            url = %url_str,
            status = %response.status(),
            generation = generation,
            "🔌 link connected"
        );

        let (mut ws_sink, mut ws_reader) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(queue_capacity.max(1));
        let pong_tx = outbound.clone();
        let closed_reported = Arc::new(AtomicBool::new(false));

        // ── Writer task ────────────────────────────────────────────────
        let writer_events = events.clone();
        let writer_reported = closed_reported.clone();
        let writer_stats = stats.clone();
        let writer_handle = tokio::spawn(async move {
            let mut sent: u64 = 0;
            while let Some(msg) = outbound_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = ws_sink.send(msg).await {
                    error!(link = %role, error = %e, "WS send error");
                    writer_stats.record_transport_error();
                    report_closed(
                        &writer_events,
                        &writer_reported,
                        generation,
                        role,
                        Some(TransportError::Send(e.to_string()))
                    ).await;
                    break;
                }
                sent += 1;
                if is_close {
                    break;
                }
            }
            let _ = ws_sink.close().await;
            debug!(link = %role, sent = sent, "writer task exiting");
        });

        // ── Reader task (receive loop) ─────────────────────────────────
        let reader_handle = tokio::spawn(async move {
            debug!(link = %role, "👂 reader task started");
            let mut outcome: Option<TransportError> = None;

            while let Some(msg_result) = ws_reader.next().await {
                let msg = match msg_result {
                    Ok(m) => m,
                    Err(e) => {
                        error!(link = %role, error = %e, "WS read error");
                        stats.record_transport_error();
                        outcome = Some(TransportError::Receive(e.to_string()));
                        break;
                    }
                };

                let frame = match msg {
                    Message::Text(text) => {
                        match ControlMessage::parse(&text) {
                            Ok(control) => {
                                stats.record_control_received();
                                InboundFrame::Control(control)
                            }
                            Err(e) => {
                                warn!(link = %role, error = %e, "ignoring control text");
                                stats.record_protocol_error();
                                continue;
                            }
                        }
                    }
                    Message::Binary(data) => {
                        stats.record_frame_received(data.len());
                        InboundFrame::Audio(Bytes::from(data))
                    }
                    Message::Ping(data) => {
                        let _ = pong_tx.send(Message::Pong(data)).await;
                        continue;
                    }
                    Message::Close(frame) => {
                        info!(link = %role, frame = ?frame, "link closed by server");
                        break;
                    }
                    Message::Pong(_) | Message::Frame(_) => {
                        continue;
                    }
                };

                let delivered = events.send(LinkMessage {
                    generation,
                    role,
                    event: LinkEvent::Frame(frame),
                }).await;
                if delivered.is_err() {
                    debug!(link = %role, "controller gone, reader exiting");
                    return;
                }
            }

            report_closed(&events, &closed_reported, generation, role, outcome).await;
            debug!(link = %role, "reader task exiting");
        });

        Ok(Link {
            role,
            url: url_str,
            outbound,
            reader_handle,
            writer_handle,
        })
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    /// Queue one message on the writer.
    pub async fn send(&self, msg: Message) -> Result<(), TransportError> {
        if self.writer_handle.is_finished() {
            return Err(TransportError::Closed);
        }
        self.outbound.send(msg).await.map_err(|_| TransportError::Closed)
    }

    /// Cancel the receive loop and close the socket.
    ///
    /// The writer flushes what is queued plus a close frame, then drops the
    /// sink; the reader is aborted immediately so no further events arrive.
    pub fn close(self) {
        self.reader_handle.abort();
        if self.outbound.try_send(Message::Close(None)).is_err() {
            self.writer_handle.abort();
        }
        debug!(link = %self.role, url = %self.url, "link closed locally");
    }
}

async fn report_closed(
    events: &mpsc::Sender<LinkMessage>,
    reported: &AtomicBool,
    generation: u64,
    role: LinkRole,
    error: Option<TransportError>
) {
    if reported.swap(true, Ordering::SeqCst) {
        return;
    }
    let _ = events.send(LinkMessage {
        generation,
        role,
        event: LinkEvent::Closed(error),
    }).await;
}

// ═══════════════════════════════════════════════════════════════════════
//  Connection = control link + audio link
// ═══════════════════════════════════════════════════════════════════════

/// The links serving one channel.  With a shared link, audio frames travel
/// over the control link.
pub struct Connection {
    pub generation: u64,
    pub channel: String,
    control: Link,
    audio: Option<Link>,
    stats: Arc<Stats>,
}

impl Connection {
    /// Open the control link, then (unless shared) the audio link.
    pub async fn open(
        config: &Config,
        channel: &str,
        generation: u64,
        events: mpsc::Sender<LinkMessage>,
        stats: Arc<Stats>
    ) -> Result<Self, TransportError> {
        let control_url = config
            .control_url(channel)
            .map_err(|e| TransportError::Endpoint(e.to_string()))?;

        let control = Link::open(
            &control_url,
            LinkRole::Control,
            generation,
            events.clone(),
            stats.clone(),
            config.connect_timeout(),
            config.channel_capacity
        ).await?;

        let audio = if config.shared_link {
            None
        } else {
            let audio_url = match config.audio_url(channel) {
                Ok(url) => url,
                Err(e) => {
                    control.close();
                    return Err(TransportError::Endpoint(e.to_string()));
                }
            };
            match
                Link::open(
                    &audio_url,
                    LinkRole::Audio,
                    generation,
                    events,
                    stats.clone(),
                    config.connect_timeout(),
                    config.channel_capacity
                ).await
            {
                Ok(link) => Some(link),
                Err(e) => {
                    control.close();
                    return Err(e);
                }
            }
        };

        Ok(Connection {
            generation,
            channel: channel.to_string(),
            control,
            audio,
            stats,
        })
    }

    pub fn control(&self) -> ControlClient<'_> {
        ControlClient { link: &self.control, stats: &self.stats }
    }

    pub fn audio(&self) -> AudioTransport<'_> {
        AudioTransport {
            link: self.audio.as_ref().unwrap_or(&self.control),
            stats: &self.stats,
        }
    }

    pub fn close(self) {
        if let Some(audio) = self.audio {
            audio.close();
        }
        self.control.close();
        info!(channel = %self.channel, generation = self.generation, "connection closed");
    }
}

/// Sends control tokens on the control link.  No internal retry.
pub struct ControlClient<'a> {
    link: &'a Link,
    stats: &'a Stats,
}

impl ControlClient<'_> {
    pub async fn send(&self, msg: &ControlMessage) -> Result<(), TransportError> {
        self.link.send(Message::Text(msg.to_string())).await?;
        self.stats.record_control_sent();
        debug!(msg = %msg, "control message sent");
        Ok(())
    }
}

/// Sends binary PCM frames on the audio link.
pub struct AudioTransport<'a> {
    link: &'a Link,
    stats: &'a Stats,
}

impl AudioTransport<'_> {
    pub async fn send_frame(&self, frame: Bytes) -> Result<FrameOutcome, TransportError> {
        if frame.is_empty() {
            debug!(link = %self.link.role(), "empty audio frame rejected");
            self.stats.record_frame_rejected();
            return Ok(FrameOutcome::Rejected);
        }
        let len = frame.len();
        self.link.send(Message::Binary(frame.to_vec())).await?;
        self.stats.record_frame_sent(len);
        Ok(FrameOutcome::Sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(3);

    /// Accept one WebSocket client and forward everything it sends.
    async fn recording_server() -> (SocketAddr, mpsc::UnboundedReceiver<Message>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if tx.send(msg).is_err() {
                    break;
                }
            }
        });
        (addr, rx)
    }

    /// Complete the handshake, then drop the socket without a close frame.
    async fn vanishing_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            drop(ws);
        });
        addr
    }

    fn shared_link_config(addr: SocketAddr) -> Config {
        Config::parse_from(["walkie", "--host", &addr.to_string(), "--shared-link"])
    }

    #[tokio::test]
    async fn test_empty_audio_frame_never_reaches_the_wire() {
        let (addr, mut received) = recording_server().await;
        let (events, _events_rx) = mpsc::channel(16);
        let stats = Stats::new();
        let conn = Connection::open(&shared_link_config(addr), "Default", 1, events, stats.clone()).await.unwrap();

        let outcome = conn.audio().send_frame(Bytes::new()).await.unwrap();
        assert_eq!(outcome, FrameOutcome::Rejected);
        assert_eq!(stats.frames_rejected.load(Ordering::Relaxed), 1);

        conn.control().send(&ControlMessage::Start).await.unwrap();
        let first = tokio::time::timeout(WAIT, received.recv()).await.unwrap().unwrap();
        assert_eq!(first, Message::Text("start".into()));

        let outcome = conn.audio().send_frame(Bytes::from_static(&[1, 0, 2, 0])).await.unwrap();
        assert_eq!(outcome, FrameOutcome::Sent);
        let second = tokio::time::timeout(WAIT, received.recv()).await.unwrap().unwrap();
        assert_eq!(second, Message::Binary(vec![1, 0, 2, 0]));

        conn.close();
    }

    #[tokio::test]
    async fn test_closure_reported_once_when_reader_and_writer_fail() {
        let addr = vanishing_server().await;
        let url = Url::parse(&format!("ws://{}/ws/control", addr)).unwrap();
        let (events, mut events_rx) = mpsc::channel(16);
        let link = Link::open(&url, LinkRole::Control, 7, events, Stats::new(), WAIT, 16).await.unwrap();

        let first = tokio::time::timeout(WAIT, events_rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.generation, 7);
        assert_eq!(first.role, LinkRole::Control);
        assert!(matches!(first.event, LinkEvent::Closed(_)));

        // push the writer into its own failure path
        for _ in 0..5 {
            let _ = link.send(Message::Text("stop".into())).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        match tokio::time::timeout(Duration::from_millis(300), events_rx.recv()).await {
            Err(_) | Ok(None) => {}
            Ok(Some(extra)) => panic!("closure reported twice: {:?}", extra),
        }
        link.close();
    }

    #[tokio::test]
    async fn test_server_close_frame_reports_clean_closure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text("busy".into())).await.unwrap();
            let _ = ws.close(None).await;
        });

        let url = Url::parse(&format!("ws://{}/ws/control", addr)).unwrap();
        let (events, mut events_rx) = mpsc::channel(16);
        let link = Link::open(&url, LinkRole::Control, 1, events, Stats::new(), WAIT, 16).await.unwrap();

        let frame = tokio::time::timeout(WAIT, events_rx.recv()).await.unwrap().unwrap();
        assert!(matches!(frame.event, LinkEvent::Frame(InboundFrame::Control(ControlMessage::Busy))));
        let closed = tokio::time::timeout(WAIT, events_rx.recv()).await.unwrap().unwrap();
        assert!(matches!(closed.event, LinkEvent::Closed(None)));
        link.close();
    }
}
