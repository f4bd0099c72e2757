use thiserror::Error;

/// Failure on a control or audio link.  Never retried internally; the
/// controller marks the connection down and waits for the next intent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("invalid endpoint: {0}")]
    Endpoint(String),
    #[error("link closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
}

/// Unexpected or malformed control text.  Logged and ignored.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown control message: {0:?}")]
    Unknown(String),
    #[error("new_channel announcement without a name")]
    EmptyChannelName,
}

/// Capture or playback device failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioDeviceError {
    #[error("audio device failed to start: {0}")]
    Start(String),
    #[error("audio device write failed: {0}")]
    Write(String),
}

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("channel directory request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum MailboxError {
    #[error("voice mailbox request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("voice message not found: {0}")]
    NotFound(String),
    #[error("not a plain file name: {0:?}")]
    InvalidName(String),
    #[error("voice message WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("voice message I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("recorded take is empty")]
    EmptyTake,
    #[error(transparent)]
    AudioDevice(#[from] AudioDeviceError),
}

/// Errors surfaced to callers of the session controller.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("channel busy: another client is talking")]
    Busy,
    #[error("not connected")]
    NotConnected,
    #[error("already transmitting")]
    AlreadyTransmitting,
    #[error("a talk request is already pending")]
    RequestPending,
    #[error("no reply to start request")]
    ReplyTimeout,
    #[error("talk request withdrawn before it was granted")]
    Withdrawn,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    AudioDevice(#[from] AudioDeviceError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("session controller is not running")]
    ControllerGone,
}
