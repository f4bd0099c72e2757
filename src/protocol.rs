/// Walkie-talkie control protocol.
///
/// Text frames on the control link carry one UTF-8 token each:
///
/// ```text
///  client → server      server → client
///  ───────────────      ─────────────────────
///  start                start_ack | busy
///  stop                 stop_ack
///  new_channel:<name>   new_channel:<name>   (broadcast, unsolicited)
/// ```
///
/// Binary frames on either link are raw PCM audio (see `pcm`).

use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

pub const TOKEN_START: &str = "start";
pub const TOKEN_STOP: &str = "stop";
pub const TOKEN_START_ACK: &str = "start_ack";
pub const TOKEN_STOP_ACK: &str = "stop_ack";
pub const TOKEN_BUSY: &str = "busy";
pub const NEW_CHANNEL_PREFIX: &str = "new_channel:";

/// Closed set of control messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Request the floor.
    Start,
    /// Release the floor.
    Stop,
    /// Floor granted.
    StartAck,
    /// Release confirmed.
    StopAck,
    /// Someone else holds the floor.
    Busy,
    /// A channel was created (by us or another client).
    NewChannel(String),
}

impl ControlMessage {
    /// Parse one inbound text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let token = text.trim();
        match token {
            TOKEN_START => Ok(ControlMessage::Start),
            TOKEN_STOP => Ok(ControlMessage::Stop),
            TOKEN_START_ACK => Ok(ControlMessage::StartAck),
            TOKEN_STOP_ACK => Ok(ControlMessage::StopAck),
            TOKEN_BUSY => Ok(ControlMessage::Busy),
            _ => {
                if let Some(name) = token.strip_prefix(NEW_CHANNEL_PREFIX) {
                    let name = name.trim();
                    if name.is_empty() {
                        return Err(ProtocolError::EmptyChannelName);
                    }
                    return Ok(ControlMessage::NewChannel(name.to_string()));
                }
                Err(ProtocolError::Unknown(token.to_string()))
            }
        }
    }

    /// `true` for the replies a pending `start` request waits on.
    pub fn answers_start(&self) -> bool {
        matches!(self, ControlMessage::StartAck | ControlMessage::Busy)
    }
}

impl FromStr for ControlMessage {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ControlMessage::parse(s)
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::Start => f.write_str(TOKEN_START),
            ControlMessage::Stop => f.write_str(TOKEN_STOP),
            ControlMessage::StartAck => f.write_str(TOKEN_START_ACK),
            ControlMessage::StopAck => f.write_str(TOKEN_STOP_ACK),
            ControlMessage::Busy => f.write_str(TOKEN_BUSY),
            ControlMessage::NewChannel(name) => write!(f, "{}{}", NEW_CHANNEL_PREFIX, name),
        }
    }
}

/// One classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Control(ControlMessage),
    Audio(Bytes),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_tokens() {
        assert_eq!(ControlMessage::parse("start"), Ok(ControlMessage::Start));
        assert_eq!(ControlMessage::parse("stop"), Ok(ControlMessage::Stop));
        assert_eq!(ControlMessage::parse("start_ack"), Ok(ControlMessage::StartAck));
        assert_eq!(ControlMessage::parse("stop_ack\n"), Ok(ControlMessage::StopAck));
        assert_eq!(ControlMessage::parse(" busy "), Ok(ControlMessage::Busy));
        assert_eq!(
            ControlMessage::parse("new_channel:Channel 3"),
            Ok(ControlMessage::NewChannel("Channel 3".into()))
        );
    }

    #[test]
    fn test_wire_tokens() {
        assert_eq!(ControlMessage::Start.to_string(), "start");
        assert_eq!(ControlMessage::StopAck.to_string(), "stop_ack");
        assert_eq!(ControlMessage::NewChannel("Lobby".into()).to_string(), "new_channel:Lobby");
        let parsed: ControlMessage = "new_channel:Lobby".parse().unwrap();
        assert_eq!(parsed, ControlMessage::NewChannel("Lobby".into()));
    }

    #[test]
    fn test_unknown_and_malformed() {
        assert_eq!(
            ControlMessage::parse("mute_all"),
            Err(ProtocolError::Unknown("mute_all".into()))
        );
        assert_eq!(ControlMessage::parse("START"), Err(ProtocolError::Unknown("START".into())));
        assert_eq!(ControlMessage::parse("new_channel:  "), Err(ProtocolError::EmptyChannelName));
    }

    #[test]
    fn test_answers_start() {
        assert!(ControlMessage::StartAck.answers_start());
        assert!(ControlMessage::Busy.answers_start());
        assert!(!ControlMessage::StopAck.answers_start());
        assert!(!ControlMessage::NewChannel("x".into()).answers_start());
    }
}
