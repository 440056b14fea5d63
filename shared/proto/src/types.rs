use bytes::Bytes;

/// Record kinds shared by client and server.
///
/// Wire values are fixed; both sides consume this enumeration. Tags 1..=12
/// predate the web bridge, 13..=17 were assigned when ChatMedia, WebFrame,
/// MediaControl and Ping/Pong were added.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    LoginRequest = 1,
    LoginResponse = 2,
    ChatMessage = 3,
    /// Legacy TCP voice path; the UDP SFU supersedes it.
    VoiceChunk = 4,
    LogoutRequest = 5,
    HistoryRequest = 6,
    HistoryResponse = 7,
    UsersListRequest = 8,
    UsersListResponse = 9,
    /// Payload: u32 BE frame id, then codec bytes. Frame id 0 carries codec
    /// config, 0xFFFFFFFE is an explicit stop, 0xFFFFFFFF a presence beacon;
    /// an empty payload also signals stop.
    ScreenFrame = 10,
    /// Payload: u32 BE seq, i64 BE timestamp, then 48 kHz 16-bit stereo PCM.
    StreamAudio = 11,
    /// Payload: JSON `{"voicePort": int, "videoPort": int}`.
    UdpPortsAnnouncement = 12,
    ChatMedia = 13,
    /// JPEG snapshot feeding the web bridge; never fanned out over TCP.
    WebFrame = 14,
    /// Payload: JSON `{"kind": string, "state": "start"|"stop"}`; the frame
    /// sender field names the producing user.
    MediaControl = 15,
    Ping = 16,
    Pong = 17,
    Error = 255,
}

impl MessageType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::LoginRequest,
            2 => Self::LoginResponse,
            3 => Self::ChatMessage,
            4 => Self::VoiceChunk,
            5 => Self::LogoutRequest,
            6 => Self::HistoryRequest,
            7 => Self::HistoryResponse,
            8 => Self::UsersListRequest,
            9 => Self::UsersListResponse,
            10 => Self::ScreenFrame,
            11 => Self::StreamAudio,
            12 => Self::UdpPortsAnnouncement,
            13 => Self::ChatMedia,
            14 => Self::WebFrame,
            15 => Self::MediaControl,
            16 => Self::Ping,
            17 => Self::Pong,
            255 => Self::Error,
            _ => return None,
        })
    }
}

/// One decoded control record.
///
/// `kind` is kept as the raw tag so that a structurally valid frame with an
/// unknown tag still decodes; the dispatcher answers those with an error
/// record instead of dropping the connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub kind: u8,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub payload: Option<Bytes>,
    pub timestamp_ms: i64,
}

impl Message {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind: kind as u8,
            sender: None,
            recipient: None,
            payload: None,
            timestamp_ms: 0,
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u8(self.kind)
    }

    /// Payload bytes, treating a null payload as empty.
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or(&[])
    }

    /// Payload interpreted as UTF-8 text, replacing invalid sequences.
    pub fn text_payload(&self) -> String {
        String::from_utf8_lossy(self.payload_bytes()).into_owned()
    }
}
