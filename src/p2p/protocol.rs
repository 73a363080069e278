//! Wire formats for discovery and catalog exchange
//!
//! Discovery datagrams are a single ASCII line,
//! `replicationbroadcast:<identifier>:<exchange port>`.
//! Catalog exchange frames are one JSON object terminated by a newline; a
//! connection carries exactly one request and at most one response.

use super::P2PError;
use crate::catalog::FileRecord;
use crate::identity::NodeIdentifier;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Well-known UDP port for announcements
pub const DISCOVERY_PORT: u16 = 13582;

/// Default TCP port for catalog exchange
pub const DEFAULT_EXCHANGE_PORT: u16 = 13583;

/// First field of every announcement, separates our traffic from other broadcast noise
pub const MESSAGE_PREFIX: &str = "replicationbroadcast";

pub const FIELD_SEPARATOR: char = ':';

/// Largest announcement we accept; anything longer is treated as garbage
pub const MAX_DATAGRAM_BYTES: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnnouncementError {
    #[error("Datagram exceeds {} bytes", MAX_DATAGRAM_BYTES)]
    Oversized,

    #[error("Datagram is not valid UTF-8")]
    NotUtf8,

    #[error("Expected 3 fields, found {0}")]
    WrongFieldCount(usize),

    #[error("Unknown prefix")]
    ForeignPrefix,

    #[error("Invalid exchange port {0:?}")]
    InvalidPort(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
}

impl AnnouncementError {
    /// Traffic that simply isn't ours. Shared broadcast ports see plenty of it.
    pub fn is_noise(&self) -> bool {
        matches!(
            self,
            AnnouncementError::ForeignPrefix | AnnouncementError::WrongFieldCount(_)
        )
    }
}

/// Presence announcement carried by one discovery datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub identifier: NodeIdentifier,
    pub exchange_port: u16,
}

impl Announcement {
    pub fn new(identifier: NodeIdentifier, exchange_port: u16) -> Self {
        Self {
            identifier,
            exchange_port,
        }
    }

    /// Render the datagram payload
    pub fn encode(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            MESSAGE_PREFIX,
            self.identifier,
            self.exchange_port,
            sep = FIELD_SEPARATOR
        )
    }

    /// Validate and decode a received datagram
    pub fn parse(datagram: &[u8]) -> Result<Self, AnnouncementError> {
        if datagram.len() > MAX_DATAGRAM_BYTES {
            return Err(AnnouncementError::Oversized);
        }
        let text = std::str::from_utf8(datagram).map_err(|_| AnnouncementError::NotUtf8)?;
        let text = text.trim_end_matches(['\r', '\n']);

        let fields: Vec<&str> = text.split(FIELD_SEPARATOR).collect();
        if fields.len() != 3 {
            return Err(AnnouncementError::WrongFieldCount(fields.len()));
        }
        if fields[0] != MESSAGE_PREFIX {
            return Err(AnnouncementError::ForeignPrefix);
        }

        let exchange_port = match fields[2].parse::<u16>() {
            Ok(port) if port > 0 => port,
            _ => return Err(AnnouncementError::InvalidPort(fields[2].to_string())),
        };
        let identifier = NodeIdentifier::parse(fields[1])
            .map_err(|e| AnnouncementError::InvalidIdentifier(e.to_string()))?;

        Ok(Self {
            identifier,
            exchange_port,
        })
    }
}

/// Actions a peer may ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogAction {
    GetFileList,
}

impl CatalogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogAction::GetFileList => "get_file_list",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "get_file_list" => Some(CatalogAction::GetFileList),
            _ => None,
        }
    }
}

/// Request sent by the pulling side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRequest {
    /// Identifier of the requesting node
    pub identifier: String,

    /// Raw action string, see [`CatalogAction`]
    pub action: String,
}

impl CatalogRequest {
    pub fn get_file_list(identifier: &NodeIdentifier) -> Self {
        Self {
            identifier: identifier.to_string(),
            action: CatalogAction::GetFileList.as_str().to_string(),
        }
    }

    /// Recognized action, `None` for anything we don't serve
    pub fn action(&self) -> Option<CatalogAction> {
        CatalogAction::from_wire(&self.action)
    }
}

/// Catalog snapshot returned by the serving side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogResponse {
    /// Identifier of the serving node
    pub identifier: String,

    /// Catalog, ordered as the provider produced it
    pub files: Vec<FileRecord>,

    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
}

impl CatalogResponse {
    pub fn new(identifier: &NodeIdentifier, files: Vec<FileRecord>) -> Self {
        Self {
            identifier: identifier.to_string(),
            files,
            timestamp: Utc::now(),
        }
    }
}

/// Write one newline-terminated JSON frame
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), P2PError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one JSON frame of at most `max_bytes`, not counting the newline.
///
/// A frame ends at the first newline or at end of stream. A stream that ends
/// before yielding a single byte is reported as [`P2PError::ConnectionClosed`].
pub async fn read_frame<R, T>(reader: R, max_bytes: usize) -> Result<T, P2PError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut limited = BufReader::new(reader.take(max_bytes as u64 + 1));
    let mut buf = Vec::new();

    let read = limited.read_until(b'\n', &mut buf).await?;
    if read == 0 {
        return Err(P2PError::ConnectionClosed);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.len() > max_bytes {
        return Err(P2PError::Protocol(format!(
            "frame exceeds {} bytes",
            max_bytes
        )));
    }

    Ok(serde_json::from_slice(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeIdentifier {
        NodeIdentifier::parse(s).unwrap()
    }

    #[test]
    fn test_announcement_format() {
        let msg = Announcement::new(id("8674665223082153551"), 13583).encode();
        assert_eq!(msg, "replicationbroadcast:8674665223082153551:13583");

        let parsed = Announcement::parse(msg.as_bytes()).unwrap();
        assert_eq!(parsed.identifier, id("8674665223082153551"));
        assert_eq!(parsed.exchange_port, 13583);
    }

    #[test]
    fn test_announcement_rejects_garbage() {
        assert_eq!(
            Announcement::parse(b"replicationbroadcast:abc"),
            Err(AnnouncementError::WrongFieldCount(2))
        );
        assert_eq!(
            Announcement::parse(b"replicationbroadcast:a:1:2"),
            Err(AnnouncementError::WrongFieldCount(4))
        );
        assert_eq!(
            Announcement::parse(b"someoneelse:abc:13583"),
            Err(AnnouncementError::ForeignPrefix)
        );
        assert!(matches!(
            Announcement::parse(b"replicationbroadcast:abc:port"),
            Err(AnnouncementError::InvalidPort(_))
        ));
        assert!(matches!(
            Announcement::parse(b"replicationbroadcast:abc:0"),
            Err(AnnouncementError::InvalidPort(_))
        ));
        assert!(matches!(
            Announcement::parse(b"replicationbroadcast:abc:-5"),
            Err(AnnouncementError::InvalidPort(_))
        ));
        assert!(matches!(
            Announcement::parse(b"replicationbroadcast:abc:70000"),
            Err(AnnouncementError::InvalidPort(_))
        ));
        assert!(matches!(
            Announcement::parse(b"replicationbroadcast::13583"),
            Err(AnnouncementError::InvalidIdentifier(_))
        ));
        assert_eq!(
            Announcement::parse(&[0xff, 0xfe, b':', b'a']),
            Err(AnnouncementError::NotUtf8)
        );

        let mut oversized = b"replicationbroadcast:abc:13583".to_vec();
        oversized.resize(MAX_DATAGRAM_BYTES + 1, b'0');
        assert_eq!(
            Announcement::parse(&oversized),
            Err(AnnouncementError::Oversized)
        );
    }

    #[test]
    fn test_noise_classification() {
        assert!(AnnouncementError::ForeignPrefix.is_noise());
        assert!(AnnouncementError::WrongFieldCount(1).is_noise());
        assert!(!AnnouncementError::InvalidPort("x".into()).is_noise());
    }

    #[test]
    fn test_request_json_shape() {
        let request = CatalogRequest::get_file_list(&id("abc"));
        let json = serde_json::to_string(&request).unwrap();

        assert_eq!(json, r#"{"identifier":"abc","action":"get_file_list"}"#);
        assert_eq!(request.action(), Some(CatalogAction::GetFileList));

        let other: CatalogRequest =
            serde_json::from_str(r#"{"identifier":"x","action":"delete_everything"}"#).unwrap();
        assert_eq!(other.action(), None);
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let request = CatalogRequest::get_file_list(&id("abc"));
        let mut wire = Vec::new();
        write_frame(&mut wire, &request).await.unwrap();

        assert_eq!(wire.last(), Some(&b'\n'));

        let decoded: CatalogRequest = read_frame(wire.as_slice(), 1024).await.unwrap();
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn test_frame_without_newline() {
        let wire = br#"{"identifier":"abc","action":"get_file_list"}"#;
        let decoded: CatalogRequest = read_frame(&wire[..], 1024).await.unwrap();

        assert_eq!(decoded.identifier, "abc");
    }

    #[tokio::test]
    async fn test_frame_empty_stream_is_closed() {
        let result: Result<CatalogRequest, _> = read_frame(&b""[..], 1024).await;
        assert!(matches!(result, Err(P2PError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_frame_too_large() {
        let wire = vec![b'a'; 100];
        let result: Result<CatalogRequest, _> = read_frame(wire.as_slice(), 10).await;
        assert!(matches!(result, Err(P2PError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_frame_limit_excludes_newline() {
        // 16-byte JSON string body
        let exact = b"\"aaaaaaaaaaaaaa\"\n";
        let decoded: String = read_frame(&exact[..], 16).await.unwrap();
        assert_eq!(decoded, "aaaaaaaaaaaaaa");

        let over = b"\"aaaaaaaaaaaaaaa\"\n";
        let result: Result<String, _> = read_frame(&over[..], 16).await;
        assert!(matches!(result, Err(P2PError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_frame_garbage_is_serialization_error() {
        let result: Result<CatalogRequest, _> = read_frame(&b"not json\n"[..], 1024).await;
        assert!(matches!(result, Err(P2PError::Serialization(_))));
    }
}
