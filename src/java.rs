//! Java Edition status ping: handshake, status request, and the
//! length-prefixed response, mapped into a [`ServerStatus`].

pub use self::frame::{Frame, FrameError};
use self::frame::write_string;
use crate::motd::Motd;
use crate::status::{PlayerCount, PlayerSample, Protocol, ServerStatus, VersionInfo};
use bytes::{Buf, BytesMut};
use mc_varint::{VarInt, VarIntWrite};
use regex::Regex;
use serde::Deserialize;
use snafu::{Backtrace, GenerateImplicitData, OptionExt, Snafu};
use std::io::{Cursor, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufWriter},
    net::TcpStream,
};
use tracing::{debug, instrument, trace};

mod frame;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Snafu, Debug)]
pub enum ProtocolError {
    #[snafu(display("io error: {source}"), context(false))]
    Io {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display(
        "failed to send packet because it is too long (more than {} bytes)",
        i32::MAX
    ))]
    PacketTooLong { backtrace: Backtrace },
    #[snafu(display("connection closed unexpectedly"))]
    ConnectionClosed { backtrace: Backtrace },
    #[snafu(display("frame error: {source}"), context(false))]
    Frame {
        #[snafu(backtrace)]
        source: FrameError,
    },
    #[snafu(display("failed to parse server response: {source}"), context(false))]
    JsonParse {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
}

#[repr(i32)]
enum ProtocolState {
    Status = 1,
}

/// A client-side status connection: buffered writes out, incremental frame
/// decoding in.
#[derive(Debug)]
struct StatusConnection {
    hostname: String,
    port: u16,
    stream: BufWriter<TcpStream>,
    buffer: BytesMut,
}

impl StatusConnection {
    fn new(hostname: String, port: u16, stream: TcpStream) -> Self {
        Self {
            hostname,
            port,
            stream: BufWriter::new(stream),
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Length-prefix `packet_data` and send it.
    async fn write_packet(&mut self, packet_data: Vec<u8>) -> Result<(), ProtocolError> {
        let len = VarInt::from(
            i32::try_from(packet_data.len())
                .ok()
                .context(PacketTooLongSnafu)?,
        );
        let mut packet: Vec<u8> = Vec::with_capacity(packet_data.len() + 5);
        packet.write_var_int(len)?;
        Write::write(&mut packet, &packet_data)?;
        self.stream.write_all(&packet).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// The handshake carries the hostname the user asked for, not the
    /// resolved address: proxy fronts route on this field.
    async fn send_handshake(&mut self) -> Result<(), ProtocolError> {
        trace!("writing handshake frame");
        let mut data: Vec<u8> = Vec::with_capacity(self.hostname.len() + 16);
        data.write_var_int(VarInt::from(Frame::HANDSHAKE_ID))?;
        data.write_var_int(VarInt::from(Frame::PROTOCOL_VERSION))?;
        write_string(&mut data, &self.hostname)?;
        Write::write(&mut data, &self.port.to_be_bytes())?;
        data.write_var_int(VarInt::from(ProtocolState::Status as i32))?;
        self.write_packet(data).await
    }

    async fn send_status_request(&mut self) -> Result<(), ProtocolError> {
        trace!("writing status request frame");
        let mut data: Vec<u8> = Vec::with_capacity(1);
        data.write_var_int(VarInt::from(Frame::STATUS_REQUEST_ID))?;
        self.write_packet(data).await
    }

    /// Receive and parse a frame, reading more bytes until one is complete.
    async fn read_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            // Attempt to parse a frame from the buffered data. If enough data
            // has been buffered, the frame is returned.
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            // Not enough buffered data; read more from the socket. `0` means
            // end of stream.
            let bytes_read = self.stream.read_buf(&mut self.buffer).await?;
            if bytes_read == 0 {
                // A clean shutdown leaves no partial frame behind.
                if self.buffer.is_empty() {
                    return Ok(None);
                } else {
                    return Err(ProtocolError::ConnectionClosed {
                        backtrace: Backtrace::generate(),
                    });
                }
            }
        }
    }

    /// Parse the frame at the front of the buffer, removing it on success.
    fn parse_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let mut cursor = Cursor::new(&self.buffer[..]);

        match Frame::check(&mut cursor) {
            Ok(()) => {
                let frame = Frame::parse(&mut cursor)?;
                // current cursor position is the entire frame
                self.buffer.advance(cursor.position() as usize);
                Ok(Some(frame))
            }
            // Not enough data has been buffered
            Err(FrameError::Incomplete { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn disconnect(mut self) -> Result<(), ProtocolError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Raw status document as the server sends it, before enrichment.
#[derive(Deserialize, Debug)]
pub struct RawJavaStatus {
    pub version: Option<RawVersion>,
    pub players: Option<RawPlayers>,
    pub description: Option<crate::motd::Description>,
    pub favicon: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct RawVersion {
    pub name: String,
    #[serde(default)]
    pub protocol: i64,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct RawPlayers {
    pub max: i64,
    pub online: i64,
    pub sample: Option<Vec<RawPlayerSample>>,
}

#[derive(Deserialize, Debug)]
pub struct RawPlayerSample {
    pub name: Option<String>,
    pub id: Option<String>,
}

async fn exchange_status(
    ip: IpAddr,
    port: u16,
    hostname: &str,
) -> Result<RawJavaStatus, ProtocolError> {
    let stream = TcpStream::connect(SocketAddr::new(ip, port)).await?;
    let mut connection = StatusConnection::new(hostname.to_owned(), port, stream);
    connection.send_handshake().await?;
    connection.send_status_request().await?;
    let frame = connection
        .read_frame()
        .await?
        .context(ConnectionClosedSnafu)?;
    let Frame::StatusResponse { json } = frame;
    let raw = serde_json::from_str(&json)?;
    connection.disconnect().await.ok();
    Ok(raw)
}

/// Ping a Java server and fold every failure mode into the status document.
#[instrument(skip(hostname), fields(host = hostname))]
pub async fn probe(ip: IpAddr, port: u16, hostname: &str, timeout: Duration) -> ServerStatus {
    match tokio::time::timeout(timeout, exchange_status(ip, port, hostname)).await {
        Ok(Ok(raw)) => map_status(raw),
        Ok(Err(ProtocolError::JsonParse { .. })) => {
            debug!("server returned undecodable status JSON");
            ServerStatus::offline("Invalid JSON response")
        }
        Ok(Err(error)) => {
            debug!("java ping failed: {error}");
            ServerStatus::offline(error.to_string())
        }
        Err(_) => ServerStatus::offline("timeout"),
    }
}

fn map_status(raw: RawJavaStatus) -> ServerStatus {
    let version = raw.version.map(|v| VersionInfo {
        clean_name: clean_version_name(&v.name),
        name: v.name,
        protocol: v.protocol,
    });
    let players = raw.players.map(|p| PlayerCount {
        online: p.online,
        max: p.max,
        sample: p.sample.map(|sample| {
            sample
                .into_iter()
                .map(|entry| PlayerSample {
                    name: entry.name,
                    id: entry.id,
                })
                .collect()
        }),
    });
    let motd = raw.description.as_ref().map(Motd::from_description);
    ServerStatus {
        online: true,
        protocol: Some(Protocol::Java),
        version,
        players,
        motd,
        favicon: raw.favicon,
        ..Default::default()
    }
}

/// Reduce a decorated version name to a bare version number where one is
/// present: strip `§` codes, then take the first `x.y` or `x.y.z` run.
fn clean_version_name(name: &str) -> String {
    let stripped = crate::motd::strip_legacy_codes(name);
    version_pattern()
        .find(&stripped)
        .map(|m| m.as_str().to_owned())
        .unwrap_or(stripped)
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\d+\.\d+(?:\.\d+)?").expect("version pattern"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_names_are_cleaned() {
        assert_eq!(clean_version_name("Paper 1.20.4"), "1.20.4");
        assert_eq!(clean_version_name("§cVelocity 1.7.2-1.21"), "1.7.2");
        assert_eq!(clean_version_name("§5Custom§r"), "Custom");
        assert_eq!(clean_version_name("1.8"), "1.8");
    }

    #[test]
    fn full_response_maps_to_status() {
        let raw: RawJavaStatus = serde_json::from_str(
            r##"{
                "version": {"name": "Paper 1.20.4", "protocol": 765},
                "players": {"online": 3, "max": 20, "sample": [{"name": "steve", "id": "abc"}]},
                "description": {"text": "Welcome!", "color": "gold"},
                "favicon": "data:image/png;base64,xyz"
            }"##,
        )
        .unwrap();
        let status = map_status(raw);
        assert!(status.online);
        assert_eq!(status.protocol, Some(Protocol::Java));
        let version = status.version.unwrap();
        assert_eq!(version.name, "Paper 1.20.4");
        assert_eq!(version.clean_name, "1.20.4");
        assert_eq!(version.protocol, 765);
        let players = status.players.unwrap();
        assert_eq!((players.online, players.max), (3, 20));
        assert_eq!(players.sample.unwrap().len(), 1);
        assert_eq!(status.motd.unwrap().clean, "Welcome!");
        assert_eq!(status.favicon.as_deref(), Some("data:image/png;base64,xyz"));
    }

    #[test]
    fn legacy_string_description_and_missing_fields() {
        let raw: RawJavaStatus =
            serde_json::from_str(r#"{"description": "§aA Minecraft Server"}"#).unwrap();
        let status = map_status(raw);
        assert!(status.online);
        assert!(status.version.is_none());
        assert!(status.players.is_none());
        assert_eq!(status.motd.unwrap().clean, "A Minecraft Server");
    }

    #[test]
    fn numeric_player_fields_default_to_zero() {
        let raw: RawJavaStatus =
            serde_json::from_str(r#"{"players": {}, "description": "x"}"#).unwrap();
        let players = map_status(raw).players.unwrap();
        assert_eq!((players.online, players.max), (0, 0));
    }
}
