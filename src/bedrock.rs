//! Bedrock Edition status ping over the RakNet unconnected ping/pong
//! exchange.

use crate::motd::Motd;
use crate::status::{PlayerCount, Protocol, ServerStatus, VersionInfo};
use bytes::{Buf, BufMut};
use chrono::Utc;
use snafu::{Backtrace, OptionExt, Snafu};
use std::io::{Cursor, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, instrument};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Extra attempts after the first datagram. A lost datagram on a closed
/// port is indistinguishable from an offline server inside the timeout
/// budget, so the knob defaults to off.
pub const DEFAULT_RETRIES: u64 = 0;

/// Fixed OFFLINE_MESSAGE_DATA_ID magic that marks unconnected RakNet
/// messages. https://wiki.vg/Raknet_Protocol#Data_types
const MAGIC: u128 = 0x00ffff00fefefefefdfdfdfd12345678;

#[derive(Debug, Snafu)]
pub enum BedrockPingError {
    /// The server did not respond to the ping request.
    NoResponse { backtrace: Backtrace },
    /// The reply was not a well-formed unconnected pong.
    MalformedPong { backtrace: Backtrace },
    /// The pong's server info string was missing fields.
    #[snafu(display("server info string is missing fields"))]
    ServerInfoParse { backtrace: Backtrace },
    /// I/O error.
    #[snafu(display("I/O error: {source}"), context(false))]
    Io {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

struct UnconnectedPing {
    time: i64,
    magic: u128,
    guid: i64,
}

impl UnconnectedPing {
    const PACKET_ID: u8 = 0x01;

    fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(33);
        buf.put_u8(Self::PACKET_ID);
        buf.put_i64(self.time);
        buf.put_u128(self.magic);
        buf.put_i64(self.guid);
        buf
    }
}

struct UnconnectedPong {
    /// "Server ID string" on wiki.vg; semicolon-delimited server info.
    payload: String,
}

impl UnconnectedPong {
    const PACKET_ID: u8 = 0x1c;
    // id + timestamp + server guid + magic + string length prefix
    const MIN_LEN: usize = 1 + 8 + 8 + 16 + 2;

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::MIN_LEN {
            return None;
        }
        let mut cursor = Cursor::new(bytes);

        if cursor.get_u8() != Self::PACKET_ID {
            return None;
        }
        let _time = cursor.get_i64();
        let _server_guid = cursor.get_i64();
        if cursor.get_u128() != MAGIC {
            return None;
        }

        let payload_len = cursor.get_u16();
        let mut payload_bytes = vec![0u8; payload_len as usize];
        cursor.read_exact(&mut payload_bytes).ok()?;
        let payload = String::from_utf8(payload_bytes).ok()?;

        Some(UnconnectedPong { payload })
    }
}

/// Decoded fields of the pong's semicolon-delimited server info:
///
/// `Edition;MOTD;Protocol;Version;OnlinePlayers;MaxPlayers;ServerID;SubMOTD;…`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BedrockServerInfo {
    pub edition: String,
    pub motd: String,
    pub protocol_version: i64,
    pub version: String,
    pub online_players: i64,
    pub max_players: i64,
}

impl FromStr for BedrockServerInfo {
    type Err = BedrockPingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn parse_impl(s: &str) -> Option<BedrockServerInfo> {
            let mut parts = s.split(';').map(str::to_owned);
            Some(BedrockServerInfo {
                edition: parts.next()?,
                motd: parts.next()?,
                protocol_version: parts.next()?.parse().unwrap_or(0),
                version: parts.next()?,
                online_players: parts.next()?.parse().unwrap_or(0),
                max_players: parts.next()?.parse().unwrap_or(0),
            })
        }

        parse_impl(s).context(ServerInfoParseSnafu)
    }
}

async fn exchange(
    ip: IpAddr,
    port: u16,
    attempt_timeout: Duration,
    retries: u64,
) -> Result<BedrockServerInfo, BedrockPingError> {
    // the codec is IPv4-only; a v6-only target fails here and the connect
    // error lands in the status document
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;
    // a connected socket surfaces ICMP port-unreachable as an error instead
    // of waiting out the timeout
    socket.connect(SocketAddr::new(ip, port)).await?;

    let mut response = None;
    for attempt in 0..=retries {
        debug!("pinging raknet server, attempt {}", attempt + 1);
        tokio::select! {
            biased;
            _ = tokio::time::sleep(attempt_timeout) => continue,
            pong = attempt_ping(&socket) => response = Some(pong?),
        }
        if response.is_some() {
            break;
        }
    }
    let pong = response.context(NoResponseSnafu)?;

    pong.payload.parse()
}

async fn attempt_ping(socket: &UdpSocket) -> Result<UnconnectedPong, BedrockPingError> {
    let outgoing = UnconnectedPing {
        time: Utc::now().timestamp_millis(),
        magic: MAGIC,
        guid: rand::random(),
    };
    socket.send(&outgoing.to_vec()).await?;
    let mut buffer = Vec::with_capacity(1500);
    socket.recv_buf(&mut buffer).await?;
    UnconnectedPong::from_bytes(&buffer).context(MalformedPongSnafu)
}

/// Ping a Bedrock server, folding every failure mode into the status
/// document. No response within the budget reports as `timeout`.
#[instrument]
pub async fn probe(ip: IpAddr, port: u16) -> ServerStatus {
    match exchange(ip, port, DEFAULT_TIMEOUT, DEFAULT_RETRIES).await {
        Ok(info) => map_status(info),
        Err(BedrockPingError::NoResponse { .. }) => ServerStatus::offline("timeout"),
        Err(error) => {
            debug!("bedrock ping failed: {error}");
            ServerStatus::offline(error.to_string())
        }
    }
}

fn map_status(info: BedrockServerInfo) -> ServerStatus {
    ServerStatus {
        online: true,
        protocol: Some(Protocol::Bedrock),
        version: Some(VersionInfo {
            name: format!("{} {}", info.edition, info.version),
            clean_name: info.version,
            protocol: info.protocol_version,
        }),
        players: Some(PlayerCount {
            online: info.online_players,
            max: info.max_players,
            sample: None,
        }),
        motd: Some(Motd::from_legacy(&info.motd)),
        ..Default::default()
    }
}
