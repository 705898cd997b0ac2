//! Status documents and probe wire frames.
//!
//! Everything here crosses a serialization boundary: `ServerStatus` is both
//! the HTTP response body and the `data` payload probes report back, and
//! `TaskFrame`/`TaskResult` are the two directions of the probe stream.

use crate::motd::Motd;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Java,
    Bedrock,
}

impl FromStr for Protocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "java" => Ok(Protocol::Java),
            "bedrock" => Ok(Protocol::Bedrock),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Java => f.write_str("java"),
            Protocol::Bedrock => f.write_str("bedrock"),
        }
    }
}

/// The enriched status document returned for every probe, successful or not.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerStatus {
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub players: Option<PlayerCount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motd: Option<Motd>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_info: Option<IpInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerStatus {
    pub fn offline(error: impl Into<String>) -> Self {
        ServerStatus {
            online: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionInfo {
    pub name: String,
    pub clean_name: String,
    pub protocol: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerCount {
    pub online: i64,
    pub max: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample: Option<Vec<PlayerSample>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerSample {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// DNS target advertised by `_minecraft._tcp.<host>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub target: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    #[serde(rename = "SRV")]
    Srv,
    A,
    #[serde(rename = "AAAA")]
    Aaaa,
    #[serde(rename = "CNAME")]
    Cname,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RecordKind,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsnInfo {
    pub asn: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
}

/// One ASN when the target sits behind a single network, a list otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AsnField {
    One(AsnInfo),
    Many(Vec<AsnInfo>),
}

impl AsnField {
    pub fn from_unique(mut asns: Vec<AsnInfo>) -> Option<Self> {
        match asns.len() {
            0 => None,
            1 => Some(AsnField::One(asns.remove(0))),
            _ => Some(AsnField::Many(asns)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

/// Controller-side DNS and GeoIP enrichment attached to a status document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IpInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srv_record: Option<ServiceRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asn: Option<AsnField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_records: Option<Vec<DnsRecord>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Ping,
}

/// Controller → probe task frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFrame {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub target: String,
    pub port: u16,
    pub protocol: Protocol,
}

/// Probe → controller reply, or a controller-synthesized failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ServerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        TaskResult {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn timeout(id: impl Into<String>) -> Self {
        Self::failure(id, "Task timeout")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_parses_its_two_tags() {
        assert_eq!("java".parse(), Ok(Protocol::Java));
        assert_eq!("bedrock".parse(), Ok(Protocol::Bedrock));
        assert!("JAVA".parse::<Protocol>().is_err());
        assert!("".parse::<Protocol>().is_err());
    }

    #[test]
    fn offline_status_serializes_sparsely() {
        let value = serde_json::to_value(ServerStatus::offline("timeout")).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"online": false, "error": "timeout"})
        );
    }

    #[test]
    fn task_frame_wire_shape() {
        let frame = TaskFrame {
            id: "123e4567-e89b-12d3-a456-426614174000".into(),
            kind: TaskKind::Ping,
            target: "mc.example.com".into(),
            port: 25565,
            protocol: Protocol::Java,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "ping");
        assert_eq!(value["protocol"], "java");
        assert_eq!(value["port"], 25565);
    }

    #[test]
    fn task_result_tolerates_missing_fields() {
        let result: TaskResult =
            serde_json::from_str(r#"{"id":"abc","success":true,"data":{"online":true}}"#).unwrap();
        assert!(result.success);
        assert!(result.error.is_none());
        assert!(result.data.unwrap().online);
    }

    #[test]
    fn single_asn_is_flattened() {
        let one = AsnField::from_unique(vec![AsnInfo {
            asn: 13335,
            organization: None,
        }])
        .unwrap();
        assert_eq!(serde_json::to_value(&one).unwrap()["asn"], 13335);
        assert!(AsnField::from_unique(Vec::new()).is_none());
    }
}
