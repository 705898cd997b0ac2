//! The two request paths: a direct controller-side probe, and the
//! distributed fan-out across every connected probe. Both share the same
//! resolution and enrichment chain.

use crate::address::{parse_address, DEFAULT_BEDROCK_PORT, DEFAULT_JAVA_PORT};
use crate::dispatch::Dispatcher;
use crate::geoip::GeoIp;
use crate::resolver::{looks_resolvable, Resolver};
use crate::session::{CredentialStore, ProbeRegistry};
use crate::status::{
    AsnField, AsnInfo, IpInfo, Protocol, RecordKind, ServerStatus, ServiceRecord,
};
use crate::{bedrock, java};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, instrument};

/// Shared handles behind every request: one registry, one waiter map, one
/// resolver, one GeoIP reader pair for the whole process.
pub struct Controller {
    pub resolver: Resolver,
    pub geoip: GeoIp,
    pub registry: ProbeRegistry,
    pub dispatcher: Dispatcher,
    pub credentials: CredentialStore,
}

/// Response document of the distributed route.
#[derive(Debug, Serialize, Deserialize)]
pub struct DistributedResponse {
    pub target: String,
    pub result_count: usize,
    pub nodes: HashMap<String, NodeReport>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeReport {
    pub node_region: String,
    pub status: ServerStatus,
}

/// Bedrock listens on its own well-known port; when the user left the Java
/// default in place, substitute it.
fn effective_port(protocol: Protocol, parsed_port: u16) -> u16 {
    match protocol {
        Protocol::Bedrock if parsed_port == DEFAULT_JAVA_PORT => DEFAULT_BEDROCK_PORT,
        _ => parsed_port,
    }
}

/// Probe a server from the controller itself and assemble the enriched
/// status document.
#[instrument(skip(controller))]
pub async fn direct_status(
    controller: &Controller,
    raw_addr: &str,
    protocol: Protocol,
) -> ServerStatus {
    let (host, parsed_port) = parse_address(raw_addr, DEFAULT_JAVA_PORT);
    let is_ip = host.parse::<IpAddr>().is_ok();
    if !is_ip && !looks_resolvable(&host) {
        return ServerStatus::offline("Invalid hostname");
    }

    // SRV indirection applies to Java lookups on real hostnames only
    let srv = match (protocol, is_ip) {
        (Protocol::Java, false) => controller.resolver.resolve_service(&host).await,
        _ => None,
    };
    let connect_port = match &srv {
        Some(record) => record.port,
        None => effective_port(protocol, parsed_port),
    };
    let connect_host = srv.as_ref().map_or(host.as_str(), |r| r.target.as_str());

    let Some(ip) = controller.resolver.resolve_ip(connect_host).await else {
        debug!("no address for {connect_host}");
        return ServerStatus::offline(format!("DNS resolution failed for {connect_host}"));
    };

    // enrichment walks the original hostname, while the ping goes to the
    // resolved address; the handshake still carries the original hostname
    let (ip_info, mut status) = tokio::join!(
        build_ip_info(controller, &host, srv.clone(), Some(ip)),
        async {
            match protocol {
                Protocol::Java => java::probe(ip, connect_port, &host, java::DEFAULT_TIMEOUT).await,
                Protocol::Bedrock => bedrock::probe(ip, connect_port).await,
            }
        }
    );

    status.host = Some(host);
    status.port = Some(connect_port);
    status.protocol = Some(protocol);
    status.ip_info = Some(ip_info);
    status
}

/// Fan the probe out to every connected probe agent, enriching each node's
/// report with the controller-side DNS and GeoIP view. Returns None when no
/// probes are connected.
#[instrument(skip(controller))]
pub async fn distributed_status(
    controller: &Controller,
    raw_addr: &str,
    protocol: Protocol,
) -> Option<DistributedResponse> {
    if controller.registry.count() == 0 {
        return None;
    }
    let (host, parsed_port) = parse_address(raw_addr, DEFAULT_JAVA_PORT);
    let target_port = effective_port(protocol, parsed_port);

    let enrich = async {
        let is_ip = host.parse::<IpAddr>().is_ok();
        if !is_ip && !looks_resolvable(&host) {
            return IpInfo::default();
        }
        let srv = match (protocol, is_ip) {
            (Protocol::Java, false) => controller.resolver.resolve_service(&host).await,
            _ => None,
        };
        let lookup_host = srv.as_ref().map_or(host.as_str(), |r| r.target.as_str());
        let primary = controller.resolver.resolve_ip(lookup_host).await;
        build_ip_info(controller, &host, srv, primary).await
    };
    let fan_out = controller
        .dispatcher
        .broadcast(&controller.registry, &host, target_port, protocol);
    let (ip_info, results) = tokio::join!(enrich, fan_out);
    if results.is_empty() {
        // every probe disconnected between the count check and the fan-out
        return None;
    }

    let mut nodes = HashMap::new();
    for (probe_id, result) in results {
        let mut status = match (result.success, result.data) {
            (true, Some(data)) => data,
            _ => ServerStatus::offline(
                result
                    .error
                    .unwrap_or_else(|| "Probe task failed".to_owned()),
            ),
        };
        status.protocol = Some(protocol);
        // every node gets its own copy of the controller-side view
        status.ip_info = Some(ip_info.clone());
        let node_region = controller
            .registry
            .region_of(&probe_id)
            .unwrap_or_else(|| "unknown".to_owned());
        nodes.insert(probe_id, NodeReport { node_region, status });
    }

    Some(DistributedResponse {
        target: raw_addr.to_owned(),
        result_count: nodes.len(),
        nodes,
    })
}

/// Walk the DNS chain behind `host` and attach GeoIP data: every unique
/// address gets an ASN lookup (de-duplicated by ASN number), the primary
/// address alone gets a location lookup.
async fn build_ip_info(
    controller: &Controller,
    host: &str,
    srv: Option<ServiceRecord>,
    primary_ip: Option<IpAddr>,
) -> IpInfo {
    let dns_records = controller.resolver.collect_dns_records(host, srv.as_ref()).await;

    let mut ips: Vec<String> = Vec::new();
    if let Some(ip) = primary_ip {
        ips.push(ip.to_string());
    }
    for record in &dns_records {
        if matches!(record.kind, RecordKind::A | RecordKind::Aaaa) && !ips.contains(&record.data) {
            ips.push(record.data.clone());
        }
    }

    let mut asns: Vec<AsnInfo> = Vec::new();
    for ip_text in &ips {
        let Ok(ip) = ip_text.parse::<IpAddr>() else {
            continue;
        };
        if let Some(asn) = controller.geoip.asn_of(ip) {
            if !asns.iter().any(|seen| seen.asn == asn.asn) {
                asns.push(asn);
            }
        }
    }

    let primary = primary_ip.or_else(|| ips.first().and_then(|text| text.parse().ok()));
    let location = primary.and_then(|ip| controller.geoip.location_of(ip));

    IpInfo {
        ip: primary.map(|ip| ip.to_string()),
        ips: (!ips.is_empty()).then_some(ips),
        srv_record: srv,
        asn: AsnField::from_unique(asns),
        location,
        dns_records: (!dns_records.is_empty()).then_some(dns_records),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::TaskResult;

    fn controller() -> Controller {
        Controller {
            resolver: Resolver::from_system(),
            geoip: GeoIp::disabled(),
            registry: ProbeRegistry::new(),
            dispatcher: Dispatcher::new(),
            credentials: CredentialStore::new(),
        }
    }

    #[test]
    fn bedrock_substitutes_the_implied_java_port() {
        assert_eq!(effective_port(Protocol::Bedrock, 25565), 19132);
        assert_eq!(effective_port(Protocol::Bedrock, 19133), 19133);
        assert_eq!(effective_port(Protocol::Java, 25565), 25565);
    }

    #[tokio::test]
    async fn garbage_hostnames_fast_fail() {
        let controller = controller();
        for (input, protocol) in [("abc", Protocol::Java), ("server", Protocol::Bedrock)] {
            let status = direct_status(&controller, input, protocol).await;
            assert!(!status.online);
            assert_eq!(status.error.as_deref(), Some("Invalid hostname"));
            assert!(status.ip_info.is_none());
        }
    }

    #[tokio::test]
    async fn distributed_without_probes_is_none() {
        let controller = controller();
        assert!(distributed_status(&controller, "mc.example.com", Protocol::Java)
            .await
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn distributed_mixed_outcomes_share_enrichment() {
        use tokio::sync::{mpsc, oneshot};

        let controller = controller();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (sd1, _) = oneshot::channel();
        controller.registry.register("p1", "us-west", tx1, sd1);
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let (sd2, _) = oneshot::channel();
        controller.registry.register("p2", "eu-central", tx2, sd2);

        // an IP-literal target keeps the enrichment chain off the network
        let run = distributed_status(&controller, "203.0.113.5:25565", Protocol::Java);
        let answer = async {
            let frame_json = rx1.recv().await.unwrap();
            let frame: crate::status::TaskFrame = serde_json::from_str(&frame_json).unwrap();
            assert_eq!(frame.target, "203.0.113.5");
            assert_eq!(frame.port, 25565);
            controller.dispatcher.complete(TaskResult {
                id: frame.id,
                success: true,
                data: Some(ServerStatus {
                    online: true,
                    ..Default::default()
                }),
                error: None,
            });
        };
        let (response, ()) = tokio::join!(run, answer);
        let response = response.unwrap();

        assert_eq!(response.result_count, 2);
        let p1 = &response.nodes["p1"];
        assert_eq!(p1.node_region, "us-west");
        assert!(p1.status.online);
        let p2 = &response.nodes["p2"];
        assert_eq!(p2.node_region, "eu-central");
        assert!(!p2.status.online);
        assert_eq!(p2.status.error.as_deref(), Some("Task timeout"));

        // both nodes carry the same controller-side view
        let info1 = p1.status.ip_info.as_ref().unwrap();
        let info2 = p2.status.ip_info.as_ref().unwrap();
        assert_eq!(info1.ip.as_deref(), Some("203.0.113.5"));
        assert_eq!(info1.ip, info2.ip);
    }
}
