//! DNS plumbing for the orchestrators: SRV discovery, connection-address
//! resolution, and the recursive record collection used for enrichment.
//!
//! Every upstream query is capped at [`DNS_TIMEOUT`]; a slow or broken
//! resolver degrades answers instead of stalling requests.

use crate::status::{DnsRecord, RecordKind, ServiceRecord};
use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};
use trust_dns_resolver::{
    config::{ResolverConfig, ResolverOpts},
    proto::rr::{RData, RecordType},
    TokioAsyncResolver,
};

pub const DNS_TIMEOUT: Duration = Duration::from_secs(3);

/// Hosts shorter than this can never resolve; between this and
/// [`MIN_DOTLESS_HOST_LEN`] they must at least contain a dot. Lets the
/// orchestrators reject garbage without a resolver round-trip.
const MIN_HOST_LEN: usize = 4;
const MIN_DOTLESS_HOST_LEN: usize = 10;

pub fn looks_resolvable(host: &str) -> bool {
    host.len() >= MIN_HOST_LEN && (host.len() >= MIN_DOTLESS_HOST_LEN || host.contains('.'))
}

#[derive(Clone)]
pub struct Resolver {
    inner: TokioAsyncResolver,
}

impl Resolver {
    /// Resolver from the system configuration, falling back to well-known
    /// public servers when `/etc/resolv.conf` is unusable.
    pub fn from_system() -> Self {
        let inner = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|error| {
            warn!("system resolver configuration unusable ({error}), using public resolvers");
            TokioAsyncResolver::tokio(ResolverConfig::google(), ResolverOpts::default())
        });
        Resolver { inner }
    }

    /// First `_minecraft._tcp.<host>` service record, if any.
    pub async fn resolve_service(&self, host: &str) -> Option<ServiceRecord> {
        let name = format!("_minecraft._tcp.{host}");
        let lookup = capped(self.inner.srv_lookup(name)).await?;
        let record = lookup.iter().next()?;
        Some(ServiceRecord {
            target: trim_root_dot(&record.target().to_utf8()),
            port: record.port(),
        })
    }

    /// Resolve a host to a single connection address. IP literals pass
    /// through untouched; otherwise A and AAAA are queried in parallel and
    /// the first A record wins over the first AAAA.
    pub async fn resolve_ip(&self, host: &str) -> Option<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
        let (a, aaaa) = tokio::join!(self.query_a(host), self.query_aaaa(host));
        a.first()
            .copied()
            .map(IpAddr::V4)
            .or_else(|| aaaa.first().copied().map(IpAddr::V6))
    }

    /// The full DNS chain behind `host` for response enrichment.
    ///
    /// When an SRV record was used its line comes first and its target is
    /// walked before the original host. Each hostname is queried for a
    /// CNAME; an aliased name is recorded and its target recursed into
    /// instead of being queried for addresses directly. A visited set keyed
    /// by hostname terminates any CNAME graph, cycles included.
    pub async fn collect_dns_records(
        &self,
        host: &str,
        srv: Option<&ServiceRecord>,
    ) -> Vec<DnsRecord> {
        let mut records = Vec::new();
        let mut visited = HashSet::new();
        if let Some(srv) = srv {
            records.push(DnsRecord {
                name: format!("_minecraft._tcp.{host}"),
                kind: RecordKind::Srv,
                data: format!("1 1 {} {}", srv.port, srv.target),
            });
            self.walk(srv.target.clone(), &mut visited, &mut records)
                .await;
        }
        self.walk(host.to_owned(), &mut visited, &mut records).await;
        records
    }

    fn walk<'a>(
        &'a self,
        host: String,
        visited: &'a mut HashSet<String>,
        out: &'a mut Vec<DnsRecord>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if host.parse::<IpAddr>().is_ok() {
                return;
            }
            if !visited.insert(host.to_ascii_lowercase()) {
                debug!("dns walk already visited {host}");
                return;
            }
            if let Some(target) = self.query_cname(&host).await {
                out.push(DnsRecord {
                    name: host,
                    kind: RecordKind::Cname,
                    data: target.clone(),
                });
                self.walk(target, visited, out).await;
                return;
            }
            for ip in self.query_a(&host).await {
                out.push(DnsRecord {
                    name: host.clone(),
                    kind: RecordKind::A,
                    data: ip.to_string(),
                });
            }
            for ip in self.query_aaaa(&host).await {
                out.push(DnsRecord {
                    name: host.clone(),
                    kind: RecordKind::Aaaa,
                    data: ip.to_string(),
                });
            }
        })
    }

    async fn query_cname(&self, host: &str) -> Option<String> {
        let lookup = capped(self.inner.lookup(host, RecordType::CNAME)).await?;
        lookup.iter().find_map(|rdata| match rdata {
            RData::CNAME(target) => Some(trim_root_dot(&target.0.to_utf8())),
            _ => None,
        })
    }

    async fn query_a(&self, host: &str) -> Vec<Ipv4Addr> {
        match capped(self.inner.ipv4_lookup(host)).await {
            Some(lookup) => lookup.iter().map(|record| record.0).collect(),
            None => Vec::new(),
        }
    }

    async fn query_aaaa(&self, host: &str) -> Vec<Ipv6Addr> {
        match capped(self.inner.ipv6_lookup(host)).await {
            Some(lookup) => lookup.iter().map(|record| record.0).collect(),
            None => Vec::new(),
        }
    }
}

/// Cap a DNS query at [`DNS_TIMEOUT`]; failures and timeouts both collapse
/// to None so callers degrade instead of erroring.
async fn capped<T, E, F>(query: F) -> Option<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(DNS_TIMEOUT, query).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(error)) => {
            debug!("dns query failed: {error}");
            None
        }
        Err(_) => {
            debug!("dns query timed out after {DNS_TIMEOUT:?}");
            None
        }
    }
}

fn trim_root_dot(name: &str) -> String {
    name.trim_end_matches('.').to_owned()
}
