//! GeoIP enrichment backed by MaxMind database files.
//!
//! Both databases are optional: a missing file simply disables that half of
//! the enrichment, the controller runs fine without either.

use crate::status::{AsnInfo, GeoLocation};
use maxminddb::{geoip2, Reader};
use std::net::IpAddr;
use std::path::Path;
use tracing::{info, warn};

const CITY_DB: &str = "GeoLite2-City.mmdb";
const ASN_DB: &str = "GeoLite2-ASN.mmdb";

pub struct GeoIp {
    city: Option<Reader<Vec<u8>>>,
    asn: Option<Reader<Vec<u8>>>,
}

impl GeoIp {
    pub fn open(dir: &Path) -> Self {
        GeoIp {
            city: open_reader(&dir.join(CITY_DB)),
            asn: open_reader(&dir.join(ASN_DB)),
        }
    }

    /// A lookup service with no databases loaded; every query returns None.
    pub fn disabled() -> Self {
        GeoIp {
            city: None,
            asn: None,
        }
    }

    pub fn location_of(&self, ip: IpAddr) -> Option<GeoLocation> {
        let reader = self.city.as_ref()?;
        let city: geoip2::City = reader.lookup(ip).ok()?;
        let country = city.country.as_ref();
        let location = city.location.as_ref();
        Some(GeoLocation {
            country: country.and_then(|c| english_name(c.names.as_ref())),
            country_code: country.and_then(|c| c.iso_code).map(str::to_owned),
            city: city.city.as_ref().and_then(|c| english_name(c.names.as_ref())),
            latitude: location.and_then(|l| l.latitude),
            longitude: location.and_then(|l| l.longitude),
            time_zone: location.and_then(|l| l.time_zone).map(str::to_owned),
        })
    }

    pub fn asn_of(&self, ip: IpAddr) -> Option<AsnInfo> {
        let reader = self.asn.as_ref()?;
        let record: geoip2::Asn = reader.lookup(ip).ok()?;
        Some(AsnInfo {
            asn: record.autonomous_system_number?,
            organization: record.autonomous_system_organization.map(str::to_owned),
        })
    }
}

fn english_name(names: Option<&std::collections::BTreeMap<&str, &str>>) -> Option<String> {
    names?.get("en").map(|name| (*name).to_owned())
}

fn open_reader(path: &Path) -> Option<Reader<Vec<u8>>> {
    match Reader::open_readfile(path) {
        Ok(reader) => {
            info!("loaded GeoIP database {}", path.display());
            Some(reader)
        }
        Err(error) => {
            warn!("GeoIP database {} unavailable: {error}", path.display());
            None
        }
    }
}
