use clap::Parser;
use std::path::PathBuf;

/// Controller for a distributed network of Minecraft server-status probes.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Port the HTTP API listens on.
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Address the HTTP API binds to.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Directory holding GeoLite2-City.mmdb and GeoLite2-ASN.mmdb (both
    /// optional).
    #[arg(long, env = "GEOIP_DIR", default_value = "./data/geoip")]
    pub geoip_dir: PathBuf,

    /// Probe credentials file: a JSON object mapping probe id to secret,
    /// re-read whenever it changes.
    #[arg(long, env = "PROBES_FILE", default_value = "./probes.json")]
    pub probes_file: PathBuf,
}
