//! Network definition files.
//!
//! Each network the seeder serves is described by a small JSON file. Loading
//! validates the definition and fills in the crawl tuning defaults; a
//! template file can be emitted for new deployments.

use bitcoin::p2p::Magic;
use hickory_proto::rr::Name;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::Path;

use crate::node::STATUS_TYPES;

/// Filename used when emitting a template definition.
pub const TEMPLATE_FILE: &str = "dnsseedd.json";

/// Lowest TTL a network may configure.
const MIN_TTL: u32 = 60;

/// JSON shape of a network definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkFile {
    pub name: String,
    #[serde(default)]
    pub desc: String,
    /// Network magic as a hex string, e.g. "0xd9b4bef9".
    #[serde(rename = "ID")]
    pub id: String,
    pub port: u16,
    pub pver: u32,
    #[serde(rename = "DNSName")]
    pub dns_name: String,
    #[serde(rename = "TTL")]
    pub ttl: u32,
    #[serde(rename = "InitialIP", default)]
    pub initial_ip: Option<String>,
    #[serde(default)]
    pub seeder1: String,
    #[serde(default)]
    pub seeder2: String,
    #[serde(default)]
    pub seeder3: String,
}

/// Validated per-network settings, crawl tuning included.
#[derive(Debug, Clone)]
pub struct SeederConfig {
    /// Short name for the network, used in logs.
    pub name: String,
    /// Long description.
    pub desc: String,
    /// Network magic prefixed on every wire message.
    pub magic: Magic,
    /// Standard port for the network.
    pub port: u16,
    /// Protocol version advertised when crawling.
    pub pver: u32,
    /// Hostname we serve answers for, lowercased, no trailing dot.
    pub dns_host: String,
    /// TTL on served records.
    pub ttl: u32,
    /// Optional endpoint to crawl when the bootstrap lookups return nothing.
    pub initial_ip: Option<IpAddr>,
    /// Bootstrap seeder hostnames.
    pub seeders: Vec<String>,
    /// Soft capacity of the node table.
    pub max_size: usize,
    /// Workers started per status per scheduler tick.
    pub max_start: [u32; STATUS_TYPES],
    /// Minimum seconds between attempts per status.
    pub delay: [u64; STATUS_TYPES],
}

/// Failures while loading a network definition. All fatal at startup.
#[derive(Debug)]
pub enum ConfigError {
    Read(io::Error),
    Parse(serde_json::Error),
    /// The configured port is zero.
    InvalidPort,
    /// No DNS hostname supplied.
    MissingDnsName,
    /// The DNS hostname is not a valid domain name.
    InvalidDnsName(String),
    /// The magic id string did not parse as a 32-bit value.
    InvalidMagic(String),
    /// Two loaded networks share a magic id.
    DuplicateMagic { existing: String, loading: String },
    /// Two loaded networks share a DNS hostname.
    DuplicateHost {
        host: String,
        existing: String,
        loading: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(e) => write!(f, "error reading network file: {e}"),
            ConfigError::Parse(e) => write!(f, "error decoding network file: {e}"),
            ConfigError::InvalidPort => write!(f, "invalid port supplied: 0"),
            ConfigError::MissingDnsName => write!(f, "no DNS hostname supplied"),
            ConfigError::InvalidDnsName(host) => write!(f, "invalid DNS hostname: {host}"),
            ConfigError::InvalidMagic(id) => {
                write!(f, "error converting network magic number: {id}")
            }
            ConfigError::DuplicateMagic { existing, loading } => write!(
                f,
                "duplicate magic id, already loaded for {existing} so can not be used for {loading}"
            ),
            ConfigError::DuplicateHost {
                host,
                existing,
                loading,
            } => write!(
                f,
                "duplicate DNS name {host}, already loaded for {existing} so can not be used for {loading}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::Read(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Load and validate one network definition file.
pub fn load_network(path: impl AsRef<Path>) -> Result<SeederConfig, ConfigError> {
    let contents = fs::read_to_string(path)?;
    let file: NetworkFile = serde_json::from_str(&contents)?;
    SeederConfig::from_network_file(file)
}

/// Parse a magic id string: "0x"-prefixed hex or plain decimal.
fn parse_magic(id: &str) -> Result<Magic, ConfigError> {
    let value = match id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => id.parse::<u32>(),
    }
    .map_err(|_| ConfigError::InvalidMagic(id.to_string()))?;

    // The magic is written to the wire little-endian.
    Ok(Magic::from_bytes(value.to_le_bytes()))
}

impl SeederConfig {
    /// Validate a parsed definition and apply the crawl tuning defaults.
    pub fn from_network_file(file: NetworkFile) -> Result<Self, ConfigError> {
        if file.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if file.dns_name.is_empty() {
            return Err(ConfigError::MissingDnsName);
        }

        let dns_host = file.dns_name.to_lowercase();
        if Name::from_ascii(format!("{dns_host}.")).is_err() {
            return Err(ConfigError::InvalidDnsName(file.dns_name));
        }

        let magic = parse_magic(&file.id)?;

        let initial_ip = file.initial_ip.as_deref().and_then(|s| {
            if s.is_empty() {
                return None;
            }
            match s.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!("{}: ignoring unparseable initial IP {s}", file.name);
                    None
                }
            }
        });

        let seeders = [file.seeder1, file.seeder2, file.seeder3]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();

        Ok(SeederConfig {
            name: file.name,
            desc: file.desc,
            magic,
            port: file.port,
            pver: file.pver,
            dns_host,
            ttl: file.ttl.max(MIN_TTL),
            initial_ip,
            seeders,
            max_size: 1250,
            max_start: [20, 20, 20, 30],
            delay: [210, 789, 234, 1876],
        })
    }
}

/// Reject configurations that would serve two networks under one identity.
pub fn check_duplicates(configs: &[SeederConfig]) -> Result<(), ConfigError> {
    for (i, a) in configs.iter().enumerate() {
        for b in &configs[i + 1..] {
            if a.magic == b.magic {
                return Err(ConfigError::DuplicateMagic {
                    existing: a.name.clone(),
                    loading: b.name.clone(),
                });
            }
            if a.dns_host == b.dns_host {
                return Err(ConfigError::DuplicateHost {
                    host: a.dns_host.clone(),
                    existing: a.name.clone(),
                    loading: b.name.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Example definition for new deployments.
pub fn template() -> NetworkFile {
    NetworkFile {
        name: "SeederNet".to_string(),
        desc: "Description of SeederNet".to_string(),
        id: "0xabcdef01".to_string(),
        port: 1234,
        pver: 70001,
        dns_name: "seeder.example.com".to_string(),
        ttl: 600,
        initial_ip: None,
        seeder1: "seeder1.example.com".to_string(),
        seeder2: "seed1.bob.com".to_string(),
        seeder3: "seed2.example.com".to_string(),
    }
}

/// Write the template definition to [`TEMPLATE_FILE`] in the working
/// directory.
pub fn write_template() -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(&template())?;
    fs::write(TEMPLATE_FILE, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NetworkFile {
        NetworkFile {
            name: "TestNet".to_string(),
            desc: "test".to_string(),
            id: "0xd0d0cafe".to_string(),
            port: 28333,
            pver: 70016,
            dns_name: "Seed.Example.COM".to_string(),
            ttl: 600,
            initial_ip: Some("1.2.3.4".to_string()),
            seeder1: "dnsseed1.example.com".to_string(),
            seeder2: String::new(),
            seeder3: "dnsseed3.example.com".to_string(),
        }
    }

    #[test]
    fn parses_json_definition() {
        let json = r#"{
            "Name": "TestNet",
            "Desc": "a test network",
            "ID": "0xd0d0cafe",
            "Port": 28333,
            "Pver": 70016,
            "DNSName": "seed.example.com",
            "TTL": 600,
            "Seeder1": "dnsseed1.example.com"
        }"#;

        let file: NetworkFile = serde_json::from_str(json).unwrap();
        let cfg = SeederConfig::from_network_file(file).unwrap();

        assert_eq!(cfg.name, "TestNet");
        assert_eq!(cfg.port, 28333);
        assert_eq!(cfg.dns_host, "seed.example.com");
        assert_eq!(cfg.magic, Magic::from_bytes([0xfe, 0xca, 0xd0, 0xd0]));
        assert_eq!(cfg.seeders, vec!["dnsseed1.example.com".to_string()]);
        assert_eq!(cfg.max_size, 1250);
        assert_eq!(cfg.max_start, [20, 20, 20, 30]);
        assert_eq!(cfg.delay, [210, 789, 234, 1876]);
    }

    #[test]
    fn normalizes_host_and_floors_ttl() {
        let mut file = sample();
        file.ttl = 10;

        let cfg = SeederConfig::from_network_file(file).unwrap();
        assert_eq!(cfg.dns_host, "seed.example.com");
        assert_eq!(cfg.ttl, 60);
        assert_eq!(cfg.initial_ip, Some("1.2.3.4".parse().unwrap()));
        assert_eq!(cfg.seeders.len(), 2);
    }

    #[test]
    fn rejects_invalid_fields() {
        let mut file = sample();
        file.port = 0;
        assert!(matches!(
            SeederConfig::from_network_file(file),
            Err(ConfigError::InvalidPort)
        ));

        let mut file = sample();
        file.dns_name = String::new();
        assert!(matches!(
            SeederConfig::from_network_file(file),
            Err(ConfigError::MissingDnsName)
        ));

        let mut file = sample();
        file.id = "not-a-number".to_string();
        assert!(matches!(
            SeederConfig::from_network_file(file),
            Err(ConfigError::InvalidMagic(_))
        ));
    }

    #[test]
    fn unparseable_initial_ip_is_dropped() {
        let mut file = sample();
        file.initial_ip = Some("not-an-ip".to_string());

        let cfg = SeederConfig::from_network_file(file).unwrap();
        assert_eq!(cfg.initial_ip, None);
    }

    #[test]
    fn detects_duplicate_identities() {
        let a = SeederConfig::from_network_file(sample()).unwrap();

        let mut same_magic = sample();
        same_magic.name = "Other".to_string();
        same_magic.dns_name = "other.example.com".to_string();
        let b = SeederConfig::from_network_file(same_magic).unwrap();
        assert!(matches!(
            check_duplicates(&[a.clone(), b]),
            Err(ConfigError::DuplicateMagic { .. })
        ));

        let mut same_host = sample();
        same_host.name = "Other".to_string();
        same_host.id = "0x01020304".to_string();
        let c = SeederConfig::from_network_file(same_host).unwrap();
        assert!(matches!(
            check_duplicates(&[a.clone(), c]),
            Err(ConfigError::DuplicateHost { .. })
        ));

        assert!(check_duplicates(&[a]).is_ok());
    }

    #[test]
    fn template_round_trips() {
        let json = serde_json::to_string_pretty(&template()).unwrap();
        let reparsed: NetworkFile = serde_json::from_str(&json).unwrap();
        let cfg = SeederConfig::from_network_file(reparsed).unwrap();

        assert_eq!(cfg.name, "SeederNet");
        assert_eq!(cfg.port, 1234);
        assert_eq!(cfg.ttl, 600);
    }
}
