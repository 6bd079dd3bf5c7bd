use crate::address::{AddressError, Cidr};
use crate::eager_env;
use crate::paxos::quorum_for;
use crate::peer::{PeerName, PeerNameError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONTAINER_DIED_GRACE: Duration = Duration::from_secs(30);
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_DATA_DIR: &str = "./data";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid universe: {0}")]
    Universe(AddressError),
    #[error("invalid default subnet: {0}")]
    DefaultSubnet(AddressError),
    #[error("default subnet {subnet} does not overlap the universe {universe}")]
    SubnetOutsideUniverse { subnet: Cidr, universe: Cidr },
    #[error("unknown mode '{0}', expected consensus[=N], seed=P1,P2,... or observer")]
    UnknownMode(String),
    #[error("invalid cluster size '{0}'")]
    ClusterSize(String),
    #[error("seed list must not be empty")]
    EmptySeed,
    #[error("observer mode takes no parameter")]
    ObserverParameter,
    #[error("invalid peer name: {0}")]
    PeerName(#[from] PeerNameError),
    #[error("invalid gossip peer '{0}', expected name=url")]
    GossipPeer(String),
    #[error("quorum must be at least 1")]
    Quorum,
}

/// How this peer gets its initial ring.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Mode {
    /// Wait until a ring arrives through gossip.
    #[default]
    Unset,
    /// Agree on the initial peers with Paxos. The cluster size is taken
    /// from the configured peers when not given.
    Consensus(Option<u32>),
    /// Build the initial ring from this list, identical on every peer.
    Seed(Vec<PeerName>),
    /// Never own any space, only relay.
    Observer,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (kind, param) = match s.split_once('=') {
            Some((kind, param)) => (kind, Some(param)),
            None => (s, None),
        };

        match (kind, param) {
            ("", None) => Ok(Mode::Unset),
            ("consensus", None) => Ok(Mode::Consensus(None)),
            ("consensus", Some(n)) => match n.parse::<u32>() {
                Ok(n) if n > 0 => Ok(Mode::Consensus(Some(n))),
                _ => Err(ConfigError::ClusterSize(n.to_string())),
            },
            ("seed", Some(list)) => {
                let peers = list
                    .split(',')
                    .filter(|p| !p.trim().is_empty())
                    .map(PeerName::from_str)
                    .collect::<Result<Vec<_>, _>>()?;
                if peers.is_empty() {
                    return Err(ConfigError::EmptySeed);
                }
                Ok(Mode::Seed(peers))
            }
            ("seed", None) => Err(ConfigError::EmptySeed),
            ("observer", None) => Ok(Mode::Observer),
            ("observer", Some(_)) => Err(ConfigError::ObserverParameter),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

/// Allocator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub our_name: PeerName,
    pub our_nickname: Option<String>,
    pub universe: Cidr,
    pub default_subnet: Cidr,
    pub mode: Mode,
    pub quorum_override: Option<u32>,
    /// Peers we know of at startup, ourselves included
    pub known_cluster_size: u32,
    pub request_timeout: Duration,
    pub container_died_grace: Duration,
    pub tick_interval: Duration,
}

impl Config {
    pub fn new(our_name: PeerName, universe: Cidr, mode: Mode) -> Result<Self, ConfigError> {
        universe.validate_subnet().map_err(ConfigError::Universe)?;
        Ok(Self {
            our_name,
            our_nickname: None,
            universe,
            default_subnet: universe,
            mode,
            quorum_override: None,
            known_cluster_size: 1,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            container_died_grace: CONTAINER_DIED_GRACE,
            tick_interval: TICK_INTERVAL,
        })
    }

    pub fn with_default_subnet(mut self, subnet: Cidr) -> Result<Self, ConfigError> {
        subnet
            .validate_subnet()
            .map_err(ConfigError::DefaultSubnet)?;
        if !subnet.range().overlaps(&self.universe.range()) {
            return Err(ConfigError::SubnetOutsideUniverse {
                subnet,
                universe: self.universe,
            });
        }
        self.default_subnet = subnet;
        Ok(self)
    }

    pub fn with_quorum(mut self, quorum: u32) -> Result<Self, ConfigError> {
        if quorum == 0 {
            return Err(ConfigError::Quorum);
        }
        self.quorum_override = Some(quorum);
        Ok(self)
    }

    pub fn is_observer(&self) -> bool {
        self.mode == Mode::Observer
    }

    /// Expected number of peers taking part in the election.
    pub fn cluster_size(&self) -> u32 {
        match self.mode {
            Mode::Consensus(Some(n)) => n,
            _ => self.known_cluster_size.max(1),
        }
    }

    pub fn quorum(&self) -> u32 {
        self.quorum_override
            .unwrap_or_else(|| quorum_for(self.cluster_size()))
    }
}

/// Everything `main` needs, read from the environment.
pub struct Settings {
    pub config: Config,
    pub port: u16,
    pub data_dir: PathBuf,
    pub gossip_peers: BTreeMap<PeerName, Url>,
    pub internal_password: String,
    pub track_ranges: bool,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let our_name: PeerName = eager_env::PEER_NAME.parse()?;
        let universe: Cidr = eager_env::IPAM_UNIVERSE
            .parse()
            .map_err(ConfigError::Universe)?;
        let mode: Mode = eager_env::IPAM_MODE.as_deref().unwrap_or("").parse()?;
        let gossip_peers = parse_gossip_peers(eager_env::IPAM_GOSSIP_PEERS.as_deref().unwrap_or(""))?;

        let mut config = Config::new(our_name.clone(), universe, mode)?;
        if let Some(subnet) = eager_env::IPAM_DEFAULT_SUBNET.as_deref() {
            let subnet: Cidr = subnet.parse().map_err(ConfigError::DefaultSubnet)?;
            config = config.with_default_subnet(subnet)?;
        }
        if let Some(quorum) = *eager_env::IPAM_QUORUM {
            config = config.with_quorum(quorum)?;
        }
        if let Some(seconds) = *eager_env::IPAM_REQUEST_TIMEOUT_SECONDS {
            config.request_timeout = Duration::from_secs(seconds);
        }
        config.our_nickname = eager_env::PEER_NICKNAME.clone();
        config.known_cluster_size = gossip_peers.keys().filter(|p| **p != our_name).count() as u32 + 1;

        Ok(Self {
            config,
            port: *eager_env::PORT,
            data_dir: PathBuf::from(
                eager_env::IPAM_DATA_DIR
                    .as_deref()
                    .unwrap_or(DEFAULT_DATA_DIR),
            ),
            gossip_peers,
            internal_password: eager_env::INTERNAL_PASSWORD.clone(),
            track_ranges: eager_env::IPAM_TRACK_RANGES.unwrap_or(false),
        })
    }
}

/// Parses `P2=http://10.0.0.2:8080,P3=http://10.0.0.3:8080`.
pub fn parse_gossip_peers(s: &str) -> Result<BTreeMap<PeerName, Url>, ConfigError> {
    s.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| -> Result<(PeerName, Url), ConfigError> {
            let (name, url) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::GossipPeer(entry.to_string()))?;
            let url = Url::parse(url.trim()).map_err(|_| ConfigError::GossipPeer(entry.to_string()))?;
            Ok((name.parse()?, url))
        })
        .collect()
}
