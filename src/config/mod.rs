//! `Common.cfg` and `PeerInfo.cfg` loading.

use crate::error::{PeerError, Result};
use crate::peer::PeerId;
use crate::piece::PieceLayout;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::fs;

pub const COMMON_CFG: &str = "Common.cfg";
pub const PEER_INFO_CFG: &str = "PeerInfo.cfg";

/// Settings shared by every peer, from `Common.cfg`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonConfig {
    pub num_pref_neighbors: usize,
    pub unchoke_interval: Duration,
    pub optimistic_interval: Duration,
    pub file_name: String,
    pub file_size: u64,
    pub piece_size: u64,
}

impl CommonConfig {
    pub fn layout(&self) -> PieceLayout {
        PieceLayout::new(self.file_size, self.piece_size)
    }
}

/// One roster line of `PeerInfo.cfg`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub host: String,
    pub port: u16,
    pub has_file: bool,
}

impl PeerInfo {
    /// Resolve the peer's host
    pub async fn socket_addr(&self) -> Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                PeerError::Config(format!("cannot resolve {}:{}", self.host, self.port))
            })
    }
}

/// The fixed, ordered set of peers taking part in the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    peers: Vec<PeerInfo>,
}

impl Roster {
    pub fn new(peers: Vec<PeerInfo>) -> Result<Self> {
        let mut seen = HashSet::new();
        for peer in &peers {
            if !seen.insert(peer.peer_id) {
                return Err(PeerError::Config(format!(
                    "peer {} listed twice",
                    peer.peer_id
                )));
            }
        }
        Ok(Self { peers })
    }

    pub fn get(&self, peer_id: PeerId) -> Option<&PeerInfo> {
        self.peers.iter().find(|p| p.peer_id == peer_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Peers listed before `peer_id`; these are the ones it dials
    pub fn predecessors(&self, peer_id: PeerId) -> &[PeerInfo] {
        match self.position(peer_id) {
            Some(pos) => &self.peers[..pos],
            None => &[],
        }
    }

    /// Peers listed after `peer_id`; these dial it
    pub fn successors(&self, peer_id: PeerId) -> &[PeerInfo] {
        match self.position(peer_id) {
            Some(pos) => &self.peers[pos + 1..],
            None => &[],
        }
    }

    fn position(&self, peer_id: PeerId) -> Option<usize> {
        self.peers.iter().position(|p| p.peer_id == peer_id)
    }
}

/// Everything a peer process needs from the working directory
#[derive(Debug, Clone)]
pub struct Config {
    pub common: CommonConfig,
    pub roster: Roster,
}

impl Config {
    /// Load `Common.cfg` and `PeerInfo.cfg` from `dir`
    pub async fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let common = load_common_cfg(dir.join(COMMON_CFG)).await?;
        let roster = load_peer_cfg(dir.join(PEER_INFO_CFG)).await?;
        Ok(Self { common, roster })
    }
}

pub async fn load_common_cfg<P: AsRef<Path>>(path: P) -> Result<CommonConfig> {
    let text = read_cfg(path.as_ref()).await?;
    parse_common_cfg(&text)
}

pub async fn load_peer_cfg<P: AsRef<Path>>(path: P) -> Result<Roster> {
    let text = read_cfg(path.as_ref()).await?;
    parse_peer_cfg(&text)
}

async fn read_cfg(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .await
        .map_err(|e| PeerError::Config(format!("cannot read {}: {}", path.display(), e)))
}

/// Parse `Key Value` lines
pub fn parse_common_cfg(text: &str) -> Result<CommonConfig> {
    let mut values = HashMap::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (key, value) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| PeerError::Config(format!("missing value in line {:?}", line)))?;
        values.insert(key, value.trim());
    }

    let get = |key: &str| {
        values
            .get(key)
            .copied()
            .ok_or_else(|| PeerError::Config(format!("missing key {}", key)))
    };
    let seconds = |key: &str| -> Result<Duration> {
        Ok(Duration::from_secs(parse_number(get(key)?, key)?))
    };

    let config = CommonConfig {
        num_pref_neighbors: parse_number(
            get("NumberOfPreferredNeighbors")?,
            "NumberOfPreferredNeighbors",
        )?,
        unchoke_interval: seconds("UnchokingInterval")?,
        optimistic_interval: seconds("OptimisticUnchokingInterval")?,
        file_name: get("FileName")?.to_string(),
        file_size: parse_number(get("FileSize")?, "FileSize")?,
        piece_size: parse_number(get("PieceSize")?, "PieceSize")?,
    };

    if config.file_size == 0 || config.piece_size == 0 {
        return Err(PeerError::Config(
            "FileSize and PieceSize must be positive".to_string(),
        ));
    }
    if config.unchoke_interval.is_zero() || config.optimistic_interval.is_zero() {
        return Err(PeerError::Config(
            "unchoking intervals must be positive".to_string(),
        ));
    }
    if config.layout().piece_count() as u64 != config.file_size.div_ceil(config.piece_size) {
        return Err(PeerError::Config("too many pieces".to_string()));
    }

    Ok(config)
}

/// Parse `id host port has_file` lines
pub fn parse_peer_cfg(text: &str) -> Result<Roster> {
    let mut peers = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [id, host, port, has_file] = fields[..] else {
            return Err(PeerError::Config(format!(
                "expected 4 fields in line {:?}",
                line
            )));
        };

        let has_file = match has_file {
            "1" => true,
            "0" => false,
            other => {
                return Err(PeerError::Config(format!(
                    "has-file flag must be 0 or 1, got {:?}",
                    other
                )))
            }
        };

        peers.push(PeerInfo {
            peer_id: parse_number(id, "peer id")?,
            host: host.to_string(),
            port: parse_number(port, "port")?,
            has_file,
        });
    }

    Roster::new(peers)
}

fn parse_number<T: std::str::FromStr>(value: &str, what: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| PeerError::Config(format!("invalid {}: {:?}", what, value)))
}
