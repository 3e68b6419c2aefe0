use serde::{Deserialize, Serialize};

use crate::error::{ConcordError, Result};

/// One other cluster member, as identified on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub ip: String,
    pub tcp_port: u16,
}

impl PeerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.tcp_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    Raft,
    Paxos,
}

impl std::str::FromStr for Algorithm {
    type Err = ConcordError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "raft" => Ok(Algorithm::Raft),
            "paxos" => Ok(Algorithm::Paxos),
            other => Err(ConcordError::UnknownAlgorithm(other.to_string())),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Algorithm::Raft => write!(f, "raft"),
            Algorithm::Paxos => write!(f, "paxos"),
        }
    }
}

/// Configuration for a single cluster node, as described in spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: u32,
    pub node_ip: String,
    pub http_port: u16,
    pub tcp_port: u16,
    pub peers: Vec<PeerConfig>,
    pub algorithm: Algorithm,
}

impl NodeConfig {
    /// Loads configuration from the process environment, layered through
    /// the `config` crate the way `josefine-raft`'s own dependency on it
    /// intends, with defaults matching `original_source/consensus_server.py::main`.
    pub fn from_env() -> Result<NodeConfig> {
        let mut cfg = config::Config::default();
        cfg.merge(config::Environment::new())
            .map_err(|e| ConcordError::Config(e.to_string()))?;

        let node_id = cfg
            .get_int("node_id")
            .unwrap_or(1) as u32;
        let node_ip = cfg
            .get_str("node_ip")
            .unwrap_or_else(|_| "127.0.0.1".to_string());
        let http_port = cfg.get_int("http_port").unwrap_or(8000) as u16;
        let tcp_port = cfg.get_int("tcp_port").unwrap_or(5000) as u16;
        let algorithm: Algorithm = cfg
            .get_str("algorithm")
            .unwrap_or_else(|_| "raft".to_string())
            .parse()?;

        let peers = cfg
            .get_str("peers")
            .map(|s| parse_peers(&s))
            .unwrap_or_default();

        Ok(NodeConfig {
            node_id,
            node_ip,
            http_port,
            tcp_port,
            peers,
            algorithm,
        })
    }
}

fn parse_peers(raw: &str) -> Vec<PeerConfig> {
    raw.split(';')
        .filter(|p| !p.is_empty())
        .filter_map(|p| {
            let (ip, port) = p.split_once(':')?;
            Some(PeerConfig {
                ip: ip.to_string(),
                tcp_port: port.parse().ok()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_peer_list() {
        let peers = parse_peers("10.0.0.2:5001;10.0.0.3:5002");
        assert_eq!(
            peers,
            vec![
                PeerConfig { ip: "10.0.0.2".into(), tcp_port: 5001 },
                PeerConfig { ip: "10.0.0.3".into(), tcp_port: 5002 },
            ]
        );
    }

    #[test]
    fn empty_peer_list_is_empty() {
        assert!(parse_peers("").is_empty());
    }

    #[test]
    fn algorithm_parses_case_insensitively() {
        assert_eq!("RAFT".parse::<Algorithm>().unwrap(), Algorithm::Raft);
        assert_eq!("paxos".parse::<Algorithm>().unwrap(), Algorithm::Paxos);
        assert!("pbft".parse::<Algorithm>().is_err());
    }
}
