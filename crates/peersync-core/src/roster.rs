//! Known peers.
//!
//! The roster is filled by whatever discovery mechanism the host uses. The
//! engine reads it to address peers, to pick the clipboard format a peer
//! understands and to decide which side of a pair opens the control stream.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Information about a peer, as supplied by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Stable peer identity
    pub id: String,
    /// Last known IP address
    pub ip: IpAddr,
    /// Port the peer's stream transport listens on
    pub port: u16,
    /// Platform tag
    pub platform: String,
    /// Human-readable device name
    pub device_name: String,
    /// The peer understands the combined `XCLIP_CB` clipboard format
    pub supports_extended_clipboard: bool,
}

impl ClientInfo {
    /// Socket address of the peer's transport listener.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Shared, concurrently readable set of known peers.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    peers: Arc<RwLock<HashMap<String, ClientInfo>>>,
}

impl Roster {
    /// Create an empty roster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a peer.
    pub async fn upsert(&self, info: ClientInfo) {
        self.peers.write().await.insert(info.id.clone(), info);
    }

    /// Forget a peer. Returns the removed entry.
    pub async fn remove(&self, id: &str) -> Option<ClientInfo> {
        self.peers.write().await.remove(id)
    }

    /// Look up a peer.
    pub async fn get(&self, id: &str) -> Option<ClientInfo> {
        self.peers.read().await.get(id).cloned()
    }

    /// All known peers, sorted by id.
    pub async fn list(&self) -> Vec<ClientInfo> {
        let mut peers: Vec<_> = self.peers.read().await.values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }
}

/// Whether `local` opens the control stream to `remote`.
///
/// Exactly one side of any pair of distinct ids dials: the higher one.
#[must_use]
pub fn should_dial(local: &str, remote: &str) -> bool {
    local > remote
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn info(id: &str) -> ClientInfo {
        ClientInfo {
            id: id.to_string(),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 52600,
            platform: "linux".to_string(),
            device_name: format!("{id}-device"),
            supports_extended_clipboard: true,
        }
    }

    #[test]
    fn test_should_dial_is_asymmetric() {
        assert!(should_dial("phone", "desk"));
        assert!(!should_dial("desk", "phone"));
        assert!(!should_dial("desk", "desk"));
    }

    #[tokio::test]
    async fn test_roster_upsert_and_list() {
        let roster = Roster::new();
        roster.upsert(info("phone")).await;
        roster.upsert(info("desk")).await;

        let mut updated = info("desk");
        updated.port = 9000;
        roster.upsert(updated).await;

        let ids: Vec<_> = roster.list().await.into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["desk", "phone"]);
        assert_eq!(roster.get("desk").await.map(|c| c.port), Some(9000));

        assert!(roster.remove("desk").await.is_some());
        assert!(roster.get("desk").await.is_none());
    }

    #[test]
    fn test_client_addr() {
        assert_eq!(info("desk").addr().to_string(), "127.0.0.1:52600");
    }
}
