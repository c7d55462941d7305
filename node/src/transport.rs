//! Peer registry and HTTP delivery of consensus messages

use async_trait::async_trait;
use meridian_consensus::{Envelope, ProposeAck, Proposer, ProtocolManager, Transport};
use meridian_core::{
    ClientRequestId, GroupId, MemberInfo, MeridianError, MeridianResult, NodeId, PublicKey, TransportConfig,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::api::ApiResponse;

/// Where a peer can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub public_key: PublicKey,
    pub url: String,
}

/// Resolves `NodeId`s to keys and base URLs
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<NodeId, PeerEntry>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &TransportConfig) -> MeridianResult<Self> {
        let directory = Self::new();
        for peer in &config.peers {
            let node_id = NodeId::from_hex(&peer.node_id)
                .map_err(|e| MeridianError::ConfigError(format!("peer node id {}: {}", peer.node_id, e)))?;
            let public_key = PublicKey::from_hex(&peer.public_key)
                .map_err(|e| MeridianError::ConfigError(format!("peer key {}: {}", peer.public_key, e)))?;
            let member = MemberInfo { node_id, public_key };
            if !meridian_crypto::verify_member(&member) {
                return Err(MeridianError::ConfigError(format!(
                    "peer {} does not match its public key",
                    peer.node_id
                )));
            }
            directory.insert(node_id, public_key, peer.url.trim_end_matches('/'));
        }
        Ok(directory)
    }

    pub fn insert(&self, node_id: NodeId, public_key: PublicKey, url: impl Into<String>) {
        self.peers.write().insert(
            node_id,
            PeerEntry {
                public_key,
                url: url.into(),
            },
        );
    }

    pub fn get(&self, node_id: &NodeId) -> Option<PeerEntry> {
        self.peers.read().get(node_id).cloned()
    }

    pub fn url(&self, node_id: &NodeId) -> MeridianResult<String> {
        self.get(node_id)
            .map(|p| p.url)
            .ok_or_else(|| MeridianError::PeerNotFound(node_id.to_hex()))
    }

    pub fn member_info(&self, node_id: &NodeId) -> Option<MemberInfo> {
        self.get(node_id).map(|p| MemberInfo {
            node_id: *node_id,
            public_key: p.public_key,
        })
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

/// Posts bincode envelopes to `{peer}/consensus/message`
pub struct HttpTransport {
    client: reqwest::Client,
    directory: Arc<PeerDirectory>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(directory: Arc<PeerDirectory>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            directory,
            timeout,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, to: NodeId, envelope: Envelope) -> MeridianResult<()> {
        let url = format!("{}/consensus/message", self.directory.url(&to)?);
        let body = bincode::serialize(&envelope)?;
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .timeout(self.timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MeridianError::Timeout(format!("send to {}", to))
                } else {
                    MeridianError::NetworkError(format!("send to {}: {}", to, e))
                }
            })?;

        if !response.status().is_success() {
            debug!(peer = %to, status = %response.status(), "Peer refused message");
            return Err(MeridianError::NetworkError(format!(
                "{} answered {}",
                to,
                response.status()
            )));
        }
        Ok(())
    }
}

/// Proposal body accepted by `/groups/:id/propose`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeRequest {
    /// Hex-encoded command bytes
    pub data: String,
    /// Idempotency key; generated when absent
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Proposes on the local manager and follows leader hints to other nodes
pub struct RoutedProposer {
    manager: Arc<ProtocolManager>,
    directory: Arc<PeerDirectory>,
    client: reqwest::Client,
    timeout: Duration,
}

impl RoutedProposer {
    pub fn new(manager: Arc<ProtocolManager>, directory: Arc<PeerDirectory>, timeout: Duration) -> Self {
        Self {
            manager,
            directory,
            client: reqwest::Client::new(),
            timeout,
        }
    }

    async fn forward(
        &self,
        leader: NodeId,
        group: GroupId,
        data: &[u8],
        request_id: ClientRequestId,
    ) -> MeridianResult<ProposeAck> {
        let url = format!("{}/groups/{}/propose", self.directory.url(&leader)?, group.0);
        let request = ProposeRequest {
            data: hex::encode(data),
            request_id: Some(request_id.to_string()),
        };
        debug!(%group, %leader, %request_id, "Forwarding proposal to leader");

        let response: ApiResponse<ProposeAck> = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| MeridianError::NetworkError(format!("forward to {}: {}", leader, e)))?
            .json()
            .await
            .map_err(|e| MeridianError::NetworkError(format!("bad reply from {}: {}", leader, e)))?;

        match (response.data, response.error) {
            (Some(ack), _) => Ok(ack),
            (None, error) => Err(MeridianError::Unavailable(
                error.unwrap_or_else(|| format!("{} returned no ack", leader)),
            )),
        }
    }
}

#[async_trait]
impl Proposer for RoutedProposer {
    async fn propose(&self, group: GroupId, data: Vec<u8>, request_id: ClientRequestId) -> MeridianResult<ProposeAck> {
        match self.manager.propose(group, data.clone(), request_id).await {
            Err(MeridianError::NotLeader { leader: Some(leader) }) if leader != self.manager.node_id() => {
                self.forward(leader, group, &data, request_id).await
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!(%group, %request_id, error = %e, "Proposal not accepted");
                }
                Err(e)
            }
            ok => ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::PeerConfig;
    use meridian_crypto::KeyPair;

    fn peer(seed: u8, url: &str) -> (KeyPair, PeerConfig) {
        let key = KeyPair::from_seed(&[seed; 32]);
        let config = PeerConfig {
            node_id: key.node_id().to_hex(),
            public_key: key.public_key().to_hex(),
            url: url.to_string(),
        };
        (key, config)
    }

    #[test]
    fn test_directory_from_config() {
        let (key, entry) = peer(1, "http://127.0.0.1:9001/");
        let config = TransportConfig {
            peers: vec![entry],
            ..Default::default()
        };
        let directory = PeerDirectory::from_config(&config).unwrap();

        assert_eq!(directory.len(), 1);
        assert_eq!(directory.url(&key.node_id()).unwrap(), "http://127.0.0.1:9001");
        assert_eq!(directory.member_info(&key.node_id()), Some(key.member_info()));
        assert!(matches!(
            directory.url(&KeyPair::from_seed(&[2; 32]).node_id()),
            Err(MeridianError::PeerNotFound(_))
        ));
    }

    #[test]
    fn test_directory_rejects_mismatched_key() {
        let (_, mut entry) = peer(1, "http://a");
        entry.public_key = KeyPair::from_seed(&[9; 32]).public_key().to_hex();
        let config = TransportConfig {
            peers: vec![entry],
            ..Default::default()
        };
        assert!(matches!(
            PeerDirectory::from_config(&config),
            Err(MeridianError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let transport = HttpTransport::new(Arc::new(PeerDirectory::new()), Duration::from_millis(50));
        let envelope = Envelope::new(
            GroupId(1),
            KeyPair::from_seed(&[1; 32]).node_id(),
            meridian_consensus::ConsensusMessage::CheckpointRequest { from_index: 0 },
        );
        let result = transport.send(KeyPair::from_seed(&[2; 32]).node_id(), envelope).await;
        assert!(matches!(result, Err(MeridianError::PeerNotFound(_))));
    }
}
