//! ICE server list assembly with time-limited TURN credentials.
//!
//! TURN credentials follow the coturn REST API convention
//! (`--use-auth-secret`): username = `expiry_timestamp:peer_id`,
//! credential = base64(HMAC-SHA1(secret, username)).

use base64::Engine as _;
use hmac::{Hmac, Mac};
use parley_protocol::IceServer;
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

/// TURN relay configuration; absent when no relay is deployed.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub urls: Vec<String>,
    pub secret: String,
    pub ttl_secs: u64,
}

/// Everything needed to build the ICE server list handed to clients.
#[derive(Debug, Clone, Default)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    pub turn: Option<TurnConfig>,
}

impl IceConfig {
    /// Builds the ICE server list for one peer: static STUN entries plus,
    /// when a relay is configured, a TURN entry with credentials minted for
    /// that peer. No relay means STUN-only, never an error.
    pub fn servers_for(&self, peer_id: &str) -> Vec<IceServer> {
        let mut servers: Vec<IceServer> = self
            .stun_urls
            .iter()
            .map(|url| IceServer {
                urls: vec![url.clone()],
                username: None,
                credential: None,
            })
            .collect();

        if let Some(turn) = &self.turn {
            servers.push(turn.credentials_for(peer_id));
        }
        servers
    }
}

impl TurnConfig {
    fn credentials_for(&self, peer_id: &str) -> IceServer {
        let expiry = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            + self.ttl_secs;
        let username = format!("{expiry}:{peer_id}");

        let mut mac =
            HmacSha1::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(username.as_bytes());
        let credential =
            base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        IceServer {
            urls: self.urls.clone(),
            username: Some(username),
            credential: Some(credential),
        }
    }
}
