use base64::Engine;
use chrono::Utc;
use lanyard_models::IceServer;
use sha2::{Digest, Sha256};

/// Builds the ICE server list handed to clients at call-setup time. TURN
/// credentials are time-limited and regenerated on every request; STUN
/// entries carry no credentials.
#[derive(Debug, Clone)]
pub struct IceProvider {
    stun_urls: Vec<String>,
    turn_urls: Vec<String>,
    turn_secret: Option<String>,
    credential_ttl_secs: i64,
}

impl IceProvider {
    pub fn new(
        stun_urls: Vec<String>,
        turn_urls: Vec<String>,
        turn_secret: Option<String>,
        credential_ttl_secs: i64,
    ) -> Self {
        Self {
            stun_urls,
            turn_urls,
            turn_secret,
            credential_ttl_secs,
        }
    }

    pub fn ice_servers(&self, user_id: i64) -> Vec<IceServer> {
        let mut servers = Vec::new();
        if !self.stun_urls.is_empty() {
            servers.push(IceServer {
                urls: self.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }
        if let (Some(secret), false) = (&self.turn_secret, self.turn_urls.is_empty()) {
            let expiry = Utc::now().timestamp() + self.credential_ttl_secs;
            let username = format!("{expiry}:{user_id}");
            servers.push(IceServer {
                urls: self.turn_urls.clone(),
                credential: Some(derive_credential(secret, &username)),
                username: Some(username),
            });
        }
        servers
    }
}

fn derive_credential(secret: &str, username: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(username.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}
