//! Authentication state and server identity

use sha1::{Digest, Sha1};

use crate::message::HtspMessage;

/// Authenticator lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AuthenticationState {
    /// No handshake running; the connection is not (yet) established
    #[default]
    NotAuthenticating,
    /// `hello` / `authenticate` exchange in progress
    Authenticating,
    /// Server accepted the credentials
    Authenticated,
    /// Server rejected the credentials or did not answer in time
    Failed,
}

impl std::fmt::Display for AuthenticationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AuthenticationState::NotAuthenticating => "NOT_AUTHENTICATING",
            AuthenticationState::Authenticating => "AUTHENTICATING",
            AuthenticationState::Authenticated => "AUTHENTICATED",
            AuthenticationState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// What the server announced in its `hello` reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub htsp_version: i64,
    pub server_name: String,
    pub server_version: String,
    pub capabilities: Vec<String>,
}

impl ServerInfo {
    pub fn from_hello(reply: &HtspMessage) -> Self {
        let capabilities = reply
            .get_list("servercapability")
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            htsp_version: reply.get_i64_or("htspversion", 0),
            server_name: reply.get_str_or("servername", "").to_owned(),
            server_version: reply.get_str_or("serverversion", "").to_owned(),
            capabilities,
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// `SHA1(password || challenge)`, the `digest` field of `authenticate`
pub fn compute_digest(password: &str, challenge: &[u8]) -> [u8; 20] {
    let mut sha1 = Sha1::new();
    sha1.update(password.as_bytes());
    sha1.update(challenge);
    let mut digest = [0u8; 20];
    digest.copy_from_slice(&sha1.finalize());
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HtspValue;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[test]
    fn test_digest() {
        assert_eq!(
            hex(&compute_digest("secret", &[1, 2, 3, 4])),
            "b890ddd0121d27d67bc8309935676061e6f7dfe7"
        );
        // Empty challenge is plain SHA1 of the password
        assert_eq!(
            hex(&compute_digest("abc", &[])),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_server_info_from_hello() {
        let reply = HtspMessage::new()
            .field("htspversion", 34)
            .field("servername", "HTS Tvheadend")
            .field("serverversion", "4.3")
            .field(
                "servercapability",
                vec![HtspValue::from("timeshift"), HtspValue::from("imagecache")],
            );

        let info = ServerInfo::from_hello(&reply);
        assert_eq!(info.htsp_version, 34);
        assert_eq!(info.server_name, "HTS Tvheadend");
        assert!(info.has_capability("timeshift"));
        assert!(!info.has_capability("caclient"));
    }

    #[test]
    fn test_server_info_missing_fields() {
        let info = ServerInfo::from_hello(&HtspMessage::new());
        assert_eq!(info, ServerInfo::default());
    }

    #[test]
    fn test_display() {
        assert_eq!(AuthenticationState::Authenticated.to_string(), "AUTHENTICATED");
        assert_eq!(AuthenticationState::default(), AuthenticationState::NotAuthenticating);
    }
}
