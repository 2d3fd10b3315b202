//! Server address and credentials

/// Immutable connection parameters shared by the reactor and authenticator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDetails {
    host: String,
    port: u16,
    username: String,
    password: String,
    client_name: String,
    client_version: String,
}

impl ConnectionDetails {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        client_name: impl Into<String>,
        client_version: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            client_name: client_name.into(),
            client_version: client_version.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn client_version(&self) -> &str {
        &self.client_version
    }

    /// `host:port`, suitable for `TcpStream::connect`
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            // Bare IPv6 literal
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
