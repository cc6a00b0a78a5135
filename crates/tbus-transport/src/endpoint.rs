use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::TransportError;

/// Network address of a tbus service plus the credentials a client would
/// need to reach it.
///
/// Endpoints travel on the wire as JSON (inside `resolution` responses and
/// `addTopics` config requests), so the field names are part of the
/// protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// `host:port`.
    pub address: String,

    /// TLS server name to present during the handshake.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "serverNameIndication"
    )]
    pub server_name: Option<String>,

    /// PEM root certificate the server is expected to chain to.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "tlsCertificate"
    )]
    pub tls_certificate: Option<String>,
}

impl Endpoint {
    /// Plain TCP endpoint.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            server_name: None,
            tls_certificate: None,
        }
    }

    /// Attach TLS credentials.
    pub fn with_tls(mut self, server_name: impl Into<String>, certificate: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self.tls_certificate = Some(certificate.into());
        self
    }

    pub fn requires_tls(&self) -> bool {
        self.tls_certificate.is_some()
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> String {
        // A struct of strings cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse the JSON wire form.
    pub fn from_json(data: &str) -> Result<Self, TransportError> {
        let endpoint: Endpoint = serde_json::from_str(data)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{e}: {data}")))?;
        if endpoint.address.is_empty() {
            return Err(TransportError::InvalidEndpoint("empty address".into()));
        }
        Ok(endpoint)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    /// Parse a bare `host:port` into a plain TCP endpoint.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Endpoint::new(s))
            }
            _ => Err(TransportError::InvalidEndpoint(s.to_string())),
        }
    }
}
