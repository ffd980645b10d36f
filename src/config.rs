use super::Result;
use crate::catalog::{Cipher, Curve, Protocol};
use crate::error::HarnessError;
use std::fmt;
use std::path::PathBuf;

/// Which end of the connection a process plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Client => "client",
            Self::Server => "server",
        })
    }
}

/// Negotiation parameters both endpoints of one scenario share
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeParams {
    pub port: u16,
    pub cipher: Cipher,
    pub curve: Curve,
    pub protocol: Protocol,
}

/// How one endpoint should be launched.
///
/// Built with the consuming `with_*` methods, then treated as immutable.
/// Client and server of a scenario are built from the same
/// [`HandshakeParams`], so they cannot disagree on port, cipher, curve or
/// protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    pub role: Role,
    pub params: HandshakeParams,
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    /// OCSP response to staple (server)
    pub ocsp_response: Option<PathBuf>,
    /// Skip trust-chain validation of the peer
    pub insecure: bool,
    /// Application data this endpoint sends
    pub payload: Option<Vec<u8>>,
    /// Provider-specific arguments appended to the generated command line
    pub extra_flags: Vec<String>,
    /// Ask the server to staple an OCSP response (client)
    pub enable_ocsp_request: bool,
}

impl ProcessConfig {
    pub fn client(params: HandshakeParams) -> Self {
        Self::new(Role::Client, params)
    }

    pub fn server(params: HandshakeParams) -> Self {
        Self::new(Role::Server, params)
    }

    fn new(role: Role, params: HandshakeParams) -> Self {
        Self {
            role,
            params,
            certificate: None,
            private_key: None,
            ocsp_response: None,
            insecure: false,
            payload: None,
            extra_flags: Vec::new(),
            enable_ocsp_request: false,
        }
    }

    pub fn with_identity(mut self, certificate: impl Into<PathBuf>, private_key: impl Into<PathBuf>) -> Self {
        self.certificate = Some(certificate.into());
        self.private_key = Some(private_key.into());
        self
    }

    pub fn with_ocsp_response(mut self, path: impl Into<PathBuf>) -> Self {
        self.ocsp_response = Some(path.into());
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_extra_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_flags.extend(flags.into_iter().map(Into::into));
        self
    }

    pub fn with_ocsp_request(mut self, enable: bool) -> Self {
        self.enable_ocsp_request = enable;
        self
    }

    pub fn port(&self) -> u16 {
        self.params.port
    }

    /// Checks the role-specific invariants
    ///
    /// # Returns
    /// * `Result<()>` - `HarnessError::Config` describing the first violation
    pub fn validate(&self) -> Result<()> {
        match self.role {
            Role::Server => {
                if self.certificate.is_none() || self.private_key.is_none() {
                    return Err(HarnessError::config("server needs a certificate and a private key").into());
                }
                if self.enable_ocsp_request {
                    return Err(HarnessError::config("OCSP requests are a client option").into());
                }
            }
            Role::Client => {
                if self.ocsp_response.is_some() {
                    return Err(HarnessError::config("only servers staple OCSP responses").into());
                }
            }
        }
        Ok(())
    }

    /// True if `other` is the opposite endpoint of the same handshake
    pub fn is_peer_of(&self, other: &ProcessConfig) -> bool {
        self.role != other.role && self.params == other.params
    }
}

/// Deterministic printable payload of `len` bytes.
///
/// Cycles through `a`..`z`; the last byte is a newline so line-buffered
/// clients flush it.
pub fn data_bytes(len: usize) -> Vec<u8> {
    let mut bytes: Vec<u8> = (0..len).map(|i| b'a' + (i % 26) as u8).collect();
    if let Some(last) = bytes.last_mut() {
        *last = b'\n';
    }
    bytes
}
