//! Parameter catalogs for the interop matrix.
//!
//! Everything here is read-only once built; a single [`Catalog`] is created
//! at startup and shared by reference with every scenario.

use super::Result;
use crate::error::HarnessError;
use std::fmt;
use std::path::{Path, PathBuf};

/// TLS protocol versions, ordered oldest to newest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [Self::Tls13, Self::Tls12, Self::Tls11, Self::Tls10];

    pub fn id(self) -> &'static str {
        match self {
            Self::Tls10 => "TLS1.0",
            Self::Tls11 => "TLS1.1",
            Self::Tls12 => "TLS1.2",
            Self::Tls13 => "TLS1.3",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Key algorithm of a certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    Rsa,
    Ec,
    Ed25519,
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rsa => "RSA",
            Self::Ec => "EC",
            Self::Ed25519 => "ED25519",
        })
    }
}

/// A cipher suite together with the spellings each provider expects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cipher {
    /// IANA name, also used as the display id
    pub name: &'static str,
    /// OpenSSL spelling
    pub openssl: &'static str,
    /// GnuTLS priority tokens for key exchange, cipher and MAC
    pub gnutls: &'static str,
    /// s2n cipher preference that contains the suite
    pub s2n: &'static str,
    /// Oldest protocol the suite can be negotiated with
    pub min_version: Protocol,
    /// Certificate algorithm the suite authenticates with, if fixed
    pub auth: Option<KeyAlgorithm>,
}

impl Cipher {
    pub fn is_tls13(&self) -> bool {
        self.min_version == Protocol::Tls13
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

pub const ALL_TEST_CIPHERS: [Cipher; 9] = [
    Cipher {
        name: "TLS_AES_128_GCM_SHA256",
        openssl: "TLS_AES_128_GCM_SHA256",
        gnutls: "+AES-128-GCM:+AEAD",
        s2n: "test_all_tls13",
        min_version: Protocol::Tls13,
        auth: None,
    },
    Cipher {
        name: "TLS_AES_256_GCM_SHA384",
        openssl: "TLS_AES_256_GCM_SHA384",
        gnutls: "+AES-256-GCM:+AEAD",
        s2n: "test_all_tls13",
        min_version: Protocol::Tls13,
        auth: None,
    },
    Cipher {
        name: "TLS_CHACHA20_POLY1305_SHA256",
        openssl: "TLS_CHACHA20_POLY1305_SHA256",
        gnutls: "+CHACHA20-POLY1305:+AEAD",
        s2n: "test_all_tls13",
        min_version: Protocol::Tls13,
        auth: None,
    },
    Cipher {
        name: "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
        openssl: "ECDHE-RSA-AES128-GCM-SHA256",
        gnutls: "+ECDHE-RSA:+AES-128-GCM:+AEAD",
        s2n: "test_all",
        min_version: Protocol::Tls12,
        auth: Some(KeyAlgorithm::Rsa),
    },
    Cipher {
        name: "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
        openssl: "ECDHE-RSA-AES256-GCM-SHA384",
        gnutls: "+ECDHE-RSA:+AES-256-GCM:+AEAD",
        s2n: "test_all",
        min_version: Protocol::Tls12,
        auth: Some(KeyAlgorithm::Rsa),
    },
    Cipher {
        name: "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
        openssl: "ECDHE-ECDSA-AES128-GCM-SHA256",
        gnutls: "+ECDHE-ECDSA:+AES-128-GCM:+AEAD",
        s2n: "test_all",
        min_version: Protocol::Tls12,
        auth: Some(KeyAlgorithm::Ec),
    },
    Cipher {
        name: "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
        openssl: "ECDHE-ECDSA-AES256-GCM-SHA384",
        gnutls: "+ECDHE-ECDSA:+AES-256-GCM:+AEAD",
        s2n: "test_all",
        min_version: Protocol::Tls12,
        auth: Some(KeyAlgorithm::Ec),
    },
    Cipher {
        name: "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
        openssl: "ECDHE-RSA-AES128-SHA",
        gnutls: "+ECDHE-RSA:+AES-128-CBC:+SHA1",
        s2n: "test_all",
        min_version: Protocol::Tls10,
        auth: Some(KeyAlgorithm::Rsa),
    },
    Cipher {
        name: "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA",
        openssl: "ECDHE-ECDSA-AES128-SHA",
        gnutls: "+ECDHE-ECDSA:+AES-128-CBC:+SHA1",
        s2n: "test_all",
        min_version: Protocol::Tls10,
        auth: Some(KeyAlgorithm::Ec),
    },
];

/// Key exchange groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Curve {
    P256,
    P384,
    P521,
    X25519,
}

impl Curve {
    pub const ALL: [Curve; 4] = [Self::P256, Self::P384, Self::P521, Self::X25519];

    pub fn id(self) -> &'static str {
        match self {
            Self::P256 => "P-256",
            Self::P384 => "P-384",
            Self::P521 => "P-521",
            Self::X25519 => "x25519",
        }
    }

    pub fn openssl(self) -> &'static str {
        match self {
            Self::P256 => "P-256",
            Self::P384 => "P-384",
            Self::P521 => "P-521",
            Self::X25519 => "X25519",
        }
    }

    pub fn gnutls(self) -> &'static str {
        match self {
            Self::P256 => "+GROUP-SECP256R1",
            Self::P384 => "+GROUP-SECP384R1",
            Self::P521 => "+GROUP-SECP521R1",
            Self::X25519 => "+GROUP-X25519",
        }
    }
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// A certificate/key fixture pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub name: String,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub algorithm: KeyAlgorithm,
}

impl Certificate {
    pub fn new(
        name: impl Into<String>,
        cert: impl Into<PathBuf>,
        key: impl Into<PathBuf>,
        algorithm: KeyAlgorithm,
    ) -> Self {
        Self {
            name: name.into(),
            cert: cert.into(),
            key: key.into(),
            algorithm,
        }
    }

    /// The certificates that have a stapled OCSP response fixture
    pub fn ocsp_fixtures(cert_dir: &Path) -> Vec<Certificate> {
        vec![
            Self::new(
                "OCSP",
                cert_dir.join("ocsp/server_cert.pem"),
                cert_dir.join("ocsp/server_key.pem"),
                KeyAlgorithm::Rsa,
            ),
            Self::new(
                "OCSP_ECDSA",
                cert_dir.join("ocsp/server_ecdsa_cert.pem"),
                cert_dir.join("ocsp/server_ecdsa_key.pem"),
                KeyAlgorithm::Ec,
            ),
        ]
    }
}

impl fmt::Display for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Precomputed OCSP responses, one per certificate key algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcspFixtures {
    pub dir: PathBuf,
}

impl OcspFixtures {
    pub const RSA_RESPONSE: &'static str = "ocsp_response.der";
    pub const EC_RESPONSE: &'static str = "ocsp_ecdsa_response.der";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Looks up the response to staple for a certificate's key algorithm
    ///
    /// # Returns
    /// * `Result<PathBuf>` - `HarnessError::Config` when no fixture is mapped
    ///   or the mapped file does not exist
    pub fn for_algorithm(&self, algorithm: KeyAlgorithm) -> Result<PathBuf> {
        let file = match algorithm {
            KeyAlgorithm::Rsa => Self::RSA_RESPONSE,
            KeyAlgorithm::Ec => Self::EC_RESPONSE,
            other => {
                return Err(HarnessError::config(format!(
                    "no OCSP response fixture for {} certificates",
                    other
                ))
                .into())
            }
        };
        let path = self.dir.join(file);
        if !path.is_file() {
            return Err(HarnessError::config(format!(
                "OCSP response fixture {} does not exist",
                path.display()
            ))
            .into());
        }
        Ok(path)
    }
}

/// Every parameter dimension of the matrix
#[derive(Debug, Clone)]
pub struct Catalog {
    pub ciphers: Vec<Cipher>,
    pub curves: Vec<Curve>,
    pub protocols: Vec<Protocol>,
    pub certificates: Vec<Certificate>,
    pub ocsp: OcspFixtures,
}

impl Catalog {
    /// The full OCSP catalog rooted at the given fixture directories
    pub fn ocsp(cert_dir: &Path, ocsp_dir: &Path) -> Self {
        Self {
            ciphers: ALL_TEST_CIPHERS.to_vec(),
            curves: Curve::ALL.to_vec(),
            protocols: Protocol::ALL.to_vec(),
            certificates: Certificate::ocsp_fixtures(cert_dir),
            ocsp: OcspFixtures::new(ocsp_dir),
        }
    }

    /// Keeps only values whose display id is listed. Empty lists keep everything.
    pub fn restrict(
        mut self,
        ciphers: &[String],
        curves: &[String],
        protocols: &[String],
        certificates: &[String],
    ) -> Self {
        fn keep<T: fmt::Display>(values: &mut Vec<T>, ids: &[String]) {
            if !ids.is_empty() {
                values.retain(|v| ids.iter().any(|id| id.eq_ignore_ascii_case(&v.to_string())));
            }
        }
        keep(&mut self.ciphers, ciphers);
        keep(&mut self.curves, curves);
        keep(&mut self.protocols, protocols);
        keep(&mut self.certificates, certificates);
        self
    }
}
