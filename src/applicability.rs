use crate::catalog::{Certificate, Cipher, Curve, Protocol};
use crate::provider::Provider;

/// Decides whether a parameter combination makes sense for a provider.
///
/// Pure: looks only at its arguments. A `false` here means the scenario is
/// pruned before any process is spawned.
pub fn is_valid(
    provider: Provider,
    cipher: &Cipher,
    curve: Curve,
    protocol: Protocol,
    certificate: &Certificate,
) -> bool {
    if cipher.min_version > protocol {
        return false;
    }
    // TLS 1.3 suites and pre-1.3 suites do not mix.
    if cipher.is_tls13() != (protocol == Protocol::Tls13) {
        return false;
    }
    if let Some(auth) = cipher.auth {
        if auth != certificate.algorithm {
            return false;
        }
    }
    provider.supports_curve(curve)
}

/// Inputs for limitations of specific provider builds
#[derive(Debug, Clone, Default)]
pub struct BuildInfo {
    /// Description of the libcrypto the s2n build links against
    pub s2n_provider_version: String,
}

/// Returns why a scenario cannot run with the providers as built, if it can't
///
/// # Arguments
/// * `client` - Provider acting as client
/// * `client_requests_ocsp` - Whether the client asks for a stapled response
/// * `build` - Build information for the providers
pub fn known_limitation(client: Provider, client_requests_ocsp: bool, build: &BuildInfo) -> Option<String> {
    if client == Provider::S2n
        && client_requests_ocsp
        && build.s2n_provider_version.to_ascii_lowercase().contains("boringssl")
    {
        return Some("s2n-tls client with boringssl does not support ocsp".to_string());
    }
    None
}
