use clap::Parser;
use eyre::eyre;
use std::path::PathBuf;
use std::time::Duration;

use crate::applicability::BuildInfo;
use crate::correlator::MIN_PAYLOAD_LEN;
use crate::catalog::Catalog;
use crate::matrix::MatrixOptions;
use crate::port_manager::PortPoolConfig;
use crate::provider::{Provider, ProviderPaths};
use crate::scenario::{DriverSettings, Suite};

type Result<T> = color_eyre::eyre::Result<T>;

/// Runs s2n-tls against OpenSSL and GnuTLS across a cipher/curve/protocol matrix
#[derive(Parser, Debug)]
#[command(name = "tlsinterop")]
#[command(about = "Runs s2n-tls against OpenSSL and GnuTLS across a cipher/curve/protocol matrix")]
#[command(version)]
pub struct Cli {
    /// s2n client binary
    #[arg(long, default_value = "s2nc")]
    pub s2nc: PathBuf,

    /// s2n server binary
    #[arg(long, default_value = "s2nd")]
    pub s2nd: PathBuf,

    /// openssl binary (s_client and s_server)
    #[arg(long, default_value = "openssl")]
    pub openssl: PathBuf,

    /// GnuTLS client binary
    #[arg(long, default_value = "gnutls-cli")]
    pub gnutls_cli: PathBuf,

    /// GnuTLS server binary
    #[arg(long, default_value = "gnutls-serv")]
    pub gnutls_serv: PathBuf,

    /// Directory holding the certificate fixtures
    #[arg(long, default_value = "certs")]
    pub cert_dir: PathBuf,

    /// Directory holding the OCSP response fixtures (default: <cert-dir>/ocsp)
    #[arg(long)]
    pub ocsp_dir: Option<PathBuf>,

    /// First port of the pool
    #[arg(long, default_value = "8000")]
    pub port_start: u16,

    /// Number of ports in the pool
    #[arg(long, default_value = "64")]
    pub port_count: u16,

    /// How long a scenario may wait for a free port (ms)
    #[arg(long, default_value = "30000")]
    pub port_wait_ms: u64,

    /// Scenarios run concurrently (clamped to the port pool size)
    #[arg(long, short = 'j', default_value = "8")]
    pub jobs: usize,

    /// Client timeout override (seconds)
    #[arg(long)]
    pub client_timeout_secs: Option<u64>,

    /// Server timeout override (seconds)
    #[arg(long)]
    pub server_timeout_secs: Option<u64>,

    /// How long a server gets to report it is listening (ms)
    #[arg(long, default_value = "5000")]
    pub ready_timeout_ms: u64,

    /// Time between SIGTERM and SIGKILL when stopping a process (ms)
    #[arg(long, default_value = "2000")]
    pub grace_ms: u64,

    /// Bytes the client sends once the handshake is done
    #[arg(long, default_value = "128")]
    pub payload_len: usize,

    /// libcrypto the s2n binaries are built against
    #[arg(long, env = "S2N_LIBCRYPTO", default_value = "")]
    pub s2n_provider_version: String,

    /// Suite to run: client-ocsp, server-ocsp or all
    #[arg(long, default_value = "all")]
    pub suite: String,

    /// Restrict the peer providers (repeatable)
    #[arg(long = "provider")]
    pub providers: Vec<String>,

    /// Restrict ciphers by IANA name (comma-separated)
    #[arg(long = "cipher", value_delimiter = ',')]
    pub ciphers: Vec<String>,

    /// Restrict curves, e.g. x25519,P-256
    #[arg(long = "curve", value_delimiter = ',')]
    pub curves: Vec<String>,

    /// Restrict protocols, e.g. TLS1.3
    #[arg(long = "protocol", value_delimiter = ',')]
    pub protocols: Vec<String>,

    /// Restrict certificates by name, e.g. OCSP_ECDSA
    #[arg(long = "certificate", value_delimiter = ',')]
    pub certificates: Vec<String>,

    /// Stop at the first failing scenario
    #[arg(long)]
    pub fail_fast: bool,
}

/// Everything needed to run the matrix
#[derive(Debug, Clone)]
pub struct Config {
    pub ports: PortPoolConfig,
    pub driver: DriverSettings,
    pub catalog: Catalog,
    pub suites: Vec<Suite>,
    /// Peer providers to run against; empty means all
    pub providers: Vec<Provider>,
    pub matrix: MatrixOptions,
}

impl Config {
    /// Parse command line arguments into configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        if cli.port_count == 0 {
            return Err(eyre!("--port-count must be at least 1"));
        }
        if cli.payload_len < MIN_PAYLOAD_LEN {
            return Err(eyre!("--payload-len must be at least {}", MIN_PAYLOAD_LEN));
        }

        let suites = if cli.suite.eq_ignore_ascii_case("all") {
            Suite::ALL.to_vec()
        } else {
            vec![Suite::from_id(&cli.suite).ok_or_else(|| {
                eyre!("Unknown suite '{}', expected client-ocsp, server-ocsp or all", cli.suite)
            })?]
        };

        let providers = cli
            .providers
            .iter()
            .map(|id| Provider::from_id(id).ok_or_else(|| eyre!("Unknown provider '{}'", id)))
            .collect::<Result<Vec<_>>>()?;

        let ocsp_dir = cli.ocsp_dir.unwrap_or_else(|| cli.cert_dir.join("ocsp"));
        let catalog = Catalog::ocsp(&cli.cert_dir, &ocsp_dir).restrict(
            &cli.ciphers,
            &cli.curves,
            &cli.protocols,
            &cli.certificates,
        );
        for (dimension, empty) in [
            ("cipher", catalog.ciphers.is_empty()),
            ("curve", catalog.curves.is_empty()),
            ("protocol", catalog.protocols.is_empty()),
            ("certificate", catalog.certificates.is_empty()),
        ] {
            if empty {
                return Err(eyre!("No {} matches the given filter", dimension));
            }
        }

        let ports = PortPoolConfig {
            start: cli.port_start,
            count: cli.port_count,
            acquire_timeout: Duration::from_millis(cli.port_wait_ms),
            ..Default::default()
        };

        let driver = DriverSettings {
            paths: ProviderPaths {
                s2nc: cli.s2nc,
                s2nd: cli.s2nd,
                openssl: cli.openssl,
                gnutls_cli: cli.gnutls_cli,
                gnutls_serv: cli.gnutls_serv,
            },
            client_timeout: cli.client_timeout_secs.map(Duration::from_secs),
            server_timeout: cli.server_timeout_secs.map(Duration::from_secs),
            ready_timeout: Duration::from_millis(cli.ready_timeout_ms),
            grace: Duration::from_millis(cli.grace_ms),
            payload_len: cli.payload_len,
            build: BuildInfo {
                s2n_provider_version: cli.s2n_provider_version,
            },
        };

        // Every running scenario holds one port.
        let jobs = cli.jobs.clamp(1, usize::from(cli.port_count));

        Ok(Config {
            ports,
            driver,
            catalog,
            suites,
            providers,
            matrix: MatrixOptions {
                jobs,
                fail_fast: cli.fail_fast,
            },
        })
    }
}
