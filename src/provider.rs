//! The TLS implementations the harness knows how to drive.
//!
//! Each provider is a black-box binary. This module turns a
//! [`ProcessConfig`] into its command line and holds the per-provider
//! conventions the assertions rely on.

use crate::catalog::{Curve, Protocol};
use crate::config::{ProcessConfig, Role};
use crate::process_manager::{KillMarker, LaunchSpec, ProcessResult, ProcessState, StdinPayload};
use std::fmt;
use std::path::PathBuf;

const LOCALHOST: &str = "127.0.0.1";

/// Executables for every provider role
#[derive(Debug, Clone)]
pub struct ProviderPaths {
    pub s2nc: PathBuf,
    pub s2nd: PathBuf,
    pub openssl: PathBuf,
    pub gnutls_cli: PathBuf,
    pub gnutls_serv: PathBuf,
}

impl Default for ProviderPaths {
    fn default() -> Self {
        Self {
            s2nc: PathBuf::from("s2nc"),
            s2nd: PathBuf::from("s2nd"),
            openssl: PathBuf::from("openssl"),
            gnutls_cli: PathBuf::from("gnutls-cli"),
            gnutls_serv: PathBuf::from("gnutls-serv"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    S2n,
    OpenSsl,
    GnuTls,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Self::S2n, Self::OpenSsl, Self::GnuTls];

    pub fn id(self) -> &'static str {
        match self {
            Self::S2n => "s2n",
            Self::OpenSsl => "openssl",
            Self::GnuTls => "gnutls",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.id().eq_ignore_ascii_case(id))
    }

    /// Builds the command line for one endpoint
    pub fn launch_spec(self, config: &ProcessConfig, paths: &ProviderPaths) -> LaunchSpec {
        let spec = match (self, config.role) {
            (Self::S2n, Role::Client) => s2n_client(config, paths),
            (Self::S2n, Role::Server) => s2n_server(config, paths),
            (Self::OpenSsl, Role::Client) => openssl_client(config, paths),
            (Self::OpenSsl, Role::Server) => openssl_server(config, paths),
            (Self::GnuTls, Role::Client) => gnutls_client(config, paths),
            (Self::GnuTls, Role::Server) => gnutls_server(config, paths),
        };
        match config.payload {
            Some(ref data) => spec.stdin(StdinPayload {
                data: data.clone(),
                send_after: self.ready_to_send_marker(config.role).map(<[u8]>::to_vec),
            }),
            None => spec,
        }
    }

    /// Printed by the server once it accepts connections
    pub fn server_ready_marker(self) -> &'static [u8] {
        match self {
            Self::S2n => b"Listening on",
            Self::OpenSsl => b"ACCEPT",
            Self::GnuTls => b"Echo Server listening",
        }
    }

    /// Printed once the handshake is done and stdin will be read
    pub fn ready_to_send_marker(self, role: Role) -> Option<&'static [u8]> {
        match (self, role) {
            (Self::S2n, Role::Client) => Some(b"s2n is ready"),
            (Self::OpenSsl, Role::Client) => Some(b"Verify return code"),
            (Self::GnuTls, Role::Client) => Some(b"- Simple Client Mode"),
            (_, Role::Server) => None,
        }
    }

    /// Printed by a client that received a stapled, successful OCSP response
    pub fn ocsp_response_marker(self) -> &'static [u8] {
        match self {
            Self::S2n => b"OCSP response received",
            Self::OpenSsl => b"OCSP Response Status: successful",
            Self::GnuTls => b"OCSP Response Information:\n\tResponse Status: Successful",
        }
    }

    /// Whether the server exits after serving one connection
    pub fn server_exits_on_its_own(self) -> bool {
        !matches!(self, Self::GnuTls)
    }

    /// Marker that signals a never-exiting server finished the protocol
    /// steps a test needs.
    ///
    /// gnutls-serv logs e.g. `Sent Packet[4] Alert(21) in epoch 2 and length: 24`
    /// once the close_notify went out. Packet number and epoch vary, so only
    /// the narrow middle is matched. The log goes to stderr.
    pub fn server_kill_marker(self) -> Option<KillMarker> {
        match self {
            Self::GnuTls => Some(KillMarker::any_stream("Alert(21) in epoch")),
            _ => None,
        }
    }

    /// Flags needed for the kill marker to be printed at all
    pub fn server_extra_flags(self) -> Vec<String> {
        match self {
            Self::GnuTls => vec!["-d".to_string(), "5".to_string()],
            _ => Vec::new(),
        }
    }

    pub fn supports_curve(self, curve: Curve) -> bool {
        match self {
            Self::S2n => curve != Curve::P521,
            Self::OpenSsl | Self::GnuTls => true,
        }
    }

    /// Decides whether a terminal process counts as successful.
    ///
    /// | state                  | s2n  | openssl | gnutls        |
    /// |------------------------|------|---------|---------------|
    /// | exited 0               | ok   | ok      | ok            |
    /// | exited non-zero        | fail | fail    | fail          |
    /// | killed on kill marker  | fail | fail    | ok (server)   |
    /// | killed otherwise       | fail | fail    | fail          |
    /// | timed out              | fail | fail    | fail          |
    ///
    /// # Returns
    /// * `Result<(), String>` - The reason on failure
    pub fn exit_verdict(self, role: Role, result: &ProcessResult) -> Result<(), String> {
        match result.state {
            ProcessState::Exited => match result.exit_code {
                Some(0) => Ok(()),
                Some(code) => Err(format!("{} {} exited with code {}", self, role, code)),
                None => Err(format!("{} {} exited without an exit code", self, role)),
            },
            ProcessState::Killed if result.marker_matched => {
                if role == Role::Server && !self.server_exits_on_its_own() {
                    Ok(())
                } else {
                    Err(format!("{} {} was killed on a kill marker it should not have", self, role))
                }
            }
            ProcessState::Killed => Err(format!("{} {} was terminated by the harness", self, role)),
            ProcessState::TimedOut => Err(format!(
                "{} {} hung and timed out after {:.1?}",
                self, role, result.duration
            )),
            state @ (ProcessState::NotStarted | ProcessState::Running) => {
                Err(format!("{} {} is not terminal ({})", self, role, state))
            }
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

fn path_arg(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.display().to_string())
}

fn s2n_client(config: &ProcessConfig, paths: &ProviderPaths) -> LaunchSpec {
    let mut args = vec!["-e".to_string()];
    if config.insecure {
        args.push("--insecure".to_string());
    }
    args.extend(["-c".to_string(), config.params.cipher.s2n.to_string()]);
    if config.enable_ocsp_request {
        args.push("-s".to_string());
    }
    args.extend(config.extra_flags.iter().cloned());
    args.extend([LOCALHOST.to_string(), config.port().to_string()]);
    LaunchSpec::new(&paths.s2nc).args(args)
}

fn s2n_server(config: &ProcessConfig, paths: &ProviderPaths) -> LaunchSpec {
    // -X: exit after one connection
    let mut args = vec!["-X".to_string(), "-c".to_string(), config.params.cipher.s2n.to_string()];
    if config.insecure {
        args.push("--insecure".to_string());
    }
    if let Some(cert) = path_arg(&config.certificate) {
        args.extend(["--cert".to_string(), cert]);
    }
    if let Some(key) = path_arg(&config.private_key) {
        args.extend(["--key".to_string(), key]);
    }
    if let Some(ocsp) = path_arg(&config.ocsp_response) {
        args.extend(["--ocsp".to_string(), ocsp]);
    }
    args.extend(config.extra_flags.iter().cloned());
    args.extend([LOCALHOST.to_string(), config.port().to_string()]);
    LaunchSpec::new(&paths.s2nd).args(args)
}

fn openssl_protocol_flag(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Tls10 => "-tls1",
        Protocol::Tls11 => "-tls1_1",
        Protocol::Tls12 => "-tls1_2",
        Protocol::Tls13 => "-tls1_3",
    }
}

fn openssl_common(config: &ProcessConfig) -> Vec<String> {
    let cipher = &config.params.cipher;
    let cipher_flag = if cipher.is_tls13() { "-ciphersuites" } else { "-cipher" };
    vec![
        openssl_protocol_flag(config.params.protocol).to_string(),
        cipher_flag.to_string(),
        cipher.openssl.to_string(),
        "-curves".to_string(),
        config.params.curve.openssl().to_string(),
    ]
}

fn openssl_client(config: &ProcessConfig, paths: &ProviderPaths) -> LaunchSpec {
    let mut args = vec![
        "s_client".to_string(),
        "-connect".to_string(),
        format!("{}:{}", LOCALHOST, config.port()),
    ];
    args.extend(openssl_common(config));
    if config.enable_ocsp_request {
        args.push("-status".to_string());
    }
    if !config.insecure {
        args.push("-verify_return_error".to_string());
    }
    args.extend(config.extra_flags.iter().cloned());
    LaunchSpec::new(&paths.openssl).args(args)
}

fn openssl_server(config: &ProcessConfig, paths: &ProviderPaths) -> LaunchSpec {
    let mut args = vec![
        "s_server".to_string(),
        "-accept".to_string(),
        config.port().to_string(),
        "-naccept".to_string(),
        "1".to_string(),
    ];
    args.extend(openssl_common(config));
    if let Some(cert) = path_arg(&config.certificate) {
        args.extend(["-cert".to_string(), cert]);
    }
    if let Some(key) = path_arg(&config.private_key) {
        args.extend(["-key".to_string(), key]);
    }
    if let Some(ocsp) = path_arg(&config.ocsp_response) {
        args.extend(["-status_file".to_string(), ocsp]);
    }
    args.extend(config.extra_flags.iter().cloned());
    LaunchSpec::new(&paths.openssl).args(args)
}

fn gnutls_priority(config: &ProcessConfig) -> String {
    let version = match config.params.protocol {
        Protocol::Tls10 => "+VERS-TLS1.0",
        Protocol::Tls11 => "+VERS-TLS1.1",
        Protocol::Tls12 => "+VERS-TLS1.2",
        Protocol::Tls13 => "+VERS-TLS1.3",
    };
    let mut tokens = vec!["NONE", version, config.params.cipher.gnutls];
    if config.params.cipher.is_tls13() {
        tokens.push("+ECDHE-RSA:+ECDHE-ECDSA");
    }
    tokens.extend(["+SIGN-ALL", config.params.curve.gnutls(), "+COMP-NULL"]);
    tokens.join(":")
}

fn gnutls_client(config: &ProcessConfig, paths: &ProviderPaths) -> LaunchSpec {
    let mut args = vec![
        "--port".to_string(),
        config.port().to_string(),
        LOCALHOST.to_string(),
        "--priority".to_string(),
        gnutls_priority(config),
    ];
    if config.insecure {
        args.push("--insecure".to_string());
    }
    if !config.enable_ocsp_request {
        args.push("--disable-extensions".to_string());
    }
    args.extend(config.extra_flags.iter().cloned());
    LaunchSpec::new(&paths.gnutls_cli).args(args)
}

fn gnutls_server(config: &ProcessConfig, paths: &ProviderPaths) -> LaunchSpec {
    let mut args = vec![
        "--port".to_string(),
        config.port().to_string(),
        "--echo".to_string(),
        "--priority".to_string(),
        gnutls_priority(config),
    ];
    if let Some(cert) = path_arg(&config.certificate) {
        args.extend(["--x509certfile".to_string(), cert]);
    }
    if let Some(key) = path_arg(&config.private_key) {
        args.extend(["--x509keyfile".to_string(), key]);
    }
    if let Some(ocsp) = path_arg(&config.ocsp_response) {
        args.extend(["--ocsp-response".to_string(), ocsp]);
    }
    args.extend(config.extra_flags.iter().cloned());
    LaunchSpec::new(&paths.gnutls_serv).args(args)
}
