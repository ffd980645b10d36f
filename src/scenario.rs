use super::Result;
use crate::applicability::{self, BuildInfo};
use crate::catalog::{Catalog, Certificate, Cipher, Curve, Protocol};
use crate::config::{data_bytes, HandshakeParams, ProcessConfig};
use crate::correlator::ResultPair;
use crate::error::HarnessError;
use crate::port_manager::PortManager;
use crate::process_manager::{ManagedProcess, WatchPolicy};
use crate::provider::{Provider, ProviderPaths};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A family of scenarios sharing one shape and one success contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Suite {
    /// s2n client requests OCSP from every server provider
    ClientOcsp,
    /// s2n server staples OCSP for every client provider
    ServerOcsp,
}

impl Suite {
    pub const ALL: [Suite; 2] = [Self::ClientOcsp, Self::ServerOcsp];

    pub fn id(self) -> &'static str {
        match self {
            Self::ClientOcsp => "client-ocsp",
            Self::ServerOcsp => "server-ocsp",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.id() == id)
    }

    /// Providers paired with s2n in this suite
    pub fn peers(self) -> &'static [Provider] {
        match self {
            Self::ClientOcsp => &[Provider::S2n, Provider::OpenSsl, Provider::GnuTls],
            Self::ServerOcsp => &[Provider::GnuTls, Provider::OpenSsl],
        }
    }

    /// (client, server) providers for a peer
    pub fn endpoints(self, peer: Provider) -> (Provider, Provider) {
        match self {
            Self::ClientOcsp => (Provider::S2n, peer),
            Self::ServerOcsp => (peer, Provider::S2n),
        }
    }

    pub fn default_timeout(self) -> Duration {
        match self {
            Self::ClientOcsp => Duration::from_secs(30),
            Self::ServerOcsp => Duration::from_secs(90),
        }
    }
}

impl fmt::Display for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// One point in the parameter matrix
#[derive(Debug, Clone)]
pub struct Scenario {
    pub suite: Suite,
    pub peer: Provider,
    pub cipher: Cipher,
    pub curve: Curve,
    pub protocol: Protocol,
    pub certificate: Certificate,
}

impl Scenario {
    pub fn client(&self) -> Provider {
        self.suite.endpoints(self.peer).0
    }

    pub fn server(&self) -> Provider {
        self.suite.endpoints(self.peer).1
    }

    pub fn id(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}-{}",
            self.suite, self.peer, self.cipher, self.curve, self.protocol, self.certificate
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Pruned by the applicability filter
    InvalidParameters,
    /// A provider build cannot do what the scenario needs
    KnownLimitation(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameters => f.write_str("invalid parameter combination"),
            Self::KnownLimitation(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScenarioOutcome {
    Passed,
    Skipped(SkipReason),
}

/// Harness-wide knobs for running scenarios
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub paths: ProviderPaths,
    /// Overrides the suite's default client timeout
    pub client_timeout: Option<Duration>,
    /// Overrides the suite's default server timeout
    pub server_timeout: Option<Duration>,
    /// How long the server gets to print its readiness marker
    pub ready_timeout: Duration,
    /// Time between SIGTERM and SIGKILL
    pub grace: Duration,
    pub payload_len: usize,
    pub build: BuildInfo,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            paths: ProviderPaths::default(),
            client_timeout: None,
            server_timeout: None,
            ready_timeout: Duration::from_secs(5),
            grace: Duration::from_secs(2),
            payload_len: 128,
            build: BuildInfo::default(),
        }
    }
}

/// Runs single scenarios: configures, launches and checks both endpoints.
pub struct ScenarioDriver {
    settings: DriverSettings,
    catalog: Arc<Catalog>,
    ports: Arc<PortManager>,
}

impl ScenarioDriver {
    pub fn new(settings: DriverSettings, catalog: Arc<Catalog>, ports: Arc<PortManager>) -> Self {
        Self {
            settings,
            catalog,
            ports,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Why the scenario must not run, if it must not. Spawns nothing.
    pub fn skip_reason(&self, scenario: &Scenario) -> Option<SkipReason> {
        let valid = [scenario.client(), scenario.server()].into_iter().all(|provider| {
            applicability::is_valid(
                provider,
                &scenario.cipher,
                scenario.curve,
                scenario.protocol,
                &scenario.certificate,
            )
        });
        if !valid {
            return Some(SkipReason::InvalidParameters);
        }
        applicability::known_limitation(scenario.client(), true, &self.settings.build)
            .map(SkipReason::KnownLimitation)
    }

    /// Builds the client and server configurations for a scenario
    ///
    /// # Returns
    /// * `Result<(ProcessConfig, ProcessConfig)>` - (client, server), or
    ///   `HarnessError::Config` when no OCSP fixture fits the certificate
    pub fn build_configs(
        &self,
        scenario: &Scenario,
        port: u16,
        payload: &[u8],
    ) -> Result<(ProcessConfig, ProcessConfig)> {
        let ocsp_response = self.catalog.ocsp.for_algorithm(scenario.certificate.algorithm)?;
        let params = HandshakeParams {
            port,
            cipher: scenario.cipher.clone(),
            curve: scenario.curve,
            protocol: scenario.protocol,
        };

        let client = ProcessConfig::client(params.clone())
            .with_insecure(true)
            .with_payload(payload.to_vec())
            .with_ocsp_request(true);

        let server = ProcessConfig::server(params)
            .with_identity(&scenario.certificate.cert, &scenario.certificate.key)
            .with_ocsp_response(ocsp_response)
            .with_insecure(scenario.suite == Suite::ServerOcsp)
            .with_extra_flags(scenario.server().server_extra_flags());

        client.validate()?;
        server.validate()?;
        Ok((client, server))
    }

    /// Runs one scenario to a verdict
    ///
    /// # Returns
    /// * `Result<ScenarioOutcome>` - Passed or skipped; every failure is an error
    pub async fn run(&self, scenario: &Scenario) -> Result<ScenarioOutcome> {
        if let Some(reason) = self.skip_reason(scenario) {
            debug!("Skipping {}: {}", scenario.id(), reason);
            return Ok(ScenarioOutcome::Skipped(reason));
        }

        let lease = self.ports.next().await?;
        let payload = data_bytes(self.settings.payload_len);
        let (client_config, server_config) = self.build_configs(scenario, lease.port(), &payload)?;
        let (client_provider, server_provider) = scenario.suite.endpoints(scenario.peer);

        let timeout = scenario.suite.default_timeout();
        let server_policy = WatchPolicy::new(self.settings.server_timeout.unwrap_or(timeout))
            .with_kill_marker(server_provider.server_kill_marker())
            .with_grace(self.settings.grace);
        let client_policy =
            WatchPolicy::new(self.settings.client_timeout.unwrap_or(timeout)).with_grace(self.settings.grace);

        let mut server = ManagedProcess::new(
            format!("{} server", server_provider),
            server_provider.launch_spec(&server_config, &self.settings.paths),
        );
        server.start(server_policy).await?;

        // The client may only connect once the server listens.
        if !server
            .wait_for_output(server_provider.server_ready_marker(), self.settings.ready_timeout)
            .await
        {
            warn!("{} server never became ready, not starting the client", server_provider);
            server.terminate();
            let result = server.await_result().await?;
            return Err(HarnessError::Assertion {
                message: format!(
                    "{} server did not print {:?} within {:?}",
                    server_provider,
                    String::from_utf8_lossy(server_provider.server_ready_marker()),
                    self.settings.ready_timeout
                ),
                report: result.describe(),
            }
            .into());
        }

        let mut client = ManagedProcess::new(
            format!("{} client", client_provider),
            client_provider.launch_spec(&client_config, &self.settings.paths),
        );
        if let Err(e) = client.start(client_policy).await {
            server.terminate();
            return Err(match server.await_result().await {
                Ok(result) => e.wrap_err(format!("{} client never started\n{}", client_provider, result.describe())),
                Err(collect) => {
                    warn!("Could not collect {} server after client spawn failure: {:#}", server_provider, collect);
                    e
                }
            });
        }

        let pair = ResultPair::collect((server_provider, &mut server), (client_provider, &mut client)).await?;
        // Both endpoints are terminal, the port can go back.
        drop(lease);

        let client_marker = client_provider.ocsp_response_marker();
        pair.verify(|p| {
            p.client.assert_success()?;
            match scenario.suite {
                Suite::ClientOcsp => p.client.assert_stdout_contains(client_marker)?,
                Suite::ServerOcsp => p.client.assert_streams_contain(client_marker)?,
            }
            p.server.assert_success()?;
            p.server.assert_payload_received(&payload)
        })?;

        info!("{} passed", scenario.id());
        Ok(ScenarioOutcome::Passed)
    }
}
