use super::Result;
use crate::config::Role;
use crate::error::HarnessError;
use crate::output::find_subslice;
use crate::process_manager::{ManagedProcess, ProcessResult};
use crate::provider::Provider;
use tracing::{debug, warn};

/// Shortest payload that still leaves something to look for once the
/// first byte is skipped
pub const MIN_PAYLOAD_LEN: usize = 2;

/// True if `capture` contains the payload from its second byte on.
///
/// Debug output interleaved with the received data sometimes lands right
/// after the first byte, so `payload[0]` is not checked. A payload shorter
/// than `MIN_PAYLOAD_LEN` is never found.
pub fn payload_received(capture: &[u8], payload: &[u8]) -> bool {
    if payload.len() < MIN_PAYLOAD_LEN {
        return false;
    }
    find_subslice(capture, &payload[1..], 0).is_some()
}

/// The terminal result of one endpoint, with the provider that produced it
#[derive(Debug, Clone)]
pub struct EndpointResult {
    pub provider: Provider,
    pub role: Role,
    pub result: ProcessResult,
}

impl EndpointResult {
    /// Checks this endpoint's own exit status under its provider's convention.
    ///
    /// Says nothing about the peer.
    pub fn assert_success(&self) -> Result<()> {
        self.provider
            .exit_verdict(self.role, &self.result)
            .map_err(|message| self.failure(message))
    }

    pub fn assert_stdout_contains(&self, pattern: &[u8]) -> Result<()> {
        if self.result.stdout_contains(pattern) {
            Ok(())
        } else {
            Err(self.failure(format!(
                "{} {} stdout lacks {:?}",
                self.provider,
                self.role,
                String::from_utf8_lossy(pattern)
            )))
        }
    }

    pub fn assert_streams_contain(&self, pattern: &[u8]) -> Result<()> {
        if self.result.streams_contain(pattern) {
            Ok(())
        } else {
            Err(self.failure(format!(
                "neither {} {} stream contains {:?}",
                self.provider,
                self.role,
                String::from_utf8_lossy(pattern)
            )))
        }
    }

    /// Checks that the peer's payload shows up in either stream
    pub fn assert_payload_received(&self, payload: &[u8]) -> Result<()> {
        if self
            .result
            .output_streams()
            .iter()
            .any(|stream| payload_received(stream, payload))
        {
            Ok(())
        } else {
            Err(self.failure(format!(
                "{} {} did not receive the {} byte payload",
                self.provider,
                self.role,
                payload.len()
            )))
        }
    }

    fn failure(&self, message: String) -> eyre::Report {
        HarnessError::Assertion {
            message,
            report: self.result.describe(),
        }
        .into()
    }
}

/// Client and server results of one scenario
#[derive(Debug, Clone)]
pub struct ResultPair {
    pub client: EndpointResult,
    pub server: EndpointResult,
}

impl ResultPair {
    /// Waits for both processes to reach a terminal state.
    ///
    /// Both are awaited concurrently. If collecting one of them fails, the
    /// other is terminated so neither outlives the scenario.
    ///
    /// # Arguments
    /// * `server` - Provider and running process of the server
    /// * `client` - Provider and running process of the client
    pub async fn collect(
        server: (Provider, &mut ManagedProcess),
        client: (Provider, &mut ManagedProcess),
    ) -> Result<Self> {
        let (server_provider, server) = server;
        let (client_provider, client) = client;
        let stop_server = server.cancellation();
        let stop_client = client.cancellation();

        let server_wait = async {
            let result = server.await_result().await;
            if result.is_err() {
                warn!("Lost the server, terminating the client");
                stop_client.cancel();
            }
            result
        };
        let client_wait = async {
            let result = client.await_result().await;
            if result.is_err() {
                warn!("Lost the client, terminating the server");
                stop_server.cancel();
            }
            result
        };
        let (server_result, client_result) = tokio::join!(server_wait, client_wait);

        let pair = Self {
            server: EndpointResult {
                provider: server_provider,
                role: Role::Server,
                result: server_result?,
            },
            client: EndpointResult {
                provider: client_provider,
                role: Role::Client,
                result: client_result?,
            },
        };
        debug!(
            "Collected results: server {}, client {}",
            pair.server.result.state, pair.client.result.state
        );
        Ok(pair)
    }

    /// Runs assertions against the pair.
    ///
    /// An assertion failure is reported with the streams of both endpoints.
    pub fn verify<F>(&self, checks: F) -> Result<()>
    where
        F: FnOnce(&Self) -> Result<()>,
    {
        checks(self).map_err(|err| match err.downcast::<HarnessError>() {
            Ok(HarnessError::Assertion { message, .. }) => HarnessError::Assertion {
                message,
                report: self.report(),
            }
            .into(),
            Ok(other) => other.into(),
            Err(err) => err,
        })
    }

    /// Both endpoints' full output, server first
    pub fn report(&self) -> String {
        format!("{}\n{}", self.server.result.describe(), self.client.result.describe())
    }
}
