use std::path::PathBuf;
use std::time::Duration;

/// Failure kinds the harness distinguishes between.
///
/// Everything is carried inside an `eyre::Report`; use
/// `report.downcast_ref::<HarnessError>()` to branch on the kind.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// A process configuration could not be built. Fatal to the scenario.
    #[error("configuration error: {0}")]
    Config(String),

    /// The program under test could not be launched.
    #[error("failed to spawn {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No port became free within the allowed wait.
    #[error("port pool exhausted: no port freed within {waited:?} ({pool_size} ports in pool)")]
    Exhausted { waited: Duration, pool_size: usize },

    /// An output or exit-status contract was not met.
    #[error("assertion failed: {message}\n{report}")]
    Assertion { message: String, report: String },
}

impl HarnessError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns true if the failure is worth retrying after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}
