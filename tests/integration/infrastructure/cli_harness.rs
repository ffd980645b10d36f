use super::fake_providers::FakeProviders;
use anyhow::{Context, Result};
use nix::{sys::signal::Signal, unistd::Pid};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;

/// Runs the tlsinterop binary against a set of fake providers
pub struct CliHarness {
    binary: PathBuf,
    cleanup_pids: Vec<Pid>,
}

impl CliHarness {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from(env!("CARGO_BIN_EXE_tlsinterop")),
            cleanup_pids: Vec::new(),
        }
    }

    /// Spawns tlsinterop with every provider path pointing at `fakes`
    pub fn spawn(&mut self, fakes: &FakeProviders, args: &[&str]) -> Result<CliProcess> {
        let paths = fakes.paths();
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--s2nc")
            .arg(&paths.s2nc)
            .arg("--s2nd")
            .arg(&paths.s2nd)
            .arg("--openssl")
            .arg(&paths.openssl)
            .arg("--gnutls-cli")
            .arg(&paths.gnutls_cli)
            .arg("--gnutls-serv")
            .arg(&paths.gnutls_serv)
            .arg("--cert-dir")
            .arg(fakes.cert_dir())
            .arg("--ocsp-dir")
            .arg(fakes.ocsp_dir())
            .args(args)
            .env("RUST_LOG", "info")
            .env_remove("S2N_LIBCRYPTO")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let start_time = Instant::now();
        let child = cmd.spawn().context("Failed to spawn tlsinterop")?;
        let pid = Pid::from_raw(child.id().context("Failed to get child PID")? as i32);
        self.cleanup_pids.push(pid);

        Ok(CliProcess { start_time, child })
    }
}

impl Drop for CliHarness {
    fn drop(&mut self) {
        for pid in &self.cleanup_pids {
            let _ = nix::sys::signal::killpg(*pid, Signal::SIGKILL);
        }
    }
}

/// A running tlsinterop process
pub struct CliProcess {
    pub start_time: Instant,
    child: Child,
}

/// Exit status and captured output of a finished run
pub struct CliOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub runtime: Duration,
}

impl CliOutput {
    /// Log output of the run; tracing writes to stdout
    pub fn log(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

impl CliProcess {
    /// Waits for the run to finish, returning `None` on timeout
    pub async fn wait_for_exit_timeout(self, duration: Duration) -> Result<Option<CliOutput>> {
        let CliProcess { start_time, mut child } = self;
        let mut stdout = child.stdout.take().context("stdout not captured")?;
        let mut stderr = child.stderr.take().context("stderr not captured")?;

        let collect = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let (read_out, read_err, status) = tokio::join!(
                stdout.read_to_end(&mut out),
                stderr.read_to_end(&mut err),
                child.wait()
            );
            read_out?;
            read_err?;
            Ok::<_, std::io::Error>((status?, out, err))
        };

        match timeout(duration, collect).await {
            Ok(result) => {
                let (status, out, err) = result.context("Failed to collect tlsinterop output")?;
                Ok(Some(CliOutput {
                    status,
                    stdout: String::from_utf8_lossy(&out).into_owned(),
                    stderr: String::from_utf8_lossy(&err).into_owned(),
                    runtime: start_time.elapsed(),
                }))
            }
            Err(_) => Ok(None),
        }
    }
}
