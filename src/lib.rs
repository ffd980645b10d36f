//! Interoperability harness for TLS implementations.
//!
//! Runs s2n-tls against itself, OpenSSL and GnuTLS as black-box processes,
//! one client and one server per scenario, and checks the handshake
//! outcome from their exit statuses and captured output.

pub type Result<T> = color_eyre::eyre::Result<T>;

pub mod applicability;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod correlator;
pub mod error;
pub mod matrix;
pub mod output;
pub mod port_manager;
pub mod process_manager;
pub mod provider;
pub mod scenario;
