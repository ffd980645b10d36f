use crate::integration::infrastructure::{FakeBehavior, FakeProviders};
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tlsinterop::catalog::{Catalog, Certificate, Curve, KeyAlgorithm, Protocol, ALL_TEST_CIPHERS};
use tlsinterop::error::HarnessError;
use tlsinterop::matrix::{enumerate, run_matrix, MatrixOptions};
use tlsinterop::port_manager::{PortManager, PortPoolConfig};
use tlsinterop::provider::Provider;
use tlsinterop::scenario::{DriverSettings, Scenario, ScenarioDriver, ScenarioOutcome, SkipReason, Suite};
use tokio_util::sync::CancellationToken;
use tracing::info;

fn driver_with(fakes: &FakeProviders, catalog: Catalog, port_start: u16, settings: DriverSettings) -> ScenarioDriver {
    let ports = PortManager::new(PortPoolConfig {
        start: port_start,
        count: 8,
        acquire_timeout: Duration::from_secs(5),
        ..Default::default()
    })
    .expect("port pool");
    let settings = DriverSettings {
        paths: fakes.paths(),
        grace: Duration::from_millis(200),
        ..settings
    };
    ScenarioDriver::new(settings, Arc::new(catalog), Arc::new(ports))
}

fn driver(fakes: &FakeProviders, port_start: u16) -> ScenarioDriver {
    driver_with(fakes, fakes.catalog(), port_start, DriverSettings::default())
}

fn tls13_scenario(fakes: &FakeProviders, suite: Suite, peer: Provider) -> Scenario {
    Scenario {
        suite,
        peer,
        cipher: ALL_TEST_CIPHERS[0].clone(),
        curve: Curve::X25519,
        protocol: Protocol::Tls13,
        certificate: fakes.catalog().certificates[0].clone(),
    }
}

fn assertion_report(err: &eyre::Report) -> Option<(&str, &str)> {
    match err.downcast_ref::<HarnessError>() {
        Some(HarnessError::Assertion { message, report }) => Some((message.as_str(), report.as_str())),
        _ => None,
    }
}

/// s2n client gets a stapled response from every server provider
#[tokio::test]
async fn test_client_ocsp_against_every_server() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let fakes = FakeProviders::new()?;
    let driver = driver(&fakes, 43000);

    for &peer in Suite::ClientOcsp.peers() {
        let scenario = tls13_scenario(&fakes, Suite::ClientOcsp, peer);
        let outcome = driver.run(&scenario).await.map_err(|e| anyhow::anyhow!("{:#}", e))?;
        assert_eq!(outcome, ScenarioOutcome::Passed, "{}", scenario.id());
        info!("{} passed", scenario.id());
    }

    let spawned = fakes.spawned();
    assert_eq!(spawned.len(), 6, "one client and one server per peer: {:?}", spawned);
    assert!(spawned.iter().filter(|line| line.starts_with("s2nc")).all(|line| line.contains(" -s ")));
    Ok(())
}

/// gnutls-serv never exits; the harness stops it on the close_notify alert
#[tokio::test]
async fn test_gnutls_server_is_stopped_by_kill_marker() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let fakes = FakeProviders::new()?;
    let driver = driver(&fakes, 43010);
    let scenario = tls13_scenario(&fakes, Suite::ClientOcsp, Provider::GnuTls);

    let started = Instant::now();
    let outcome = driver.run(&scenario).await.map_err(|e| anyhow::anyhow!("{:#}", e))?;
    assert_eq!(outcome, ScenarioOutcome::Passed);
    // Well under the 30s suite timeout.
    assert!(started.elapsed() < Duration::from_secs(10));

    let server = fakes
        .spawned()
        .into_iter()
        .find(|line| line.starts_with("gnutls-serv"))
        .expect("gnutls-serv was started");
    assert!(server.contains("-d 5"), "debug flags missing: {}", server);
    assert!(server.contains("--ocsp-response"));
    Ok(())
}

/// s2n server staples for every client provider
#[tokio::test]
async fn test_server_ocsp_for_every_client() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let fakes = FakeProviders::new()?;
    let driver = driver(&fakes, 43020);

    for &peer in Suite::ServerOcsp.peers() {
        let mut scenario = tls13_scenario(&fakes, Suite::ServerOcsp, peer);
        scenario.certificate = fakes.catalog().certificates[1].clone();
        let outcome = driver.run(&scenario).await.map_err(|e| anyhow::anyhow!("{:#}", e))?;
        assert_eq!(outcome, ScenarioOutcome::Passed, "{}", scenario.id());
    }

    let servers: Vec<String> = fakes.spawned().into_iter().filter(|l| l.starts_with("s2nd")).collect();
    assert_eq!(servers.len(), 2);
    assert!(servers.iter().all(|l| l.contains("ocsp_ecdsa_response.der")));
    Ok(())
}

/// Concurrent scenarios never share a port, or their payloads would cross
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_matrix_runs_concurrently_without_port_collisions() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let fakes = FakeProviders::new()?;
    let catalog = fakes
        .catalog()
        .restrict(&[], &["x25519".to_string()], &[], &[]);
    let driver = Arc::new(driver_with(&fakes, catalog, 43030, DriverSettings::default()));
    let scenarios = enumerate(driver.catalog(), &Suite::ALL, &[Provider::OpenSsl, Provider::S2n]);
    let total = scenarios.len();

    let summary = run_matrix(
        driver,
        scenarios,
        MatrixOptions {
            jobs: 6,
            fail_fast: false,
        },
        CancellationToken::new(),
    )
    .await;

    for failure in &summary.failures {
        eprintln!("{}: {}", failure.id, failure.error);
    }
    assert_eq!(summary.failed, 0);
    assert!(summary.passed > 0);
    assert!(summary.pruned > 0);
    assert_eq!(summary.passed + summary.pruned, total);
    assert!(summary.success());
    Ok(())
}

/// A certificate without an OCSP fixture fails before anything is spawned
#[tokio::test]
async fn test_unmapped_certificate_spawns_nothing() -> Result<()> {
    let fakes = FakeProviders::new()?;
    let driver = driver(&fakes, 43040);
    let mut scenario = tls13_scenario(&fakes, Suite::ClientOcsp, Provider::OpenSsl);
    scenario.certificate = Certificate::new(
        "ED25519",
        fakes.cert_dir().join("ed25519_cert.pem"),
        fakes.cert_dir().join("ed25519_key.pem"),
        KeyAlgorithm::Ed25519,
    );

    let err = driver.run(&scenario).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<HarnessError>(),
        Some(HarnessError::Config(_))
    ));
    assert!(fakes.spawned().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_invalid_combination_spawns_nothing() -> Result<()> {
    let fakes = FakeProviders::new()?;
    let driver = driver(&fakes, 43050);
    let mut scenario = tls13_scenario(&fakes, Suite::ClientOcsp, Provider::S2n);
    // s2n has no P-521
    scenario.curve = Curve::P521;

    let outcome = driver.run(&scenario).await.map_err(|e| anyhow::anyhow!("{:#}", e))?;
    assert_eq!(outcome, ScenarioOutcome::Skipped(SkipReason::InvalidParameters));
    assert!(fakes.spawned().is_empty());
    Ok(())
}

/// A missing payload is reported with the output of both endpoints
#[tokio::test]
async fn test_missing_payload_reports_both_endpoints() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let fakes = FakeProviders::with_behavior(FakeBehavior {
        server_drops_payload: true,
        ..Default::default()
    })?;
    let driver = driver(&fakes, 43060);
    let scenario = tls13_scenario(&fakes, Suite::ClientOcsp, Provider::OpenSsl);

    let err = driver.run(&scenario).await.unwrap_err();
    let (message, report) = assertion_report(&err).expect("assertion failure");
    assert!(message.contains("did not receive"), "{}", message);
    assert!(report.contains("connection accepted"), "server output missing: {}", report);
    assert!(report.contains("s2n is ready"), "client output missing: {}", report);
    Ok(())
}

/// A one-byte payload leaves nothing to compare, so it can never pass
#[tokio::test]
async fn test_payload_too_short_never_passes() -> Result<()> {
    let fakes = FakeProviders::with_behavior(FakeBehavior {
        server_drops_payload: true,
        ..Default::default()
    })?;
    let settings = DriverSettings {
        payload_len: 1,
        ..Default::default()
    };
    let driver = driver_with(&fakes, fakes.catalog(), 43090, settings);
    let scenario = tls13_scenario(&fakes, Suite::ClientOcsp, Provider::OpenSsl);

    let err = driver.run(&scenario).await.unwrap_err();
    let (message, _) = assertion_report(&err).expect("assertion failure");
    assert!(message.contains("did not receive"), "{}", message);
    Ok(())
}

/// A client that cannot be spawned takes its already running server down
#[tokio::test]
async fn test_client_spawn_error_stops_server() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let fakes = FakeProviders::new()?;
    let ports = PortManager::new(PortPoolConfig {
        start: 43100,
        count: 2,
        acquire_timeout: Duration::from_secs(5),
        ..Default::default()
    })
    .expect("port pool");
    let mut paths = fakes.paths();
    paths.s2nc = "/nonexistent/s2nc".into();
    let settings = DriverSettings {
        paths,
        grace: Duration::from_millis(200),
        ..Default::default()
    };
    let ports = Arc::new(ports);
    let driver = ScenarioDriver::new(settings, Arc::new(fakes.catalog()), ports.clone());
    let scenario = tls13_scenario(&fakes, Suite::ClientOcsp, Provider::GnuTls);

    let started = Instant::now();
    let err = driver.run(&scenario).await.unwrap_err();
    // gnutls-serv never exits on its own; it must have been stopped.
    assert!(started.elapsed() < Duration::from_secs(5));

    assert!(matches!(
        err.downcast_ref::<HarnessError>(),
        Some(HarnessError::Spawn { .. })
    ));
    let rendered = format!("{:#}", err);
    assert!(rendered.contains("Echo Server listening"), "server output missing: {}", rendered);

    let spawned = fakes.spawned();
    assert_eq!(spawned.len(), 1, "{:?}", spawned);
    assert!(spawned[0].starts_with("gnutls-serv"));
    assert_eq!(ports.available(), 2);
    Ok(())
}

#[tokio::test]
async fn test_failing_client_exit_code_fails_scenario() -> Result<()> {
    let fakes = FakeProviders::with_behavior(FakeBehavior {
        client_fails: true,
        ..Default::default()
    })?;
    let driver = driver(&fakes, 43070);
    let scenario = tls13_scenario(&fakes, Suite::ServerOcsp, Provider::OpenSsl);

    let err = driver.run(&scenario).await.unwrap_err();
    let (message, _) = assertion_report(&err).expect("assertion failure");
    assert!(message.contains("exited with code 1"), "{}", message);
    Ok(())
}

/// A hung client is timed out and the scenario fails instead of hanging
#[tokio::test]
async fn test_hung_client_times_out() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let fakes = FakeProviders::with_behavior(FakeBehavior {
        client_hangs: true,
        ..Default::default()
    })?;
    let settings = DriverSettings {
        client_timeout: Some(Duration::from_secs(1)),
        server_timeout: Some(Duration::from_secs(2)),
        ..Default::default()
    };
    let driver = driver_with(&fakes, fakes.catalog(), 43080, settings);
    let scenario = tls13_scenario(&fakes, Suite::ClientOcsp, Provider::S2n);

    let started = Instant::now();
    let err = driver.run(&scenario).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(8));

    let (message, report) = assertion_report(&err).expect("assertion failure");
    assert!(message.contains("timed out"), "{}", message);
    assert!(message.contains("client"), "{}", message);
    assert!(report.contains("[timed out;"), "{}", report);
    Ok(())
}
