//! Producer side: run a test and stream its output through the relay.
//!
//! The relay is best effort. When it is unreachable the test still runs and
//! its output is only echoed locally.

use tracing::{debug, info, warn};

use testcast_core::catalog::{TestCatalog, TestStatus};
use testcast_core::{Envelope, OutputLine};

use crate::client::RelayClient;
use crate::subprocess::{ProcessRunner, RunResult};

/// Runs one test, publishing status and output envelopes.
#[derive(Debug)]
pub struct Producer {
    runner: ProcessRunner,
    relay: Option<RelayClient>,
    catalog: Option<TestCatalog>,
}

impl Producer {
    pub const fn new(runner: ProcessRunner) -> Self {
        Self {
            runner,
            relay: None,
            catalog: None,
        }
    }

    #[must_use]
    pub fn with_relay(mut self, client: RelayClient) -> Self {
        self.relay = Some(client);
        self
    }

    /// Record the outcome in `catalog` once the run finishes.
    #[must_use]
    pub fn with_catalog(mut self, catalog: TestCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Run `command` as test `name`.
    ///
    /// `echo` sees every line before it is published.
    pub async fn run<F>(&self, name: &str, command: &str, mut echo: F) -> RunResult
    where
        F: FnMut(&OutputLine),
    {
        self.connect_relay().await;
        self.publish(&Envelope::status(TestStatus::Running).with_extra("test", name));

        info!(test = %name, command, "Running test");
        let result = self
            .runner
            .run(command, |line| {
                echo(line);
                self.publish(&Envelope::output(line));
            })
            .await;

        let mut status = Envelope::status(TestStatus::from_outcome(result.succeeded))
            .with_extra("test", name)
            .with_extra("exitCode", result.exit_code);
        if let Some(detail) = &result.error_detail {
            status = status.with_extra("detail", detail.as_str());
        }
        self.publish(&status);
        self.record(name, result.succeeded, &status.timestamp);

        if let Some(client) = &self.relay {
            client.disconnect().await;
        }
        result
    }

    async fn connect_relay(&self) {
        let Some(client) = &self.relay else {
            return;
        };
        let connected = client
            .connect(
                |envelope| {
                    if envelope.is_capacity_rejection() {
                        warn!("Relay is full, output will not reach a watcher");
                    } else {
                        debug!(kind = envelope.kind.as_str(), "Ignoring envelope from watcher");
                    }
                },
                |up| debug!(up, "Relay connection status changed"),
            )
            .await;
        if let Err(e) = connected {
            warn!(error = %e, "Relay unavailable, output will only be shown locally");
        }
    }

    fn publish(&self, envelope: &Envelope) {
        match &self.relay {
            Some(client) if client.is_connected() => client.send(envelope),
            _ => {}
        }
    }

    fn record(&self, name: &str, succeeded: bool, timestamp: &str) {
        let Some(catalog) = &self.catalog else {
            return;
        };
        match catalog.record_outcome(name, succeeded, timestamp) {
            Ok(Some(_)) => {}
            Ok(None) => debug!(test = %name, "Test is not in the catalog, outcome not recorded"),
            Err(e) => warn!(test = %name, error = %e, "Failed to record test outcome"),
        }
    }
}
