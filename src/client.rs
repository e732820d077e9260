use std::time::Duration;

use crate::coordinator::{Coordinator, QueueStatus};
use crate::emitter::Emitter;
use crate::error::Result;
use crate::locate;
use crate::message::TestSet;
use crate::params;
use crate::results::{Results, StateChange};
use crate::transport::{Scheme, WsConnector};

/// Everything a single test run needs to know.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Host name or address of the NDT server.
    pub server: String,
    /// Port of the control channel.
    pub port: u16,
    /// URL path used for every channel.
    pub path: String,
    pub scheme: Scheme,
    /// Tests to request; the status test is added on the wire.
    pub tests: TestSet,
    /// Period of interval progress events; `None` or zero disables them.
    pub update_interval: Option<Duration>,
    /// Deadline for the whole run.
    pub timeout: Option<Duration>,
    pub client_name: String,
    pub client_version: String,
}

impl Config {
    /// Defaults for `server`: port 3001, all tests, plain WebSockets.
    pub fn new(server: impl Into<String>) -> Self {
        Config {
            server: server.into(),
            port: params::DEFAULT_PORT,
            path: params::DEFAULT_PATH.to_owned(),
            scheme: Scheme::Ws,
            tests: TestSet::C2S | TestSet::S2C | TestSet::META,
            update_interval: Some(params::DEFAULT_UPDATE_INTERVAL),
            timeout: None,
            client_name: env!("CARGO_PKG_NAME").to_owned(),
            client_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }

    pub(crate) fn progress_interval(&self) -> Option<Duration> {
        self.update_interval.filter(|d| !d.is_zero())
    }

    /// The `key:value` line sent during the META test.
    pub fn meta_entry(&self) -> String {
        format!(
            "client.application:{}/{}",
            self.client_name, self.client_version
        )
    }
}

/// Builds a [`Client`].
pub struct ClientBuilder {
    client_name: String,
    client_version: String,
    port: u16,
    path: String,
    scheme: Scheme,
    tests: TestSet,
    update_interval: Option<Duration>,
    timeout: Option<Duration>,
}

impl ClientBuilder {
    /// Start a builder for an application called `client_name`.
    pub fn new(client_name: impl Into<String>, client_version: impl Into<String>) -> Self {
        ClientBuilder {
            client_name: client_name.into(),
            client_version: client_version.into(),
            port: params::DEFAULT_PORT,
            path: params::DEFAULT_PATH.to_owned(),
            scheme: Scheme::Ws,
            tests: TestSet::C2S | TestSet::S2C | TestSet::META,
            update_interval: Some(params::DEFAULT_UPDATE_INTERVAL),
            timeout: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn tests(mut self, tests: TestSet) -> Self {
        self.tests = tests;
        self
    }

    pub fn update_interval(mut self, interval: Option<Duration>) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Client {
        Client { builder: self }
    }
}

/// Runs NDT tests against servers over WebSockets.
pub struct Client {
    builder: ClientBuilder,
}

impl Client {
    /// Configuration of a run against `server`.
    pub fn config(&self, server: &str) -> Config {
        let b = &self.builder;
        Config {
            server: server.to_owned(),
            port: b.port,
            path: b.path.clone(),
            scheme: b.scheme,
            tests: b.tests,
            update_interval: b.update_interval,
            timeout: b.timeout,
            client_name: b.client_name.clone(),
            client_version: b.client_version.clone(),
        }
    }

    /// A fresh coordinator for one run against `server`.
    pub fn coordinator<E: Emitter>(
        &self,
        server: &str,
        emitter: E,
    ) -> Result<Coordinator<WsConnector, E>> {
        let connector = WsConnector::new(self.builder.scheme)?;
        Ok(Coordinator::new(connector, self.config(server), emitter))
    }

    /// Run every test the server schedules and return the collected results.
    ///
    /// On failure the variables gathered so far are dropped with the
    /// coordinator. To keep them, drive the run through [`Client::coordinator`]
    /// and read [`Coordinator::results`] afterwards:
    ///
    /// ```no_run
    /// # use ndt_client::client::ClientBuilder;
    /// # use ndt_client::emitter::JsonEmitter;
    /// # async fn run() -> ndt_client::error::Result<()> {
    /// let client = ClientBuilder::new("my-app", "0.1.0").build();
    /// let mut coordinator = client.coordinator("ndt.example.net", JsonEmitter::new(std::io::stdout()))?;
    /// if let Err(e) = coordinator.run().await {
    ///     eprintln!("run failed ({e}), kept {} variables", coordinator.results().len());
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run_test<E: Emitter>(&self, server: &str, emitter: E) -> Result<Results> {
        let mut coordinator = self.coordinator(server, emitter)?;
        coordinator.run().await?;
        Ok(coordinator.into_results())
    }

    /// Ask `server` whether it would queue a test right now.
    pub async fn check_queue(&self, server: &str) -> Result<QueueStatus> {
        let mut coordinator = self.coordinator(server, NoopEmitter)?;
        coordinator.check_queue().await
    }

    /// Look up the nearest NDT server through the M-Lab name server.
    pub async fn locate_server(&self) -> Result<locate::Server> {
        locate::nearest(&self.user_agent()).await
    }

    fn user_agent(&self) -> String {
        format!(
            "{}/{} {}/{}",
            &self.builder.client_name,
            &self.builder.client_version,
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        )
    }
}

/// Queue checks report nothing but their answer.
struct NoopEmitter;

impl Emitter for NoopEmitter {
    fn on_start(&mut self, _server: &str) -> Result<()> {
        Ok(())
    }

    fn on_state_change(&mut self, _change: StateChange, _results: &Results) -> Result<()> {
        Ok(())
    }

    fn on_finish(&mut self, _results: &Results) -> Result<()> {
        Ok(())
    }

    fn on_error(&mut self, _err: &str) -> Result<()> {
        Ok(())
    }
}
