use crate::config::Config;
use crate::port::free_port;
use crate::server::Server;
use crate::{Error, Result};
use log::{debug, error, info, warn};
use nats::Connection;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Lifecycle of an [`EmbeddedNats`]. A harness only moves forward;
/// construct a new one to run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Constructed,
    Running,
    Stopped,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Constructed => write!(f, "constructed"),
            State::Running => write!(f, "running"),
            State::Stopped => write!(f, "stopped"),
        }
    }
}

/// EmbeddedNats combines an embedded NATS server and a NATS client
/// connected to it, for testing inter-service communication.
///
/// ```no_run
/// let mut harness = enats::EmbeddedNats::new()?;
/// harness.start()?;
/// harness.conn().unwrap().publish("test.subject", "payload")?;
/// harness.stop()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct EmbeddedNats {
    port: u16,
    config: Config,
    server: Arc<Server>,
    thread: Option<JoinHandle<()>>,
    conn: Option<Connection>,
    state: State,
}

impl EmbeddedNats {
    /// Creates a harness bound to a free local port, configured from
    /// the `ENATS_*` env variables. The server is not started yet.
    pub fn new() -> Result<Self> {
        Self::with_config(Config::from_env()?)
    }

    pub fn with_config(config: Config) -> Result<Self> {
        let port = free_port()?;
        let server = Arc::new(Server::new(config.server_opts(port)));
        debug!(
            "embedded NATS server {} assigned {}:{}",
            server.server_id(),
            &config.host,
            port
        );
        Ok(Self {
            port,
            config,
            server,
            thread: None,
            conn: None,
            state: State::Constructed,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The url clients should connect to.
    pub fn url(&self) -> String {
        self.server.client_url()
    }

    /// The harness client, present while the harness is running.
    pub fn conn(&self) -> Option<&Connection> {
        self.conn.as_ref()
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Starts the server on its own thread, waits until it accepts
    /// connections and connects the harness client.
    pub fn start(&mut self) -> Result<()> {
        if self.state != State::Constructed {
            return Err(Error::InvalidState {
                op: "start",
                state: self.state,
            });
        }

        let server = self.server.clone();
        let thread = thread::Builder::new()
            .name(format!("enats-{}", self.port))
            .spawn(move || {
                if let Err(err) = server.run() {
                    error!("Error running embedded NATS server: {:#}", err);
                }
            });
        match thread {
            Ok(handle) => self.thread = Some(handle),
            Err(err) => {
                self.state = State::Stopped;
                return Err(Error::Spawn(err));
            }
        }

        let timeout = self.config.ready_timeout();
        if !self.server.ready_for_connections(timeout) {
            self.abort();
            return Err(Error::ServerNotReady {
                port: self.port,
                timeout,
            });
        }

        let url = self.url();
        match nats::Options::new()
            .with_name(&self.config.client_name)
            .connect(&url[..])
        {
            Ok(conn) => {
                info!("connected nats client to embedded server at {}", &url);
                self.conn = Some(conn);
                self.state = State::Running;
                Ok(())
            }
            Err(err) => {
                self.abort();
                Err(Error::Connect {
                    port: self.port,
                    source: err,
                })
            }
        }
    }

    /// Disconnects the client and shuts the server down. When this
    /// returns the port is free again.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != State::Running {
            return Err(Error::InvalidState {
                op: "stop",
                state: self.state,
            });
        }

        // close the client first so it never sees the server go away under it
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
        self.shutdown_server();
        info!("embedded NATS server on port {} stopped", self.port);
        Ok(())
    }

    // Cleans up after a failed start.
    fn abort(&mut self) {
        warn!(
            "embedded NATS server on port {} failed to start, shutting down",
            self.port
        );
        self.shutdown_server();
    }

    fn shutdown_server(&mut self) {
        self.server.shutdown();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("embedded NATS server thread on port {} panicked", self.port);
            }
        }
        self.state = State::Stopped;
    }
}

impl Drop for EmbeddedNats {
    fn drop(&mut self) {
        if self.state == State::Running {
            debug!("dropping running embedded NATS harness on port {}", self.port);
            if let Err(err) = self.stop() {
                error!("error stopping embedded NATS harness: {}", err);
            }
        }
    }
}

impl fmt::Debug for EmbeddedNats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedNats")
            .field("port", &self.port)
            .field("url", &self.url())
            .field("state", &self.state)
            .finish()
    }
}
