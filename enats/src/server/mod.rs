//! A small in-process NATS server speaking the core text protocol.
//!
//! `Server::run` blocks the calling thread with its own tokio runtime,
//! so the usual way to use it is to call `run` on a dedicated thread,
//! wait on `ready_for_connections`, and later call `shutdown` from
//! anywhere else. Clustering, JetStream, auth and TLS are not supported.

mod broker;
mod client;
mod protocol;
mod subject;
mod sublist;

use crate::common::{lock, new_server_id};
use anyhow::{anyhow, bail, Result};
use broker::Broker;
use log::{debug, error, info, warn};
use protocol::ServerInfo;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;
pub const DEFAULT_MAX_CONTROL_LINE: usize = 4096;
pub const DEFAULT_MAX_PENDING: usize = 65536;
const SERVER_VERSION: &'static str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq)]
pub struct ServerOpts {
    pub host: String,
    pub port: u16,
    pub server_name: Option<String>,
    pub max_payload: usize,
    pub max_control_line: usize,
    /// Messages queued for one client before it is cut off
    /// as a slow consumer.
    pub max_pending: usize,
}

impl Default for ServerOpts {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 4222,
            server_name: None,
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_control_line: DEFAULT_MAX_CONTROL_LINE,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Status {
    Idle,
    Starting,
    Ready(Vec<SocketAddr>),
    Failed(String),
    Stopped,
}

pub struct Server {
    opts: ServerOpts,
    server_id: String,
    broker: Arc<Broker>,
    status: Mutex<Status>,
    status_changed: Condvar,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Builds a server for `opts`. Nothing is bound until `run`.
    pub fn new(opts: ServerOpts) -> Self {
        let server_id = new_server_id();
        let info = ServerInfo {
            server_id: server_id.clone(),
            server_name: opts.server_name.clone().unwrap_or_else(|| server_id.clone()),
            version: SERVER_VERSION.to_owned(),
            proto: 1,
            host: opts.host.clone(),
            port: opts.port,
            headers: true,
            max_payload: opts.max_payload,
            client_id: 0,
            client_ip: None,
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            opts,
            server_id,
            broker: Arc::new(Broker::new(info)),
            status: Mutex::new(Status::Idle),
            status_changed: Condvar::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn opts(&self) -> &ServerOpts {
        &self.opts
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// `nats://<host>:<port>`
    pub fn client_url(&self) -> String {
        format!("nats://{}:{}", &self.opts.host, self.opts.port)
    }

    /// The addresses the server listens on, empty unless ready.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        match &*self.lock_status() {
            Status::Ready(addrs) => addrs.clone(),
            _ => Vec::new(),
        }
    }

    pub fn num_clients(&self) -> usize {
        self.broker.num_clients()
    }

    pub fn num_subscriptions(&self) -> usize {
        self.broker.num_subscriptions()
    }

    fn lock_status(&self) -> MutexGuard<'_, Status> {
        lock(&self.status)
    }

    fn set_status(&self, status: Status) {
        *self.lock_status() = status;
        self.status_changed.notify_all();
    }

    /// Runs the server on the calling thread until `shutdown`.
    /// Errors are also recorded so `ready_for_connections` never
    /// reports a server that failed to bind.
    pub fn run(&self) -> Result<()> {
        {
            let mut status = self.lock_status();
            match *status {
                Status::Idle => *status = Status::Starting,
                Status::Stopped => {
                    debug!("server {} shut down before run", &self.server_id);
                    return Ok(());
                }
                _ => bail!("server {} already ran", &self.server_id),
            }
        }

        let result = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("enats-server")
            .enable_all()
            .build()
            .map_err(|err| anyhow!(err))
            .and_then(|rt| {
                let result = rt.block_on(self.serve());
                // dropping the runtime drops every socket still owned by a task
                drop(rt);
                result
            });

        match &result {
            Ok(_) => {
                info!("server {} stopped", &self.server_id);
                self.set_status(Status::Stopped);
            }
            Err(err) => {
                error!("server {} failed: {:#}", &self.server_id, err);
                self.set_status(Status::Failed(err.to_string()));
            }
        }
        result
    }

    /// Blocks until the server accepts connections or `timeout` elapses.
    pub fn ready_for_connections(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = self.lock_status();
        loop {
            if let Status::Ready(_) = *status {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            status = match self.status_changed.wait_timeout(status, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Stops the run loop and waits until every socket is released.
    /// Safe to call more than once, and before `run`.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let mut status = self.lock_status();
        if *status == Status::Idle {
            *status = Status::Stopped;
            self.status_changed.notify_all();
            return;
        }
        while matches!(*status, Status::Starting | Status::Ready(_)) {
            status = self
                .status_changed
                .wait(status)
                .unwrap_or_else(PoisonError::into_inner);
        }
        debug!("server {} shutdown complete", &self.server_id);
    }

    async fn bind(&self) -> Result<Vec<TcpListener>> {
        let host = self.opts.host.as_str();
        let mut addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, self.opts.port))
            .await?
            .collect();
        addrs.dedup();

        let mut listeners = Vec::new();
        for addr in addrs {
            match TcpListener::bind(addr).await {
                Ok(listener) => listeners.push(listener),
                // e.g. ::1 in a container without IPv6
                Err(err) if err.kind() == ErrorKind::AddrNotAvailable => {
                    warn!("skipping unavailable address {}: {}", addr, err);
                }
                Err(err) => bail!("error binding {}: {}", addr, err),
            }
        }
        if listeners.is_empty() {
            bail!("no address to bind for {}:{}", host, self.opts.port);
        }
        Ok(listeners)
    }

    async fn serve(&self) -> Result<()> {
        let listeners = self.bind().await?;
        let mut addrs = Vec::new();
        for listener in &listeners {
            addrs.push(listener.local_addr()?);
        }

        let (accepted_tx, accepted_rx) = async_channel::unbounded::<(TcpStream, SocketAddr)>();
        let mut acceptors = JoinSet::new();
        for listener in listeners {
            let accepted_tx = accepted_tx.clone();
            acceptors.spawn(accept_loop(listener, accepted_tx));
        }
        drop(accepted_tx);

        info!("server {} listening on {:?}", &self.server_id, &addrs);
        self.set_status(Status::Ready(addrs));

        let mut shutdown = self.shutdown_rx.clone();
        let mut conns = JoinSet::new();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                accepted = accepted_rx.recv() => match accepted {
                    Ok((stream, peer)) => {
                        conns.spawn(client::serve(
                            stream,
                            peer,
                            self.broker.clone(),
                            self.opts.max_control_line,
                            self.opts.max_pending,
                        ));
                    }
                    Err(_) => {
                        warn!("server {} has no listeners left", &self.server_id);
                        break;
                    }
                },
                Some(done) = conns.join_next() => {
                    if let Err(err) = done {
                        warn!("client task ended abnormally: {}", err);
                    }
                }
            }
        }

        info!("server {} shutting down", &self.server_id);
        acceptors.abort_all();
        conns.abort_all();
        while acceptors.join_next().await.is_some() {}
        while conns.join_next().await.is_some() {}
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    accepted: async_channel::Sender<(TcpStream, SocketAddr)>,
) {
    loop {
        match listener.accept().await {
            Ok(conn) => {
                if accepted.send(conn).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                // usually EMFILE or a reset before accept, both transient
                warn!("accept error: {}", err);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}
