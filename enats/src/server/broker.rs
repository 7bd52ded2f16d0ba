use super::protocol::{self, ConnectInfo, ServerInfo};
use super::sublist::{ClientId, Sublist, Subscription};
use crate::common::lock;
use async_channel::TrySendError;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub(crate) type Outbound = async_channel::Sender<Vec<u8>>;

struct ClientEntry {
    outbound: Outbound,
    // wakes the connection task to cut a slow consumer off
    slow: Arc<Notify>,
    opts: ConnectInfo,
}

#[derive(Default)]
struct Routes {
    clients: HashMap<ClientId, ClientEntry>,
    sublist: Sublist,
}

/// Broker state shared by every connection task: who is
/// connected and who subscribed to what.
pub(crate) struct Broker {
    info: ServerInfo,
    next_client_id: AtomicU64,
    routes: Mutex<Routes>,
}

impl Broker {
    pub(crate) fn new(info: ServerInfo) -> Self {
        Self {
            info,
            next_client_id: AtomicU64::new(1),
            routes: Mutex::new(Routes::default()),
        }
    }

    pub(crate) fn max_payload(&self) -> usize {
        self.info.max_payload
    }

    /// Registers a new connection and returns its id
    /// and the INFO greeting it should be sent.
    pub(crate) fn register(
        &self,
        outbound: Outbound,
        slow: Arc<Notify>,
        peer: SocketAddr,
    ) -> (ClientId, Vec<u8>) {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let mut info = self.info.clone();
        info.client_id = id;
        info.client_ip = Some(peer.ip().to_string());
        lock(&self.routes).clients.insert(
            id,
            ClientEntry {
                outbound,
                slow,
                opts: ConnectInfo::default(),
            },
        );
        (id, info.to_bytes())
    }

    pub(crate) fn connect(&self, id: ClientId, opts: ConnectInfo) {
        debug!(
            "client {} CONNECT name={:?} verbose={} echo={} headers={}",
            id, &opts.name, opts.verbose, opts.echo, opts.headers
        );
        if let Some(entry) = lock(&self.routes).clients.get_mut(&id) {
            entry.opts = opts;
        }
    }

    pub(crate) fn unregister(&self, id: ClientId) {
        let mut routes = lock(&self.routes);
        routes.clients.remove(&id);
        let removed = routes.sublist.remove_client(id);
        debug!("client {} gone, dropped {} subscriptions", id, removed);
    }

    pub(crate) fn subscribe(&self, id: ClientId, subject: String, queue: Option<String>, sid: String) {
        debug!(
            "client {} SUB {} queue={:?} sid={}",
            id, &subject, &queue, &sid
        );
        lock(&self.routes).sublist.insert(Subscription {
            client: id,
            sid,
            subject,
            queue,
            max: None,
            delivered: 0,
        });
    }

    pub(crate) fn unsubscribe(&self, id: ClientId, sid: &str, max: Option<u64>) {
        if !lock(&self.routes).sublist.unsubscribe(id, sid, max) {
            debug!("client {} UNSUB for unknown sid {}", id, sid);
        }
    }

    /// Routes one publication to every selected subscriber.
    pub(crate) fn publish(
        &self,
        from: ClientId,
        subject: &str,
        reply: Option<&str>,
        headers: Option<&[u8]>,
        payload: &[u8],
    ) {
        let mut routes = lock(&self.routes);
        let (echo, no_responders) = match routes.clients.get(&from) {
            Some(entry) => (
                entry.opts.echo,
                entry.opts.headers && entry.opts.no_responders,
            ),
            None => (true, false),
        };
        let skip = if echo { None } else { Some(from) };
        let deliveries = routes.sublist.select(subject, skip);
        trace!(
            "client {} PUB {} reply={:?} {} bytes -> {} receivers",
            from,
            subject,
            reply,
            payload.len(),
            deliveries.len()
        );

        if deliveries.is_empty() {
            if let (Some(reply), true) = (reply, no_responders) {
                if let Some(sid) = routes.sublist.find(from, reply) {
                    if let Some(entry) = routes.clients.get(&from) {
                        let _ = entry.outbound.try_send(protocol::no_responders(reply, &sid));
                    }
                }
            }
            return;
        }

        let mut slow = Vec::new();
        for delivery in &deliveries {
            let entry = match routes.clients.get(&delivery.client) {
                Some(entry) => entry,
                None => continue,
            };
            let frame = match headers {
                Some(headers) if entry.opts.headers => {
                    protocol::hmsg(subject, &delivery.sid, reply, headers, payload)
                }
                _ => protocol::msg(subject, &delivery.sid, reply, payload),
            };
            match entry.outbound.try_send(frame) {
                Ok(_) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "client {} is a slow consumer, disconnecting",
                        delivery.client
                    );
                    entry.slow.notify_one();
                    slow.push(delivery.client);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(
                        "dropping message on {} for closing client {}",
                        subject, delivery.client
                    );
                }
            }
        }
        for delivery in &deliveries {
            routes.sublist.delivered(delivery);
        }
        // no more deliveries for it while its connection winds down
        for client in slow {
            routes.sublist.remove_client(client);
        }
    }

    pub(crate) fn num_clients(&self) -> usize {
        lock(&self.routes).clients.len()
    }

    pub(crate) fn num_subscriptions(&self) -> usize {
        lock(&self.routes).sublist.len()
    }
}
