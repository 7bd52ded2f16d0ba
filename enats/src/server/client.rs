use super::broker::{Broker, Outbound};
use super::protocol::{self, ClientOp, ProtocolError};
use super::subject;
use super::sublist::ClientId;
use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;

/// Serves one client connection until it disconnects, violates the
/// protocol, falls too far behind or the task is aborted.
pub(crate) async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<Broker>,
    max_control_line: usize,
    max_pending: usize,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let (rd, mut wr) = stream.into_split();
    let (outbound, queued) = async_channel::bounded::<Vec<u8>>(max_pending.max(1));
    let slow = Arc::new(Notify::new());
    let (id, greeting) = broker.register(outbound.clone(), slow.clone(), peer);
    info!("client {} connected from {}", id, peer);

    let mut conn = Connection {
        id,
        reader: BufReader::new(rd),
        outbound,
        broker: broker.clone(),
        max_control_line,
        verbose: false,
    };

    let mut slow_consumer = false;
    let result = match wr.write_all(&greeting).await {
        Ok(_) => {
            tokio::select! {
                r = conn.read_loop() => r,
                r = write_loop(&mut wr, &queued) => r,
                _ = slow.notified() => {
                    slow_consumer = true;
                    Err(anyhow!("slow consumer"))
                }
            }
        }
        Err(err) => Err(err.into()),
    };

    // the read loop may have queued an -ERR right before it stopped.
    // A slow consumer isn't reading, so writing more would block.
    if !slow_consumer {
        while let Ok(buf) = queued.try_recv() {
            if wr.write_all(&buf).await.is_err() {
                break;
            }
        }
    }
    let _ = wr.shutdown().await;
    broker.unregister(id);

    match &result {
        Ok(_) => info!("client {} disconnected", id),
        Err(err) => warn!("client {} closed: {}", id, err),
    }
    result
}

async fn write_loop(wr: &mut OwnedWriteHalf, queued: &async_channel::Receiver<Vec<u8>>) -> Result<()> {
    while let Ok(buf) = queued.recv().await {
        wr.write_all(&buf).await?;
    }
    Ok(())
}

struct Connection {
    id: ClientId,
    reader: BufReader<OwnedReadHalf>,
    outbound: Outbound,
    broker: Arc<Broker>,
    max_control_line: usize,
    verbose: bool,
}

impl Connection {
    fn send(&self, buf: Vec<u8>) {
        // only fails once the writer is gone, and then we're closing anyway
        let _ = self.outbound.try_send(buf);
    }

    fn ok(&self) {
        if self.verbose {
            self.send(protocol::OK.to_vec());
        }
    }

    /// Reports a protocol error to the client. Fatal errors end the connection.
    fn fail(&self, err: ProtocolError) -> Result<()> {
        debug!("client {} protocol error: {}", self.id, &err);
        self.send(err.to_bytes());
        if err.is_fatal() {
            return Err(anyhow!(err));
        }
        Ok(())
    }

    async fn read_line(&mut self, line: &mut Vec<u8>) -> Result<Option<String>> {
        line.clear();
        let limit = (self.max_control_line + 2) as u64;
        let n = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', line)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') {
            if n as u64 >= limit {
                self.fail(ProtocolError::ControlLineExceeded)?;
            }
            // EOF in the middle of a line
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&line[..]);
        Ok(Some(text.trim_end_matches(&['\r', '\n'][..]).to_owned()))
    }

    async fn read_payload(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size + 2];
        self.reader.read_exact(&mut buf).await?;
        if &buf[size..] != protocol::CRLF {
            self.fail(ProtocolError::Parse("payload not terminated by CRLF".into()))?;
        }
        buf.truncate(size);
        Ok(buf)
    }

    async fn read_loop(&mut self) -> Result<()> {
        let mut line = Vec::with_capacity(128);
        loop {
            let text = match self.read_line(&mut line).await? {
                Some(text) => text,
                None => return Ok(()),
            };
            if text.trim().is_empty() {
                continue;
            }
            let op = match protocol::parse_op(&text) {
                Ok(op) => op,
                Err(err) => {
                    self.fail(err)?;
                    continue;
                }
            };
            self.handle(op).await?;
        }
    }

    async fn handle(&mut self, op: ClientOp) -> Result<()> {
        match op {
            ClientOp::Connect(opts) => {
                self.verbose = opts.verbose;
                self.broker.connect(self.id, opts);
                self.ok();
            }
            ClientOp::Ping => self.send(protocol::PONG.to_vec()),
            ClientOp::Pong => {}
            ClientOp::Sub {
                subject: subj,
                queue,
                sid,
            } => {
                if !subject::is_valid_subscription(&subj) {
                    return self.fail(ProtocolError::InvalidSubject);
                }
                if let Some(queue) = &queue {
                    if !subject::is_valid_queue(queue) {
                        return self.fail(ProtocolError::InvalidQueue);
                    }
                }
                self.broker.subscribe(self.id, subj, queue, sid);
                self.ok();
            }
            ClientOp::Unsub { sid, max } => {
                self.broker.unsubscribe(self.id, &sid, max);
                self.ok();
            }
            ClientOp::Pub {
                subject: subj,
                reply,
                size,
            } => {
                if size > self.broker.max_payload() {
                    return self.fail(ProtocolError::MaxPayload);
                }
                // the payload has to be consumed even if the subject is rejected
                let payload = self.read_payload(size).await?;
                if !subject::is_valid_publish_subject(&subj) {
                    return self.fail(ProtocolError::InvalidPublishSubject);
                }
                self.broker
                    .publish(self.id, &subj, reply.as_deref(), None, &payload);
                self.ok();
            }
            ClientOp::HPub {
                subject: subj,
                reply,
                header_size,
                total_size,
            } => {
                if total_size > self.broker.max_payload() {
                    return self.fail(ProtocolError::MaxPayload);
                }
                let block = self.read_payload(total_size).await?;
                if !subject::is_valid_publish_subject(&subj) {
                    return self.fail(ProtocolError::InvalidPublishSubject);
                }
                let (headers, payload) = block.split_at(header_size);
                self.broker
                    .publish(self.id, &subj, reply.as_deref(), Some(headers), payload);
                self.ok();
            }
        }
        Ok(())
    }
}
