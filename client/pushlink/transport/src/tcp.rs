//! Plain-TCP transport.
//!
//! One physical connection at a time: [`TcpTransport::stream`] dials the
//! server and transmits the opening request, then a single task owns the
//! socket, multiplexing queued control writes with streamed reads. Control
//! requests submitted through [`TcpTransport::send`] are written on the same
//! connection in submission order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::handle::{CancelSignal, RequestHandle};
use crate::{Transport, TransportError, TransportEvent};

struct ControlWrite {
    token: u64,
    body: String,
    signal: CancelSignal,
}

/// TCP implementation of the transport contract.
pub struct TcpTransport {
    addr: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    next_token: AtomicU64,
    writer: Mutex<Option<mpsc::UnboundedSender<ControlWrite>>>,
}

impl TcpTransport {
    /// Transport dialing `addr` (host:port), reporting events on `events`.
    pub fn new(addr: impl Into<String>, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            addr: addr.into(),
            events,
            next_token: AtomicU64::new(1),
            writer: Mutex::new(None),
        }
    }

    fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::SeqCst)
    }
}

impl Transport for TcpTransport {
    fn stream(&self, body: String) -> RequestHandle {
        let token = self.next_token();
        let handle = RequestHandle::new(token);

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        *self.writer.lock().expect("writer lock poisoned") = Some(write_tx);

        tokio::spawn(run_connection(
            self.addr.clone(),
            body,
            token,
            handle.signal().clone(),
            self.events.clone(),
            write_rx,
        ));

        handle
    }

    fn send(&self, body: String) -> RequestHandle {
        let token = self.next_token();
        let handle = RequestHandle::new(token);

        let queued = {
            let writer = self.writer.lock().expect("writer lock poisoned");
            match writer.as_ref() {
                Some(tx) => tx
                    .send(ControlWrite {
                        token,
                        body,
                        signal: handle.signal().clone(),
                    })
                    .is_ok(),
                None => false,
            }
        };

        if !queued {
            debug!("control request {} submitted with no connection", token);
            self.events
                .send(TransportEvent::Error {
                    token,
                    error: TransportError::NotConnected,
                })
                .ok();
        }

        handle
    }
}

async fn run_connection(
    addr: String,
    opening_body: String,
    token: u64,
    signal: CancelSignal,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut write_rx: mpsc::UnboundedReceiver<ControlWrite>,
) {
    let mut stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("connect to {} failed: {}", addr, e);
            if !signal.is_cancelled() {
                events
                    .send(TransportEvent::Error {
                        token,
                        error: TransportError::Io(e.to_string()),
                    })
                    .ok();
            }
            return;
        }
    };

    if let Err(e) = stream.write_all(format!("{}\r\n", opening_body).as_bytes()).await {
        if !signal.is_cancelled() {
            events
                .send(TransportEvent::Error {
                    token,
                    error: TransportError::Io(e.to_string()),
                })
                .ok();
        }
        return;
    }

    debug!("connection {} open to {}", token, addr);
    events.send(TransportEvent::Opened { token }).ok();

    let (mut reader, mut writer) = stream.into_split();
    let mut read_buf = BytesMut::with_capacity(16 * 1024);
    let mut writes_open = true;

    loop {
        tokio::select! {
            biased;

            _ = signal.cancelled() => {
                debug!("connection {} cancelled (force: {})", token, signal.force_requested());
                if signal.force_requested() {
                    let _ = writer.shutdown().await;
                }
                break;
            }

            maybe_write = write_rx.recv(), if writes_open => {
                match maybe_write {
                    Some(write) => {
                        if write.signal.is_cancelled() {
                            continue;
                        }
                        match writer.write_all(format!("{}\r\n", write.body).as_bytes()).await {
                            Ok(()) => {
                                if !write.signal.is_cancelled() {
                                    events.send(TransportEvent::Opened { token: write.token }).ok();
                                }
                            }
                            Err(e) => {
                                warn!("control write {} failed: {}", write.token, e);
                                if !write.signal.is_cancelled() {
                                    events.send(TransportEvent::Error {
                                        token: write.token,
                                        error: TransportError::Io(e.to_string()),
                                    }).ok();
                                }
                            }
                        }
                    }
                    None => writes_open = false,
                }
            }

            read = reader.read_buf(&mut read_buf) => {
                match read {
                    Ok(0) => {
                        debug!("connection {} closed by peer", token);
                        if !signal.is_cancelled() {
                            events.send(TransportEvent::Closed { token }).ok();
                        }
                        break;
                    }
                    Ok(_) => {
                        if !signal.is_cancelled() {
                            events.send(TransportEvent::Data {
                                token,
                                bytes: read_buf.split().freeze(),
                            }).ok();
                        }
                    }
                    Err(e) => {
                        warn!("read error on connection {}: {}", token, e);
                        if !signal.is_cancelled() {
                            events.send(TransportEvent::Error {
                                token,
                                error: TransportError::Io(e.to_string()),
                            }).ok();
                        }
                        break;
                    }
                }
            }
        }
    }
}
