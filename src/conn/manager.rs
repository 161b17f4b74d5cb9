//! Listener and connection registry.
//!
//! One manager owns one TCP listener. Every accepted socket gets a handler
//! thread (read, frame, dispatch) and a writer thread (consume the event
//! queue); the registry keeps just enough of each connection to broadcast
//! to it and to signal quit on shutdown.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{RecvTimeoutError, Sender};
use uuid::Uuid;

use crate::errors::wire_error;
use crate::metrics;
use crate::slots::{BroadcastError, Broadcaster};

use super::connection::{
    run_writer, Connection, Event, EventStatus, EVENT_DEADLINE, EVENT_QUEUE_CAPACITY, READ_TIMEOUT,
};
use super::{ConnError, ConnId, Dialect};

/// Reply channel capacity of a broadcast fan-out; must cover the credit
/// window below.
const BROADCAST_REPLY_CAPACITY: usize = 100;
/// Stop enqueueing when this many replies are outstanding.
const BROADCAST_WINDOW_HIGH: u64 = 90;
/// Drain down to this many outstanding replies before resuming.
const BROADCAST_WINDOW_LOW: u64 = 50;

const ACCEPT_POLL: Duration = Duration::from_millis(25);

/// Request dispatcher invoked once per framed request. The frame has its
/// terminator already stripped.
pub type Callback = Arc<dyn Fn(&[u8], &mut Connection) -> Result<(), ConnError> + Send + Sync>;

struct Registered {
    events: Sender<Event>,
    quit: Arc<AtomicBool>,
}

pub struct ConnectionManager {
    dialect: Dialect,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    connections: RwLock<HashMap<ConnId, Registered>>,
    shutdown: Arc<AtomicBool>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
    handler_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(dialect: Dialect) -> ConnectionManager {
        ConnectionManager {
            dialect,
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            connections: RwLock::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            accept_handle: Mutex::new(None),
            handler_handles: Mutex::new(Vec::new()),
        }
    }

    /// Bind the TCP listener. Port zero is honored; the resolved address
    /// is available from [`local_addr`](Self::local_addr) afterwards.
    pub fn start_listening(&self, addr: &str) -> Result<(), ConnError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        *self.local_addr.lock().expect("listener lock poisoned") = Some(local);
        *self.listener.lock().expect("listener lock poisoned") = Some(listener);
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("listener lock poisoned")
    }

    /// Start the accept loop. Each accepted socket is registered and served
    /// on its own handler thread until it quits or the manager closes.
    pub fn serve(self: &Arc<Self>, callback: Callback) -> Result<(), ConnError> {
        let listener = self
            .listener
            .lock()
            .expect("listener lock poisoned")
            .take()
            .ok_or_else(|| {
                ConnError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "serve called before start_listening",
                ))
            })?;

        let manager = Arc::clone(self);
        let handle = thread::spawn(move || manager.accept_loop(listener, callback));
        *self.accept_handle.lock().expect("accept handle lock poisoned") = Some(handle);
        Ok(())
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener, callback: Callback) {
        tracing::debug!("starting loop to accept connections");
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                tracing::debug!("stop serving connections");
                break;
            }

            match listener.accept() {
                Ok((stream, remote_addr)) => {
                    let manager = Arc::clone(&self);
                    let callback = Arc::clone(&callback);
                    let handle = thread::spawn(move || {
                        manager.handle_connection(stream, remote_addr, callback);
                    });
                    self.handler_handles
                        .lock()
                        .expect("handler handles lock poisoned")
                        .push(handle);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(err) => {
                    tracing::error!(error = %err, "error accepting connection");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }

    fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        callback: Callback,
    ) {
        if let Err(err) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
            tracing::error!(error = %err, "failed to set read deadline");
            return;
        }
        let _ = stream.set_nodelay(true);

        let writer_stream = match stream.try_clone() {
            Ok(clone) => clone,
            Err(err) => {
                tracing::error!(error = %err, "failed to clone connection stream");
                return;
            }
        };

        let id = ConnId::new();
        let (events_tx, events_rx) = crossbeam::channel::bounded(EVENT_QUEUE_CAPACITY);
        let quit = Arc::new(AtomicBool::new(false));
        self.register(id, events_tx.clone(), Arc::clone(&quit));
        metrics::incr_connected_clients();

        tracing::debug!(id = %id, remote_addr = %remote_addr, "connection received");

        let writer = thread::spawn(move || run_writer(events_rx, writer_stream));
        let mut conn = Connection::new(id, stream, self.dialect, events_tx, quit);

        self.read_loop(&mut conn, &callback);

        tracing::debug!(id = %id, remote_addr = %remote_addr, "closing connection");
        self.deregister(id);
        metrics::decr_connected_clients();
        drop(conn);
        let _ = writer.join();
    }

    fn read_loop(&self, conn: &mut Connection, callback: &Callback) {
        loop {
            if conn.should_quit() || self.shutdown.load(Ordering::Relaxed) {
                return;
            }

            let size = match conn.receive_message() {
                Ok(size) => size,
                Err(err) if err.is_permanent() => {
                    tracing::debug!(id = %conn.id(), "{err}");
                    return;
                }
                Err(_) => continue,
            };

            let started = Instant::now();

            let Some(content_len) = conn.dialect().strip_terminator(conn.frame(size)) else {
                tracing::debug!(id = %conn.id(), "message not terminated correctly");
                let response = wire_error("PARSE_ERROR").response(None);
                if let Err(err) = conn.send_event(&response) {
                    if err.is_permanent() {
                        return;
                    }
                }
                continue;
            };

            let frame = conn.frame(content_len).to_vec();
            let result = callback(&frame, conn);
            metrics::record_request(started.elapsed());

            match result {
                Ok(()) => {}
                Err(err) if err.is_permanent() => {
                    tracing::debug!(id = %conn.id(), "{err}");
                    return;
                }
                Err(err) => {
                    tracing::debug!(id = %conn.id(), "{err}");
                }
            }
        }
    }

    fn register(&self, id: ConnId, events: Sender<Event>, quit: Arc<AtomicBool>) {
        self.connections
            .write()
            .expect("connection registry lock poisoned")
            .insert(id, Registered { events, quit });
    }

    fn deregister(&self, id: ConnId) {
        let removed = self
            .connections
            .write()
            .expect("connection registry lock poisoned")
            .remove(&id);
        if removed.is_none() {
            tracing::debug!(id = %id, "connection already deregistered");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .expect("connection registry lock poisoned")
            .len()
    }

    /// Stop accepting, signal every live connection to quit, and wait for
    /// all handler threads to drain.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::Relaxed);

        {
            let connections = self
                .connections
                .read()
                .expect("connection registry lock poisoned");
            for registered in connections.values() {
                registered.quit.store(true, Ordering::Relaxed);
            }
        }

        if let Some(handle) = self
            .accept_handle
            .lock()
            .expect("accept handle lock poisoned")
            .take()
        {
            let _ = handle.join();
        }

        tracing::info!("waiting for connections to be drained");
        let handles = std::mem::take(
            &mut *self
                .handler_handles
                .lock()
                .expect("handler handles lock poisoned"),
        );
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Fan one event out to every registered connection.
    ///
    /// Failed enqueues count as fired-with-error. While more than
    /// [`BROADCAST_WINDOW_HIGH`] replies are outstanding the fan-out drains
    /// down to [`BROADCAST_WINDOW_LOW`] before enqueueing more, keeping the
    /// shared reply channel inside its capacity even when peers are slow.
    /// Replies still missing at the event deadline are abandoned.
    fn fan_out(&self, line: &str) -> String {
        let (reply_tx, reply_rx) = crossbeam::channel::bounded(BROADCAST_REPLY_CAPACITY);
        let payload = Bytes::copy_from_slice(line.as_bytes());
        let event_id = Uuid::new_v4();
        let deadline = Instant::now() + EVENT_DEADLINE;

        let senders: Vec<Sender<Event>> = {
            let connections = self
                .connections
                .read()
                .expect("connection registry lock poisoned");
            connections.values().map(|r| r.events.clone()).collect()
        };

        let mut sent: u64 = 0;
        let mut received: u64 = 0;
        let mut errors: u64 = 0;

        for sender in senders {
            let event = Event {
                id: event_id,
                payload: payload.clone(),
                deadline,
                reply: reply_tx.clone(),
            };
            sent += 1;
            if sender.try_send(event).is_err() {
                errors += 1;
            }

            if sent - received - errors > BROADCAST_WINDOW_HIGH {
                while sent - received - errors > BROADCAST_WINDOW_LOW {
                    let budget = deadline.saturating_duration_since(Instant::now());
                    if budget.is_zero() {
                        break;
                    }
                    match reply_rx.recv_timeout(budget) {
                        Ok(reply) => {
                            if reply.id == event_id && reply.status == EventStatus::Ok {
                                received += 1;
                            } else {
                                errors += 1;
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            }
        }

        while received + errors < sent {
            let budget = deadline.saturating_duration_since(Instant::now());
            if budget.is_zero() {
                break;
            }
            match reply_rx.recv_timeout(budget) {
                Ok(reply) => {
                    if reply.id == event_id && reply.status == EventStatus::Ok {
                        received += 1;
                    } else {
                        errors += 1;
                    }
                }
                Err(_) => break,
            }
        }

        format!("{received}/{sent}/{errors}")
    }
}

impl Broadcaster for ConnectionManager {
    fn broadcast(&self, line: &str) -> Result<String, BroadcastError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(BroadcastError {
                reason: "connection manager is closed".to_string(),
            });
        }
        Ok(self.fan_out(line))
    }
}
