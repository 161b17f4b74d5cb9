//! One accepted socket: framing, auth state, and the outbound event
//! pipeline.
//!
//! Replies never touch the socket from the request handler. They are
//! enqueued as events on a bounded per-connection queue and written by a
//! dedicated writer thread that batches small bursts (up to
//! [`MAX_BATCH_EVENTS`] events or [`BATCH_WINDOW`], flushing immediately
//! when the queue runs dry), so steady-state traffic costs one syscall per
//! reply and broadcast bursts amortize.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use uuid::Uuid;

use crate::auth::User;

use super::{ConnError, ConnId, Dialect};

/// Inbound event queue capacity per connection.
pub(crate) const EVENT_QUEUE_CAPACITY: usize = 128;
/// Absolute deadline of every outbound event, from creation.
pub(crate) const EVENT_DEADLINE: Duration = Duration::from_millis(200);
/// Socket read deadline; timeouts are transient and the read loop retries.
pub(crate) const READ_TIMEOUT: Duration = Duration::from_millis(200);

const MAX_BATCH_EVENTS: usize = 20;
const BATCH_WINDOW: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Ok,
    Timeout,
    Error,
}

/// The single acknowledgement every event receives on its reply channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventReply {
    pub id: Uuid,
    pub status: EventStatus,
}

/// An outbound write request: payload line (terminator excluded), absolute
/// deadline, and the channel the writer acknowledges on.
#[derive(Debug, Clone)]
pub struct Event {
    pub(crate) id: Uuid,
    pub(crate) payload: Bytes,
    pub(crate) deadline: Instant,
    pub(crate) reply: Sender<EventReply>,
}

impl Event {
    pub(crate) fn new(payload: Bytes, reply: Sender<EventReply>) -> Event {
        Event {
            id: Uuid::new_v4(),
            payload,
            deadline: Instant::now() + EVENT_DEADLINE,
            reply,
        }
    }
}

pub struct Connection {
    id: ConnId,
    stream: TcpStream,
    dialect: Dialect,
    buffer: Vec<u8>,
    events: Sender<Event>,
    reply_tx: Sender<EventReply>,
    reply_rx: Receiver<EventReply>,
    quit: Arc<AtomicBool>,
    pub username: String,
    pub logged_user: Option<User>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnId,
        stream: TcpStream,
        dialect: Dialect,
        events: Sender<Event>,
        quit: Arc<AtomicBool>,
    ) -> Connection {
        let (reply_tx, reply_rx) = crossbeam::channel::bounded(1);
        Connection {
            id,
            stream,
            dialect,
            buffer: vec![0u8; dialect.buffer_size()],
            events,
            reply_tx,
            reply_rx,
            quit,
            username: String::new(),
            logged_user: None,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub(crate) fn should_quit(&self) -> bool {
        self.quit.load(Ordering::Relaxed)
    }

    pub(crate) fn frame(&self, len: usize) -> &[u8] {
        &self.buffer[..len]
    }

    /// Read one chunk from the socket into the framing buffer.
    ///
    /// Read timeouts are transient; EOF and every other socket error are
    /// permanent.
    pub(crate) fn receive_message(&mut self) -> Result<usize, ConnError> {
        match self.stream.read(&mut self.buffer) {
            Ok(0) => Err(ConnError::Closed),
            Ok(size) => Ok(size),
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                Err(ConnError::ReadTimeout)
            }
            Err(err) => {
                tracing::debug!(id = %self.id, error = %err, "error receiving data from connection");
                Err(ConnError::Closed)
            }
        }
    }

    /// Enqueue one reply line and wait for its acknowledgement.
    ///
    /// A full queue fails synchronously without the event entering the
    /// pipeline; otherwise exactly one reply arrives within the event
    /// deadline or the wait itself times out.
    pub fn send_event(&self, line: &str) -> Result<(), ConnError> {
        // A late reply from a previously timed-out event may still sit in
        // the channel; it belongs to no waiter anymore.
        while self.reply_rx.try_recv().is_ok() {}

        let event = Event::new(Bytes::copy_from_slice(line.as_bytes()), self.reply_tx.clone());
        let event_id = event.id;

        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(ConnError::QueueFull),
            Err(TrySendError::Disconnected(_)) => return Err(ConnError::Closed),
        }

        match self.reply_rx.recv_timeout(EVENT_DEADLINE) {
            Ok(reply) if reply.id == event_id => match reply.status {
                EventStatus::Ok => Ok(()),
                EventStatus::Timeout => Err(ConnError::ReplyTimeout),
                EventStatus::Error => Err(ConnError::EventFailed),
            },
            Ok(reply) => {
                tracing::debug!(id = %self.id, event = %reply.id, "reply for unexpected event");
                Err(ConnError::EventFailed)
            }
            Err(RecvTimeoutError::Timeout) => Err(ConnError::ReplyTimeout),
            Err(RecvTimeoutError::Disconnected) => Err(ConnError::Closed),
        }
    }
}

/// Writer loop: consume the event queue, batch, write, acknowledge.
pub(crate) fn run_writer(events: Receiver<Event>, mut stream: TcpStream) {
    loop {
        let first = match events.recv() {
            Ok(event) => event,
            Err(_) => break,
        };

        let mut batch = vec![first];
        let window = Instant::now() + BATCH_WINDOW;
        while batch.len() < MAX_BATCH_EVENTS && Instant::now() < window {
            match events.try_recv() {
                Ok(event) => batch.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        flush_batch(&mut stream, batch);
    }
}

fn flush_batch(stream: &mut TcpStream, batch: Vec<Event>) {
    let now = Instant::now();

    let mut live = Vec::with_capacity(batch.len());
    for event in batch {
        if now > event.deadline {
            acknowledge(&event, EventStatus::Timeout);
        } else {
            live.push(event);
        }
    }
    if live.is_empty() {
        return;
    }

    let mut wire = Vec::with_capacity(live.iter().map(|e| e.payload.len() + 1).sum());
    for (i, event) in live.iter().enumerate() {
        if i > 0 {
            wire.push(b'\n');
        }
        wire.extend_from_slice(&event.payload);
    }
    wire.push(b'\n');

    let latest = live
        .iter()
        .map(|event| event.deadline)
        .max()
        .unwrap_or(now);
    let budget = latest
        .saturating_duration_since(now)
        .max(Duration::from_millis(1));
    if let Err(err) = stream.set_write_timeout(Some(budget)) {
        tracing::debug!(error = %err, "failed to set write deadline");
    }

    let status = match stream.write_all(&wire) {
        Ok(()) => EventStatus::Ok,
        Err(err) => {
            tracing::debug!(error = %err, "event write failed");
            EventStatus::Error
        }
    };

    for event in live {
        acknowledge(&event, status);
    }
}

fn acknowledge(event: &Event, status: EventStatus) {
    // A broadcast origin may have stopped counting at its deadline; a full
    // or dropped reply channel is not the writer's problem.
    let _ = event.reply.try_send(EventReply {
        id: event.id,
        status,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::BufRead;
    use std::net::TcpListener;
    use std::thread;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    fn event(line: &str, reply: &Sender<EventReply>) -> Event {
        Event::new(Bytes::copy_from_slice(line.as_bytes()), reply.clone())
    }

    #[test]
    fn writer_acknowledges_each_event_once() {
        let (server, client) = socket_pair();
        let (events_tx, events_rx) = crossbeam::channel::bounded(EVENT_QUEUE_CAPACITY);
        let writer = thread::spawn(move || run_writer(events_rx, server));

        let (reply_tx, reply_rx) = crossbeam::channel::bounded(10);
        events_tx.send(event("v000one", &reply_tx)).unwrap();
        events_tx.send(event("v000two", &reply_tx)).unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let reply = reply_rx.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(reply.status, EventStatus::Ok);
            seen.push(reply.id);
        }
        assert_ne!(seen[0], seen[1]);

        let mut reader = std::io::BufReader::new(client);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "v000one\n");
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "v000two\n");

        drop(events_tx);
        writer.join().unwrap();
    }

    #[test]
    fn expired_events_are_timed_out_not_written() {
        let (server, client) = socket_pair();
        let (events_tx, events_rx) = crossbeam::channel::bounded(EVENT_QUEUE_CAPACITY);

        let (reply_tx, reply_rx) = crossbeam::channel::bounded(10);
        let mut stale = event("v000stale", &reply_tx);
        stale.deadline = Instant::now() - Duration::from_millis(1);
        events_tx.send(stale).unwrap();
        events_tx.send(event("v000fresh", &reply_tx)).unwrap();

        let writer = thread::spawn(move || run_writer(events_rx, server));

        let first = reply_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = reply_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let statuses = [first.status, second.status];
        assert!(statuses.contains(&EventStatus::Timeout));
        assert!(statuses.contains(&EventStatus::Ok));

        let mut reader = std::io::BufReader::new(client);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "v000fresh\n");

        drop(events_tx);
        writer.join().unwrap();
    }

    #[test]
    fn send_event_reports_full_queue_synchronously() {
        let (server, _client) = socket_pair();
        let (events_tx, events_rx) = crossbeam::channel::bounded(2);
        let quit = Arc::new(AtomicBool::new(false));
        let conn = Connection::new(ConnId::new(), server, Dialect::Standard, events_tx, quit);

        // Nothing consumes the queue; fill it, then the next send must fail
        // without blocking.
        let (reply_tx, _reply_rx) = crossbeam::channel::bounded(1);
        conn.events.send(event("v000a", &reply_tx)).unwrap();
        conn.events.send(event("v000b", &reply_tx)).unwrap();

        match conn.send_event("v000c") {
            Err(ConnError::QueueFull) => {}
            other => panic!("expected QueueFull, got {other:?}"),
        }
        drop(events_rx);
    }
}
