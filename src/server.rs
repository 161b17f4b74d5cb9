//! Server glue: wires frames through the cluster leader gate into auth and
//! slot dispatch, and sends every reply through the connection's event
//! pipeline.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::auth::{self, User};
use crate::cluster::Cluster;
use crate::config::Config;
use crate::conn::{Callback, ConnError, Connection, ConnectionManager};
use crate::errors::wire_error;
use crate::protocol::{self, Message};
use crate::slots::{Broadcaster, SlotTable};

pub struct Server {
    manager: Arc<ConnectionManager>,
}

impl Server {
    /// Bind the listener, build the slot table, and start serving.
    pub fn start(config: &Config, cluster: Arc<dyn Cluster>) -> crate::Result<Server> {
        let manager = Arc::new(ConnectionManager::new(config.protocol));
        manager.start_listening(&config.addr)?;
        tracing::info!(addr = %config.addr, "starting server");

        let broadcaster: Arc<dyn Broadcaster> = Arc::clone(&manager) as Arc<dyn Broadcaster>;
        let slots = config.build_slots(&broadcaster)?;

        let dispatcher = Arc::new(Dispatcher {
            slots,
            users: config.users.clone(),
            cluster,
        });
        let callback: Callback =
            Arc::new(move |frame, conn| dispatcher.handle_message(frame, conn));
        manager.serve(callback)?;

        Ok(Server { manager })
    }

    /// The listener's resolved address; useful when binding port zero.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.manager.local_addr()
    }

    /// Stop accepting, drain every connection, and return once all
    /// connection threads have finished.
    pub fn stop(&self) {
        tracing::debug!("closing main listener");
        self.manager.close();
    }
}

struct Dispatcher {
    slots: SlotTable,
    users: BTreeMap<String, User>,
    cluster: Arc<dyn Cluster>,
}

impl Dispatcher {
    fn handle_message(&self, frame: &[u8], conn: &mut Connection) -> Result<(), ConnError> {
        let msg = match protocol::parse_message(frame) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!(id = %conn.id(), error = %err, "could not parse request");
                conn.send_event(&wire_error("PARSE_ERROR").response(None))?;
                return Ok(());
            }
        };

        if msg.command == b'q' {
            tracing::debug!(id = %conn.id(), "client disconnected");
            return Err(ConnError::Quit);
        }

        if !self.cluster.is_leader() {
            tracing::debug!(id = %conn.id(), "request made to node that is not leader");
            let mut response = wire_error("NOT_LEADER").response(None);
            response.push_str(&self.cluster.leader_id());
            conn.send_event(&response)?;
            return Ok(());
        }

        match msg.command {
            b'u' => self.handle_username(&msg, conn),
            b'p' => self.handle_password(&msg, conn),
            b'r' | b'w' => self.handle_slot(&msg, conn),
            _ => {
                // `j` parses but the data plane does not dispatch it.
                conn.send_event(&wire_error("PARSE_ERROR").response(None))?;
                Ok(())
            }
        }
    }

    fn handle_username(&self, msg: &Message, conn: &mut Connection) -> Result<(), ConnError> {
        if let Err(err) = auth::validate_username(&msg.value) {
            tracing::debug!(id = %conn.id(), user = %msg.value, error = %err, "invalid user received");
            conn.send_event(&wire_error("WRONG_USER").response(None))?;
            return Err(ConnError::AuthFailed);
        }

        conn.logged_user = None;
        conn.username = msg.value.clone();
        tracing::debug!(id = %conn.id(), user = %conn.username, "username set for connection");
        conn.send_event(&format!("v{}", conn.username))?;
        Ok(())
    }

    fn handle_password(&self, msg: &Message, conn: &mut Connection) -> Result<(), ConnError> {
        let candidate = match auth::get_user(&conn.username, &msg.value) {
            Ok(candidate) => candidate,
            Err(err) => {
                tracing::debug!(id = %conn.id(), error = %err, "invalid password received");
                conn.send_event(&wire_error("WRONG_PASS").response(None))?;
                return Err(ConnError::AuthFailed);
            }
        };

        match self.users.get(&candidate.name) {
            Some(known) if known.password == candidate.password => {
                conn.username = candidate.name;
                conn.logged_user = Some(known.clone());
                tracing::debug!(id = %conn.id(), user = %conn.username, "user logged in for connection");
                conn.send_event(&format!("v{}", conn.username))?;
                Ok(())
            }
            _ => {
                tracing::warn!(id = %conn.id(), "invalid login received");
                conn.send_event(&wire_error("WRONG_LOGIN").response(None))?;
                Err(ConnError::AuthFailed)
            }
        }
    }

    fn handle_slot(&self, msg: &Message, conn: &mut Connection) -> Result<(), ConnError> {
        let Some(slot) = self.slots.get(msg.slot).and_then(|s| s.as_ref()) else {
            tracing::debug!(id = %conn.id(), slot = msg.slot, "missing slot");
            conn.send_event(&wire_error("MISSING_SLOT").response(Some(msg.slot)))?;
            return Ok(());
        };

        let user = conn.logged_user.clone();

        let value = if msg.command == b'w' {
            if !slot.can_write(user.as_ref()) {
                tracing::info!(id = %conn.id(), slot = msg.slot, "write on slot without permission");
                conn.send_event(&wire_error("WRITE_PERMISSION").response(Some(msg.slot)))?;
                return Ok(());
            }
            match slot.write(&msg.value, conn.id()) {
                Ok(value) => value,
                Err(err) => {
                    tracing::error!(id = %conn.id(), slot = msg.slot, error = %err, "error writing in slot");
                    conn.send_event(&wire_error("WRITE_FAILED").response(Some(msg.slot)))?;
                    return Ok(());
                }
            }
        } else {
            if !slot.can_read(user.as_ref()) {
                tracing::info!(id = %conn.id(), slot = msg.slot, "read on slot without permission");
                conn.send_event(&wire_error("READ_PERMISSION").response(Some(msg.slot)))?;
                return Ok(());
            }
            slot.read()
        };

        conn.send_event(&format!("v{:03}{}", msg.slot, value))?;
        Ok(())
    }
}
