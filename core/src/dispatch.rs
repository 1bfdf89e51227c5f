//! Request dispatch: one decoded request in, one response out.
//!
//! The dispatcher is shared by every session; per-connection state (the
//! negotiated schema and any subscription) lives in [`Session`].

use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;

use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::projection;
use crate::protocol::{Notification, Request, Response, Verb};
use crate::schema::SchemaName;
use crate::state::StateAggregator;
use crate::store::{Commit, ConfigStore, Mutation};


// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing received yet; `hello` may still pick a schema.
    Connected,
    /// Schema fixed by `hello`, no other request served yet.
    Authenticated(SchemaName),
    Serving(SchemaName),
    Closed,
}


pub struct Session {
    state: SessionState,
    subscription: Option<Receiver<Commit>>,
}

impl Session {
    pub fn new() -> Self {
        Session {
            state: SessionState::Connected,
            subscription: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_listening(&self) -> bool {
        self.subscription.is_some()
    }

    /// Close the session; dropping the receiver cancels any subscription.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.subscription = None;
    }

    /// Commits delivered since the last call, in commit order.
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        if let Some(rx) = &self.subscription {
            loop {
                match rx.try_recv() {
                    Ok(commit) => out.push(Notification::from(&commit)),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.subscription = None;
                        break;
                    }
                }
            }
        }
        out
    }

    fn schema(&self) -> SchemaName {
        match self.state {
            SessionState::Authenticated(s) | SessionState::Serving(s) => s,
            _ => SchemaName::default(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}


// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    store: Arc<ConfigStore>,
    aggregator: Arc<StateAggregator>,
}

impl Dispatcher {
    pub fn new(store: Arc<ConfigStore>, aggregator: Arc<StateAggregator>) -> Self {
        Dispatcher { store, aggregator }
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Serve one request. Errors become error responses; the session
    /// stays usable.
    pub fn handle(&self, session: &mut Session, req: Request) -> Response {
        debug!(id = %req.id, verb = req.verb.as_str(), path = ?req.path, "request");
        match self.serve(session, &req) {
            Ok(value) => Response::ok(req.id, value),
            Err(e) => {
                debug!(id = %req.id, error = %e, "request failed");
                Response::error(req.id, &e)
            }
        }
    }

    fn serve(&self, session: &mut Session, req: &Request) -> Result<Option<String>> {
        if session.state == SessionState::Closed {
            return Err(ConfigError::ProtocolError("session is closed".into()));
        }
        let requested = req.schema.as_deref().map(SchemaName::parse).transpose()?;

        if req.verb == Verb::Hello {
            if session.state != SessionState::Connected {
                return Err(ConfigError::ProtocolError(
                    "hello is only valid as the first request".into(),
                ));
            }
            let schema = requested.unwrap_or_default();
            session.state = SessionState::Authenticated(schema);
            return Ok(Some(schema.as_str().to_string()));
        }

        let session_schema = session.schema();
        session.state = SessionState::Serving(session_schema);
        let schema = requested.unwrap_or(session_schema);
        let path = req.path.as_deref().unwrap_or("/");

        match req.verb {
            Verb::Hello => unreachable!("handled above"),
            Verb::Get => {
                let snapshot = self.store.snapshot();
                projection::read_config(schema, &snapshot, path).map(Some)
            }
            Verb::GetState => {
                let snapshot = self.store.snapshot();
                self.aggregator.get_state(schema, &snapshot, path).map(Some)
            }
            Verb::Set => {
                let value = required_value(req)?;
                projection::write(&self.store, schema, Mutation::Set, path, Some(value))?;
                Ok(None)
            }
            Verb::Add => {
                let value = required_value(req)?;
                projection::write(&self.store, schema, Mutation::Add, path, Some(value))?;
                Ok(None)
            }
            Verb::Remove => {
                projection::write(&self.store, schema, Mutation::Remove, path, None)?;
                Ok(None)
            }
            Verb::Listen => {
                let snapshot = self.store.snapshot();
                let prefix = projection::listen_prefix(schema, &snapshot, path)?;
                session.subscription = Some(self.store.subscribe(prefix));
                Ok(None)
            }
        }
    }
}


fn required_value(req: &Request) -> Result<&str> {
    req.value.as_deref().ok_or_else(|| {
        ConfigError::ProtocolError(format!("'{}' needs a value", req.verb.as_str()))
    })
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
