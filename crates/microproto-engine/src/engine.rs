use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use microproto_core::messages::{
    encode_property_update, split_update_frame, ErrorMessage, HelloRequest, HelloResponse,
    UpdateEntry,
};
use microproto_core::wire::{OpCode, WireReader, PROTOCOL_VERSION};
use microproto_core::{ClientId, ProtoError, SessionId, Value};
use microproto_telemetry::{names, MetricsRecorder};

use crate::error::EngineError;
use crate::registry::PropertyRegistry;
use crate::validate::validate;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub protocol_version: u8,
    /// Largest frame the device accepts; the session limit is the smaller of
    /// this and the client's HELLO value.
    pub max_packet_size: u16,
    pub command_capacity: usize,
    /// Also send an accepted update back to the session that sent it.
    pub echo_to_originator: bool,
    /// Answer rejected updates with an `ERROR` frame.
    pub reply_errors: bool,
    /// Quiet period after the last change before a persistent value is
    /// written to the store. `0` writes on every change.
    pub persist_debounce_ms: u64,
    /// Buffered changes per in-process subscriber before it starts lagging.
    pub change_capacity: usize,
}

impl EngineConfig {
    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            max_packet_size: 4096,
            command_capacity: 1024,
            echo_to_originator: false,
            reply_errors: true,
            persist_debounce_ms: 1000,
            change_capacity: 256,
        }
    }
}

/// Who wrote a value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Origin {
    Session(ClientId),
    /// Host-side code (HTTP handlers, animations). May write read-only properties.
    Local,
}

/// A committed value, as seen by in-process subscribers.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyChange {
    pub id: u8,
    pub value: Value,
    pub origin: Origin,
}

/// Result of a successful HELLO.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub session_id: SessionId,
    pub max_packet_size: u16,
}

/// An accepted update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub property_id: u8,
    /// Sessions the broadcast was queued for.
    pub recipients: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertySnapshot {
    pub id: u8,
    pub namespace_id: u8,
    pub name: String,
    pub value: Value,
}

struct SessionEntry {
    session_id: SessionId,
    device_id: u32,
    outbound: mpsc::Sender<Bytes>,
}

/// Sole owner of the registry and of the established-session set.
///
/// Every read and write goes through `&mut self`, so exactly one update is
/// validated and applied at a time.
pub struct UpdateEngine {
    registry: PropertyRegistry,
    sessions: HashMap<ClientId, SessionEntry>,
    next_session_id: u32,
    started: Instant,
    config: EngineConfig,
    metrics: Option<Arc<MetricsRecorder>>,
    changes: broadcast::Sender<PropertyChange>,
    /// Persistent properties changed since their last write, with the time
    /// of the most recent change.
    dirty: BTreeMap<u8, tokio::time::Instant>,
}

impl UpdateEngine {
    pub fn new(registry: PropertyRegistry, config: EngineConfig) -> Self {
        let (changes, _) = broadcast::channel(config.change_capacity.max(1));
        Self {
            registry,
            sessions: HashMap::new(),
            next_session_id: 1,
            started: Instant::now(),
            config,
            metrics: None,
            changes,
            dirty: BTreeMap::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &PropertyRegistry {
        &self.registry
    }

    pub fn seal(&mut self) {
        self.registry.seal();
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Receive every committed change from now on, whatever its origin.
    /// A subscriber that falls more than `change_capacity` behind skips
    /// ahead and sees `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<PropertyChange> {
        self.changes.subscribe()
    }

    pub(crate) fn change_sender(&self) -> broadcast::Sender<PropertyChange> {
        self.changes.clone()
    }

    fn count(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        if let Some(m) = &self.metrics {
            m.counter_inc(name, labels, n);
        }
    }

    fn established_delta(&self, delta: f64) {
        if let Some(m) = &self.metrics {
            m.gauge_inc(names::SESSIONS_ESTABLISHED, &[], delta);
        }
    }

    /// Seconds since the engine started. Non-decreasing across sessions.
    fn timestamp(&self) -> u32 {
        u32::try_from(self.started.elapsed().as_secs()).unwrap_or(u32::MAX)
    }

    /// Serve a HELLO: allocate a session id and queue the HELLO response,
    /// the schema and the current values on `outbound`.
    ///
    /// On a version mismatch an `ERROR` is queued and `outbound` is dropped,
    /// which ends the connection once the writer drains it.
    pub fn open_session(
        &mut self,
        client: ClientId,
        hello: HelloRequest,
        outbound: mpsc::Sender<Bytes>,
    ) -> Result<Handshake, EngineError> {
        if hello.version != self.config.protocol_version {
            let err = ProtoError::VersionMismatch {
                expected: self.config.protocol_version,
                got: hello.version,
            };
            warn!(client_id = %client, got = hello.version, "protocol version mismatch");
            let _ = outbound.try_send(ErrorMessage::from_error(&err).related_to(OpCode::Hello).encode());
            self.count(names::SESSIONS_DROPPED, &[("reason", "version_mismatch")], 1);
            return Err(err.into());
        }

        self.registry.seal();
        if self.sessions.contains_key(&client) {
            return Err(ProtoError::HandshakeProtocolViolation("session already established".into()).into());
        }

        let max_packet_size = match hello.max_packet_size {
            0 => self.config.max_packet_size,
            n => n.min(self.config.max_packet_size),
        };
        let session_id = SessionId(self.next_session_id);
        self.next_session_id = self.next_session_id.wrapping_add(1).max(1);

        let response = HelloResponse {
            version: self.config.protocol_version,
            max_packet_size,
            session_id: session_id.0,
            timestamp: self.timestamp(),
        };
        let schema = self.registry.encode_schema()?;
        let values = self.registry.encode_values()?;
        let schema_bytes: usize = schema.iter().map(Bytes::len).sum();

        for frame in std::iter::once(response.encode()).chain(schema).chain(values) {
            if outbound.try_send(frame).is_err() {
                warn!(client_id = %client, "outbound queue too small for the initial sync");
                self.count(names::SESSIONS_DROPPED, &[("reason", "queue_full")], 1);
                return Err(EngineError::QueueFull);
            }
        }

        info!(
            client_id = %client,
            session_id = %session_id,
            device_id = format_args!("{:#010x}", hello.device_id),
            max_packet_size,
            properties = self.registry.len(),
            "session established"
        );
        if let Some(m) = &self.metrics {
            m.histogram_observe(names::SCHEMA_BYTES, &[], schema_bytes as f64);
        }
        self.sessions.insert(
            client,
            SessionEntry {
                session_id,
                device_id: hello.device_id,
                outbound,
            },
        );
        self.established_delta(1.0);
        Ok(Handshake {
            session_id,
            max_packet_size,
        })
    }

    /// Forget a session. Returns whether it was established.
    pub fn close_session(&mut self, client: &ClientId) -> bool {
        match self.sessions.remove(client) {
            Some(entry) => {
                info!(
                    client_id = %client,
                    session_id = %entry.session_id,
                    device_id = format_args!("{:#010x}", entry.device_id),
                    "session closed"
                );
                self.established_delta(-1.0);
                true
            }
            None => false,
        }
    }

    /// Apply one encoded value for `id`.
    pub fn apply_update(&mut self, origin: &Origin, id: u8, raw: &[u8]) -> Result<Outcome, ProtoError> {
        let entry = self.registry.get(id).ok_or(ProtoError::UnknownProperty(id))?;
        if entry.def.access.readonly && matches!(origin, Origin::Session(_)) {
            return Err(ProtoError::ReadOnlyViolation(id));
        }
        let mut r = WireReader::new(raw);
        let value = Value::decode(&mut r, &entry.def.ty)?;
        if !r.is_empty() {
            return Err(ProtoError::malformed(format!(
                "{} bytes after value of property {id}",
                r.remaining()
            )));
        }
        self.commit(origin, id, value)
    }

    /// Host-side write. Validated like a client update and broadcast to every
    /// established session; the read-only flag does not apply.
    pub fn set(&mut self, id: u8, value: Value) -> Result<Outcome, ProtoError> {
        let entry = self.registry.get(id).ok_or(ProtoError::UnknownProperty(id))?;
        value.check_shape(&entry.def.ty)?;
        self.commit(&Origin::Local, id, value)
    }

    pub fn get(&self, id: u8) -> Option<Value> {
        self.registry.get(id).map(|e| e.value.clone())
    }

    pub fn snapshot(&self) -> Vec<PropertySnapshot> {
        self.registry
            .iter()
            .map(|e| PropertySnapshot {
                id: e.def.id,
                namespace_id: e.def.namespace_id,
                name: e.def.name.clone(),
                value: e.value.clone(),
            })
            .collect()
    }

    fn commit(&mut self, origin: &Origin, id: u8, value: Value) -> Result<Outcome, ProtoError> {
        let entry = self.registry.get(id).ok_or(ProtoError::UnknownProperty(id))?;
        validate(&entry.def, &value)?;
        let frame = encode_property_update(&[UpdateEntry {
            id,
            ty: &entry.def.ty,
            value: &value,
        }])?;

        let persistent = entry.def.access.persistent;
        if self.changes.receiver_count() > 0 {
            let _ = self.changes.send(PropertyChange {
                id,
                value: value.clone(),
                origin: origin.clone(),
            });
        }
        self.registry.replace(id, value);
        if persistent {
            self.mark_dirty(id);
        }
        self.count(names::UPDATES_APPLIED, &[], 1);

        let exclude = match origin {
            Origin::Session(client) if !self.config.echo_to_originator => Some(client),
            _ => None,
        };
        let recipients = self.broadcast(&frame, exclude);
        debug!(property_id = id, ?origin, recipients, "update applied");
        Ok(Outcome {
            property_id: id,
            recipients,
        })
    }

    fn mark_dirty(&mut self, id: u8) {
        if self.config.persist_debounce_ms == 0 {
            self.persist(id);
            return;
        }
        self.dirty.insert(id, tokio::time::Instant::now());
    }

    fn persist(&mut self, id: u8) {
        match self.registry.persist(id) {
            Ok(()) => trace!(property_id = id, "value persisted"),
            Err(e) => warn!(property_id = id, error = %e, "failed to persist value"),
        }
    }

    /// When the oldest pending write becomes due, if any.
    pub fn next_persist_deadline(&self) -> Option<tokio::time::Instant> {
        let debounce = self.config.persist_debounce();
        self.dirty.values().min().map(|changed| *changed + debounce)
    }

    /// Write every pending value whose quiet period has elapsed by `now`.
    /// Returns how many were written.
    pub fn flush_due(&mut self, now: tokio::time::Instant) -> usize {
        let debounce = self.config.persist_debounce();
        let due: Vec<u8> = self
            .dirty
            .iter()
            .filter(|(_, changed)| **changed + debounce <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &due {
            self.dirty.remove(id);
            self.persist(*id);
        }
        due.len()
    }

    /// Write every pending value immediately.
    pub fn flush_all(&mut self) -> usize {
        let pending = std::mem::take(&mut self.dirty);
        for id in pending.keys() {
            self.persist(*id);
        }
        if !pending.is_empty() {
            debug!(count = pending.len(), "flushed pending values");
        }
        pending.len()
    }

    /// Queue `frame` for every established session except `exclude`.
    /// Sessions whose queue is full or closed are dropped.
    fn broadcast(&mut self, frame: &Bytes, exclude: Option<&ClientId>) -> usize {
        let mut delivered = 0;
        let mut dropped: Vec<(ClientId, &'static str)> = Vec::new();
        for (client, session) in &self.sessions {
            if exclude == Some(client) {
                continue;
            }
            match session.outbound.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(client_id = %client, session_id = %session.session_id, "outbound queue full, dropping session");
                    dropped.push((client.clone(), "queue_full"));
                }
                Err(TrySendError::Closed(_)) => dropped.push((client.clone(), "closed")),
            }
        }
        for (client, reason) in dropped {
            self.drop_session(&client, reason);
        }
        self.count(names::BROADCAST_FRAMES, &[], delivered as u64);
        delivered
    }

    fn drop_session(&mut self, client: &ClientId, reason: &'static str) {
        if self.sessions.remove(client).is_some() {
            self.established_delta(-1.0);
            self.count(names::SESSIONS_DROPPED, &[("reason", reason)], 1);
        }
    }

    fn reply_error(&mut self, client: &ClientId, err: &ProtoError, related: OpCode) {
        debug!(client_id = %client, error_kind = err.error_kind(), error = %err, "update rejected");
        self.count(names::UPDATES_REJECTED, &[("reason", err.error_kind())], 1);
        if !self.config.reply_errors {
            return;
        }
        let Some(session) = self.sessions.get(client) else {
            return;
        };
        let frame = ErrorMessage::from_error(err).related_to(related).encode();
        match session.outbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.drop_session(client, "queue_full"),
            Err(TrySendError::Closed(_)) => self.drop_session(client, "closed"),
        }
    }

    /// Handle an inbound PROPERTY_UPDATE_SHORT or PROPERTY_UPDATE_LONG frame
    /// (single or batched).
    ///
    /// Entries are applied in order; a failing entry does not undo earlier
    /// ones. Returns the number of entries applied.
    pub fn handle_update_frame(&mut self, client: &ClientId, frame: &Bytes) -> usize {
        if !self.sessions.contains_key(client) {
            trace!(client_id = %client, "update from a session that is not established, ignoring");
            return 0;
        }
        let split = split_update_frame(frame, |id| self.registry.type_of(id));
        let related = split.opcode.unwrap_or(OpCode::PropertyUpdateShort);
        let origin = Origin::Session(client.clone());
        let mut applied = 0;
        for raw in split.entries {
            match self.apply_update(&origin, raw.id, &raw.value) {
                Ok(_) => applied += 1,
                Err(e) => self.reply_error(client, &e, related),
            }
        }
        if let Some(e) = split.error {
            self.reply_error(client, &e, related);
        }
        applied
    }
}
