//! Per-connection protocol state: `AwaitingHello -> Established -> Closed`.
//!
//! The machine is pure. It classifies each inbound binary frame into an
//! [`Action`] and the connection task carries it out.

use bytes::Bytes;
use microproto_core::messages::{decode_heartbeat, encode_pong, ErrorMessage, HelloRequest};
use microproto_core::wire::{OpCode, OpHeader};
use microproto_core::{ProtoError, SessionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHello,
    Established {
        session_id: SessionId,
        max_packet_size: u16,
    },
    Closed,
}

#[derive(Debug, PartialEq)]
pub enum Action {
    /// Hand the greeting to the engine.
    Handshake(HelloRequest),
    /// Answer on the control queue, ahead of broadcasts.
    Pong(Bytes),
    /// Property update frame for the engine.
    Forward(Bytes),
    /// Frame refused; the `ERROR` goes out on the control queue.
    Reject(Bytes),
    Ignore,
    /// End the connection without a response.
    Close(ProtoError),
}

pub struct SessionMachine {
    state: SessionState,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::AwaitingHello,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<SessionId> {
        match self.state {
            SessionState::Established { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    pub fn established(&mut self, session_id: SessionId, max_packet_size: u16) {
        self.state = SessionState::Established {
            session_id,
            max_packet_size,
        };
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    pub fn on_frame(&mut self, frame: Bytes) -> Action {
        match self.state {
            SessionState::AwaitingHello => self.awaiting_hello(&frame),
            SessionState::Established {
                max_packet_size, ..
            } => established(frame, max_packet_size),
            SessionState::Closed => Action::Ignore,
        }
    }

    fn awaiting_hello(&mut self, frame: &[u8]) -> Action {
        let Some(&first) = frame.first() else {
            self.close();
            return Action::Close(ProtoError::HandshakeProtocolViolation("empty frame".into()));
        };
        match OpHeader::decode(first).opcode() {
            Ok(OpCode::Hello) => match HelloRequest::decode(frame) {
                Ok(hello) => Action::Handshake(hello),
                Err(e) => {
                    self.close();
                    Action::Close(ProtoError::HandshakeProtocolViolation(format!(
                        "malformed HELLO: {e}"
                    )))
                }
            },
            _ => {
                self.close();
                Action::Close(ProtoError::HandshakeProtocolViolation(format!(
                    "expected HELLO, got header 0x{first:02X}"
                )))
            }
        }
    }
}

fn established(frame: Bytes, max_packet_size: u16) -> Action {
    let limit = usize::from(max_packet_size);
    if frame.len() > limit {
        let err = ProtoError::PacketTooLarge {
            size: frame.len(),
            limit,
        };
        let mut reply = ErrorMessage::from_error(&err);
        if let Some(op) = frame.first().and_then(|b| OpHeader::decode(*b).opcode().ok()) {
            reply = reply.related_to(op);
        }
        return Action::Reject(reply.encode());
    }
    let Some(&first) = frame.first() else {
        return Action::Ignore;
    };
    match OpHeader::decode(first).opcode() {
        Ok(OpCode::Ping) => match decode_heartbeat(&frame) {
            Ok(payload) => Action::Pong(encode_pong(payload)),
            Err(_) => Action::Ignore,
        },
        Ok(OpCode::PropertyUpdateShort | OpCode::PropertyUpdateLong) => Action::Forward(frame),
        // repeated HELLO, stray PONG/ERROR/SCHEMA and unknown opcodes
        _ => Action::Ignore,
    }
}
