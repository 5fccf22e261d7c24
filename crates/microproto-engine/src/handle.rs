//! Async front of the engine: one task owns the [`UpdateEngine`] and drains a
//! command channel, which makes it the single serialization point.

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use microproto_core::messages::HelloRequest;
use microproto_core::{ClientId, Value};

use crate::engine::{Handshake, Outcome, PropertyChange, PropertySnapshot, UpdateEngine};
use crate::error::EngineError;

pub enum Command {
    Hello {
        client: ClientId,
        hello: HelloRequest,
        outbound: mpsc::Sender<Bytes>,
        reply: oneshot::Sender<Result<Handshake, EngineError>>,
    },
    Update {
        client: ClientId,
        frame: Bytes,
    },
    Close {
        client: ClientId,
    },
    Get {
        id: u8,
        reply: oneshot::Sender<Option<Value>>,
    },
    Set {
        id: u8,
        value: Value,
        reply: oneshot::Sender<Result<Outcome, EngineError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<PropertySnapshot>>,
    },
    SessionCount {
        reply: oneshot::Sender<usize>,
    },
}

/// Cheap, cloneable sender side of the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
    changes: broadcast::Sender<PropertyChange>,
}

impl EngineHandle {
    async fn send(&self, cmd: Command) -> Result<(), EngineError> {
        self.tx.send(cmd).await.map_err(|_| EngineError::EngineClosed)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| EngineError::EngineClosed)
    }

    /// Hand a HELLO and the connection's outbound queue to the engine.
    pub async fn hello(
        &self,
        client: ClientId,
        hello: HelloRequest,
        outbound: mpsc::Sender<Bytes>,
    ) -> Result<Handshake, EngineError> {
        self.request(|reply| Command::Hello {
            client,
            hello,
            outbound,
            reply,
        })
        .await?
    }

    /// Queue an inbound update frame. Waits only for command-channel capacity.
    pub async fn update(&self, client: ClientId, frame: Bytes) -> Result<(), EngineError> {
        self.send(Command::Update { client, frame }).await
    }

    pub async fn close(&self, client: ClientId) -> Result<(), EngineError> {
        self.send(Command::Close { client }).await
    }

    pub async fn get(&self, id: u8) -> Result<Option<Value>, EngineError> {
        self.request(|reply| Command::Get { id, reply }).await
    }

    /// Host-side write, broadcast to every established session.
    pub async fn set(&self, id: u8, value: Value) -> Result<Outcome, EngineError> {
        self.request(|reply| Command::Set { id, value, reply }).await?
    }

    pub async fn snapshot(&self) -> Result<Vec<PropertySnapshot>, EngineError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn session_count(&self) -> Result<usize, EngineError> {
        self.request(|reply| Command::SessionCount { reply }).await
    }

    /// Committed changes from both sessions and host-side writes.
    pub fn subscribe(&self) -> broadcast::Receiver<PropertyChange> {
        self.changes.subscribe()
    }
}

/// Seal the registry and start the engine task. The task ends when every
/// [`EngineHandle`] has been dropped.
pub fn spawn(mut engine: UpdateEngine) -> (EngineHandle, JoinHandle<()>) {
    engine.seal();
    let (tx, rx) = mpsc::channel(engine.config().command_capacity.max(1));
    let changes = engine.change_sender();
    let task = tokio::spawn(run(engine, rx));
    (EngineHandle { tx, changes }, task)
}

/// Drain commands, writing pending persistent values once they have been
/// quiet for the debounce period. Anything still pending is written when the
/// last handle goes away.
async fn run(mut engine: UpdateEngine, mut rx: mpsc::Receiver<Command>) {
    info!(properties = engine.registry().len(), "update engine started");
    loop {
        let deadline = engine.next_persist_deadline();
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => dispatch(&mut engine, cmd),
                None => break,
            },
            () = sleep_until(deadline), if deadline.is_some() => {
                engine.flush_due(tokio::time::Instant::now());
            }
        }
    }
    engine.flush_all();
    info!("update engine stopped");
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

fn dispatch(engine: &mut UpdateEngine, cmd: Command) {
    match cmd {
        Command::Hello {
            client,
            hello,
            outbound,
            reply,
        } => {
            let _ = reply.send(engine.open_session(client, hello, outbound));
        }
        Command::Update { client, frame } => {
            engine.handle_update_frame(&client, &frame);
        }
        Command::Close { client } => {
            if !engine.close_session(&client) {
                debug!(client_id = %client, "close for a connection without a session");
            }
        }
        Command::Get { id, reply } => {
            let _ = reply.send(engine.get(id));
        }
        Command::Set { id, value, reply } => {
            let _ = reply.send(engine.set(id, value).map_err(EngineError::from));
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(engine.snapshot());
        }
        Command::SessionCount { reply } => {
            let _ = reply.send(engine.session_count());
        }
    }
}
