use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use microproto_core::messages::{
    decode_property_update, encode_ping, encode_property_update, encode_property_update_long,
    ErrorMessage, HelloRequest, HelloResponse, UpdateEntry,
};
use microproto_core::schema::decode_schema_upsert;
use microproto_core::types::ListConstraints;
use microproto_core::wire::OpCode;
use microproto_core::{ErrorCode, PropertyDef, PropertyType, Scalar, ScalarType, Value};
use microproto_engine::{EngineConfig, EngineHandle, Origin, PropertyRegistry, UpdateEngine};
use microproto_server::{start, ServerConfig, ServerHandle};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn registry() -> PropertyRegistry {
    let mut reg = PropertyRegistry::new();
    reg.register(PropertyDef::scalar(0, "enabled", ScalarType::Bool), Value::Bool(true))
        .unwrap();
    reg.register(
        PropertyDef::scalar(2, "speed", ScalarType::Float32)
            .min(Scalar::Float32(0.1))
            .max(Scalar::Float32(10.0)),
        Value::Float32(1.0),
    )
    .unwrap();
    reg.register(
        PropertyDef::scalar(3, "brightness", ScalarType::UInt8)
            .min(Scalar::UInt8(0))
            .max(Scalar::UInt8(255)),
        Value::UInt8(128),
    )
    .unwrap();
    reg.register(
        PropertyDef::scalar(6, "uptime", ScalarType::Int32).readonly(),
        Value::Int32(0),
    )
    .unwrap();
    reg
}

async fn serve(config: ServerConfig) -> (ServerHandle, EngineHandle) {
    serve_registry(registry(), config).await
}

async fn serve_registry(registry: PropertyRegistry, config: ServerConfig) -> (ServerHandle, EngineHandle) {
    let (engine, _task) =
        microproto_engine::spawn(UpdateEngine::new(registry, EngineConfig::default()));
    let config = ServerConfig {
        port: 0,
        ..config
    };
    let handle = start(config, engine.clone(), None).await.unwrap();
    (handle, engine)
}

async fn connect(handle: &ServerHandle) -> Ws {
    let url = format!("ws://127.0.0.1:{}/", handle.port);
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

fn hello(max_packet_size: u16) -> Bytes {
    HelloRequest {
        version: 1,
        max_packet_size,
        device_id: 0x1234_5678,
    }
    .encode()
}

async fn send(ws: &mut Ws, frame: Bytes) {
    ws.send(Message::Binary(frame)).await.unwrap();
}

/// Next binary frame, or `None` once the server closes the socket.
async fn recv(ws: &mut Ws) -> Option<Bytes> {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame");
        match msg {
            Some(Ok(Message::Binary(data))) => return Some(data),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn assert_silent(ws: &mut Ws) {
    let res = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(res.is_err(), "unexpected frame: {res:?}");
}

/// HELLO, then consume the response, schema and values.
async fn establish(ws: &mut Ws) -> HelloResponse {
    send(ws, hello(4096)).await;
    let resp = HelloResponse::decode(&recv(ws).await.unwrap()).unwrap();
    recv(ws).await.unwrap();
    recv(ws).await.unwrap();
    resp
}

fn update(id: u8, ty: PropertyType, value: Value) -> Bytes {
    encode_property_update(&[UpdateEntry {
        id,
        ty: &ty,
        value: &value,
    }])
    .unwrap()
}

#[tokio::test]
async fn handshake_delivers_hello_schema_and_values() {
    let (handle, _engine) = serve(ServerConfig::default()).await;
    let mut ws = connect(&handle).await;

    send(&mut ws, hello(4096)).await;

    let frame = recv(&mut ws).await.unwrap();
    assert_eq!(frame.len(), 12);
    let resp = HelloResponse::decode(&frame).unwrap();
    assert_eq!(resp.version, 1);
    assert_eq!(resp.max_packet_size, 4096);
    assert!(resp.session_id > 0);

    let schema = decode_schema_upsert(&recv(&mut ws).await.unwrap()).unwrap();
    let names: Vec<_> = schema.iter().map(|(def, _)| def.name.as_str()).collect();
    assert_eq!(names, ["enabled", "speed", "brightness", "uptime"]);

    let values = recv(&mut ws).await.unwrap();
    let lookup = |id| schema.iter().find(|(d, _)| d.id == id).map(|(d, _)| d.ty.clone());
    let decoded = decode_property_update(&values, lookup).unwrap();
    assert!(decoded.contains(&(3, Value::UInt8(128))));
}

#[tokio::test]
async fn reconnect_gets_fresh_session_id() {
    let (handle, _engine) = serve(ServerConfig::default()).await;

    let mut first = connect(&handle).await;
    let a = establish(&mut first).await;
    first.close(None).await.unwrap();

    let mut second = connect(&handle).await;
    let b = establish(&mut second).await;
    assert_ne!(a.session_id, b.session_id);
    assert!(b.timestamp >= a.timestamp);
}

#[tokio::test]
async fn accepted_update_reaches_other_sessions() {
    let (handle, engine) = serve(ServerConfig::default()).await;
    let mut a = connect(&handle).await;
    let mut b = connect(&handle).await;
    establish(&mut a).await;
    establish(&mut b).await;

    let frame = update(3, PropertyType::Scalar(ScalarType::UInt8), Value::UInt8(100));
    send(&mut a, frame.clone()).await;

    assert_eq!(recv(&mut b).await.unwrap(), frame);
    // no self-echo
    assert_silent(&mut a).await;
    assert_eq!(engine.get(3).await.unwrap(), Some(Value::UInt8(100)));

    // identical resend, identical broadcast bytes
    send(&mut a, frame.clone()).await;
    assert_eq!(recv(&mut b).await.unwrap(), frame);
}

#[tokio::test]
async fn rejected_update_gets_error_and_is_not_broadcast() {
    let (handle, engine) = serve(ServerConfig::default()).await;
    let mut a = connect(&handle).await;
    let mut b = connect(&handle).await;
    establish(&mut a).await;
    establish(&mut b).await;

    let speed = PropertyType::Scalar(ScalarType::Float32);
    send(&mut a, update(2, speed, Value::Float32(100.0))).await;

    let err = ErrorMessage::decode(&recv(&mut a).await.unwrap()).unwrap();
    assert_eq!(err.code, ErrorCode::VALIDATION_FAILED);
    assert_eq!(engine.get(2).await.unwrap(), Some(Value::Float32(1.0)));

    // B's next frame is the following valid update, not the rejected one
    let valid = update(3, PropertyType::Scalar(ScalarType::UInt8), Value::UInt8(7));
    send(&mut a, valid.clone()).await;
    assert_eq!(recv(&mut b).await.unwrap(), valid);
}

#[tokio::test]
async fn readonly_write_is_denied() {
    let (handle, _engine) = serve(ServerConfig::default()).await;
    let mut ws = connect(&handle).await;
    establish(&mut ws).await;

    send(
        &mut ws,
        update(6, PropertyType::Scalar(ScalarType::Int32), Value::Int32(5)),
    )
    .await;
    let err = ErrorMessage::decode(&recv(&mut ws).await.unwrap()).unwrap();
    assert_eq!(err.code, ErrorCode::PERMISSION_DENIED);
}

#[tokio::test]
async fn host_set_is_broadcast_to_every_session() {
    let (handle, engine) = serve(ServerConfig::default()).await;
    let mut ws = connect(&handle).await;
    establish(&mut ws).await;

    let outcome = engine.set(6, Value::Int32(42)).await.unwrap();
    assert_eq!(outcome.recipients, 1);
    let frame = recv(&mut ws).await.unwrap();
    assert_eq!(&frame[..], &[0x01, 6, 0x00, 42, 0, 0, 0]);
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let (handle, _engine) = serve(ServerConfig::default()).await;
    let mut ws = connect(&handle).await;
    establish(&mut ws).await;

    send(&mut ws, encode_ping(0x0403_0201)).await;
    let pong = recv(&mut ws).await.unwrap();
    assert_eq!(&pong[..], &[0x09, 0x01, 0x02, 0x03, 0x04]);
}

#[tokio::test]
async fn unknown_opcode_and_text_frames_are_ignored() {
    let (handle, _engine) = serve(ServerConfig::default()).await;
    let mut ws = connect(&handle).await;
    establish(&mut ws).await;

    send(&mut ws, Bytes::from_static(&[0x0F, 0xAA])).await;
    ws.send(Message::text("hi")).await.unwrap();
    assert_silent(&mut ws).await;

    send(&mut ws, encode_ping(9)).await;
    assert_eq!(recv(&mut ws).await.unwrap()[0], 0x09);
}

#[tokio::test]
async fn update_before_hello_closes_without_response() {
    let (handle, _engine) = serve(ServerConfig::default()).await;
    let mut ws = connect(&handle).await;

    send(
        &mut ws,
        update(3, PropertyType::Scalar(ScalarType::UInt8), Value::UInt8(1)),
    )
    .await;
    assert!(recv(&mut ws).await.is_none());
}

#[tokio::test]
async fn version_mismatch_gets_error_then_close() {
    let (handle, _engine) = serve(ServerConfig::default()).await;
    let mut ws = connect(&handle).await;

    let bad = HelloRequest {
        version: 2,
        max_packet_size: 4096,
        device_id: 1,
    };
    send(&mut ws, bad.encode()).await;

    let err = ErrorMessage::decode(&recv(&mut ws).await.unwrap()).unwrap();
    assert_eq!(err.code, ErrorCode::PROTOCOL_VERSION_MISMATCH);
    assert!(recv(&mut ws).await.is_none());
}

#[tokio::test]
async fn oversize_frame_gets_buffer_overflow() {
    let (handle, engine) = serve(ServerConfig::default()).await;
    let mut ws = connect(&handle).await;

    send(&mut ws, hello(16)).await;
    let resp = HelloResponse::decode(&recv(&mut ws).await.unwrap()).unwrap();
    assert_eq!(resp.max_packet_size, 16);
    recv(&mut ws).await.unwrap();
    recv(&mut ws).await.unwrap();

    let mut big = vec![0x01, 3, 0x00, 9];
    big.resize(32, 0);
    send(&mut ws, Bytes::from(big)).await;

    let err = ErrorMessage::decode(&recv(&mut ws).await.unwrap()).unwrap();
    assert_eq!(err.code, ErrorCode::BUFFER_OVERFLOW);
    assert_eq!(engine.get(3).await.unwrap(), Some(Value::UInt8(128)));
}

#[tokio::test]
async fn idle_client_is_closed_and_leaves_broadcast_set() {
    let config = ServerConfig {
        idle_timeout_secs: 1,
        sweep_interval_secs: 1,
        ..Default::default()
    };
    let (handle, engine) = serve(config).await;
    let mut ws = connect(&handle).await;
    establish(&mut ws).await;
    assert_eq!(engine.session_count().await.unwrap(), 1);

    assert!(recv(&mut ws).await.is_none());

    let mut sessions = 1;
    for _ in 0..50 {
        sessions = engine.session_count().await.unwrap();
        if sessions == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(sessions, 0);
    assert_eq!(handle.client_registry.count(), 0);
}

#[tokio::test]
async fn long_form_update_is_applied_and_rebroadcast_short() {
    let (handle, engine) = serve(ServerConfig::default()).await;
    let mut a = connect(&handle).await;
    let mut b = connect(&handle).await;
    establish(&mut a).await;
    establish(&mut b).await;

    let ty = PropertyType::Scalar(ScalarType::UInt8);
    let long = encode_property_update_long(&[UpdateEntry {
        id: 3,
        ty: &ty,
        value: &Value::UInt8(55),
    }])
    .unwrap();
    assert_eq!(&long[..], &[0x02, 3, 0, 0, 55]);
    send(&mut a, long).await;

    assert_eq!(&recv(&mut b).await.unwrap()[..], &[0x01, 3, 0, 55]);
    assert_eq!(engine.get(3).await.unwrap(), Some(Value::UInt8(55)));

    // id 300 cannot name a property
    send(&mut a, Bytes::from_static(&[0x02, 0x2C, 0x01, 0x00, 1])).await;
    let err = ErrorMessage::decode(&recv(&mut a).await.unwrap()).unwrap();
    assert_eq!(err.code, ErrorCode::INVALID_PROPERTY_ID);
    assert_eq!(err.related_opcode, Some(OpCode::PropertyUpdateLong as u8));
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn batch_with_bad_entry_commits_the_entries_before_it() {
    let (handle, engine) = serve(ServerConfig::default()).await;
    let mut a = connect(&handle).await;
    let mut b = connect(&handle).await;
    establish(&mut a).await;
    establish(&mut b).await;

    let bool_ty = PropertyType::Scalar(ScalarType::Bool);
    let float_ty = PropertyType::Scalar(ScalarType::Float32);
    let u8_ty = PropertyType::Scalar(ScalarType::UInt8);
    let batch = encode_property_update(&[
        UpdateEntry {
            id: 0,
            ty: &bool_ty,
            value: &Value::Bool(false),
        },
        UpdateEntry {
            id: 2,
            ty: &float_ty,
            value: &Value::Float32(50.0),
        },
        UpdateEntry {
            id: 3,
            ty: &u8_ty,
            value: &Value::UInt8(9),
        },
    ])
    .unwrap();
    assert_eq!(batch[0], 0x81);
    send(&mut a, batch).await;

    let err = ErrorMessage::decode(&recv(&mut a).await.unwrap()).unwrap();
    assert_eq!(err.code, ErrorCode::VALIDATION_FAILED);
    assert_eq!(&recv(&mut b).await.unwrap()[..], &[0x01, 0, 0, 0]);
    assert_eq!(&recv(&mut b).await.unwrap()[..], &[0x01, 3, 0, 9]);
    assert_silent(&mut b).await;

    assert_eq!(engine.get(0).await.unwrap(), Some(Value::Bool(false)));
    assert_eq!(engine.get(2).await.unwrap(), Some(Value::Float32(1.0)));
    assert_eq!(engine.get(3).await.unwrap(), Some(Value::UInt8(9)));
}

#[tokio::test]
async fn pong_is_answered_while_broadcasts_are_queued() {
    let (handle, engine) = serve(ServerConfig::default()).await;
    let mut ws = connect(&handle).await;
    establish(&mut ws).await;

    for v in 0..50 {
        engine.set(6, Value::Int32(v)).await.unwrap();
    }
    send(&mut ws, encode_ping(77)).await;

    let mut updates = 0;
    let mut pongs = 0;
    while updates < 50 || pongs == 0 {
        let frame = recv(&mut ws).await.unwrap();
        if frame[0] == 0x09 {
            assert_eq!(&frame[1..], &77u32.to_le_bytes());
            pongs += 1;
        } else {
            assert_eq!(frame[0], 0x01);
            updates += 1;
        }
    }
    assert_eq!((updates, pongs), (50, 1));
}

/// A session that stops reading is dropped once its queue overflows; the
/// others keep receiving every update.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_queue_drops_only_the_stalled_session() {
    const FRAME_LEN: usize = 32 * 1024;
    let mut reg = registry();
    reg.register(
        PropertyDef::new(
            9,
            "frame",
            PropertyType::List {
                element: ScalarType::UInt8,
                bounds: ListConstraints::new(None, Some(FRAME_LEN as u32)),
            },
        ),
        Value::List(Vec::new()),
    )
    .unwrap();
    let config = ServerConfig {
        max_send_queue: 64,
        ..Default::default()
    };
    let (handle, engine) = serve_registry(reg, config).await;

    let mut stalled = connect(&handle).await;
    let mut reader = connect(&handle).await;
    establish(&mut stalled).await;
    establish(&mut reader).await;
    assert_eq!(engine.session_count().await.unwrap(), 2);

    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let _reader = tokio::spawn(async move {
        while let Some(frame) = recv(&mut reader).await {
            if frame[1] == 9 {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    // `stalled` is never polled, so its socket buffers and then its queue fill up
    let big = Value::List(vec![Scalar::UInt8(7); FRAME_LEN]);
    let mut sent = 0;
    let mut stalled_dropped = false;
    while sent < 4000 {
        let outcome = engine.set(9, big.clone()).await.unwrap();
        sent += 1;
        if outcome.recipients == 1 {
            stalled_dropped = true;
            break;
        }
    }
    assert!(stalled_dropped, "stalled session never overflowed");
    assert_eq!(engine.session_count().await.unwrap(), 1);

    let outcome = engine.set(9, Value::List(vec![Scalar::UInt8(1)])).await.unwrap();
    assert_eq!(outcome.recipients, 1);
    sent += 1;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while received.load(Ordering::SeqCst) < sent && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(received.load(Ordering::SeqCst), sent);
    drop(stalled);
}

#[tokio::test]
async fn subscribers_see_updates_from_the_wire() {
    let (handle, engine) = serve(ServerConfig::default()).await;
    let mut changes = engine.subscribe();
    let mut ws = connect(&handle).await;
    establish(&mut ws).await;

    send(
        &mut ws,
        update(3, PropertyType::Scalar(ScalarType::UInt8), Value::UInt8(200)),
    )
    .await;
    let change = tokio::time::timeout(RECV_TIMEOUT, changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.id, 3);
    assert_eq!(change.value, Value::UInt8(200));
    assert!(matches!(change.origin, Origin::Session(_)));
}
