use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use psl_channel::{Arg, Channel, Field, Item, RpcReply, TcpBackend, TcpOptions, Value};
use psl_common::{PslError, STATUS_OK};
use psl_pool::{ConnectionPool, PoolConfig};

const OP_ECHO: i32 = 1;
const OP_FAIL: i32 = 2;
const OP_ADD: i32 = 3;
const OP_QUIT: i32 = 4;

const FAIL_STATUS: i32 = 7;
const UNKNOWN_OPCODE: i32 = 99;

const ECHO_FIELDS: [Item<'static>; 8] = [
    Item::Recv(Field::Byte),
    Item::Recv(Field::Int16),
    Item::Recv(Field::Int32),
    Item::Recv(Field::Int64),
    Item::Recv(Field::Str),
    Item::Recv(Field::Buffer { capacity: 16 }),
    Item::Recv(Field::AllocBuffer),
    Item::Recv(Field::Double),
];

fn spawn_server() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
            thread::spawn(move || serve(Channel::new(TcpBackend::from_stream(stream))));
        }
    });

    (addr, accepted)
}

fn serve(mut channel: Channel) {
    loop {
        let opcode = match channel.recv(true, &[Field::Int32.into()]) {
            Ok(Some(values)) => values[0].as_i32(),
            _ => return,
        };
        match opcode {
            Some(OP_ECHO) => {
                let Ok(Some(args)) = channel.recv(false, &ECHO_FIELDS) else {
                    return;
                };
                let mut reply: Vec<Item<'_>> = vec![Arg::Int32(STATUS_OK).into()];
                reply.extend(args.iter().map(echo_arg));
                channel.send_all(&reply).expect("send echo");
            }
            Some(OP_FAIL) => {
                channel
                    .send_all(&[Arg::Int32(FAIL_STATUS).into()])
                    .expect("send status");
            }
            Some(OP_ADD) => {
                let Ok(Some(args)) = channel.recv(true, &[Field::Int32.into(), Field::Int32.into()])
                else {
                    return;
                };
                let sum = args[0].as_i32().unwrap_or(0) + args[1].as_i32().unwrap_or(0);
                channel
                    .send_all(&[Arg::Int32(STATUS_OK).into(), Arg::Int32(sum).into()])
                    .expect("send sum");
            }
            Some(OP_QUIT) => return,
            _ => {
                channel
                    .send_all(&[Arg::Int32(UNKNOWN_OPCODE).into()])
                    .expect("send status");
            }
        }
        if channel.flush().is_err() {
            return;
        }
    }
}

fn echo_arg(value: &Value) -> Item<'_> {
    let arg = match value {
        Value::Byte(v) => Arg::Byte(*v),
        Value::Int16(v) => Arg::Int16(*v),
        Value::Int32(v) => Arg::Int32(*v),
        Value::Int64(v) => Arg::Int64(*v),
        Value::Str(s) => Arg::Str(s),
        Value::Buffer { data, .. } | Value::AllocBuffer(data) => Arg::Buffer(data),
        Value::Double(v) => Arg::Double(*v),
    };
    arg.into()
}

fn connect(addr: SocketAddr) -> Channel {
    let options = TcpOptions {
        connect_timeout: Some(Duration::from_secs(2)),
        read_timeout: Some(Duration::from_secs(5)),
        ..TcpOptions::default()
    };
    Channel::new(TcpBackend::connect(addr, &options).expect("connect"))
}

struct Sample<'a> {
    byte: u8,
    short: i16,
    int: i32,
    long: i64,
    text: &'a str,
    buffer: &'a [u8],
    blob: &'a [u8],
    real: f64,
}

fn echo(channel: &mut Channel, sample: &Sample<'_>) -> RpcReply {
    let mut schema: Vec<Item<'_>> = vec![
        Arg::Byte(sample.byte).into(),
        Arg::Int16(sample.short).into(),
        Arg::Int32(sample.int).into(),
        Arg::Int64(sample.long).into(),
        Arg::Str(sample.text).into(),
        Arg::Buffer(sample.buffer).into(),
        Arg::Buffer(sample.blob).into(),
        Arg::Double(sample.real).into(),
        Item::Split,
    ];
    schema.extend_from_slice(&ECHO_FIELDS);
    channel.rpc(true, OP_ECHO, &schema).expect("echo rpc")
}

fn expected(sample: &Sample<'_>) -> Vec<Value> {
    vec![
        Value::Byte(sample.byte),
        Value::Int16(sample.short),
        Value::Int32(sample.int),
        Value::Int64(sample.long),
        Value::Str(sample.text.to_string()),
        Value::Buffer {
            data: sample.buffer.to_vec(),
            len: sample.buffer.len(),
        },
        Value::AllocBuffer(sample.blob.to_vec()),
        Value::Double(sample.real),
    ]
}

#[test]
fn echo_round_trips_every_wire_type() {
    let (addr, _) = spawn_server();
    let mut client = connect(addr);

    let long_blob = vec![0x5a; 40_000];
    let samples = [
        Sample {
            byte: 0,
            short: 0,
            int: 0,
            long: 0,
            text: "",
            buffer: b"",
            blob: b"",
            real: 0.0,
        },
        Sample {
            byte: u8::MAX,
            short: i16::MIN,
            int: i32::MIN,
            long: i64::MIN,
            text: "hello",
            buffer: b"0123456789abcdef",
            blob: &long_blob,
            real: f64::MIN_POSITIVE,
        },
        Sample {
            byte: 1,
            short: i16::MAX,
            int: i32::MAX,
            long: i64::MAX,
            text: "ünïcödé path/with/segments",
            buffer: &[0, 255, 0],
            blob: b"\0\r\n",
            real: -1.0e300,
        },
    ];

    for sample in &samples {
        let reply = echo(&mut client, sample);
        assert!(reply.is_ok());
        assert_eq!(reply.values, expected(sample));
    }
}

#[test]
fn oversized_buffer_is_truncated_by_receiver() {
    let (addr, _) = spawn_server();
    let mut client = connect(addr);
    let payload: Vec<u8> = (0..20).collect();

    let reply = echo(
        &mut client,
        &Sample {
            byte: 1,
            short: 2,
            int: 3,
            long: 4,
            text: "t",
            buffer: &payload,
            blob: b"b",
            real: 5.0,
        },
    );
    // The server kept 16 of 20 bytes and echoed those.
    assert_eq!(
        reply.values[5],
        Value::Buffer {
            data: payload[..16].to_vec(),
            len: 16
        }
    );
    assert_eq!(reply.values[6], Value::AllocBuffer(b"b".to_vec()));
    assert_eq!(reply.values[7], Value::Double(5.0));
}

#[test]
fn error_status_carries_no_results_and_keeps_stream_in_sync() {
    let (addr, _) = spawn_server();
    let mut client = connect(addr);

    let reply = client
        .rpc(true, OP_FAIL, &[Item::Split, Field::Int64.into(), Field::Str.into()])
        .expect("fail rpc");
    assert_eq!(reply.status, FAIL_STATUS);
    assert!(reply.values.is_empty());

    let reply = client.rpc(true, 1234, &[Item::Split]).expect("unknown rpc");
    assert_eq!(reply.status, UNKNOWN_OPCODE);

    let reply = client
        .rpc(
            true,
            OP_ADD,
            &[
                Arg::Int32(40).into(),
                Arg::Int32(2).into(),
                Item::Split,
                Field::Int32.into(),
            ],
        )
        .expect("add rpc");
    assert_eq!(reply.status, STATUS_OK);
    assert_eq!(reply.values, vec![Value::Int32(42)]);
}

#[test]
fn peer_closing_mid_rpc_is_unexpected_eof() {
    let (addr, _) = spawn_server();
    let mut client = connect(addr);
    let err = client
        .rpc(true, OP_QUIT, &[Item::Split, Field::Int32.into()])
        .unwrap_err();
    assert!(matches!(err, PslError::UnexpectedEof));
    assert!(err.is_connection_error());
}

type Slot = Mutex<Option<Channel>>;

fn channel_pool() -> ConnectionPool<Slot> {
    ConnectionPool::new(
        PoolConfig {
            type_name: "rpc-test".to_string(),
            table_size: 4,
            capacity: 2,
        },
        |slot: Slot| match slot.into_inner() {
            Some(channel) => channel.close(),
            None => Ok(()),
        },
    )
}

fn pooled_add(pool: &ConnectionPool<Slot>, addr: SocketAddr, a: i32, b: i32) -> Result<i32, PslError> {
    let (conn, _) = pool.acquire("127.0.0.1", addr.port(), "tester")?;
    let mut slot = conn.lock();
    let channel = slot.get_or_insert_with(|| connect(addr));
    let result = channel.rpc(
        true,
        OP_ADD,
        &[
            Arg::Int32(a).into(),
            Arg::Int32(b).into(),
            Item::Split,
            Field::Int32.into(),
        ],
    );
    match result {
        Ok(reply) => Ok(reply.values[0].as_i32().unwrap_or_default()),
        Err(err) => {
            if err.is_connection_error() {
                conn.detach();
            }
            Err(err)
        }
    }
}

#[test]
fn pooled_channel_reuses_one_connection() {
    let (addr, accepted) = spawn_server();
    let pool = channel_pool();

    for i in 0..5 {
        assert_eq!(pooled_add(&pool, addr, i, 10).expect("add"), i + 10);
    }
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().cached, 1);
    assert_eq!(pool.shutdown(), 1);
}

#[test]
fn broken_pooled_channel_is_replaced() {
    let (addr, accepted) = spawn_server();
    let pool = channel_pool();
    assert_eq!(pooled_add(&pool, addr, 1, 1).expect("add"), 2);

    {
        let (conn, created) = pool.acquire("127.0.0.1", addr.port(), "tester").expect("acquire");
        assert!(!created);
        let mut slot = conn.lock();
        let channel = slot.as_mut().expect("connected channel");
        let err = channel
            .rpc(true, OP_QUIT, &[Item::Split, Field::Int32.into()])
            .unwrap_err();
        assert!(err.is_connection_error());
        drop(slot);
        conn.detach();
    }
    assert_eq!(pool.stats().handles, 0);

    assert_eq!(pooled_add(&pool, addr, 2, 3).expect("add"), 5);
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}
