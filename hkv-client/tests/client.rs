mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hkv_client::{ClientConfig, ClientError, ClientTtl, KVClient};
use hkv_common::ServerErrorKind;

use common::*;

fn client_with_addr(addr: String) -> KVClient {
    let config = ClientConfig {
        addr,
        connect_timeout: Some(Duration::from_secs(1)),
        write_timeout: Some(Duration::from_secs(1)),
        ..ClientConfig::default()
    };
    KVClient::with_config(config).expect("client")
}

#[test]
fn client_set_get_roundtrip() {
    let addr = spawn_server(2, |idx, args, stream| {
        if idx == 0 {
            assert_eq!(args[0], b"SET");
            assert_eq!(args[1], b"key");
            assert_eq!(args[2], b"value");
            write_simple(stream, "OK");
        } else {
            assert_eq!(args[0], b"GET");
            assert_eq!(args[1], b"key");
            write_bulk(stream, b"value");
        }
    });

    let client = client_with_addr(addr);
    client.set(b"key", b"value").expect("set");
    let value = client.get(b"key").expect("get");
    assert_eq!(value.as_deref(), Some(&b"value"[..]));
}

#[test]
fn client_ttl_and_delete() {
    let addr = spawn_server(2, |idx, args, stream| {
        if idx == 0 {
            assert_eq!(args[0], b"TTL");
            assert_eq!(args[1], b"key");
            write_integer(stream, 5);
        } else {
            assert_eq!(args[0], b"DEL");
            assert_eq!(args[1], b"key");
            write_integer(stream, 1);
        }
    });

    let client = client_with_addr(addr);
    let ttl = client.ttl(b"key").expect("ttl");
    assert_eq!(ttl, ClientTtl::ExpiresIn(Duration::from_secs(5)));
    let removed = client.delete(b"key").expect("delete");
    assert!(removed);
}

#[test]
fn client_set_with_ttl_and_missing_key() {
    let addr = spawn_server(3, |idx, args, stream| match idx {
        0 => {
            assert_eq!(args, vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec(), b"EX".to_vec(), b"90".to_vec()]);
            write_simple(stream, "OK");
        }
        1 => write_raw(stream, b"$-1\r\n"),
        _ => {
            assert_eq!(args, vec![b"EXPIRE".to_vec(), b"k".to_vec(), b"30".to_vec()]);
            write_integer(stream, 0);
        }
    });

    let client = client_with_addr(addr);
    client
        .set_with_ttl(b"k", b"v", Duration::from_secs(90))
        .expect("set with ttl");
    assert_eq!(client.get(b"k").expect("get"), None);
    assert!(!client.expire(b"k", Duration::from_secs(30)).expect("expire"));
}

#[test]
fn server_errors_are_classified() {
    let addr = spawn_server(1, |_, _, stream| {
        write_error(stream, "WRONGTYPE Operation against a key holding the wrong kind of value");
    });

    let client = client_with_addr(addr);
    match client.get(b"list") {
        Err(ClientError::Server { kind, message }) => {
            assert_eq!(kind, ServerErrorKind::WrongType);
            assert!(message.starts_with(b"WRONGTYPE"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn reply_delivered_one_byte_at_a_time() {
    let addr = spawn_server(2, |idx, _, stream| {
        if idx == 0 {
            write_byte_by_byte(stream, b"$10\r\nhello\r\nwor\r\n");
        } else {
            write_byte_by_byte(stream, b"+PONG\r\n");
        }
    });

    let client = client_with_addr(addr);
    let value = client.get(b"key").expect("get");
    assert_eq!(value.as_deref(), Some(&b"hello\r\nwor"[..]));
    assert_eq!(&client.ping(None).expect("ping")[..], b"PONG");
}

#[test]
fn threads_share_one_connection() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 50;
    let addr = spawn_server(THREADS * PER_THREAD, echo_handler);
    let client = Arc::new(client_with_addr(addr));

    let workers: Vec<_> = (0..THREADS)
        .map(|worker| {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                for seq in 0..PER_THREAD {
                    let payload = format!("worker-{worker}-{seq}");
                    let echoed = client.ping(Some(payload.as_bytes())).expect("ping");
                    assert_eq!(&echoed[..], payload.as_bytes());
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker");
    }

    let stats = client.stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.completions.completed_sync, (THREADS * PER_THREAD) as u64);
    assert_eq!(stats.completions.failed_async, 0);
}

#[test]
fn closed_connection_fails_pending_and_later_calls() {
    // Reads one command, never answers, then hangs up.
    let addr = spawn_server(1, |_, _, _| {});

    let client = client_with_addr(addr);
    assert!(matches!(client.get(b"key"), Err(ClientError::ConnectionClosed)));
    assert!(matches!(client.ping(None), Err(ClientError::ConnectionClosed)));
    assert!(client.stats().closed);
}

#[test]
fn connect_refused_is_io_error() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").to_string()
    };
    match KVClient::connect(addr) {
        Err(ClientError::Io(_)) => {}
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("connected to a closed port"),
    }
}
