mod common;

use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use bytes::Bytes;
use hkv_client::{ClientConfig, ClientError, FrameError, Multiplexer, RespValue, SchedulerKind};

use common::*;

async fn connect(addr: String, completion_scheduler: SchedulerKind) -> Multiplexer {
    let config = ClientConfig {
        addr,
        connect_timeout: Some(Duration::from_secs(1)),
        completion_scheduler,
        ..ClientConfig::default()
    };
    Multiplexer::connect(config).await.expect("connect")
}

async fn wait_until_closed(mux: &Multiplexer) {
    let start = Instant::now();
    while !mux.is_closed() {
        assert!(start.elapsed() < Duration::from_secs(5), "connection never closed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tasks_pipeline_over_one_connection() {
    const TASKS: usize = 16;
    const PER_TASK: usize = 25;
    let addr = spawn_server(TASKS * PER_TASK, echo_handler);
    let mux = Arc::new(connect(addr, SchedulerKind::Connection).await);

    let tasks: Vec<_> = (0..TASKS)
        .map(|task| {
            let mux = Arc::clone(&mux);
            tokio::spawn(async move {
                for seq in 0..PER_TASK {
                    let payload = format!("task-{task}-{seq}");
                    let reply = mux.execute(&[b"PING", payload.as_bytes()]).await.unwrap();
                    assert_eq!(reply, RespValue::Bulk(Some(Bytes::from(payload))));
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let stats = mux.stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.completions.completed_sync, (TASKS * PER_TASK) as u64);
    assert_eq!(stats.completions.completed_async, 0);
    assert!(stats.write_generation >= (TASKS * PER_TASK) as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn callbacks_complete_off_the_reader() {
    const CALLS: usize = 20;
    let addr = spawn_server(CALLS, echo_handler);
    let mux = Arc::new(connect(addr, SchedulerKind::Shared).await);

    let (tx, rx) = mpsc::channel();
    let sender = Arc::clone(&mux);
    tokio::task::spawn_blocking(move || {
        for seq in 0..CALLS {
            let tx = tx.clone();
            let payload = seq.to_string();
            sender.send_with_callback(&[b"PING", payload.as_bytes()], move |result| {
                let thread = std::thread::current().name().map(str::to_owned);
                let _ = tx.send((seq, result, thread));
            });
        }
    })
    .await
    .unwrap();

    let mut seen = Vec::new();
    for _ in 0..CALLS {
        let (seq, result, thread) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            result.unwrap(),
            RespValue::Bulk(Some(Bytes::from(seq.to_string())))
        );
        assert_eq!(thread.as_deref(), Some("hkv-completion"));
        seen.push(seq);
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..CALLS).collect::<Vec<_>>());

    let stats = mux.stats().completions;
    assert_eq!(stats.completed_async, CALLS as u64);
    assert_eq!(stats.completed_sync, 0);
    assert_eq!(stats.failed_async, 0);
}

#[tokio::test]
async fn panicking_callback_is_contained() {
    // The server stays connected until it has answered a third command.
    let addr = spawn_server(3, echo_handler);
    let mux = connect(addr, SchedulerKind::Connection).await;

    mux.send_with_callback(&[b"PING"], |_| panic!("callback exploded"));
    let reply = mux.execute(&[b"PING", b"still-alive"]).await.unwrap();
    assert_eq!(reply, RespValue::Bulk(Some(Bytes::from_static(b"still-alive"))));

    let start = Instant::now();
    while mux.stats().completions.failed_async == 0 {
        assert!(start.elapsed() < Duration::from_secs(5), "panic never recorded");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!mux.is_closed());

    let reply = mux.execute(&[b"PING", b"after-panic"]).await.unwrap();
    assert_eq!(reply, RespValue::Bulk(Some(Bytes::from_static(b"after-panic"))));
    let stats = mux.stats().completions;
    assert_eq!(stats.failed_async, 1);
    assert_eq!(stats.completed_async, 1);
}

#[tokio::test]
async fn split_replies_are_reassembled() {
    let addr = spawn_server(1, |_, _, stream| {
        write_byte_by_byte(stream, b"*3\r\n:1\r\n$3\r\nabc\r\n*0\r\n");
    });
    let mux = connect(addr, SchedulerKind::Connection).await;

    let reply = mux.execute(&[b"INFO"]).await.unwrap();
    assert_eq!(
        reply,
        RespValue::Array(vec![
            RespValue::Integer(1),
            RespValue::Bulk(Some(Bytes::from_static(b"abc"))),
            RespValue::Array(Vec::new()),
        ])
    );
}

#[tokio::test]
async fn malformed_reply_tears_down_connection() {
    let addr = spawn_server(1, |_, _, stream| write_raw(stream, b"?bogus\r\n"));
    let mux = connect(addr, SchedulerKind::Connection).await;

    match mux.execute(&[b"PING"]).await {
        Err(ClientError::Protocol(FrameError::Malformed(_))) => {}
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(mux.is_closed());
    assert!(matches!(
        mux.execute(&[b"PING"]).await,
        Err(ClientError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn unsolicited_reply_is_fatal() {
    let addr = spawn_server(1, |_, _, stream| {
        write_simple(stream, "PONG");
        write_simple(stream, "PONG");
    });
    let mux = connect(addr, SchedulerKind::Connection).await;

    let reply = mux.execute(&[b"PING"]).await.unwrap();
    assert_eq!(reply, RespValue::Simple(Bytes::from_static(b"PONG")));
    wait_until_closed(&mux).await;
}

#[tokio::test]
async fn close_fails_waiting_callers() {
    let addr = spawn_server(1, |_, _, _| std::thread::sleep(Duration::from_millis(200)));
    let mux = Arc::new(connect(addr, SchedulerKind::Connection).await);

    let waiter = {
        let mux = Arc::clone(&mux);
        tokio::spawn(async move { mux.execute(&[b"PING"]).await })
    };
    let start = Instant::now();
    while mux.stats().pending == 0 {
        assert!(start.elapsed() < Duration::from_secs(5), "request never queued");
        tokio::task::yield_now().await;
    }
    mux.close();

    assert!(matches!(waiter.await.unwrap(), Err(ClientError::ConnectionClosed)));
    assert!(mux.stats().closed);
}
