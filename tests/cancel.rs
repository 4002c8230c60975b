//! Cancellation: close aborts outstanding operations exactly once, and a
//! closed socket rejects new work.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use riptide::{DatagramSocket, Error, IoContext, Protocol, SocketListener, StreamSocket};

#[test]
fn close_aborts_a_pending_receive() {
    let ctx = IoContext::new().unwrap();

    let socket = DatagramSocket::new(&ctx);
    socket.open(Protocol::udp_v4()).unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();

    let outcomes = Arc::new(Mutex::new(Vec::new()));

    let slot = outcomes.clone();
    socket.async_receive(vec![0u8; 1], 0, move |result, buf| {
        assert!(matches!(result, Err(Error::Aborted)));
        assert_eq!(buf.len(), 1, "the buffer comes back untouched");
        slot.lock().unwrap().push("aborted");
    });

    socket.close().unwrap();
    assert_eq!(ctx.run(), 1, "the aborted handler still runs exactly once");

    // New work on the closed socket is rejected through the handler.
    ctx.restart();
    let slot = outcomes.clone();
    socket.async_receive(vec![0u8; 1], 0, move |result, _buf| {
        assert!(matches!(result, Err(Error::BadDescriptor)));
        slot.lock().unwrap().push("bad-descriptor");
    });
    assert_eq!(ctx.run(), 1);

    assert_eq!(*outcomes.lock().unwrap(), vec!["aborted", "bad-descriptor"]);
}

#[test]
fn close_aborts_every_queued_operation_in_order() {
    let ctx = IoContext::new().unwrap();

    let socket = DatagramSocket::new(&ctx);
    socket.open(Protocol::udp_v4()).unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..3 {
        let order = order.clone();
        socket.async_receive(vec![0u8; 4], 0, move |result, _buf| {
            assert!(matches!(result, Err(Error::Aborted)));
            order.lock().unwrap().push(i);
        });
    }

    socket.close().unwrap();
    assert_eq!(ctx.run(), 3);
    assert_eq!(
        *order.lock().unwrap(),
        vec![0, 1, 2],
        "cancellation preserves submission order"
    );
}

#[test]
fn close_is_idempotent() {
    let ctx = IoContext::new().unwrap();
    let socket = StreamSocket::new(&ctx);
    socket.open(Protocol::tcp_v4()).unwrap();
    socket.close().unwrap();
    socket.close().unwrap();
    assert!(!socket.is_open());
}

#[test]
fn pending_accept_is_aborted_by_close() {
    let ctx = IoContext::new().unwrap();

    let listener = SocketListener::new(&ctx);
    listener.open(Protocol::tcp_v4()).unwrap();
    listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.listen(0).unwrap();

    let aborted = Arc::new(AtomicUsize::new(0));
    let flag = aborted.clone();
    listener.async_accept(move |result| {
        assert!(result.err().is_some_and(|e| e.is_aborted()));
        flag.fetch_add(1, Ordering::SeqCst);
    });

    listener.close().unwrap();
    assert_eq!(ctx.run(), 1);
    assert_eq!(aborted.load(Ordering::SeqCst), 1);
}

#[test]
fn stop_leaves_pending_operations_for_the_next_run() {
    let ctx = IoContext::new().unwrap();

    let socket = DatagramSocket::new(&ctx);
    socket.open(Protocol::udp_v4()).unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let local = socket.local_endpoint().unwrap();

    let received = Arc::new(AtomicUsize::new(0));
    let flag = received.clone();
    socket.async_receive_from(vec![0u8; 16], 0, move |result, buf| {
        let (n, _peer) = result.unwrap();
        assert_eq!(&buf[..n], b"later");
        flag.fetch_add(1, Ordering::SeqCst);
    });

    ctx.stop();
    assert_eq!(ctx.run(), 0, "a stopped context runs nothing");
    assert_eq!(received.load(Ordering::SeqCst), 0);

    // The datagram arrives while the context is stopped; the operation fires
    // on the next run.
    let sender = DatagramSocket::new(&ctx);
    sender.open(Protocol::udp_v4()).unwrap();
    sender.send_to(b"later", local, 0).unwrap();

    ctx.restart();
    assert_eq!(ctx.run(), 1);
    assert_eq!(received.load(Ordering::SeqCst), 1);
}
