//! Datagram round trips, addressed and connected.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use riptide::{DatagramSocket, IoContext, Protocol};

#[test]
fn addressed_round_trip() {
    let ctx = IoContext::new().unwrap();

    let receiver = DatagramSocket::new(&ctx);
    receiver.open(Protocol::udp_v4()).unwrap();
    receiver.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let receiver_addr = receiver.local_endpoint().unwrap();

    let sender = DatagramSocket::new(&ctx);
    sender.open(Protocol::udp_v4()).unwrap();
    sender.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let sender_addr = sender.local_endpoint().unwrap();

    let done = Arc::new(AtomicUsize::new(0));

    let flag = done.clone();
    receiver.async_receive_from(vec![0u8; 64], 0, move |result, buf| {
        let (n, peer) = result.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(peer, sender_addr);
        flag.fetch_add(1, Ordering::SeqCst);
    });

    let flag = done.clone();
    sender.async_send_to(b"hello".to_vec(), receiver_addr, 0, move |result, _buf| {
        assert_eq!(result.unwrap(), 5);
        flag.fetch_add(1, Ordering::SeqCst);
    });

    ctx.run();
    assert_eq!(done.load(Ordering::SeqCst), 2);
}

#[test]
fn connected_datagram_send_and_receive() {
    let ctx = IoContext::new().unwrap();

    let receiver = DatagramSocket::new(&ctx);
    receiver.open(Protocol::udp_v4()).unwrap();
    receiver.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let receiver_addr = receiver.local_endpoint().unwrap();

    let sender = DatagramSocket::new(&ctx);
    sender.connect(receiver_addr).unwrap();
    assert_eq!(sender.remote_endpoint().unwrap(), receiver_addr);

    let done = Arc::new(AtomicUsize::new(0));

    let flag = done.clone();
    receiver.async_receive(vec![0u8; 16], 0, move |result, buf| {
        assert_eq!(result.unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
        flag.fetch_add(1, Ordering::SeqCst);
    });

    let flag = done.clone();
    sender.async_send(b"ping".to_vec(), 0, move |result, _buf| {
        assert_eq!(result.unwrap(), 4);
        flag.fetch_add(1, Ordering::SeqCst);
    });

    ctx.run();
    assert_eq!(done.load(Ordering::SeqCst), 2);
}

#[test]
fn sync_round_trip_with_bytes_readable() {
    let ctx = IoContext::new().unwrap();

    let receiver = DatagramSocket::new(&ctx);
    receiver.open(Protocol::udp_v4()).unwrap();
    receiver.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let receiver_addr = receiver.local_endpoint().unwrap();

    let sender = DatagramSocket::new(&ctx);
    sender.open(Protocol::udp_v4()).unwrap();
    assert_eq!(sender.send_to(b"sized", receiver_addr, 0).unwrap(), 5);

    assert_eq!(
        receiver.io_control(riptide::IoControl::BytesReadable).unwrap(),
        5,
        "the queued datagram is visible before the read"
    );

    let mut buf = [0u8; 32];
    let (n, _peer) = receiver.receive_from(&mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"sized");
}
