//! Loopback stream scenarios: accept, connect, echo, end of stream, and the
//! synchronous operation forms.

use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use riptide::{Error, IoContext, SocketListener, SocketOption, SocketOptionName, StreamSocket};

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[test]
fn async_echo_round_trip() {
    let ctx = IoContext::new().unwrap();

    let listener = SocketListener::new(&ctx);
    listener.open(riptide::Protocol::tcp_v4()).unwrap();
    listener.set_option(SocketOption::ReuseAddress(true)).unwrap();
    listener.bind(loopback()).unwrap();
    listener.listen(0).unwrap();
    let server_addr = listener.local_endpoint().unwrap();

    let progress = Arc::new(AtomicUsize::new(0));
    let server_slot: Arc<Mutex<Option<StreamSocket>>> = Arc::new(Mutex::new(None));

    // Server side: accept, echo three bytes back, then observe end of stream.
    {
        let progress = progress.clone();
        let server_slot = server_slot.clone();
        listener.async_accept(move |result| {
            let (server, _peer) = result.unwrap();
            *server_slot.lock().unwrap() = Some(server);
            let keeper = server_slot.clone();
            let inner = server_slot.lock().unwrap();
            let server = inner.as_ref().unwrap();
            let progress_recv = progress.clone();
            server.async_receive(vec![0u8; 512], 0, move |result, buf| {
                let n = result.unwrap();
                assert_eq!(n, 3);
                assert_eq!(&buf[..3], &[0x41, 0x42, 0x43]);
                progress_recv.fetch_add(1, Ordering::SeqCst);

                let guard = keeper.lock().unwrap();
                let server = guard.as_ref().unwrap();
                let keeper_send = keeper.clone();
                let progress_send = progress_recv.clone();
                server.async_send(buf[..3].to_vec(), 0, move |result, _buf| {
                    assert_eq!(result.unwrap(), 3);
                    progress_send.fetch_add(1, Ordering::SeqCst);

                    let guard = keeper_send.lock().unwrap();
                    let server = guard.as_ref().unwrap();
                    let progress_eof = progress_send.clone();
                    server.async_receive(vec![0u8; 16], 0, move |result, _buf| {
                        assert!(
                            matches!(result, Err(Error::Eof)),
                            "a clean peer close reads as end of stream"
                        );
                        progress_eof.fetch_add(1, Ordering::SeqCst);
                    });
                });
            });
        });
    }

    // Client side: connect, send, read the echo, close.
    let client = Arc::new(StreamSocket::new(&ctx));
    {
        let progress = progress.clone();
        let client_conn = client.clone();
        client.async_connect(server_addr, move |result| {
            result.unwrap();
            let client_send = client_conn.clone();
            let progress = progress.clone();
            client_conn.async_send(vec![0x41, 0x42, 0x43], 0, move |result, _buf| {
                assert_eq!(result.unwrap(), 3);
                let client_recv = client_send.clone();
                let progress = progress.clone();
                client_send.async_receive(vec![0u8; 64], 0, move |result, buf| {
                    let n = result.unwrap();
                    assert!(n >= 3);
                    assert_eq!(&buf[..3], &[0x41, 0x42, 0x43]);
                    progress.fetch_add(1, Ordering::SeqCst);
                    client_recv.close().unwrap();
                });
            });
        });
    }

    ctx.run();
    assert_eq!(
        progress.load(Ordering::SeqCst),
        4,
        "receive, echo, client readback and server end-of-stream all happened"
    );
}

#[test]
fn sync_forms_exchange_bytes() {
    let ctx = IoContext::new().unwrap();

    let listener = SocketListener::new(&ctx);
    listener.open(riptide::Protocol::tcp_v4()).unwrap();
    listener.bind(loopback()).unwrap();
    listener.listen(4).unwrap();
    let server_addr = listener.local_endpoint().unwrap();

    let server = thread::spawn(move || {
        let (peer, _) = listener.accept().unwrap();
        let mut buf = [0u8; 32];
        let n = peer.receive(&mut buf, 0).unwrap();
        peer.send(&buf[..n], 0).unwrap();
        // The peer reads the echo, then closes; expect end of stream.
        let eof = peer.receive(&mut buf, 0);
        assert!(matches!(eof, Err(Error::Eof)));
    });

    let client = StreamSocket::new(&ctx);
    client.connect(server_addr).unwrap();
    assert_eq!(client.send(b"ping", 0).unwrap(), 4);

    let mut buf = [0u8; 32];
    let mut read = 0;
    while read < 4 {
        read += client.receive(&mut buf[read..], 0).unwrap();
    }
    assert_eq!(&buf[..4], b"ping");

    client.shutdown(Shutdown::Write).unwrap();
    server.join().unwrap();
}

#[test]
fn endpoints_and_options_pass_through() {
    let ctx = IoContext::new().unwrap();

    let listener = SocketListener::new(&ctx);
    listener.open(riptide::Protocol::tcp_v4()).unwrap();
    listener.set_option(SocketOption::ReuseAddress(true)).unwrap();
    assert_eq!(
        listener.get_option(SocketOptionName::ReuseAddress).unwrap(),
        SocketOption::ReuseAddress(true)
    );
    listener.bind(loopback()).unwrap();
    listener.listen(0).unwrap();
    let server_addr = listener.local_endpoint().unwrap();
    assert_ne!(server_addr.port(), 0);

    let client = StreamSocket::new(&ctx);
    client.connect(server_addr).unwrap();
    client.set_option(SocketOption::TcpNoDelay(true)).unwrap();
    assert_eq!(
        client.get_option(SocketOptionName::TcpNoDelay).unwrap(),
        SocketOption::TcpNoDelay(true)
    );
    assert_eq!(client.remote_endpoint().unwrap(), server_addr);
    assert!(client.native_handle().unwrap() >= 0);

    let (server, peer_addr) = listener.accept().unwrap();
    assert_eq!(peer_addr, client.local_endpoint().unwrap());
    assert_eq!(server.local_endpoint().unwrap(), server_addr);
}

#[test]
fn connect_on_a_connected_socket_reports_already_connected() {
    let ctx = IoContext::new().unwrap();

    let listener = SocketListener::new(&ctx);
    listener.open(riptide::Protocol::tcp_v4()).unwrap();
    listener.bind(loopback()).unwrap();
    listener.listen(0).unwrap();
    let server_addr = listener.local_endpoint().unwrap();

    let client = StreamSocket::new(&ctx);
    client.connect(server_addr).unwrap();
    assert!(matches!(
        client.connect(server_addr),
        Err(Error::AlreadyConnected)
    ));
}

#[test]
fn double_open_is_rejected() {
    let ctx = IoContext::new().unwrap();
    let socket = StreamSocket::new(&ctx);
    socket.open(riptide::Protocol::tcp_v4()).unwrap();
    assert!(matches!(
        socket.open(riptide::Protocol::tcp_v4()),
        Err(Error::AlreadyOpen)
    ));
}
