//! Boundary cases and teardown behavior.

use super::*;
use crate::pkthdr::HOMA_MAX_HEADER;
use crate::{HOMA_MAX_MESSAGE_LENGTH, HOMA_MIN_CLIENT_PORT};

#[test]
fn message_length_limits() {
    let net = TestNet::new();
    let (client, server) = net.client_server(80);

    assert!(matches!(
        client.send_request(server_addr(80), b""),
        Err(HomaError::InvalidMessageLength(0))
    ));
    assert!(matches!(
        client.send_request(server_addr(80), &vec![0; HOMA_MAX_MESSAGE_LENGTH + 1]),
        Err(HomaError::InvalidMessageLength(_))
    ));

    // The maximum itself goes through.
    let req = pattern(HOMA_MAX_MESSAGE_LENGTH);
    let id = client.send_request(server_addr(80), &req).unwrap();
    net.pump();
    let msg = server
        .recv(RecvFlags::REQUEST | RecvFlags::NONBLOCKING, None)
        .unwrap();
    assert_eq!(msg.data, req);
    server.reply(msg.peer, msg.id, b"ok").unwrap();
    net.pump();
    client.recv(RecvFlags::empty(), Some(id)).unwrap();
}

#[test]
fn garbage_frames_are_counted_and_dropped() {
    let net = TestNet::new();
    let (_client, _server) = net.client_server(80);

    // Runt.
    net.b.pkt_recv(ADDR_A, &[0u8; 10]);
    assert_eq!(net.b.metrics().short_packets.get(), 1);

    // Unknown type byte.
    let mut frame = vec![0u8; HOMA_MAX_HEADER];
    frame[13] = 99;
    net.b.pkt_recv(ADDR_A, &frame);
    assert_eq!(net.b.metrics().unknown_packet_types.get(), 1);

    // Well-formed DATA for an RPC nobody knows (not an offset-0 start).
    let mut msgout = crate::msgout::MessageOut::new(
        &pattern(2000),
        &crate::msgout::FillParams {
            mtu: TEST_MTU,
            gso_max: TEST_MTU,
            rtt_bytes: 10000,
            sport: HOMA_MIN_CLIENT_PORT,
            dport: 80,
            id: 12345,
            cutoff_version: 0,
        },
    );
    msgout.grant_to(2000, 0);
    let _ = msgout.frame_for_xmit(0, 0);
    msgout.mark_sent();
    let second = msgout.frame_for_xmit(0, 0).to_vec();
    net.b.pkt_recv(ADDR_A, &second);
    assert_eq!(net.b.metrics().unknown_rpcs.get(), 1);
}

#[test]
fn nonblocking_recv_on_idle_socket() {
    let net = TestNet::new();
    let (_client, server) = net.client_server(80);
    assert!(matches!(
        server.recv(RecvFlags::REQUEST | RecvFlags::NONBLOCKING, None),
        Err(HomaError::WouldBlock)
    ));
    // Flags that can never match anything are rejected.
    assert!(matches!(
        server.recv(RecvFlags::NONBLOCKING, None),
        Err(HomaError::InvalidArgument(_))
    ));
}

#[test]
fn shutdown_wakes_blocked_receiver() {
    let net = TestNet::new();
    let (_client, server) = net.client_server(80);

    let server = std::sync::Arc::new(server);
    let waiter = server.clone();
    let handle = std::thread::spawn(move || waiter.recv(RecvFlags::REQUEST, None));
    std::thread::sleep(std::time::Duration::from_millis(20));
    server.shutdown();
    assert!(matches!(handle.join().unwrap(), Err(HomaError::Shutdown)));

    // The socket is unusable afterwards.
    assert!(matches!(
        server.recv(RecvFlags::REQUEST | RecvFlags::NONBLOCKING, None),
        Err(HomaError::Shutdown)
    ));
}

#[test]
fn shutdown_then_drain_leaves_no_buffers() {
    let net = TestNet::new();
    let (client, server) = net.client_server(80);

    // Run a few RPCs, then kill the client socket mid-flight on one.
    for _ in 0..3 {
        let id = client.send_request(server_addr(80), &pattern(5000)).unwrap();
        net.pump();
        let msg = server
            .recv(RecvFlags::REQUEST | RecvFlags::NONBLOCKING, None)
            .unwrap();
        server.reply(msg.peer, msg.id, &pattern(2000)).unwrap();
        net.pump();
        client.recv(RecvFlags::empty(), Some(id)).unwrap();
    }
    client.send_request(server_addr(80), &pattern(50_000)).unwrap();

    client.shutdown();
    server.shutdown();
    assert_eq!(client.sock.dead_buf_count(), 0);
    assert_eq!(server.sock.dead_buf_count(), 0);
    assert!(net.a.throttled.lock().unwrap().is_empty());
    assert_eq!(net.a.num_grantable(), 0);
    assert_eq!(net.b.num_grantable(), 0);
}

#[test]
fn send_after_shutdown_fails() {
    let net = TestNet::new();
    let (client, _server) = net.client_server(80);
    client.shutdown();
    assert!(matches!(
        client.send_request(server_addr(80), b"late"),
        Err(HomaError::Shutdown)
    ));
}

#[test]
fn bind_range_is_enforced() {
    let net = TestNet::new();
    let sock = net.a.socket().unwrap();
    assert!(sock.bind(0).is_err());
    assert!(sock.bind(HOMA_MIN_CLIENT_PORT).is_err());
    sock.bind(1).unwrap();
    assert_eq!(sock.server_port(), 1);
}

#[test]
fn cutoffs_are_negotiated() {
    let net = TestNet::new();
    let (client, server) = net.client_server(80);

    // A fresh sender has never heard the receiver's cutoffs (version
    // 0), so the first request provokes a CUTOFFS reply.
    let id = client.send_request(server_addr(80), &pattern(100)).unwrap();
    net.pump();
    let sent = net.b.metrics().packets_sent[crate::pkthdr::PktType::Cutoffs.index()].get();
    assert!(sent >= 1);
    let peer = net
        .a
        .peers
        .find(ADDR_B, net.a.sink.as_ref(), net.a.metrics())
        .unwrap();
    assert_eq!(
        peer.cutoff_version
            .load(std::sync::atomic::Ordering::Acquire),
        net.b.cutoffs.read().unwrap().version
    );
    let msg = server
        .recv(RecvFlags::REQUEST | RecvFlags::NONBLOCKING, None)
        .unwrap();
    server.reply(msg.peer, msg.id, b"ok").unwrap();
    net.pump();
    client.recv(RecvFlags::empty(), Some(id)).unwrap();

    // Change the advertisement: everything up to 200 bytes now rides
    // the top priority level.
    let mut cutoffs = [0u32; crate::HOMA_MAX_PRIORITIES];
    cutoffs[0] = u32::MAX;
    cutoffs[7] = 200;
    net.b.set_cutoffs(cutoffs);
    // CUTOFFS updates are rate-limited per tick; move the clock so the
    // next stale packet gets an answer.
    net.b.tick();

    // The next DATA carries the stale version, the receiver answers
    // with fresh cutoffs, and the one after goes out at priority 7.
    let id = client.send_request(server_addr(80), &pattern(100)).unwrap();
    net.pump();
    let msg = server
        .recv(RecvFlags::REQUEST | RecvFlags::NONBLOCKING, None)
        .unwrap();
    server.reply(msg.peer, msg.id, b"ok").unwrap();
    net.pump();
    client.recv(RecvFlags::empty(), Some(id)).unwrap();

    let id = client.send_request(server_addr(80), &pattern(100)).unwrap();
    let moved = net.pump();
    let data_prio = moved
        .iter()
        .find_map(|(src, f)| match crate::pkthdr::Packet::parse(f) {
            Ok(crate::pkthdr::Packet::Data { hdr, .. }) if *src == ADDR_A => {
                Some(hdr.common.priority)
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(data_prio, 7);
    let msg = server
        .recv(RecvFlags::REQUEST | RecvFlags::NONBLOCKING, None)
        .unwrap();
    server.reply(msg.peer, msg.id, b"ok").unwrap();
    net.pump();
    client.recv(RecvFlags::empty(), Some(id)).unwrap();
}

#[test]
fn abort_peer_fails_outstanding_rpcs() {
    let net = TestNet::new();
    let (client, _server) = net.client_server(80);

    // Request to a port nobody serves: it stays Outgoing forever.
    let id = client
        .send_request(SocketAddrV4::new(ADDR_B, 99), b"doomed")
        .unwrap();
    net.a.abort_peer(ADDR_B, HomaError::Unreachable(ADDR_B));
    assert_eq!(
        client.recv(RecvFlags::empty(), Some(id)).unwrap_err(),
        HomaError::Unreachable(ADDR_B)
    );
}

#[test]
fn unroutable_peer_fails_send() {
    use crate::{PacketSink, SinkError};
    use std::net::Ipv4Addr;

    struct DeadEnd;
    impl PacketSink for DeadEnd {
        fn mtu(&self) -> usize {
            1500
        }
        fn gso_max_size(&self) -> usize {
            1500
        }
        fn route(&self, _dst: Ipv4Addr) -> Result<(), SinkError> {
            Err(SinkError)
        }
        fn xmit(&self, _dst: Ipv4Addr, _frame: &[u8]) -> Result<(), SinkError> {
            Ok(())
        }
    }

    let homa = crate::Homa::new(
        HomaConfig::default(),
        std::sync::Arc::new(DeadEnd),
        std::sync::Arc::new(crate::ManualTime::new()),
    );
    let sock = homa.socket().unwrap();
    assert_eq!(
        sock.send_request(SocketAddrV4::new(ADDR_B, 80), b"hi")
            .unwrap_err(),
        HomaError::Unreachable(ADDR_B)
    );
}

#[test]
fn freeze_is_counted_and_ignored() {
    let net = TestNet::new();
    let (_client, _server) = net.client_server(80);
    let frame = crate::pkthdr::Control::Freeze.encode(0x8000, 80, 1, 0);
    net.b.pkt_recv(ADDR_A, &frame);
    assert_eq!(
        net.b.metrics().packets_received[crate::pkthdr::PktType::Freeze.index()].get(),
        1
    );
}

#[test]
fn reply_requires_in_service() {
    let net = TestNet::new();
    let (client, server) = net.client_server(80);

    // Unknown id.
    assert!(matches!(
        server.reply(SocketAddrV4::new(ADDR_A, client.client_port()), 9, b"x"),
        Err(HomaError::UnknownRpc(9))
    ));

    // An RPC that is Ready but not yet claimed cannot be replied to.
    let id = client.send_request(server_addr(80), b"hi").unwrap();
    net.pump();
    assert!(matches!(
        server.reply(SocketAddrV4::new(ADDR_A, client.client_port()), id, b"x"),
        Err(HomaError::InvalidArgument(_))
    ));
}
