//! Whole-stack tests: two engines joined by in-memory sinks, with a
//! manual clock driving the pacer and the recovery timer.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use simple_logger::SimpleLogger;

use crate::time::ManualTime;
use crate::transport::QueueSink;
use crate::{Homa, HomaConfig, HomaError, HomaSocket, RecvFlags};

mod corners;

/// MTU that leaves exactly 1000 payload bytes per packet.
pub(self) const TEST_MTU: usize =
    1000 + crate::config::IPV4_HEADER_LENGTH + crate::pkthdr::DATA_HDR_LEN + crate::pkthdr::SEG_HDR_LEN;

pub(self) const ADDR_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub(self) const ADDR_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

/// Two engines and the wire between them.
pub(self) struct TestNet {
    pub a: Arc<Homa>,
    pub b: Arc<Homa>,
    pub sink_a: Arc<QueueSink>,
    pub sink_b: Arc<QueueSink>,
    pub time: Arc<ManualTime>,
}

impl TestNet {
    /// Build two engines with the given tunables. `gso_packets` is the
    /// number of MTU-sized packets per offload buffer.
    pub fn with_config(mut config: HomaConfig, gso_packets: usize) -> Self {
        // Only the first test to get here installs the logger; raise
        // the level when chasing a failure.
        let _ = SimpleLogger::new()
            .with_level(log::LevelFilter::Warn)
            .init();
        // Functional tests should not trip the NIC-queue limit; the
        // pacer tests lower this themselves.
        if config.max_nic_queue_ns == HomaConfig::default().max_nic_queue_ns {
            config.max_nic_queue_ns = 1_000_000_000;
        }
        let time = Arc::new(ManualTime::new());
        let sink_a = Arc::new(QueueSink::new(TEST_MTU, gso_packets * TEST_MTU));
        let sink_b = Arc::new(QueueSink::new(TEST_MTU, gso_packets * TEST_MTU));
        let a = Homa::new(config.clone(), sink_a.clone(), time.clone());
        let b = Homa::new(config, sink_b.clone(), time.clone());
        Self {
            a,
            b,
            sink_a,
            sink_b,
            time,
        }
    }

    pub fn new() -> Self {
        Self::with_config(HomaConfig::default(), 10)
    }

    /// Deliver queued frames until the network goes quiet. Returns the
    /// frames moved, in delivery order, tagged with their source.
    pub fn pump(&self) -> Vec<(Ipv4Addr, Vec<u8>)> {
        let mut moved = Vec::new();
        loop {
            let mut progressed = false;
            for (frames, src) in [(self.sink_a.drain(), ADDR_A), (self.sink_b.drain(), ADDR_B)] {
                for (dst, frame) in frames {
                    progressed = true;
                    self.engine_at(dst).pkt_recv(src, &frame);
                    moved.push((src, frame));
                }
            }
            if !progressed {
                break;
            }
        }
        moved
    }

    /// Drain both sinks once, delivering only the frames `keep`
    /// accepts. Returns the dropped frames.
    pub fn pump_filtered(
        &self,
        mut keep: impl FnMut(Ipv4Addr, &[u8]) -> bool,
    ) -> Vec<(Ipv4Addr, Vec<u8>)> {
        let mut dropped = Vec::new();
        for (frames, src) in [(self.sink_a.drain(), ADDR_A), (self.sink_b.drain(), ADDR_B)] {
            for (dst, frame) in frames {
                if keep(src, &frame) {
                    self.engine_at(dst).pkt_recv(src, &frame);
                } else {
                    dropped.push((src, frame));
                }
            }
        }
        dropped
    }

    fn engine_at(&self, addr: Ipv4Addr) -> &Arc<Homa> {
        if addr == ADDR_A {
            &self.a
        } else {
            &self.b
        }
    }

    /// Open a client socket on A and a server socket on B bound to
    /// `port`.
    pub fn client_server(&self, port: u16) -> (HomaSocket, HomaSocket) {
        let client = self.a.socket().unwrap();
        let server = self.b.socket().unwrap();
        server.bind(port).unwrap();
        (client, server)
    }
}

/// Destination for requests to B's server port.
pub(self) fn server_addr(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(ADDR_B, port)
}

/// Payload with a recognizable pattern.
pub(self) fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 13 + 7) as u8).collect()
}
