//! UDP ingest source
//!
//! Wires the block pool and the jitter buffer together for one RTP/UDP
//! stream. A dedicated OS thread drains the socket: each datagram is
//! copied out of the thread's scratch buffer into a pool block, then
//! pushed into the jitter buffer keyed by its RTP sequence number. The
//! ordered-delivery handler runs on that same thread and crosses into the
//! stream's serialized actor with `blocking_send`, the only point where
//! receive concurrency meets per-stream execution.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::jitter::{JitterBuffer, JitterConfig, JitterStats};
use crate::pool::{Block, BlockPool};

/// Minimum length of a packet that carries an RTP header
const RTP_HEADER_LEN: usize = 12;

/// How often the receive thread re-checks the shutdown flag
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors from source setup and the receive path
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to bind ingest socket: {0}")]
    Bind(std::io::Error),

    #[error("failed to spawn receive thread: {0}")]
    Spawn(std::io::Error),
}

/// One received ingest unit: the sequence number and the pool block
/// holding the raw datagram bytes.
///
/// Dropping the packet recycles its block, so downstream simply lets it
/// go out of scope when done.
#[derive(Debug)]
pub struct RtpPacket {
    seq: u16,
    block: Block,
}

impl RtpPacket {
    /// Create a packet from an already-filled pool block
    pub fn new(seq: u16, block: Block) -> Self {
        Self { seq, block }
    }

    /// RTP sequence number of this packet
    pub fn seq(&self) -> u16 {
        self.seq
    }

    /// Raw datagram bytes backing this packet
    pub fn payload(&self) -> &[u8] {
        &self.block
    }
}

/// Configuration for an RTP ingest source
#[derive(Debug, Clone)]
pub struct RtpSourceConfig {
    /// Size of each pool block; sized to the transport MTU
    pub block_size: usize,

    /// Number of pool blocks; bounds in-flight datagrams end to end
    pub block_count: usize,

    /// Reorder buffer tuning
    pub jitter: JitterConfig,
}

impl Default for RtpSourceConfig {
    fn default() -> Self {
        Self {
            block_size: 1500,
            block_count: 300,
            jitter: JitterConfig::default(),
        }
    }
}

/// UDP ingest source for one live stream
pub struct RtpUdpSource {
    jitter: Arc<JitterBuffer<RtpPacket>>,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl RtpUdpSource {
    /// Bind `addr` and start receiving.
    ///
    /// Ordered packets are forwarded into `output` (converted into
    /// whatever event type the consumer's channel carries); when the
    /// channel is full the receive thread waits, extending the block
    /// pool's backpressure to the socket.
    pub fn bind<T>(
        addr: SocketAddr,
        config: RtpSourceConfig,
        output: mpsc::Sender<T>,
    ) -> Result<Self, SourceError>
    where
        T: From<RtpPacket> + Send + 'static,
    {
        let socket = UdpSocket::bind(addr).map_err(SourceError::Bind)?;
        let local_addr = socket.local_addr().map_err(SourceError::Bind)?;
        socket
            .set_read_timeout(Some(RECV_POLL_INTERVAL))
            .map_err(SourceError::Bind)?;

        let pool = BlockPool::new(config.block_size, config.block_count);
        let jitter = Arc::new(JitterBuffer::new(config.jitter));
        jitter.set_handler(Some(Box::new(move |pkt: RtpPacket| {
            // Receiver gone means the stream actor is shutting down; the
            // packet drops here and its block recycles.
            if output.blocking_send(pkt.into()).is_err() {
                tracing::trace!("stream input channel closed, dropping ordered packet");
            }
        })));

        let running = Arc::new(AtomicBool::new(true));
        let thread = {
            let jitter = Arc::clone(&jitter);
            let running = Arc::clone(&running);
            let block_size = config.block_size;
            std::thread::Builder::new()
                .name(format!("rtp-recv-{local_addr}"))
                .spawn(move || receive_loop(socket, pool, jitter, running, block_size))
                .map_err(SourceError::Spawn)?
        };

        tracing::info!(addr = %local_addr, "RTP/UDP ingest source listening");

        Ok(Self {
            jitter,
            local_addr,
            running,
            thread: Some(thread),
        })
    }

    /// Address the source is actually bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Reorder counters for this source
    pub fn jitter_stats(&self) -> JitterStats {
        self.jitter.stats()
    }

    /// Flush tail packets, detach the delivery handler, then stop the
    /// receive thread, in that order, so nothing is delivered into a
    /// torn-down pipeline.
    ///
    /// Blocking: call from a blocking context (`spawn_blocking` from
    /// async code), since flushing may hand packets to the output channel.
    pub fn close(mut self) {
        self.teardown(true);
    }

    fn teardown(&mut self, flush: bool) {
        if flush {
            self.jitter.flush();
        }
        self.jitter.set_handler(None);
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RtpUdpSource {
    fn drop(&mut self) {
        // Close not called: stop the thread without flushing.
        self.teardown(false);
    }
}

fn receive_loop(
    socket: UdpSocket,
    pool: BlockPool,
    jitter: Arc<JitterBuffer<RtpPacket>>,
    running: Arc<AtomicBool>,
    block_size: usize,
) {
    let mut scratch = vec![0u8; block_size];

    while running.load(Ordering::Acquire) {
        let len = match socket.recv(&mut scratch) {
            Ok(len) => len,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                if running.load(Ordering::Acquire) {
                    tracing::error!(error = %e, "ingest socket receive failed");
                }
                break;
            }
        };

        let Some(seq) = parse_sequence(&scratch[..len]) else {
            tracing::trace!(len, "dropping datagram without a valid RTP header");
            continue;
        };

        // Pool checkout parks this thread when everything is in flight;
        // the socket buffer absorbs the burst in the meantime.
        let mut block = pool.get();
        block.copy_from(&scratch[..len]);
        jitter.push(seq, RtpPacket::new(seq, block));
    }
}

/// Pull the sequence number out of an RTP header, rejecting anything too
/// short or with the wrong version. No further interpretation happens
/// here.
fn parse_sequence(datagram: &[u8]) -> Option<u16> {
    if datagram.len() < RTP_HEADER_LEN || datagram[0] >> 6 != 2 {
        return None;
    }
    Some(u16::from_be_bytes([datagram[2], datagram[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp_datagram(seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut datagram = vec![0u8; RTP_HEADER_LEN];
        datagram[0] = 0x80; // version 2
        datagram[2..4].copy_from_slice(&seq.to_be_bytes());
        datagram.extend_from_slice(payload);
        datagram
    }

    #[test]
    fn parse_sequence_accepts_rtp_v2() {
        let datagram = rtp_datagram(4242, b"x");
        assert_eq!(parse_sequence(&datagram), Some(4242));
    }

    #[test]
    fn parse_sequence_rejects_garbage() {
        assert_eq!(parse_sequence(&[0u8; 4]), None);
        // Wrong version bits
        let mut datagram = rtp_datagram(7, b"");
        datagram[0] = 0x40;
        assert_eq!(parse_sequence(&datagram), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn out_of_order_datagrams_arrive_ordered() {
        let (tx, mut rx) = mpsc::channel::<RtpPacket>(64);
        let source = RtpUdpSource::bind(
            "127.0.0.1:0".parse().unwrap(),
            RtpSourceConfig::default(),
            tx,
        )
        .unwrap();
        let target = source.local_addr();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        // First packet establishes position at 100; 102 is withheld until
        // 101 closes the gap.
        for seq in [100u16, 102, 101] {
            sender
                .send_to(&rtp_datagram(seq, &seq.to_be_bytes()), target)
                .unwrap();
        }

        let mut seqs = Vec::new();
        for _ in 0..3 {
            let pkt = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for ordered packet")
                .expect("channel closed");
            seqs.push(pkt.seq());
        }
        assert_eq!(seqs, vec![100, 101, 102]);

        tokio::task::spawn_blocking(move || source.close())
            .await
            .unwrap();
    }
}
