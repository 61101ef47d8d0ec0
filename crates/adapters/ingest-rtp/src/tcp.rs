//! TCP ingest source
//!
//! RTP over a TCP byte stream arrives already ordered, so this source
//! skips the jitter buffer entirely: frames go straight from the framing
//! reader into the stream actor. Framing is the 2-byte big-endian length
//! prefix of RFC 4571. The block pool is still the backpressure point.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::pool::BlockPool;
use crate::source::{RtpPacket, RtpSourceConfig, SourceError};

/// TCP ingest source for one live stream
pub struct RtpTcpSource {
    running: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl RtpTcpSource {
    /// Start receiving length-prefixed RTP frames from a connected stream.
    pub fn start<T>(
        stream: TcpStream,
        config: RtpSourceConfig,
        output: mpsc::Sender<T>,
    ) -> Result<Self, SourceError>
    where
        T: From<RtpPacket> + Send + 'static,
    {
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .map_err(SourceError::Bind)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());

        let pool = BlockPool::new(config.block_size, config.block_count);
        let running = Arc::new(AtomicBool::new(true));
        let thread = {
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name(format!("rtp-tcp-{peer}"))
                .spawn(move || receive_loop(stream, pool, output, running, config.block_size))
                .map_err(SourceError::Spawn)?
        };

        tracing::info!(peer = %peer, "RTP/TCP ingest source started");

        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    /// Stop the framing thread. TCP delivery is ordered, so there is no
    /// reorder state to flush.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RtpTcpSource {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn receive_loop<T: From<RtpPacket> + Send>(
    mut stream: TcpStream,
    pool: BlockPool,
    output: mpsc::Sender<T>,
    running: Arc<AtomicBool>,
    block_size: usize,
) {
    let mut scratch = vec![0u8; block_size.max(u16::MAX as usize)];

    while running.load(Ordering::Acquire) {
        let frame_len = match read_frame_len(&mut stream, &running) {
            Some(len) => len,
            None => break,
        };
        if frame_len == 0 {
            continue;
        }
        if !read_full(&mut stream, &mut scratch[..frame_len], &running) {
            if running.load(Ordering::Acquire) {
                tracing::debug!("TCP ingest stream ended mid-frame");
            }
            break;
        }
        // Frames larger than a block are legal on TCP; anything that fits
        // the pool geometry is forwarded, the rest dropped with a warning.
        if frame_len > pool.block_size() {
            tracing::warn!(frame_len, block_size = pool.block_size(), "oversized RTP frame dropped");
            continue;
        }

        let frame = &scratch[..frame_len];
        let seq = if frame_len >= 4 {
            u16::from_be_bytes([frame[2], frame[3]])
        } else {
            0
        };

        let mut block = pool.get();
        block.copy_from(frame);
        if output
            .blocking_send(RtpPacket::new(seq, block).into())
            .is_err()
        {
            break;
        }
    }
}

/// Read the RFC 4571 length prefix, tolerating read timeouts while the
/// source is still running.
fn read_frame_len(stream: &mut TcpStream, running: &AtomicBool) -> Option<usize> {
    let mut prefix = [0u8; 2];
    if read_full(stream, &mut prefix, running) {
        Some(u16::from_be_bytes(prefix) as usize)
    } else {
        None
    }
}

/// Fill `buf` completely, retrying across read timeouts so a slow sender
/// cannot desync the framing. Returns false on EOF, error, or shutdown.
fn read_full(stream: &mut TcpStream, buf: &mut [u8], running: &AtomicBool) -> bool {
    let mut filled = 0;
    while filled < buf.len() {
        if !running.load(Ordering::Acquire) {
            return false;
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return false,
            Ok(n) => filled += n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    #[tokio::test(flavor = "multi_thread")]
    async fn frames_pass_through_in_stream_order() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let writer = std::thread::spawn(move || {
            let mut conn = TcpStream::connect(addr).unwrap();
            for seq in [7u16, 8, 9] {
                let mut frame = vec![0u8; 12];
                frame[0] = 0x80;
                frame[2..4].copy_from_slice(&seq.to_be_bytes());
                conn.write_all(&(frame.len() as u16).to_be_bytes()).unwrap();
                conn.write_all(&frame).unwrap();
            }
        });

        let (accepted, _) = listener.accept().unwrap();
        let (tx, mut rx) = mpsc::channel::<RtpPacket>(16);
        let source = RtpTcpSource::start(accepted, RtpSourceConfig::default(), tx).unwrap();

        let mut seqs = Vec::new();
        for _ in 0..3 {
            let pkt = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out")
                .expect("channel closed");
            seqs.push(pkt.seq());
        }
        assert_eq!(seqs, vec![7, 8, 9]);

        writer.join().unwrap();
        tokio::task::spawn_blocking(move || source.close())
            .await
            .unwrap();
    }
}
