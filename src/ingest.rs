use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::{info, warn};

use crate::error::Result;
use crate::frame::{Classifier, Frame, FrameKind};
use crate::stats::PipelineStats;

/// Poll interval of the ingest loop; bounds shutdown latency.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// One poll of the frame source.
pub enum Poll {
    /// Metadata blob and raw payload of one frame.
    Frame { meta: Vec<u8>, payload: Vec<u8> },
    /// Nothing arrived within the timeout.
    Idle,
    /// The source hung up; ingest ends.
    Closed,
}

/// Blocking source of two-part frame messages. The wire transport is
/// an external collaborator; in-process sources implement this over a
/// channel.
pub trait FrameTransport: Send {
    fn poll(&mut self, timeout: Duration) -> Poll;
}

/// Producer half of the in-process frame channel. Lives on the
/// source's thread.
pub struct FrameSender {
    tx: Sender<(Vec<u8>, Vec<u8>)>,
}

/// Consumer half, handed to the ingest thread.
pub struct ChannelTransport {
    rx: Receiver<(Vec<u8>, Vec<u8>)>,
}

/// Create a bounded in-process frame channel.
pub fn frame_channel(capacity: usize) -> (FrameSender, ChannelTransport) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (FrameSender { tx }, ChannelTransport { rx })
}

impl FrameSender {
    /// Push one two-part message. Returns false once the ingest side
    /// is gone.
    pub fn send(&self, meta: Vec<u8>, payload: Vec<u8>) -> bool {
        self.tx.send((meta, payload)).is_ok()
    }

    /// Encode and push a frame the way the detector wire does:
    /// metadata JSON then the little-endian sample blob.
    pub fn send_frame(&self, kind: FrameKind, index: u32, rows: u32, cols: u32, samples: &[u16]) -> bool {
        let meta = format!(
            r#"{{"frame": {index}, "image_attributes": {{"scan_index": {}}}, "shape": [{rows}, {cols}]}}"#,
            kind as i64
        );
        let payload = samples.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.send(meta.into_bytes(), payload)
    }
}

/// Frame source over stdin: one metadata line, then the raw payload
/// bytes the metadata's shape implies. Reads block past the poll
/// timeout, so shutdown waits for the stream to end.
pub struct StdinTransport {
    reader: std::io::BufReader<std::io::Stdin>,
}

impl StdinTransport {
    pub fn new() -> Self {
        Self {
            reader: std::io::BufReader::new(std::io::stdin()),
        }
    }
}

impl Default for StdinTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTransport for StdinTransport {
    fn poll(&mut self, _timeout: Duration) -> Poll {
        use std::io::{BufRead, Read};
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) | Err(_) => Poll::Closed,
            Ok(_) => {
                let meta = line.trim_end().as_bytes().to_vec();
                // An unparseable line flows through as a frame so the
                // ingest loop applies its protocol-error policy.
                let Ok(size) = crate::frame::payload_size(&meta) else {
                    return Poll::Frame {
                        meta,
                        payload: Vec::new(),
                    };
                };
                let mut payload = vec![0u8; size];
                if self.reader.read_exact(&mut payload).is_err() {
                    return Poll::Closed;
                }
                Poll::Frame { meta, payload }
            }
        }
    }
}

impl FrameTransport for ChannelTransport {
    fn poll(&mut self, timeout: Duration) -> Poll {
        match self.rx.recv_timeout(timeout) {
            Ok((meta, payload)) => Poll::Frame { meta, payload },
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Poll::Idle,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Poll::Closed,
        }
    }
}

/// Drain the frame source into the classifier until the source closes
/// or shutdown is requested.
///
/// A malformed first message is a startup protocol error and aborts;
/// later malformed messages are logged and dropped. Shape mismatches
/// are transient: logged, counted, the stream continues.
pub fn run_ingest(
    mut transport: impl FrameTransport,
    classifier: &Classifier,
    stats: &PipelineStats,
    shutdown: &AtomicBool,
) -> Result<()> {
    let mut first_message = true;
    let mut window_start = Instant::now();
    let mut window_frames = 0u32;

    while !shutdown.load(Ordering::Relaxed) {
        let (meta, payload) = match transport.poll(POLL_TIMEOUT) {
            Poll::Frame { meta, payload } => (meta, payload),
            Poll::Idle => continue,
            Poll::Closed => {
                info!("frame source closed");
                break;
            }
        };

        match Frame::parse(&meta, &payload) {
            Ok(frame) => {
                first_message = false;
                window_frames += 1;
                if let Err(e) = classifier.accept(frame) {
                    warn!("frame dropped: {e}");
                    stats
                        .dropped_malformed
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
            Err(e) if first_message => {
                // the stream never spoke our protocol
                return Err(e);
            }
            Err(e) => {
                warn!("message dropped: {e}");
                stats
                    .dropped_malformed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }

        let elapsed = window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            stats
                .ingest_rate
                .store(window_frames as f32 / elapsed.as_secs_f32(), Ordering::Relaxed);
            window_start = Instant::now();
            window_frames = 0;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrate::Calibration;
    use crate::ring::GroupRing;
    use std::sync::Arc;

    fn classifier(rows: u32, cols: u32) -> (Classifier, Arc<PipelineStats>) {
        let stats = PipelineStats::new();
        let pixels = (rows * cols) as usize;
        let cal = Arc::new(Calibration::new(pixels, 1, 1));
        let (ring, _rx) = GroupRing::new(rows, cols, 4, 2, stats.clone());
        (
            Classifier::new(rows, cols, cal, ring, stats.clone()),
            stats,
        )
    }

    #[test]
    fn channel_transport_round_trip() {
        let (tx, mut rx) = frame_channel(4);
        assert!(tx.send_frame(FrameKind::Dark, 0, 1, 2, &[7, 8]));
        match rx.poll(Duration::from_millis(10)) {
            Poll::Frame { meta, payload } => {
                let frame = Frame::parse(&meta, &payload).unwrap();
                assert_eq!(frame.kind, FrameKind::Dark);
                assert_eq!(frame.payload, vec![7, 8]);
            }
            _ => panic!("expected a frame"),
        }
        assert!(matches!(rx.poll(Duration::from_millis(1)), Poll::Idle));
        drop(tx);
        assert!(matches!(rx.poll(Duration::from_millis(1)), Poll::Closed));
    }

    #[test]
    fn malformed_first_message_is_fatal() {
        let (tx, rx) = frame_channel(4);
        tx.send(b"garbage".to_vec(), vec![]);
        drop(tx);
        let (classifier, stats) = classifier(1, 2);
        let shutdown = AtomicBool::new(false);
        let result = run_ingest(rx, &classifier, &stats, &shutdown);
        assert!(result.is_err());
    }

    #[test]
    fn later_malformed_messages_are_dropped() {
        let (tx, rx) = frame_channel(8);
        tx.send_frame(FrameKind::Dark, 0, 1, 2, &[0, 0]);
        tx.send(b"garbage".to_vec(), vec![]);
        tx.send_frame(FrameKind::Flat, 0, 1, 2, &[2, 2]);
        drop(tx);
        let (classifier, stats) = classifier(1, 2);
        let shutdown = AtomicBool::new(false);
        run_ingest(rx, &classifier, &stats, &shutdown).unwrap();
        assert_eq!(
            stats
                .dropped_malformed
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn shape_mismatch_does_not_abort() {
        let (tx, rx) = frame_channel(8);
        tx.send_frame(FrameKind::Dark, 0, 1, 2, &[0, 0]);
        tx.send_frame(FrameKind::Dark, 1, 3, 3, &[1; 9]); // wrong shape
        tx.send_frame(FrameKind::Flat, 0, 1, 2, &[2, 2]);
        drop(tx);
        let (classifier, stats) = classifier(1, 2);
        let shutdown = AtomicBool::new(false);
        run_ingest(rx, &classifier, &stats, &shutdown).unwrap();
        assert_eq!(
            stats
                .dropped_malformed
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}
