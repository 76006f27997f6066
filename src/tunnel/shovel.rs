//! Shovel pair: two concurrent one-way byte pumps with a joint lifecycle
//!
//! Each pump copies from one stream's read half to the other's write half
//! through a fixed buffer, in order, until its source reaches EOF, either
//! side errors, or the shared `done` signal is raised. Whichever pump exits
//! first raises `done`, so closing one side (or calling [`ShovelPair::stop`])
//! tears both pumps down within a bounded time and the two write halves are
//! both shut down.

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

const PUMP_BUF_SIZE: usize = 32 * 1024;

/// Two one-way pumps between a pair of bidirectional streams.
///
/// Constructing the pair with [`ShovelPair::start`] is the single permitted
/// start; the spawned pumps are the pair's only tasks and both have exited
/// once [`ShovelPair::wait`] returns.
pub struct ShovelPair {
    done: broadcast::Sender<()>,
    pumps: [JoinHandle<()>; 2],
}

impl ShovelPair {
    /// Spawn both pumps and return immediately. `label_ab` names the a→b
    /// direction, `label_ba` the b→a direction; labels are purely
    /// diagnostic.
    pub fn start<A, B>(a: A, b: B, label_ab: &str, label_ba: &str) -> Self
    where
        A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (done, _) = broadcast::channel(2);
        let (a_read, a_write) = io::split(a);
        let (b_read, b_write) = io::split(b);

        let ab = tokio::spawn(pump(
            a_read,
            b_write,
            label_ab.to_string(),
            done.clone(),
            done.subscribe(),
        ));
        let ba = tokio::spawn(pump(
            b_read,
            a_write,
            label_ba.to_string(),
            done.clone(),
            done.subscribe(),
        ));

        Self {
            done,
            pumps: [ab, ba],
        }
    }

    /// Raise the joint shutdown signal without waiting. Idempotent.
    pub fn stop(&self) {
        let _ = self.done.send(());
    }

    /// Wait until both pumps have exited.
    pub async fn wait(self) {
        for handle in self.pumps {
            let _ = handle.await;
        }
    }

    /// Stop and wait in one step.
    pub async fn shutdown(self) {
        self.stop();
        self.wait().await;
    }
}

async fn pump<R, W>(
    mut src: R,
    mut dst: W,
    label: String,
    done: broadcast::Sender<()>,
    mut done_rx: broadcast::Receiver<()>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUF_SIZE];
    loop {
        tokio::select! {
            _ = done_rx.recv() => {
                debug!(%label, "pump stopped by pair shutdown");
                break;
            }
            read = src.read(&mut buf) => match read {
                Ok(0) => {
                    debug!(%label, "pump source EOF");
                    break;
                }
                Ok(n) => {
                    if let Err(e) = dst.write_all(&buf[..n]).await {
                        debug!(%label, error = %e, "pump write error");
                        break;
                    }
                }
                Err(e) => {
                    debug!(%label, error = %e, "pump read error");
                    break;
                }
            }
        }
    }

    // take the sibling pump down with us, then close our write side;
    // a pair that is already stopping tolerates both
    let _ = done.send(());
    let _ = dst.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const BOUNDED: Duration = Duration::from_secs(5);

    fn trace_init() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    /// Two duplex links; the shovel pair joins their inner ends, so bytes
    /// written into `a_peer` come out of `b_peer` and vice versa.
    fn linked_pair() -> (
        tokio::io::DuplexStream,
        tokio::io::DuplexStream,
        ShovelPair,
    ) {
        let (a_inner, a_peer) = tokio::io::duplex(64 * 1024);
        let (b_inner, b_peer) = tokio::io::duplex(64 * 1024);
        let pair = ShovelPair::start(a_inner, b_inner, "a->b", "b->a");
        (a_peer, b_peer, pair)
    }

    #[tokio::test]
    async fn test_bytes_conserved_in_order_both_directions() {
        trace_init();
        let (mut a, mut b, pair) = linked_pair();

        a.write_all(b"hello through the shovel").await.unwrap();
        let mut buf = [0u8; 64];
        let n = timeout(BOUNDED, b.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"hello through the shovel");

        b.write_all(b"and back again").await.unwrap();
        let n = timeout(BOUNDED, a.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"and back again");

        pair.shutdown().await;
    }

    #[tokio::test]
    async fn test_large_transfer_in_order() {
        let (mut a, mut b, pair) = linked_pair();

        // several pump buffers' worth, with a recognizable sequence
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            a.write_all(&payload).await.unwrap();
            a.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        timeout(BOUNDED, b.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, expected);

        writer.await.unwrap();
        timeout(BOUNDED, pair.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_on_one_side_closes_both() {
        let (mut a, mut b, pair) = linked_pair();

        a.write_all(b"last words").await.unwrap();
        a.shutdown().await.unwrap();

        let mut received = Vec::new();
        timeout(BOUNDED, b.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"last words");

        // the EOF propagates through the pair: the reverse direction is
        // closed too, and both pumps exit
        let mut buf = [0u8; 16];
        let n = timeout(BOUNDED, a.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
        timeout(BOUNDED, pair.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_leaves_no_tasks_behind() {
        let (_a, _b, pair) = linked_pair();

        pair.stop();
        pair.stop(); // idempotent
        timeout(BOUNDED, pair.wait())
            .await
            .expect("pumps did not exit after stop()");
    }

    #[tokio::test]
    async fn test_stop_unblocks_idle_pumps() {
        // no traffic at all; both pumps are parked in read
        let (_a, _b, pair) = linked_pair();
        tokio::time::sleep(Duration::from_millis(20)).await;

        pair.stop();
        timeout(BOUNDED, pair.wait())
            .await
            .expect("idle pumps did not observe the done signal");
    }
}
