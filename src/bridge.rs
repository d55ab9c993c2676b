use lazy_static::lazy_static;
use prometheus::{opts, register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tokio_util::bytes::Bytes;
use tracing::debug;

/// Read size for each direction of the bridge.
pub const BUFFER_SIZE: usize = 32 * 1024;

lazy_static! {
    static ref BRIDGE_BYTES: IntCounterVec = register_int_counter_vec!(
        opts!(
            "bridge_bytes_total",
            "Total number of bytes relayed by direction"
        ),
        &["direction"]
    )
    .unwrap();
    static ref TAP_DROPPED: IntCounter = register_int_counter!(
        "bridge_tap_dropped_total",
        "Number of chunks dropped because the tap was full"
    )
    .unwrap();
}

/// Observer for relayed bytes, the hook a session recorder attaches to.
/// Chunks are handed over without blocking; a full receiver loses them.
#[derive(Clone)]
pub struct Tap {
    tx: mpsc::Sender<Bytes>,
}

impl Tap {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);

        (Self { tx }, rx)
    }

    fn observe(&self, chunk: &[u8]) {
        if self.tx.try_send(Bytes::copy_from_slice(chunk)).is_err() {
            TAP_DROPPED.inc();
        }
    }
}

/// Couples two endpoints until both directions reach end-of-stream,
/// returning the bytes moved a→b and b→a. Transport errors end a
/// direction the same way EOF does; neither side is retried.
pub async fn join<A, B>(a: A, b: B, tap: Option<Tap>) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_a, write_a) = tokio::io::split(a);
    let (read_b, write_b) = tokio::io::split(b);

    let up = tokio::spawn(relay(read_a, write_b, tap.clone(), "upstream"));
    let down = tokio::spawn(relay(read_b, write_a, tap, "downstream"));

    (
        up.await.unwrap_or_default(),
        down.await.unwrap_or_default(),
    )
}

async fn relay<R, W>(mut src: R, mut dst: W, tap: Option<Tap>, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0;

    loop {
        let read = match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(error) => {
                debug!(direction, %error, "read ended");
                break;
            }
        };

        if let Some(tap) = &tap {
            tap.observe(&buf[..read]);
        }

        if let Err(error) = dst.write_all(&buf[..read]).await {
            debug!(direction, %error, "write ended");
            break;
        }

        total += read as u64;
    }

    // Unblocks the opposite direction at its next read.
    let _ = dst.shutdown().await;

    BRIDGE_BYTES.with_label_values(&[direction]).inc_by(total);

    total
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn delivers_in_order_without_drops() {
        let (a, mut a_remote) = duplex(64);
        let (b, mut b_remote) = duplex(64);

        let bridge = tokio::spawn(join(a, b, None));

        let sent: Vec<u8> = (0..100 * 1024).map(|i| (i % 251) as u8).collect();

        let payload = sent.clone();
        let writer = tokio::spawn(async move {
            a_remote.write_all(&payload).await.unwrap();
            a_remote.shutdown().await.unwrap();
            a_remote
        });

        let mut received = Vec::new();
        b_remote.read_to_end(&mut received).await.unwrap();

        assert_eq!(received, sent);

        // Close the other direction so the bridge can finish.
        drop(b_remote);
        drop(writer.await.unwrap());

        let (up, down) = bridge.await.unwrap();

        assert_eq!(up, sent.len() as u64);
        assert_eq!(down, 0);
    }

    #[tokio::test]
    async fn both_directions_are_independent() {
        let (a, mut a_remote) = duplex(64);
        let (b, mut b_remote) = duplex(64);

        let bridge = tokio::spawn(join(a, b, None));

        a_remote.write_all(b"ping").await.unwrap();
        b_remote.write_all(b"pong").await.unwrap();

        let mut from_a = [0u8; 4];
        b_remote.read_exact(&mut from_a).await.unwrap();
        let mut from_b = [0u8; 4];
        a_remote.read_exact(&mut from_b).await.unwrap();

        assert_eq!(&from_a, b"ping");
        assert_eq!(&from_b, b"pong");

        drop(a_remote);
        drop(b_remote);

        let (up, down) = bridge.await.unwrap();

        assert_eq!((up, down), (4, 4));
    }

    #[tokio::test]
    async fn close_propagates_to_the_other_side() {
        let (a, a_remote) = duplex(64);
        let (b, mut b_remote) = duplex(64);

        let bridge = tokio::spawn(join(a, b, None));

        // Closing the ingress entirely EOFs the a→b direction, which must
        // shut down b's write half and in turn EOF our read.
        drop(a_remote);

        let mut rest = Vec::new();
        b_remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        drop(b_remote);

        bridge.await.unwrap();
    }

    #[tokio::test]
    async fn tap_observes_chunks() {
        let (a, mut a_remote) = duplex(64);
        let (b, mut b_remote) = duplex(64);

        let (tap, mut rx) = Tap::new(16);
        let bridge = tokio::spawn(join(a, b, Some(tap)));

        a_remote.write_all(b"recorded").await.unwrap();
        a_remote.shutdown().await.unwrap();

        let mut received = Vec::new();
        b_remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"recorded");

        drop(a_remote);
        drop(b_remote);
        bridge.await.unwrap();

        let mut observed = Vec::new();
        while let Some(chunk) = rx.recv().await {
            observed.extend_from_slice(&chunk);
        }

        assert_eq!(observed, b"recorded");
    }

    #[tokio::test]
    async fn full_tap_never_blocks_the_bridge() {
        let (a, mut a_remote) = duplex(8);
        let (b, mut b_remote) = duplex(8);

        // One slot and nobody draining.
        let (tap, rx) = Tap::new(1);
        let bridge = tokio::spawn(join(a, b, Some(tap)));

        let writer = tokio::spawn(async move {
            for _ in 0..64 {
                a_remote.write_all(b"01234567").await.unwrap();
            }
            a_remote.shutdown().await.unwrap();
            a_remote
        });

        let mut received = Vec::new();
        b_remote.read_to_end(&mut received).await.unwrap();

        assert_eq!(received.len(), 64 * 8);

        drop(b_remote);
        drop(writer.await.unwrap());
        bridge.await.unwrap();

        drop(rx);
    }
}
