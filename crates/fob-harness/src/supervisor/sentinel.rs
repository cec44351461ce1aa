//! Readiness detection on the app's standard output.
//!
//! The app announces it is accepting connections by printing a fixed line.
//! Output is copied through unchanged while we look for it.

use memchr::memmem;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

/// Default announcement printed by framework apps once listening.
pub const DEFAULT_READY_PATTERN: &str = "engine is listening on";

/// Incremental substring search across reads.
///
/// A pattern split over two reads is still found: the scanner keeps the tail
/// of the previous read that could be the start of a match.
#[derive(Debug)]
pub struct SentinelScanner {
    patterns: Vec<Vec<u8>>,
    carry: Vec<u8>,
    keep: usize,
}

impl SentinelScanner {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Vec<Vec<u8>> = patterns
            .into_iter()
            .map(|p| p.as_ref().as_bytes().to_vec())
            .filter(|p| !p.is_empty())
            .collect();
        let keep = patterns.iter().map(Vec::len).max().unwrap_or(1) - 1;
        Self {
            patterns,
            carry: Vec::new(),
            keep,
        }
    }

    /// Feed a chunk; true once any pattern has been seen.
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        self.carry.extend_from_slice(chunk);
        let found = self
            .patterns
            .iter()
            .any(|p| memmem::find(&self.carry, p).is_some());

        if self.carry.len() > self.keep {
            self.carry.drain(..self.carry.len() - self.keep);
        }
        found
    }
}

/// Copy `src` to `dest`, firing `ready` the first time a pattern appears.
///
/// Runs until `src` reaches EOF. Write failures on `dest` are logged and the
/// copy keeps draining so the child never blocks on a full pipe.
pub(crate) async fn forward_output<R, W>(
    mut src: R,
    mut dest: W,
    mut scanner: SentinelScanner,
    ready: oneshot::Sender<()>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut ready = Some(ready);
    let mut buf = vec![0u8; 8 * 1024];
    let mut dest_ok = true;

    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "App output closed");
                break;
            }
        };
        let chunk = &buf[..n];

        if ready.is_some() && scanner.feed(chunk) {
            if let Some(tx) = ready.take() {
                let _ = tx.send(());
            }
        }

        if dest_ok {
            if let Err(e) = dest.write_all(chunk).await.and(dest.flush().await) {
                tracing::warn!(error = %e, "Failed to forward app output");
                dest_ok = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scanner_finds_pattern_in_single_chunk() {
        let mut scanner = SentinelScanner::new([DEFAULT_READY_PATTERN]);
        assert!(!scanner.feed(b"INFO starting up\n"));
        assert!(scanner.feed(b"INFO engine is listening on localhost:9000\n"));
    }

    #[test]
    fn test_scanner_finds_pattern_split_across_chunks() {
        let mut scanner = SentinelScanner::new(["listening on"]);
        assert!(!scanner.feed(b"server is liste"));
        assert!(scanner.feed(b"ning on :9000"));
    }

    #[test]
    fn test_scanner_multiple_patterns() {
        let mut scanner = SentinelScanner::new([DEFAULT_READY_PATTERN, "Listening on"]);
        assert!(scanner.feed(b"Listening on 127.0.0.1:9000"));
    }

    #[test]
    fn test_scanner_carry_is_bounded() {
        let mut scanner = SentinelScanner::new(["abc"]);
        scanner.feed(&[b'x'; 10_000]);
        assert!(scanner.carry.len() <= 2);
    }

    #[tokio::test]
    async fn test_forward_output_copies_and_signals() {
        let input: &[u8] = b"booting\nengine is listening on :9000\nrequest served\n";
        let mut output = Vec::new();
        let (tx, rx) = oneshot::channel();

        forward_output(
            input,
            &mut output,
            SentinelScanner::new([DEFAULT_READY_PATTERN]),
            tx,
        )
        .await;

        assert!(rx.await.is_ok());
        assert_eq!(output, input);
    }

    #[tokio::test]
    async fn test_forward_output_without_sentinel_drops_sender() {
        let input: &[u8] = b"booting\ncrashed\n";
        let (tx, rx) = oneshot::channel();

        forward_output(input, tokio::io::sink(), SentinelScanner::new(["ready"]), tx).await;

        assert!(rx.await.is_err());
    }
}
