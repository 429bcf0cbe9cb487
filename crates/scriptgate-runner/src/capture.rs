//! Size-capped output capture

use tokio::io::{AsyncRead, AsyncReadExt};

/// Accumulates up to `limit` bytes and counts the rest
#[derive(Debug, Clone)]
pub struct CappedBuffer {
    data: Vec<u8>,
    limit: usize,
    dropped: u64,
}

impl CappedBuffer {
    /// Empty buffer holding at most `limit` bytes
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::with_capacity(limit.min(8192)),
            limit,
            dropped: 0,
        }
    }

    /// Append `chunk`, discarding what does not fit
    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        let keep = room.min(chunk.len());
        self.data.extend_from_slice(&chunk[..keep]);
        self.dropped += (chunk.len() - keep) as u64;
    }

    /// Bytes discarded so far
    #[inline]
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Whether anything was discarded
    #[inline]
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.dropped > 0
    }

    /// Captured text, lossily decoded, with a marker when truncated
    #[must_use]
    pub fn into_text(self) -> (String, bool) {
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        let truncated = self.is_truncated();
        if truncated {
            if !text.ends_with('\n') && !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&format!("[... {} bytes truncated]", self.dropped));
        }
        (text, truncated)
    }
}

/// Read `reader` to EOF into a buffer capped at `limit`
///
/// Reading continues past the cap so the writer never blocks on a full pipe.
pub(crate) async fn drain<R>(mut reader: R, limit: usize) -> CappedBuffer
where
    R: AsyncRead + Unpin,
{
    let mut buffer = CappedBuffer::new(limit);
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buffer.push(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::debug!(error = %e, "output pipe closed with error");
                break;
            }
        }
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn under_limit_is_untouched() {
        let mut buffer = CappedBuffer::new(16);
        buffer.push(b"hello\n");
        assert_eq!(buffer.into_text(), ("hello\n".to_string(), false));
    }

    #[test]
    fn excess_is_counted_and_marked() {
        let mut buffer = CappedBuffer::new(4);
        buffer.push(b"abc");
        buffer.push(b"defgh");
        assert_eq!(buffer.dropped(), 4);
        let (text, truncated) = buffer.into_text();
        assert!(truncated);
        assert_eq!(text, "abcd\n[... 4 bytes truncated]");
    }

    #[test]
    fn zero_limit_keeps_nothing() {
        let mut buffer = CappedBuffer::new(0);
        buffer.push(b"x");
        assert_eq!(buffer.into_text().0, "[... 1 bytes truncated]");
    }

    #[tokio::test]
    async fn drain_reads_past_the_cap() {
        let input = vec![b'a'; 100_000];
        let buffer = drain(&input[..], 10).await;
        assert_eq!(buffer.dropped(), 99_990);
    }
}
