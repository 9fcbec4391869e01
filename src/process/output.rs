//! Bounded capture of a process's combined stdout/stderr.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};

/// Keeps the first and last `limit` bytes written to it.
#[derive(Debug)]
pub struct OutputTail {
    limit: usize,
    prefix: Vec<u8>,
    suffix: VecDeque<u8>,
    skipped: u64,
}

impl OutputTail {
    /// Creates an empty buffer keeping at most `limit` bytes at each end.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            prefix: Vec::new(),
            suffix: VecDeque::new(),
            skipped: 0,
        }
    }

    /// Appends bytes.
    pub fn push(&mut self, mut bytes: &[u8]) {
        if self.prefix.len() < self.limit {
            let take = bytes.len().min(self.limit - self.prefix.len());
            self.prefix.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
        }
        if self.limit == 0 {
            self.skipped += bytes.len() as u64;
            return;
        }
        for &b in bytes {
            if self.suffix.len() == self.limit {
                self.suffix.pop_front();
                self.skipped += 1;
            }
            self.suffix.push_back(b);
        }
    }

    /// Renders the captured output, marking any omitted middle section.
    pub fn render(&self) -> String {
        let mut out = String::from_utf8_lossy(&self.prefix).into_owned();
        if self.skipped > 0 {
            out.push_str(&format!("\n... omitting {} bytes ...\n", self.skipped));
        }
        let (a, b) = self.suffix.as_slices();
        out.push_str(&String::from_utf8_lossy(a));
        out.push_str(&String::from_utf8_lossy(b));
        out
    }
}

/// Shared handle to an [`OutputTail`] fed by reader tasks.
pub type SharedTail = Arc<Mutex<OutputTail>>;

/// Copies everything from `reader` into `tail` until EOF.
pub(crate) async fn capture(mut reader: impl AsyncRead + Unpin, tail: SharedTail) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => tail
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(&buf[..n]),
        }
    }
}

/// Renders the current contents of `tail`.
pub(crate) fn snapshot(tail: &SharedTail) -> String {
    tail.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_output_is_kept_whole() {
        let mut tail = OutputTail::new(8);
        tail.push(b"hello");
        assert_eq!(tail.render(), "hello");
    }

    #[test]
    fn long_output_keeps_both_ends() {
        let mut tail = OutputTail::new(4);
        tail.push(b"abcd");
        tail.push(b"0123456789");
        tail.push(b"wxyz");
        assert_eq!(tail.render(), "abcd\n... omitting 10 bytes ...\nwxyz");
    }

    #[tokio::test]
    async fn capture_reads_until_eof() {
        let tail: SharedTail = Arc::new(Mutex::new(OutputTail::new(64)));
        capture(&b"boot failed\n"[..], tail.clone()).await;
        assert_eq!(snapshot(&tail), "boot failed\n");
    }
}
