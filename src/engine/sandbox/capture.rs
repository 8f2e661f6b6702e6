use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Byte allowance shared by stdout and stderr of one invocation.
#[derive(Debug)]
pub struct OutputBudget {
    remaining: AtomicUsize,
    truncated: AtomicBool,
}

impl OutputBudget {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(limit),
            truncated: AtomicBool::new(false),
        })
    }

    /// Reserves up to `wanted` bytes and returns how many were granted.
    pub fn take(&self, wanted: usize) -> usize {
        let mut current = self.remaining.load(Ordering::Relaxed);
        loop {
            let granted = current.min(wanted);
            match self.remaining.compare_exchange_weak(
                current,
                current - granted,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    if granted < wanted {
                        self.truncated.store(true, Ordering::Relaxed);
                    }
                    return granted;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn truncated(&self) -> bool {
        self.truncated.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default, Clone)]
pub struct CaptureSink {
    buf: Arc<Mutex<BytesMut>>,
}

impl CaptureSink {
    fn append(&self, bytes: &[u8]) {
        let mut buf = self.buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        buf.extend_from_slice(bytes);
    }

    /// Decodes the capture into at most `max_bytes` of UTF-8. The flag is set
    /// when decoding had to cut text to stay within that size.
    pub fn into_string(self, max_bytes: usize) -> (String, bool) {
        let buf = self.buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        decode_output(&buf, max_bytes)
    }
}

/// Reads the stream to EOF, keeping only what the budget allows. The rest is
/// drained so the writer never blocks on a full pipe.
pub async fn drain_into<R>(mut reader: R, sink: CaptureSink, budget: Arc<OutputBudget>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let granted = budget.take(n);
                if granted > 0 {
                    sink.append(&chunk[..granted]);
                }
            }
            Err(_) => break,
        }
    }
}

fn decode_output(bytes: &[u8], max_bytes: usize) -> (String, bool) {
    let valid = match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        // A cut in the middle of a code point is an artifact of truncation.
        Err(err) if err.error_len().is_none() => err.valid_up_to(),
        Err(_) => bytes.len(),
    };
    // Each invalid byte becomes a three byte U+FFFD, so the decoded text can
    // outgrow what the budget granted.
    let mut text = String::from_utf8_lossy(&bytes[..valid]).into_owned();
    if text.len() <= max_bytes {
        return (text, false);
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    (text, true)
}
