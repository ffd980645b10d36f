use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Progress published by an [`OutputBuffer`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Progress {
    len: usize,
    closed: bool,
}

/// Append-only capture of one output stream.
///
/// Readers can snapshot the bytes at any time or wait for a byte pattern
/// to show up. Waiters are woken on every append and when the stream hits EOF.
#[derive(Debug)]
pub struct OutputBuffer {
    data: Mutex<Vec<u8>>,
    progress: watch::Sender<Progress>,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBuffer {
    pub fn new() -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            data: Mutex::new(Vec::new()),
            progress,
        }
    }

    pub fn append(&self, chunk: &[u8]) {
        let len = {
            let mut data = self.lock();
            data.extend_from_slice(chunk);
            data.len()
        };
        self.progress.send_modify(|p| p.len = len);
    }

    /// Marks the stream as finished. Pending waiters give up.
    pub fn close(&self) {
        self.progress.send_modify(|p| p.closed = true);
    }

    pub fn is_closed(&self) -> bool {
        self.progress.borrow().closed
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, pattern: &[u8]) -> bool {
        find_subslice(&self.lock(), pattern, 0).is_some()
    }

    /// Waits until `pattern` appears in the stream.
    ///
    /// Returns `false` if the stream closes without it. Already scanned bytes
    /// are not searched again, except for the overlap a pattern split across
    /// two appends needs.
    pub async fn wait_for(&self, pattern: &[u8]) -> bool {
        let mut progress = self.progress.subscribe();
        let mut scanned: usize = 0;

        loop {
            let closed = progress.borrow_and_update().closed;
            {
                let data = self.lock();
                let from = scanned.saturating_sub(pattern.len().saturating_sub(1));
                if find_subslice(&data, pattern, from).is_some() {
                    return true;
                }
                scanned = data.len();
            }
            if closed {
                return false;
            }
            if progress.changed().await.is_err() {
                return false;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Copies `reader` into `buffer` until EOF, then closes the buffer.
pub async fn capture<R>(mut reader: R, buffer: Arc<OutputBuffer>, label: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buffer.append(&chunk[..n]),
            Err(e) => {
                warn!("Error reading {}: {}", label, e);
                break;
            }
        }
    }
    debug!("{} closed after {} bytes", label, buffer.len());
    buffer.close();
}

/// Returns the offset of the first occurrence of `needle` at or after `from`.
///
/// An empty needle matches at `from`.
pub fn find_subslice(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    if needle.is_empty() {
        return Some(from);
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}
