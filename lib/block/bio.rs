//! Asynchronous block I/O requests and the per-device worker queue.
//!
//! A [`Bio`] describes one queued operation. Each device owns a [`BioQueue`]:
//! a FIFO channel drained by a single worker thread, so completions for a
//! given submitter fire in submission order and never on the submitter's
//! thread. Dropping the device closes the channel; the worker drains what was
//! already queued, finishes any in-flight completion, and is joined before
//! the device destructor returns.

use std::sync::mpsc;
use std::thread::JoinHandle;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::block::{BlockDevice, SectorId};
use crate::error::{FsError, FsResult};
use crate::sync::{Arc, Condvar, Mutex};

/// The kind of operation a [`Bio`] requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioKind {
    /// Read `len` bytes into the bio's buffer.
    Read,
    /// Write the bio's payload.
    Write,
    /// Durability barrier.
    Flush,
    /// Discard a byte range.
    Discard,
}

/// The buffer carried by a [`Bio`].
#[derive(Debug)]
pub enum BioData {
    /// Destination buffer for a read; handed back through the completion.
    Read(BytesMut),
    /// Source payload for a write.
    Write(Bytes),
    /// Flush and discard requests carry no buffer.
    None,
}

impl BioData {
    /// Extract the filled read buffer, if this was a read bio.
    #[must_use]
    pub fn into_read(self) -> Option<BytesMut> {
        match self {
            Self::Read(buf) => Some(buf),
            Self::Write(_) | Self::None => None,
        }
    }
}

/// Completion callback: receives the outcome and the bio's buffer.
pub type BioCompletion = Box<dyn FnOnce(FsResult<usize>, BioData) + Send + 'static>;

/// One queued block-I/O request.
pub struct Bio {
    /// Operation kind.
    pub kind: BioKind,
    /// Starting sector.
    pub sector: SectorId,
    /// Length in bytes. For reads and writes this equals the buffer length;
    /// for discards it is the number of bytes to discard; flushes carry 0.
    pub len: u64,
    data: BioData,
    completion: Option<BioCompletion>,
}

impl std::fmt::Debug for Bio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bio")
            .field("kind", &self.kind)
            .field("sector", &self.sector)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl Bio {
    /// A read of `len` bytes at `sector`. The zeroed destination buffer is
    /// handed back, filled, through the completion.
    #[must_use]
    pub fn read(sector: SectorId, len: usize, completion: BioCompletion) -> Self {
        Self {
            kind: BioKind::Read,
            sector,
            len: len as u64,
            data: BioData::Read(BytesMut::zeroed(len)),
            completion: Some(completion),
        }
    }

    /// A write of `payload` at `sector`.
    #[must_use]
    pub fn write(sector: SectorId, payload: Bytes, completion: BioCompletion) -> Self {
        Self {
            kind: BioKind::Write,
            sector,
            len: payload.len() as u64,
            data: BioData::Write(payload),
            completion: Some(completion),
        }
    }

    /// A durability barrier.
    #[must_use]
    pub fn flush(completion: BioCompletion) -> Self {
        Self {
            kind: BioKind::Flush,
            sector: 0,
            len: 0,
            data: BioData::None,
            completion: Some(completion),
        }
    }

    /// A discard of `len` bytes at `sector`.
    #[must_use]
    pub fn discard(sector: SectorId, len: u64, completion: BioCompletion) -> Self {
        Self {
            kind: BioKind::Discard,
            sector,
            len,
            data: BioData::None,
            completion: Some(completion),
        }
    }

    /// Mutable access to the carried buffer, used by device executors.
    pub(crate) fn data_mut(&mut self) -> &mut BioData {
        &mut self.data
    }

    /// Invoke the completion exactly once with `outcome`, surrendering the
    /// buffer.
    pub(crate) fn complete(mut self, outcome: FsResult<usize>) {
        if let Some(done) = self.completion.take() {
            done(outcome, self.data);
        }
    }
}

/// Executes bios against a concrete device's backing store.
///
/// Implemented by the shared inner state of each device so the worker thread
/// can run without holding a reference cycle through the device itself.
pub(crate) trait BioExecutor: Send + Sync + 'static {
    fn execute(&self, bio: &mut Bio) -> FsResult<usize>;
}

/// Per-device FIFO submission queue served by one worker thread.
pub(crate) struct BioQueue {
    tx: Option<mpsc::Sender<Bio>>,
    worker: Option<JoinHandle<()>>,
}

impl BioQueue {
    /// Spawn the worker thread for `exec`, named after the device.
    pub(crate) fn spawn<E: BioExecutor>(device: &str, exec: Arc<E>) -> Self {
        let (tx, rx) = mpsc::channel::<Bio>();
        let name = format!("bio-{device}");
        let worker = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while let Ok(mut bio) = rx.recv() {
                    trace!(kind = ?bio.kind, sector = bio.sector, len = bio.len, "bio dequeued");
                    let outcome = exec.execute(&mut bio);
                    bio.complete(outcome);
                }
                debug!(worker = %name, "bio worker shutting down");
            })
            // Thread spawning only fails when the process is out of
            // resources, at which point nothing else will work either.
            .unwrap_or_else(|e| panic!("failed to spawn bio worker: {e}"));

        Self {
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    /// Enqueue a bio. If the worker is already gone the completion fires on
    /// the submitter with an I/O error rather than being lost.
    pub(crate) fn submit(&self, bio: Bio) {
        match &self.tx {
            Some(tx) => {
                if let Err(mpsc::SendError(bio)) = tx.send(bio) {
                    bio.complete(Err(FsError::Io));
                }
            }
            None => bio.complete(Err(FsError::Io)),
        }
    }
}

impl Drop for BioQueue {
    fn drop(&mut self) {
        // Closing the channel disables enqueue and wakes the worker, which
        // drains the remaining queue before exiting.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Submit a bio and block until its completion fires.
///
/// Convenience wrapper over [`BlockDevice::submit_bio`] for callers that want
/// the asynchronous path's ordering semantics with a synchronous surface.
/// Returns the outcome and the bio's buffer (filled, for reads).
pub fn submit_and_wait(
    device: &dyn BlockDevice,
    make: impl FnOnce(BioCompletion) -> Bio,
) -> (FsResult<usize>, BioData) {
    type Slot = (Mutex<Option<(FsResult<usize>, BioData)>>, Condvar);
    let slot: Arc<Slot> = Arc::new((Mutex::new(None), Condvar::new()));

    let tx = Arc::clone(&slot);
    let bio = make(Box::new(move |outcome, data| {
        *crate::sync::lock(&tx.0) = Some((outcome, data));
        tx.1.notify_all();
    }));
    device.submit_bio(bio);

    let mut guard = crate::sync::lock(&slot.0);
    loop {
        if let Some(result) = guard.take() {
            return result;
        }
        guard = crate::sync::wait(&slot.1, guard);
    }
}
