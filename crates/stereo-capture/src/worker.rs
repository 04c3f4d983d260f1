//! Background encoding, signing, persistence and upload of captures.
//!
//! The session hands a [`CaptureJob`] to the worker thread and keeps
//! running; outcomes come back as [`CaptureEvent`]s that the session drains
//! with [`CaptureWorker::poll`]. A record is always written to disk before any
//! upload is attempted, and cancelling only ever skips uploads.

use crate::record::{CaptureData, CaptureRecord};
use crate::signer::Signer;
use crate::transport::{Transport, UploadReceipt};
use image::RgbImage;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use stereo_depth::DisparityField;
use thiserror::Error;

/// Frame data captured on the session thread.
#[derive(Debug, Clone)]
pub struct CaptureJob {
    pub timestamp: u64,
    /// Rectified left frame.
    pub base: RgbImage,
    /// Auxiliary view composite.
    pub composite: RgbImage,
    pub disparity: DisparityField,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Saved { timestamp: u64, path: PathBuf },
    Uploaded { timestamp: u64, receipt: UploadReceipt },
    /// The record is on disk at `path` and can be uploaded later.
    UploadFailed { timestamp: u64, path: PathBuf, error: String },
    /// The upload was cancelled; the record stays on disk at `path`.
    Cancelled { timestamp: u64, path: PathBuf },
    Failed { timestamp: u64, error: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("capture worker has stopped")]
    Stopped,
}

pub struct CaptureWorker {
    jobs: Option<Sender<(u64, CaptureJob)>>,
    events: Receiver<CaptureEvent>,
    /// Number of jobs submitted so far; the next job gets this sequence number.
    submitted: AtomicU64,
    /// Jobs numbered below this skip their upload.
    cancel_below: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

struct WorkerState {
    output_dir: PathBuf,
    signer: Option<Box<dyn Signer>>,
    transport: Option<Box<dyn Transport>>,
    cancel_below: Arc<AtomicU64>,
    events: Sender<CaptureEvent>,
}

impl CaptureWorker {
    pub fn spawn(
        output_dir: PathBuf,
        signer: Option<Box<dyn Signer>>,
        transport: Option<Box<dyn Transport>>,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<(u64, CaptureJob)>();
        let (event_tx, event_rx) = mpsc::channel();
        let cancel_below = Arc::new(AtomicU64::new(0));
        let state = WorkerState {
            output_dir,
            signer,
            transport,
            cancel_below: Arc::clone(&cancel_below),
            events: event_tx,
        };

        let handle = thread::spawn(move || {
            debug!("capture worker started");
            for (seq, job) in job_rx {
                state.process(seq, job);
            }
            debug!("capture worker exiting");
        });

        Self {
            jobs: Some(job_tx),
            events: event_rx,
            submitted: AtomicU64::new(0),
            cancel_below,
            handle: Some(handle),
        }
    }

    pub fn submit(&self, job: CaptureJob) -> Result<(), WorkerError> {
        let jobs = self.jobs.as_ref().ok_or(WorkerError::Stopped)?;
        let seq = self.submitted.fetch_add(1, Ordering::SeqCst);
        jobs.send((seq, job)).map_err(|_| WorkerError::Stopped)
    }

    /// Events produced since the last call, without blocking.
    pub fn poll(&self) -> Vec<CaptureEvent> {
        self.events.try_iter().collect()
    }

    /// Skip the upload of every job submitted so far that has not started
    /// uploading yet. Those jobs are still saved and report
    /// [`CaptureEvent::Cancelled`]. Jobs submitted afterwards upload normally.
    pub fn cancel(&self) {
        let submitted = self.submitted.load(Ordering::SeqCst);
        let before = self.cancel_below.fetch_max(submitted, Ordering::SeqCst);
        debug!("cancelling uploads of jobs {}..{submitted}", before.min(submitted));
    }

    /// Finish queued jobs and return the remaining events.
    pub fn shutdown(mut self) -> Vec<CaptureEvent> {
        self.join();
        self.poll()
    }

    fn join(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("capture worker panicked");
            }
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.join();
    }
}

impl WorkerState {
    fn emit(&self, event: CaptureEvent) {
        // The session may already be gone during shutdown.
        let _ = self.events.send(event);
    }

    fn cancelled(&self, seq: u64) -> bool {
        seq < self.cancel_below.load(Ordering::SeqCst)
    }

    fn process(&self, seq: u64, job: CaptureJob) {
        let timestamp = job.timestamp;
        let sealed = CaptureData::new(timestamp, &job.base, &job.composite, &job.disparity)
            .and_then(|data| CaptureRecord::seal(data, self.signer.as_deref()))
            .and_then(|record| record.save(&self.output_dir).map(|path| (record, path)));
        let (record, path) = match sealed {
            Ok(v) => v,
            Err(e) => {
                warn!("capture {timestamp} failed: {e}");
                self.emit(CaptureEvent::Failed {
                    timestamp,
                    error: e.to_string(),
                });
                return;
            }
        };
        self.emit(CaptureEvent::Saved {
            timestamp,
            path: path.clone(),
        });

        let Some(transport) = &self.transport else {
            return;
        };
        if self.cancelled(seq) {
            info!("upload of {} cancelled", path.display());
            self.emit(CaptureEvent::Cancelled { timestamp, path });
            return;
        }
        match transport.send(&record) {
            Ok(receipt) => {
                info!("capture {timestamp} stored as {}", receipt.piece_cid);
                self.emit(CaptureEvent::Uploaded { timestamp, receipt });
            }
            Err(e) => {
                warn!("upload of {} failed: {e}", path.display());
                self.emit(CaptureEvent::UploadFailed {
                    timestamp,
                    path,
                    error: e.to_string(),
                });
            }
        }
    }
}
