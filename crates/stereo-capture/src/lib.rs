//! Live stereo depth session and tamper-evident capture records.
//!
//! A [`DepthSession`] pulls frame pairs from two [`FrameSource`]s, rectifies
//! and matches them, and shows the result through a [`Presenter`]. On an
//! operator [`OperatorCommand::Capture`] the current frame is sealed into a
//! [`CaptureRecord`]: the rectified left image, a view composite and the
//! sparse disparities, signed over their [`canonical_json`] bytes. The
//! [`CaptureWorker`] writes the record to `depth_capture_<timestamp>.json` and
//! then hands it to a [`Transport`].

pub mod canonical;
pub mod record;
pub mod session;
pub mod signer;
pub mod transport;
pub mod worker;

pub use canonical::canonical_json;
pub use record::{
    verify_record, Attestation, CaptureData, CaptureRecord, RecordError, UnsignedReason, Verification,
};
pub use session::{
    DepthSession, FrameSource, FrameSummary, ImageSequenceSource, OperatorCommand, OperatorInput, Presenter,
    ProvenanceConfig, ScriptedInput, SessionConfig, SessionError, SessionSummary, SourceError, TickOutcome,
};
pub use signer::{HmacSigner, SignError, Signer, Verifier};
pub use transport::{HttpTransport, Transport, TransportError, UploadReceipt};
pub use worker::{CaptureEvent, CaptureJob, CaptureWorker, WorkerError};
