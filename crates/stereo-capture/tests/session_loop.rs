//! Drives a full depth session over synthetic frames.

use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use stereo_capture::{
    verify_record, Attestation, CaptureEvent, CaptureRecord, DepthSession, FrameSource, FrameSummary, HmacSigner, OperatorCommand,
    Presenter, ProvenanceConfig, ScriptedInput, SessionConfig, SourceError, TickOutcome, Transport, TransportError,
    UnsignedReason, UploadReceipt, Verification,
};
use stereo_core::{CameraModel, FxFyCxCySkew, ImageSize, RectificationGeometry};
use stereo_depth::{default_penalties, RectificationMaps, SgbmParams, VisualStyle, Visualizer};
use stereo_pipeline::StereoRig;

const W: u32 = 96;
const H: u32 = 48;
const SHIFT: u32 = 4;

struct QueueSource {
    frames: VecDeque<Result<RgbImage, SourceError>>,
    latched: Option<RgbImage>,
}

impl QueueSource {
    fn new(frames: Vec<Result<RgbImage, SourceError>>) -> Box<Self> {
        Box::new(Self {
            frames: frames.into(),
            latched: None,
        })
    }
}

impl FrameSource for QueueSource {
    fn grab(&mut self) -> Result<(), SourceError> {
        self.latched = Some(self.frames.pop_front().ok_or(SourceError::Exhausted)??);
        Ok(())
    }

    fn retrieve(&mut self) -> Result<RgbImage, SourceError> {
        self.latched
            .take()
            .ok_or_else(|| SourceError::Device("nothing latched".into()))
    }
}

#[derive(Default)]
struct CountingPresenter {
    shown: Vec<(u32, u32)>,
}

impl Presenter for CountingPresenter {
    fn present(&mut self, view: &RgbImage) {
        self.shown.push(view.dimensions());
    }
}

fn rig() -> StereoRig {
    let cam = CameraModel::pinhole(
        ImageSize::new(W, H),
        FxFyCxCySkew {
            fx: 80.0,
            fy: 80.0,
            cx: (W - 1) as f64 / 2.0,
            cy: (H - 1) as f64 / 2.0,
            skew: 0.0,
        },
    );
    let geometry = RectificationGeometry::aligned(&cam, -60.0);
    let maps = RectificationMaps::build(&cam, &cam, &geometry).unwrap();
    StereoRig::new(geometry, maps, None)
}

/// Left/right frames of a fronto-parallel textured plane at disparity `SHIFT`.
fn frame_pair(seed: u64) -> (RgbImage, RgbImage) {
    let mut rng = StdRng::seed_from_u64(seed);
    let tex: Vec<Vec<u8>> = (0..H).map(|_| (0..W + SHIFT).map(|_| rng.gen()).collect()).collect();
    let px = |x: u32, y: u32| {
        let v = tex[y as usize][x as usize];
        Rgb([v, v, v])
    };
    (
        RgbImage::from_fn(W, H, |x, y| px(x, y)),
        RgbImage::from_fn(W, H, |x, y| px(x + SHIFT, y)),
    )
}

fn config(output_dir: PathBuf) -> SessionConfig {
    let (p1, p2) = default_penalties(5, 3);
    SessionConfig {
        matcher: SgbmParams {
            num_disparities: 16,
            block_size: 5,
            p1,
            p2,
            ..SgbmParams::default()
        },
        visualizer: Visualizer::new(VisualStyle::Depth, 0.6),
        swap_cameras: false,
        output_dir,
    }
}

fn sources(n: u64) -> (Box<QueueSource>, Box<QueueSource>) {
    let (l, r): (Vec<_>, Vec<_>) = (0..n).map(|i| frame_pair(i + 1)).map(|(l, r)| (Ok(l), Ok(r))).unzip();
    (QueueSource::new(l), QueueSource::new(r))
}

#[test]
fn capture_is_persisted_with_recoverable_depth() {
    let dir = tempfile::tempdir().unwrap();
    let (left, right) = sources(3);
    let provenance = ProvenanceConfig {
        upload: false,
        ..ProvenanceConfig::default()
    };
    let session = DepthSession::new(rig(), left, right, config(dir.path().to_path_buf()), &provenance).unwrap();
    let mut input = ScriptedInput::new(vec![
        vec![OperatorCommand::Capture],
        vec![OperatorCommand::BlendUp, OperatorCommand::SetStyle(VisualStyle::Panel)],
    ]);
    let mut presenter = CountingPresenter::default();
    let summary = session.run(&mut input, &mut presenter).unwrap();

    assert_eq!(summary.frames, 3);
    assert_eq!(presenter.shown[0], (W, H));
    assert_eq!(presenter.shown[2], (3 * W, 2 * H));

    let saved: Vec<&PathBuf> = summary
        .events
        .iter()
        .filter_map(|e| match e {
            CaptureEvent::Saved { path, .. } => Some(path),
            _ => None,
        })
        .collect();
    assert_eq!(saved.len(), 1);
    let record = CaptureRecord::load(saved[0]).unwrap();
    assert_eq!(record.signature, Attestation::Unsigned(UnsignedReason::NoSigningKey));

    let depth = record.data.depth_data.decode().unwrap();
    assert_eq!((depth.width, depth.height), (W, H));
    let mut values = record.data.depth_data.values.clone();
    assert!(values.len() > ((W - 16) * H / 2) as usize, "{} depth points", values.len());
    values.sort_by(|a, b| a.total_cmp(b));
    let median = values[values.len() / 2];
    assert!((median - SHIFT as f64).abs() <= 0.25, "median disparity {median}");
}

#[test]
fn signed_session_records_verify() {
    let dir = tempfile::tempdir().unwrap();
    let (left, right) = sources(1);
    let signer = HmacSigner::from_secret("0x00112233").unwrap();
    let session = DepthSession::with_worker_parts(
        rig(),
        left,
        right,
        config(dir.path().to_path_buf()),
        Some(Box::new(signer.clone())),
        None,
    )
    .unwrap();
    let mut input = ScriptedInput::new(vec![vec![OperatorCommand::Capture, OperatorCommand::Quit]]);
    let summary = session.run(&mut input, &mut CountingPresenter::default()).unwrap();

    let Some(CaptureEvent::Saved { path, .. }) = summary.events.first() else {
        panic!("no capture saved: {:?}", summary.events);
    };
    let record = CaptureRecord::load(path).unwrap();
    assert_eq!(verify_record(&record, &signer).unwrap(), Verification::Valid);
}

#[test]
fn failed_grab_skips_the_frame() {
    let dir = tempfile::tempdir().unwrap();
    let (l0, r0) = frame_pair(9);
    let left = QueueSource::new(vec![Err(SourceError::Device("usb reset".into())), Ok(l0)]);
    let right = QueueSource::new(vec![Ok(r0.clone()), Ok(r0)]);
    let mut session = DepthSession::with_worker_parts(rig(), left, right, config(dir.path().to_path_buf()), None, None)
        .unwrap();
    let mut input = ScriptedInput::default();
    let mut presenter = CountingPresenter::default();

    assert_eq!(
        session.tick(&mut input, &mut presenter).unwrap(),
        TickOutcome::Skipped("usb reset".into())
    );
    assert!(matches!(
        session.tick(&mut input, &mut presenter).unwrap(),
        TickOutcome::Processed(_)
    ));
    assert_eq!(session.tick(&mut input, &mut presenter).unwrap(), TickOutcome::EndOfStream);
    let summary = session.finish().unwrap();
    assert_eq!((summary.frames, summary.skipped), (1, 1));
}

#[test]
fn invalid_matcher_update_keeps_the_old_matcher() {
    let dir = tempfile::tempdir().unwrap();
    let (left, right) = sources(2);
    let mut session = DepthSession::with_worker_parts(rig(), left, right, config(dir.path().to_path_buf()), None, None)
        .unwrap();
    let bad = SgbmParams {
        num_disparities: 15,
        ..SgbmParams::default()
    };
    let mut input = ScriptedInput::new(vec![vec![OperatorCommand::SetMatcher(bad), OperatorCommand::SwapCameras]]);
    let mut presenter = CountingPresenter::default();
    session.tick(&mut input, &mut presenter).unwrap();
    assert_eq!(session.matcher().params().num_disparities, 16);
    assert!(session.swap_cameras());
    let outcome = session.tick(&mut input, &mut presenter).unwrap();
    assert!(matches!(outcome, TickOutcome::Processed(FrameSummary { index: 2, .. })));
}

#[test]
fn wrong_frame_size_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let left = QueueSource::new(vec![Ok(RgbImage::new(W + 2, H))]);
    let right = QueueSource::new(vec![Ok(RgbImage::new(W + 2, H))]);
    let mut session = DepthSession::with_worker_parts(rig(), left, right, config(dir.path().to_path_buf()), None, None)
        .unwrap();
    let err = session
        .tick(&mut ScriptedInput::default(), &mut CountingPresenter::default())
        .unwrap_err();
    assert!(err.to_string().contains("left frame"), "{err}");
}

/// Holds the first upload until released; later uploads go straight through.
struct FirstUploadGate {
    calls: AtomicUsize,
    started: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl Transport for FirstUploadGate {
    fn send(&self, record: &CaptureRecord) -> Result<UploadReceipt, TransportError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.started.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
        }
        Ok(UploadReceipt {
            piece_cid: format!("cid-{}", record.data.timestamp),
        })
    }
}

#[test]
fn cancelled_uploads_still_leave_records_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let (left, right) = sources(3);
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let gate = FirstUploadGate {
        calls: AtomicUsize::new(0),
        started: Mutex::new(started_tx),
        release: Mutex::new(release_rx),
    };
    let mut session = DepthSession::with_worker_parts(
        rig(),
        left,
        right,
        config(dir.path().to_path_buf()),
        None,
        Some(Box::new(gate)),
    )
    .unwrap();
    let mut input = ScriptedInput::new(vec![
        vec![OperatorCommand::Capture],
        vec![OperatorCommand::Capture, OperatorCommand::CancelUploads],
        vec![OperatorCommand::Capture],
    ]);
    let mut presenter = CountingPresenter::default();

    session.tick(&mut input, &mut presenter).unwrap();
    started_rx.recv().unwrap();
    session.tick(&mut input, &mut presenter).unwrap();
    release_tx.send(()).unwrap();
    session.tick(&mut input, &mut presenter).unwrap();
    let summary = session.finish().unwrap();

    let saved: Vec<&PathBuf> = summary
        .events
        .iter()
        .filter_map(|e| match e {
            CaptureEvent::Saved { path, .. } => Some(path),
            _ => None,
        })
        .collect();
    assert_eq!(saved.len(), 3, "{:?}", summary.events);
    assert!(saved.iter().all(|p| p.exists()));

    let cancelled: Vec<&PathBuf> = summary
        .events
        .iter()
        .filter_map(|e| match e {
            CaptureEvent::Cancelled { path, .. } => Some(path),
            _ => None,
        })
        .collect();
    assert_eq!(cancelled, [saved[1]]);
    let uploaded = summary
        .events
        .iter()
        .filter(|e| matches!(e, CaptureEvent::Uploaded { .. }))
        .count();
    assert_eq!(uploaded, 2);
}
