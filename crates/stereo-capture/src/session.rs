//! The live depth loop.
//!
//! Each [`DepthSession::tick`] grabs both cameras, then retrieves both
//! frames, rectifies them through the loaded [`StereoRig`], runs the matcher,
//! presents the configured view and applies operator commands. Captures are
//! handed to the [`CaptureWorker`] so the loop never waits on encoding,
//! signing or the network.

use crate::signer::{HmacSigner, SignError, Signer};
use crate::transport::{HttpTransport, Transport, DEFAULT_SERVER_URL};
use crate::worker::{CaptureEvent, CaptureJob, CaptureWorker};
use image::RgbImage;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use stereo_depth::{DisparityField, SgbmError, SgbmMatcher, SgbmParams, ViewSet, VisualStyle, Visualizer};
use stereo_pipeline::StereoRig;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The source has no more frames; ends the session.
    #[error("frame source exhausted")]
    Exhausted,
    #[error("{0}")]
    Device(String),
}

/// One camera. Implementations should keep at most one buffered frame so
/// `grab` always latches the newest exposure.
pub trait FrameSource {
    /// Latch a frame without decoding it.
    fn grab(&mut self) -> Result<(), SourceError>;
    /// Decode the frame latched by the last `grab`.
    fn retrieve(&mut self) -> Result<RgbImage, SourceError>;
}

pub trait Presenter {
    fn present(&mut self, view: &RgbImage);
}

pub trait OperatorInput {
    /// Next pending command, if any.
    fn poll(&mut self) -> Option<OperatorCommand>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    Capture,
    /// Save the presented view as a JPEG next to the captures.
    Screenshot,
    Quit,
    SwapCameras,
    BlendUp,
    BlendDown,
    SetStyle(VisualStyle),
    /// Replace the matcher between frames.
    SetMatcher(SgbmParams),
    /// Skip uploads of captures queued so far. Their records are still saved.
    CancelUploads,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub matcher: SgbmParams,
    pub visualizer: Visualizer,
    pub swap_cameras: bool,
    /// Capture records and screenshots land here.
    pub output_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            matcher: SgbmParams::default(),
            visualizer: Visualizer::default(),
            swap_cameras: false,
            output_dir: PathBuf::from("."),
        }
    }
}

/// Signing and upload settings, resolved by the caller from its environment.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvenanceConfig {
    #[serde(skip_serializing)]
    pub signing_key: Option<String>,
    pub server_url: String,
    /// Upload each record after saving it.
    pub upload: bool,
}

impl std::fmt::Debug for ProvenanceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvenanceConfig")
            .field("signing_key", &self.signing_key.as_ref().map(|_| "<redacted>"))
            .field("server_url", &self.server_url)
            .field("upload", &self.upload)
            .finish()
    }
}

impl Default for ProvenanceConfig {
    fn default() -> Self {
        Self {
            signing_key: None,
            server_url: DEFAULT_SERVER_URL.to_owned(),
            upload: true,
        }
    }
}

impl ProvenanceConfig {
    pub fn signer(&self) -> Result<Option<HmacSigner>, SignError> {
        match self.signing_key.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(key) => HmacSigner::from_secret(key).map(Some),
        }
    }

    pub fn transport(&self) -> Option<HttpTransport> {
        self.upload.then(|| HttpTransport::new(&self.server_url))
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Matcher(#[from] SgbmError),
    #[error(transparent)]
    Signer(#[from] SignError),
    #[error("{side} frame is {got:?}, calibration expects {expected:?}")]
    FrameSize {
        side: &'static str,
        got: (u32, u32),
        expected: (u32, u32),
    },
    #[error("output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-frame summary returned by [`DepthSession::tick`].
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSummary {
    pub index: u64,
    /// Fraction of pixels with a positive disparity.
    pub coverage: f64,
    pub captures_requested: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Processed(FrameSummary),
    /// A grab or retrieve failed; the frame was dropped.
    Skipped(String),
    EndOfStream,
    Quit,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSummary {
    pub frames: u64,
    pub skipped: u64,
    pub events: Vec<CaptureEvent>,
}

struct LastFrame {
    views: ViewSet,
    disparity: DisparityField,
}

pub struct DepthSession {
    rig: StereoRig,
    left: Box<dyn FrameSource>,
    right: Box<dyn FrameSource>,
    matcher: SgbmMatcher,
    visualizer: Visualizer,
    swap_cameras: bool,
    output_dir: PathBuf,
    worker: CaptureWorker,
    last: Option<LastFrame>,
    frames: u64,
    skipped: u64,
    events: Vec<CaptureEvent>,
}

impl DepthSession {
    pub fn new(
        rig: StereoRig,
        left: Box<dyn FrameSource>,
        right: Box<dyn FrameSource>,
        config: SessionConfig,
        provenance: &ProvenanceConfig,
    ) -> Result<Self, SessionError> {
        let signer = provenance.signer()?.map(|s| Box::new(s) as Box<dyn Signer>);
        if signer.is_none() {
            warn!("no signing key configured, captures will be unsigned");
        }
        let transport = provenance.transport().map(|t| Box::new(t) as Box<dyn Transport>);
        Self::with_worker_parts(rig, left, right, config, signer, transport)
    }

    /// Like [`DepthSession::new`] with an explicit signer and transport.
    pub fn with_worker_parts(
        rig: StereoRig,
        left: Box<dyn FrameSource>,
        right: Box<dyn FrameSource>,
        config: SessionConfig,
        signer: Option<Box<dyn Signer>>,
        transport: Option<Box<dyn Transport>>,
    ) -> Result<Self, SessionError> {
        let matcher = SgbmMatcher::new(config.matcher)?;
        std::fs::create_dir_all(&config.output_dir).map_err(|source| SessionError::OutputDir {
            path: config.output_dir.clone(),
            source,
        })?;
        let worker = CaptureWorker::spawn(config.output_dir.clone(), signer, transport);
        Ok(Self {
            rig,
            left,
            right,
            matcher,
            visualizer: config.visualizer,
            swap_cameras: config.swap_cameras,
            output_dir: config.output_dir,
            worker,
            last: None,
            frames: 0,
            skipped: 0,
            events: Vec::new(),
        })
    }

    pub fn visualizer(&self) -> &Visualizer {
        &self.visualizer
    }

    pub fn matcher(&self) -> &SgbmMatcher {
        &self.matcher
    }

    pub fn swap_cameras(&self) -> bool {
        self.swap_cameras
    }

    /// Disparities of the most recent processed frame.
    pub fn last_disparity(&self) -> Option<&DisparityField> {
        self.last.as_ref().map(|f| &f.disparity)
    }

    fn acquire(&mut self) -> Result<(RgbImage, RgbImage), SourceError> {
        self.left.grab()?;
        self.right.grab()?;
        let left = self.left.retrieve()?;
        let right = self.right.retrieve()?;
        Ok(if self.swap_cameras { (right, left) } else { (left, right) })
    }

    pub fn tick(
        &mut self,
        input: &mut dyn OperatorInput,
        presenter: &mut dyn Presenter,
    ) -> Result<TickOutcome, SessionError> {
        self.collect_events();
        let (left, right) = match self.acquire() {
            Ok(pair) => pair,
            Err(SourceError::Exhausted) => return Ok(TickOutcome::EndOfStream),
            Err(e) => {
                warn!("frame dropped: {e}");
                self.skipped += 1;
                return Ok(TickOutcome::Skipped(e.to_string()));
            }
        };
        let size = self.rig.image_size();
        let expected = (size.width, size.height);
        for (side, img) in [("left", &left), ("right", &right)] {
            if img.dimensions() != expected {
                return Err(SessionError::FrameSize {
                    side,
                    got: img.dimensions(),
                    expected,
                });
            }
        }

        let (rect_l, rect_r) = self.rig.rectify(&left, &right);
        let disparity = self.matcher.compute_rgb(&rect_l, &rect_r)?;
        let views = self.visualizer.views(&rect_l, &rect_r, &disparity);
        presenter.present(&views.render(self.visualizer.style));
        let coverage = disparity.positive_fraction();
        self.frames += 1;
        self.last = Some(LastFrame { views, disparity });

        let mut captures_requested = 0;
        while let Some(command) = input.poll() {
            match command {
                OperatorCommand::Quit => return Ok(TickOutcome::Quit),
                OperatorCommand::Capture => {
                    self.capture();
                    captures_requested += 1;
                }
                other => self.apply(other),
            }
        }
        Ok(TickOutcome::Processed(FrameSummary {
            index: self.frames,
            coverage,
            captures_requested,
        }))
    }

    fn apply(&mut self, command: OperatorCommand) {
        match command {
            OperatorCommand::SwapCameras => {
                self.swap_cameras = !self.swap_cameras;
                info!("camera swap {}", if self.swap_cameras { "on" } else { "off" });
            }
            OperatorCommand::BlendUp => {
                self.visualizer.increase_blend();
                info!("blend strength {:.0}%", self.visualizer.blend * 100.0);
            }
            OperatorCommand::BlendDown => {
                self.visualizer.decrease_blend();
                info!("blend strength {:.0}%", self.visualizer.blend * 100.0);
            }
            OperatorCommand::SetStyle(style) => self.visualizer.style = style,
            OperatorCommand::SetMatcher(params) => match SgbmMatcher::new(params) {
                Ok(m) => {
                    debug!("matcher replaced: {params:?}");
                    self.matcher = m;
                }
                Err(e) => warn!("matcher parameters rejected: {e}"),
            },
            OperatorCommand::Screenshot => self.screenshot(),
            OperatorCommand::CancelUploads => {
                self.worker.cancel();
                info!("pending uploads cancelled");
            }
            OperatorCommand::Capture | OperatorCommand::Quit => {}
        }
    }

    fn capture(&mut self) {
        let Some(last) = &self.last else {
            return;
        };
        let job = CaptureJob {
            timestamp: unix_seconds(),
            base: last.views.left.clone(),
            composite: last.views.capture_composite(),
            disparity: last.disparity.clone(),
        };
        info!("capture {} queued", job.timestamp);
        if let Err(e) = self.worker.submit(job) {
            warn!("capture dropped: {e}");
        }
    }

    fn screenshot(&self) {
        let Some(last) = &self.last else {
            return;
        };
        let path = self.output_dir.join(format!("stereo_5view_{}.jpg", unix_seconds()));
        match last.views.panel().save(&path) {
            Ok(()) => info!("saved screenshot {}", path.display()),
            Err(e) => warn!("screenshot {} failed: {e}", path.display()),
        }
    }

    fn collect_events(&mut self) {
        for event in self.worker.poll() {
            log_event(&event);
            self.events.push(event);
        }
    }

    /// Tick until the operator quits or a source runs dry, then wait for
    /// outstanding captures.
    pub fn run(
        mut self,
        input: &mut dyn OperatorInput,
        presenter: &mut dyn Presenter,
    ) -> Result<SessionSummary, SessionError> {
        loop {
            match self.tick(input, presenter)? {
                TickOutcome::Quit | TickOutcome::EndOfStream => break,
                TickOutcome::Processed(_) | TickOutcome::Skipped(_) => {}
            }
        }
        self.finish()
    }

    pub fn finish(mut self) -> Result<SessionSummary, SessionError> {
        self.collect_events();
        let DepthSession {
            worker,
            mut events,
            frames,
            skipped,
            ..
        } = self;
        for event in worker.shutdown() {
            log_event(&event);
            events.push(event);
        }
        info!("session ended after {frames} frames ({skipped} dropped)");
        Ok(SessionSummary {
            frames,
            skipped,
            events,
        })
    }
}

fn log_event(event: &CaptureEvent) {
    match event {
        CaptureEvent::Failed { timestamp, error } => warn!("capture {timestamp} failed: {error}"),
        CaptureEvent::Cancelled { timestamp, path } => {
            info!("capture {timestamp} kept at {} without upload", path.display())
        }
        other => debug!("{other:?}"),
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Frames from a sorted list of image files; one file per `grab`.
#[derive(Debug, Clone)]
pub struct ImageSequenceSource {
    paths: Vec<PathBuf>,
    next: usize,
    latched: Option<PathBuf>,
}

impl ImageSequenceSource {
    pub fn new(mut paths: Vec<PathBuf>) -> Self {
        paths.sort();
        Self {
            paths,
            next: 0,
            latched: None,
        }
    }

    /// `<prefix>*.{png,jpg,jpeg}` in `dir`.
    pub fn from_dir(dir: &Path, prefix: &str) -> std::io::Result<Self> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let matches = path.file_name().and_then(|n| n.to_str()).is_some_and(|name| {
                let lower = name.to_ascii_lowercase();
                name.starts_with(prefix)
                    && (lower.ends_with(".png") || lower.ends_with(".jpg") || lower.ends_with(".jpeg"))
            });
            if matches {
                paths.push(path);
            }
        }
        Ok(Self::new(paths))
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageSequenceSource {
    fn grab(&mut self) -> Result<(), SourceError> {
        let path = self.paths.get(self.next).ok_or(SourceError::Exhausted)?;
        self.latched = Some(path.clone());
        self.next += 1;
        Ok(())
    }

    fn retrieve(&mut self) -> Result<RgbImage, SourceError> {
        let path = self
            .latched
            .take()
            .ok_or_else(|| SourceError::Device("retrieve without grab".into()))?;
        image::open(&path)
            .map(|img| img.to_rgb8())
            .map_err(|e| SourceError::Device(format!("{}: {e}", path.display())))
    }
}

/// Replays a fixed list of commands, one batch per tick.
#[derive(Debug, Clone, Default)]
pub struct ScriptedInput {
    batches: VecDeque<Vec<OperatorCommand>>,
    pending: VecDeque<OperatorCommand>,
    in_batch: bool,
}

impl ScriptedInput {
    pub fn new(batches: Vec<Vec<OperatorCommand>>) -> Self {
        Self {
            batches: batches.into(),
            pending: VecDeque::new(),
            in_batch: false,
        }
    }
}

impl OperatorInput for ScriptedInput {
    fn poll(&mut self) -> Option<OperatorCommand> {
        if !self.in_batch {
            self.pending = self.batches.pop_front().unwrap_or_default().into();
            self.in_batch = true;
        }
        let next = self.pending.pop_front();
        if next.is_none() {
            self.in_batch = false;
        }
        next
    }
}
