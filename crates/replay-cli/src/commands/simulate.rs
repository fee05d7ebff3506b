//! `replayctl simulate`: drive the engine from a scripted page timeline.
//!
//! A script is JSON lines, one step per line, e.g.
//!
//! ```text
//! {"step": "start_session"}
//! {"step": "advance", "ms": 6000}
//! {"step": "click"}
//! {"step": "error", "id": "4c1f"}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped. Time only moves on
//! `advance`; every timer that falls inside the advanced span fires at its
//! own deadline.

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use replay_core::{
    Breadcrumb, Clock, EngineStatus, FlushOptions, ManualClock, RecordingMode, ReplayEngine,
    ReplayId, ReplayOptions, ScriptedCapture, SegmentUpload, SessionStore, Transport,
    TransportError, Visibility,
};
use replay_store::SqliteSessionStore;
use replay_transport::HttpTransport;
use serde::{Deserialize, Serialize};

use crate::{Config, SimulateArgs};

/// Upper bound on timer firings within a single step.
const MAX_TICKS_PER_STEP: usize = 10_000;

/// One line of a timeline script.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    Start,
    StartSession,
    StartBuffering,
    Stop,
    /// Moves the clock forward, firing due timers on the way.
    Advance {
        ms: u32,
    },
    Click,
    Keydown,
    Mutation {
        count: usize,
    },
    Breadcrumb {
        category: String,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
    Error {
        id: String,
    },
    Hidden,
    Visible,
    Blur,
    Focus,
    Flush {
        #[serde(default = "default_continue")]
        continue_recording: bool,
    },
    SetErrorSampleRate {
        rate: f64,
    },
}

const fn default_continue() -> bool {
    true
}

/// Parses a script, reporting the line of the first bad step.
pub fn parse_script(text: &str) -> Result<Vec<Step>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(index, line)| {
            serde_json::from_str(line).with_context(|| format!("invalid step on line {}", index + 1))
        })
        .collect()
}

/// What happened to one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentReport {
    pub replay_id: ReplayId,
    pub segment_id: u32,
    pub mode: RecordingMode,
    pub events: usize,
    pub bytes: usize,
    pub error_ids: Vec<String>,
    /// Delivery failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulationReport {
    pub replay_id: Option<ReplayId>,
    pub status: EngineStatus,
    pub mode: Option<RecordingMode>,
    pub segments: Vec<SegmentReport>,
}

/// Lists every segment, forwarding to an upstream transport when one is set.
struct ReportingTransport {
    upstream: Option<Arc<dyn Transport>>,
    reports: Mutex<Vec<SegmentReport>>,
}

impl ReportingTransport {
    fn new(upstream: Option<Arc<dyn Transport>>) -> Self {
        Self {
            upstream,
            reports: Mutex::new(Vec::new()),
        }
    }

    fn reports(&self) -> Vec<SegmentReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Transport for ReportingTransport {
    async fn send(&self, upload: SegmentUpload) -> Result<(), TransportError> {
        let mut report = SegmentReport {
            replay_id: upload.replay_id.clone(),
            segment_id: upload.segment_id,
            mode: upload.mode,
            events: upload.payload.event_count,
            bytes: upload.payload.bytes.len(),
            error_ids: upload.error_ids.clone(),
            error: None,
        };

        let result = match &self.upstream {
            Some(upstream) => upstream.send(upload).await,
            None => Ok(()),
        };
        if let Err(e) = &result {
            report.error = Some(e.to_string());
        }

        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report);
        result
    }
}

pub fn run<W: Write>(writer: &mut W, config: &Config, args: &SimulateArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.script)
        .with_context(|| format!("failed to read {}", args.script.display()))?;
    let steps = parse_script(&text)?;

    let store = SqliteSessionStore::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;

    let upstream = match args.endpoint.as_deref().or(config.endpoint.as_deref()) {
        Some(endpoint) => {
            let transport = HttpTransport::new(endpoint).context("failed to create HTTP transport")?;
            Some(Arc::new(transport) as Arc<dyn Transport>)
        }
        None => None,
    };

    let runtime = tokio::runtime::Runtime::new().context("failed to initialize tokio runtime")?;
    let report = runtime.block_on(simulate(
        config.replay.clone(),
        Arc::new(store),
        upstream,
        Utc::now(),
        &steps,
    ));

    if args.json {
        serde_json::to_writer_pretty(&mut *writer, &report)?;
        writeln!(writer)?;
    } else {
        write!(writer, "{}", format_report(&report))?;
    }
    Ok(())
}

/// Runs `steps` as one page load starting at `start`.
pub async fn simulate(
    options: ReplayOptions,
    store: Arc<dyn SessionStore>,
    upstream: Option<Arc<dyn Transport>>,
    start: DateTime<Utc>,
    steps: &[Step],
) -> SimulationReport {
    let clock = Arc::new(ManualClock::new(start));
    let capture = Arc::new(ScriptedCapture::new(clock.clone()));
    let transport = Arc::new(ReportingTransport::new(upstream));
    let engine = ReplayEngine::builder(options, capture.clone(), transport.clone())
        .clock(clock.clone())
        .store(store)
        .build();

    for step in steps {
        tracing::debug!(?step, at = %clock.now(), "applying step");
        apply_step(&engine, &clock, &capture, step).await;
        engine.tick().await;
    }

    SimulationReport {
        replay_id: engine.session().map(|session| session.id),
        status: engine.status(),
        mode: engine.recording_mode(),
        segments: transport.reports(),
    }
}

async fn apply_step(
    engine: &ReplayEngine,
    clock: &ManualClock,
    capture: &ScriptedCapture,
    step: &Step,
) {
    match step {
        Step::Start => engine.start(),
        Step::StartSession => engine.start_session(),
        Step::StartBuffering => engine.start_buffering(),
        Step::Stop => engine.stop(),
        Step::Advance { ms } => {
            advance(engine, clock, Duration::milliseconds(i64::from(*ms))).await;
        }
        Step::Click => {
            engine.trigger_user_activity();
            engine.add_event(Breadcrumb::new("ui.click", clock.now()));
        }
        Step::Keydown => {
            engine.update_user_activity();
            engine.add_event(Breadcrumb::new("ui.keyDown", clock.now()));
        }
        Step::Mutation { count } => {
            capture.emit_mutations(*count);
        }
        Step::Breadcrumb {
            category,
            message,
            data,
        } => {
            let mut breadcrumb = Breadcrumb::new(category.clone(), clock.now());
            breadcrumb.message.clone_from(message);
            breadcrumb.data.clone_from(data);
            engine.add_event(breadcrumb);
        }
        Step::Error { id } => engine.capture_error(id.clone()).await,
        Step::Hidden => engine.on_visibility_change(Visibility::Hidden),
        Step::Visible => engine.on_visibility_change(Visibility::Visible),
        Step::Blur => engine.on_blur(),
        Step::Focus => engine.on_focus(),
        Step::Flush { continue_recording } => {
            engine
                .flush(FlushOptions {
                    continue_recording: *continue_recording,
                })
                .await;
        }
        Step::SetErrorSampleRate { rate } => engine.set_error_sample_rate(*rate),
    }
}

/// Moves the clock by `by`, firing each timer at its deadline.
async fn advance(engine: &ReplayEngine, clock: &ManualClock, by: Duration) {
    let target = clock.now() + by;
    let mut ticks = 0;
    while let Some(at) = engine.next_wakeup() {
        if at > target {
            break;
        }
        if ticks == MAX_TICKS_PER_STEP {
            tracing::warn!(ticks, "timers keep firing, skipping to the end of the step");
            break;
        }
        if at > clock.now() {
            clock.set(at);
        }
        engine.tick().await;
        ticks += 1;
    }
    if target > clock.now() {
        clock.set(target);
    }
}

pub fn format_report(report: &SimulationReport) -> String {
    let replay_id = report
        .replay_id
        .as_ref()
        .map_or("none", ReplayId::as_str);
    let mut output = format!("Replay: {replay_id}\n");
    match report.mode {
        Some(mode) => output.push_str(&format!("Status: {} ({mode})\n", report.status)),
        None => output.push_str(&format!("Status: {}\n", report.status)),
    }

    if report.segments.is_empty() {
        output.push_str("No segments sent.\n");
        return output;
    }

    output.push_str("Segments:\n");
    for segment in &report.segments {
        output.push_str(&format!(
            "- #{} {}: {} events, {} bytes",
            segment.segment_id, segment.mode, segment.events, segment.bytes
        ));
        if !segment.error_ids.is_empty() {
            output.push_str(&format!(", errors: {}", segment.error_ids.join(", ")));
        }
        if let Some(error) = &segment.error {
            output.push_str(&format!(" [failed: {error}]"));
        }
        output.push('\n');
    }
    output
}
