//! Simulated capture → processing → transcription → storage pipeline.
//!
//! Each stage is a lifecycle-managed component that owns one worker thread.
//! Buffers move between stages as `ResourceHandle`s over bounded channels;
//! whoever holds a handle last returns it to the pool.
//!
//! ```text
//! capture-N ─(audio)─► processing-N ─(signal)─► transcription-N ─(transcript)─┐
//!                                                                              ├─► storage
//! capture-M ─(audio)─► processing-M ─(signal)─► transcription-M ─(transcript)─┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use cadence_core::thread::WorkerStatus;
use cadence_core::{
    Activity, ChannelId, CleanupTask, Component, ComponentKind, HealthStatus, ResourceHandle,
    ResourceKind, Result, Runtime, State, WorkerContext, WorkerId,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::settings::HostSettings;

/// Frames in flight between two stages.
const QUEUE_DEPTH: usize = 32;
/// Empty polls before a relay reports itself idle.
const IDLE_AFTER_POLLS: u32 = 5;
/// Bound on how long a stage waits for its worker to exit.
const STOP_DEADLINE: Duration = Duration::from_millis(1_000);

#[derive(Debug, Default)]
pub struct StageStats {
    frames: AtomicU64,
    bytes: AtomicU64,
    dropped: AtomicU64,
    alloc_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSummary {
    pub name: String,
    pub frames: u64,
    pub bytes: u64,
    pub dropped: u64,
    pub alloc_failures: u64,
}

enum Role {
    Capture {
        out: Sender<ResourceHandle>,
    },
    Relay {
        input: Receiver<ResourceHandle>,
        out: Sender<ResourceHandle>,
        produces: ResourceKind,
    },
    Sink {
        input: Receiver<ResourceHandle>,
    },
}

impl Role {
    fn input(&self) -> Option<&Receiver<ResourceHandle>> {
        match self {
            Role::Capture { .. } => None,
            Role::Relay { input, .. } | Role::Sink { input } => Some(input),
        }
    }
}

/// One pipeline stage. The worker is spawned in `initialize` and stopped in
/// `shutdown`.
pub struct Stage {
    name: String,
    channel: Option<ChannelId>,
    runtime: Weak<Runtime>,
    role: Role,
    interval: Duration,
    stats: Arc<StageStats>,
    worker: Option<WorkerId>,
}

impl Stage {
    fn new(
        name: String,
        channel: Option<ChannelId>,
        runtime: &Arc<Runtime>,
        role: Role,
        interval: Duration,
    ) -> Self {
        Self {
            name,
            channel,
            runtime: Arc::downgrade(runtime),
            role,
            interval,
            stats: Arc::new(StageStats::default()),
            worker: None,
        }
    }

    fn spawn(&self, rt: &Runtime) -> Result<WorkerId> {
        let name = self.name.clone();
        let channel = self.channel;
        let weak = self.runtime.clone();
        let stats = Arc::clone(&self.stats);
        let interval = self.interval;

        match &self.role {
            Role::Capture { out } => {
                let out = out.clone();
                rt.spawn_worker(&self.name, Some(&self.name), move |ctx| {
                    capture_loop(ctx, weak, &name, channel, out, stats, interval)
                })
            }
            Role::Relay {
                input,
                out,
                produces,
            } => {
                let (input, out, produces) = (input.clone(), out.clone(), *produces);
                rt.spawn_worker(&self.name, Some(&self.name), move |ctx| {
                    relay_loop(ctx, weak, &name, channel, input, out, produces, stats, interval)
                })
            }
            Role::Sink { input } => {
                let input = input.clone();
                rt.spawn_worker(&self.name, Some(&self.name), move |ctx| {
                    sink_loop(ctx, weak, &name, input, stats, interval)
                })
            }
        }
    }
}

impl Component for Stage {
    fn initialize(&mut self) -> Result<()> {
        let rt = self
            .runtime
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("runtime dropped before {} started", self.name))?;
        self.worker = Some(self.spawn(&rt)?);
        info!(stage = %self.name, "stage started");
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(id) = self.worker.take() else {
            return Ok(());
        };
        let Some(rt) = self.runtime.upgrade() else {
            return Ok(());
        };
        if !stop_and_wait(&rt, id, STOP_DEADLINE)? {
            return Err(anyhow::anyhow!("worker of {} did not exit", self.name).into());
        }
        // The worker drained on exit; anything sent since is ours to return.
        if let Some(input) = self.role.input() {
            release_all(&rt, input.try_iter(), &self.stats);
        }
        info!(stage = %self.name, "stage stopped");
        Ok(())
    }

    fn health(&self) -> HealthStatus {
        let frames = self.stats.frames.load(Ordering::Relaxed);
        let lost =
            self.stats.dropped.load(Ordering::Relaxed) + self.stats.alloc_failures.load(Ordering::Relaxed);
        if lost == 0 {
            HealthStatus::Healthy
        } else if lost * 10 < frames.max(1) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Failed
        }
    }
}

/// Built pipeline: per-stage counters and the capture stage names.
pub struct Pipeline {
    stats: Vec<(String, Arc<StageStats>)>,
    pub captures: Vec<String>,
}

impl Pipeline {
    pub fn summaries(&self) -> Vec<StageSummary> {
        self.stats
            .iter()
            .map(|(name, s)| StageSummary {
                name: name.clone(),
                frames: s.frames.load(Ordering::Relaxed),
                bytes: s.bytes.load(Ordering::Relaxed),
                dropped: s.dropped.load(Ordering::Relaxed),
                alloc_failures: s.alloc_failures.load(Ordering::Relaxed),
            })
            .collect()
    }
}

/// Register every stage as a managed component plus one channel-scoped
/// cleanup task per channel that pauses its capture before teardown.
pub fn build(rt: &Arc<Runtime>, settings: &HostSettings) -> Result<Pipeline> {
    let interval = Duration::from_millis(settings.frame_interval_ms);
    let (transcript_tx, transcript_rx) = crossbeam_channel::bounded(QUEUE_DEPTH * 2);
    let mut stats = Vec::new();
    let mut captures = Vec::new();
    let mut transcribers = Vec::new();

    for ch in 0..settings.channels {
        let (audio_tx, audio_rx) = crossbeam_channel::bounded(QUEUE_DEPTH);
        let (signal_tx, signal_rx) = crossbeam_channel::bounded(QUEUE_DEPTH);
        let capture = format!("capture-{ch}");
        let processing = format!("processing-{ch}");
        let transcription = format!("transcription-{ch}");

        let stages = [
            (
                capture.clone(),
                ComponentKind::Capture,
                Role::Capture { out: audio_tx },
                Vec::new(),
            ),
            (
                processing.clone(),
                ComponentKind::Processing,
                Role::Relay {
                    input: audio_rx,
                    out: signal_tx,
                    produces: ResourceKind::Signal,
                },
                vec![capture.clone()],
            ),
            (
                transcription.clone(),
                ComponentKind::Transcription,
                Role::Relay {
                    input: signal_rx,
                    out: transcript_tx.clone(),
                    produces: ResourceKind::Transcript,
                },
                vec![processing.clone()],
            ),
        ];
        for (name, kind, role, deps) in stages {
            let stage = Stage::new(name.clone(), Some(ch), rt, role, interval);
            stats.push((name.clone(), Arc::clone(&stage.stats)));
            let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
            rt.register_managed(&name, kind, Some(ch), Box::new(stage), &deps)?;
        }

        let weak = Arc::downgrade(rt);
        let name = capture.clone();
        rt.register_cleanup_task(
            CleanupTask::new(&format!("pause-capture-{ch}"), move || {
                let Some(rt) = weak.upgrade() else {
                    return Ok(());
                };
                match rt.get_component_state(&name)? {
                    State::Running(Activity::Paused) => Ok(()),
                    State::Running(_) => rt.transition_state(&name, State::Running(Activity::Paused)),
                    _ => Ok(()),
                }
            })
            .on_channel(ch),
        )?;

        captures.push(capture);
        transcribers.push(transcription);
    }

    let storage = Stage::new(
        "storage".to_string(),
        None,
        rt,
        Role::Sink {
            input: transcript_rx,
        },
        interval,
    );
    stats.push(("storage".to_string(), Arc::clone(&storage.stats)));
    let deps: Vec<&str> = transcribers.iter().map(String::as_str).collect();
    rt.register_managed("storage", ComponentKind::Storage, None, Box::new(storage), &deps)?;

    Ok(Pipeline { stats, captures })
}

// ── Worker bodies ────────────────────────────────────────────────────────

fn capture_loop(
    ctx: WorkerContext,
    weak: Weak<Runtime>,
    name: &str,
    channel: Option<ChannelId>,
    out: Sender<ResourceHandle>,
    stats: Arc<StageStats>,
    interval: Duration,
) {
    let mut phase: u8 = 0;
    ctx.heartbeat();
    while ctx.idle(interval) {
        let Some(rt) = weak.upgrade() else { break };
        ctx.heartbeat();
        if rt.get_component_state(name).ok() == Some(State::Running(Activity::Paused)) {
            continue;
        }

        let size = rt.resources().target_buffer_size();
        let mut frame = match rt.allocate_resource(name, ResourceKind::Audio, size, channel) {
            Ok(frame) => frame,
            Err(e) => {
                stats.alloc_failures.fetch_add(1, Ordering::Relaxed);
                debug!(stage = name, "capture allocation failed: {e}");
                continue;
            }
        };
        phase = phase.wrapping_add(1);
        frame.as_mut_slice().fill(phase);
        stats.frames.fetch_add(1, Ordering::Relaxed);
        stats.bytes.fetch_add(size as u64, Ordering::Relaxed);
        forward(&rt, &out, frame, &stats);
    }
    debug!(stage = name, "capture worker exiting");
}

#[allow(clippy::too_many_arguments)]
fn relay_loop(
    ctx: WorkerContext,
    weak: Weak<Runtime>,
    name: &str,
    channel: Option<ChannelId>,
    input: Receiver<ResourceHandle>,
    out: Sender<ResourceHandle>,
    produces: ResourceKind,
    stats: Arc<StageStats>,
    interval: Duration,
) {
    let mut empty_polls = 0u32;
    let mut activity = Activity::Active;
    ctx.heartbeat();
    while !ctx.should_stop() {
        ctx.heartbeat();
        let received = input.recv_timeout(interval);
        let Some(rt) = weak.upgrade() else { break };
        let frame = match received {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => {
                empty_polls += 1;
                if empty_polls >= IDLE_AFTER_POLLS && activity == Activity::Active {
                    activity = set_activity(&rt, name, Activity::Idle);
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        empty_polls = 0;
        if activity == Activity::Idle {
            activity = set_activity(&rt, name, Activity::Active);
        }

        // Transcripts are far smaller than the signal they came from.
        let size = match produces {
            ResourceKind::Transcript => (frame.size() / 64).max(1),
            _ => frame.size(),
        };
        match rt.allocate_resource(name, produces, size, channel) {
            Ok(mut next) => {
                let src = frame.as_slice();
                for (i, byte) in next.as_mut_slice().iter_mut().enumerate() {
                    *byte = src.get(i).copied().unwrap_or(0).wrapping_mul(3);
                }
                stats.frames.fetch_add(1, Ordering::Relaxed);
                stats.bytes.fetch_add(size as u64, Ordering::Relaxed);
                forward(&rt, &out, next, &stats);
            }
            Err(e) => {
                stats.alloc_failures.fetch_add(1, Ordering::Relaxed);
                debug!(stage = name, "relay allocation failed: {e}");
            }
        }
        if let Err(e) = rt.deallocate_resource(frame) {
            warn!(stage = name, "could not return input frame: {e}");
        }
    }

    if let Some(rt) = weak.upgrade() {
        release_all(&rt, input.try_iter(), &stats);
    }
    debug!(stage = name, "relay worker exiting");
}

fn sink_loop(
    ctx: WorkerContext,
    weak: Weak<Runtime>,
    name: &str,
    input: Receiver<ResourceHandle>,
    stats: Arc<StageStats>,
    interval: Duration,
) {
    ctx.heartbeat();
    while !ctx.should_stop() {
        ctx.heartbeat();
        let received = input.recv_timeout(interval);
        let Some(rt) = weak.upgrade() else { break };
        match received {
            Ok(transcript) => {
                stats.frames.fetch_add(1, Ordering::Relaxed);
                stats.bytes.fetch_add(transcript.size() as u64, Ordering::Relaxed);
                if let Err(e) = rt.deallocate_resource(transcript) {
                    warn!(stage = name, "could not return transcript: {e}");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Some(rt) = weak.upgrade() {
        release_all(&rt, input.try_iter(), &stats);
    }
    debug!(stage = name, "storage worker exiting");
}

// ── Helpers ──────────────────────────────────────────────────────────────

/// Hand `frame` downstream; a full or closed queue drops it back into the pool.
fn forward(rt: &Runtime, out: &Sender<ResourceHandle>, frame: ResourceHandle, stats: &StageStats) {
    match out.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(frame)) | Err(TrySendError::Disconnected(frame)) => {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = rt.deallocate_resource(frame) {
                warn!("could not return dropped frame: {e}");
            }
        }
    }
}

fn release_all(rt: &Runtime, frames: impl Iterator<Item = ResourceHandle>, stats: &StageStats) {
    for frame in frames {
        stats.dropped.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = rt.deallocate_resource(frame) {
            warn!("could not return queued frame: {e}");
        }
    }
}

fn set_activity(rt: &Runtime, name: &str, activity: Activity) -> Activity {
    // Only the lifecycle pass moves a stage in or out of Running.
    match rt.get_component_state(name) {
        Ok(State::Running(current)) if current != activity => {
            match rt.transition_state(name, State::Running(activity)) {
                Ok(()) => activity,
                Err(e) => {
                    debug!(stage = name, ?activity, "activity change refused: {e}");
                    current
                }
            }
        }
        Ok(State::Running(current)) => current,
        _ => Activity::Active,
    }
}

/// Request a stop for `id` and poll until its thread finished.
fn stop_and_wait(rt: &Runtime, id: WorkerId, deadline: Duration) -> Result<bool> {
    if !rt.threads().stop(id)? {
        return Ok(true);
    }
    let until = Instant::now() + deadline;
    loop {
        let running = rt
            .threads()
            .workers()?
            .iter()
            .any(|w| w.id == id && w.status != WorkerStatus::Finished);
        if !running {
            return Ok(true);
        }
        if Instant::now() >= until {
            return Ok(false);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
