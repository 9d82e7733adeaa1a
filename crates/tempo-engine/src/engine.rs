//! Playback engine: session lifecycle on top of the processing graph.
//!
//! `start` hands work to a session thread and returns immediately. Sessions are
//! serialized: each one cancels and joins its predecessor before touching the
//! scratch file, and every mutation of the player node happens under the session
//! lock after checking that the session's generation is still current. A superseded
//! session can therefore never schedule audio over a newer one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded, unbounded};
use tempo_types::{EngineState, EngineStatus, PlaybackEndReason, TempoStatus};

use crate::config::{EngineConfig, OutputBackend};
use crate::decode;
use crate::error::{EngineError, Result};
use crate::export::{self, ExportError, Exporter};
use crate::graph::PlaybackGraph;
use crate::output::{AudioOutput, CpalOutput, NullOutput};
use crate::queue;
use crate::scratch::ScratchArea;
use crate::source::SourceAsset;
use crate::status::{GraphCounters, SessionStatusState};
use crate::tempo::{PitchCompensation, PreservePitch, TempoState};

/// Callback buffer size requested from CPAL devices.
const PREFERRED_BUFFER_FRAMES: u32 = 512;

/// Grace period between the render queue running dry and the session ending.
const END_DRAIN: Duration = Duration::from_millis(100);

/// Lifecycle notifications for engine subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum PlaybackEvent {
    /// Audio for `generation` reached the output.
    Started { generation: u64, locator: String },
    /// `generation` played to the end of its file.
    Finished { generation: u64 },
    /// `generation` failed before or during playback.
    Failed { generation: u64, error: EngineError },
}

/// Completion handle for one `start` call.
pub struct StartHandle {
    generation: u64,
    rx: Receiver<Result<()>>,
}

impl StartHandle {
    /// Generation assigned to this session.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Block until the session is playing or has failed.
    pub fn wait(&self) -> Result<()> {
        self.rx.recv().unwrap_or_else(|_| Err(session_vanished()))
    }

    /// Like [`StartHandle::wait`] but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(session_vanished())),
        }
    }

    /// Non-blocking poll.
    pub fn try_result(&self) -> Option<Result<()>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(session_vanished())),
        }
    }
}

fn session_vanished() -> EngineError {
    EngineError::export("session ended without reporting a result")
}

struct SessionHandle {
    cancel: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

#[derive(Default)]
struct SessionSlot {
    status: SessionStatusState,
    current: Option<SessionHandle>,
}

struct TempoControl {
    state: TempoState,
    policy: Box<dyn PitchCompensation>,
}

struct Inner {
    graph: PlaybackGraph,
    exporter: Box<dyn Exporter>,
    scratch: ScratchArea,
    buffer_seconds: f32,
    session: Mutex<SessionSlot>,
    tempo: Mutex<TempoControl>,
    subscribers: Mutex<Vec<Sender<PlaybackEvent>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Builder for [`AudioPlaybackEngine`] with injectable backends.
pub struct EngineBuilder {
    config: EngineConfig,
    output: Option<Box<dyn AudioOutput>>,
    exporter: Option<Box<dyn Exporter>>,
    policy: Option<Box<dyn PitchCompensation>>,
}

impl EngineBuilder {
    /// Use `output` instead of the backend named in the config.
    pub fn output(mut self, output: Box<dyn AudioOutput>) -> Self {
        self.output = Some(output);
        self
    }

    /// Use `exporter` instead of the one implied by the export format.
    pub fn exporter(mut self, exporter: Box<dyn Exporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Initial pitch compensation policy (defaults to [`PreservePitch`]).
    pub fn pitch_compensation(mut self, policy: Box<dyn PitchCompensation>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn build(self) -> anyhow::Result<AudioPlaybackEngine> {
        let config = self.config;
        let exporter = self
            .exporter
            .unwrap_or_else(|| export::exporter_for(config.export_format, &config.ffmpeg_path));
        let output: Box<dyn AudioOutput> = match self.output {
            Some(output) => output,
            None => match config.output {
                OutputBackend::Cpal => Box::new(CpalOutput::new(
                    config.device.clone(),
                    PREFERRED_BUFFER_FRAMES,
                )),
                OutputBackend::Null => Box::new(NullOutput::new(48_000, 2)),
            },
        };
        let scratch_dir = config.resolved_scratch_dir();
        let scratch = ScratchArea::new(scratch_dir.clone(), exporter.format().extension())
            .map_err(|e| anyhow::anyhow!("scratch dir {}: {e}", scratch_dir.display()))?;
        tracing::info!(
            scratch = %scratch.dir().display(),
            format = ?exporter.format(),
            "engine ready"
        );

        let inner = Inner {
            graph: PlaybackGraph::new(output, config.playback.clone()),
            exporter,
            scratch,
            buffer_seconds: config.playback.buffer_seconds,
            session: Mutex::new(SessionSlot::default()),
            tempo: Mutex::new(TempoControl {
                state: TempoState::default(),
                policy: self.policy.unwrap_or_else(|| Box::new(PreservePitch)),
            }),
            subscribers: Mutex::new(Vec::new()),
        };
        Ok(AudioPlaybackEngine {
            inner: Arc::new(inner),
        })
    }
}

/// Plays one source at a time through player → varispeed → time-pitch → mixer.
pub struct AudioPlaybackEngine {
    inner: Arc<Inner>,
}

impl AudioPlaybackEngine {
    /// Build an engine with the backends named in `config`.
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            output: None,
            exporter: None,
            policy: None,
        }
    }

    /// Begin playing `locator`, superseding any current session.
    ///
    /// Returns at once; the handle reports when audio is flowing or why it is not.
    pub fn start(&self, locator: &str) -> StartHandle {
        let (tx, rx) = bounded(1);
        let cancel = Arc::new(AtomicBool::new(false));

        let mut slot = lock(&self.inner.session);
        slot.status.generation += 1;
        let generation = slot.status.generation;
        let previous = slot.current.take();
        if let Some(prev) = &previous {
            prev.cancel.store(true, Ordering::Relaxed);
        }
        slot.status.state = EngineState::Loading;
        slot.status.now_playing = Some(locator.to_string());
        slot.status.end_reason = None;
        tracing::info!(generation, locator, "session requested");

        let inner = self.inner.clone();
        let locator_owned = locator.to_string();
        let cancel_thread = cancel.clone();
        let spawned = thread::Builder::new()
            .name(format!("session-{generation}"))
            .spawn(move || {
                if let Some(prev) = previous {
                    let _ = prev.join.join();
                }
                inner.run_session(generation, &locator_owned, &cancel_thread, tx);
            });

        match spawned {
            Ok(join) => {
                slot.current = Some(SessionHandle { cancel, join });
            }
            Err(e) => {
                // The closure (and with it `tx`) is gone; report through a fresh channel.
                let error = EngineError::graph_start(format!("spawn session thread: {e}"));
                slot.status.clear_playback(PlaybackEndReason::Error);
                drop(slot);
                let (tx, rx) = bounded(1);
                let _ = tx.send(Err(error.clone()));
                self.inner
                    .emit(PlaybackEvent::Failed { generation, error });
                return StartHandle { generation, rx };
            }
        }
        StartHandle { generation, rx }
    }

    /// Halt playback, keeping the position. A no-op unless playing.
    pub fn pause(&self) {
        let mut slot = lock(&self.inner.session);
        if slot.status.state != EngineState::Playing {
            tracing::debug!(state = ?slot.status.state, "pause ignored");
            return;
        }
        self.inner.graph.pause();
        slot.status.state = EngineState::Paused;
        tracing::info!(generation = slot.status.generation, "paused");
    }

    /// Continue from where `pause` left off. A no-op unless paused.
    pub fn resume(&self) {
        let mut slot = lock(&self.inner.session);
        if slot.status.state != EngineState::Paused {
            tracing::debug!(state = ?slot.status.state, "resume ignored");
            return;
        }
        self.inner.graph.resume();
        slot.status.state = EngineState::Playing;
        tracing::info!(generation = slot.status.generation, "resumed");
    }

    /// Abandon the current session (loading or playing) and return to idle.
    pub fn stop(&self) {
        let mut slot = lock(&self.inner.session);
        // Invalidate whatever is in flight; the handle stays so the next start joins it.
        slot.status.generation += 1;
        if let Some(current) = &slot.current {
            current.cancel.store(true, Ordering::Relaxed);
        }
        self.inner.graph.stop_player();
        if slot.status.state != EngineState::Idle {
            slot.status.clear_playback(PlaybackEndReason::Stopped);
            tracing::info!("stopped");
        }
    }

    /// Set playback rate, compensating pitch with the active policy.
    ///
    /// Valid in every state; the value also applies to sessions started later.
    pub fn apply_tempo(&self, rate: f32) -> Result<()> {
        let mut tempo = lock(&self.inner.tempo);
        let state = TempoState::for_rate(rate, tempo.policy.as_ref())?;
        tempo.state = state;
        self.inner.graph.set_tempo(state);
        tracing::info!(rate = state.rate, pitch_cents = state.pitch_cents, "tempo applied");
        Ok(())
    }

    /// Swap the pitch compensation policy and re-apply the current rate under it.
    pub fn set_pitch_compensation(&self, policy: Box<dyn PitchCompensation>) {
        let mut tempo = lock(&self.inner.tempo);
        tempo.policy = policy;
        let rate = tempo.state.rate;
        let state = TempoState {
            rate,
            pitch_cents: tempo.policy.cents_for_rate(rate),
        };
        tempo.state = state;
        self.inner.graph.set_tempo(state);
    }

    /// Output gain in `0.0..=1.0`.
    pub fn set_volume(&self, volume: f32) {
        self.inner.graph.mixer().set_volume(volume);
    }

    pub fn state(&self) -> EngineState {
        lock(&self.inner.session).status.state
    }

    pub fn tempo(&self) -> TempoStatus {
        lock(&self.inner.tempo).state.into()
    }

    pub fn status(&self) -> EngineStatus {
        let tempo = lock(&self.inner.tempo).state;
        let graph = &self.inner.graph;
        let counters = GraphCounters {
            player: graph.player_snapshot(),
            output: graph.output_format(),
            device: graph.device_name(),
            underrun_frames: graph.mixer().underrun_frames(),
            underrun_events: graph.mixer().underrun_events(),
        };
        lock(&self.inner.session).status.snapshot(&counters, tempo)
    }

    /// Subscribe to lifecycle events from now on.
    pub fn events(&self) -> Receiver<PlaybackEvent> {
        let (tx, rx) = unbounded();
        lock(&self.inner.subscribers).push(tx);
        rx
    }

    /// The processing graph, for inspection.
    pub fn graph(&self) -> &PlaybackGraph {
        &self.inner.graph
    }

    /// Directory holding the transcoded scratch file.
    pub fn scratch_dir(&self) -> &std::path::Path {
        self.inner.scratch.dir()
    }
}

impl Drop for AudioPlaybackEngine {
    fn drop(&mut self) {
        let current = {
            let mut slot = lock(&self.inner.session);
            slot.status.generation += 1;
            slot.current.take()
        };
        if let Some(current) = current {
            current.cancel.store(true, Ordering::Relaxed);
            let _ = current.join.join();
        }
        self.inner.graph.shutdown();
        self.inner.scratch.remove();
    }
}

impl Inner {
    fn emit(&self, event: PlaybackEvent) {
        let mut subs = lock(&self.subscribers);
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Run `f` under the session lock if `generation` is still current.
    fn if_current<T>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut SessionSlot) -> T,
    ) -> Option<T> {
        let mut slot = lock(&self.session);
        if slot.status.generation != generation {
            return None;
        }
        Some(f(&mut slot))
    }

    fn run_session(
        &self,
        generation: u64,
        locator: &str,
        cancel: &Arc<AtomicBool>,
        tx: Sender<Result<()>>,
    ) {
        match self.prepare_and_play(generation, locator, cancel) {
            Ok(()) => {
                let _ = tx.send(Ok(()));
                self.emit(PlaybackEvent::Started {
                    generation,
                    locator: locator.to_string(),
                });
                self.watch_until_end(generation, cancel);
            }
            Err(error) => {
                if error.is_cancelled() {
                    tracing::debug!(generation, "session superseded");
                } else {
                    tracing::warn!(generation, "session failed: {error}");
                }
                let failed = self.if_current(generation, |slot| {
                    self.graph.stop_player();
                    slot.status.clear_playback(PlaybackEndReason::Error);
                });
                let _ = tx.send(Err(error.clone()));
                if failed.is_some() {
                    self.emit(PlaybackEvent::Failed { generation, error });
                }
            }
        }
    }

    fn prepare_and_play(&self, generation: u64, locator: &str, cancel: &AtomicBool) -> Result<()> {
        let still_current = || {
            if cancel.load(Ordering::Relaxed) {
                Err(EngineError::superseded())
            } else {
                Ok(())
            }
        };
        still_current()?;

        let asset = SourceAsset::resolve(locator)?;
        still_current()?;

        // Release the previous file before its scratch copy is replaced.
        self.if_current(generation, |_| self.graph.stop_player())
            .ok_or_else(EngineError::superseded)?;

        self.scratch.discard_partial().map_err(EngineError::export)?;
        match self
            .exporter
            .export(&asset, self.scratch.partial_path(), cancel)
        {
            Ok(()) => {}
            Err(ExportError::Cancelled) => {
                let _ = self.scratch.discard_partial();
                return Err(EngineError::superseded());
            }
            Err(e) => {
                let _ = self.scratch.discard_partial();
                return Err(EngineError::export(e));
            }
        }
        let path = self.scratch.commit().map_err(EngineError::export)?;
        still_current()?;

        let file = decode::open_streaming(path, self.buffer_seconds)
            .map_err(|e| EngineError::export(format!("transcoded file unreadable: {e:#}")))?;
        tracing::info!(
            generation,
            codec = file.info.codec.as_deref().unwrap_or("unknown"),
            rate_hz = file.info.sample_rate,
            channels = file.info.channels,
            "export ready"
        );

        self.graph.ensure_wired().map_err(EngineError::graph_start)?;
        // Device open can block; it runs outside the session lock.
        self.graph
            .start()
            .map_err(|e| EngineError::graph_start(format!("{e:#}")))?;
        still_current()?;

        let outcome = self.if_current(generation, |slot| -> Result<()> {
            self.graph.schedule_file(file);
            if let Err(e) = self.graph.play() {
                self.graph.stop_player();
                return Err(EngineError::graph_start(format!("{e:#}")));
            }
            slot.status.state = EngineState::Playing;
            slot.status.now_playing = Some(asset.locator().to_string());
            Ok(())
        });
        match outcome {
            Some(result) => result,
            None => Err(EngineError::superseded()),
        }
    }

    fn watch_until_end(&self, generation: u64, cancel: &Arc<AtomicBool>) {
        let Some(output) = self.graph.active_output() else {
            return;
        };
        if !queue::wait_until_done_and_empty_or_cancel(&output, cancel) {
            return;
        }
        // Let the mixer play out what it already pulled from the queue.
        thread::sleep(END_DRAIN);
        let failure = output.failure();
        let end_reason = match failure {
            Some(_) => PlaybackEndReason::Error,
            None => PlaybackEndReason::Eof,
        };
        let ended = self.if_current(generation, |slot| {
            self.graph.stop_player();
            slot.status.clear_playback(end_reason);
        });
        if ended.is_none() {
            return;
        }
        match failure {
            Some(reason) => {
                tracing::warn!(generation, "playback failed: {reason}");
                self.emit(PlaybackEvent::Failed {
                    generation,
                    error: EngineError::playback(reason),
                });
            }
            None => {
                tracing::info!(generation, "playback finished");
                self.emit(PlaybackEvent::Finished { generation });
            }
        }
    }
}
