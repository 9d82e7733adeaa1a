//! Processing graph: player → varispeed → time-pitch → mixer → output.
//!
//! The graph owns the node set, the wiring between nodes and the output backend.
//! Wiring is idempotent: nodes are attached and connected once, and later calls only
//! report that nothing changed. The output is started lazily and restarted if it died.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};

use crate::config::PlaybackConfig;
use crate::decode::{ScheduledFile, SourceInfo};
use crate::mixer::MixerNode;
use crate::output::{AudioOutput, OutputFormat};
use crate::render::{self, RenderHandle};
use crate::tempo::{StageParams, TempoState};

/// Nodes that make up the playback chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Player,
    Varispeed,
    TimePitch,
    Mixer,
}

/// Signal path in connection order.
pub const SIGNAL_PATH: [NodeKind; 4] = [
    NodeKind::Player,
    NodeKind::Varispeed,
    NodeKind::TimePitch,
    NodeKind::Mixer,
];

#[derive(Debug, Default)]
struct Wiring {
    attached: Vec<NodeKind>,
    connections: Vec<(NodeKind, NodeKind)>,
}

impl Wiring {
    fn attach(&mut self, node: NodeKind) -> bool {
        if self.attached.contains(&node) {
            return false;
        }
        self.attached.push(node);
        true
    }

    fn connect(&mut self, from: NodeKind, to: NodeKind) -> Result<bool> {
        if !self.attached.contains(&from) || !self.attached.contains(&to) {
            return Err(anyhow!("cannot connect {from:?} -> {to:?}: node not attached"));
        }
        if self.connections.contains(&(from, to)) {
            return Ok(false);
        }
        self.connections.push((from, to));
        Ok(true)
    }

    fn is_complete(&self) -> bool {
        SIGNAL_PATH
            .windows(2)
            .all(|pair| self.connections.contains(&(pair[0], pair[1])))
    }
}

/// Read-only view of the variable-speed stage.
pub struct VarispeedNode {
    params: Arc<StageParams>,
}

impl VarispeedNode {
    /// Requested playback rate.
    pub fn rate(&self) -> f32 {
        self.params.load().rate
    }
}

/// Read-only view of the time-pitch stage.
pub struct TimePitchNode {
    params: Arc<StageParams>,
}

impl TimePitchNode {
    /// Requested pitch shift in cents.
    pub fn pitch_cents(&self) -> f32 {
        self.params.load().pitch_cents
    }
}

struct ActiveFile {
    input: ScheduledFile,
    render: RenderHandle,
}

#[derive(Default)]
struct PlayerSlot {
    scheduled: Option<ScheduledFile>,
    active: Option<ActiveFile>,
}

impl PlayerSlot {
    fn clear(&mut self) {
        if let Some(file) = self.scheduled.take() {
            file.queue.close_and_clear();
        }
        if let Some(active) = self.active.take() {
            active.input.queue.close_and_clear();
            active.render.stop();
        }
    }
}

/// What the running output reported, readable without waiting on a device open.
#[derive(Clone, Debug, Default)]
struct OutputInfo {
    format: Option<OutputFormat>,
    device: Option<String>,
}

/// Snapshot of what the player node is doing.
#[derive(Clone, Debug, Default)]
pub struct PlayerSnapshot {
    pub info: Option<SourceInfo>,
    pub consumed_frames: u64,
    pub buffered_output_frames: usize,
}

pub struct PlaybackGraph {
    wiring: Mutex<Wiring>,
    player: Mutex<PlayerSlot>,
    params: Arc<StageParams>,
    varispeed: VarispeedNode,
    time_pitch: TimePitchNode,
    mixer: Arc<MixerNode>,
    // Lock order: `output` before `output_info`.
    output: Mutex<Box<dyn AudioOutput>>,
    output_info: Mutex<OutputInfo>,
    playback: PlaybackConfig,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl PlaybackGraph {
    pub fn new(output: Box<dyn AudioOutput>, playback: PlaybackConfig) -> Self {
        let params = Arc::new(StageParams::default());
        Self {
            wiring: Mutex::new(Wiring::default()),
            player: Mutex::new(PlayerSlot::default()),
            varispeed: VarispeedNode {
                params: params.clone(),
            },
            time_pitch: TimePitchNode {
                params: params.clone(),
            },
            params,
            mixer: Arc::new(MixerNode::new(playback.refill_max_frames)),
            output: Mutex::new(output),
            output_info: Mutex::new(OutputInfo::default()),
            playback,
        }
    }

    /// Attach `node`. Returns `false` if it was already attached.
    pub fn attach(&self, node: NodeKind) -> bool {
        lock(&self.wiring).attach(node)
    }

    /// Connect two attached nodes. Returns `false` if the connection already existed.
    pub fn connect(&self, from: NodeKind, to: NodeKind) -> Result<bool> {
        lock(&self.wiring).connect(from, to)
    }

    /// Attach every node and connect the signal path. Returns whether anything changed.
    pub fn ensure_wired(&self) -> Result<bool> {
        let mut wiring = lock(&self.wiring);
        let mut changed = false;
        for node in SIGNAL_PATH {
            changed |= wiring.attach(node);
        }
        for pair in SIGNAL_PATH.windows(2) {
            changed |= wiring.connect(pair[0], pair[1])?;
        }
        if changed {
            tracing::debug!(
                nodes = wiring.attached.len(),
                connections = wiring.connections.len(),
                "graph wired"
            );
        }
        Ok(changed)
    }

    pub fn is_wired(&self) -> bool {
        lock(&self.wiring).is_complete()
    }

    pub fn attached_nodes(&self) -> Vec<NodeKind> {
        lock(&self.wiring).attached.clone()
    }

    pub fn connections(&self) -> Vec<(NodeKind, NodeKind)> {
        lock(&self.wiring).connections.clone()
    }

    pub fn varispeed(&self) -> &VarispeedNode {
        &self.varispeed
    }

    pub fn time_pitch(&self) -> &TimePitchNode {
        &self.time_pitch
    }

    pub fn mixer(&self) -> &Arc<MixerNode> {
        &self.mixer
    }

    /// Publish a rate/pitch pair to both stages at once.
    pub fn set_tempo(&self, tempo: TempoState) {
        self.params.store(tempo);
    }

    /// Start the output if it is not already running. Returns the render format.
    ///
    /// May block while a device opens; [`PlaybackGraph::output_format`] and
    /// [`PlaybackGraph::device_name`] stay readable meanwhile.
    pub fn start(&self) -> Result<OutputFormat> {
        let mut backend = lock(&self.output);
        let started = lock(&self.output_info).format;
        if let Some(format) = started {
            if backend.is_running() {
                return Ok(format);
            }
            tracing::warn!("output stopped unexpectedly; restarting");
            backend.stop();
            *lock(&self.output_info) = OutputInfo::default();
        }
        let format = backend.start(self.mixer.clone())?;
        *lock(&self.output_info) = OutputInfo {
            format: Some(format),
            device: backend.device_name(),
        };
        Ok(format)
    }

    pub fn is_running(&self) -> bool {
        let started = lock(&self.output_info).format.is_some();
        started && lock(&self.output).is_running()
    }

    /// Format of the running output, if started.
    pub fn output_format(&self) -> Option<OutputFormat> {
        lock(&self.output_info).format
    }

    /// Device the running output opened, if started.
    pub fn device_name(&self) -> Option<String> {
        lock(&self.output_info).device.clone()
    }

    /// Stop the output backend. The wiring is kept.
    pub fn shutdown(&self) {
        self.stop_player();
        let mut backend = lock(&self.output);
        backend.stop();
        *lock(&self.output_info) = OutputInfo::default();
    }

    /// Schedule `file` on the player node, replacing anything scheduled or playing.
    pub fn schedule_file(&self, file: ScheduledFile) {
        let mut player = lock(&self.player);
        self.mixer.set_input(None);
        player.clear();
        player.scheduled = Some(file);
    }

    /// Start rendering the scheduled file into the mixer.
    pub fn play(&self) -> Result<()> {
        if !self.is_wired() {
            return Err(anyhow!("graph is not wired"));
        }
        let format = self
            .output_format()
            .ok_or_else(|| anyhow!("output is not running"))?;

        let mut player = lock(&self.player);
        let file = player
            .scheduled
            .take()
            .ok_or_else(|| anyhow!("no file scheduled"))?;
        let render = render::spawn_render(
            file.queue.clone(),
            file.spec.rate,
            format.sample_rate,
            self.params.clone(),
            &self.playback,
        )?;
        self.mixer.set_input(Some(render.output.clone()));
        self.mixer.set_paused(false);
        player.active = Some(ActiveFile {
            input: file,
            render,
        });
        Ok(())
    }

    /// Halt the player node. Buffered audio stays queued.
    pub fn pause(&self) {
        self.mixer.set_paused(true);
    }

    pub fn resume(&self) {
        self.mixer.set_paused(false);
    }

    /// Drop whatever is scheduled or playing and disconnect it from the mixer.
    pub fn stop_player(&self) {
        let mut player = lock(&self.player);
        self.mixer.set_input(None);
        self.mixer.set_paused(false);
        player.clear();
    }

    /// Queue carrying rendered audio for the active file.
    pub fn active_output(&self) -> Option<Arc<crate::queue::SharedAudio>> {
        lock(&self.player)
            .active
            .as_ref()
            .map(|a| a.render.output.clone())
    }

    /// Decoded-file queue feeding the active render thread.
    #[cfg(test)]
    pub(crate) fn active_input(&self) -> Option<Arc<crate::queue::SharedAudio>> {
        lock(&self.player)
            .active
            .as_ref()
            .map(|a| a.input.queue.clone())
    }

    pub fn player_snapshot(&self) -> PlayerSnapshot {
        let player = lock(&self.player);
        match &player.active {
            Some(active) => PlayerSnapshot {
                info: Some(active.input.info.clone()),
                consumed_frames: active.render.consumed_frames.load(Ordering::Relaxed),
                buffered_output_frames: active.render.output.len_frames(),
            },
            None => PlayerSnapshot {
                info: player.scheduled.as_ref().map(|f| f.info.clone()),
                ..PlayerSnapshot::default()
            },
        }
    }
}

impl Drop for PlaybackGraph {
    fn drop(&mut self) {
        self.shutdown();
    }
}
