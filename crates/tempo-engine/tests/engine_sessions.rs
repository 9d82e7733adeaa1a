use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tempo_engine::mixer::MixerNode;
use tempo_engine::output::{AudioOutput, NullOutput, OutputFormat};
use tempo_engine::{
    AudioPlaybackEngine, EngineConfig, EngineError, ExportFormat, OutputBackend, PlaybackEvent,
};
use tempo_engine::export::WavExporter;
use tempo_types::{EngineState, PlaybackEndReason};

const WAIT: Duration = Duration::from_secs(10);

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "tempo-engine-it-{tag}-{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_tone(path: &Path, sample_rate: u32, seconds: f32) {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    let frames = (sample_rate as f32 * seconds) as usize;
    for n in 0..frames {
        let t = n as f32 / sample_rate as f32;
        let v = (2.0 * std::f32::consts::PI * 330.0 * t).sin() * 0.4;
        let s = (v * i16::MAX as f32) as i16;
        writer.write_sample(s).unwrap();
        writer.write_sample(s).unwrap();
    }
    writer.finalize().unwrap();
}

fn config(dir: &Path) -> EngineConfig {
    EngineConfig {
        scratch_dir: Some(dir.join("scratch")),
        export_format: ExportFormat::Wav,
        output: OutputBackend::Null,
        ..EngineConfig::default()
    }
}

fn engine_with(dir: &Path, output: Box<dyn AudioOutput>) -> AudioPlaybackEngine {
    AudioPlaybackEngine::builder(config(dir))
        .output(output)
        .exporter(Box::new(WavExporter))
        .build()
        .unwrap()
}

fn fast_engine(dir: &Path) -> AudioPlaybackEngine {
    engine_with(dir, Box::new(NullOutput::new(48_000, 2).with_speed(8.0)))
}

fn scratch_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn wait_for_event(
    rx: &crossbeam_channel::Receiver<PlaybackEvent>,
    pred: impl Fn(&PlaybackEvent) -> bool,
) -> PlaybackEvent {
    let deadline = Instant::now() + WAIT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let event = rx.recv_timeout(left).expect("timed out waiting for event");
        if pred(&event) {
            return event;
        }
    }
}

/// Output that refuses to start while `fail` is set.
struct FlakyOutput {
    fail: Arc<AtomicBool>,
    inner: NullOutput,
}

impl AudioOutput for FlakyOutput {
    fn start(&mut self, mixer: Arc<MixerNode>) -> anyhow::Result<OutputFormat> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(anyhow::anyhow!("device unplugged"));
        }
        self.inner.start(mixer)
    }

    fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    fn stop(&mut self) {
        self.inner.stop();
    }
}

/// Output whose device takes a while to open: signals `opening`, then waits for
/// `release` (or gives up after a few seconds) before starting.
struct SlowOutput {
    opening: crossbeam_channel::Sender<()>,
    release: crossbeam_channel::Receiver<()>,
    inner: NullOutput,
}

impl AudioOutput for SlowOutput {
    fn start(&mut self, mixer: Arc<MixerNode>) -> anyhow::Result<OutputFormat> {
        let _ = self.opening.try_send(());
        let _ = self.release.recv_timeout(Duration::from_secs(5));
        self.inner.start(mixer)
    }

    fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    fn stop(&mut self) {
        self.inner.stop();
    }
}

#[test]
fn invalid_locator_fails_without_touching_the_graph() {
    let dir = unique_temp_dir("invalid");
    let engine = fast_engine(&dir);
    let events = engine.events();

    let handle = engine.start(dir.join("missing.flac").to_str().unwrap());
    let err = handle.wait_timeout(WAIT).unwrap().unwrap_err();
    assert!(matches!(err, EngineError::InvalidSource { .. }));
    assert_eq!(engine.state(), EngineState::Idle);
    assert!(engine.graph().attached_nodes().is_empty());
    assert!(!engine.graph().is_running());

    let event = wait_for_event(&events, |e| matches!(e, PlaybackEvent::Failed { .. }));
    assert_eq!(
        event,
        PlaybackEvent::Failed {
            generation: handle.generation(),
            error: err
        }
    );
    drop(engine);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn invalid_locator_after_playback_keeps_wiring_and_output() {
    let dir = unique_temp_dir("invalid-after");
    let src = dir.join("tone.wav");
    write_tone(&src, 44_100, 20.0);
    let engine = fast_engine(&dir);

    engine.start(src.to_str().unwrap()).wait().unwrap();
    let nodes = engine.graph().attached_nodes();
    let connections = engine.graph().connections();

    let err = engine.start("https://example.com/a.mp3").wait().unwrap_err();
    assert!(matches!(err, EngineError::InvalidSource { .. }));
    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(engine.graph().attached_nodes(), nodes);
    assert_eq!(engine.graph().connections(), connections);
    assert!(engine.graph().is_running());
    assert!(!engine.graph().mixer().has_input());
    drop(engine);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn second_start_supersedes_the_first() {
    let dir = unique_temp_dir("supersede");
    let first = dir.join("first.wav");
    let second = dir.join("second.wav");
    write_tone(&first, 22_050, 10.0);
    write_tone(&second, 32_000, 20.0);
    let engine = fast_engine(&dir);

    let h1 = engine.start(first.to_str().unwrap());
    let h2 = engine.start(second.to_str().unwrap());
    assert!(h2.generation() > h1.generation());

    h2.wait_timeout(WAIT).unwrap().unwrap();
    if let Err(err) = h1.wait_timeout(WAIT).unwrap() {
        assert!(err.is_cancelled(), "unexpected error {err}");
    }

    let status = engine.status();
    assert_eq!(status.state, EngineState::Playing);
    assert_eq!(status.generation, h2.generation());
    assert_eq!(status.now_playing.as_deref(), second.to_str());
    assert_eq!(status.source_rate_hz, Some(32_000));
    drop(engine);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn graph_start_failure_is_recoverable() {
    let dir = unique_temp_dir("graph-fail");
    let src = dir.join("tone.wav");
    write_tone(&src, 48_000, 10.0);
    let fail = Arc::new(AtomicBool::new(true));
    let engine = engine_with(
        &dir,
        Box::new(FlakyOutput {
            fail: fail.clone(),
            inner: NullOutput::new(48_000, 2).with_speed(8.0),
        }),
    );

    let err = engine.start(src.to_str().unwrap()).wait().unwrap_err();
    assert!(matches!(err, EngineError::GraphStartFailed { .. }));
    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(engine.status().end_reason, Some(PlaybackEndReason::Error));

    fail.store(false, Ordering::Relaxed);
    engine.start(src.to_str().unwrap()).wait().unwrap();
    assert_eq!(engine.state(), EngineState::Playing);
    drop(engine);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn natural_end_emits_finished_and_returns_to_idle() {
    let dir = unique_temp_dir("finish");
    let src = dir.join("short.wav");
    write_tone(&src, 48_000, 0.5);
    let engine = fast_engine(&dir);
    let events = engine.events();

    let handle = engine.start(src.to_str().unwrap());
    handle.wait().unwrap();
    wait_for_event(&events, |e| matches!(e, PlaybackEvent::Started { .. }));
    let done = wait_for_event(&events, |e| matches!(e, PlaybackEvent::Finished { .. }));
    assert_eq!(
        done,
        PlaybackEvent::Finished {
            generation: handle.generation()
        }
    );

    let status = engine.status();
    assert_eq!(status.state, EngineState::Idle);
    assert_eq!(status.end_reason, Some(PlaybackEndReason::Eof));
    assert!(status.now_playing.is_none());
    drop(engine);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn tempo_applies_in_every_state_and_carries_into_sessions() {
    let dir = unique_temp_dir("tempo");
    let src = dir.join("tone.wav");
    write_tone(&src, 44_100, 30.0);
    let engine = fast_engine(&dir);

    engine.apply_tempo(0.5).unwrap();
    engine.start(src.to_str().unwrap()).wait().unwrap();
    assert_eq!(engine.graph().varispeed().rate(), 0.5);
    assert_eq!(engine.graph().time_pitch().pitch_cents(), 1200.0);

    engine.apply_tempo(1.5).unwrap();
    let status = engine.status();
    assert_eq!(status.tempo.rate, 1.5);
    assert_eq!(status.tempo.pitch_cents, -1200.0 * 1.5f32.log2());

    engine.pause();
    assert!(matches!(
        engine.apply_tempo(0.0),
        Err(EngineError::InvalidTempo { .. })
    ));
    assert_eq!(engine.tempo().rate, 1.5);
    assert_eq!(engine.state(), EngineState::Paused);
    drop(engine);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn stop_during_loading_leaves_nothing_playing() {
    let dir = unique_temp_dir("stop-loading");
    let src = dir.join("tone.wav");
    write_tone(&src, 44_100, 4.0);
    let engine = fast_engine(&dir);

    let handle = engine.start(src.to_str().unwrap());
    engine.stop();
    let _ = handle.wait_timeout(WAIT).unwrap();

    assert_eq!(engine.state(), EngineState::Idle);
    assert!(!engine.graph().mixer().has_input());
    drop(engine);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn scratch_holds_one_file_and_is_removed_on_drop() {
    let dir = unique_temp_dir("scratch");
    let a = dir.join("a.wav");
    let b = dir.join("b.wav");
    write_tone(&a, 44_100, 2.0);
    write_tone(&b, 48_000, 2.0);
    let engine = fast_engine(&dir);
    let scratch = engine.scratch_dir().to_path_buf();

    engine.start(a.to_str().unwrap()).wait().unwrap();
    assert_eq!(scratch_files(&scratch), vec!["playback.wav".to_string()]);
    engine.start(b.to_str().unwrap()).wait().unwrap();
    assert_eq!(scratch_files(&scratch), vec!["playback.wav".to_string()]);
    assert_eq!(engine.graph().attached_nodes().len(), 4);
    assert_eq!(engine.graph().connections().len(), 3);

    drop(engine);
    assert!(!scratch.exists());
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn controls_stay_responsive_while_the_device_opens() {
    let dir = unique_temp_dir("slow-device");
    let src = dir.join("tone.wav");
    write_tone(&src, 44_100, 20.0);
    let (opening_tx, opening_rx) = crossbeam_channel::bounded(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded(1);
    let engine = engine_with(
        &dir,
        Box::new(SlowOutput {
            opening: opening_tx,
            release: release_rx,
            inner: NullOutput::new(48_000, 2).with_speed(8.0),
        }),
    );

    let handle = engine.start(src.to_str().unwrap());
    opening_rx
        .recv_timeout(WAIT)
        .expect("session never reached the output");

    let t0 = Instant::now();
    engine.pause();
    let state = engine.state();
    let status = engine.status();
    let took = t0.elapsed();
    assert!(took < Duration::from_secs(2), "controls waited {took:?}");
    assert_eq!(state, EngineState::Loading);
    assert_eq!(status.state, EngineState::Loading);
    assert_eq!(status.output_rate_hz, None);

    release_tx.send(()).unwrap();
    handle.wait_timeout(WAIT).unwrap().unwrap();
    assert_eq!(engine.state(), EngineState::Playing);
    assert_eq!(engine.status().output_rate_hz, Some(48_000));
    drop(engine);
    let _ = std::fs::remove_dir_all(dir);
}
