//! Player runtime helpers.
//!
//! Provides device enumeration, the library listing, and the interactive playback shell.

use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, select};
use tempo_engine::{AudioPlaybackEngine, EngineConfig, PlaybackEvent, device};

use crate::library::{self, PlayableItem};

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    for (i, name) in device::list_device_names(&host)?.iter().enumerate() {
        println!("#{i}: {name}");
    }
    Ok(())
}

/// Print the sorted library listing for `dir`.
pub fn run_list(dir: &Path) -> Result<()> {
    let items = library::scan_items(dir)?;
    print_items(&items);
    Ok(())
}

/// Play one locator and accept commands on stdin until it ends or `quit`.
pub fn run_play(config: EngineConfig, locator: &str, tempo: Option<f32>) -> Result<()> {
    let engine = AudioPlaybackEngine::new(config)?;
    if let Some(rate) = tempo {
        engine.apply_tempo(rate)?;
    }
    let events = engine.events();
    let generation = engine.start(locator).generation();
    Shell {
        engine: &engine,
        items: &[],
        exit_after: Some(generation),
    }
    .run(events)
}

/// List `dir` and play items chosen with `play <n>`.
pub fn run_browse(config: EngineConfig, dir: &Path) -> Result<()> {
    let items = library::scan_items(dir)?;
    print_items(&items);
    let engine = AudioPlaybackEngine::new(config)?;
    let events = engine.events();
    Shell {
        engine: &engine,
        items: &items,
        exit_after: None,
    }
    .run(events)
}

fn print_items(items: &[PlayableItem]) {
    if items.is_empty() {
        println!("(no playable items)");
    }
    for (i, item) in items.iter().enumerate() {
        println!("{:>4}  {}", i + 1, item.artist_with_title());
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ShellCommand {
    Play(usize),
    List,
    Pause,
    Resume,
    Tempo(f32),
    Status,
    Stop,
    Help,
    Quit,
}

/// Parse one input line; `Ok(None)` for blank lines.
fn parse_command(line: &str) -> std::result::Result<Option<ShellCommand>, String> {
    let mut parts = line.split_whitespace();
    let Some(word) = parts.next() else {
        return Ok(None);
    };
    let arg = parts.next();
    if parts.next().is_some() {
        return Err(format!("too many arguments for '{word}'"));
    }
    let cmd = match (word.to_ascii_lowercase().as_str(), arg) {
        ("play", Some(n)) => {
            let n: usize = n.parse().map_err(|_| format!("bad item number '{n}'"))?;
            if n == 0 {
                return Err("item numbers start at 1".to_string());
            }
            ShellCommand::Play(n - 1)
        }
        ("tempo", Some(rate)) => {
            ShellCommand::Tempo(rate.parse().map_err(|_| format!("bad rate '{rate}'"))?)
        }
        ("play", None) => return Err("usage: play <n>".to_string()),
        ("tempo", None) => return Err("usage: tempo <rate>".to_string()),
        ("list", None) => ShellCommand::List,
        ("pause", None) => ShellCommand::Pause,
        ("resume", None) => ShellCommand::Resume,
        ("status", None) => ShellCommand::Status,
        ("stop", None) => ShellCommand::Stop,
        ("help", None) | ("?", None) => ShellCommand::Help,
        ("quit", None) | ("exit", None) => ShellCommand::Quit,
        (other, Some(_)) if is_bare(other) => {
            return Err(format!("'{other}' takes no arguments"));
        }
        (other, _) => return Err(format!("unknown command '{other}' (try 'help')")),
    };
    Ok(Some(cmd))
}

fn is_bare(word: &str) -> bool {
    matches!(
        word,
        "list" | "pause" | "resume" | "status" | "stop" | "help" | "?" | "quit" | "exit"
    )
}

const HELP: &str = "commands: play <n> | list | pause | resume | tempo <rate> | status | stop | quit";

struct Shell<'a> {
    engine: &'a AudioPlaybackEngine,
    items: &'a [PlayableItem],
    /// Exit once this session finishes or fails.
    exit_after: Option<u64>,
}

impl Shell<'_> {
    fn run(self, events: Receiver<PlaybackEvent>) -> Result<()> {
        let lines = spawn_stdin_reader()?;
        let mut stdin_open = true;
        loop {
            if !stdin_open && self.exit_after.is_none() {
                return Ok(());
            }
            let lines_rx = if stdin_open {
                lines.clone()
            } else {
                crossbeam_channel::never()
            };
            select! {
                recv(lines_rx) -> line => match line {
                    Ok(line) => {
                        if !self.handle_line(&line) {
                            return Ok(());
                        }
                    }
                    Err(_) => stdin_open = false,
                },
                recv(events) -> event => {
                    let event = event.context("engine event channel closed")?;
                    if self.handle_event(&event) {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Returns false when the shell should exit.
    fn handle_line(&self, line: &str) -> bool {
        let cmd = match parse_command(line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => return true,
            Err(msg) => {
                eprintln!("{msg}");
                return true;
            }
        };
        match cmd {
            ShellCommand::Play(index) => match self.items.get(index) {
                Some(item) => {
                    let handle = self.engine.start(&item.locator);
                    println!("loading #{} {}", index + 1, item.artist_with_title());
                    tracing::debug!(generation = handle.generation(), "start requested");
                }
                None => eprintln!("no item #{}", index + 1),
            },
            ShellCommand::List => print_items(self.items),
            ShellCommand::Pause => self.engine.pause(),
            ShellCommand::Resume => self.engine.resume(),
            ShellCommand::Tempo(rate) => match self.engine.apply_tempo(rate) {
                Ok(()) => {
                    let tempo = self.engine.tempo();
                    println!("tempo {:.3} (pitch {:+.1} cents)", tempo.rate, tempo.pitch_cents);
                }
                Err(e) => eprintln!("{e}"),
            },
            ShellCommand::Status => match serde_json::to_string_pretty(&self.engine.status()) {
                Ok(json) => println!("{json}"),
                Err(e) => eprintln!("status encode failed: {e}"),
            },
            ShellCommand::Stop => {
                self.engine.stop();
                if self.exit_after.is_some() {
                    return false;
                }
            }
            ShellCommand::Help => println!("{HELP}"),
            ShellCommand::Quit => return false,
        }
        true
    }

    /// Print `event`; returns true when the shell should exit.
    fn handle_event(&self, event: &PlaybackEvent) -> bool {
        match event {
            PlaybackEvent::Started { locator, .. } => println!("playing {locator}"),
            PlaybackEvent::Finished { .. } => println!("finished"),
            PlaybackEvent::Failed { error, .. } if error.is_cancelled() => {}
            PlaybackEvent::Failed { error, .. } => eprintln!("playback failed: {error}"),
        }
        match (self.exit_after, event) {
            (Some(wanted), PlaybackEvent::Finished { generation }) => *generation == wanted,
            (Some(wanted), PlaybackEvent::Failed { generation, .. }) => *generation == wanted,
            _ => false,
        }
    }
}

fn spawn_stdin_reader() -> Result<Receiver<String>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("spawn stdin thread")?;
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_command_accepts_transport_words() {
        assert_eq!(parse_command("pause"), Ok(Some(ShellCommand::Pause)));
        assert_eq!(parse_command("  RESUME "), Ok(Some(ShellCommand::Resume)));
        assert_eq!(parse_command("status"), Ok(Some(ShellCommand::Status)));
        assert_eq!(parse_command("stop"), Ok(Some(ShellCommand::Stop)));
        assert_eq!(parse_command("exit"), Ok(Some(ShellCommand::Quit)));
        assert_eq!(parse_command(""), Ok(None));
    }

    #[test]
    fn parse_command_reads_arguments() {
        assert_eq!(parse_command("tempo 1.25"), Ok(Some(ShellCommand::Tempo(1.25))));
        assert_eq!(parse_command("play 3"), Ok(Some(ShellCommand::Play(2))));
        // Rate validation is left to the engine.
        assert_eq!(parse_command("tempo -1"), Ok(Some(ShellCommand::Tempo(-1.0))));
    }

    #[test]
    fn parse_command_rejects_bad_input() {
        assert!(parse_command("play").is_err());
        assert!(parse_command("play 0").is_err());
        assert!(parse_command("play x").is_err());
        assert!(parse_command("tempo fast").is_err());
        assert!(parse_command("pause now").is_err());
        assert!(parse_command("tempo 1 2").is_err());
        assert!(parse_command("rewind").is_err());
    }
}
