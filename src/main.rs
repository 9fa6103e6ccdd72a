// src/main.rs

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};
use simplelog::{Config, LevelFilter, WriteLogger};
use std::fs::File;
use std::io::{BufRead, stdin};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

mod app;
mod audio;
mod audio_recorder;
mod config;
mod engine;
mod midi;
mod resampler;
mod rom_loader;
mod rom_sets;
mod synth_core;
mod timed_ring_buffer;
mod tui;

use app::TuiMessage;
use audio_recorder::AudioRecorder;
use config::{RuntimeConfig, SettingsOverrides};
use engine::SynthBridge;
use resampler::ResamplerKind;
use rom_loader::{FsStorage, RomAcquisition, RomError, StorageDevice};
use synth_core::SynthCore;

type DynCore = Box<dyn SynthCore + Send>;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[value(rename_all = "lower")]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Output sample rate in Hz
    #[arg(long, value_name = "HZ")]
    sample_rate: Option<u32>,

    /// Master volume in percent (0-100)
    #[arg(long, value_name = "PERCENT", value_parser = clap::value_parser!(u8).range(0..=100))]
    volume: Option<u8>,

    /// Directory holding the ROM files on each storage device
    #[arg(long, value_name = "DIR")]
    rom_dir: Option<String>,

    /// Storage device to search, in order (repeatable, replaces the saved list)
    #[arg(long = "device", value_name = "NAME=PATH", value_parser = config::parse_storage_device)]
    devices: Vec<StorageDevice>,

    /// Only try this ROM set (e.g. SC-55mk2, JV-880)
    #[arg(long, value_name = "LABEL")]
    rom_set: Option<String>,

    /// Resampling policy
    #[arg(long, value_enum)]
    resampler: Option<ResamplerKind>,

    /// Audio buffer size in frames (lower values reduce latency but may cause glitches)
    #[arg(long, value_name = "NUM_FRAMES")]
    audio_buffer_frames: Option<usize>,

    /// Select a MIDI input device by name
    #[arg(long, value_name = "DEVICE_NAME")]
    midi_device: Option<String>,

    /// Optional path to a MIDI file to play
    #[arg(long, value_name = "MIDI_FILE")]
    midi_file: Option<PathBuf>,

    /// Record the rendered output to a WAV file
    #[arg(long)]
    record: bool,

    /// Run without the terminal UI
    #[arg(long)]
    headless: bool,

    /// Save the effective settings (including the options given here) and continue
    #[arg(long)]
    save_settings: bool,

    /// List all available MIDI input devices and exit
    #[arg(long)]
    list_midi_devices: bool,

    /// Show which ROM sets are complete on which device and exit
    #[arg(long)]
    list_rom_sets: bool,

    /// Set the application log level
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,
}

impl Args {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            sample_rate: self.sample_rate,
            master_volume: self.volume,
            rom_directory: self.rom_dir.clone(),
            storage_devices: self.devices.clone(),
            rom_set: self.rom_set.clone(),
            resampler: self.resampler,
            audio_buffer_frames: self.audio_buffer_frames,
            midi_device: self.midi_device.clone(),
        }
    }
}

#[cfg(feature = "nuked-sc55")]
fn create_core() -> Result<DynCore> {
    Ok(Box::new(synth_core::native::NativeCore::new()?))
}

#[cfg(not(feature = "nuked-sc55"))]
fn create_core() -> Result<DynCore> {
    Err(anyhow!(
        "This build has no synthesis core. Rebuild with --features nuked-sc55 and libnukedsc55 installed."
    ))
}

fn print_rom_sets(acquisition: &RomAcquisition<FsStorage>) {
    println!("ROM sets:");
    for probe in acquisition.probe() {
        let state = if probe.is_complete() { "complete" } else { "incomplete" };
        println!("  {}: {} ({})", probe.index, probe.label, state);
        for (file, device) in &probe.files {
            println!("      {:<32} {}", file, device.as_deref().unwrap_or("missing"));
        }
    }
}

/// Blocks until a line is read. End of input or a read error is not a key press.
fn enter_pressed(mut input: impl BufRead) -> bool {
    let mut line = String::new();
    matches!(input.read_line(&mut line), Ok(n) if n > 0)
}

fn main() -> Result<()> {
    let args = Args::parse();

    // --- Setup logging ---
    let log_level = match args.log_level {
        LogLevel::Error => LevelFilter::Error,
        LogLevel::Warn => LevelFilter::Warn,
        LogLevel::Info => LevelFilter::Info,
        LogLevel::Debug => LevelFilter::Debug,
        LogLevel::Trace => LevelFilter::Trace,
    };
    WriteLogger::init(log_level, Config::default(), File::create("rusty-sc55.log")?)?;

    // This runs before any other setup and exits.
    if args.list_midi_devices {
        println!("Available MIDI Input Devices:");
        match midi::get_midi_device_names() {
            Ok(names) if names.is_empty() => println!("  No MIDI devices found."),
            Ok(names) => {
                for (i, name) in names.iter().enumerate() {
                    println!("  {}: {}", i, name);
                }
            }
            Err(e) => eprintln!("Error fetching MIDI devices: {}", e),
        }
        return Ok(());
    }

    // --- Settings ---
    let mut settings = config::load_settings().unwrap_or_else(|e| {
        log::warn!("[Config] Could not load settings, using defaults: {}", e);
        config::AppSettings::default()
    });
    settings.apply(args.overrides());
    if args.save_settings {
        config::save_settings(&settings)?;
        log::info!("[Config] Settings saved.");
    }
    let config = RuntimeConfig::new(settings, args.midi_file.clone(), args.record, args.headless)?;

    // --- ROM acquisition ---
    let mut acquisition = RomAcquisition::new(
        FsStorage,
        config.storage_devices.clone(),
        config.rom_directory.clone(),
        config.rom_sets.clone(),
    );
    if let Some(label) = &config.rom_set {
        acquisition = acquisition.only(label)?;
    }

    if args.list_rom_sets {
        print_rom_sets(&acquisition);
        return Ok(());
    }

    println!("\nRusty SC-55 v{}\n", env!("CARGO_PKG_VERSION"));

    let acquired = match acquisition.acquire() {
        Ok(acquired) => acquired,
        Err(RomError::NoCompleteSet { rejections }) => {
            eprintln!("No complete ROM set found in '{}' on:", config.rom_directory);
            for device in &config.storage_devices {
                eprintln!("  {}: {}", device.name, device.root.display());
            }
            for rejection in &rejections {
                eprintln!("  {}: {} {}", rejection.label, rejection.file, rejection.reason);
            }
            return Err(anyhow!("ROM acquisition failed"));
        }
        Err(e) => return Err(e.into()),
    };
    println!("ROM set {}: {}", acquired.index, acquired.label);

    // --- Synthesis core and render pipeline ---
    let core = create_core()?;
    let bridge: Arc<SynthBridge<DynCore>> = Arc::new(
        SynthBridge::open(core, acquired, &config.engine_settings()).context("Failed to start the synthesis core")?,
    );

    let recorder = if config.record {
        Some(AudioRecorder::start(bridge.rom_label(), config.sample_rate)?)
    } else {
        None
    };
    let stream = audio::start_audio_playback(
        Arc::clone(&bridge),
        config.audio_buffer_frames,
        recorder.as_ref().map(AudioRecorder::tap),
    )?;

    // --- MIDI ---
    let (tui_tx, tui_rx) = mpsc::channel::<TuiMessage>();
    let is_running = Arc::new(AtomicBool::new(true));
    let stop_playback = Arc::new(AtomicBool::new(false));

    let midi_connection = if config.midi_file.is_none() || config.midi_device.is_some() {
        match midi::setup_midi_input(Arc::clone(&bridge), config.midi_device.as_deref(), tui_tx.clone()) {
            Ok(connection) => Some(connection),
            Err(e) => {
                log::warn!("[MIDI] {}", e);
                let _ = tui_tx.send(TuiMessage::Error(format!("MIDI input unavailable: {}", e)));
                None
            }
        }
    } else {
        None
    };

    let player = match &config.midi_file {
        Some(path) => Some(midi::play_midi_file(
            path.clone(),
            Arc::clone(&bridge),
            tui_tx.clone(),
            Arc::clone(&stop_playback),
        )?),
        None => None,
    };
    drop(tui_tx);

    // --- UI ---
    if config.headless {
        println!("Running headless. Press Enter to quit.");
        {
            let is_running = Arc::clone(&is_running);
            thread::spawn(move || {
                if enter_pressed(stdin().lock()) {
                    is_running.store(false, Ordering::SeqCst);
                }
            });
        }
        while is_running.load(Ordering::Relaxed) {
            match tui_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(TuiMessage::MidiLog(line)) => log::debug!("[MIDI] {}", line),
                Ok(TuiMessage::Error(e)) => eprintln!("{}", e),
                Ok(TuiMessage::ChannelActivity(..)) => {}
                Ok(TuiMessage::PlaybackFinished) => break,
                Err(RecvTimeoutError::Timeout) => {}
                // nothing left that could send
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    } else {
        tui::run_tui_loop(Arc::clone(&bridge), tui_rx, Arc::clone(&is_running))?;
    }

    // --- Shutdown ---
    is_running.store(false, Ordering::SeqCst);
    stop_playback.store(true, Ordering::SeqCst);
    drop(midi_connection);
    if let Some(handle) = player {
        let _ = handle.join();
    }
    drop(stream);
    if let Some(recorder) = recorder {
        let path = recorder.path().clone();
        recorder.stop();
        println!("Recording saved to {}", path.display());
    }

    log::info!("[Main] Exiting.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headless_quits_on_enter_but_not_on_closed_stdin() {
        assert!(enter_pressed("\n".as_bytes()));
        assert!(!enter_pressed("".as_bytes()));
    }
}
