use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::engine::EngineSettings;
use crate::resampler::ResamplerKind;
use crate::rom_loader::StorageDevice;
use crate::rom_sets::{RomSetCandidate, default_rom_sets};

pub const APP_NAME: &str = "rusty-sc55";

/// Settings that are saved to the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub sample_rate: u32,
    pub master_volume: u8,
    /// Directory searched for ROM files on every storage device.
    pub rom_directory: String,
    /// Only try this ROM set (by label) instead of the whole table.
    pub rom_set: Option<String>,
    pub resampler: ResamplerKind,
    pub audio_buffer_frames: usize,
    pub midi_device: Option<String>,
    pub lcd_diff_updates: bool,
    pub storage_devices: Vec<StorageDevice>,
    /// Replaces the built-in ROM set table when present.
    pub rom_sets: Option<Vec<RomSetCandidate>>,
}

/// Default settings for a new installation.
impl Default for AppSettings {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            master_volume: 100,
            rom_directory: "sc55_roms".to_string(),
            rom_set: None,
            resampler: ResamplerKind::StepBlend,
            audio_buffer_frames: 512,
            midi_device: None,
            lcd_diff_updates: false,
            storage_devices: default_storage_devices(),
            rom_sets: None,
        }
    }
}

/// `SD` is the working directory, `USB` the per-user data directory.
pub fn default_storage_devices() -> Vec<StorageDevice> {
    let mut devices = vec![StorageDevice::new("SD", ".")];
    if let Some(data_dir) = dirs::data_dir() {
        devices.push(StorageDevice::new("USB", data_dir.join(APP_NAME)));
    }
    devices
}

/// Parses a `NAME=PATH` storage device argument.
pub fn parse_storage_device(arg: &str) -> Result<StorageDevice, String> {
    let (name, root) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH, got '{}'", arg))?;
    let name = name.trim();
    if name.is_empty() || root.is_empty() {
        return Err(format!("expected NAME=PATH, got '{}'", arg));
    }
    Ok(StorageDevice::new(name, root))
}

/// Command-line values that take precedence over the saved settings.
#[derive(Debug, Default, Clone)]
pub struct SettingsOverrides {
    pub sample_rate: Option<u32>,
    pub master_volume: Option<u8>,
    pub rom_directory: Option<String>,
    pub storage_devices: Vec<StorageDevice>,
    pub rom_set: Option<String>,
    pub resampler: Option<ResamplerKind>,
    pub audio_buffer_frames: Option<usize>,
    pub midi_device: Option<String>,
}

impl AppSettings {
    pub fn apply(&mut self, overrides: SettingsOverrides) {
        if let Some(rate) = overrides.sample_rate {
            self.sample_rate = rate;
        }
        if let Some(volume) = overrides.master_volume {
            self.master_volume = volume.min(100);
        }
        if let Some(dir) = overrides.rom_directory {
            self.rom_directory = dir;
        }
        if !overrides.storage_devices.is_empty() {
            self.storage_devices = overrides.storage_devices;
        }
        if overrides.rom_set.is_some() {
            self.rom_set = overrides.rom_set;
        }
        if let Some(resampler) = overrides.resampler {
            self.resampler = resampler;
        }
        if let Some(frames) = overrides.audio_buffer_frames {
            self.audio_buffer_frames = frames;
        }
        if overrides.midi_device.is_some() {
            self.midi_device = overrides.midi_device;
        }
    }
}

/// The merged configuration startup runs with.
/// This is *not* saved to disk.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    // --- Saved Settings ---
    pub sample_rate: u32,
    pub master_volume: u8,
    pub rom_directory: String,
    pub storage_devices: Vec<StorageDevice>,
    pub rom_set: Option<String>,
    pub rom_sets: Vec<RomSetCandidate>,
    pub resampler: ResamplerKind,
    pub audio_buffer_frames: usize,
    pub midi_device: Option<String>,
    pub lcd_diff_updates: bool,

    // --- Runtime-Only Settings ---
    pub midi_file: Option<PathBuf>,
    pub record: bool,
    pub headless: bool,
}

impl RuntimeConfig {
    pub fn new(settings: AppSettings, midi_file: Option<PathBuf>, record: bool, headless: bool) -> Result<Self> {
        if settings.sample_rate == 0 {
            return Err(anyhow!("Sample rate must be greater than 0"));
        }
        if settings.audio_buffer_frames == 0 {
            return Err(anyhow!("Audio buffer size must be at least one frame"));
        }

        Ok(Self {
            sample_rate: settings.sample_rate,
            master_volume: settings.master_volume.min(100),
            rom_directory: settings.rom_directory,
            storage_devices: settings.storage_devices,
            rom_set: settings.rom_set,
            rom_sets: settings.rom_sets.unwrap_or_else(default_rom_sets),
            resampler: settings.resampler,
            audio_buffer_frames: settings.audio_buffer_frames,
            midi_device: settings.midi_device,
            lcd_diff_updates: settings.lcd_diff_updates,
            midi_file,
            record,
            headless,
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            output_sample_rate: self.sample_rate,
            master_volume: self.master_volume,
            resampler: self.resampler,
            lcd_diff_updates: self.lcd_diff_updates,
        }
    }
}

/// Loads settings from disk.
pub fn load_settings() -> Result<AppSettings> {
    let settings: AppSettings = confy::load(APP_NAME, "settings")?;
    Ok(settings)
}

/// Saves settings to disk.
pub fn save_settings(settings: &AppSettings) -> Result<()> {
    confy::store(APP_NAME, "settings", settings)?;
    Ok(())
}
