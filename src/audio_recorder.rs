use anyhow::Result;
use chrono::Local;
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use crate::config::APP_NAME;

/// Streams rendered output to a 32-bit float WAV file on a writer thread.
pub struct AudioRecorder {
    sender: mpsc::Sender<Vec<f32>>,
    thread_handle: Option<thread::JoinHandle<()>>,
    path: PathBuf,
}

/// `<rom set>_<timestamp>.wav`, with anything unsafe in a filename replaced.
fn recording_file_name(rom_label: &str, timestamp: &str) -> String {
    let label: String = rom_label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{}_{}.wav", label, timestamp)
}

impl AudioRecorder {
    /// Records into the `recordings` directory next to the settings file.
    pub fn start(rom_label: &str, sample_rate: u32) -> Result<Self> {
        let config_path = confy::get_configuration_file_path(APP_NAME, "settings")?;
        let parent = config_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("No config parent dir"))?;
        Self::start_in(parent.join("recordings"), rom_label, sample_rate)
    }

    pub fn start_in(recording_dir: PathBuf, rom_label: &str, sample_rate: u32) -> Result<Self> {
        if !recording_dir.exists() {
            fs::create_dir_all(&recording_dir)?;
        }

        let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
        let path = recording_dir.join(recording_file_name(rom_label, &timestamp));

        let spec = hound::WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec)?;

        let (tx, rx) = mpsc::channel::<Vec<f32>>();
        let handle = thread::spawn(move || {
            for buffer in rx {
                for sample in buffer {
                    if let Err(e) = writer.write_sample(sample) {
                        log::error!("[Recorder] Error writing sample: {}", e);
                        return;
                    }
                }
            }
            match writer.finalize() {
                Ok(()) => log::info!("[Recorder] WAV recording saved."),
                Err(e) => log::error!("[Recorder] Failed to finalize WAV file: {}", e),
            }
        });

        log::info!("[Recorder] Started recording audio to {:?}", path);

        Ok(Self {
            sender: tx,
            thread_handle: Some(handle),
            path,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// A cloneable handle for the audio callback. The file is only closed once
    /// every tap and the recorder itself are gone.
    pub fn tap(&self) -> RecorderTap {
        RecorderTap {
            sender: self.sender.clone(),
        }
    }

    /// Closes the file once every tap has been dropped and the queue is drained.
    pub fn stop(self) {
        let Self {
            sender,
            thread_handle,
            ..
        } = self;
        drop(sender);
        if let Some(h) = thread_handle {
            let _ = h.join();
        }
    }
}

/// Feeds rendered buffers to an [`AudioRecorder`].
#[derive(Clone)]
pub struct RecorderTap {
    sender: mpsc::Sender<Vec<f32>>,
}

impl RecorderTap {
    /// Queues an interleaved stereo buffer. Never blocks the caller.
    pub fn push(&self, buffer: &[f32]) {
        let _ = self.sender.send(buffer.to_vec());
    }

    /// Same as [`push`](Self::push) for 16-bit output.
    pub fn push_i16(&self, buffer: &[i16]) {
        let _ = self
            .sender
            .send(buffer.iter().map(|&s| s as f32 / 32768.0).collect());
    }
}
