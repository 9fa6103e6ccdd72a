use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::resampler::{Resampler, ResamplerKind};
use crate::rom_loader::AcquiredRomSet;
use crate::synth_core::{LCD_HEIGHT, LCD_WIDTH, StereoFrame, SynthCore};

/// Every `FULL_REDRAW_INTERVAL` ticks a diff-mode display still repaints every pixel.
pub const FULL_REDRAW_INTERVAL: u32 = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("synthesis core reported a native sample rate of 0")]
    ZeroNativeRate,
    #[error("output sample rate must be greater than 0")]
    ZeroOutputRate,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub output_sample_rate: u32,
    /// Percent, clamped to 0..=100.
    pub master_volume: u8,
    pub resampler: ResamplerKind,
    pub lcd_diff_updates: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            output_sample_rate: 48000,
            master_volume: 100,
            resampler: ResamplerKind::default(),
            lcd_diff_updates: false,
        }
    }
}

/// Something that can show the core's monochrome LCD.
pub trait DisplayTarget {
    fn set_pixel(&mut self, x: usize, y: usize);
    fn clear_pixel(&mut self, x: usize, y: usize);
}

/// Packs a short MIDI message the way the input drivers deliver it.
pub fn pack_short_message(status: u8, data1: u8, data2: u8) -> u32 {
    status as u32 | (data1 as u32) << 8 | (data2 as u32) << 16
}

/// Data bytes that follow a status byte of this class.
pub fn short_message_data_len(status: u8) -> usize {
    match status & 0xF0 {
        0xC0 | 0xD0 => 1,
        0x80 | 0x90 | 0xA0 | 0xB0 | 0xE0 => 2,
        _ => 0,
    }
}

/// A sample format the render loop can write.
pub trait OutputSample: Copy {
    const SILENCE: Self;

    /// Scales one 16-bit-domain value by a 0..=100 volume.
    fn from_scaled(value: i32, volume: u8) -> Self;
}

impl OutputSample for i16 {
    const SILENCE: Self = 0;

    #[inline]
    fn from_scaled(value: i32, volume: u8) -> Self {
        (value as i64 * volume as i64 / 100).clamp(i16::MIN as i64, i16::MAX as i64) as i16
    }
}

impl OutputSample for f32 {
    const SILENCE: Self = 0.0;

    #[inline]
    fn from_scaled(value: i32, volume: u8) -> Self {
        (value as f32 / 32768.0 * volume as f32 / 100.0).clamp(-1.0, 1.0)
    }
}

/// Everything guarded by the bridge lock.
struct BridgeState<C> {
    core: C,
    resampler: Resampler,
    master_volume: u8,
    last_message: Option<u32>,
    lcd_shadow: Vec<bool>,
    shadow_valid: bool,
}

/// Owns the synthesis core and serializes every access to it.
///
/// The MIDI, audio and UI contexts share one bridge behind an `Arc`. Each
/// MIDI message, each rendered buffer and each display refresh holds the
/// lock for its whole duration, so the core never sees a message split by
/// sample generation.
pub struct SynthBridge<C> {
    state: Mutex<BridgeState<C>>,
    rom_label: String,
    native_sample_rate: u32,
    output_sample_rate: u32,
    resampler_kind: ResamplerKind,
    lcd_diff_updates: bool,
}

impl<C: SynthCore> SynthBridge<C> {
    /// Lends the acquired images to the core, then drops them and primes the
    /// resampling pipeline with one native frame.
    pub fn open(mut core: C, rom: AcquiredRomSet, settings: &EngineSettings) -> Result<Self, BridgeError> {
        if settings.output_sample_rate == 0 {
            return Err(BridgeError::ZeroOutputRate);
        }

        let AcquiredRomSet { label, images, .. } = rom;
        core.open(&images);
        drop(images);

        let native_sample_rate = core.native_sample_rate();
        if native_sample_rate == 0 {
            return Err(BridgeError::ZeroNativeRate);
        }

        let mut resampler = Resampler::new(settings.resampler, native_sample_rate, settings.output_sample_rate);
        resampler.prime(&mut core);
        log::debug!(
            "[Engine] Native rate {} Hz -> output {} Hz, resampler {} {:?}",
            native_sample_rate,
            settings.output_sample_rate,
            settings.resampler,
            resampler
        );

        Ok(Self {
            state: Mutex::new(BridgeState {
                core,
                resampler,
                master_volume: settings.master_volume.min(100),
                last_message: None,
                lcd_shadow: vec![false; LCD_WIDTH * LCD_HEIGHT],
                shadow_valid: false,
            }),
            rom_label: label,
            native_sample_rate,
            output_sample_rate: settings.output_sample_rate,
            resampler_kind: settings.resampler,
            lcd_diff_updates: settings.lcd_diff_updates,
        })
    }

    fn lock(&self) -> MutexGuard<'_, BridgeState<C>> {
        // Poisoned locks are recovered.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fills an interleaved stereo buffer. Returns the number of frames written.
    #[cfg_attr(feature = "hotpath", hotpath::measure)]
    pub fn render_i16(&self, out: &mut [i16]) -> usize {
        self.render(out)
    }

    /// Fills an interleaved stereo buffer with samples in [-1.0, 1.0].
    #[cfg_attr(feature = "hotpath", hotpath::measure)]
    pub fn render_f32(&self, out: &mut [f32]) -> usize {
        self.render(out)
    }

    fn render<S: OutputSample>(&self, out: &mut [S]) -> usize {
        let mut guard = self.lock();
        let state = &mut *guard;
        let volume = state.master_volume;

        let mut chunks = out.chunks_exact_mut(2);
        let mut frames = 0;
        for frame in &mut chunks {
            let [left, right]: StereoFrame = state.resampler.produce_frame(&mut state.core);
            frame[0] = S::from_scaled(left, volume);
            frame[1] = S::from_scaled(right, volume);
            frames += 1;
        }
        // odd trailing sample
        for sample in chunks.into_remainder() {
            *sample = S::SILENCE;
        }
        frames
    }

    /// Forwards a packed short message: the status byte, then 0 to 2 data bytes.
    pub fn handle_short_message(&self, message: u32) {
        let [status, data1, data2, _] = message.to_le_bytes();
        let data = [data1, data2];
        let data = &data[..short_message_data_len(status)];

        let mut state = self.lock();
        state.core.write(status);
        for &byte in data {
            state.core.write(byte);
        }
        state.last_message = Some(message);
    }

    /// Forwards a system-exclusive message verbatim, framing bytes included.
    pub fn handle_sysex(&self, message: &[u8]) {
        let mut state = self.lock();
        for &byte in message {
            state.core.write(byte);
        }
    }

    /// All Sound Off and All Notes Off on every channel.
    pub fn panic(&self) {
        log::info!("[Engine] Panic: silencing all channels");
        for channel in 0..16u8 {
            self.handle_short_message(pack_short_message(0xB0 | channel, 120, 0));
            self.handle_short_message(pack_short_message(0xB0 | channel, 123, 0));
        }
    }

    /// Refreshes the core's LCD and copies it into `target`.
    ///
    /// In diff mode only pixels that changed since the previous call are
    /// written, except on every `FULL_REDRAW_INTERVAL`-th tick.
    pub fn update_display<D: DisplayTarget + ?Sized>(&self, target: &mut D, ticks: u32) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.core.lcd_refresh();

        let full = !self.lcd_diff_updates || !state.shadow_valid || ticks % FULL_REDRAW_INTERVAL == 0;
        let buffer = state.core.lcd_buffer();
        for y in 0..LCD_HEIGHT {
            for x in 0..LCD_WIDTH {
                let index = y * LCD_WIDTH + x;
                let lit = buffer.get(index).is_some_and(|&pixel| pixel != 0);
                if full || state.lcd_shadow[index] != lit {
                    if lit {
                        target.set_pixel(x, y);
                    } else {
                        target.clear_pixel(x, y);
                    }
                }
                state.lcd_shadow[index] = lit;
            }
        }
        state.shadow_valid = true;
    }

    pub fn set_master_volume(&self, volume: u8) {
        self.lock().master_volume = volume.min(100);
    }

    pub fn master_volume(&self) -> u8 {
        self.lock().master_volume
    }

    /// The most recent short message, packed.
    pub fn last_message(&self) -> Option<u32> {
        self.lock().last_message
    }

    pub fn rom_label(&self) -> &str {
        &self.rom_label
    }

    pub fn native_sample_rate(&self) -> u32 {
        self.native_sample_rate
    }

    pub fn output_sample_rate(&self) -> u32 {
        self.output_sample_rate
    }

    pub fn resampler_kind(&self) -> ResamplerKind {
        self.resampler_kind
    }
}
