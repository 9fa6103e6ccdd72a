use anyhow::{Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, SampleRate, Stream, StreamConfig, SupportedBufferSize};
use std::sync::Arc;

use crate::audio_recorder::RecorderTap;
use crate::engine::SynthBridge;
use crate::synth_core::SynthCore;

/// What a device offers: channels, format and sample rate range.
#[derive(Debug, Clone, Copy, PartialEq)]
struct OfferedConfig {
    channels: u16,
    format: SampleFormat,
    min_rate: u32,
    max_rate: u32,
}

/// Picks a stereo config at `rate`, preferring f32 over i16.
fn pick_config(offered: &[OfferedConfig], rate: u32) -> Option<usize> {
    let usable = |format: SampleFormat| {
        offered.iter().position(|c| {
            c.channels == 2 && c.format == format && c.min_rate <= rate && rate <= c.max_rate
        })
    };
    usable(SampleFormat::F32).or_else(|| usable(SampleFormat::I16))
}

/// A fixed buffer when the device accepts that many frames, the device default otherwise.
fn buffer_size_for(supported: &SupportedBufferSize, frames: usize) -> BufferSize {
    let Ok(frames) = u32::try_from(frames) else {
        return BufferSize::Default;
    };
    match supported {
        SupportedBufferSize::Range { min, max } if (*min..=*max).contains(&frames) => BufferSize::Fixed(frames),
        SupportedBufferSize::Range { .. } => {
            log::warn!("[Cpal] Device does not accept {} frame buffers, using its default", frames);
            BufferSize::Default
        }
        SupportedBufferSize::Unknown => BufferSize::Fixed(frames),
    }
}

/// Opens the default output device and drives the bridge from its callback.
pub fn start_audio_playback<C: SynthCore + Send + 'static>(
    bridge: Arc<SynthBridge<C>>,
    buffer_frames: usize,
    recorder: Option<RecorderTap>,
) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("No default output device available"))?;

    log::info!(
        "[Cpal] Default output device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let supported: Vec<_> = device.supported_output_configs()?.collect();
    log::debug!("[Cpal] Supported output configs:");
    for config in &supported {
        log::debug!(
            "  - Channels: {}, Sample Rate: {}-{}, Format: {:?}",
            config.channels(),
            config.min_sample_rate().0,
            config.max_sample_rate().0,
            config.sample_format()
        );
    }

    let sample_rate = bridge.output_sample_rate();
    let offered: Vec<OfferedConfig> = supported
        .iter()
        .map(|c| OfferedConfig {
            channels: c.channels(),
            format: c.sample_format(),
            min_rate: c.min_sample_rate().0,
            max_rate: c.max_sample_rate().0,
        })
        .collect();
    let index = pick_config(&offered, sample_rate)
        .ok_or_else(|| anyhow!("No stereo f32 or i16 output config at {} Hz", sample_rate))?;

    let config = supported[index].clone().with_sample_rate(SampleRate(sample_rate));
    let sample_format = config.sample_format();
    let buffer_size = buffer_size_for(config.buffer_size(), buffer_frames);
    let mut stream_config: StreamConfig = config.into();
    stream_config.buffer_size = buffer_size;

    log::info!(
        "[Cpal] Using config: SampleRate: {}, Channels: {}, Format: {:?}, Buffer: {:?}",
        stream_config.sample_rate.0,
        stream_config.channels,
        sample_format,
        stream_config.buffer_size
    );

    let err_callback = |err| {
        log::error!("[CpalCallback] Stream error: {}", err);
    };

    let stream = match sample_format {
        SampleFormat::F32 => {
            let data_callback = move |output: &mut [f32], _: &cpal::OutputCallbackInfo| {
                bridge.render_f32(output);
                if let Some(tap) = &recorder {
                    tap.push(output);
                }
            };
            device.build_output_stream(&stream_config, data_callback, err_callback, None)?
        }
        SampleFormat::I16 => {
            let data_callback = move |output: &mut [i16], _: &cpal::OutputCallbackInfo| {
                bridge.render_i16(output);
                if let Some(tap) = &recorder {
                    tap.push_i16(output);
                }
            };
            device.build_output_stream(&stream_config, data_callback, err_callback, None)?
        }
        other => return Err(anyhow!("Unsupported sample format {:?}", other)),
    };

    stream.play()?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(channels: u16, format: SampleFormat, min_rate: u32, max_rate: u32) -> OfferedConfig {
        OfferedConfig {
            channels,
            format,
            min_rate,
            max_rate,
        }
    }

    #[test]
    fn prefers_float_then_sixteen_bit_stereo() {
        let offered = [
            offer(1, SampleFormat::F32, 8000, 192000),
            offer(2, SampleFormat::I16, 8000, 192000),
            offer(2, SampleFormat::F32, 44100, 48000),
        ];
        assert_eq!(pick_config(&offered, 48000), Some(2));
        assert_eq!(pick_config(&offered, 32000), Some(1));
        assert_eq!(pick_config(&offered[..1], 48000), None);
    }

    #[test]
    fn fixed_buffer_only_within_device_range() {
        let range = SupportedBufferSize::Range { min: 64, max: 1024 };
        assert_eq!(buffer_size_for(&range, 512), BufferSize::Fixed(512));
        assert_eq!(buffer_size_for(&range, 4096), BufferSize::Default);
        assert_eq!(buffer_size_for(&SupportedBufferSize::Unknown, 256), BufferSize::Fixed(256));
    }
}
