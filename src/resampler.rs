use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::synth_core::{StereoFrame, SynthCore};

/// Output ticks per output sample in the step-blend accumulator.
pub const WAVE_STEP: i32 = 1 << 16;

pub const FRAC_SHIFT: u32 = 14;
pub const SCALE: u32 = 1 << FRAC_SHIFT;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
#[value(rename_all = "kebab-case")]
pub enum ResamplerKind {
    /// Box-filter average of every native frame overlapping an output sample
    #[default]
    StepBlend,
    /// Sample-and-hold on a 14-bit fractional position
    FixedPoint,
    /// Like fixed-point, blending the previous and current native frame
    FixedPointLinear,
}

impl std::fmt::Display for ResamplerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResamplerKind::StepBlend => "step-blend",
            ResamplerKind::FixedPoint => "fixed-point",
            ResamplerKind::FixedPointLinear => "fixed-point-linear",
        };
        f.write_str(name)
    }
}

/// Converts native-rate frames pulled from a core into output-rate frames.
///
/// Both rates must be non-zero; the bridge checks them before building one.
/// Call [`prime`](Self::prime) once before the first [`produce_frame`](Self::produce_frame).
#[derive(Debug)]
pub enum Resampler {
    StepBlend(StepBlend),
    FixedPoint(FixedPoint),
}

impl Resampler {
    pub fn new(kind: ResamplerKind, native_rate: u32, output_rate: u32) -> Self {
        match kind {
            ResamplerKind::StepBlend => Resampler::StepBlend(StepBlend::new(native_rate, output_rate)),
            ResamplerKind::FixedPoint => Resampler::FixedPoint(FixedPoint::new(native_rate, output_rate, false)),
            ResamplerKind::FixedPointLinear => {
                Resampler::FixedPoint(FixedPoint::new(native_rate, output_rate, true))
            }
        }
    }

    pub fn prime<C: SynthCore + ?Sized>(&mut self, core: &mut C) {
        match self {
            Resampler::StepBlend(r) => r.prime(core),
            Resampler::FixedPoint(r) => r.prime(core),
        }
    }

    /// Next output-rate frame, in the 16-bit domain before volume.
    #[inline]
    pub fn produce_frame<C: SynthCore + ?Sized>(&mut self, core: &mut C) -> StereoFrame {
        match self {
            Resampler::StepBlend(r) => r.produce_frame(core),
            Resampler::FixedPoint(r) => r.produce_frame(core),
        }
    }
}

/// Box filter over native frames.
///
/// `position` is where the current native frame ends and `wave_position` where
/// the next output sample starts, both in output ticks. The arithmetic wraps;
/// only their difference is ever compared, and it stays far below `i32::MAX`.
#[derive(Debug)]
pub struct StepBlend {
    step: i32,
    position: i32,
    wave_position: i32,
    current: StereoFrame,
}

impl StepBlend {
    pub fn new(native_rate: u32, output_rate: u32) -> Self {
        debug_assert!(native_rate > 0 && output_rate > 0);
        let step = (WAVE_STEP as i64 * output_rate as i64 / native_rate.max(1) as i64).clamp(1, i32::MAX as i64);
        Self {
            step: step as i32,
            position: 0,
            wave_position: 0,
            current: [0; 2],
        }
    }

    fn prime<C: SynthCore + ?Sized>(&mut self, core: &mut C) {
        self.current = core.update();
        self.wave_position = 0;
        self.position = self.step;
    }

    fn produce_frame<C: SynthCore + ?Sized>(&mut self, core: &mut C) -> StereoFrame {
        let mut sum = [0i64; 2];

        let overlap = self.position.wrapping_sub(self.wave_position).clamp(0, WAVE_STEP);
        sum[0] += self.current[0] as i64 * overlap as i64;
        sum[1] += self.current[1] as i64 * overlap as i64;
        self.wave_position = self.wave_position.wrapping_add(WAVE_STEP);

        loop {
            let deficit = self.wave_position.wrapping_sub(self.position);
            if deficit <= 0 {
                break;
            }
            self.current = core.update();
            let weight = deficit.min(self.step) as i64;
            sum[0] += self.current[0] as i64 * weight;
            sum[1] += self.current[1] as i64 * weight;
            self.position = self.position.wrapping_add(self.step);
        }

        [
            (sum[0] / WAVE_STEP as i64) as i32,
            (sum[1] / WAVE_STEP as i64) as i32,
        ]
    }
}

/// Fixed-point phase accumulator with optional linear blending.
#[derive(Debug)]
pub struct FixedPoint {
    ratio: u32,
    position: u32,
    interpolate: bool,
    previous: StereoFrame,
    current: StereoFrame,
}

impl FixedPoint {
    pub fn new(native_rate: u32, output_rate: u32, interpolate: bool) -> Self {
        debug_assert!(native_rate > 0 && output_rate > 0);
        let ratio = (native_rate as u64 * SCALE as u64 / output_rate.max(1) as u64).min(u32::MAX as u64 / 2);
        Self {
            ratio: ratio as u32,
            position: 0,
            interpolate,
            previous: [0; 2],
            current: [0; 2],
        }
    }

    fn prime<C: SynthCore + ?Sized>(&mut self, core: &mut C) {
        self.current = core.update();
        self.previous = self.current;
        self.position = 0;
    }

    fn produce_frame<C: SynthCore + ?Sized>(&mut self, core: &mut C) -> StereoFrame {
        self.position += self.ratio;
        while self.position >= SCALE {
            self.previous = self.current;
            self.current = core.update();
            self.position -= SCALE;
        }

        if !self.interpolate {
            return self.current;
        }
        let frac = self.position as i64;
        let blend = |prev: i32, cur: i32| {
            (prev as i64 + (((cur as i64 - prev as i64) * frac) >> FRAC_SHIFT)) as i32
        };
        [
            blend(self.previous[0], self.current[0]),
            blend(self.previous[1], self.current[1]),
        ]
    }
}
