use crate::rom_loader::RomImageSet;

pub const LCD_WIDTH: usize = 128;
pub const LCD_HEIGHT: usize = 64;

/// One stereo frame in the 16-bit signed domain.
pub type StereoFrame = [i32; 2];

/// The emulated synthesizer the bridge drives.
///
/// It consumes raw MIDI bytes one at a time and produces one stereo frame
/// per `update` at its own native rate. Implementations are not expected to
/// be thread-safe; the bridge serializes every call.
pub trait SynthCore {
    /// Loads the ROM images. The images are only borrowed for the duration of the call.
    fn open(&mut self, images: &RomImageSet);
    fn write(&mut self, byte: u8);
    /// Generates the next native-rate frame.
    fn update(&mut self) -> StereoFrame;
    fn native_sample_rate(&self) -> u32;
    fn lcd_refresh(&mut self);
    /// Monochrome LCD contents, row-major, one byte per pixel (non-zero = set).
    fn lcd_buffer(&self) -> &[u8];
}

impl<C: SynthCore + ?Sized> SynthCore for Box<C> {
    fn open(&mut self, images: &RomImageSet) {
        (**self).open(images)
    }

    fn write(&mut self, byte: u8) {
        (**self).write(byte)
    }

    fn update(&mut self) -> StereoFrame {
        (**self).update()
    }

    fn native_sample_rate(&self) -> u32 {
        (**self).native_sample_rate()
    }

    fn lcd_refresh(&mut self) {
        (**self).lcd_refresh()
    }

    fn lcd_buffer(&self) -> &[u8] {
        (**self).lcd_buffer()
    }
}

/// Binding to the native emulator library (`libnukedsc55`).
#[cfg(feature = "nuked-sc55")]
pub mod native {
    use std::os::raw::c_int;
    use std::ptr;
    use std::sync::atomic::{AtomicBool, Ordering};

    use anyhow::{Result, anyhow};

    use super::{LCD_HEIGHT, LCD_WIDTH, StereoFrame, SynthCore};
    use crate::rom_loader::RomImageSet;
    use crate::rom_sets::ROM_SET_N_FILES;

    #[repr(C)]
    struct Sc55Rom {
        data: *mut u8,
        size: u32,
    }

    #[repr(C)]
    struct Sc55RomImage {
        romset: c_int,
        image: [Sc55Rom; ROM_SET_N_FILES],
    }

    #[link(name = "nukedsc55")]
    unsafe extern "C" {
        fn SC55_Open(image: *mut Sc55RomImage);
        fn SC55_Write(byte: u8);
        fn SC55_Update(sample: *mut i32);
        fn SC55_SampleFreq() -> u32;
        fn SC55_LCD_Update();
        fn SC55_LCD_Buffer() -> *mut u8;
    }

    /// The library keeps its emulator state in globals.
    static CORE_TAKEN: AtomicBool = AtomicBool::new(false);

    pub struct NativeCore {
        lcd: Vec<u8>,
    }

    impl NativeCore {
        /// Claims the library's single emulator instance.
        pub fn new() -> Result<Self> {
            if CORE_TAKEN.swap(true, Ordering::SeqCst) {
                return Err(anyhow!("The native synthesis core is already in use"));
            }
            Ok(Self {
                lcd: vec![0; LCD_WIDTH * LCD_HEIGHT],
            })
        }
    }

    impl Drop for NativeCore {
        fn drop(&mut self) {
            CORE_TAKEN.store(false, Ordering::SeqCst);
        }
    }

    impl SynthCore for NativeCore {
        fn open(&mut self, images: &RomImageSet) {
            let mut raw = Sc55RomImage {
                romset: images.romset as c_int,
                image: std::array::from_fn(|slot| match images.image(slot) {
                    // The library only reads through these pointers during SC55_Open.
                    Some(image) => Sc55Rom {
                        data: image.data.as_ptr().cast_mut(),
                        size: image.data.len() as u32,
                    },
                    None => Sc55Rom {
                        data: ptr::null_mut(),
                        size: 0,
                    },
                }),
            };
            // SAFETY: `raw` points at buffers owned by `images`, which outlive this call,
            // and the library copies what it keeps.
            unsafe { SC55_Open(&mut raw) };
        }

        fn write(&mut self, byte: u8) {
            // SAFETY: plain value call into the single emulator instance claimed in `new`.
            unsafe { SC55_Write(byte) };
        }

        fn update(&mut self) -> StereoFrame {
            let mut frame: StereoFrame = [0; 2];
            // SAFETY: the library writes exactly two samples into the pointer.
            unsafe { SC55_Update(frame.as_mut_ptr()) };
            frame
        }

        fn native_sample_rate(&self) -> u32 {
            // SAFETY: read-only query.
            unsafe { SC55_SampleFreq() }
        }

        fn lcd_refresh(&mut self) {
            // SAFETY: the buffer returned by the library holds LCD_WIDTH * LCD_HEIGHT bytes.
            unsafe {
                SC55_LCD_Update();
                let buffer = SC55_LCD_Buffer();
                if !buffer.is_null() {
                    ptr::copy_nonoverlapping(buffer, self.lcd.as_mut_ptr(), self.lcd.len());
                }
            }
        }

        fn lcd_buffer(&self) -> &[u8] {
            &self.lcd
        }
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::{Arc, Mutex};

    use super::{LCD_HEIGHT, LCD_WIDTH, StereoFrame, SynthCore};
    use crate::rom_loader::RomImageSet;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Event {
        Open { romset: usize, images: usize },
        Write(u8),
        Pull,
    }

    /// Records every call in order; the log stays readable after the core moves into a bridge.
    pub struct ScriptedCore {
        native_rate: u32,
        frames: Vec<StereoFrame>,
        pulls: usize,
        log: Arc<Mutex<Vec<Event>>>,
        lcd: Vec<u8>,
        refreshes: usize,
    }

    impl ScriptedCore {
        pub fn new(native_rate: u32, frame: StereoFrame) -> (Self, Arc<Mutex<Vec<Event>>>) {
            Self::cycling(native_rate, vec![frame])
        }

        /// Plays `frames` in a loop, one per pull.
        pub fn cycling(native_rate: u32, frames: Vec<StereoFrame>) -> (Self, Arc<Mutex<Vec<Event>>>) {
            let log = Arc::new(Mutex::new(Vec::new()));
            let core = Self {
                native_rate,
                frames,
                pulls: 0,
                log: Arc::clone(&log),
                lcd: vec![0; LCD_WIDTH * LCD_HEIGHT],
                refreshes: 0,
            };
            (core, log)
        }

        fn record(&self, event: Event) {
            self.log.lock().unwrap().push(event);
        }
    }

    impl SynthCore for ScriptedCore {
        fn open(&mut self, images: &RomImageSet) {
            self.record(Event::Open {
                romset: images.romset,
                images: images.loaded_count(),
            });
        }

        fn write(&mut self, byte: u8) {
            self.record(Event::Write(byte));
        }

        fn update(&mut self) -> StereoFrame {
            self.record(Event::Pull);
            let frame = self.frames[self.pulls % self.frames.len()];
            self.pulls += 1;
            frame
        }

        fn native_sample_rate(&self) -> u32 {
            self.native_rate
        }

        // Each refresh lights one more pixel, left to right.
        fn lcd_refresh(&mut self) {
            let len = self.lcd.len();
            self.lcd[self.refreshes % len] = 1;
            self.refreshes += 1;
        }

        fn lcd_buffer(&self) -> &[u8] {
            &self.lcd
        }
    }
}
