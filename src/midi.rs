use anyhow::{Result, anyhow};
use midir::{Ignore, MidiInput, MidiInputConnection};
use midly::{MetaMessage, MidiMessage as MidlyMidiMessage, Smf, Timing, TrackEventKind};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::app::TuiMessage;
use crate::engine::{SynthBridge, pack_short_message};
use crate::synth_core::SynthCore;

/// Converts a MIDI note number to its name (e.g., 60 -> "C4").
fn midi_note_to_name(note: u8) -> String {
    const NOTES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];
    let octave = (note / 12) as i8 - 1; // MIDI note 0 is C-1
    let note_name = NOTES[(note % 12) as usize];
    format!("{}{}", note_name, octave)
}

/// One-line description for the MIDI log. Real-time and unknown messages yield `None`.
pub fn describe_message(message: &[u8]) -> Option<String> {
    let (&status, data) = message.split_first()?;
    let channel = (status & 0x0F) + 1;
    let d1 = data.first().copied().unwrap_or(0);
    let d2 = data.get(1).copied().unwrap_or(0);
    match status {
        0x90..=0x9F if d2 > 0 => Some(format!("Note On: {} (Ch {}, Vel {})", midi_note_to_name(d1), channel, d2)),
        0x80..=0x9F => Some(format!("Note Off: {} (Ch {})", midi_note_to_name(d1), channel)),
        0xB0..=0xBF => Some(format!("CC {} = {} (Ch {})", d1, d2, channel)),
        0xC0..=0xCF => Some(format!("Program {} (Ch {})", d1 as u16 + 1, channel)),
        0xE0..=0xEF => Some(format!("Pitch Bend {} (Ch {})", ((d2 as i32) << 7 | d1 as i32) - 8192, channel)),
        0xF0 => Some(format!("SysEx ({} bytes)", message.len())),
        _ => None,
    }
}

/// Hands one raw message to the bridge and reports it to the UI.
///
/// `0xF0` messages go through the SysEx path; anything else is packed as a
/// short message, missing data bytes read as zero.
pub fn forward_message<C: SynthCore>(bridge: &SynthBridge<C>, message: &[u8], tui_tx: &Sender<TuiMessage>) {
    let Some(&status) = message.first() else {
        return;
    };

    if status == 0xF0 {
        bridge.handle_sysex(message);
    } else {
        let data1 = message.get(1).copied().unwrap_or(0);
        let data2 = message.get(2).copied().unwrap_or(0);
        bridge.handle_short_message(pack_short_message(status, data1, data2));

        if status & 0xF0 == 0x90 && data2 > 0 {
            let _ = tui_tx.send(TuiMessage::ChannelActivity(status & 0x0F, Instant::now()));
        }
    }

    if let Some(text) = describe_message(message) {
        let _ = tui_tx.send(TuiMessage::MidiLog(text));
    }
}

pub fn get_midi_device_names() -> Result<Vec<String>> {
    let midi_in = MidiInput::new("rusty-sc55-probe")?;
    midi_in
        .ports()
        .iter()
        .map(|port| midi_in.port_name(port).map_err(|e| anyhow!("{}", e)))
        .collect()
}

/// Connects to the named input port, or the first one when no name is given.
/// A name matches when it is contained in the port name, ignoring case.
pub fn setup_midi_input<C: SynthCore + Send + 'static>(
    bridge: Arc<SynthBridge<C>>,
    device_name: Option<&str>,
    tui_tx: Sender<TuiMessage>,
) -> Result<MidiInputConnection<()>> {
    let mut midi_in = MidiInput::new("rusty-sc55-input")?;
    midi_in.ignore(Ignore::ActiveSense);

    let in_ports = midi_in.ports();
    let in_port = match device_name {
        Some(wanted) => {
            let wanted = wanted.to_lowercase();
            in_ports
                .iter()
                .find(|port| {
                    midi_in
                        .port_name(port)
                        .is_ok_and(|name| name.to_lowercase().contains(&wanted))
                })
                .ok_or_else(|| anyhow!("MIDI input port '{}' not found", wanted))?
        }
        None => in_ports
            .first()
            .ok_or_else(|| anyhow!("No MIDI input ports found!"))?,
    };

    let port_name = midi_in.port_name(in_port)?;
    log::info!("[MIDI] Opening MIDI connection to {}", port_name);

    let connection = midi_in
        .connect(
            in_port,
            "rusty-sc55-in",
            move |_timestamp, message, _| {
                forward_message(&bridge, message, &tui_tx);
            },
            (),
        )
        .map_err(|e| anyhow!("Failed to connect to MIDI input: {}", e))?;

    Ok(connection)
}

/// A channel or SysEx message at an absolute tick.
#[derive(Debug, Clone, PartialEq)]
enum FileEvent {
    Message(Vec<u8>),
    Tempo(u32),
}

/// Encodes a channel message as the status byte plus its data bytes.
fn encode_channel_message(channel: u8, message: &MidlyMidiMessage) -> Vec<u8> {
    let channel = channel & 0x0F;
    match *message {
        MidlyMidiMessage::NoteOff { key, vel } => vec![0x80 | channel, key.as_int(), vel.as_int()],
        MidlyMidiMessage::NoteOn { key, vel } => vec![0x90 | channel, key.as_int(), vel.as_int()],
        MidlyMidiMessage::Aftertouch { key, vel } => vec![0xA0 | channel, key.as_int(), vel.as_int()],
        MidlyMidiMessage::Controller { controller, value } => {
            vec![0xB0 | channel, controller.as_int(), value.as_int()]
        }
        MidlyMidiMessage::ProgramChange { program } => vec![0xC0 | channel, program.as_int()],
        MidlyMidiMessage::ChannelAftertouch { vel } => vec![0xD0 | channel, vel.as_int()],
        MidlyMidiMessage::PitchBend { bend } => {
            let value = bend.0.as_int();
            vec![0xE0 | channel, (value & 0x7F) as u8, (value >> 7) as u8]
        }
    }
}

/// Merges every track into one list ordered by absolute tick. Events on the
/// same tick keep their track order.
fn merge_tracks(smf: &Smf) -> Vec<(u64, FileEvent)> {
    let mut tracks: Vec<_> = smf.tracks.iter().map(|track| track.iter().peekable()).collect();
    let mut track_ticks: Vec<u64> = vec![0; tracks.len()];
    let mut merged = Vec::new();

    loop {
        // Find the track with the earliest upcoming event
        let mut next: Option<(usize, u64)> = None;
        for (i, track_iter) in tracks.iter_mut().enumerate() {
            if let Some(event) = track_iter.peek() {
                let tick = track_ticks[i] + event.delta.as_int() as u64;
                if next.is_none_or(|(_, best)| tick < best) {
                    next = Some((i, tick));
                }
            }
        }
        let Some((track_idx, tick)) = next else {
            break; // All tracks are finished
        };
        let Some(event) = tracks[track_idx].next() else {
            break;
        };
        track_ticks[track_idx] = tick;

        match event.kind {
            TrackEventKind::Midi { channel, message } => {
                merged.push((tick, FileEvent::Message(encode_channel_message(channel.as_int(), &message))));
            }
            TrackEventKind::SysEx(data) => {
                let mut bytes = Vec::with_capacity(data.len() + 1);
                bytes.push(0xF0);
                bytes.extend_from_slice(data);
                merged.push((tick, FileEvent::Message(bytes)));
            }
            TrackEventKind::Meta(MetaMessage::Tempo(micros)) => {
                merged.push((tick, FileEvent::Tempo(micros.as_int())));
            }
            _ => {} // Ignore escapes and other meta events
        }
    }

    merged
}

/// Spawns a new thread that plays a MIDI file into the bridge.
pub fn play_midi_file<C: SynthCore + Send + 'static>(
    path: PathBuf,
    bridge: Arc<SynthBridge<C>>,
    tui_tx: Sender<TuiMessage>,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let data = fs::read(&path).map_err(|e| anyhow!("Failed to read MIDI file {}: {}", path.display(), e))?;
    let smf = Smf::parse(&data).map_err(|e| anyhow!("Failed to parse MIDI file: {}", e))?;
    let tpqn = match smf.header.timing {
        Timing::Metrical(t) => t.as_int() as f64,
        _ => return Err(anyhow!("Unsupported MIDI timing format (must be Metrical/TPQN)")),
    };
    let events = merge_tracks(&smf);
    log::info!("[MidiPlayer] {} events in {}", events.len(), path.display());

    let handle = thread::spawn(move || {
        let _ = tui_tx.send(TuiMessage::MidiLog(format!("Starting playback of {}...", path.display())));

        // Default tempo: 120 BPM = 500,000 microseconds per quarter note
        let mut micros_per_quarter = 500_000.0;
        let mut last_tick = 0u64;
        let mut elapsed_micros = 0.0f64;
        let start = Instant::now();

        for (tick, event) in events {
            if stop.load(Ordering::Relaxed) {
                log::info!("[MidiPlayer] Playback stopped.");
                return;
            }

            elapsed_micros += (tick - last_tick) as f64 * micros_per_quarter / tpqn;
            last_tick = tick;
            let due = start + Duration::from_micros(elapsed_micros as u64);
            loop {
                let now = Instant::now();
                if due <= now {
                    break;
                }
                if stop.load(Ordering::Relaxed) {
                    log::info!("[MidiPlayer] Playback stopped.");
                    return;
                }
                thread::sleep((due - now).min(Duration::from_millis(20)));
            }

            match event {
                FileEvent::Message(bytes) => forward_message(&bridge, &bytes, &tui_tx),
                FileEvent::Tempo(micros) => {
                    micros_per_quarter = micros as f64;
                    log::debug!("[MidiPlayer] Tempo {} us/q", micros);
                }
            }
        }

        let _ = tui_tx.send(TuiMessage::MidiLog("Playback finished.".into()));
        let _ = tui_tx.send(TuiMessage::PlaybackFinished);
    });

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSettings;
    use crate::rom_loader::{AcquiredRomSet, RomImageSet};
    use crate::synth_core::testing::{Event, ScriptedCore};
    use midly::num::{u4, u7, u14, u15, u24, u28};
    use midly::{Format, Header, PitchBend, TrackEvent};
    use std::sync::Mutex;
    use std::sync::mpsc;

    fn bridge() -> (SynthBridge<ScriptedCore>, Arc<Mutex<Vec<Event>>>) {
        let (core, log) = ScriptedCore::new(32000, [0, 0]);
        let rom = AcquiredRomSet {
            index: 0,
            label: "SC-55mk2".to_string(),
            images: RomImageSet::new(0),
            rejections: Vec::new(),
        };
        let bridge = SynthBridge::open(core, rom, &EngineSettings::default()).expect("bridge");
        (bridge, log)
    }

    fn written(log: &Arc<Mutex<Vec<Event>>>) -> Vec<u8> {
        log.lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::Write(b) => Some(*b),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn note_names() {
        assert_eq!(midi_note_to_name(60), "C4");
        assert_eq!(midi_note_to_name(0), "C-1");
        assert_eq!(midi_note_to_name(127), "G9");
    }

    #[test]
    fn forwards_short_messages_and_reports_activity() {
        let (bridge, log) = bridge();
        let (tx, rx) = mpsc::channel();

        forward_message(&bridge, &[0x93, 64, 90], &tx);
        forward_message(&bridge, &[0x93, 64, 0], &tx);
        forward_message(&bridge, &[0xC1, 5], &tx);
        forward_message(&bridge, &[], &tx);

        assert_eq!(written(&log), vec![0x93, 64, 90, 0x93, 64, 0, 0xC1, 5]);
        let messages: Vec<_> = rx.try_iter().collect();
        let activity: Vec<u8> = messages
            .iter()
            .filter_map(|m| match m {
                TuiMessage::ChannelActivity(ch, _) => Some(*ch),
                _ => None,
            })
            .collect();
        assert_eq!(activity, vec![3]);
        assert!(messages.iter().any(|m| matches!(m, TuiMessage::MidiLog(text) if text == "Note On: E4 (Ch 4, Vel 90)")));
        assert!(messages.iter().any(|m| matches!(m, TuiMessage::MidiLog(text) if text == "Note Off: E4 (Ch 4)")));
    }

    #[test]
    fn sysex_takes_the_sysex_path() {
        let (bridge, log) = bridge();
        let (tx, _rx) = mpsc::channel();
        let message = [0xF0, 0x41, 0x10, 0x42, 0x12, 0x40, 0x00, 0x7F, 0x00, 0x41, 0xF7];
        forward_message(&bridge, &message, &tx);
        assert_eq!(written(&log), message);
        assert_eq!(bridge.last_message(), None);
    }

    #[test]
    fn channel_messages_encode_to_wire_bytes() {
        let ch = 9;
        assert_eq!(
            encode_channel_message(ch, &MidlyMidiMessage::NoteOn { key: u7::new(36), vel: u7::new(127) }),
            vec![0x99, 36, 127]
        );
        assert_eq!(
            encode_channel_message(ch, &MidlyMidiMessage::ProgramChange { program: u7::new(16) }),
            vec![0xC9, 16]
        );
        assert_eq!(
            encode_channel_message(0, &MidlyMidiMessage::PitchBend { bend: PitchBend(u14::new(0x2000)) }),
            vec![0xE0, 0x00, 0x40]
        );
    }

    #[test]
    fn tracks_merge_by_absolute_tick() {
        let note = |delta: u32, key: u8| TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Midi {
                channel: u4::new(0),
                message: MidlyMidiMessage::NoteOn { key: u7::new(key), vel: u7::new(100) },
            },
        };
        let mut smf = Smf::new(Header::new(Format::Parallel, Timing::Metrical(u15::new(96))));
        smf.tracks.push(vec![
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(250_000))),
            },
            note(10, 60),
            note(20, 62),
        ]);
        let gs_reset = [0x41, 0x10, 0x42, 0x12, 0x40, 0x00, 0x7F, 0x00, 0x41, 0xF7];
        smf.tracks.push(vec![
            TrackEvent {
                delta: u28::new(5),
                kind: TrackEventKind::SysEx(&gs_reset),
            },
            note(10, 61),
        ]);

        let merged = merge_tracks(&smf);
        let ticks: Vec<u64> = merged.iter().map(|(tick, _)| *tick).collect();
        assert_eq!(ticks, vec![0, 5, 10, 15, 30]);
        assert_eq!(merged[0].1, FileEvent::Tempo(250_000));
        match &merged[1].1 {
            FileEvent::Message(bytes) => {
                assert_eq!(bytes[0], 0xF0);
                assert_eq!(&bytes[1..], gs_reset);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(merged[2].1, FileEvent::Message(vec![0x90, 60, 100]));
        assert_eq!(merged[3].1, FileEvent::Message(vec![0x90, 61, 100]));
        assert_eq!(merged[4].1, FileEvent::Message(vec![0x90, 62, 100]));
    }

    #[test]
    fn file_playback_forwards_everything_and_reports_the_end() {
        let mut smf = Smf::new(Header::new(Format::SingleTrack, Timing::Metrical(u15::new(480))));
        smf.tracks.push(vec![
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Midi {
                    channel: u4::new(1),
                    message: MidlyMidiMessage::NoteOn { key: u7::new(60), vel: u7::new(80) },
                },
            },
            TrackEvent {
                delta: u28::new(1),
                kind: TrackEventKind::Midi {
                    channel: u4::new(1),
                    message: MidlyMidiMessage::NoteOff { key: u7::new(60), vel: u7::new(0) },
                },
            },
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
            },
        ]);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("two_notes.mid");
        smf.save(&path).expect("write smf");

        let (bridge, log) = bridge();
        let (tx, rx) = mpsc::channel();
        let handle = play_midi_file(path, Arc::new(bridge), tx, Arc::new(AtomicBool::new(false))).expect("playback");
        handle.join().expect("player thread");

        assert_eq!(written(&log), vec![0x91, 60, 80, 0x81, 60, 0]);
        assert!(rx.try_iter().any(|m| matches!(m, TuiMessage::PlaybackFinished)));
    }

    #[test]
    fn missing_file_is_an_error() {
        let (bridge, _) = bridge();
        let (tx, _rx) = mpsc::channel();
        let result = play_midi_file(
            PathBuf::from("/nonexistent/file.mid"),
            Arc::new(bridge),
            tx,
            Arc::new(AtomicBool::new(false)),
        );
        assert!(result.is_err());
    }
}
