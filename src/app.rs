use std::time::Instant;

/// Messages sent from the MIDI and playback threads to the UI thread.
#[derive(Debug, Clone)]
pub enum TuiMessage {
    /// A formatted string for the MIDI log.
    MidiLog(String),
    /// An error message to display.
    Error(String),
    /// A note-on arrived on this channel (0-15).
    ChannelActivity(u8, Instant),
    /// The MIDI file player ran out of events.
    PlaybackFinished,
}
