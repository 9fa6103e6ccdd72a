use anyhow::Result;
use crossterm::{
    event::{
        self, Event, KeyCode, KeyEventKind, KeyboardEnhancementFlags, PopKeyboardEnhancementFlags,
        PushKeyboardEnhancementFlags,
    },
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, List, ListItem, Paragraph},
};
use std::{
    collections::VecDeque,
    io::{Stdout, stdout},
    sync::atomic::{AtomicBool, Ordering},
    sync::{Arc, mpsc::Receiver},
    time::{Duration, Instant},
};

use crate::app::TuiMessage;
use crate::engine::{DisplayTarget, SynthBridge, short_message_data_len};
use crate::synth_core::{LCD_HEIGHT, LCD_WIDTH, SynthCore};
use crate::timed_ring_buffer::{NO_DATA, TimedRingBuffer};

const MIDI_LOG_LINES: usize = 100;
/// How long a channel indicator stays lit after a note-on.
const ACTIVITY_HOLD_MS: u32 = 150;
const VOLUME_STEP: u8 = 5;

/// Local copy of the LCD, filled through [`DisplayTarget`].
pub struct LcdImage {
    pixels: Vec<bool>,
}

impl LcdImage {
    pub fn new() -> Self {
        Self {
            pixels: vec![false; LCD_WIDTH * LCD_HEIGHT],
        }
    }

    fn pixel(&self, x: usize, y: usize) -> bool {
        y < LCD_HEIGHT && self.pixels[y * LCD_WIDTH + x]
    }

    /// Two pixel rows per text row using half-block characters.
    pub fn half_block_rows(&self) -> Vec<String> {
        (0..LCD_HEIGHT)
            .step_by(2)
            .map(|y| {
                (0..LCD_WIDTH)
                    .map(|x| match (self.pixel(x, y), self.pixel(x, y + 1)) {
                        (true, true) => '█',
                        (true, false) => '▀',
                        (false, true) => '▄',
                        (false, false) => ' ',
                    })
                    .collect()
            })
            .collect()
    }
}

impl Default for LcdImage {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplayTarget for LcdImage {
    fn set_pixel(&mut self, x: usize, y: usize) {
        if let Some(pixel) = self.pixels.get_mut(y * LCD_WIDTH + x) {
            *pixel = true;
        }
    }

    fn clear_pixel(&mut self, x: usize, y: usize) {
        if let Some(pixel) = self.pixels.get_mut(y * LCD_WIDTH + x) {
            *pixel = false;
        }
    }
}

/// Sixteen channel indicators with timed release.
///
/// Every note-on lights its channel and queues the channel's release time.
/// `tick` turns off channels whose latest release time has passed.
pub struct ChannelActivity {
    epoch: Instant,
    lit: [bool; 16],
    release_at: [u32; 16],
    releases: TimedRingBuffer<u8, 256>,
}

impl ChannelActivity {
    pub fn new(epoch: Instant) -> Self {
        Self {
            epoch,
            lit: [false; 16],
            release_at: [0; 16],
            releases: TimedRingBuffer::new(),
        }
    }

    fn millis(&self, at: Instant) -> u32 {
        at.saturating_duration_since(self.epoch).as_millis() as u32
    }

    pub fn note_on(&mut self, channel: u8, at: Instant) {
        let channel = channel & 0x0F;
        let due = self.millis(at).saturating_add(ACTIVITY_HOLD_MS);
        // The queue overwrites when full; release the oldest entry early instead.
        if self.releases.len() == self.releases.capacity() - 1 {
            self.release_next();
        }
        self.lit[channel as usize] = true;
        self.release_at[channel as usize] = due;
        self.releases.enqueue(due, channel);
    }

    /// Turns every indicator off and forgets pending releases.
    pub fn clear(&mut self) {
        self.lit = [false; 16];
        self.releases.reset();
    }

    pub fn tick(&mut self, now: Instant) {
        let now = self.millis(now);
        while self.releases.peek() != NO_DATA && self.releases.peek() <= now {
            self.release_next();
        }
    }

    fn release_next(&mut self) {
        let due = self.releases.peek();
        let channel = self.releases.dequeue() as usize;
        // A later note-on on the same channel keeps it lit.
        if due >= self.release_at[channel] {
            self.lit[channel] = false;
        }
    }

    pub fn is_lit(&self, channel: usize) -> bool {
        self.lit.get(channel).copied().unwrap_or(false)
    }
}

/// "90 3C 64" style rendering of a packed short message.
pub fn format_short_message(message: u32) -> String {
    let bytes = message.to_le_bytes();
    bytes[..1 + short_message_data_len(bytes[0])]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

struct TuiState<C: SynthCore> {
    bridge: Arc<SynthBridge<C>>,
    lcd: LcdImage,
    activity: ChannelActivity,
    midi_log: VecDeque<String>,
    ticks: u32,
}

impl<C: SynthCore> TuiState<C> {
    fn new(bridge: Arc<SynthBridge<C>>) -> Self {
        Self {
            bridge,
            lcd: LcdImage::new(),
            activity: ChannelActivity::new(Instant::now()),
            midi_log: VecDeque::with_capacity(MIDI_LOG_LINES),
            ticks: 0,
        }
    }

    fn add_midi_log(&mut self, line: String) {
        if self.midi_log.len() == MIDI_LOG_LINES {
            self.midi_log.pop_front();
        }
        self.midi_log.push_back(line);
    }

    fn handle_message(&mut self, message: TuiMessage) {
        match message {
            TuiMessage::MidiLog(line) => self.add_midi_log(line),
            TuiMessage::Error(e) => {
                log::error!("[TUI] {}", e);
                self.add_midi_log(format!("ERROR: {}", e));
            }
            TuiMessage::ChannelActivity(channel, at) => self.activity.note_on(channel, at),
            TuiMessage::PlaybackFinished => {}
        }
    }

    fn change_volume(&self, up: bool) {
        let volume = self.bridge.master_volume();
        let volume = if up {
            volume.saturating_add(VOLUME_STEP)
        } else {
            volume.saturating_sub(VOLUME_STEP)
        };
        self.bridge.set_master_volume(volume);
    }
}

/// Runs until `q`/`Esc` or until `is_running` is cleared elsewhere.
pub fn run_tui_loop<C: SynthCore>(
    bridge: Arc<SynthBridge<C>>,
    tui_rx: Receiver<TuiMessage>,
    is_running: Arc<AtomicBool>,
) -> Result<()> {
    let mut terminal = setup_terminal()?;
    let mut tui_state = TuiState::new(bridge);

    while is_running.load(Ordering::Relaxed) {
        while let Ok(message) = tui_rx.try_recv() {
            tui_state.handle_message(message);
        }
        tui_state.activity.tick(Instant::now());
        tui_state.bridge.update_display(&mut tui_state.lcd, tui_state.ticks);
        tui_state.ticks = tui_state.ticks.wrapping_add(1);

        terminal.draw(|f| ui(f, &tui_state))?;

        if event::poll(Duration::from_millis(30))? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => is_running.store(false, Ordering::SeqCst),
                    KeyCode::Char('+') | KeyCode::Char('=') => tui_state.change_volume(true),
                    KeyCode::Char('-') => tui_state.change_volume(false),
                    KeyCode::Char('p') => {
                        tui_state.bridge.panic();
                        tui_state.activity.clear();
                        tui_state.add_midi_log("Panic: all notes off".to_string());
                    }
                    _ => {}
                }
            }
        }
    }

    cleanup_terminal()?;
    Ok(())
}

fn ui<C: SynthCore>(frame: &mut Frame, state: &TuiState<C>) {
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length((LCD_HEIGHT / 2) as u16 + 2), // LCD
            Constraint::Length(3),                           // Status
            Constraint::Length(3),                           // Channels
            Constraint::Min(3),                              // MIDI Log
            Constraint::Length(1),                           // Footer
        ])
        .split(frame.area());

    let bridge = &state.bridge;
    let lcd_lines: Vec<Line> = state.lcd.half_block_rows().into_iter().map(Line::from).collect();
    let lcd = Paragraph::new(lcd_lines)
        .style(Style::default().fg(Color::LightGreen))
        .block(Block::default().borders(Borders::ALL).title(bridge.rom_label()));
    frame.render_widget(lcd, layout[0]);

    let last = bridge
        .last_message()
        .map(format_short_message)
        .unwrap_or_else(|| "-".to_string());
    let status = Paragraph::new(format!(
        "Vol: {}%  |  {} Hz -> {} Hz ({})  |  Last: {}",
        bridge.master_volume(),
        bridge.native_sample_rate(),
        bridge.output_sample_rate(),
        bridge.resampler_kind(),
        last
    ))
    .block(Block::default().borders(Borders::ALL).title("Status"));
    frame.render_widget(status, layout[1]);

    let channels: Vec<Span> = (0..16)
        .flat_map(|channel| {
            let style = if state.activity.is_lit(channel) {
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)
            } else {
                Style::default().fg(Color::DarkGray)
            };
            [Span::styled(format!("{:>2}", channel + 1), style), Span::raw(" ")]
        })
        .collect();
    let channels = Paragraph::new(Line::from(channels))
        .block(Block::default().borders(Borders::ALL).title("Channels"));
    frame.render_widget(channels, layout[2]);

    let visible = layout[3].height.saturating_sub(2) as usize;
    let log_items: Vec<ListItem> = state
        .midi_log
        .iter()
        .rev()
        .take(visible)
        .rev()
        .map(|line| ListItem::new(line.as_str()))
        .collect();
    let log = List::new(log_items).block(Block::default().borders(Borders::ALL).title("MIDI Log"));
    frame.render_widget(log, layout[3]);

    let footer = Paragraph::new("q/Esc: quit  +/-: volume  p: panic").style(Style::default().fg(Color::DarkGray));
    frame.render_widget(footer, layout[4]);
}

/// Helper to set up the terminal for TUI mode.
pub fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    let mut stdout = stdout();
    enable_raw_mode()?;
    execute!(stdout, EnterAlternateScreen)?;
    // REPORT_EVENT_TYPES is required to distinguish Press vs Release
    if matches!(crossterm::terminal::supports_keyboard_enhancement(), Ok(true)) {
        execute!(
            stdout,
            PushKeyboardEnhancementFlags(KeyboardEnhancementFlags::REPORT_EVENT_TYPES)
        )?;
    }
    Ok(Terminal::new(CrosstermBackend::new(stdout))?)
}

/// Helper to clean up the terminal.
pub fn cleanup_terminal() -> Result<()> {
    let mut stdout = stdout();
    if matches!(crossterm::terminal::supports_keyboard_enhancement(), Ok(true)) {
        let _ = execute!(stdout, PopKeyboardEnhancementFlags);
    }
    execute!(stdout, LeaveAlternateScreen)?;
    disable_raw_mode()?;
    Ok(())
}
