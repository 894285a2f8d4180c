//! Event types crossing the boundary between OS glue (producers) and the
//! activity monitor (single consumer).

use crossbeam_channel::Sender;

/// Virtual key code for the main Return key.
pub const KEY_RETURN: u16 = 36;
/// Virtual key code for the numeric-keypad Enter key.
pub const KEY_KEYPAD_ENTER: u16 = 76;

/// Modifier flags captured alongside a key-down event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modifiers {
    pub command: bool,
    pub control: bool,
    pub option: bool,
    pub shift: bool,
}

impl Modifiers {
    /// Command/control chords are reserved for shortcuts and never buffered.
    pub fn is_shortcut_chord(&self) -> bool {
        self.command || self.control
    }
}

/// A raw key-down observation from the global event stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyEvent {
    pub key_code: u16,
    pub modifiers: Modifiers,
    /// Characters the event resolved to, if any. May still contain control
    /// characters; the monitor filters to printable content.
    pub characters: Option<String>,
}

impl KeyEvent {
    /// Enter/Return (either variant) finalizes the current buffer.
    pub fn is_commit(&self) -> bool {
        self.key_code == KEY_RETURN || self.key_code == KEY_KEYPAD_ENTER
    }

    /// The event's printable characters, control characters stripped.
    pub fn printable(&self) -> String {
        self.characters
            .as_deref()
            .unwrap_or("")
            .chars()
            .filter(|c| !c.is_control())
            .collect()
    }
}

/// A foreground-application change observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusChange {
    /// Display name of the newly focused application.
    pub app_name: String,
    /// Stable bundle/package identifier, when the platform reports one.
    pub bundle_id: Option<String>,
    /// Process id of the newly focused application.
    pub pid: i32,
}

/// Everything the monitor's consumer thread can receive.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    KeyDown(KeyEvent),
    FocusChange(FocusChange),
    /// Manual submission from the utility's own input field.
    Manual(String),
    /// Barrier: acknowledged once every event submitted before it has been
    /// processed. Lets callers wait on the pipeline instead of sleeping.
    Sync(Sender<()>),
    /// Stops the consumer thread. Producers holding a live sender only
    /// notice the consumer is gone on their next send, so teardown must not
    /// wait for them to drop their handles.
    Shutdown,
}
