//! Activity monitor: turns the raw key/focus event stream into committed
//! `UsageRecord`s.
//!
//! Keystrokes accumulate in a per-app buffer and commit on Enter. At commit
//! time the monitor tries to read the focused element's final text (which is
//! what the user actually produced under an IME), falling back to the raw
//! buffer when introspection is unavailable or returns something that is
//! clearly not this input (see `accept_ratio`). Switching apps discards the
//! uncommitted buffer: partial input in an app being left is not reliably
//! attributable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::events::{FocusChange, KeyEvent, MonitorEvent};
use crate::introspect::{FocusedText, IntrospectionClient};
use crate::record::UsageRecord;
use crate::store::HistoryStore;

/// How many events can sit between the OS callback and the consumer thread
/// before producers start dropping.
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Monitor tunables. `accept_ratio` bounds the introspection heuristic:
/// focused text is trusted only while its char count is at most
/// `accept_ratio` times the buffered keystroke count, guarding against
/// reading an entire unrelated document. The default of 3 is empirical.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub own_bundle_id: Option<String>,
    pub accept_ratio: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { own_bundle_id: None, accept_ratio: 3 }
    }
}

/// Where events come from. Platform glue implements this; `subscribe` is
/// called exactly once per monitor and installs whatever hooks the platform
/// supports, feeding them into `events`.
pub trait EventSource {
    /// The application currently in the foreground, used to seed session
    /// state at start.
    fn current_foreground(&self) -> Option<FocusChange>;

    /// Install the OS-level subscription. An error here is logged, not
    /// fatal: the monitor keeps running at reduced capture fidelity.
    fn subscribe(&self, events: Sender<MonitorEvent>) -> Result<()>;
}

struct MonitorSeed {
    rx: Receiver<MonitorEvent>,
    store: HistoryStore,
    introspection: IntrospectionClient,
    config: MonitorConfig,
}

/// Public face of the monitor. `start` is idempotent; `record` is callable
/// from any thread and never touches I/O on the caller's thread.
pub struct ActivityMonitor {
    tx: Sender<MonitorEvent>,
    started: AtomicBool,
    seed: Mutex<Option<MonitorSeed>>,
}

impl ActivityMonitor {
    pub fn new(store: HistoryStore, introspection: IntrospectionClient, config: MonitorConfig) -> Self {
        let (tx, rx) = bounded(EVENT_QUEUE_CAPACITY);
        Self {
            tx,
            started: AtomicBool::new(false),
            seed: Mutex::new(Some(MonitorSeed { rx, store, introspection, config })),
        }
    }

    /// Starts the consumer thread and installs the event subscription.
    /// Calling it again is a no-op. A source that cannot install its hooks
    /// leaves the monitor running with whatever events still arrive.
    pub fn start(&self, source: &dyn EventSource) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let seed = match self.seed.lock().expect("monitor seed lock").take() {
            Some(seed) => seed,
            None => return,
        };

        let mut state = SessionState::new(&seed.config);
        if let Some(front) = source.current_foreground() {
            state.seed_foreground(&front);
        }

        let MonitorSeed { rx, store, introspection, .. } = seed;
        if let Err(err) = thread::Builder::new()
            .name("activity-monitor".into())
            .spawn(move || run_loop(rx, state, store, introspection))
        {
            warn!(%err, "failed to spawn monitor thread");
            return;
        }

        if let Err(err) = source.subscribe(self.tx.clone()) {
            warn!(%err, "event subscription unavailable; capture fidelity reduced");
        }
    }

    /// Manual submission path for the utility's own input field. The record
    /// is attributed to the previously focused application, since the
    /// utility itself is in the foreground while its field is used.
    pub fn record(&self, text: &str) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        self.submit(MonitorEvent::Manual(trimmed.to_string()));
    }

    /// Producer handle for event sources wired up outside `start`.
    pub fn sender(&self) -> Sender<MonitorEvent> {
        self.tx.clone()
    }

    /// Blocks until every event submitted before this call has been
    /// processed. Used at shutdown and by tests.
    pub fn sync(&self) {
        let (tx, rx) = bounded(1);
        if self.tx.send(MonitorEvent::Sync(tx)).is_ok() {
            let _ = rx.recv();
        }
    }

    /// Tells the consumer thread to exit. Required for orderly teardown:
    /// waiting for channel disconnect is not enough, since a subscribed
    /// producer (e.g. a focus poller) keeps a sender alive until its next
    /// send fails.
    pub fn shutdown(&self) {
        let _ = self.tx.try_send(MonitorEvent::Shutdown);
    }

    fn submit(&self, event: MonitorEvent) {
        if self.tx.try_send(event).is_err() {
            warn!("monitor event queue full or closed; dropping event");
        }
    }
}

impl Drop for ActivityMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(
    rx: Receiver<MonitorEvent>,
    mut state: SessionState,
    store: HistoryStore,
    introspection: IntrospectionClient,
) {
    for event in rx {
        let produced = match event {
            MonitorEvent::KeyDown(key) => state.on_key_down(&key, &introspection),
            MonitorEvent::FocusChange(focus) => state.on_focus_change(focus),
            MonitorEvent::Manual(text) => state.on_manual(&text),
            MonitorEvent::Sync(ack) => {
                let _ = ack.send(());
                None
            }
            MonitorEvent::Shutdown => break,
        };
        if let Some(record) = produced {
            store.append(record);
        }
    }
}

/// All mutable monitor state. Owned by the consumer thread alone; events are
/// applied strictly in arrival order.
struct SessionState {
    current_app: String,
    previous_app: String,
    current_pid: i32,
    is_own_app: bool,
    buffer: String,
    own_bundle_id: Option<String>,
    accept_ratio: u32,
}

impl SessionState {
    fn new(config: &MonitorConfig) -> Self {
        Self {
            current_app: "Unknown".into(),
            previous_app: "Unknown".into(),
            current_pid: 0,
            is_own_app: false,
            buffer: String::new(),
            own_bundle_id: config.own_bundle_id.clone(),
            accept_ratio: config.accept_ratio.max(1),
        }
    }

    fn seed_foreground(&mut self, front: &FocusChange) {
        self.current_app = front.app_name.clone();
        self.previous_app = front.app_name.clone();
        self.current_pid = front.pid;
        self.is_own_app = self.is_own(front.bundle_id.as_deref());
    }

    fn is_own(&self, bundle_id: Option<&str>) -> bool {
        matches!((self.own_bundle_id.as_deref(), bundle_id), (Some(own), Some(seen)) if own == seen)
    }

    fn on_key_down(&mut self, key: &KeyEvent, introspection: &IntrospectionClient) -> Option<UsageRecord> {
        if key.modifiers.is_shortcut_chord() {
            return None;
        }
        if key.is_commit() {
            return self.commit(introspection);
        }
        let printable = key.printable();
        if !printable.is_empty() && !self.is_own_app {
            self.buffer.push_str(&printable);
        }
        None
    }

    fn on_focus_change(&mut self, focus: FocusChange) -> Option<UsageRecord> {
        if self.is_own(focus.bundle_id.as_deref()) {
            // Our own window taking focus is not an app switch worth
            // recording; just stop buffering until focus moves on.
            self.is_own_app = true;
            return None;
        }

        // Uncommitted input in the app being left is not salvageable.
        self.buffer.clear();

        let old_app = std::mem::replace(&mut self.current_app, focus.app_name.clone());
        self.previous_app = old_app.clone();
        self.current_pid = focus.pid;
        self.is_own_app = false;

        Some(UsageRecord::app_switch(&old_app, &focus.app_name))
    }

    fn on_manual(&mut self, text: &str) -> Option<UsageRecord> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(UsageRecord::new(self.previous_app.clone(), trimmed))
    }

    fn commit(&mut self, introspection: &IntrospectionClient) -> Option<UsageRecord> {
        if self.is_own_app {
            return None;
        }
        let keystrokes = std::mem::take(&mut self.buffer);
        if keystrokes.is_empty() {
            return None;
        }
        debug!(chars = keystrokes.chars().count(), "committing buffered input");

        let text = match introspection.read(self.current_pid) {
            FocusedText::Text(focused)
                if focused.chars().count()
                    <= keystrokes.chars().count() * self.accept_ratio as usize =>
            {
                debug!("using introspected focused text");
                focused
            }
            other => {
                debug!(?other, "using keystroke buffer");
                keystrokes
            }
        };

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(UsageRecord::new(self.current_app.clone(), trimmed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{KeyEvent, Modifiers, KEY_KEYPAD_ENTER, KEY_RETURN};
    use crate::introspect::{FocusedElement, FocusedTextReader, TrustedGate};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FixedReader(Option<FocusedElement>);

    impl FocusedTextReader for FixedReader {
        fn read_focused(&self, _pid: i32) -> Option<FocusedElement> {
            self.0.clone()
        }
    }

    fn introspecting(value: &str) -> IntrospectionClient {
        IntrospectionClient::new(
            Arc::new(TrustedGate),
            Arc::new(FixedReader(Some(FocusedElement {
                role: Some("AXTextField".into()),
                value: Some(value.into()),
            }))),
            Duration::from_millis(200),
        )
    }

    fn state() -> SessionState {
        let mut state = SessionState::new(&MonitorConfig {
            own_bundle_id: Some("com.inkstone.tracker".into()),
            accept_ratio: 3,
        });
        state.seed_foreground(&FocusChange {
            app_name: "Notes".into(),
            bundle_id: Some("com.apple.notes".into()),
            pid: 101,
        });
        state
    }

    fn type_text(state: &mut SessionState, text: &str, client: &IntrospectionClient) {
        for c in text.chars() {
            let ev = KeyEvent {
                key_code: 0,
                modifiers: Modifiers::default(),
                characters: Some(c.to_string()),
            };
            assert!(state.on_key_down(&ev, client).is_none());
        }
    }

    fn enter() -> KeyEvent {
        KeyEvent { key_code: KEY_RETURN, modifiers: Modifiers::default(), characters: Some("\r".into()) }
    }

    #[test]
    fn typing_without_commit_produces_nothing() {
        let mut state = state();
        let client = IntrospectionClient::disabled();
        type_text(&mut state, "hello there", &client);
    }

    #[test]
    fn commit_without_introspection_uses_keystrokes() {
        let mut state = state();
        let client = IntrospectionClient::disabled();
        type_text(&mut state, "hello", &client);
        let record = state.on_key_down(&enter(), &client).expect("a record");
        assert_eq!(record.text, "hello");
        assert_eq!(record.app_name, "Notes");
        // Buffer is consumed: a second Enter commits nothing.
        assert!(state.on_key_down(&enter(), &client).is_none());
    }

    #[test]
    fn keypad_enter_also_commits() {
        let mut state = state();
        let client = IntrospectionClient::disabled();
        type_text(&mut state, "hi", &client);
        let ev = KeyEvent {
            key_code: KEY_KEYPAD_ENTER,
            modifiers: Modifiers::default(),
            characters: Some("\u{3}".into()),
        };
        assert!(state.on_key_down(&ev, &client).is_some());
    }

    #[test]
    fn short_introspected_text_wins_over_keystrokes() {
        // One keystroke composed into two CJK chars: 2 <= 1 * 3.
        let mut state = state();
        let client = introspecting("你好");
        type_text(&mut state, "h", &client);
        let record = state.on_key_down(&enter(), &client).expect("a record");
        assert_eq!(record.text, "你好");
    }

    #[test]
    fn oversized_introspected_text_falls_back_to_keystrokes() {
        // A 500-char document against 4 buffered keystrokes: 500 > 4 * 3.
        let mut state = state();
        let client = introspecting(&"x".repeat(500));
        type_text(&mut state, "typo", &client);
        let record = state.on_key_down(&enter(), &client).expect("a record");
        assert_eq!(record.text, "typo");
    }

    #[test]
    fn shortcut_chords_are_ignored_entirely() {
        let mut state = state();
        let client = IntrospectionClient::disabled();
        let ev = KeyEvent {
            key_code: 0,
            modifiers: Modifiers { command: true, ..Default::default() },
            characters: Some("a".into()),
        };
        assert!(state.on_key_down(&ev, &client).is_none());
        // Chorded Enter is not a commit either.
        let chord_enter = KeyEvent {
            key_code: KEY_RETURN,
            modifiers: Modifiers { control: true, ..Default::default() },
            characters: Some("\r".into()),
        };
        type_text(&mut state, "buffered", &client);
        assert!(state.on_key_down(&chord_enter, &client).is_none());
        // The buffer survives for a real commit.
        let record = state.on_key_down(&enter(), &client).expect("a record");
        assert_eq!(record.text, "buffered");
    }

    #[test]
    fn whitespace_only_commit_is_dropped() {
        let mut state = state();
        let client = IntrospectionClient::disabled();
        type_text(&mut state, "   ", &client);
        assert!(state.on_key_down(&enter(), &client).is_none());
    }

    #[test]
    fn app_switch_discards_partial_buffer_and_emits_one_sentinel() {
        let mut state = state();
        let client = IntrospectionClient::disabled();
        type_text(&mut state, "partial", &client);
        let record = state
            .on_focus_change(FocusChange {
                app_name: "Terminal".into(),
                bundle_id: Some("com.apple.terminal".into()),
                pid: 202,
            })
            .expect("a sentinel");
        assert!(record.is_app_switch());
        assert_eq!(record.text, "[switch] Notes \u{2192} Terminal");
        assert_eq!(record.app_name, "Terminal");
        // "partial" is gone: committing in the new app yields nothing.
        assert!(state.on_key_down(&enter(), &client).is_none());
        assert_eq!(state.previous_app, "Notes");
        assert_eq!(state.current_app, "Terminal");
        assert_eq!(state.current_pid, 202);
    }

    #[test]
    fn switching_to_own_app_records_nothing_and_suppresses_capture() {
        let mut state = state();
        let client = IntrospectionClient::disabled();
        assert!(state
            .on_focus_change(FocusChange {
                app_name: "Inkstone".into(),
                bundle_id: Some("com.inkstone.tracker".into()),
                pid: 303,
            })
            .is_none());
        assert!(state.is_own_app);
        // Keystrokes in our own window are not buffered, Enter commits nothing.
        type_text(&mut state, "query text", &client);
        assert!(state.on_key_down(&enter(), &client).is_none());
    }

    #[test]
    fn manual_record_is_attributed_to_the_previous_app() {
        let mut state = state();
        state.on_focus_change(FocusChange {
            app_name: "Terminal".into(),
            bundle_id: Some("com.apple.terminal".into()),
            pid: 202,
        });
        let record = state.on_manual("  what does this error mean  ").expect("a record");
        assert_eq!(record.app_name, "Notes");
        assert_eq!(record.text, "what does this error mean");
        assert!(state.on_manual("   ").is_none());
    }

    // End-to-end through the channel and threads.

    struct ScriptedSource {
        foreground: FocusChange,
        subscribes: std::sync::atomic::AtomicUsize,
    }

    impl EventSource for ScriptedSource {
        fn current_foreground(&self) -> Option<FocusChange> {
            Some(self.foreground.clone())
        }

        fn subscribe(&self, _events: Sender<MonitorEvent>) -> Result<()> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn start_is_idempotent_and_pipeline_reaches_the_store() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::open(dir.path().join("history.json"), Duration::from_secs(60)).unwrap();
        let monitor = ActivityMonitor::new(
            store.clone(),
            IntrospectionClient::disabled(),
            MonitorConfig::default(),
        );
        let source = ScriptedSource {
            foreground: FocusChange { app_name: "Notes".into(), bundle_id: None, pid: 101 },
            subscribes: std::sync::atomic::AtomicUsize::new(0),
        };
        monitor.start(&source);
        monitor.start(&source);
        assert_eq!(source.subscribes.load(Ordering::SeqCst), 1);

        let events = monitor.sender();
        for c in "hello".chars() {
            events
                .send(MonitorEvent::KeyDown(KeyEvent {
                    key_code: 0,
                    modifiers: Modifiers::default(),
                    characters: Some(c.to_string()),
                }))
                .unwrap();
        }
        events.send(MonitorEvent::KeyDown(enter())).unwrap();
        monitor.sync();

        let all = store.load_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].text, "hello");
        assert_eq!(all[0].app_name, "Notes");
    }

    #[test]
    fn teardown_completes_while_a_producer_still_holds_a_sender() {
        // A polling source keeps its sender alive and only notices the
        // consumer is gone when a send fails, so teardown must not wait for
        // the producer side to disconnect first.
        struct ParkedProducerSource;
        impl EventSource for ParkedProducerSource {
            fn current_foreground(&self) -> Option<FocusChange> {
                None
            }
            fn subscribe(&self, events: Sender<MonitorEvent>) -> Result<()> {
                thread::spawn(move || loop {
                    thread::sleep(Duration::from_millis(25));
                    let (ack, _) = crossbeam_channel::bounded(1);
                    if events.try_send(MonitorEvent::Sync(ack)).is_err() {
                        break;
                    }
                });
                Ok(())
            }
        }

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        let store = HistoryStore::open(&path, Duration::from_secs(60)).unwrap();
        let flushes = store.subscribe_flushes();
        let monitor = ActivityMonitor::new(
            store.clone(),
            IntrospectionClient::disabled(),
            MonitorConfig::default(),
        );
        monitor.start(&ParkedProducerSource);
        monitor.record("last words");
        monitor.sync();

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            drop(monitor);
            drop(store);
            while flushes.recv().is_ok() {}
            let _ = done_tx.send(());
        });
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("teardown hung: store worker's final flush never ran");

        let reopened = HistoryStore::open(&path, Duration::from_secs(60)).unwrap();
        let all = reopened.load_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].text, "last words");
    }

    #[test]
    fn failed_subscription_still_leaves_the_pipeline_usable() {
        struct FailingSource;
        impl EventSource for FailingSource {
            fn current_foreground(&self) -> Option<FocusChange> {
                None
            }
            fn subscribe(&self, _events: Sender<MonitorEvent>) -> Result<()> {
                anyhow::bail!("event tap refused")
            }
        }

        let dir = TempDir::new().unwrap();
        let store = HistoryStore::open(dir.path().join("history.json"), Duration::from_secs(60)).unwrap();
        let monitor = ActivityMonitor::new(
            store.clone(),
            IntrospectionClient::disabled(),
            MonitorConfig::default(),
        );
        monitor.start(&FailingSource);

        monitor.record("manual entry");
        monitor.sync();
        let all = store.load_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].text, "manual entry");
        assert_eq!(all[0].app_name, "Unknown");
    }
}
