//! Focused-element introspection: reading the final text of whatever UI
//! element holds keyboard focus in another process. Used to recover composed
//! (IME) input that raw keystroke buffering would mangle.
//!
//! Everything here degrades: missing permission, a wedged target process, or
//! a non-text focus target all resolve to "no text" and the caller falls back
//! to its keystroke buffer.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use tracing::debug;

/// Structural roles whose "value" is not user-authored text. Reading these
/// would capture menu labels, table contents and similar noise.
pub const NON_TEXT_ROLES: &[&str] = &[
    "AXButton",
    "AXCheckBox",
    "AXRadioButton",
    "AXMenuItem",
    "AXMenu",
    "AXMenuBar",
    "AXMenuBarItem",
    "AXToolbar",
    "AXImage",
    "AXScrollBar",
    "AXSplitter",
    "AXTabGroup",
    "AXTab",
    "AXOutline",
    "AXRow",
    "AXColumn",
    "AXTable",
    "AXBrowser",
    "AXList",
    "AXGroup",
    "AXSplitGroup",
];

/// Capability check: is the OS letting us introspect other processes at all?
pub trait PermissionGate: Send + Sync + 'static {
    fn is_authorized(&self) -> bool;
}

/// Raw observation of the focused UI element of one process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FocusedElement {
    pub role: Option<String>,
    pub value: Option<String>,
}

/// Reads the focused element of the process identified by `pid`. Platform
/// glue implements this; `None` means no focused element could be resolved
/// (trying app-level, window-level and system-wide focus in turn is the
/// implementation's concern).
pub trait FocusedTextReader: Send + Sync + 'static {
    fn read_focused(&self, pid: i32) -> Option<FocusedElement>;
}

/// Outcome of one introspection attempt, with all three cases explicit so
/// callers cannot conflate "nothing focused" with "focused on a button".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FocusedText {
    NoFocusedElement,
    NonTextRole(String),
    Text(String),
}

fn classify(element: FocusedElement) -> FocusedText {
    if let Some(role) = element.role {
        if NON_TEXT_ROLES.contains(&role.as_str()) {
            return FocusedText::NonTextRole(role);
        }
    }
    match element.value {
        Some(value) if !value.is_empty() => FocusedText::Text(value),
        _ => FocusedText::NoFocusedElement,
    }
}

/// Gate + reader + bounded timeout, bundled for the monitor.
#[derive(Clone)]
pub struct IntrospectionClient {
    gate: Arc<dyn PermissionGate>,
    reader: Arc<dyn FocusedTextReader>,
    timeout: Duration,
}

impl IntrospectionClient {
    pub fn new(
        gate: Arc<dyn PermissionGate>,
        reader: Arc<dyn FocusedTextReader>,
        timeout: Duration,
    ) -> Self {
        Self { gate, reader, timeout }
    }

    /// A client that never yields text. Used where the platform has no
    /// introspection backend; commit then always uses the keystroke buffer.
    pub fn disabled() -> Self {
        Self::new(
            Arc::new(DeniedGate),
            Arc::new(UnavailableReader),
            Duration::from_millis(1),
        )
    }

    /// Read the focused text of `pid`, within the configured timeout. The
    /// reader runs on a helper thread; if the target process stalls it past
    /// the deadline, the stuck call is abandoned and we report no element.
    pub fn read(&self, pid: i32) -> FocusedText {
        if !self.gate.is_authorized() || pid <= 0 {
            debug!(pid, "introspection skipped: not authorized or invalid pid");
            return FocusedText::NoFocusedElement;
        }

        let (tx, rx) = bounded(1);
        let reader = Arc::clone(&self.reader);
        thread::spawn(move || {
            let _ = tx.try_send(reader.read_focused(pid));
        });

        match rx.recv_timeout(self.timeout) {
            Ok(Some(element)) => classify(element),
            Ok(None) => FocusedText::NoFocusedElement,
            Err(_) => {
                debug!(pid, timeout_ms = self.timeout.as_millis() as u64, "introspection timed out");
                FocusedText::NoFocusedElement
            }
        }
    }
}

/// Gate that always refuses; pairs with [`UnavailableReader`].
pub struct DeniedGate;

impl PermissionGate for DeniedGate {
    fn is_authorized(&self) -> bool {
        false
    }
}

/// Gate that always allows. Useful for tests and platforms without a
/// separate authorization step.
pub struct TrustedGate;

impl PermissionGate for TrustedGate {
    fn is_authorized(&self) -> bool {
        true
    }
}

/// Reader for platforms with no introspection support.
pub struct UnavailableReader;

impl FocusedTextReader for UnavailableReader {
    fn read_focused(&self, _pid: i32) -> Option<FocusedElement> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedReader(FocusedElement);

    impl FocusedTextReader for FixedReader {
        fn read_focused(&self, _pid: i32) -> Option<FocusedElement> {
            Some(self.0.clone())
        }
    }

    struct StallingReader(Duration);

    impl FocusedTextReader for StallingReader {
        fn read_focused(&self, _pid: i32) -> Option<FocusedElement> {
            thread::sleep(self.0);
            Some(FocusedElement {
                role: Some("AXTextArea".into()),
                value: Some("too late".into()),
            })
        }
    }

    fn client(reader: impl FocusedTextReader) -> IntrospectionClient {
        IntrospectionClient::new(Arc::new(TrustedGate), Arc::new(reader), Duration::from_millis(100))
    }

    #[test]
    fn denied_gate_short_circuits() {
        let client = IntrospectionClient::new(
            Arc::new(DeniedGate),
            Arc::new(FixedReader(FocusedElement {
                role: Some("AXTextField".into()),
                value: Some("secret".into()),
            })),
            Duration::from_millis(100),
        );
        assert_eq!(client.read(42), FocusedText::NoFocusedElement);
    }

    #[test]
    fn invalid_pid_reads_nothing() {
        let client = client(FixedReader(FocusedElement {
            role: None,
            value: Some("text".into()),
        }));
        assert_eq!(client.read(0), FocusedText::NoFocusedElement);
        assert_eq!(client.read(-1), FocusedText::NoFocusedElement);
    }

    #[test]
    fn text_field_value_comes_back_as_text() {
        let client = client(FixedReader(FocusedElement {
            role: Some("AXTextField".into()),
            value: Some("你好".into()),
        }));
        assert_eq!(client.read(42), FocusedText::Text("你好".into()));
    }

    #[test]
    fn non_text_roles_are_excluded() {
        for role in ["AXButton", "AXMenu", "AXTable"] {
            let client = client(FixedReader(FocusedElement {
                role: Some(role.into()),
                value: Some("label".into()),
            }));
            assert_eq!(client.read(42), FocusedText::NonTextRole(role.into()));
        }
    }

    #[test]
    fn empty_value_is_no_element() {
        let client = client(FixedReader(FocusedElement {
            role: Some("AXTextArea".into()),
            value: Some(String::new()),
        }));
        assert_eq!(client.read(42), FocusedText::NoFocusedElement);
    }

    #[test]
    fn stalled_reader_hits_the_deadline() {
        let client = client(StallingReader(Duration::from_secs(2)));
        assert_eq!(client.read(42), FocusedText::NoFocusedElement);
    }

    #[test]
    fn disabled_client_never_yields_text() {
        assert_eq!(IntrospectionClient::disabled().read(42), FocusedText::NoFocusedElement);
    }
}
