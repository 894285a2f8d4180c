//! Platform probes behind a unified interface, plus the polling focus
//! source built on them. Only focus changes are produced portably; global
//! keystroke hooks need platform-privileged glue and their absence just
//! lowers capture fidelity.
//!
//! With the `native-probes` feature the foreground-app probe binds the OS
//! directly (CoreGraphics on macOS, Xlib on Linux); without it a subprocess
//! fallback (`osascript`, `xdotool`/`xprop`) keeps the crate free of
//! link-time system-library requirements.

use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use crossbeam_channel::Sender;
use tracing::debug;

use crate::events::{FocusChange, MonitorEvent};
use crate::introspect::IntrospectionClient;

/// The application currently in the foreground, or `None` when the platform
/// offers no probe (or the probe's backing facility is unavailable).
pub fn frontmost_app() -> Option<FocusChange> {
    imp::frontmost_app()
}

/// Introspection wired to whatever the platform supports. Unsupported
/// platforms get a permanently denied client and commits use keystrokes.
pub fn introspection_client(timeout: Duration) -> IntrospectionClient {
    imp::introspection_client(timeout)
}

/// Focus-change producer that polls `frontmost_app` and emits an event
/// whenever the foreground application changes.
pub struct PollingFocusSource {
    interval: Duration,
}

impl PollingFocusSource {
    pub fn new(poll_hz: u64) -> Self {
        Self {
            // Floor of 1ms so an oversized rate cannot busy-spin the poller.
            interval: Duration::from_millis((1000 / poll_hz.max(1)).max(1)),
        }
    }
}

impl crate::monitor::EventSource for PollingFocusSource {
    fn current_foreground(&self) -> Option<FocusChange> {
        frontmost_app()
    }

    fn subscribe(&self, events: Sender<MonitorEvent>) -> Result<()> {
        let Some(mut last) = frontmost_app() else {
            bail!("no foreground-window probe available on this platform");
        };
        let interval = self.interval;
        let _poller = thread::Builder::new()
            .name("focus-poll".into())
            .spawn(move || loop {
                thread::sleep(interval);
                let Some(front) = frontmost_app() else { continue };
                if front.pid != last.pid || front.app_name != last.app_name {
                    debug!(app = %front.app_name, pid = front.pid, "foreground app changed");
                    last = front.clone();
                    if events.try_send(MonitorEvent::FocusChange(front)).is_err() {
                        // Consumer gone; stop polling.
                        break;
                    }
                }
            })?;
        Ok(())
    }
}

#[cfg(any(
    target_os = "macos",
    all(target_os = "linux", not(feature = "native-probes"))
))]
fn run_probe(program: &str, args: &[&str]) -> Option<String> {
    let output = std::process::Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(target_os = "macos")]
mod imp {
    use std::sync::Arc;
    use std::time::Duration;

    use super::run_probe;
    use crate::events::FocusChange;
    use crate::introspect::{
        FocusedElement, FocusedTextReader, IntrospectionClient, PermissionGate,
    };

    /// On-screen window list via CoreGraphics; the first layer-0 entry is
    /// the frontmost application window. The window dictionaries carry no
    /// bundle identifier, so `own_bundle_id` matching is unavailable on
    /// this path.
    #[cfg(feature = "native-probes")]
    pub fn frontmost_app() -> Option<FocusChange> {
        use std::ffi::c_void;

        use core_foundation::array::{CFArrayGetCount, CFArrayGetValueAtIndex};
        use core_foundation::base::CFRelease;
        use core_foundation::dictionary::CFDictionaryRef;
        use core_graphics::window::{kCGWindowListOptionOnScreenOnly, CGWindowListCopyWindowInfo};

        unsafe {
            let window_list = CGWindowListCopyWindowInfo(kCGWindowListOptionOnScreenOnly, 0);
            if window_list.is_null() {
                return None;
            }
            let mut front = None;
            for i in 0..CFArrayGetCount(window_list) {
                let dict = CFArrayGetValueAtIndex(window_list, i) as CFDictionaryRef;
                if dict.is_null() {
                    continue;
                }
                // Layer 0 is the normal application-window level.
                if dict_i32(dict, "kCGWindowLayer") != Some(0) {
                    continue;
                }
                let Some(pid) = dict_i32(dict, "kCGWindowOwnerPID") else { continue };
                let Some(app_name) = dict_string(dict, "kCGWindowOwnerName") else { continue };
                if !app_name.is_empty() {
                    front = Some(FocusChange { app_name, bundle_id: None, pid });
                    break;
                }
            }
            CFRelease(window_list as *const c_void);
            front
        }
    }

    #[cfg(feature = "native-probes")]
    unsafe fn dict_value(
        dict: core_foundation::dictionary::CFDictionaryRef,
        key: &str,
    ) -> Option<*const std::ffi::c_void> {
        use core_foundation::base::ToVoid;
        use core_foundation::dictionary::CFDictionaryGetValueIfPresent;
        use core_foundation::string::CFString;

        let key = CFString::new(key);
        let mut value: *const std::ffi::c_void = std::ptr::null();
        if CFDictionaryGetValueIfPresent(dict, key.to_void(), &mut value) != 0 && !value.is_null() {
            Some(value)
        } else {
            None
        }
    }

    #[cfg(feature = "native-probes")]
    unsafe fn dict_i32(
        dict: core_foundation::dictionary::CFDictionaryRef,
        key: &str,
    ) -> Option<i32> {
        use core_foundation::base::TCFType;
        use core_foundation::number::{CFNumber, CFNumberRef};

        let value = dict_value(dict, key)?;
        CFNumber::wrap_under_get_rule(value as CFNumberRef).to_i32()
    }

    #[cfg(feature = "native-probes")]
    unsafe fn dict_string(
        dict: core_foundation::dictionary::CFDictionaryRef,
        key: &str,
    ) -> Option<String> {
        use core_foundation::base::TCFType;
        use core_foundation::string::{CFString, CFStringRef};

        let value = dict_value(dict, key)?;
        Some(CFString::wrap_under_get_rule(value as CFStringRef).to_string())
    }

    #[cfg(not(feature = "native-probes"))]
    const FRONTMOST_SCRIPT: &str = r#"tell application "System Events"
  set p to first application process whose frontmost is true
  return (name of p) & linefeed & (bundle identifier of p) & linefeed & (unix id of p)
end tell"#;

    #[cfg(not(feature = "native-probes"))]
    pub fn frontmost_app() -> Option<FocusChange> {
        let out = run_probe("osascript", &["-e", FRONTMOST_SCRIPT])?;
        let mut lines = out.lines();
        let app_name = lines.next()?.trim().to_string();
        let bundle_id = lines
            .next()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let pid = lines.next()?.trim().parse().ok()?;
        Some(FocusChange { app_name, bundle_id, pid })
    }

    pub fn introspection_client(timeout: Duration) -> IntrospectionClient {
        IntrospectionClient::new(Arc::new(AxTrustGate), Arc::new(AxScriptReader), timeout)
    }

    /// Authorized iff System Events answers at all; a denied accessibility
    /// grant makes the query fail.
    struct AxTrustGate;

    impl PermissionGate for AxTrustGate {
        fn is_authorized(&self) -> bool {
            run_probe(
                "osascript",
                &["-e", r#"tell application "System Events" to return name of first process"#],
            )
            .is_some()
        }
    }

    const FOCUSED_SCRIPT: &str = r#"tell application "System Events"
  set p to first application process whose unix id is {PID}
  set e to value of attribute "AXFocusedUIElement" of p
  return (value of attribute "AXRole" of e) & linefeed & (value of attribute "AXValue" of e)
end tell"#;

    /// Reads the focused element over the scripting bridge. Slow relative to
    /// the raw AX API but dependency-free; the monitor's timeout bounds it.
    struct AxScriptReader;

    impl FocusedTextReader for AxScriptReader {
        fn read_focused(&self, pid: i32) -> Option<FocusedElement> {
            let script = FOCUSED_SCRIPT.replace("{PID}", &pid.to_string());
            let out = run_probe("osascript", &["-e", &script])?;
            let (role, value) = match out.split_once('\n') {
                Some((role, value)) => (role.trim().to_string(), value.to_string()),
                None => (out, String::new()),
            };
            Some(FocusedElement {
                role: if role.is_empty() { None } else { Some(role) },
                value: if value.is_empty() { None } else { Some(value) },
            })
        }
    }
}

#[cfg(all(target_os = "linux", feature = "native-probes"))]
mod imp {
    use std::ffi::CStr;
    use std::ptr;
    use std::time::Duration;

    use x11::xlib;

    use crate::events::FocusChange;
    use crate::introspect::IntrospectionClient;

    /// X11 probe over Xlib: `_NET_ACTIVE_WINDOW` on the root window, then
    /// `_NET_WM_PID` and `WM_CLASS` of that window. The window class stands
    /// in for the display name; there is no bundle-id equivalent, so
    /// `own_bundle_id` matching uses the class string too.
    pub fn frontmost_app() -> Option<FocusChange> {
        unsafe {
            let display = xlib::XOpenDisplay(ptr::null());
            if display.is_null() {
                return None;
            }
            let mut front = None;
            if let Some(window) = active_window(display) {
                if let (Some(pid), Some(class)) =
                    (window_pid(display, window), window_class(display, window))
                {
                    front = Some(FocusChange {
                        app_name: class.clone(),
                        bundle_id: Some(class),
                        pid,
                    });
                }
            }
            xlib::XCloseDisplay(display);
            front
        }
    }

    unsafe fn window_property(
        display: *mut xlib::Display,
        window: xlib::Window,
        name: &[u8],
        prop_type: xlib::Atom,
    ) -> Option<u64> {
        let atom = xlib::XInternAtom(display, name.as_ptr() as *const _, xlib::False);
        let mut actual_type: xlib::Atom = 0;
        let mut actual_format = 0;
        let mut nitems = 0;
        let mut bytes_after = 0;
        let mut prop: *mut u8 = ptr::null_mut();
        let status = xlib::XGetWindowProperty(
            display,
            window,
            atom,
            0,
            1,
            xlib::False,
            prop_type,
            &mut actual_type,
            &mut actual_format,
            &mut nitems,
            &mut bytes_after,
            &mut prop,
        );
        if status != 0 || prop.is_null() {
            return None;
        }
        // Format-32 property data is stored as C long regardless of width.
        let value = *(prop as *const std::os::raw::c_ulong) as u64;
        xlib::XFree(prop as *mut _);
        if nitems == 0 {
            None
        } else {
            Some(value)
        }
    }

    unsafe fn active_window(display: *mut xlib::Display) -> Option<xlib::Window> {
        let root = xlib::XDefaultRootWindow(display);
        let window =
            window_property(display, root, b"_NET_ACTIVE_WINDOW\0", xlib::XA_WINDOW)?;
        if window == 0 {
            None
        } else {
            Some(window as xlib::Window)
        }
    }

    unsafe fn window_pid(display: *mut xlib::Display, window: xlib::Window) -> Option<i32> {
        let pid = window_property(display, window, b"_NET_WM_PID\0", xlib::XA_CARDINAL)? as i32;
        if pid > 0 {
            Some(pid)
        } else {
            None
        }
    }

    unsafe fn window_class(display: *mut xlib::Display, window: xlib::Window) -> Option<String> {
        let mut class_hint: xlib::XClassHint = std::mem::zeroed();
        if xlib::XGetClassHint(display, window, &mut class_hint) == 0 {
            return None;
        }
        let class = if !class_hint.res_class.is_null() {
            Some(CStr::from_ptr(class_hint.res_class).to_string_lossy().into_owned())
        } else if !class_hint.res_name.is_null() {
            Some(CStr::from_ptr(class_hint.res_name).to_string_lossy().into_owned())
        } else {
            None
        };
        if !class_hint.res_name.is_null() {
            xlib::XFree(class_hint.res_name as *mut _);
        }
        if !class_hint.res_class.is_null() {
            xlib::XFree(class_hint.res_class as *mut _);
        }
        class.filter(|c| !c.is_empty())
    }

    /// No portable focused-element introspection on X11; commits fall back
    /// to the keystroke buffer.
    pub fn introspection_client(_timeout: Duration) -> IntrospectionClient {
        IntrospectionClient::disabled()
    }
}

#[cfg(all(target_os = "linux", not(feature = "native-probes")))]
mod imp {
    use std::time::Duration;

    use super::run_probe;
    use crate::events::FocusChange;
    use crate::introspect::IntrospectionClient;

    /// X11 probe via xdotool/xprop. The window class stands in for the
    /// display name; there is no bundle-id equivalent, so `own_bundle_id`
    /// matching uses the class string too.
    pub fn frontmost_app() -> Option<FocusChange> {
        let window = run_probe("xdotool", &["getactivewindow"])?;
        let pid = run_probe("xdotool", &["getwindowpid", &window])?.parse().ok()?;
        let class_line = run_probe("xprop", &["-id", &window, "WM_CLASS"])?;
        // WM_CLASS(STRING) = "instance", "Class"
        let app_name = class_line
            .rsplit('"')
            .nth(1)
            .map(str::to_string)
            .filter(|s| !s.is_empty())?;
        Some(FocusChange { app_name: app_name.clone(), bundle_id: Some(app_name), pid })
    }

    /// No portable focused-element introspection on X11; commits fall back
    /// to the keystroke buffer.
    pub fn introspection_client(_timeout: Duration) -> IntrospectionClient {
        IntrospectionClient::disabled()
    }
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
mod imp {
    use std::time::Duration;

    use crate::events::FocusChange;
    use crate::introspect::IntrospectionClient;

    pub fn frontmost_app() -> Option<FocusChange> {
        None
    }

    pub fn introspection_client(_timeout: Duration) -> IntrospectionClient {
        IntrospectionClient::disabled()
    }
}
