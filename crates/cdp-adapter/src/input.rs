//! Raw `Input.*` dispatch: mouse clicks, drags and key chords.

use serde::Serialize;
use serde_json::json;

use crate::error::{AdapterError, AdapterErrorKind};
use crate::session::{quad, CdpSession, Domain};

pub const MODIFIER_ALT: u32 = 1;
pub const MODIFIER_CTRL: u32 = 2;
pub const MODIFIER_META: u32 = 4;
pub const MODIFIER_SHIFT: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn offset(self, dx: f64, dy: f64) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }
}

async fn mouse(
    session: &CdpSession,
    kind: &str,
    at: Point,
    buttons: u32,
) -> Result<(), AdapterError> {
    let mut params = json!({
        "type": kind,
        "x": at.x,
        "y": at.y,
        "button": if kind == "mouseMoved" && buttons == 0 { "none" } else { "left" },
        "buttons": buttons,
    });
    if kind != "mouseMoved" {
        params["clickCount"] = json!(1);
    }
    session.send("Input.dispatchMouseEvent", params).await?;
    Ok(())
}

/// A coordinate click that did not complete.
#[derive(Debug)]
pub struct ClickDispatchError {
    /// `mousePressed` was accepted, so the page may already have seen the press.
    pub pressed: bool,
    pub error: AdapterError,
}

/// Left click at viewport coordinates of the main frame.
pub async fn click_at(session: &CdpSession, at: Point) -> Result<(), ClickDispatchError> {
    let before_press = |error| ClickDispatchError { pressed: false, error };
    mouse(session, "mouseMoved", at, 0).await.map_err(before_press)?;
    mouse(session, "mousePressed", at, 1).await.map_err(before_press)?;
    mouse(session, "mouseReleased", at, 0)
        .await
        .map_err(|error| ClickDispatchError { pressed: true, error })
}

/// Center of the node's content quad, falling back to its border quad.
pub async fn node_center(session: &CdpSession, backend_node_id: i64) -> Result<Point, AdapterError> {
    session.enable(Domain::Dom).await?;
    let model = session
        .send("DOM.getBoxModel", json!({ "backendNodeId": backend_node_id }))
        .await?;
    let model = &model["model"];
    let points = quad(&model["content"])
        .filter(|q| quad_area(q) > 0.0)
        .or_else(|| quad(&model["border"]))
        .ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::Protocol)
                .with_method("DOM.getBoxModel")
                .with_hint(format!("node {backend_node_id} has no usable box model"))
        })?;
    Ok(quad_center(&points))
}

pub fn quad_center(points: &[f64; 8]) -> Point {
    let x = (points[0] + points[2] + points[4] + points[6]) / 4.0;
    let y = (points[1] + points[3] + points[5] + points[7]) / 4.0;
    Point::new(x, y)
}

fn quad_area(points: &[f64; 8]) -> f64 {
    let mut area = 0.0;
    for i in 0..4 {
        let (x1, y1) = (points[i * 2], points[i * 2 + 1]);
        let j = (i + 1) % 4;
        let (x2, y2) = (points[j * 2], points[j * 2 + 1]);
        area += x1 * y2 - x2 * y1;
    }
    (area / 2.0).abs()
}

/// Press at `from`, move in `steps` increments, release at `to`.
pub async fn drag(
    session: &CdpSession,
    from: Point,
    to: Point,
    steps: u32,
) -> Result<(), AdapterError> {
    let steps = steps.max(1);
    mouse(session, "mouseMoved", from, 0).await?;
    mouse(session, "mousePressed", from, 1).await?;
    for step in 1..=steps {
        let t = f64::from(step) / f64::from(steps);
        let at = Point::new(from.x + (to.x - from.x) * t, from.y + (to.y - from.y) * t);
        mouse(session, "mouseMoved", at, 1).await?;
    }
    mouse(session, "mouseReleased", to, 0).await
}

/// A key with optional modifiers, e.g. `Enter`, `Ctrl+A`, `Shift+Tab`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyChord {
    pub key: String,
    pub code: String,
    pub text: Option<String>,
    pub virtual_key: u32,
    pub modifiers: u32,
}

impl KeyChord {
    pub fn parse(raw: &str) -> Result<Self, AdapterError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AdapterError::new(AdapterErrorKind::Internal).with_hint("empty key"));
        }
        // A lone "+" is the plus key, not a separator.
        let parts: Vec<&str> = if trimmed == "+" {
            vec!["+"]
        } else {
            trimmed.split('+').map(str::trim).collect()
        };
        let (base, mods) = match parts.split_last() {
            Some((base, mods)) if !base.is_empty() => (*base, mods),
            _ => {
                return Err(AdapterError::new(AdapterErrorKind::Internal)
                    .with_hint(format!("malformed key chord '{raw}'")))
            }
        };

        let mut modifiers = 0;
        for name in mods {
            modifiers |= match name.to_ascii_lowercase().as_str() {
                "alt" | "option" => MODIFIER_ALT,
                "ctrl" | "control" => MODIFIER_CTRL,
                "meta" | "cmd" | "command" => MODIFIER_META,
                "shift" => MODIFIER_SHIFT,
                other => {
                    return Err(AdapterError::new(AdapterErrorKind::Internal)
                        .with_hint(format!("unknown modifier '{other}' in '{raw}'")))
                }
            };
        }

        let (key, code, text, virtual_key) = named_key(base).unwrap_or_else(|| printable(base, modifiers));
        let text = if modifiers & (MODIFIER_CTRL | MODIFIER_ALT | MODIFIER_META) != 0 {
            None
        } else {
            text
        };

        Ok(Self {
            key,
            code,
            text,
            virtual_key,
            modifiers,
        })
    }
}

fn named_key(name: &str) -> Option<(String, String, Option<String>, u32)> {
    let (key, code, text, vk): (&str, &str, Option<&str>, u32) = match name.to_ascii_lowercase().as_str() {
        "enter" | "return" => ("Enter", "Enter", Some("\r"), 13),
        "tab" => ("Tab", "Tab", None, 9),
        "escape" | "esc" => ("Escape", "Escape", None, 27),
        "backspace" => ("Backspace", "Backspace", None, 8),
        "delete" | "del" => ("Delete", "Delete", None, 46),
        "insert" => ("Insert", "Insert", None, 45),
        "space" => (" ", "Space", Some(" "), 32),
        "arrowup" | "up" => ("ArrowUp", "ArrowUp", None, 38),
        "arrowdown" | "down" => ("ArrowDown", "ArrowDown", None, 40),
        "arrowleft" | "left" => ("ArrowLeft", "ArrowLeft", None, 37),
        "arrowright" | "right" => ("ArrowRight", "ArrowRight", None, 39),
        "home" => ("Home", "Home", None, 36),
        "end" => ("End", "End", None, 35),
        "pageup" => ("PageUp", "PageUp", None, 33),
        "pagedown" => ("PageDown", "PageDown", None, 34),
        "f1" => ("F1", "F1", None, 112),
        "f2" => ("F2", "F2", None, 113),
        "f3" => ("F3", "F3", None, 114),
        "f4" => ("F4", "F4", None, 115),
        "f5" => ("F5", "F5", None, 116),
        "f6" => ("F6", "F6", None, 117),
        "f7" => ("F7", "F7", None, 118),
        "f8" => ("F8", "F8", None, 119),
        "f9" => ("F9", "F9", None, 120),
        "f10" => ("F10", "F10", None, 121),
        "f11" => ("F11", "F11", None, 122),
        "f12" => ("F12", "F12", None, 123),
        _ => return None,
    };
    Some((key.to_string(), code.to_string(), text.map(str::to_string), vk))
}

fn printable(base: &str, modifiers: u32) -> (String, String, Option<String>, u32) {
    let mut chars = base.chars();
    let single = match (chars.next(), chars.next()) {
        (Some(ch), None) => Some(ch),
        _ => None,
    };
    match single {
        Some(ch) if ch.is_ascii_alphabetic() => {
            let upper = ch.to_ascii_uppercase();
            let key = if modifiers & MODIFIER_SHIFT != 0 {
                upper.to_string()
            } else {
                ch.to_string()
            };
            (key.clone(), format!("Key{upper}"), Some(key), upper as u32)
        }
        Some(ch) if ch.is_ascii_digit() => {
            (ch.to_string(), format!("Digit{ch}"), Some(ch.to_string()), ch as u32)
        }
        Some(ch) => (ch.to_string(), String::new(), Some(ch.to_string()), 0),
        None => (base.to_string(), base.to_string(), None, 0),
    }
}

/// keyDown (with text when printable), keyUp.
pub async fn press_key(session: &CdpSession, chord: &KeyChord) -> Result<(), AdapterError> {
    let mut down = json!({
        "type": if chord.text.is_some() { "keyDown" } else { "rawKeyDown" },
        "key": chord.key,
        "code": chord.code,
        "windowsVirtualKeyCode": chord.virtual_key,
        "modifiers": chord.modifiers,
    });
    if let Some(text) = &chord.text {
        down["text"] = json!(text);
        down["unmodifiedText"] = json!(text);
    }
    session.send("Input.dispatchKeyEvent", down).await?;
    session
        .send(
            "Input.dispatchKeyEvent",
            json!({
                "type": "keyUp",
                "key": chord.key,
                "code": chord.code,
                "windowsVirtualKeyCode": chord.virtual_key,
                "modifiers": chord.modifiers,
            }),
        )
        .await?;
    Ok(())
}
