//! Simulated page answering the operation catalogue, for resolver and
//! executor tests.

use std::collections::HashMap;
use std::sync::Arc;

use cdp_adapter::testing::{PageFixture, ScriptedTransport};
use cdp_adapter::{AdapterError, AdapterErrorKind, CdpSession};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::ops;

type OpHandler = Arc<dyn Fn(&str, &Value) -> Value + Send + Sync>;

#[derive(Clone, Debug)]
pub struct FakeElement {
    pub visible: bool,
    pub text: String,
    pub selector_hint: String,
    pub tag: String,
}

#[derive(Default)]
struct PageState {
    frames: HashMap<String, Vec<FakeElement>>,
    failing: Vec<String>,
    invalid_selector: bool,
    overrides: HashMap<String, OpHandler>,
    url: String,
    title: String,
}

/// A page whose frames hold a scripted list of matches.
pub struct MatchPage {
    fixture: PageFixture,
    state: Arc<Mutex<PageState>>,
}

impl MatchPage {
    pub fn new(frames: &[&str]) -> Self {
        let fixture = PageFixture::new(frames);
        let state = Arc::new(Mutex::new(PageState {
            url: "https://e.test/".to_string(),
            title: "Fixture".to_string(),
            ..PageState::default()
        }));

        let shared = state.clone();
        fixture.on_evaluate(move |frame, expression| {
            let Some((name, args)) = ops::decode(expression) else {
                return Ok(Value::Null);
            };
            let handler = {
                let state = shared.lock();
                if state.failing.iter().any(|failing| failing == frame) {
                    return Err(AdapterError::new(AdapterErrorKind::Protocol)
                        .with_hint("cdp error -32000: Frame was detached"));
                }
                state.overrides.get(name).cloned()
            };
            if let Some(handler) = handler {
                return Ok(handler(frame, &args));
            }
            Ok(answer(&shared.lock(), frame, name, &args))
        });

        Self { fixture, state }
    }

    /// Matches in `frame`, one per visibility flag.
    pub fn with_matches(self, frame: &str, visibility: &[bool]) -> Self {
        let elements = visibility
            .iter()
            .enumerate()
            .map(|(pos, visible)| FakeElement {
                visible: *visible,
                text: format!("{frame} match {pos}"),
                selector_hint: format!("button:nth-of-type({})", pos + 1),
                tag: "button".to_string(),
            })
            .collect();
        self.state.lock().frames.insert(frame.to_string(), elements);
        self
    }

    pub fn with_failing_frame(self, frame: &str) -> Self {
        self.state.lock().failing.push(frame.to_string());
        self
    }

    pub fn with_invalid_selector(self) -> Self {
        self.state.lock().invalid_selector = true;
        self
    }

    /// Replaces the simulated answer of one operation.
    pub fn on_op<F>(&self, name: &str, handler: F)
    where
        F: Fn(&str, &Value) -> Value + Send + Sync + 'static,
    {
        self.state
            .lock()
            .overrides
            .insert(name.to_string(), Arc::new(handler));
    }

    /// Url and title reported by `pageState` and `Target.getTargetInfo`.
    pub fn set_page(&self, url: &str, title: &str) {
        {
            let mut state = self.state.lock();
            state.url = url.to_string();
            state.title = title.to_string();
        }
        self.fixture.set_page(url, title);
    }

    /// Removes the match at `index` of `frame`.
    pub fn remove_match(&self, frame: &str, index: usize) {
        if let Some(elements) = self.state.lock().frames.get_mut(frame) {
            if index < elements.len() {
                elements.remove(index);
            }
        }
    }

    pub fn transport(&self) -> Arc<ScriptedTransport> {
        self.fixture.transport()
    }

    pub fn fixture(&self) -> &PageFixture {
        &self.fixture
    }

    /// Arguments of every evaluation of operation `name`, in order.
    pub fn op_calls(&self, name: &str) -> Vec<Value> {
        self.transport()
            .calls_for("Runtime.evaluate")
            .iter()
            .filter_map(|call| {
                let expression = call.params["expression"].as_str()?;
                let (op, args) = ops::decode(expression)?;
                (op == name).then_some(args)
            })
            .collect()
    }

    pub async fn open(&self) -> CdpSession {
        self.fixture.open().await
    }
}

fn preview(element: &FakeElement) -> Value {
    json!({
        "visible": element.visible,
        "text": element.text,
        "textTruncated": false,
        "selectorHint": element.selector_hint,
        "tag": element.tag,
    })
}

fn answer(state: &PageState, frame: &str, name: &str, args: &Value) -> Value {
    let elements: &[FakeElement] = state.frames.get(frame).map(Vec::as_slice).unwrap_or(&[]);
    let invalid = json!({ "error": "invalid_selector", "message": "not a valid selector" });
    let local = args["index"].as_u64().unwrap_or_default() as usize;
    let element = elements.get(local);
    let missing = json!({ "ok": false, "error": "missing", "message": "no element" });

    match name {
        "summary" => {
            if state.invalid_selector {
                return invalid;
            }
            let first = elements.iter().position(|el| el.visible);
            json!({
                "rawCount": elements.len(),
                "firstVisibleIndex": first,
                "visibleCount": elements.iter().filter(|el| el.visible).count(),
            })
        }
        "candidates" => {
            if state.invalid_selector {
                return invalid;
            }
            let limit = args["limit"].as_u64().unwrap_or(u64::MAX) as usize;
            let hidden_only = args["hiddenOnly"].as_bool().unwrap_or(false);
            let items: Vec<Value> = elements
                .iter()
                .enumerate()
                .filter(|(_, el)| !hidden_only || !el.visible)
                .take(limit)
                .map(|(index, el)| {
                    let mut item = preview(el);
                    item["index"] = json!(index);
                    item
                })
                .collect();
            json!({
                "total": elements.len(),
                "hidden": elements.iter().filter(|el| !el.visible).count(),
                "items": items,
            })
        }
        "preview" | "syntheticClick" => match element {
            Some(el) => {
                let mut value = preview(el);
                value["ok"] = json!(true);
                value
            }
            None => missing,
        },
        "element" => match element {
            Some(_) => json!(format!("obj-{frame}-{local}")),
            None => Value::Null,
        },
        "clickPoint" => match element {
            Some(el) if el.visible => json!({
                "ok": true,
                "x": 10.0 + 10.0 * local as f64,
                "y": 20.0,
                "width": 8.0,
                "height": 8.0,
                "obscured": false,
            }),
            Some(_) => json!({ "ok": false, "error": "no_geometry", "message": "element has an empty box" }),
            None => missing,
        },
        "fill" => match element {
            Some(el) => json!({
                "ok": true,
                "kind": "input",
                "tag": "input",
                "valueAfter": args["value"],
                "selectorHint": el.selector_hint,
                "visible": el.visible,
            }),
            None => missing,
        },
        "focus" => json!({ "ok": true, "selectorHint": "body", "focused": true }),
        "activeElement" => json!({ "tag": "body", "selectorHint": "body", "text": "", "textTruncated": false }),
        "textVisible" => json!({ "found": false }),
        "selectorState" => json!({ "valid": true, "count": 0, "visibleCount": 0 }),
        "readyState" => json!({ "readyState": "complete" }),
        "pageState" => json!({
            "url": state.url,
            "title": state.title,
            "readyState": "complete",
            "focus": { "selectorHint": "body", "text": "", "textTruncated": false },
            "roleCounts": { "dialog": 0, "alert": 0, "status": 0, "menu": 0, "listbox": 0 },
        }),
        "uploadDetect" => match element {
            Some(el) => json!({
                "ok": true,
                "kind": "input",
                "multiple": true,
                "accept": null,
                "disabled": false,
                "selectorHint": el.selector_hint,
            }),
            None => missing,
        },
        "href" => match element {
            Some(_) => json!({ "ok": true, "url": null, "download": null }),
            None => missing,
        },
        _ => Value::Null,
    }
}
