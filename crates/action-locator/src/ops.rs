//! In-page operations evaluated inside a frame's isolated world.
//!
//! Every operation is an async function of one JSON argument, prefixed with a
//! shared prelude (matching, visibility, selector hints). The expression is
//! tagged `/*soulact:<name>*/` so it can be recognised in protocol logs.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::{Query, QueryMode};

const PRELUDE: &str = r#"
const SKIP = new Set(['SCRIPT', 'STYLE', 'NOSCRIPT', 'TEMPLATE', 'HEAD', 'META', 'LINK', 'TITLE']);
const collapse = s => String(s == null ? '' : s).replace(/\s+/g, ' ').trim();
const norm = s => collapse(s).toLowerCase();
const clip = (s, n) => { const t = collapse(s); return t.length > n ? { text: t.slice(0, n), truncated: true } : { text: t, truncated: false }; };
const BUTTONISH = new Set(['button', 'submit', 'reset', 'image']);
const texts = el => {
  const out = [];
  const tag = el.tagName.toLowerCase();
  if (tag === 'input' && BUTTONISH.has((el.type || '').toLowerCase())) out.push(el.value);
  const label = el.getAttribute('aria-label');
  if (label) out.push(label);
  out.push(el.innerText !== undefined ? el.innerText : el.textContent);
  return out.map(norm).filter(t => t.length > 0);
};
const textOf = el => {
  const tag = el.tagName.toLowerCase();
  if (tag === 'input' || tag === 'textarea' || tag === 'select') return collapse(el.value || el.getAttribute('aria-label') || el.placeholder || '');
  return collapse(el.getAttribute('aria-label') || (el.innerText !== undefined ? el.innerText : el.textContent) || '');
};
const visible = el => {
  if (!el || !el.isConnected) return false;
  const r = el.getBoundingClientRect();
  if (r.width <= 0 || r.height <= 0) return false;
  const s = getComputedStyle(el);
  return s.visibility !== 'hidden' && s.display !== 'none';
};
const hint = el => {
  if (!el || el.nodeType !== 1) return '';
  if (el.id) return '#' + CSS.escape(el.id);
  const parts = [];
  let n = el;
  while (n && n.nodeType === 1 && n !== document.documentElement && parts.length < 4) {
    let s = n.tagName.toLowerCase();
    if (n.id) { parts.unshift('#' + CSS.escape(n.id)); break; }
    const p = n.parentElement;
    if (p) {
      const same = Array.from(p.children).filter(c => c.tagName === n.tagName);
      if (same.length > 1) s += ':nth-of-type(' + (same.indexOf(n) + 1) + ')';
    }
    parts.unshift(s);
    n = p;
  }
  return parts.join(' > ');
};
const preview = el => {
  const t = clip(textOf(el), 120);
  return { visible: visible(el), text: t.text, textTruncated: t.truncated, selectorHint: hint(el), tag: el.tagName.toLowerCase() };
};
const find = q => {
  if (q.mode === 'selector') return Array.from(document.querySelectorAll(q.value));
  const root = document.body || document.documentElement;
  if (!root) return [];
  const want = norm(q.value);
  const all = [root, ...root.querySelectorAll('*')].filter(el => !SKIP.has(el.tagName));
  const hit = q.mode === 'text' ? t => t === want : t => t.includes(want);
  const matched = all.filter(el => texts(el).some(hit));
  return matched.filter(el => !matched.some(o => o !== el && el.contains(o)));
};
const findSafe = q => {
  try { return { els: find(q) }; }
  catch (e) { return { error: 'invalid_selector', message: String(e && e.message || e) }; }
};
const at = (q, i) => {
  const r = findSafe(q);
  if (r.error) return r;
  const el = r.els[i];
  return el ? { el } : { error: 'missing', message: 'no element at local index ' + i };
};
"#;

/// One catalogued in-page operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOp {
    pub name: &'static str,
    body: &'static str,
}

impl PageOp {
    /// Expression for `Runtime.evaluate`.
    pub fn expression(&self, args: &Value) -> String {
        format!(
            "/*soulact:{}*/(async function (args) {{\n{}\n{}\n}})({})",
            self.name, PRELUDE, self.body, args
        )
    }
}

/// Splits an operation expression back into its name and argument.
pub fn decode(expression: &str) -> Option<(&str, Value)> {
    let rest = expression.strip_prefix("/*soulact:")?;
    let end = rest.find("*/")?;
    let name = &rest[..end];
    let open = expression.rfind("})(")?;
    let raw = expression[open + 3..].strip_suffix(')')?;
    let args = serde_json::from_str(raw).ok()?;
    Some((name, args))
}

/// The query as the prelude's `find` expects it.
pub fn query_arg(query: &Query) -> Value {
    json!({ "mode": query.mode.as_str(), "value": query.raw_query })
}

/// `{rawCount, firstVisibleIndex}` for one frame.
pub const SUMMARY: PageOp = PageOp {
    name: "summary",
    body: r#"
const r = findSafe(args.query);
if (r.error) return r;
const first = r.els.findIndex(visible);
return { rawCount: r.els.length, firstVisibleIndex: first < 0 ? null : first, visibleCount: r.els.filter(visible).length };
"#,
};

/// Previews of the first `limit` matches, optionally only hidden ones.
pub const CANDIDATES: PageOp = PageOp {
    name: "candidates",
    body: r#"
const r = findSafe(args.query);
if (r.error) return r;
const items = [];
let hidden = 0;
r.els.forEach((el, index) => {
  const p = preview(el);
  if (!p.visible) hidden += 1;
  if (args.hiddenOnly && p.visible) return;
  if (items.length < args.limit) items.push(Object.assign({ index }, p));
});
return { total: r.els.length, hidden, items };
"#,
};

/// Preview of the match at `index`.
pub const PREVIEW: PageOp = PageOp {
    name: "preview",
    body: r#"
const r = at(args.query, args.index);
if (r.error) return r;
return Object.assign({ ok: true }, preview(r.el));
"#,
};

/// The element at `index`, returned as a remote object (or null).
pub const ELEMENT: PageOp = PageOp {
    name: "element",
    body: r#"
const r = at(args.query, args.index);
if (r.error) return null;
if (!args.fileInput) return r.el;
const el = r.el;
const isFile = n => n && n.tagName === 'INPUT' && (n.type || '').toLowerCase() === 'file';
if (isFile(el)) return el;
if (el.tagName === 'LABEL' && isFile(el.control)) return el.control;
return el.querySelector('input[type=file]') || null;
"#,
};

/// Scrolls the match into view and reports its center in frame coordinates.
pub const CLICK_POINT: PageOp = PageOp {
    name: "clickPoint",
    body: r#"
const r = at(args.query, args.index);
if (r.error) return Object.assign({ ok: false }, r);
r.el.scrollIntoView({ block: 'center', inline: 'center', behavior: 'instant' });
const b = r.el.getBoundingClientRect();
if (b.width <= 0 || b.height <= 0) return { ok: false, error: 'no_geometry', message: 'element has an empty box' };
const x = b.left + b.width / 2;
const y = b.top + b.height / 2;
const top = document.elementFromPoint(x, y);
return { ok: true, x, y, width: b.width, height: b.height, obscured: !!top && top !== r.el && !r.el.contains(top) };
"#,
};

/// DOM `click()` on the match, then its post-click preview.
pub const SYNTHETIC_CLICK: PageOp = PageOp {
    name: "syntheticClick",
    body: r#"
const r = at(args.query, args.index);
if (r.error) return Object.assign({ ok: false }, r);
const el = r.el;
el.scrollIntoView({ block: 'center', inline: 'center', behavior: 'instant' });
if (typeof el.focus === 'function') el.focus({ preventScroll: true });
el.click();
return Object.assign({ ok: true }, preview(el));
"#,
};

/// Sets the value of a fillable match and fires input/change.
pub const FILL: PageOp = PageOp {
    name: "fill",
    body: r#"
const r = at(args.query, args.index);
if (r.error) return Object.assign({ ok: false }, r);
const el = r.el;
const tag = el.tagName.toLowerCase();
const TEXTUAL = new Set(['', 'text', 'search', 'email', 'url', 'tel', 'password', 'number', 'date', 'datetime-local', 'month', 'week', 'time', 'color', 'range']);
let kind = null;
if (tag === 'textarea') kind = 'textarea';
else if (tag === 'input' && TEXTUAL.has((el.getAttribute('type') || '').toLowerCase())) kind = 'input';
else if (tag === 'select') kind = 'select';
else if (el.isContentEditable) kind = 'contenteditable';
if (!kind) return { ok: false, error: 'not_fillable', message: tag + ' is not fillable', tag, selectorHint: hint(el) };
if (el.disabled) return { ok: false, error: 'not_fillable', message: 'element is disabled', tag, selectorHint: hint(el) };
if (el.readOnly) return { ok: false, error: 'not_fillable', message: 'element is read-only', tag, selectorHint: hint(el) };
el.scrollIntoView({ block: 'center', inline: 'center', behavior: 'instant' });
if (typeof el.focus === 'function') el.focus({ preventScroll: true });
if (kind === 'contenteditable') {
  el.textContent = args.value;
} else if (kind === 'select') {
  const opt = Array.from(el.options).find(o => o.value === args.value || collapse(o.text) === collapse(args.value));
  if (!opt) return { ok: false, error: 'not_fillable', message: 'no option matches the value', tag, selectorHint: hint(el) };
  el.value = opt.value;
} else {
  const proto = kind === 'textarea' ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype;
  const setter = Object.getOwnPropertyDescriptor(proto, 'value').set;
  setter.call(el, args.value);
}
el.dispatchEvent(new Event('input', { bubbles: true, composed: true }));
el.dispatchEvent(new Event('change', { bubbles: true }));
const after = kind === 'contenteditable' ? el.textContent : el.value;
return { ok: true, kind, tag, valueAfter: kind === 'input' && (el.type || '').toLowerCase() === 'password' ? null : after, selectorHint: hint(el), visible: visible(el) };
"#,
};

/// Focuses the match, or the document body when no query is given.
pub const FOCUS: PageOp = PageOp {
    name: "focus",
    body: r#"
let el;
if (args.query) {
  const r = at(args.query, args.index);
  if (r.error) return Object.assign({ ok: false }, r);
  el = r.el;
} else {
  if (document.activeElement && typeof document.activeElement.blur === 'function') document.activeElement.blur();
  el = document.body;
}
if (!el) return { ok: false, error: 'missing', message: 'document has no body' };
if (typeof el.focus === 'function') el.focus({ preventScroll: false });
return { ok: true, selectorHint: hint(el), focused: document.activeElement === el };
"#,
};

/// Current focus: tag, selector hint and text capped at 120 chars.
pub const ACTIVE_ELEMENT: PageOp = PageOp {
    name: "activeElement",
    body: r#"
const el = document.activeElement;
if (!el) return { tag: null, selectorHint: null, text: '', textTruncated: false };
const t = clip(textOf(el), 120);
return { tag: el.tagName.toLowerCase(), selectorHint: hint(el), text: t.text, textTruncated: t.truncated };
"#,
};

/// Whether visible page text contains `args.text` (case-insensitive).
pub const TEXT_VISIBLE: PageOp = PageOp {
    name: "textVisible",
    body: r#"
const body = document.body;
if (!body) return { found: false };
return { found: norm(body.innerText).includes(norm(args.text)) };
"#,
};

/// Selector syntax check plus match/visibility counts.
pub const SELECTOR_STATE: PageOp = PageOp {
    name: "selectorState",
    body: r#"
let els;
try { els = Array.from(document.querySelectorAll(args.selector)); }
catch (e) { return { valid: false, message: String(e && e.message || e), count: 0, visibleCount: 0 }; }
return { valid: true, count: els.length, visibleCount: els.filter(visible).length };
"#,
};

/// Url, title, readyState, focus and visible landmark role counts.
pub const PAGE_STATE: PageOp = PageOp {
    name: "pageState",
    body: r#"
const count = sel => Array.from(document.querySelectorAll(sel)).filter(visible).length;
const el = document.activeElement;
const t = clip(el ? textOf(el) : '', 120);
return {
  url: location.href,
  title: document.title,
  readyState: document.readyState,
  focus: { selectorHint: el ? hint(el) : null, text: t.text, textTruncated: t.truncated },
  roleCounts: {
    dialog: count('[role="dialog"],[role="alertdialog"],dialog[open]'),
    alert: count('[role="alert"]'),
    status: count('[role="status"]'),
    menu: count('[role="menu"]'),
    listbox: count('[role="listbox"]')
  }
};
"#,
};

pub const READY_STATE: PageOp = PageOp {
    name: "readyState",
    body: r#"
return { readyState: document.readyState };
"#,
};

/// Classifies an upload target as a native file input or a chooser trigger.
pub const UPLOAD_DETECT: PageOp = PageOp {
    name: "uploadDetect",
    body: r#"
const r = at(args.query, args.index);
if (r.error) return Object.assign({ ok: false }, r);
const el = r.el;
const isFile = n => n && n.tagName === 'INPUT' && (n.type || '').toLowerCase() === 'file';
let input = null;
if (isFile(el)) input = el;
else if (el.tagName === 'LABEL' && isFile(el.control)) input = el.control;
else input = el.querySelector('input[type=file]');
if (input) return { ok: true, kind: 'input', multiple: !!input.multiple, accept: input.accept || null, disabled: !!input.disabled, selectorHint: hint(input) };
return { ok: true, kind: 'chooser', multiple: false, accept: null, disabled: !!el.disabled, selectorHint: hint(el) };
"#,
};

/// Download candidate url of the match.
pub const HREF: PageOp = PageOp {
    name: "href",
    body: r#"
const r = at(args.query, args.index);
if (r.error) return Object.assign({ ok: false }, r);
const el = r.el;
const link = el.closest('a[href],area[href]');
const url = (link && link.href) || el.src || el.formAction || null;
return { ok: true, url: url && !url.startsWith('javascript:') ? url : null, download: link ? link.getAttribute('download') : null };
"#,
};

/// Fetches `args.url` with page credentials; body is base64.
pub const FETCH: PageOp = PageOp {
    name: "fetch",
    body: r#"
const res = await fetch(args.url, { credentials: 'include', redirect: 'follow' });
const buf = new Uint8Array(await res.arrayBuffer());
let bin = '';
for (let i = 0; i < buf.length; i += 0x8000) bin += String.fromCharCode.apply(null, buf.subarray(i, i + 0x8000));
const headers = {};
res.headers.forEach((v, k) => { headers[k] = v; });
return { status: res.status, statusText: res.statusText, url: res.url, headers, body: btoa(bin), bytes: buf.length };
"#,
};

/// HTML5 drag-and-drop between two selectors in the same document.
pub const DRAG_DROP: PageOp = PageOp {
    name: "dragDrop",
    body: r#"
let src, dst;
try { src = document.querySelector(args.source); dst = document.querySelector(args.target); }
catch (e) { return { ok: false, error: 'invalid_selector', message: String(e && e.message || e) }; }
if (!src || !dst) return { ok: false, error: 'missing', message: !src ? 'source not found' : 'target not found' };
const dt = new DataTransfer();
const fire = (el, type) => el.dispatchEvent(new DragEvent(type, { bubbles: true, cancelable: true, composed: true, dataTransfer: dt }));
fire(src, 'dragstart');
fire(dst, 'dragenter');
fire(dst, 'dragover');
fire(dst, 'drop');
fire(src, 'dragend');
return { ok: true, source: preview(src), target: preview(dst) };
"#,
};

/// Center of the first match of a selector. Scrolls it into view unless
/// `args.scroll` is false.
pub const SELECTOR_POINT: PageOp = PageOp {
    name: "selectorPoint",
    body: r#"
let el;
try { el = document.querySelector(args.selector); }
catch (e) { return { ok: false, error: 'invalid_selector', message: String(e && e.message || e) }; }
if (!el) return { ok: false, error: 'missing', message: 'no match for ' + args.selector };
if (args.scroll !== false) el.scrollIntoView({ block: 'center', inline: 'center', behavior: 'instant' });
const b = el.getBoundingClientRect();
const x = b.left + b.width / 2, y = b.top + b.height / 2;
const inViewport = x >= 0 && y >= 0 && x <= window.innerWidth && y <= window.innerHeight;
return { ok: b.width > 0 && b.height > 0, x, y, inViewport, draggable: el.draggable === true, selectorHint: hint(el) };
"#,
};

/// Reads named attributes of `this`; used with `Runtime.callFunctionOn`.
pub const ARIA_READ_FN: &str = r#"function (names) {
  const attrs = {};
  for (const name of names) attrs[name] = this.getAttribute(name);
  return { connected: this.isConnected, attrs };
}"#;

/// Names of the files selected in `this` file input.
pub const FILE_NAMES_FN: &str = r#"function () {
  return Array.from(this.files || []).map(f => f.name);
}"#;

/// Failure shape shared by element-addressing operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OpFailure {
    pub error: Option<String>,
    pub message: Option<String>,
}

impl OpFailure {
    pub fn from_value(value: &Value) -> Option<Self> {
        let error = value.get("error")?.as_str()?.to_string();
        Some(Self {
            error: Some(error),
            message: value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    pub fn is_invalid_selector(&self) -> bool {
        self.error.as_deref() == Some("invalid_selector")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryResult {
    pub raw_count: usize,
    pub first_visible_index: Option<usize>,
    #[serde(default)]
    pub visible_count: usize,
}

/// Element preview as reported by the page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementPreview {
    #[serde(default)]
    pub visible: bool,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub text_truncated: bool,
    #[serde(default)]
    pub selector_hint: String,
    #[serde(default)]
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateItem {
    pub index: usize,
    #[serde(flatten)]
    pub preview: ElementPreview,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatesResult {
    pub total: usize,
    pub hidden: usize,
    pub items: Vec<CandidateItem>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickPointResult {
    pub ok: bool,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub obscured: bool,
}

/// Focus snapshot used by deltas and keypress feedback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusState {
    pub selector_hint: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub text_truncated: bool,
}

/// Serialized query for op arguments, `None` for handle mode.
pub fn query_args(query: &Query, index: usize) -> Option<Value> {
    if query.mode == QueryMode::Handle {
        return None;
    }
    Some(json!({ "query": query_arg(query), "index": index }))
}
