//! Download primitive - browser download events with an in-page fetch
//! fallback

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use action_locator::errors::AdapterResultExt;
use action_locator::ops;
use action_locator::{QueryResolver, Resolution};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use cdp_adapter::EventStream;
use network_tap_light::{redact_headers, ResponseRecord};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use soulact_core_types::{ActError, ActResult, WaitContext, WaitPhase};
use tokio::fs;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::primitives::{check_page_failure, decode, execute_click, resolution};
use crate::report::{DownloadMethod, DownloadOutcome, VerbOutcome};
use crate::request::DownloadArgs;
use crate::types::{ActionTarget, ExecCtx, Executed};

const FALLBACK_NAME: &str = "download";
const MAX_NAME_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HrefResult {
    url: Option<String>,
    download: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchResult {
    status: i64,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    body: String,
}

struct Started {
    guid: String,
    url: Option<String>,
    suggested_filename: Option<String>,
}

fn io_error(operation: &str, path: &Path, err: std::io::Error) -> ActError {
    ActError::internal(operation, format!("{}: {err}", path.display()))
        .with_internal_context(|ctx| ctx.detail = Some(path.display().to_string()))
}

fn download_timeout(started: Instant, timeout: Duration, mode: &str) -> ActError {
    ActError::wait_timeout(
        WaitContext {
            phase: WaitPhase::DownloadEvent,
            mode: Some(mode.to_string()),
            timeout_ms: timeout.as_millis() as u64,
            elapsed_ms: started.elapsed().as_millis() as u64,
            ..WaitContext::default()
        },
        format!("no download {mode} within {}ms", timeout.as_millis()),
    )
}

pub async fn execute_download(ctx: &ExecCtx<'_>, target: &ActionTarget, args: &DownloadArgs) -> ActResult<Executed> {
    let resolution = resolution("download", target)?;
    let out_dir = args
        .out_dir
        .clone()
        .unwrap_or_else(|| ctx.config.download_dir.clone());
    let staging = out_dir.join(format!(".staging-{}", ctx.action_id));
    fs::create_dir_all(&staging)
        .await
        .map_err(|err| io_error("download", &staging, err))?;
    let staging = fs::canonicalize(&staging)
        .await
        .map_err(|err| io_error("download", &staging, err))?;

    let result = race_download(ctx, target, resolution, args, &out_dir, &staging).await;

    if let Err(err) = ctx
        .session
        .send_browser("Browser.setDownloadBehavior", json!({ "behavior": "default" }))
        .await
    {
        debug!(error = %err, "failed to restore download behavior");
    }
    if let Err(err) = fs::remove_dir_all(&staging).await {
        debug!(path = %staging.display(), error = %err, "staging directory left behind");
    }

    let outcome = result?;
    info!(
        action_id = %ctx.action_id,
        method = ?outcome.method,
        bytes = outcome.bytes,
        path = %outcome.path,
        "download saved"
    );
    let details = json!({
        "method": outcome.method,
        "path": outcome.path,
        "bytes": outcome.bytes,
        "sha256": outcome.sha256,
        "url": outcome.url,
    });
    Ok(Executed::new(VerbOutcome::Download(outcome)).with_details(details))
}

async fn race_download(
    ctx: &ExecCtx<'_>,
    target: &ActionTarget,
    resolution: &Resolution,
    args: &DownloadArgs,
    out_dir: &Path,
    staging: &Path,
) -> ActResult<DownloadOutcome> {
    let session = ctx.session;
    session
        .send_browser(
            "Browser.setDownloadBehavior",
            json!({
                "behavior": "allowAndName",
                "downloadPath": staging.to_string_lossy(),
                "eventsEnabled": true,
            }),
        )
        .await
        .or_internal("download")?;

    let mut events = session.events();
    let started = Instant::now();
    execute_click(ctx, target).await?;

    let begin = events
        .wait_for("Browser.downloadWillBegin", ctx.timeout, |_| true)
        .await;
    match begin {
        Some(event) => {
            let begin = Started {
                guid: event.params["guid"].as_str().unwrap_or_default().to_string(),
                url: event.params["url"].as_str().map(str::to_string),
                suggested_filename: event.params["suggestedFilename"].as_str().map(str::to_string),
            };
            let remaining = ctx.timeout.saturating_sub(started.elapsed());
            from_event(ctx, &mut events, begin, remaining, out_dir, staging, started).await
        }
        None if args.fallback => {
            debug!(action_id = %ctx.action_id, "no download event; fetching the candidate url");
            from_fetch(ctx, resolution, out_dir, started).await
        }
        None => Err(download_timeout(started, ctx.timeout, "event")
            .with_hint("the click did not start a browser download")
            .with_hint("drop --no-fallback to fetch the link directly")),
    }
}

async fn from_event(
    ctx: &ExecCtx<'_>,
    events: &mut EventStream,
    begin: Started,
    remaining: Duration,
    out_dir: &Path,
    staging: &Path,
    started: Instant,
) -> ActResult<DownloadOutcome> {
    let guid = begin.guid.clone();
    let done = events
        .wait_for("Browser.downloadProgress", remaining, |event| {
            event.params["guid"].as_str() == Some(guid.as_str())
                && matches!(event.params["state"].as_str(), Some("completed" | "canceled"))
        })
        .await
        .ok_or_else(|| {
            download_timeout(started, ctx.timeout, "completion")
                .with_hint("the download started but did not finish; increase --timeout for large files")
        })?;
    if done.params["state"].as_str() == Some("canceled") {
        return Err(ActError::internal("download", "the browser canceled the download"));
    }

    let response = match (ctx.monitor, &begin.url) {
        (Some(monitor), Some(url)) => monitor.tap().responses().await.find_by_url(url).cloned(),
        _ => None,
    };
    let name = response
        .as_ref()
        .and_then(|record| record.header("content-disposition"))
        .and_then(disposition_filename)
        .or_else(|| begin.suggested_filename.clone())
        .or_else(|| begin.url.as_deref().and_then(url_filename));
    let final_path = unique_path(out_dir, &sanitize_filename(name.as_deref().unwrap_or(FALLBACK_NAME)));
    let staged = staging.join(&begin.guid);
    fs::rename(&staged, &final_path)
        .await
        .map_err(|err| io_error("download", &staged, err))?;

    let (bytes, sha256) = hash_file(&final_path).await?;
    Ok(DownloadOutcome {
        download_started: true,
        method: DownloadMethod::Event,
        url: begin.url,
        suggested_filename: begin.suggested_filename,
        path: final_path.to_string_lossy().into_owned(),
        bytes,
        sha256,
        status: response.as_ref().map(|record| record.status),
        mime_type: response.as_ref().map(|record| record.mime_type.clone()),
        headers: response
            .map(|record| redact_headers(&record.headers))
            .unwrap_or_default(),
    })
}

/// Candidate url: the element's own link, else the newest attachment seen
/// on the network.
async fn candidate_url(
    ctx: &ExecCtx<'_>,
    resolver: &QueryResolver<'_>,
    resolution: &Resolution,
) -> ActResult<(Option<String>, Option<String>)> {
    let value = resolver.run_on(resolution, ops::HREF, json!({})).await?;
    check_page_failure("download_href", &value, &resolution.frame_id)?;
    let href: HrefResult = decode("download_href", value)?;
    if href.url.is_some() {
        return Ok((href.url, href.download));
    }
    let attachment = match ctx.monitor {
        Some(monitor) => monitor
            .tap()
            .responses()
            .await
            .latest_attachment()
            .map(|record: &ResponseRecord| record.url.clone()),
        None => None,
    };
    Ok((attachment, None))
}

async fn from_fetch(
    ctx: &ExecCtx<'_>,
    resolution: &Resolution,
    out_dir: &Path,
    started: Instant,
) -> ActResult<DownloadOutcome> {
    let resolver = QueryResolver::new(ctx.session);
    let (url, download_attr) = candidate_url(ctx, &resolver, resolution).await?;
    let Some(url) = url else {
        return Err(download_timeout(started, ctx.timeout, "event")
            .with_hint("the element has no href/src and no attachment response was observed"));
    };

    let value = resolver
        .run(&resolution.frame_id, ops::FETCH, &json!({ "url": url }))
        .await?;
    let fetched: FetchResult = decode("download_fetch", value)?;
    if !(200..300).contains(&fetched.status) {
        warn!(action_id = %ctx.action_id, status = fetched.status, url = %fetched.url, "fallback fetch returned a non-success status");
        let status = fetched.status;
        return Err(ActError::internal(
            "download_fetch",
            format!("fetching {} answered HTTP {status}", fetched.url),
        )
        .with_hint(format!("the server refused the fallback fetch with HTTP {status}; the link may need a browser download"))
        .with_internal_context(|ctx| ctx.detail = Some(format!("status {status}"))));
    }
    let body = STANDARD
        .decode(fetched.body.as_bytes())
        .map_err(|err| ActError::internal("download_fetch", format!("invalid body encoding: {err}")))?;

    let header = |name: &str| {
        fetched
            .headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    };
    let name = header("content-disposition")
        .as_deref()
        .and_then(disposition_filename)
        .or_else(|| download_attr.filter(|name| !name.trim().is_empty()))
        .or_else(|| url_filename(&fetched.url));
    let final_path = unique_path(out_dir, &sanitize_filename(name.as_deref().unwrap_or(FALLBACK_NAME)));
    fs::write(&final_path, &body)
        .await
        .map_err(|err| io_error("download", &final_path, err))?;

    let (bytes, sha256) = hash_file(&final_path).await?;
    Ok(DownloadOutcome {
        download_started: false,
        method: DownloadMethod::Fallback,
        url: Some(fetched.url.clone()),
        suggested_filename: name,
        path: final_path.to_string_lossy().into_owned(),
        bytes,
        sha256,
        status: Some(fetched.status),
        mime_type: header("content-type"),
        headers: redact_headers(&fetched.headers),
    })
}

/// Size and lowercase hex sha256 of the bytes on disk.
async fn hash_file(path: &Path) -> ActResult<(u64, String)> {
    let written = fs::read(path)
        .await
        .map_err(|err| io_error("download", path, err))?;
    Ok((written.len() as u64, format!("{:x}", Sha256::digest(&written))))
}

/// `filename*` (RFC 5987) wins over `filename`.
fn disposition_filename(header: &str) -> Option<String> {
    let mut plain = None;
    for part in header.split(';').map(str::trim) {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                let value = value.trim().trim_matches('"');
                let encoded = value.splitn(3, '\'').nth(2).unwrap_or(value);
                if let Some(decoded) = percent_decode(encoded).filter(|name| !name.is_empty()) {
                    return Some(decoded);
                }
            }
            "filename" => {
                let value = value.trim().trim_matches('"');
                if !value.is_empty() {
                    plain = Some(value.to_string());
                }
            }
            _ => {}
        }
    }
    plain
}

fn percent_decode(raw: &str) -> Option<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}

/// Last path segment of a url, without query or fragment.
fn url_filename(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let after_scheme = path.split_once("://").map(|(_, rest)| rest).unwrap_or(path);
    let (_, path) = after_scheme.split_once('/')?;
    let last = path.rsplit('/').next()?;
    percent_decode(last).filter(|name| !name.is_empty())
}

/// Strips separators, control characters and leading dots; never empty.
pub fn sanitize_filename(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();
    let cleaned = cleaned.replace("..", "_");
    let trimmed = cleaned.trim().trim_start_matches('.').trim();
    let name: String = trimmed.chars().take(MAX_NAME_CHARS).collect();
    if name.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        name
    }
}

/// `dir/name`, or `dir/stem-N.ext` with the first free N.
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    (1..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem}-{n}.{ext}")),
            None => dir.join(format!("{stem}-{n}")),
        })
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EngineConfig;
    use action_locator::testing::MatchPage;
    use action_locator::{Query, QueryInput};
    use cdp_adapter::network::response_params;
    use cdp_adapter::testing::{browser_event, session_event};
    use cdp_adapter::{CdpSession, NetworkMonitor};
    use network_tap_light::config::TapConfig;
    use soulact_core_types::{ActionId, ActionKind};

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    async fn run(page: &MatchPage, out_dir: &Path, timeout: Duration, fallback: bool) -> ActResult<Executed> {
        let session = page.open().await;
        run_on(&session, None, out_dir, timeout, fallback).await
    }

    async fn run_on(
        session: &CdpSession,
        monitor: Option<&NetworkMonitor>,
        out_dir: &Path,
        timeout: Duration,
        fallback: bool,
    ) -> ActResult<Executed> {
        let query = Query::parse(&QueryInput::text("Export")).unwrap().unwrap();
        let resolution = QueryResolver::new(session).resolve(&query).await.unwrap();
        let config = EngineConfig::default();
        let ctx = ExecCtx {
            action_id: ActionId::from("a1"),
            kind: ActionKind::Download,
            session,
            config: &config,
            timeout,
            monitor,
        };
        let args = DownloadArgs {
            out_dir: Some(out_dir.to_path_buf()),
            fallback,
        };
        execute_download(&ctx, &ActionTarget::Query(resolution), &args).await
    }

    fn script_event_download(page: &MatchPage, url: &str) {
        page.transport().on_fn("Browser.setDownloadBehavior", |params| {
            if let Some(path) = params["downloadPath"].as_str() {
                std::fs::write(Path::new(path).join("g-1"), b"hello").unwrap();
            }
            Ok(json!({}))
        });
        page.transport().emit_after(
            "Input.dispatchMouseEvent",
            browser_event(
                "Browser.downloadWillBegin",
                json!({ "frameId": "MAIN", "guid": "g-1", "url": url, "suggestedFilename": "x.txt" }),
            ),
        );
        page.transport().emit_after(
            "Input.dispatchMouseEvent",
            browser_event(
                "Browser.downloadProgress",
                json!({ "guid": "g-1", "totalBytes": 5, "receivedBytes": 5, "state": "completed" }),
            ),
        );
    }

    #[test]
    fn filenames_prefer_extended_disposition() {
        assert_eq!(
            disposition_filename("attachment; filename=\"plain.txt\"; filename*=UTF-8''r%C3%A9sum%C3%A9.pdf").as_deref(),
            Some("résumé.pdf")
        );
        assert_eq!(disposition_filename("attachment; filename=\"x.txt\"").as_deref(), Some("x.txt"));
        assert_eq!(disposition_filename("inline").as_deref(), None);
        assert_eq!(disposition_filename("attachment; filename*=UTF-8''bad%FF").as_deref(), None);
        assert_eq!(url_filename("https://e.test/files/a%20b.csv?x=1").as_deref(), Some("a b.csv"));
        assert_eq!(url_filename("https://e.test/").as_deref(), None);
    }

    #[test]
    fn sanitizes_hostile_names() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "____etc_passwd");
        assert_eq!(sanitize_filename(".hidden"), "hidden");
        assert_eq!(sanitize_filename("a\u{0007}b.txt"), "a_b.txt");
        assert_eq!(sanitize_filename("   "), "download");
    }

    #[test]
    fn unique_path_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(unique_path(dir.path(), "x.txt"), dir.path().join("x.txt"));
        std::fs::write(dir.path().join("x.txt"), b"1").unwrap();
        std::fs::write(dir.path().join("x-1.txt"), b"2").unwrap();
        assert_eq!(unique_path(dir.path(), "x.txt"), dir.path().join("x-2.txt"));
        std::fs::write(dir.path().join("README"), b"3").unwrap();
        assert_eq!(unique_path(dir.path(), "README"), dir.path().join("README-1"));
    }

    #[tokio::test]
    async fn event_download_is_moved_and_hashed() {
        let dir = tempfile::tempdir().unwrap();
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true]);
        script_event_download(&page, "https://e.test/x.txt");

        let executed = run(&page, dir.path(), Duration::from_secs(2), true).await.unwrap();
        let VerbOutcome::Download(download) = executed.outcome else {
            panic!("expected download outcome");
        };
        assert!(download.download_started);
        assert_eq!(download.method, DownloadMethod::Event);
        assert_eq!(download.sha256, HELLO_SHA256);
        let on_disk = std::fs::read(&download.path).unwrap();
        assert_eq!(download.bytes, on_disk.len() as u64);
        assert!(download.path.ends_with("x.txt"));
        assert!(!dir.path().join(".staging-a1").exists());

        let behavior = page.transport().calls_for("Browser.setDownloadBehavior");
        assert_eq!(behavior[0].params["behavior"], "allowAndName");
        assert_eq!(behavior.last().unwrap().params["behavior"], "default");
    }

    #[tokio::test]
    async fn event_download_reports_tapped_response() {
        let dir = tempfile::tempdir().unwrap();
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true]);
        script_event_download(&page, "https://e.test/report");
        let session = page.open().await;
        let monitor = NetworkMonitor::start(&session, TapConfig::default()).await.unwrap();

        page.transport().emit(session_event(
            "Network.responseReceived",
            response_params(
                "r1",
                "https://e.test/report",
                200,
                json!({
                    "Content-Disposition": "attachment; filename*=UTF-8''q3%20report.txt",
                    "Set-Cookie": "sid=secret"
                }),
            ),
        ));
        for _ in 0..50 {
            if !monitor.tap().responses().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let executed = run_on(&session, Some(&monitor), dir.path(), Duration::from_secs(2), true)
            .await
            .unwrap();
        let VerbOutcome::Download(download) = executed.outcome else {
            panic!("expected download outcome");
        };
        assert!(download.download_started);
        assert_eq!(download.status, Some(200));
        assert_eq!(download.sha256, HELLO_SHA256);
        assert_eq!(download.bytes, 5);
        assert!(download.path.ends_with("q3 report.txt"));
        assert_eq!(download.headers["Set-Cookie"], "[redacted]");
    }

    #[tokio::test]
    async fn failed_fallback_fetch_saves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true]);
        page.on_op("href", |_, _| json!({ "ok": true, "url": "https://e.test/files/x.txt", "download": null }));
        page.on_op("fetch", |_, args| {
            json!({ "status": 403, "url": args["url"], "headers": {}, "body": "ZGVuaWVk" })
        });

        let err = run(&page, dir.path(), Duration::from_millis(100), true)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E_INTERNAL");
        assert!(err.hints().as_slice().iter().any(|hint| hint.contains("403")));
        let saved: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| !entry.file_name().to_string_lossy().starts_with(".staging"))
            .collect();
        assert!(saved.is_empty());
    }

    #[tokio::test]
    async fn falls_back_to_fetch_when_no_event_arrives() {
        let dir = tempfile::tempdir().unwrap();
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true]);
        page.on_op("href", |_, _| json!({ "ok": true, "url": "https://e.test/files/x.txt", "download": null }));
        page.on_op("fetch", |_, args| {
            json!({
                "status": 200,
                "statusText": "OK",
                "url": args["url"],
                "headers": {
                    "content-disposition": "attachment; filename=\"x.txt\"",
                    "content-type": "text/plain",
                    "set-cookie": "sid=secret"
                },
                "body": "aGVsbG8=",
                "bytes": 5
            })
        });

        let executed = run(&page, dir.path(), Duration::from_millis(200), true).await.unwrap();
        let VerbOutcome::Download(download) = executed.outcome else {
            panic!("expected download outcome");
        };
        assert_eq!(download.method, DownloadMethod::Fallback);
        assert_eq!(download.status, Some(200));
        assert_eq!(download.sha256, HELLO_SHA256);
        assert_eq!(download.bytes, 5);
        assert_eq!(download.headers["set-cookie"], "[redacted]");
        assert_eq!(download.mime_type.as_deref(), Some("text/plain"));
        assert_eq!(std::fs::read(&download.path).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn no_event_without_fallback_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true]);
        let err = run(&page, dir.path(), Duration::from_millis(100), false)
            .await
            .unwrap_err();
        match err {
            ActError::WaitTimeout { context, .. } => assert_eq!(context.phase, WaitPhase::DownloadEvent),
            other => panic!("unexpected {other:?}"),
        }
    }
}
