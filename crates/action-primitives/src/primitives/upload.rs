//! Upload primitive - native file input or intercepted file chooser

use action_locator::errors::AdapterResultExt;
use action_locator::ops;
use action_locator::{Query, QueryInput, QueryResolver, Resolution};
use cdp_adapter::{CdpSession, Domain, RemoteObjectId};
use serde::Deserialize;
use serde_json::{json, Value};
use soulact_core_types::{ActError, ActResult, QueryFailure, WaitContext, WaitPhase};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::primitives::{check_page_failure, decode, execute_click, resolution};
use crate::report::{UploadMode, UploadOutcome, Verification, VerbOutcome};
use crate::request::{UploadPlan, UploadVerify};
use crate::types::{ActionTarget, ExecCtx, Executed};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadDetect {
    kind: String,
    #[serde(default)]
    multiple: bool,
    accept: Option<String>,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    selector_hint: String,
}

/// The file input the files ended up in.
enum FileInput {
    Object(RemoteObjectId),
    Node(i64),
}

impl FileInput {
    async fn object(&self, session: &CdpSession) -> ActResult<RemoteObjectId> {
        match self {
            FileInput::Object(object_id) => Ok(object_id.clone()),
            FileInput::Node(node) => session.resolve_node(*node).await.or_internal("upload_verify"),
        }
    }
}

pub async fn execute_upload(ctx: &ExecCtx<'_>, target: &ActionTarget, plan: &UploadPlan) -> ActResult<Executed> {
    let resolution = resolution("upload", target)?;
    let resolver = QueryResolver::new(ctx.session);

    let detect = resolver.run_on(resolution, ops::UPLOAD_DETECT, json!({})).await?;
    check_page_failure("upload_detect", &detect, &resolution.frame_id)?;
    let detect: UploadDetect = decode("upload_detect", detect)?;
    if detect.disabled {
        return Err(ActError::query(
            QueryFailure::NotFillable,
            format!("file input {} is disabled", detect.selector_hint),
        )
        .with_query_context(|ctx| ctx.match_count = Some(resolution.match_count())));
    }
    if plan.files.len() > 1 && detect.kind == "input" && !detect.multiple {
        return Err(ActError::query(
            QueryFailure::InvalidOptions,
            format!("{} accepts a single file, got {}", detect.selector_hint, plan.files.len()),
        )
        .with_hint("pass one --file"));
    }

    let paths: Vec<&str> = plan.files.iter().map(|file| file.path.as_str()).collect();
    let (mode, input) = if detect.kind == "input" {
        let object_id = resolver.element(resolution, true).await?.ok_or_else(|| {
            ActError::internal("upload", "file input disappeared before files were set")
        })?;
        ctx.session
            .send(
                "DOM.setFileInputFiles",
                json!({ "files": paths, "objectId": object_id.as_str() }),
            )
            .await
            .or_internal("upload")?;
        (UploadMode::Input, FileInput::Object(object_id))
    } else {
        let node = through_chooser(ctx, target, &paths).await?;
        (UploadMode::Chooser, FileInput::Node(node))
    };
    info!(
        action_id = %ctx.action_id,
        mode = ?mode,
        files = plan.files.len(),
        accept = ?detect.accept,
        "files set"
    );

    let submitted = match &plan.submit_selector {
        Some(selector) => {
            submit(ctx, resolution, selector).await?;
            true
        }
        None => false,
    };

    let verification = match &plan.verify {
        Some(verify) => Some(verify_upload(ctx, &input, verify, plan).await),
        None => None,
    };
    if let FileInput::Object(object_id) = &input {
        ctx.session.release_object(object_id).await;
    }
    let verification = verification.transpose()?;

    let outcome = UploadOutcome {
        index: resolution.picked,
        mode,
        files: plan.files.clone(),
        submitted,
        verification,
    };
    let details = json!({
        "mode": outcome.mode,
        "files": outcome.files.iter().map(|file| file.name.as_str()).collect::<Vec<_>>(),
        "submitted": submitted,
    });
    Ok(Executed::new(VerbOutcome::Uploaded(outcome)).with_details(details))
}

/// Clicks the trigger with chooser interception on and fills the chooser's
/// input. Returns the input's backend node id.
async fn through_chooser(ctx: &ExecCtx<'_>, target: &ActionTarget, paths: &[&str]) -> ActResult<i64> {
    let session = ctx.session;
    session.enable(Domain::Page).await.or_internal("upload")?;
    let mut events = session.events();
    session
        .send("Page.setInterceptFileChooserDialog", json!({ "enabled": true }))
        .await
        .or_internal("upload")?;

    let started = Instant::now();
    let clicked = execute_click(ctx, target).await;
    let opened = match clicked {
        Ok(_) => {
            events
                .wait_for("Page.fileChooserOpened", ctx.timeout, |_| true)
                .await
        }
        Err(err) => {
            stop_intercepting(session).await;
            return Err(err);
        }
    };

    let result = match opened {
        Some(event) => match event.params["backendNodeId"].as_i64() {
            Some(node) => session
                .send(
                    "DOM.setFileInputFiles",
                    json!({ "files": paths, "backendNodeId": node }),
                )
                .await
                .map(|_| node)
                .or_internal("upload"),
            None => Err(ActError::internal(
                "upload",
                "file chooser event carries no backendNodeId",
            )),
        },
        None => Err(ActError::wait_timeout(
            WaitContext {
                phase: WaitPhase::FileChooser,
                mode: Some("file-chooser".to_string()),
                timeout_ms: ctx.timeout.as_millis() as u64,
                elapsed_ms: started.elapsed().as_millis() as u64,
                ..WaitContext::default()
            },
            format!("no file chooser opened within {}ms", ctx.timeout.as_millis()),
        )
        .with_hint("target the <input type=file> itself if the page has one")
        .with_hint("increase --timeout if the chooser opens after a delay")),
    };
    stop_intercepting(session).await;
    result
}

async fn stop_intercepting(session: &CdpSession) {
    if let Err(err) = session
        .send("Page.setInterceptFileChooserDialog", json!({ "enabled": false }))
        .await
    {
        debug!(error = %err, "failed to stop file chooser interception");
    }
}

/// Clicks the first match of `selector` in the upload target's frame.
async fn submit(ctx: &ExecCtx<'_>, upload: &Resolution, selector: &str) -> ActResult<()> {
    let mut input = QueryInput::selector(selector);
    input.frame_scope = Some(upload.query.frame_scope);
    let Some(query) = Query::parse(&input)? else {
        return Err(ActError::internal("upload_submit", "submit selector produced no query"));
    };
    let resolution = QueryResolver::new(ctx.session).resolve(&query).await.map_err(|err| {
        err.with_hint("check --submit-selector")
    })?;
    execute_click(ctx, &ActionTarget::Query(resolution)).await?;
    Ok(())
}

async fn verify_once(session: &CdpSession, input: &FileInput, verify: &UploadVerify) -> ActResult<bool> {
    let main = session.main_frame().or_internal("upload_verify")?;
    let resolver = QueryResolver::new(session);
    match verify {
        UploadVerify::Selector(selector) => {
            let value = resolver
                .run(&main, ops::SELECTOR_STATE, &json!({ "selector": selector }))
                .await?;
            if value["valid"] == Value::Bool(false) {
                return Err(ActError::query(
                    QueryFailure::InvalidSelector,
                    format!("--verify-selector {selector:?} is not a valid CSS selector"),
                ));
            }
            Ok(value["visibleCount"].as_u64().unwrap_or_default() > 0)
        }
        UploadVerify::Text(text) => {
            let value = resolver
                .run(&main, ops::TEXT_VISIBLE, &json!({ "text": text }))
                .await?;
            Ok(value["found"].as_bool().unwrap_or(false))
        }
        UploadVerify::FilenameRegex(regex) => {
            let object_id = input.object(session).await?;
            let names = session
                .call_function_on(&object_id, ops::FILE_NAMES_FN, Vec::new())
                .await
                .or_internal("upload_verify")?;
            let names: Vec<String> = decode("upload_verify", names)?;
            Ok(names.iter().any(|name| regex.is_match(name)))
        }
    }
}

/// Polls the check until it holds or the verification budget runs out.
async fn verify_upload(
    ctx: &ExecCtx<'_>,
    input: &FileInput,
    verify: &UploadVerify,
    plan: &UploadPlan,
) -> ActResult<Verification> {
    let started = Instant::now();
    let deadline = started + plan.verify_timeout;
    let mut polls = 0u32;
    loop {
        polls += 1;
        match verify_once(ctx.session, input, verify).await {
            Ok(true) => {
                return Ok(Verification {
                    mode: verify.mode(),
                    value: verify.value(),
                    satisfied: true,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    polls,
                })
            }
            Ok(false) => {}
            Err(err @ ActError::QueryInvalid { .. }) => return Err(err),
            Err(err) => debug!(error = %err, "upload verification probe failed"),
        }
        let now = Instant::now();
        if now >= deadline {
            let timeout_ms = plan.verify_timeout.as_millis() as u64;
            return Err(ActError::wait_timeout(
                WaitContext {
                    phase: WaitPhase::UploadVerify,
                    mode: Some(verify.mode().to_string()),
                    value: Some(verify.value()),
                    timeout_ms,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    frame_scope: Some("main".to_string()),
                    frames_checked: 1,
                },
                format!("upload verification ({}) not satisfied within {timeout_ms}ms", verify.mode()),
            )
            .with_hint("increase --verify-timeout if the page processes uploads slowly")
            .with_hint("the files were set; check the page for a validation message"));
        }
        sleep(ctx.config.poll_interval().min(deadline - now)).await;
    }
}
