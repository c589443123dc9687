//! Page-level render steps: intercept, navigate, wait, strip, serialize
//!
//! The caller owns the page and closes it; everything here only drives it.

use crate::blocker::{Decision, RequestDescriptor, RequestPolicy, ResourceKind};
use crate::{metrics, RenderError, RenderRequest, RenderResult, WaitStrategy};
use base64::Engine;
use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EventRequestPaused, FailRequestParams, FulfillRequestParams,
    HeaderEntry,
};
use chromiumoxide::cdp::browser_protocol::network::{
    ErrorReason, EventResponseReceived, ResourceType,
};
use chromiumoxide::cdp::browser_protocol::page::{EventLifecycleEvent, FrameId};
use chromiumoxide::error::CdpError;
use chromiumoxide::listeners::EventStream;
use chromiumoxide::Page;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, trace};

const STRIP_TAGS_SCRIPT: &str =
    "document.querySelectorAll('script, noscript').forEach(function (el) { el.remove(); })";

impl From<&ResourceType> for ResourceKind {
    fn from(resource: &ResourceType) -> Self {
        match resource {
            ResourceType::Document => ResourceKind::Document,
            ResourceType::Stylesheet => ResourceKind::Stylesheet,
            ResourceType::Image => ResourceKind::Image,
            ResourceType::Media => ResourceKind::Media,
            ResourceType::Font => ResourceKind::Font,
            ResourceType::Script => ResourceKind::Script,
            ResourceType::Xhr => ResourceKind::Xhr,
            ResourceType::Fetch => ResourceKind::Fetch,
            _ => ResourceKind::Other,
        }
    }
}

/// Runs one render on a freshly opened `about:blank` page.
///
/// A navigation that misses its deadline yields a 504 result, a navigation
/// that never produced a document response yields 400 `no response`.
pub(crate) async fn render_page(
    page: &Page,
    request: &RenderRequest,
    policy: Arc<RequestPolicy>,
    timeout: Duration,
    user_agent: &str,
) -> Result<RenderResult, RenderError> {
    page.execute(SetUserAgentOverrideParams::new(user_agent))
        .await
        .map_err(|e| RenderError::Page(e.to_string()))?;

    let main_frame = page
        .mainframe()
        .await
        .map_err(|e| RenderError::Page(e.to_string()))?;

    // Listeners must exist before navigation starts.
    let paused = page
        .event_listener::<EventRequestPaused>()
        .await
        .map_err(|e| RenderError::Page(e.to_string()))?;
    let mut responses = page
        .event_listener::<EventResponseReceived>()
        .await
        .map_err(|e| RenderError::Page(e.to_string()))?;
    let mut lifecycle = page
        .event_listener::<EventLifecycleEvent>()
        .await
        .map_err(|e| RenderError::Page(e.to_string()))?;

    let mut listeners = JoinSet::new();
    listeners.spawn(intercept_requests(
        page.clone(),
        paused,
        policy.clone(),
        main_frame.clone(),
    ));

    let navigation = async {
        page.goto(request.url.as_str())
            .await
            .map_err(|e| navigation_error(e, timeout))?;
        if request.wait_until == WaitStrategy::NetworkIdle {
            wait_for_network_idle(&mut lifecycle, main_frame.as_ref()).await?;
        }
        Ok::<_, RenderError>(())
    };

    match tokio::time::timeout(timeout, navigation).await {
        Ok(Ok(())) => {}
        Ok(Err(RenderError::NavigationTimeout(_))) | Err(_) => {
            debug!("Navigation to {} timed out after {:?}", request.url, timeout);
            return Ok(RenderResult::new(
                504,
                RenderError::NavigationTimeout(timeout).to_string(),
            ));
        }
        Ok(Err(e)) => return Err(e),
    }

    let status = document_status(&mut responses, main_frame.as_ref())
        .or_else(|| policy.has_override().then_some(200));
    let Some(status) = status else {
        return Ok(RenderResult::new(
            RenderError::NoResponse.status_code(),
            RenderError::NoResponse.to_string(),
        ));
    };

    page.evaluate_expression(STRIP_TAGS_SCRIPT)
        .await
        .map_err(|e| RenderError::Page(e.to_string()))?;

    let html = page
        .content()
        .await
        .map_err(|e| RenderError::Page(e.to_string()))?;

    listeners.shutdown().await;
    Ok(RenderResult::new(status, html))
}

fn navigation_error(err: CdpError, timeout: Duration) -> RenderError {
    match err {
        CdpError::Timeout => RenderError::NavigationTimeout(timeout),
        other => RenderError::Navigation(other.to_string()),
    }
}

fn is_main_frame(frame: &FrameId, main_frame: Option<&FrameId>) -> bool {
    main_frame.map_or(true, |main| main == frame)
}

async fn intercept_requests(
    page: Page,
    mut paused: EventStream<EventRequestPaused>,
    policy: Arc<RequestPolicy>,
    main_frame: Option<FrameId>,
) {
    while let Some(event) = paused.next().await {
        let resource = ResourceKind::from(&event.resource_type);
        let descriptor = RequestDescriptor {
            url: &event.request.url,
            resource,
            is_main_document: resource == ResourceKind::Document
                && is_main_frame(&event.frame_id, main_frame.as_ref()),
        };

        let outcome = match policy.resolve(&descriptor) {
            Decision::Allow => {
                metrics::record_intercepted_request("allow");
                page.execute(ContinueRequestParams::new(event.request_id.clone()))
                    .await
                    .map(|_| ())
            }
            Decision::Abort(reason) => {
                trace!("Aborting {} ({})", descriptor.url, reason.as_str());
                metrics::record_intercepted_request(reason.as_str());
                page.execute(FailRequestParams::new(
                    event.request_id.clone(),
                    ErrorReason::BlockedByClient,
                ))
                .await
                .map(|_| ())
            }
            Decision::RespondWith(content) => {
                metrics::record_intercepted_request("override");
                match fulfill_with_html(&event, &content) {
                    Ok(params) => page.execute(params).await.map(|_| ()),
                    Err(e) => {
                        debug!("Could not build override response: {}", e);
                        continue;
                    }
                }
            }
        };

        if let Err(e) = outcome {
            // The page is usually closing; nothing else to do with this request.
            trace!("Interception response for {} failed: {}", event.request.url, e);
        }
    }
}

fn fulfill_with_html(event: &EventRequestPaused, html: &str) -> Result<FulfillRequestParams, String> {
    FulfillRequestParams::builder()
        .request_id(event.request_id.clone())
        .response_code(200)
        .response_headers(vec![HeaderEntry::new(
            "Content-Type",
            "text/html; charset=utf-8",
        )])
        .body(base64::engine::general_purpose::STANDARD.encode(html.as_bytes()))
        .build()
}

/// Status of the first document response of the main frame seen so far.
///
/// Navigation only completes after its response event was dispatched, so
/// everything needed is already buffered in the stream.
fn document_status(
    responses: &mut EventStream<EventResponseReceived>,
    main_frame: Option<&FrameId>,
) -> Option<u16> {
    let mut status = None;
    while let Some(Some(event)) = responses.next().now_or_never() {
        if status.is_some() || event.r#type != ResourceType::Document {
            continue;
        }
        let in_main_frame = event
            .frame_id
            .as_ref()
            .map_or(false, |frame| is_main_frame(frame, main_frame));
        if in_main_frame {
            status = u16::try_from(event.response.status).ok();
        }
    }
    status
}

async fn wait_for_network_idle(
    lifecycle: &mut EventStream<EventLifecycleEvent>,
    main_frame: Option<&FrameId>,
) -> Result<(), RenderError> {
    let mut idle = false;
    while let Some(Some(event)) = lifecycle.next().now_or_never() {
        idle = track_idle(idle, &event, main_frame);
    }

    while !idle {
        match lifecycle.next().await {
            Some(event) => idle = track_idle(idle, &event, main_frame),
            None => return Err(RenderError::Page("lifecycle event stream closed".to_string())),
        }
    }
    Ok(())
}

fn track_idle(idle: bool, event: &EventLifecycleEvent, main_frame: Option<&FrameId>) -> bool {
    if !is_main_frame(&event.frame_id, main_frame) {
        return idle;
    }
    match event.name.as_str() {
        "init" => false,
        "networkIdle" => true,
        _ => idle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_kind_mapping() {
        assert_eq!(ResourceKind::from(&ResourceType::Document), ResourceKind::Document);
        assert_eq!(ResourceKind::from(&ResourceType::Image), ResourceKind::Image);
        assert_eq!(ResourceKind::from(&ResourceType::Xhr), ResourceKind::Xhr);
        assert_eq!(ResourceKind::from(&ResourceType::WebSocket), ResourceKind::Other);
    }

    #[test]
    fn test_navigation_error_mapping() {
        let timeout = Duration::from_millis(2500);
        assert_eq!(
            navigation_error(CdpError::Timeout, timeout),
            RenderError::NavigationTimeout(timeout)
        );
        assert!(matches!(
            navigation_error(
                CdpError::ChromeMessage("net::ERR_NAME_NOT_RESOLVED".to_string()),
                timeout
            ),
            RenderError::Navigation(_)
        ));
    }

    #[test]
    fn test_main_frame_match() {
        let main = FrameId::new("main");
        assert!(is_main_frame(&main, Some(&FrameId::new("main"))));
        assert!(!is_main_frame(&FrameId::new("child"), Some(&main)));
        assert!(is_main_frame(&FrameId::new("child"), None));
    }
}
