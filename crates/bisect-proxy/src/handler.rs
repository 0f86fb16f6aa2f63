//! The per-request registry-handling sequence.
//!
//! Kept separate from the accept loop in `lib.rs` so the sequence itself —
//! read, normalize, fetch, fall back, record, rewrite, respond — reads as
//! one straight-line function and can be exercised directly in tests
//! against a `tiny_http` mock upstream, without spinning up the real
//! accept loop.

use std::io::Read;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use bisect_types::{Cutoff, PackageMetadataDocument, RESERVED_TIME_KEYS, TimelineEvent};
use chrono::{DateTime, Utc};

/// The compact npm metadata variant, which omits per-version publish
/// times and therefore must never be the last word on what's available.
pub const ACCEPT_INSTALL_V1: &str = "application/vnd.npm.install-v1+json";
const ACCEPT_FULL: &str = "application/json";
const USER_AGENT: &str = concat!("npm-bisect-proxy/", env!("CARGO_PKG_VERSION"));
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything a request handler needs that doesn't change between
/// requests within one probe.
pub struct HandlerContext {
    upstream_base: String,
    cutoff: Cutoff,
    client: reqwest::blocking::Client,
}

impl HandlerContext {
    pub fn new(upstream_base: String, cutoff: Cutoff) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());

        Self {
            upstream_base: upstream_base.trim_end_matches('/').to_string(),
            cutoff,
            client,
        }
    }
}

/// Handles one inbound request end to end.
pub fn handle_request(
    mut request: tiny_http::Request,
    ctx: &HandlerContext,
    timeline: &Mutex<Vec<TimelineEvent>>,
) -> Result<()> {
    // Step 1: fully read the inbound body before doing anything else, so a
    // slow or chunked client body can never interleave with the upstream
    // round trip below.
    let mut inbound_body = Vec::new();
    request
        .as_reader()
        .read_to_end(&mut inbound_body)
        .context("failed to read inbound request body")?;

    // Step 2: normalize. We never forward the client's own
    // Accept-Encoding/If-None-Match/Connection headers upstream at all —
    // the outbound request is built fresh with only an explicit Accept —
    // which has the same effect as stripping them. If the client asked
    // for the compact install-v1 metadata, coerce to the full variant so
    // the upstream response carries per-version publish times.
    let original_accept = header_value(request.headers(), "Accept");
    let wanted_install_v1 = original_accept
        .as_deref()
        .map(|a| a.contains("vnd.npm.install-v1"))
        .unwrap_or(false);
    let upstream_accept = if wanted_install_v1 {
        ACCEPT_FULL.to_string()
    } else {
        original_accept.clone().unwrap_or_else(|| ACCEPT_FULL.to_string())
    };

    // Step 3: the only destination this proxy ever forwards to is the
    // single upstream registry it was configured with — there is no
    // per-request Host-based routing to do, since the package manager was
    // pointed here specifically for that one registry (see the module
    // docs for why a global hook's routing concern doesn't apply here).
    let path = request.url().to_string();
    let upstream_url = format!("{}{}", ctx.upstream_base, path);

    // Step 4: issue the upstream request.
    let response = fetch(ctx, &upstream_url, &upstream_accept)?;
    let status = response.status();
    let content_type = content_type_of(&response);
    let mut body = response
        .bytes()
        .context("failed to read upstream response body")?
        .to_vec();

    let mut doc: Option<PackageMetadataDocument> = if content_type.contains("json") {
        serde_json::from_slice(&body).ok()
    } else {
        None
    };

    // Step 5: compact-variant fallback. Only worth retrying if the client
    // was asking for the variant known to omit timestamps in the first
    // place — an upstream that simply never publishes a `time` map isn't
    // helped by retrying.
    if let Some(current) = &doc {
        if current.time.is_empty() && wanted_install_v1 {
            if let Ok(retry) = fetch(ctx, &upstream_url, ACCEPT_FULL) {
                if let Ok(retry_body) = retry.bytes() {
                    if let Ok(retry_doc) =
                        serde_json::from_slice::<PackageMetadataDocument>(&retry_body)
                    {
                        let mut merged = current.clone();
                        merged.time = retry_doc.time;
                        doc = Some(merged);
                    }
                }
            }
        }
    }

    // Step 6: record every (name, version, time) triple into the
    // per-probe timeline, before rewriting removes any of them — the
    // timeline is a record of everything the resolver could have seen,
    // not of what survives this particular cutoff.
    if let Some(current) = &doc {
        record_timeline(current, &path, timeline);
    }

    // Step 7: rewrite.
    let mut changed = false;
    if let Some(mut current) = doc {
        changed = bisect_registry::rewrite(&mut current, ctx.cutoff);
        if changed {
            body = serde_json::to_vec(&current).context("failed to re-serialize rewritten document")?;
        }
    }

    // Step 8: copy the (possibly edited) status, headers, and body back.
    respond(request, status, &body, &content_type, changed)
}

fn fetch(ctx: &HandlerContext, url: &str, accept: &str) -> Result<reqwest::blocking::Response> {
    ctx.client
        .get(url)
        .header(reqwest::header::ACCEPT, accept)
        .header(reqwest::header::ACCEPT_ENCODING, "identity")
        .send()
        .with_context(|| format!("failed to fetch {url} from upstream registry"))
}

fn content_type_of(response: &reqwest::blocking::Response) -> String {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(ACCEPT_FULL)
        .to_string()
}

fn record_timeline(doc: &PackageMetadataDocument, path: &str, timeline: &Mutex<Vec<TimelineEvent>>) {
    let name = doc
        .name
        .clone()
        .unwrap_or_else(|| path.trim_start_matches('/').to_string());

    let mut guard = timeline.lock().unwrap_or_else(|e| e.into_inner());
    for (version, raw_time) in &doc.time {
        if RESERVED_TIME_KEYS.contains(&version.as_str()) {
            continue;
        }
        if let Ok(t) = DateTime::parse_from_rfc3339(raw_time) {
            guard.push(TimelineEvent::new(name.clone(), version.clone(), t.with_timezone(&Utc)));
        }
    }
}

fn header_value(headers: &[tiny_http::Header], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str().to_string())
}

fn respond(
    request: tiny_http::Request,
    status: reqwest::StatusCode,
    body: &[u8],
    content_type: &str,
    rewritten: bool,
) -> Result<()> {
    let mut response = tiny_http::Response::from_data(body.to_vec()).with_status_code(status.as_u16());

    if let Ok(h) = tiny_http::Header::from_bytes(&b"Content-Type"[..], content_type.as_bytes()) {
        response = response.with_header(h);
    }
    // A rewritten body is never chunked or compressed, and the connection
    // is closed so nothing downstream can reuse a socket expecting the
    // original, un-rewritten Content-Length.
    if rewritten {
        if let Ok(h) = tiny_http::Header::from_bytes(&b"Connection"[..], &b"close"[..]) {
            response = response.with_header(h);
        }
    }

    request
        .respond(response)
        .context("failed to write response to client")
}
