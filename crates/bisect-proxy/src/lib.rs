//! # bisect-proxy
//!
//! The registry-rewriting intercept proxy. A probe launches the package
//! manager with its registry base URL pointed at this proxy instead of the
//! real registry; every request the package manager makes for package
//! metadata is therefore terminated here, forwarded upstream by a
//! controlled client, rewritten by [`bisect_registry::rewrite`] so that
//! nothing published after the probe's cutoff is visible, and returned.
//!
//! ## Why a local-server override instead of a global socket hook
//!
//! A process-global hook on the hosting runtime's socket layer would let
//! traffic be intercepted regardless of what URL the package manager was
//! configured with, but that has no equivalent in a systems language
//! without also controlling the child's libc. This takes the simpler,
//! explicitly preferred route instead: the package manager is launched
//! with its own registry-base-URL config knob pointed at
//! `http://127.0.0.1:<port>` (`bisect-process` sets this env var). Every
//! request that arrives at this server is therefore already known to be
//! registry traffic — there is no bypass/pass-through path to implement,
//! and no "bypass next connect" flag, because this proxy's own upstream
//! fetches go out over a normal `reqwest` client, never back through
//! itself.
//!
//! ## Concurrency
//!
//! The proxy runs its accept loop on one dedicated thread and handles one
//! request to completion before accepting the next: the full inbound body
//! is read, then the upstream request is made and its full body read,
//! then the rewriter runs, and only then are bytes written back to the
//! client. This ordering is what keeps `Content-Length` consistent with
//! the body that follows it.

mod handler;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bisect_types::{Cutoff, TimelineEvent};
use thiserror::Error;

pub use handler::ACCEPT_INSTALL_V1;

/// Errors starting or running the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind local proxy server: {0}")]
    Bind(std::io::Error),

    #[error("proxy accept thread panicked")]
    ThreadPanicked,
}

/// How long the accept loop blocks waiting for a request before checking
/// whether it has been asked to shut down.
const POLL_INTERVAL: Duration = Duration::from_millis(150);

/// A running intercept proxy instance, exclusively owned by one probe.
///
/// Created on probe start, engaged for the duration of the package
/// manager's install, and guaranteed-destroyed on probe end via
/// [`Proxy::stop`] — including when the install itself failed, so a
/// previous probe's proxy thread and timeline buffer never leak into the
/// next probe.
pub struct Proxy {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    timeline: Arc<Mutex<Vec<TimelineEvent>>>,
}

impl Proxy {
    /// Binds a local server and starts its accept loop on a dedicated
    /// thread. `upstream_base` is the real registry (e.g.
    /// `https://registry.npmjs.org`); `cutoff` is this probe's cutoff.
    pub fn start(upstream_base: String, cutoff: Cutoff) -> Result<Self, ProxyError> {
        let server = tiny_http::Server::http("127.0.0.1:0").map_err(|e| {
            ProxyError::Bind(std::io::Error::other(e))
        })?;
        let local_addr = match server.server_addr() {
            tiny_http::ListenAddr::IP(addr) => addr,
            #[allow(unreachable_patterns)]
            _ => return Err(ProxyError::Bind(std::io::Error::other("non-IP listen address"))),
        };

        Self::spawn(server, local_addr, upstream_base, cutoff)
    }

    fn spawn(
        server: tiny_http::Server,
        local_addr: SocketAddr,
        upstream_base: String,
        cutoff: Cutoff,
    ) -> Result<Self, ProxyError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let timeline = Arc::new(Mutex::new(Vec::new()));

        let thread_shutdown = Arc::clone(&shutdown);
        let thread_timeline = Arc::clone(&timeline);

        let ctx = handler::HandlerContext::new(upstream_base, cutoff);

        let thread = std::thread::Builder::new()
            .name("npm-bisect-proxy".into())
            .spawn(move || {
                accept_loop(server, thread_shutdown, thread_timeline, ctx);
            })
            .map_err(ProxyError::Bind)?;

        tracing::debug!(addr = %local_addr, cutoff = %cutoff, "proxy listening");

        Ok(Self {
            local_addr,
            shutdown,
            thread: Some(thread),
            timeline,
        })
    }

    /// The local URL to hand to the package manager as its registry base.
    pub fn local_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Stops the accept loop, joins its thread, and returns everything
    /// recorded in the timeline so far. Safe to call more than once; the
    /// second call returns an empty timeline.
    pub fn stop(mut self) -> Vec<TimelineEvent> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        std::mem::take(&mut *self.timeline.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(
    server: tiny_http::Server,
    shutdown: Arc<AtomicBool>,
    timeline: Arc<Mutex<Vec<TimelineEvent>>>,
    ctx: handler::HandlerContext,
) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }

        match server.recv_timeout(POLL_INTERVAL) {
            Ok(Some(request)) => {
                if let Err(e) = handler::handle_request(request, &ctx, &timeline) {
                    tracing::warn!(error = %e, "proxy request failed");
                }
            }
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "proxy accept loop exiting after an I/O error");
                return;
            }
        }
    }
}
