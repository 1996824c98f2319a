use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::channel::{Channel, ChannelError, FrameWriter};
use crate::diagnostics::debug_log;
use crate::protocol::{InterceptQuery, InterceptVerdict};

/// Controller-side verdict predicate. Returns `true` to let the resource
/// load, `false` to block it. Runs on the interceptor listener thread.
pub type InterceptorPredicate = Box<dyn Fn(&str) -> bool + Send>;

/// The controller's end of the interceptor channel. The listener thread is
/// started lazily on the first `set_interceptor(enable)` and then reused
/// across disable/enable cycles; only quit stops it, via the sentinel.
pub(crate) struct InterceptorEndpoint {
    predicate: Arc<Mutex<Option<InterceptorPredicate>>>,
    channel: Option<Channel>,
    sentinel: Option<FrameWriter>,
    listener: Option<JoinHandle<()>>,
}

impl InterceptorEndpoint {
    pub(crate) fn new(channel: Channel, sentinel: FrameWriter) -> Self {
        Self {
            predicate: Arc::new(Mutex::new(None)),
            channel: Some(channel),
            sentinel: Some(sentinel),
            listener: None,
        }
    }

    pub(crate) fn install(&mut self, predicate: Option<InterceptorPredicate>) {
        *self.predicate.lock().unwrap() = predicate;
    }

    pub(crate) fn ensure_started(&mut self) {
        if self.listener.is_some() {
            return;
        }
        let Some(channel) = self.channel.take() else {
            return;
        };
        let predicate = Arc::clone(&self.predicate);
        let handle = thread::Builder::new()
            .name("pagedriver-interceptor".to_string())
            .spawn(move || listen(channel, predicate))
            .expect("failed to spawn interceptor listener");
        self.listener = Some(handle);
        debug_log("interceptor", "listener started");
    }

    /// Quit-time teardown. The sentinel is written through a duplicate of the
    /// worker-side url writer, so it reaches the listener even when the
    /// worker is already gone.
    pub(crate) fn shutdown(&mut self) {
        if let Some(handle) = self.listener.take() {
            if let Some(mut sentinel) = self.sentinel.take() {
                let _ = sentinel.send(&InterceptQuery::sentinel(), &[]);
            }
            let _ = handle.join();
        }
        self.channel = None;
        self.sentinel = None;
        self.install(None);
    }
}

fn listen(mut channel: Channel, predicate: Arc<Mutex<Option<InterceptorPredicate>>>) {
    loop {
        let query = match channel.recv::<InterceptQuery>() {
            Ok(frame) => frame.message,
            Err(ChannelError::Closed) => {
                debug_log("interceptor", "url stream closed");
                break;
            }
            Err(err) => {
                debug_log("interceptor", format!("url stream error: {err}"));
                break;
            }
        };
        if query.is_sentinel() {
            debug_log("interceptor", "sentinel received, stopping");
            break;
        }
        // No predicate installed means nothing to consult: allow. A panicking
        // predicate fails closed.
        let allow = {
            let guard = predicate.lock().unwrap();
            match guard.as_ref() {
                Some(predicate) => catch_unwind(AssertUnwindSafe(|| predicate(&query.url)))
                    .unwrap_or_else(|_| {
                        debug_log("interceptor", format!("predicate panicked on {}", query.url));
                        false
                    }),
                None => true,
            }
        };
        debug_log(
            "interceptor",
            format!("{} -> {}", query.url, if allow { "allow" } else { "block" }),
        );
        if channel.send(&InterceptVerdict { allow }, &[]).is_err() {
            break;
        }
    }
}
