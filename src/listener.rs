use log::warn;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::FairMutex;

use crate::error::GpioError;
use crate::gpio::{EdgeDetect, EdgeHandler, EventLineHandle};

/// Event line shared between a listener thread and the control path. The
/// fair mutex keeps `get_state` from starving behind the wait loop.
pub(crate) type SharedEventLine = Arc<FairMutex<Box<dyn EventLineHandle>>>;

pub(crate) struct ListenerArgs {
    line: u32,
    edges: EdgeDetect,
    handler: Box<dyn EdgeHandler>,
    wait: Duration,
}

impl ListenerArgs {
    pub(crate) fn new(
        line: u32,
        edges: EdgeDetect,
        handler: Box<dyn EdgeHandler>,
        wait: Duration,
    ) -> Self {
        Self {
            line,
            edges,
            handler,
            wait,
        }
    }
}

pub(crate) struct EdgeListener {
    edges: EdgeDetect,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    events: SharedEventLine,
}

impl EdgeListener {
    /// Moves `args` into a new listener thread. On failure the event line is
    /// closed before returning.
    pub(crate) fn spawn(
        args: ListenerArgs,
        events: Box<dyn EventLineHandle>,
    ) -> Result<Self, GpioError> {
        let line = args.line;
        let edges = args.edges;
        let cancel = Arc::new(AtomicBool::new(false));
        let events: SharedEventLine = Arc::new(FairMutex::new(events));

        let cancel_flag = cancel.clone();
        let thread_events = events.clone();
        let spawned = thread::Builder::new()
            .name(format!("gpio-edge-{line}"))
            .spawn(move || run(args, thread_events, cancel_flag));

        match spawned {
            Ok(handle) => Ok(Self {
                edges,
                cancel,
                handle: Some(handle),
                events,
            }),
            Err(e) => {
                if let Ok(events) = Arc::try_unwrap(events)
                    && let Err(e) = events.into_inner().close()
                {
                    warn!("closing line {line} after failed spawn: {e}");
                }
                Err(GpioError::OutOfResources(format!(
                    "spawn listener for line {line}: {e}"
                )))
            }
        }
    }

    pub(crate) fn edges(&self) -> EdgeDetect {
        self.edges
    }

    pub(crate) fn events(&self) -> &SharedEventLine {
        &self.events
    }

    /// Cancels and joins the thread, then hands back sole ownership of the
    /// event line so the caller can close it. Returns `None` when called
    /// from the listener thread, which then closes the line itself once the
    /// current callback returns.
    pub(crate) fn stop(mut self) -> Result<Option<Box<dyn EventLineHandle>>, GpioError> {
        if !self.shutdown() {
            return Ok(None);
        }
        let events = self.events.clone();
        drop(self);

        Arc::try_unwrap(events)
            .map(|events| Some(events.into_inner()))
            .map_err(|_| GpioError::ReleaseFailed("event line still shared after join".into()))
    }

    /// Returns false if the calling thread is the listener itself, which
    /// cannot be joined from within.
    fn shutdown(&mut self) -> bool {
        self.cancel.store(true, Ordering::Release);
        let Some(handle) = self.handle.take() else {
            return true;
        };
        if handle.thread().id() == thread::current().id() {
            return false;
        }

        let name = handle.thread().name().unwrap_or("gpio-edge").to_string();
        if handle.join().is_err() {
            warn!("listener {name} terminated by a panicking handler");
        }
        true
    }
}

impl Drop for EdgeListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(mut args: ListenerArgs, events: SharedEventLine, cancel: Arc<AtomicBool>) {
    listen(&mut args, &events, &cancel);

    // the listener was dropped from inside a callback, nobody else will close
    if let Ok(events) = Arc::try_unwrap(events)
        && let Err(e) = events.into_inner().close()
    {
        warn!("closing line {} on listener exit: {e}", args.line);
    }
}

fn listen(args: &mut ListenerArgs, events: &SharedEventLine, cancel: &AtomicBool) {
    while !cancel.load(Ordering::Acquire) {
        // lock released before dispatch so handlers may take their time
        let batch = events.lock().read_events(args.wait);
        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                warn!("listener for line {} detached: {e}", args.line);
                return;
            }
        };

        for event in batch {
            if cancel.load(Ordering::Acquire) {
                return;
            }
            if args.edges.matches(event.edge) {
                args.handler.on_event(args.line, &event);
            }
        }
    }
}
