use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::error::GpioError;
use crate::gpio::{
    Direction, EdgeDetect, EdgeKind, EventLineHandle, Level, LineEvent, LineHandle, LineService,
};

/// In-memory stand-in for the GPIO character device. Clones share the same
/// simulated chip, so a test can keep one to drive lines while the manager
/// owns another.
#[derive(Clone)]
pub struct MockLineService {
    chip: Arc<Mutex<MockChip>>,
}

/// Failures the simulated chip reports until switched off again.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockFaults {
    pub open_device: bool,
    /// Allocation failure while building a request.
    pub request_resources: bool,
    pub request: bool,
    pub get_value: bool,
    pub set_value: bool,
    pub close: bool,
}

struct MockChip {
    epoch: Instant,
    lines: FxHashMap<u32, MockLine>,
    faults: MockFaults,
    open_handles: usize,
}

#[derive(Default)]
struct MockLine {
    value: u8,
    request: Option<MockRequest>,
}

enum MockRequest {
    Line(Direction),
    Events {
        edges: EdgeDetect,
        queue: Arc<EventQueue>,
        seqno: u64,
    },
}

#[derive(Default)]
struct EventQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

#[derive(Default)]
struct QueueState {
    events: VecDeque<LineEvent>,
    detached: bool,
}

impl EventQueue {
    fn push(&self, event: LineEvent) {
        self.state.lock().events.push_back(event);
        self.ready.notify_all();
    }

    fn detach(&self) {
        self.state.lock().detached = true;
        self.ready.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Result<Vec<LineEvent>, GpioError> {
        let mut state = self.state.lock();
        if state.events.is_empty() && !state.detached {
            self.ready.wait_for(&mut state, timeout);
        }
        if state.detached {
            return Err(GpioError::EventReadFailed("bad file descriptor".into()));
        }
        Ok(state.events.drain(..).collect())
    }
}

impl Default for MockLineService {
    fn default() -> Self {
        Self {
            chip: Arc::new(Mutex::new(MockChip {
                epoch: Instant::now(),
                lines: FxHashMap::default(),
                faults: MockFaults::default(),
                open_handles: 0,
            })),
        }
    }
}

impl MockLineService {
    pub fn set_faults(&self, faults: MockFaults) {
        self.chip.lock().faults = faults;
    }

    /// Simulates an external signal on `line`. A level change queues an
    /// edge event when the line is requested for a matching edge.
    pub fn drive(&self, line: u32, level: Level) {
        let mut chip = self.chip.lock();
        let timestamp_ns = chip.epoch.elapsed().as_nanos() as u64;
        let entry = chip.lines.entry(line).or_default();

        let old = entry.value;
        entry.value = level.value();
        let edge = match (old, entry.value) {
            (0, 1) => EdgeKind::Rising,
            (1, 0) => EdgeKind::Falling,
            _ => return,
        };

        if let Some(MockRequest::Events {
            edges,
            queue,
            seqno,
        }) = &mut entry.request
            && edges.matches(edge)
        {
            *seqno += 1;
            queue.push(LineEvent {
                edge,
                timestamp_ns,
                line_seqno: *seqno,
            });
        }
    }

    /// Queues `edge` on the event request of `line` without consulting its
    /// edge flags. Returns false when nothing listens on the line.
    pub fn inject_event(&self, line: u32, edge: EdgeKind) -> bool {
        let mut chip = self.chip.lock();
        let timestamp_ns = chip.epoch.elapsed().as_nanos() as u64;

        match chip.lines.get_mut(&line).and_then(|l| l.request.as_mut()) {
            Some(MockRequest::Events { queue, seqno, .. }) => {
                *seqno += 1;
                queue.push(LineEvent {
                    edge,
                    timestamp_ns,
                    line_seqno: *seqno,
                });
                true
            }
            _ => false,
        }
    }

    /// Makes further event reads on `line` fail, as if its descriptor had
    /// been closed underneath the reader.
    pub fn detach(&self, line: u32) -> bool {
        let chip = self.chip.lock();

        match chip.lines.get(&line).and_then(|l| l.request.as_ref()) {
            Some(MockRequest::Events { queue, .. }) => {
                queue.detach();
                true
            }
            _ => false,
        }
    }

    pub fn is_requested(&self, line: u32) -> bool {
        self.chip
            .lock()
            .lines
            .get(&line)
            .is_some_and(|l| l.request.is_some())
    }

    pub fn level(&self, line: u32) -> Level {
        Level::from_value(self.chip.lock().lines.get(&line).map_or(0, |l| l.value))
    }

    pub fn open_handles(&self) -> usize {
        self.chip.lock().open_handles
    }

    fn claim(&self, line: u32, request: MockRequest) -> Result<(), GpioError> {
        let mut chip = self.chip.lock();

        if chip.faults.open_device {
            return Err(GpioError::OpenDevice("no such file or directory".into()));
        }
        if chip.faults.request_resources {
            return Err(GpioError::OutOfResources(format!(
                "line {line} request config: cannot allocate memory"
            )));
        }
        if chip.faults.request {
            return Err(GpioError::RequestFailed(format!(
                "request line {line}: invalid argument"
            )));
        }

        let entry = chip.lines.entry(line).or_default();
        if entry.request.is_some() {
            return Err(GpioError::RequestFailed(format!(
                "request line {line}: device or resource busy"
            )));
        }
        if matches!(request, MockRequest::Line(Direction::Output)) {
            entry.value = 0;
        }
        entry.request = Some(request);
        chip.open_handles += 1;

        Ok(())
    }
}

impl MockChip {
    fn read(&self, line: u32) -> Result<u8, GpioError> {
        if self.faults.get_value {
            return Err(GpioError::GetValuesFailed(format!(
                "line {line}: input/output error"
            )));
        }
        Ok(self.lines.get(&line).map_or(0, |l| l.value))
    }

    fn unclaim(&mut self, line: u32) -> Result<(), GpioError> {
        if let Some(entry) = self.lines.get_mut(&line) {
            entry.request = None;
        }
        self.open_handles = self.open_handles.saturating_sub(1);

        // the descriptor is gone either way, the error is only reported
        if self.faults.close {
            return Err(GpioError::ReleaseFailed(format!(
                "close line {line}: input/output error"
            )));
        }
        Ok(())
    }
}

impl LineService for MockLineService {
    fn request_line(
        &self,
        line: u32,
        direction: Direction,
        _consumer: &str,
    ) -> Result<Box<dyn LineHandle>, GpioError> {
        self.claim(line, MockRequest::Line(direction))?;

        Ok(Box::new(MockLineHandle {
            chip: self.chip.clone(),
            line,
            direction,
            closed: false,
        }))
    }

    fn request_events(
        &self,
        line: u32,
        edges: EdgeDetect,
        _consumer: &str,
    ) -> Result<Box<dyn EventLineHandle>, GpioError> {
        let queue = Arc::new(EventQueue::default());
        self.claim(
            line,
            MockRequest::Events {
                edges,
                queue: queue.clone(),
                seqno: 0,
            },
        )?;

        Ok(Box::new(MockEventHandle {
            chip: self.chip.clone(),
            line,
            queue,
            closed: false,
        }))
    }
}

struct MockLineHandle {
    chip: Arc<Mutex<MockChip>>,
    line: u32,
    direction: Direction,
    closed: bool,
}

impl LineHandle for MockLineHandle {
    fn get_value(&self) -> Result<u8, GpioError> {
        self.chip.lock().read(self.line)
    }

    fn set_value(&mut self, value: u8) -> Result<(), GpioError> {
        let mut chip = self.chip.lock();

        if chip.faults.set_value {
            return Err(GpioError::SetValuesFailed(format!(
                "line {}: input/output error",
                self.line
            )));
        }
        if self.direction != Direction::Output {
            return Err(GpioError::SetValuesFailed(format!(
                "line {}: operation not permitted on input",
                self.line
            )));
        }
        chip.lines.entry(self.line).or_default().value = value;

        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<(), GpioError> {
        self.closed = true;
        self.chip.lock().unclaim(self.line)
    }
}

impl Drop for MockLineHandle {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.chip.lock().unclaim(self.line);
        }
    }
}

struct MockEventHandle {
    chip: Arc<Mutex<MockChip>>,
    line: u32,
    queue: Arc<EventQueue>,
    closed: bool,
}

impl LineHandle for MockEventHandle {
    fn get_value(&self) -> Result<u8, GpioError> {
        self.chip.lock().read(self.line)
    }

    fn set_value(&mut self, _value: u8) -> Result<(), GpioError> {
        Err(GpioError::SetValuesFailed(format!(
            "line {}: operation not permitted on event line",
            self.line
        )))
    }

    fn close(mut self: Box<Self>) -> Result<(), GpioError> {
        self.closed = true;
        self.chip.lock().unclaim(self.line)
    }
}

impl Drop for MockEventHandle {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.chip.lock().unclaim(self.line);
        }
    }
}

impl EventLineHandle for MockEventHandle {
    fn read_events(&mut self, timeout: Duration) -> Result<Vec<LineEvent>, GpioError> {
        self.queue.wait(timeout)
    }
}
