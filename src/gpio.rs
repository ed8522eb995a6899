use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::error::GpioError;
use crate::listener::{EdgeListener, ListenerArgs};
use crate::registry::{Binding, PinRegistry, teardown_unlocked};

/// Consumer label attached to every line request.
pub const CONSUMER_LABEL: &str = env!("CARGO_PKG_NAME");

const DIRECTION_CODE_OUTPUT: i32 = 1;
const DIRECTION_CODE_INPUT: i32 = 2;
const ACTION_CODE_SET_STATE: u8 = 0b0000_0100;
const ACTION_CODE_GET_STATE: u8 = 0b0000_1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Input,
    Output,
}

impl TryFrom<i32> for Direction {
    type Error = GpioError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            DIRECTION_CODE_OUTPUT => Ok(Direction::Output),
            DIRECTION_CODE_INPUT => Ok(Direction::Input),
            _ => Err(GpioError::InvalidMode(format!(
                "direction code {code} is neither input nor output"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Level {
    Low,
    High,
}

impl Level {
    /// Any nonzero line value reads as high.
    pub fn from_value(value: u8) -> Self {
        if value > 0 { Level::High } else { Level::Low }
    }

    pub fn value(self) -> u8 {
        match self {
            Level::Low => 0,
            Level::High => 1,
        }
    }
}

impl TryFrom<i32> for Level {
    type Error = GpioError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Level::Low),
            1 => Ok(Level::High),
            _ => Err(GpioError::InvalidState(format!(
                "level {code} is neither high nor low"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    Get,
    Set,
}

impl TryFrom<u8> for StateAction {
    type Error = GpioError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            ACTION_CODE_SET_STATE => Ok(StateAction::Set),
            ACTION_CODE_GET_STATE => Ok(StateAction::Get),
            _ => Err(GpioError::InvalidAction(format!(
                "action {code:#010b} is neither get nor set state"
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeDetect {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl EdgeDetect {
    /// Kernel event request flags for this mask.
    pub fn bits(self) -> u32 {
        match self {
            EdgeDetect::None => 0,
            EdgeDetect::Rising => EdgeKind::Rising.bits(),
            EdgeDetect::Falling => EdgeKind::Falling.bits(),
            EdgeDetect::Both => EdgeKind::Rising.bits() | EdgeKind::Falling.bits(),
        }
    }

    pub fn matches(self, edge: EdgeKind) -> bool {
        self.bits() & edge.bits() != 0
    }
}

impl TryFrom<u32> for EdgeDetect {
    type Error = GpioError;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        match bits {
            0 => Ok(EdgeDetect::None),
            1 => Ok(EdgeDetect::Rising),
            2 => Ok(EdgeDetect::Falling),
            3 => Ok(EdgeDetect::Both),
            _ => Err(GpioError::InvalidMode(format!(
                "edge flags {bits:#x} select unknown edges"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    Rising,
    Falling,
}

impl EdgeKind {
    pub fn bits(self) -> u32 {
        match self {
            EdgeKind::Rising => 0x01,
            EdgeKind::Falling => 0x02,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LineEvent {
    pub edge: EdgeKind,
    /// Monotonic clock, nanoseconds.
    pub timestamp_ns: u64,
    pub line_seqno: u64,
}

/// Identifies a header pin either by its physical position or by the
/// chip-level (BCM) line number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinRef {
    Physical(u32),
    Bcm(u32),
}

impl fmt::Display for PinRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinRef::Physical(pos) => write!(f, "P1-{pos}"),
            PinRef::Bcm(line) => write!(f, "BCM {line}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PinStatus {
    Unassigned,
    Free,
    Locked(Direction),
    Listening(EdgeDetect),
}

#[derive(Debug, Clone, Serialize)]
pub struct PinDescriptor {
    pub physical: u32,
    pub line: Option<u32>,
    pub status: PinStatus,
}

/// Receives edge events on the listener thread of the pin it was installed
/// on. The first argument is the hardware line id.
pub trait EdgeHandler: Send + 'static {
    fn on_event(&mut self, line: u32, event: &LineEvent);
}

impl<F> EdgeHandler for F
where
    F: FnMut(u32, &LineEvent) + Send + 'static,
{
    fn on_event(&mut self, line: u32, event: &LineEvent) {
        self(line, event)
    }
}

/// An open request on a single line. Dropping it also closes the request,
/// `close` exists so the outcome can be reported.
pub trait LineHandle: Send {
    fn get_value(&self) -> Result<u8, GpioError>;
    fn set_value(&mut self, value: u8) -> Result<(), GpioError>;
    fn close(self: Box<Self>) -> Result<(), GpioError>;
}

pub trait EventLineHandle: LineHandle {
    /// Waits up to `timeout` and returns every pending event in kernel
    /// order, empty when none arrived.
    fn read_events(&mut self, timeout: Duration) -> Result<Vec<LineEvent>, GpioError>;
}

pub trait LineService: Send + Sync {
    fn request_line(
        &self,
        line: u32,
        direction: Direction,
        consumer: &str,
    ) -> Result<Box<dyn LineHandle>, GpioError>;
    fn request_events(
        &self,
        line: u32,
        edges: EdgeDetect,
        consumer: &str,
    ) -> Result<Box<dyn EventLineHandle>, GpioError>;
}

pub struct PinManager<S: LineService + ?Sized> {
    config: Arc<AppConfig>,
    service: Arc<S>,
    registry: PinRegistry,
}

impl<S: LineService + ?Sized> PinManager<S> {
    pub fn new(config: Arc<AppConfig>, service: Arc<S>) -> Result<Self, GpioError> {
        let registry = PinRegistry::new(&config.header)?;

        Ok(Self {
            config,
            service,
            registry,
        })
    }

    pub fn hardware_id(&self, pin: PinRef) -> Result<u32, GpioError> {
        Ok(self.registry.resolve(pin)?.line)
    }

    pub fn physical_position(&self, pin: PinRef) -> Result<u32, GpioError> {
        Ok(self.registry.resolve(pin)?.physical)
    }

    pub fn status(&self, pin: PinRef) -> Result<PinStatus, GpioError> {
        let slot = self.registry.resolve(pin)?;
        let binding = slot.binding.lock();

        Ok(binding.status())
    }

    pub fn pins(&self) -> Vec<PinDescriptor> {
        self.registry
            .slots()
            .map(|slot| PinDescriptor {
                physical: slot.physical,
                line: slot.line,
                status: match slot.line {
                    Some(_) => slot.binding.lock().status(),
                    None => PinStatus::Unassigned,
                },
            })
            .collect()
    }

    pub fn lock(&self, pin: PinRef, direction: Direction) -> Result<(), GpioError> {
        let slot = self.registry.resolve(pin)?;
        let mut binding = slot.binding.lock();

        if !binding.is_unbound() {
            return Err(GpioError::HandleInUse(format!("{pin} is already locked")));
        }

        let handle = self
            .service
            .request_line(slot.line, direction, CONSUMER_LABEL)?;
        *binding = Binding::Line { handle, direction };
        debug!("locked {pin} (line {}) as {direction:?}", slot.line);

        Ok(())
    }

    pub fn release(&self, pin: PinRef) -> Result<(), GpioError> {
        let slot = self.registry.resolve(pin)?;
        let mut binding = slot.binding.lock();

        match &*binding {
            Binding::Unbound => {
                return Err(GpioError::PinNotLocked(format!("{pin} is not locked")));
            }
            Binding::Events(_) => {
                return Err(GpioError::HandleInUse(format!(
                    "{pin} has an event handler installed, clear it first"
                )));
            }
            Binding::Clearing(_) => {
                return Err(GpioError::HandleInUse(format!("{pin} is being cleared")));
            }
            Binding::Line { .. } => {}
        }

        // the slot is cleared even when closing fails
        let released = mem::take(&mut *binding);
        debug!("releasing {pin} (line {})", slot.line);
        released.teardown()
    }

    pub fn pin_state(
        &self,
        pin: PinRef,
        action: StateAction,
        level: Option<Level>,
    ) -> Result<Level, GpioError> {
        let slot = self.registry.resolve(pin)?;
        let mut binding = slot.binding.lock();

        match &mut *binding {
            Binding::Unbound => Err(GpioError::PinNotLocked(format!("{pin} is not locked"))),
            Binding::Line { handle, .. } => apply_state(pin, handle.as_mut(), action, level),
            Binding::Events(listener) => {
                let mut events = listener.events().lock();
                apply_state(pin, &mut **events, action, level)
            }
            Binding::Clearing(_) => Err(GpioError::HandleInUse(format!("{pin} is being cleared"))),
        }
    }

    pub fn get_state(&self, pin: PinRef) -> Result<Level, GpioError> {
        self.pin_state(pin, StateAction::Get, None)
    }

    pub fn set_state(&self, pin: PinRef, level: Level) -> Result<(), GpioError> {
        self.pin_state(pin, StateAction::Set, Some(level)).map(|_| ())
    }

    /// Requests edge events on an unbound pin and starts its listener
    /// thread. Returns as soon as the thread has been spawned.
    pub fn install_handler<H: EdgeHandler>(
        &self,
        pin: PinRef,
        edges: EdgeDetect,
        handler: H,
    ) -> Result<(), GpioError> {
        let slot = self.registry.resolve(pin)?;
        let mut binding = slot.binding.lock();

        if !binding.is_unbound() {
            return Err(GpioError::HandleInUse(format!("{pin} is already locked")));
        }
        if edges == EdgeDetect::None {
            return Err(GpioError::InvalidMode(format!(
                "edge detection on {pin} must select rising, falling or both"
            )));
        }

        let events = self
            .service
            .request_events(slot.line, edges, CONSUMER_LABEL)?;
        match events.get_value() {
            Ok(value) => debug!("{pin} initial line value: {value}"),
            Err(e) => debug!("{pin} initial line value unavailable: {e}"),
        }

        let args = ListenerArgs::new(slot.line, edges, Box::new(handler), self.event_wait());
        let listener = EdgeListener::spawn(args, events)?;
        *binding = Binding::Events(listener);
        debug!("installed {edges:?} handler on {pin} (line {})", slot.line);

        Ok(())
    }

    /// Stops the listener of `pin`, waits for its thread to finish and
    /// releases the pin. The slot lock is not held while waiting, so the
    /// handler may still call into the manager; called from the handler
    /// itself, the listener stops after the callback returns.
    pub fn clear_handler(&self, pin: PinRef) -> Result<(), GpioError> {
        let slot = self.registry.resolve(pin)?;
        let binding = slot.binding.lock();

        match &*binding {
            Binding::Unbound => {
                return Err(GpioError::PinNotLocked(format!("{pin} is not locked")));
            }
            Binding::Line { .. } => {
                return Err(GpioError::NoHandlerInstalled(format!(
                    "{pin} is locked without an event handler"
                )));
            }
            Binding::Clearing(_) => {
                return Err(GpioError::HandleInUse(format!("{pin} is being cleared")));
            }
            Binding::Events(_) => {}
        }

        debug!("clearing handler on {pin} (line {})", slot.line);
        teardown_unlocked(slot.binding, binding)
    }

    /// Stops every listener and closes every handle. Keeps going past
    /// failures and reports the first one.
    pub fn release_all(&self) -> Result<(), GpioError> {
        let mut first_err = None;

        for slot in self.registry.slots() {
            if let Err(e) = teardown_unlocked(&slot.binding, slot.binding.lock()) {
                warn!("release of P1-{} failed: {e}", slot.physical);
                first_err.get_or_insert(e);
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    fn event_wait(&self) -> Duration {
        Duration::from_millis(self.config.event_wait_timeout_ms.max(1))
    }
}

impl<S: LineService + ?Sized> Drop for PinManager<S> {
    fn drop(&mut self) {
        if let Err(e) = self.release_all() {
            warn!("pin teardown incomplete: {e}");
        }
    }
}

fn apply_state<H: LineHandle + ?Sized>(
    pin: PinRef,
    handle: &mut H,
    action: StateAction,
    level: Option<Level>,
) -> Result<Level, GpioError> {
    match action {
        StateAction::Get => Ok(Level::from_value(handle.get_value()?)),
        StateAction::Set => {
            let level = level.ok_or_else(|| {
                GpioError::InvalidState(format!("setting {pin} requires a level"))
            })?;
            handle.set_value(level.value())?;
            Ok(level)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_codes() {
        assert_eq!(Direction::try_from(1).unwrap(), Direction::Output);
        assert_eq!(Direction::try_from(2).unwrap(), Direction::Input);
        assert!(matches!(
            Direction::try_from(3),
            Err(GpioError::InvalidMode(_))
        ));
    }

    #[test]
    fn level_codes() {
        assert_eq!(Level::try_from(1).unwrap(), Level::High);
        assert_eq!(Level::try_from(0).unwrap(), Level::Low);
        assert!(matches!(Level::try_from(-1), Err(GpioError::InvalidState(_))));
        assert_eq!(Level::from_value(7), Level::High);
        assert_eq!(Level::from_value(0), Level::Low);
    }

    #[test]
    fn action_codes() {
        assert_eq!(StateAction::try_from(0b0100).unwrap(), StateAction::Set);
        assert_eq!(StateAction::try_from(0b1000).unwrap(), StateAction::Get);
        // set-mode is a valid action elsewhere but not a state action
        assert!(matches!(
            StateAction::try_from(0b0001),
            Err(GpioError::InvalidAction(_))
        ));
    }

    #[test]
    fn edge_mask_matching() {
        assert!(EdgeDetect::Both.matches(EdgeKind::Rising));
        assert!(EdgeDetect::Both.matches(EdgeKind::Falling));
        assert!(EdgeDetect::Rising.matches(EdgeKind::Rising));
        assert!(!EdgeDetect::Rising.matches(EdgeKind::Falling));
        assert!(!EdgeDetect::None.matches(EdgeKind::Rising));
        assert_eq!(EdgeDetect::try_from(3).unwrap(), EdgeDetect::Both);
        assert!(matches!(
            EdgeDetect::try_from(4),
            Err(GpioError::InvalidMode(_))
        ));
    }

    #[test]
    fn pin_ref_display() {
        assert_eq!(PinRef::Physical(12).to_string(), "P1-12");
        assert_eq!(PinRef::Bcm(18).to_string(), "BCM 18");
    }
}
