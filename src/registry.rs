use std::mem;

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;

use crate::config::{HEADER_PINS, HeaderPin};
use crate::error::GpioError;
use crate::gpio::{Direction, EdgeDetect, LineHandle, PinRef, PinStatus};
use crate::listener::EdgeListener;

/// What currently holds a header pin.
#[derive(Default)]
pub(crate) enum Binding {
    #[default]
    Unbound,
    Line {
        handle: Box<dyn LineHandle>,
        direction: Direction,
    },
    Events(EdgeListener),
    /// Listener taken out of the slot and being stopped without the slot
    /// lock held.
    Clearing(EdgeDetect),
}

impl Binding {
    pub(crate) fn is_unbound(&self) -> bool {
        matches!(self, Binding::Unbound)
    }

    pub(crate) fn status(&self) -> PinStatus {
        match self {
            Binding::Unbound => PinStatus::Free,
            Binding::Line { direction, .. } => PinStatus::Locked(*direction),
            Binding::Events(listener) => PinStatus::Listening(listener.edges()),
            Binding::Clearing(edges) => PinStatus::Listening(*edges),
        }
    }

    /// Stops the listener, if any, before closing the line it reads from.
    pub(crate) fn teardown(self) -> Result<(), GpioError> {
        match self {
            Binding::Unbound | Binding::Clearing(_) => Ok(()),
            Binding::Line { handle, .. } => handle.close(),
            Binding::Events(listener) => match listener.stop()? {
                Some(events) => events.close(),
                // stopped from its own thread, which closes the line on exit
                None => Ok(()),
            },
        }
    }
}

/// Takes the binding out of a locked slot and tears it down after the guard
/// is dropped, so handlers calling back into the pin never wait on a join.
/// A listener leaves the slot `Clearing` until it is gone.
pub(crate) fn teardown_unlocked(
    slot: &Mutex<Binding>,
    mut guard: MutexGuard<'_, Binding>,
) -> Result<(), GpioError> {
    let placeholder = match &*guard {
        Binding::Events(listener) => Binding::Clearing(listener.edges()),
        // another caller is already stopping it
        Binding::Clearing(_) => return Ok(()),
        _ => Binding::Unbound,
    };
    let taken = mem::replace(&mut *guard, placeholder);
    drop(guard);

    let result = taken.teardown();

    let mut binding = slot.lock();
    if matches!(*binding, Binding::Clearing(_)) {
        *binding = Binding::Unbound;
    }
    result
}

pub(crate) struct HeaderSlot {
    pub physical: u32,
    pub line: Option<u32>,
    pub binding: Mutex<Binding>,
}

/// A slot with a GPIO function, as returned by lookups.
pub(crate) struct GpioSlot<'a> {
    pub physical: u32,
    pub line: u32,
    pub binding: &'a Mutex<Binding>,
}

pub(crate) struct PinRegistry {
    slots: Vec<HeaderSlot>,
    by_line: FxHashMap<u32, usize>,
}

impl PinRegistry {
    pub(crate) fn new(header: &[HeaderPin]) -> Result<Self, GpioError> {
        if header.len() != HEADER_PINS {
            return Err(GpioError::Config(format!(
                "header table has {} pins, expected {HEADER_PINS}",
                header.len()
            )));
        }

        let mut lines: Vec<Option<Option<u32>>> = vec![None; HEADER_PINS];
        let mut by_line = FxHashMap::default();

        for pin in header {
            if !(1..=HEADER_PINS as u32).contains(&pin.physical) {
                return Err(GpioError::Config(format!(
                    "physical position {} outside 1..={HEADER_PINS}",
                    pin.physical
                )));
            }
            let idx = pin.physical as usize - 1;
            if lines[idx].replace(pin.line).is_some() {
                return Err(GpioError::Config(format!(
                    "physical position {} listed twice",
                    pin.physical
                )));
            }
            if let Some(line) = pin.line
                && by_line.insert(line, idx).is_some()
            {
                return Err(GpioError::Config(format!(
                    "line {line} assigned to more than one position"
                )));
            }
        }

        // 40 distinct positions in 1..=40 fill every slot
        let slots = lines
            .into_iter()
            .enumerate()
            .map(|(idx, line)| HeaderSlot {
                physical: idx as u32 + 1,
                line: line.flatten(),
                binding: Mutex::new(Binding::Unbound),
            })
            .collect();

        Ok(Self { slots, by_line })
    }

    pub(crate) fn resolve(&self, pin: PinRef) -> Result<GpioSlot<'_>, GpioError> {
        let idx = match pin {
            PinRef::Physical(pos) => (pos as usize)
                .checked_sub(1)
                .filter(|idx| *idx < self.slots.len()),
            PinRef::Bcm(line) => self.by_line.get(&line).copied(),
        }
        .ok_or_else(|| GpioError::NoSuchPin(format!("{pin} is not on the header")))?;

        let slot = &self.slots[idx];
        let line = slot
            .line
            .ok_or_else(|| GpioError::NoSuchPin(format!("{pin} has no GPIO function")))?;

        Ok(GpioSlot {
            physical: slot.physical,
            line,
            binding: &slot.binding,
        })
    }

    pub(crate) fn slots(&self) -> impl Iterator<Item = &HeaderSlot> {
        self.slots.iter()
    }
}
