mod backend;
mod config;
mod error;
mod gpio;
mod listener;
mod registry;

pub use config::{AppConfig, DEFAULT_CHIP, HEADER_PINS, HeaderPin, raspberry_pi_header};
pub use error::GpioError;
pub use gpio::{
    CONSUMER_LABEL, Direction, EdgeDetect, EdgeHandler, EdgeKind, EventLineHandle, Level,
    LineEvent, LineHandle, LineService, PinDescriptor, PinManager, PinRef, PinStatus,
    StateAction,
};

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodLineService;
pub use backend::{MockFaults, MockLineService};
