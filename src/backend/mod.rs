#[cfg(feature = "hardware-gpio")]
pub mod libgpiod;
pub mod mock;

#[cfg(feature = "hardware-gpio")]
pub use self::libgpiod::LibgpiodLineService;
pub use mock::{MockFaults, MockLineService};
