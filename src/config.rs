use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::GpioError;

pub const DEFAULT_CHIP: &str = "/dev/gpiochip0";
pub const HEADER_PINS: usize = 40;

const DEFAULT_EVENT_WAIT_TIMEOUT_MS: u64 = 10;
const DEFAULT_EVENT_BUFFER_CAPACITY: usize = 64;

/// Raspberry Pi P1 header, physical position to BCM line, `None` for power
/// and ground.
#[rustfmt::skip]
const RPI_P1_HEADER: [Option<u32>; HEADER_PINS] = [
    None,     None,     Some(2),  None,     Some(3),  // 1 - 5
    None,     Some(4),  Some(14), None,     Some(15), // 6 - 10
    Some(17), Some(18), Some(27), None,     Some(22), // 11 - 15
    Some(23), None,     Some(24), Some(10), None,     // 16 - 20
    Some(9),  Some(25), Some(11), Some(8),  None,     // 21 - 25
    Some(7),  Some(0),  Some(1),  Some(5),  None,     // 26 - 30
    Some(6),  Some(12), Some(13), None,     Some(19), // 31 - 35
    Some(16), Some(26), Some(20), None,     Some(21), // 36 - 40
];

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct HeaderPin {
    pub physical: u32,
    pub line: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_chip")]
    pub chip: String,
    #[serde(default = "default_event_wait_timeout_ms")]
    pub event_wait_timeout_ms: u64,
    #[serde(default = "default_event_buffer_capacity")]
    pub event_buffer_capacity: usize,
    #[serde(default = "raspberry_pi_header")]
    pub header: Vec<HeaderPin>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            chip: default_chip(),
            event_wait_timeout_ms: default_event_wait_timeout_ms(),
            event_buffer_capacity: default_event_buffer_capacity(),
            header: raspberry_pi_header(),
        }
    }
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        serde_json::from_str(&contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))
    }
}

pub fn raspberry_pi_header() -> Vec<HeaderPin> {
    RPI_P1_HEADER
        .iter()
        .enumerate()
        .map(|(idx, line)| HeaderPin {
            physical: idx as u32 + 1,
            line: *line,
        })
        .collect()
}

fn default_chip() -> String {
    DEFAULT_CHIP.to_string()
}

fn default_event_wait_timeout_ms() -> u64 {
    DEFAULT_EVENT_WAIT_TIMEOUT_MS
}

fn default_event_buffer_capacity() -> usize {
    DEFAULT_EVENT_BUFFER_CAPACITY
}
