use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("No such pin: {0}")]
    NoSuchPin(String),
    #[error("Line request failed: {0}")]
    RequestFailed(String),
    #[error("Handle in use: {0}")]
    HandleInUse(String),
    #[error("Invalid mode: {0}")]
    InvalidMode(String),
    #[error("Pin not locked: {0}")]
    PinNotLocked(String),
    #[error("Release failed: {0}")]
    ReleaseFailed(String),
    #[error("Cannot open device: {0}")]
    OpenDevice(String),
    #[error("Out of resources: {0}")]
    OutOfResources(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid action: {0}")]
    InvalidAction(String),
    #[error("Set line values failed: {0}")]
    SetValuesFailed(String),
    #[error("Get line values failed: {0}")]
    GetValuesFailed(String),
    #[error("No handler installed: {0}")]
    NoHandlerInstalled(String),
    #[error("Event read failed: {0}")]
    EventReadFailed(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GpioError {
    /// Numeric code of the C-style interface this crate replaces, negative
    /// like the codes its callers used to receive.
    pub fn code(&self) -> i32 {
        match self {
            GpioError::NoSuchPin(_) => -1,
            GpioError::RequestFailed(_) => -2,
            GpioError::HandleInUse(_) => -3,
            GpioError::InvalidMode(_) => -4,
            GpioError::PinNotLocked(_) => -5,
            GpioError::ReleaseFailed(_) => -6,
            GpioError::OpenDevice(_) => -7,
            GpioError::OutOfResources(_) => -8,
            GpioError::InvalidState(_) => -9,
            GpioError::InvalidAction(_) => -10,
            GpioError::SetValuesFailed(_) => -11,
            GpioError::GetValuesFailed(_) => -12,
            GpioError::NoHandlerInstalled(_) => -13,
            GpioError::EventReadFailed(_) => -14,
            GpioError::Config(_) => -15,
        }
    }
}
