use log::{info, warn};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gpiolock::{
    AppConfig, Direction, EdgeDetect, GpioError, Level, LineEvent, LineService, PinManager,
    PinRef,
};

#[cfg(feature = "hardware-gpio")]
use gpiolock::LibgpiodLineService;
#[cfg(not(feature = "hardware-gpio"))]
use gpiolock::MockLineService;

const DEFAULT_PIN: u32 = 18;
const LISTEN_PERIOD: Duration = Duration::from_secs(8);

fn main() -> ExitCode {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GPIOLOCK_CONFIG").ok());
    let config = Arc::new(match config_path {
        Some(path) => AppConfig::load_from_file(&path)
            .unwrap_or_else(|e| panic!("Failed to load config: {e}")),
        None => AppConfig::default(),
    });
    let pin = PinRef::Bcm(
        std::env::args()
            .nth(2)
            .map(|arg| {
                arg.parse::<u32>()
                    .unwrap_or_else(|e| panic!("Invalid pin '{arg}': {e}"))
            })
            .unwrap_or(DEFAULT_PIN),
    );

    let service = {
        #[cfg(feature = "hardware-gpio")]
        {
            Arc::new(
                LibgpiodLineService::new(&config)
                    .unwrap_or_else(|e| panic!("Failed to init libgpiod backend: {e}")),
            )
        }
        #[cfg(not(feature = "hardware-gpio"))]
        {
            Arc::new(MockLineService::default())
        }
    };

    let manager = PinManager::new(config, service.clone())
        .unwrap_or_else(|e| panic!("Failed to build pin registry: {e}"));

    #[cfg(not(feature = "hardware-gpio"))]
    let toggler = manager
        .hardware_id(pin)
        .ok()
        .map(|line| spawn_toggler((*service).clone(), line));

    let result = run(&manager, pin);

    #[cfg(not(feature = "hardware-gpio"))]
    let _ = toggler.map(thread::JoinHandle::join);

    match result {
        Ok(()) => {
            info!("done");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(e.code().unsigned_abs() as u8)
        }
    }
}

fn run<S: LineService + ?Sized>(manager: &PinManager<S>, pin: PinRef) -> Result<(), GpioError> {
    manager.lock(pin, Direction::Output)?;

    match manager
        .set_state(pin, Level::High)
        .and_then(|_| manager.get_state(pin))
    {
        Ok(level) => info!("{pin} reads {level:?}"),
        Err(e) => warn!("set state on {pin} failed: {e}"),
    }

    manager.release(pin)?;

    manager.install_handler(pin, EdgeDetect::Both, |line: u32, event: &LineEvent| {
        info!(
            "line {line}: {:?} edge at {} ns (seq {})",
            event.edge, event.timestamp_ns, event.line_seqno
        );
    })?;
    info!("listening on {pin} for {}s", LISTEN_PERIOD.as_secs());
    thread::sleep(LISTEN_PERIOD);

    manager.clear_handler(pin)?;
    info!("handler on {pin} cleared");

    Ok(())
}

/// Stands in for a button on the mock chip while the handler listens.
#[cfg(not(feature = "hardware-gpio"))]
fn spawn_toggler(mock: MockLineService, line: u32) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let steps = LISTEN_PERIOD.as_millis() / 500;
        for step in 0..steps {
            thread::sleep(Duration::from_millis(500));
            let level = if step % 2 == 0 { Level::High } else { Level::Low };
            mock.drive(line, level);
        }
    })
}
