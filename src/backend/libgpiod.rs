use log::warn;
use std::path::PathBuf;
use std::time::Duration;

use libgpiod::{chip::Chip, line, line::EventClock, request};

use crate::config::AppConfig;
use crate::error::GpioError;
use crate::gpio::{
    Direction, EdgeDetect, EdgeKind, EventLineHandle, LineEvent, LineHandle, LineService,
};

pub struct LibgpiodLineService {
    chip: PathBuf,
    event_buffer_capacity: usize,
}

impl LibgpiodLineService {
    pub fn new(config: &AppConfig) -> Result<Self, GpioError> {
        let service = Self {
            chip: PathBuf::from(&config.chip),
            event_buffer_capacity: config.event_buffer_capacity.max(1),
        };
        // fail early when the controller is missing
        service.open_chip()?;

        Ok(service)
    }

    fn open_chip(&self) -> Result<Chip, GpioError> {
        Chip::open(&self.chip)
            .map_err(|e| GpioError::OpenDevice(format!("open chip {}: {e}", self.chip.display())))
    }

    /// Opens the controller, requests `offset` and lets the chip close again;
    /// the request holds its own descriptor.
    fn request(
        &self,
        offset: u32,
        settings: line::Settings,
        consumer: &str,
    ) -> Result<request::Request, GpioError> {
        let mut line_cfg = line::Config::new()
            .map_err(|e| GpioError::OutOfResources(format!("line config: {e}")))?;
        line_cfg
            .add_line_settings(&[offset], settings)
            .map_err(|e| GpioError::RequestFailed(format!("line config add settings: {e}")))?;

        let mut req_cfg = request::Config::new()
            .map_err(|e| GpioError::OutOfResources(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(consumer)
            .map_err(|e| GpioError::RequestFailed(format!("request consumer: {e}")))?;

        let chip = self.open_chip()?;
        chip.request_lines(Some(&req_cfg), &line_cfg)
            .map_err(|e| GpioError::RequestFailed(format!("request line {offset}: {e}")))
    }
}

fn new_settings() -> Result<line::Settings, GpioError> {
    line::Settings::new().map_err(|e| GpioError::OutOfResources(format!("line settings: {e}")))
}

fn direction_settings(direction: Direction) -> Result<line::Settings, GpioError> {
    let mut ls = new_settings()?;

    match direction {
        Direction::Input => {
            ls.set_direction(line::Direction::Input)
                .map_err(|e| GpioError::RequestFailed(format!("set direction: {e}")))?;
        }
        Direction::Output => {
            ls.set_direction(line::Direction::Output)
                .map_err(|e| GpioError::RequestFailed(format!("set direction: {e}")))?;
        }
    }

    Ok(ls)
}

fn edge_settings(edges: EdgeDetect) -> Result<line::Settings, GpioError> {
    let edge = match edges {
        EdgeDetect::None => {
            return Err(GpioError::InvalidMode(
                "edge detection must select at least one edge".into(),
            ));
        }
        EdgeDetect::Rising => line::Edge::Rising,
        EdgeDetect::Falling => line::Edge::Falling,
        EdgeDetect::Both => line::Edge::Both,
    };

    let mut ls = new_settings()?;
    ls.set_direction(line::Direction::Input)
        .map_err(|e| GpioError::RequestFailed(format!("set direction: {e}")))?;
    ls.set_edge_detection(Some(edge))
        .map_err(|e| GpioError::RequestFailed(format!("set edge detection: {e}")))?;
    ls.set_event_clock(EventClock::Monotonic)
        .map_err(|e| GpioError::RequestFailed(format!("set event clock: {e}")))?;

    Ok(ls)
}

fn line_value(value: line::Value) -> u8 {
    match value {
        line::Value::InActive => 0,
        line::Value::Active => 1,
    }
}

impl LineService for LibgpiodLineService {
    fn request_line(
        &self,
        line: u32,
        direction: Direction,
        consumer: &str,
    ) -> Result<Box<dyn LineHandle>, GpioError> {
        let settings = direction_settings(direction)?;
        let request = self.request(line, settings, consumer)?;

        Ok(Box::new(GpiodLine {
            request,
            offset: line,
        }))
    }

    fn request_events(
        &self,
        line: u32,
        edges: EdgeDetect,
        consumer: &str,
    ) -> Result<Box<dyn EventLineHandle>, GpioError> {
        let settings = edge_settings(edges)?;
        let buffer = request::Buffer::new(self.event_buffer_capacity)
            .map_err(|e| GpioError::OutOfResources(format!("event buffer: {e}")))?;
        let request = self.request(line, settings, consumer)?;

        Ok(Box::new(GpiodEventLine {
            line: GpiodLine {
                request,
                offset: line,
            },
            buffer,
        }))
    }
}

struct GpiodLine {
    request: request::Request,
    offset: u32,
}

impl LineHandle for GpiodLine {
    fn get_value(&self) -> Result<u8, GpioError> {
        self.request
            .value(self.offset)
            .map(line_value)
            .map_err(|e| GpioError::GetValuesFailed(format!("get value: {e}")))
    }

    fn set_value(&mut self, value: u8) -> Result<(), GpioError> {
        let value = match value {
            0 => line::Value::InActive,
            _ => line::Value::Active,
        };
        self.request
            .set_value(self.offset, value)
            .map_err(|e| GpioError::SetValuesFailed(format!("set value: {e}")))?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), GpioError> {
        // releasing a request cannot fail in libgpiod
        drop(self);
        Ok(())
    }
}

struct GpiodEventLine {
    line: GpiodLine,
    buffer: request::Buffer,
}

impl LineHandle for GpiodEventLine {
    fn get_value(&self) -> Result<u8, GpioError> {
        self.line.get_value()
    }

    fn set_value(&mut self, value: u8) -> Result<(), GpioError> {
        self.line.set_value(value)
    }

    fn close(self: Box<Self>) -> Result<(), GpioError> {
        drop(self);
        Ok(())
    }
}

impl EventLineHandle for GpiodEventLine {
    fn read_events(&mut self, timeout: Duration) -> Result<Vec<LineEvent>, GpioError> {
        let offset = self.line.offset;
        let req = &self.line.request;

        let has_event = req.wait_edge_events(Some(timeout)).map_err(|e| {
            GpioError::EventReadFailed(format!("wait edge events on line {offset}: {e}"))
        })?;
        if !has_event {
            return Ok(Vec::new());
        }

        let events = req.read_edge_events(&mut self.buffer).map_err(|e| {
            GpioError::EventReadFailed(format!("read edge events on line {offset}: {e}"))
        })?;

        let mut batch = Vec::new();
        for evt in events {
            let evt = match evt {
                Ok(e) => e,
                Err(e) => {
                    warn!("skipping malformed edge event on line {offset}: {e}");
                    continue;
                }
            };
            let edge = match evt.event_type() {
                Ok(line::EdgeKind::Rising) => EdgeKind::Rising,
                Ok(line::EdgeKind::Falling) => EdgeKind::Falling,
                Err(_) => continue,
            };

            batch.push(LineEvent {
                edge,
                timestamp_ns: evt.timestamp().as_nanos() as u64,
                line_seqno: evt.line_seqno() as u64,
            });
        }

        Ok(batch)
    }
}
