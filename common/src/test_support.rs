use std::{cell::Cell, collections::VecDeque, rc::Rc, time::Duration};

use chrono::NaiveDate;

use crate::{
    astronomy::{Fetch, FetchError, FetchResponse},
    scheduler::Host,
    time::Clock,
};

pub fn epoch(year: i32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> i64 {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, second))
        .expect("valid test date")
        .and_utc()
        .timestamp()
}

#[derive(Debug, Clone)]
pub struct FakeClock {
    now: Rc<Cell<i64>>,
    millis: Rc<Cell<u64>>,
    offset: Rc<Cell<i32>>,
    dst: Rc<Cell<bool>>,
    syncs: Rc<Cell<u32>>,
}

impl FakeClock {
    pub fn at(now: i64, offset_hours: i32) -> Self {
        Self {
            now: Rc::new(Cell::new(now)),
            millis: Rc::new(Cell::new(10_000)),
            offset: Rc::new(Cell::new(offset_hours)),
            dst: Rc::new(Cell::new(false)),
            syncs: Rc::new(Cell::new(0)),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.set(now);
    }

    pub fn set_dst(&self, dst: bool) {
        self.dst.set(dst);
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance_millis(secs * 1_000);
    }

    pub fn advance_millis(&self, ms: u64) {
        self.millis.set(self.millis.get() + ms);
        self.now.set(self.now.get() + (ms / 1_000) as i64);
    }

    pub fn syncs(&self) -> u32 {
        self.syncs.get()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> i64 {
        self.now.get()
    }

    fn zone_offset(&self, _timestamp: i64) -> i32 {
        self.offset.get()
    }

    fn is_daylight_saving(&self, _timestamp: i64) -> bool {
        self.dst.get()
    }

    fn millis(&self) -> u64 {
        self.millis.get()
    }

    fn sync_from_network(&mut self) {
        self.syncs.set(self.syncs.get() + 1);
    }
}

#[derive(Debug, Default)]
pub struct FakeFetch {
    responses: VecDeque<Result<FetchResponse, FetchError>>,
    calls: Vec<(String, String)>,
}

impl FakeFetch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&mut self, status: u16, body: &str) {
        self.responses.push_back(Ok(FetchResponse {
            status,
            body: body.to_string(),
        }));
    }

    pub fn push_err(&mut self, message: &str) {
        self.responses
            .push_back(Err(FetchError::Transport(message.to_string())));
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.clone()
    }
}

impl Fetch for FakeFetch {
    fn get(&mut self, host: &str, path: &str) -> Result<FetchResponse, FetchError> {
        self.calls.push((host.to_string(), path.to_string()));
        self.responses
            .pop_front()
            .unwrap_or_else(|| Err(FetchError::Transport("no response queued".to_string())))
    }
}

#[derive(Debug)]
pub struct FakeHost {
    clock: FakeClock,
    delays: Vec<Duration>,
    maintenance_calls: u32,
}

impl FakeHost {
    pub fn new(clock: FakeClock) -> Self {
        Self {
            clock,
            delays: Vec::new(),
            maintenance_calls: 0,
        }
    }

    pub fn delays(&self) -> usize {
        self.delays.len()
    }

    pub fn total_delay(&self) -> Duration {
        self.delays.iter().sum()
    }

    pub fn maintenance_calls(&self) -> u32 {
        self.maintenance_calls
    }
}

impl Host for FakeHost {
    fn delay(&mut self, duration: Duration) {
        self.delays.push(duration);
        self.clock.advance_millis(duration.as_millis() as u64);
    }

    fn network_maintenance(&mut self) {
        self.maintenance_calls += 1;
    }
}
