use std::time::Duration;

use tracing::{debug, info, warn};

use crate::{
    astronomy::{fetch_astronomy, AstronomyError, AstronomyState, Fetch, RetryPolicy},
    config::{EngineConfig, SchedulerConfiguration},
    occupancy::OccupancySet,
    schedule::{EventKind, Task, TaskRegistry},
    time::{format_iso, local_second, resolve_named_time_today, resolve_symbol, split_timestamp, Clock},
    types::{SchedulerStatus, TaskView},
};

pub trait Host {
    fn delay(&mut self, duration: Duration);

    fn network_maintenance(&mut self);
}

pub struct SchedulerEngine<C, F, H> {
    pub config: EngineConfig,
    configuration: Option<SchedulerConfiguration>,

    clock: C,
    fetch: F,
    host: H,
    retry: RetryPolicy,

    astronomy: AstronomyState,
    occupancy: OccupancySet,
    tasks: TaskRegistry,

    last_time_sync_ms: u64,
    last_loop_check_ms: Option<u64>,
}

impl<C: Clock, F: Fetch, H: Host> SchedulerEngine<C, F, H> {
    pub fn new(mut config: EngineConfig, clock: C, fetch: F, host: H) -> Self {
        config.sanitize();
        let retry = config.retry_policy();
        // The platform syncs its clock on boot.
        let last_time_sync_ms = clock.millis();

        Self {
            config,
            configuration: None,
            clock,
            fetch,
            host,
            retry,
            astronomy: AstronomyState::default(),
            occupancy: OccupancySet::default(),
            tasks: TaskRegistry::default(),
            last_time_sync_ms,
            last_loop_check_ms: None,
        }
    }

    pub fn set_retry_policy(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn configure(&mut self, configuration: SchedulerConfiguration) {
        self.configuration = Some(configuration);
        self.check_toggled_state();
    }

    pub fn configuration(&self) -> Option<&SchedulerConfiguration> {
        self.configuration.as_ref()
    }

    pub fn set_astronomy_api_url(&mut self, url: &str) {
        self.configuration_mut().astronomy_api_url = url.to_string();
    }

    pub fn set_astronomy_api_check_time(&mut self, check_time: &str) {
        self.configuration_mut().astronomy_api_check_time = check_time.to_string();
    }

    pub fn set_is_enabled(&mut self, enabled: bool) {
        self.configuration_mut().is_enabled = enabled;
    }

    pub fn set_home_only_mode_enabled(&mut self, enabled: bool) {
        self.configuration_mut().home_only_mode_enabled = enabled;
        self.check_toggled_state();
    }

    pub fn add_task(&mut self, task: Task) {
        debug!(start = task.start(), end = task.end(), "registering task");
        if task.references_astronomy() {
            self.astronomy.require_astronomy_data();
        }
        self.tasks.push(task);
    }

    pub fn register_task(
        &mut self,
        start: &str,
        end: &str,
        on_edge: impl FnMut(EventKind) + 'static,
    ) {
        self.add_task(Task::new(start, end, on_edge));
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn mark_present(&mut self, id: &str) {
        if self.occupancy.mark_present(id) {
            info!(id, home = self.occupancy.count(), "device home");
        }
        self.check_toggled_state();
    }

    pub fn mark_away(&mut self, id: &str) {
        if self.occupancy.mark_away(id) {
            info!(id, home = self.occupancy.count(), "device away");
        }
        self.check_toggled_state();
    }

    pub fn reset_presence(&mut self) {
        self.occupancy.reset();
        info!("presence reset");
        self.check_toggled_state();
    }

    pub fn current_home_count(&self) -> usize {
        self.occupancy.count()
    }

    pub fn is_using_astronomy_data(&self) -> bool {
        self.astronomy.is_using_astronomy_data()
    }

    pub fn sunrise_time(&self) -> Option<i64> {
        self.astronomy.sunrise()
    }

    pub fn sunset_time(&self) -> Option<i64> {
        self.astronomy.sunset()
    }

    pub fn last_time_sync(&self) -> u64 {
        self.last_time_sync_ms
    }

    pub fn is_dst(&self) -> bool {
        self.clock.is_daylight_saving(self.clock.now())
    }

    pub fn is_enabled(&self) -> bool {
        let Some(configuration) = self.configuration.as_ref() else {
            return false;
        };
        configuration.is_enabled
            && (!configuration.home_only_mode_enabled || self.occupancy.is_anyone_home())
    }

    pub fn should_be_toggled(&self) -> bool {
        self.tasks
            .is_active_window(&self.clock, &self.astronomy, self.clock.now())
    }

    /// Only task 0 is notified; the other tasks are left alone.
    pub fn check_toggled_state(&mut self) {
        let event = if self.is_enabled() && self.should_be_toggled() {
            EventKind::Start
        } else {
            EventKind::End
        };

        if let Some(task) = self.tasks.first_mut() {
            debug!(event = event.as_str(), "re-evaluating toggled state");
            task.fire(event);
        }
    }

    pub fn tick(&mut self) {
        if self.configuration.is_none() {
            debug!("configuration not set; skipping tick");
            return;
        }

        if self.last_loop_check_ms.is_none() {
            self.align_to_minute();
        }

        let now_ms = self.clock.millis();
        if let Some(last) = self.last_loop_check_ms {
            if now_ms.saturating_sub(last) < self.config.check_interval_ms {
                return;
            }
        }

        debug!(at = %format_iso(&self.clock, self.clock.now()), "tock");

        self.sync_time(now_ms);

        if let Err(err) = self.refresh_astronomy() {
            warn!("astronomy refresh abandoned: {err}");
        }

        if self.is_enabled() {
            self.check_scheduler_tasks();
        }

        self.last_loop_check_ms = Some(now_ms);
    }

    pub fn refresh_astronomy(&mut self) -> Result<bool, AstronomyError> {
        let Some(configuration) = self.configuration.as_ref() else {
            return Ok(false);
        };
        if !self
            .astronomy
            .is_refresh_due(&self.clock, &configuration.astronomy_api_check_time)
        {
            return Ok(false);
        }

        let url = configuration.astronomy_api_url.clone();
        let mut attempts = 0_u32;

        loop {
            attempts = attempts.saturating_add(1);
            info!(attempt = attempts, "retrieving astronomy data");

            match fetch_astronomy(&mut self.fetch, &url) {
                Ok(reading) => {
                    let sunset = resolve_named_time_today(
                        &self.clock,
                        reading.sunset_hour,
                        reading.sunset_minute,
                    );
                    let sunrise = resolve_named_time_today(
                        &self.clock,
                        reading.sunrise_hour,
                        reading.sunrise_minute,
                    );
                    self.astronomy.commit(sunrise, sunset);

                    info!(
                        sunrise = %format_iso(&self.clock, sunrise),
                        sunset = %format_iso(&self.clock, sunset),
                        "astronomy data retrieved"
                    );
                    return Ok(true);
                }
                Err(err) => {
                    if !self.retry.allows_retry_after(attempts) {
                        return Err(AstronomyError::RetriesExhausted {
                            attempts,
                            last: Box::new(err),
                        });
                    }
                    warn!(
                        "failed to retrieve astronomy data ({err}); retrying in {:?}",
                        self.retry.interval
                    );
                    self.host.delay(self.retry.interval);
                }
            }
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let now = self.clock.now();
        SchedulerStatus {
            configured: self.configuration.is_some(),
            configuration: self.configuration.clone(),
            scheduler_enabled: self.is_enabled(),
            should_be_toggled: self.should_be_toggled(),
            using_astronomy_data: self.astronomy.is_using_astronomy_data(),
            sunrise_epoch: self.astronomy.sunrise(),
            sunset_epoch: self.astronomy.sunset(),
            home_count: self.occupancy.count(),
            home_ids: self.occupancy.ids().map(str::to_string).collect(),
            tasks: self
                .tasks
                .iter()
                .map(|task| TaskView {
                    start: task.start().to_string(),
                    end: task.end().to_string(),
                })
                .collect(),
            is_dst: self.clock.is_daylight_saving(now),
            now_epoch: now,
            local_time: format_iso(&self.clock, now),
            last_time_sync_ms: self.last_time_sync_ms,
        }
    }

    fn configuration_mut(&mut self) -> &mut SchedulerConfiguration {
        self.configuration.get_or_insert_with(SchedulerConfiguration::default)
    }

    fn align_to_minute(&mut self) {
        let poll = Duration::from_millis(self.config.alignment_poll_ms);
        loop {
            let second = local_second(&self.clock, self.clock.now());
            if second == 0 {
                break;
            }
            debug!(second, "aligning to minute boundary");
            self.host.network_maintenance();
            self.host.delay(poll);
        }
    }

    fn sync_time(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.last_time_sync_ms) > self.config.time_sync_interval_ms {
            info!(at = %format_iso(&self.clock, self.clock.now()), "syncing time");
            self.clock.sync_from_network();
            self.last_time_sync_ms = now_ms;
        }
    }

    fn check_scheduler_tasks(&mut self) {
        let now = self.clock.now();
        let current = split_timestamp(now);
        debug!(at = %format_iso(&self.clock, now), "checking scheduled tasks");

        let Self {
            clock,
            astronomy,
            tasks,
            ..
        } = self;

        for task in tasks.iter_mut() {
            for event in [EventKind::Start, EventKind::End] {
                let Some(target) = resolve_symbol(&*clock, &task.symbol(event), astronomy) else {
                    continue;
                };
                if split_timestamp(target) == current {
                    info!(event = event.as_str(), symbol = %task.symbol(event), "task edge reached");
                    task.fire(event);
                }
            }
        }
    }
}
