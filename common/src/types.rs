use serde::{Deserialize, Serialize};

use crate::{config::SchedulerConfiguration, schedule::EventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SwitchState {
    On,
    Off,
}

impl SwitchState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }
}

impl From<EventKind> for SwitchState {
    fn from(event: EventKind) -> Self {
        match event {
            EventKind::Start => Self::On,
            EventKind::End => Self::Off,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    pub configured: bool,
    pub configuration: Option<SchedulerConfiguration>,
    #[serde(rename = "schedulerEnabled")]
    pub scheduler_enabled: bool,
    #[serde(rename = "shouldBeToggled")]
    pub should_be_toggled: bool,
    #[serde(rename = "usingAstronomyData")]
    pub using_astronomy_data: bool,
    #[serde(rename = "sunriseEpoch")]
    pub sunrise_epoch: Option<i64>,
    #[serde(rename = "sunsetEpoch")]
    pub sunset_epoch: Option<i64>,
    #[serde(rename = "homeCount")]
    pub home_count: usize,
    #[serde(rename = "homeIds")]
    pub home_ids: Vec<String>,
    pub tasks: Vec<TaskView>,
    #[serde(rename = "isDst")]
    pub is_dst: bool,
    #[serde(rename = "nowEpoch")]
    pub now_epoch: i64,
    #[serde(rename = "localTime")]
    pub local_time: String,
    #[serde(rename = "lastTimeSyncMs")]
    pub last_time_sync_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_state_follows_event() {
        assert_eq!(SwitchState::from(EventKind::Start), SwitchState::On);
        assert_eq!(SwitchState::from(EventKind::End).as_str(), "OFF");
    }

    #[test]
    fn status_serializes_camel_case_keys() {
        let status = SchedulerStatus {
            home_count: 2,
            ..SchedulerStatus::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["homeCount"], 2);
        assert!(value["sunsetEpoch"].is_null());
        assert_eq!(value["schedulerEnabled"], false);
    }
}
