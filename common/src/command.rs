use tracing::warn;

use crate::{
    astronomy::Fetch,
    config::{SchedulerConfiguration, TaskConfig},
    schedule::{EdgeCallback, Task},
    scheduler::{Host, SchedulerEngine},
    time::Clock,
    topics::{
        TOPIC_CMD_ENABLED, TOPIC_CMD_HOME_ONLY, TOPIC_CMD_PRESENCE_AWAY, TOPIC_CMD_PRESENCE_HOME,
        TOPIC_CMD_PRESENCE_RESET,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Configure(SchedulerConfiguration),
    SetEnabled(bool),
    SetHomeOnly(bool),
    MarkPresent(String),
    MarkAway(String),
    ResetPresence,
    AddTask(TaskConfig),
}

impl ControlCommand {
    pub fn from_mqtt(topic: &str, payload: &str) -> Option<Self> {
        let payload = payload.trim();
        match topic {
            TOPIC_CMD_PRESENCE_HOME => device_id(payload).map(Self::MarkPresent),
            TOPIC_CMD_PRESENCE_AWAY => device_id(payload).map(Self::MarkAway),
            TOPIC_CMD_PRESENCE_RESET => Some(Self::ResetPresence),
            TOPIC_CMD_ENABLED => parse_flag(payload).map(Self::SetEnabled),
            TOPIC_CMD_HOME_ONLY => parse_flag(payload).map(Self::SetHomeOnly),
            _ => None,
        }
    }

    pub fn touches_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configure(_) | Self::SetEnabled(_) | Self::SetHomeOnly(_)
        )
    }

    pub fn apply<C, F, H>(
        self,
        engine: &mut SchedulerEngine<C, F, H>,
        on_edge: impl FnOnce() -> EdgeCallback,
    ) where
        C: Clock,
        F: Fetch,
        H: Host,
    {
        match self {
            Self::Configure(configuration) => engine.configure(configuration),
            Self::SetEnabled(enabled) => engine.set_is_enabled(enabled),
            Self::SetHomeOnly(enabled) => engine.set_home_only_mode_enabled(enabled),
            Self::MarkPresent(id) => engine.mark_present(&id),
            Self::MarkAway(id) => engine.mark_away(&id),
            Self::ResetPresence => engine.reset_presence(),
            Self::AddTask(task) => {
                if let Err(err) = task.validate() {
                    warn!("rejecting task: {err}");
                    return;
                }
                engine.add_task(Task::new(&task.start, &task.end, on_edge()));
            }
        }
    }
}

pub fn parse_flag(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Some(true),
        "off" | "false" | "0" => Some(false),
        _ => None,
    }
}

fn device_id(payload: &str) -> Option<String> {
    (!payload.is_empty()).then(|| payload.to_string())
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::{
        config::EngineConfig,
        schedule::EventKind,
        test_support::{epoch, FakeClock, FakeFetch, FakeHost},
    };

    fn noop() -> EdgeCallback {
        Box::new(|_: EventKind| {})
    }

    #[test]
    fn decodes_mqtt_topics() {
        assert_eq!(
            ControlCommand::from_mqtt(TOPIC_CMD_PRESENCE_HOME, " phone-a\n"),
            Some(ControlCommand::MarkPresent("phone-a".to_string()))
        );
        assert_eq!(
            ControlCommand::from_mqtt(TOPIC_CMD_PRESENCE_AWAY, "phone-a"),
            Some(ControlCommand::MarkAway("phone-a".to_string()))
        );
        assert_eq!(
            ControlCommand::from_mqtt(TOPIC_CMD_PRESENCE_RESET, ""),
            Some(ControlCommand::ResetPresence)
        );
        assert_eq!(
            ControlCommand::from_mqtt(TOPIC_CMD_ENABLED, "OFF"),
            Some(ControlCommand::SetEnabled(false))
        );
        assert_eq!(
            ControlCommand::from_mqtt(TOPIC_CMD_HOME_ONLY, "on"),
            Some(ControlCommand::SetHomeOnly(true))
        );
    }

    #[test]
    fn rejects_unreadable_payloads() {
        assert_eq!(ControlCommand::from_mqtt(TOPIC_CMD_PRESENCE_HOME, "  "), None);
        assert_eq!(ControlCommand::from_mqtt(TOPIC_CMD_ENABLED, "maybe"), None);
        assert_eq!(ControlCommand::from_mqtt("switch/cmnd/other", "on"), None);
    }

    #[test]
    fn add_task_wires_callback_and_validates() {
        let clock = FakeClock::at(epoch(2026, 7, 4, 12, 0, 0), 0);
        let mut engine = SchedulerEngine::new(
            EngineConfig::default(),
            clock.clone(),
            FakeFetch::new(),
            FakeHost::new(clock),
        );
        let events = Rc::new(RefCell::new(Vec::new()));

        let sink = events.clone();
        ControlCommand::AddTask(TaskConfig {
            start: "11:00".to_string(),
            end: "13:00".to_string(),
        })
        .apply(&mut engine, move || {
            Box::new(move |event: EventKind| sink.borrow_mut().push(event))
        });

        ControlCommand::AddTask(TaskConfig {
            start: "dawn".to_string(),
            end: "13:00".to_string(),
        })
        .apply(&mut engine, noop);

        assert_eq!(engine.task_count(), 1);

        ControlCommand::SetEnabled(true).apply(&mut engine, noop);
        ControlCommand::MarkPresent("phone".to_string()).apply(&mut engine, noop);

        assert_eq!(*events.borrow(), vec![EventKind::Start]);
        assert!(ControlCommand::SetEnabled(true).touches_configuration());
        assert!(!ControlCommand::ResetPresence.touches_configuration());
    }
}
