pub const TOPIC_SWITCH_STATE: &str = "switch/controller/state";
pub const TOPIC_SCHEDULER_STATE: &str = "switch/controller/scheduler/state";

pub const TOPIC_CMD_PRESENCE_HOME: &str = "switch/cmnd/presence/home";
pub const TOPIC_CMD_PRESENCE_AWAY: &str = "switch/cmnd/presence/away";
pub const TOPIC_CMD_PRESENCE_RESET: &str = "switch/cmnd/presence/reset";
pub const TOPIC_CMD_ENABLED: &str = "switch/cmnd/enabled";
pub const TOPIC_CMD_HOME_ONLY: &str = "switch/cmnd/homeonly";

pub const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
