pub const TOPIC_SENSOR_TEMP: &str = "heater/sensor/temperature";
pub const TOPIC_SENSOR_STATUS: &str = "heater/sensor/status";

pub const TOPIC_ACTUATOR_STATE: &str = "heater/actuator/state";
pub const TOPIC_CMD_ACTUATOR: &str = "heater/cmnd/actuator/power";

pub const TOPIC_CONTROLLER_STATE: &str = "heater/controller/state";
pub const TOPIC_CONTROLLER_DECISION: &str = "heater/controller/decision";
pub const TOPIC_CONTROLLER_ALERT: &str = "heater/controller/alert";
