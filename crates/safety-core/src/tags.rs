#[derive(Debug, Clone, Copy)]
pub struct Tag {
    /// Control-table register name on the servo bus.
    pub key: &'static str,
    /// Prometheus metric name for the per-motor gauge.
    pub metric: &'static str,
}

pub const PRESENT_TEMPERATURE: Tag = Tag {
    key: "Present_Temperature",
    metric: "armguard_motor_temperature_celsius",
};

pub const PRESENT_CURRENT: Tag = Tag {
    key: "Present_Current",
    metric: "armguard_motor_current_milliamps",
};

pub const PRESENT_POSITION: Tag = Tag {
    key: "Present_Position",
    metric: "armguard_motor_position",
};

pub const PRESENT_LOAD: Tag = Tag {
    key: "Present_Load",
    metric: "armguard_motor_load",
};

pub const PRESENT_VOLTAGE: Tag = Tag {
    key: "Present_Voltage",
    metric: "armguard_motor_voltage",
};

pub const GOAL_POSITION: Tag = Tag {
    key: "Goal_Position",
    metric: "armguard_motor_goal_position",
};

pub const GOAL_VELOCITY: Tag = Tag {
    key: "Goal_Velocity",
    metric: "armguard_motor_goal_velocity",
};

pub const TORQUE_LIMIT: Tag = Tag {
    key: "Torque_Limit",
    metric: "armguard_motor_torque_limit",
};

pub const SAFETY_STATUS: Tag = Tag {
    key: "safety_status",
    metric: "armguard_safety_status",
};

pub const POLL_FREQUENCY: Tag = Tag {
    key: "poll_frequency_hz",
    metric: "armguard_collision_poll_frequency_hz",
};
