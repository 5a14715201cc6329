pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

pub fn humidity_topic(room: &str) -> String {
    format!("sensors/{room}/humidity")
}

pub fn temperature_topic(room: &str) -> String {
    format!("sensors/{room}/temperature")
}

pub fn status_topic(host_name: &str) -> String {
    format!("device/{host_name}/status")
}
