use serde::{Deserialize, Serialize};

pub const MAX_SSID_LEN: usize = 32;
pub const MAX_SECRET_LEN: usize = 64;
pub const MAX_HOST_LEN: usize = 64;
pub const MAX_TOPIC_LEN: usize = 64;
pub const MAX_USER_LEN: usize = 32;

pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Persisted node identity and telemetry endpoint. Loaded once at boot;
/// rewritten only by the save-and-reboot path of the control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_topic: String,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: String::new(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_topic: String::new(),
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

impl DeviceConfig {
    /// A non-empty SSID means the managed link should be attempted first.
    pub fn has_identity(&self) -> bool {
        !self.wifi_ssid.is_empty()
    }

    /// An empty broker host disables the telemetry link entirely.
    pub fn telemetry_enabled(&self) -> bool {
        !self.mqtt_host.is_empty()
    }

    pub fn sanitize(&mut self) {
        truncate_to(&mut self.wifi_ssid, MAX_SSID_LEN);
        truncate_to(&mut self.wifi_pass, MAX_SECRET_LEN);
        truncate_to(&mut self.mqtt_host, MAX_HOST_LEN);
        truncate_to(&mut self.mqtt_topic, MAX_TOPIC_LEN);
        truncate_to(&mut self.mqtt_user, MAX_USER_LEN);
        truncate_to(&mut self.mqtt_pass, MAX_SECRET_LEN);
        if self.mqtt_port == 0 {
            self.mqtt_port = DEFAULT_MQTT_PORT;
        }
    }

    /// Applies `POST /save` form fields. Any present field overwrites the
    /// corresponding value verbatim (up to its bound); absent fields keep
    /// their current value. An unparsable port falls back to the default.
    pub fn apply_form_fields<'a, I>(&mut self, fields: I)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (key, value) in fields {
            match key {
                "ssid" => self.wifi_ssid = value.to_string(),
                "pass" => self.wifi_pass = value.to_string(),
                "ms" => self.mqtt_host = value.to_string(),
                "mp" => self.mqtt_port = value.parse().unwrap_or(DEFAULT_MQTT_PORT),
                "mt" => self.mqtt_topic = value.to_string(),
                "mu" => self.mqtt_user = value.to_string(),
                "mw" => self.mqtt_pass = value.to_string(),
                _ => {}
            }
        }
        self.sanitize();
    }
}

fn truncate_to(value: &mut String, max_len: usize) {
    if value.len() <= max_len {
        return;
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value.truncate(end);
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn default_config_disables_both_links() {
        let config = DeviceConfig::default();
        assert!(!config.has_identity());
        assert!(!config.telemetry_enabled());
        assert_eq!(config.mqtt_port, DEFAULT_MQTT_PORT);
    }

    #[test]
    fn sanitize_enforces_field_bounds() {
        let mut config = DeviceConfig {
            wifi_ssid: "s".repeat(40),
            mqtt_host: "h".repeat(100),
            mqtt_port: 0,
            ..DeviceConfig::default()
        };
        config.sanitize();

        assert_eq!(config.wifi_ssid.len(), MAX_SSID_LEN);
        assert_eq!(config.mqtt_host.len(), MAX_HOST_LEN);
        assert_eq!(config.mqtt_port, DEFAULT_MQTT_PORT);
    }

    #[test]
    fn sanitize_respects_char_boundaries() {
        let mut config = DeviceConfig {
            wifi_ssid: "é".repeat(20),
            ..DeviceConfig::default()
        };
        config.sanitize();

        assert!(config.wifi_ssid.len() <= MAX_SSID_LEN);
        assert!(config.wifi_ssid.is_char_boundary(config.wifi_ssid.len()));
    }

    #[test]
    fn form_fields_overwrite_only_present_keys() {
        let mut config = DeviceConfig {
            wifi_ssid: "old-net".to_string(),
            wifi_pass: "old-pass".to_string(),
            mqtt_host: "broker.local".to_string(),
            ..DeviceConfig::default()
        };

        config.apply_form_fields([("ssid", "new-net"), ("mp", "8883"), ("mt", "nodes/a")]);

        assert_eq!(config.wifi_ssid, "new-net");
        assert_eq!(config.wifi_pass, "old-pass");
        assert_eq!(config.mqtt_host, "broker.local");
        assert_eq!(config.mqtt_port, 8883);
        assert_eq!(config.mqtt_topic, "nodes/a");
    }

    #[test]
    fn unparsable_port_falls_back_to_default() {
        let mut config = DeviceConfig {
            mqtt_port: 8883,
            ..DeviceConfig::default()
        };
        config.apply_form_fields([("mp", "not-a-port")]);

        assert_eq!(config.mqtt_port, DEFAULT_MQTT_PORT);
    }

    #[test]
    fn store_round_trip_preserves_fields() {
        let mut config = DeviceConfig {
            wifi_ssid: "lab".to_string(),
            wifi_pass: "hunter2".to_string(),
            mqtt_host: "10.0.0.7".to_string(),
            mqtt_port: 8883,
            mqtt_topic: "spilink/tx".to_string(),
            mqtt_user: "node".to_string(),
            mqtt_pass: "secret".to_string(),
        };
        config.sanitize();

        let raw = serde_json::to_string(&config).unwrap();
        let reloaded: DeviceConfig = serde_json::from_str(&raw).unwrap();

        assert_eq!(reloaded, config);
    }
}
