use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Only keyboards whose name contains this are used. Any keyboard is used if not set.
    pub device_name: Option<String>,
    pub print_history_on_exit: bool,
}

impl Config {
    pub fn normalize(&mut self) {
        // an empty filter would match every name, which is the same as no filter
        if self.device_name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            self.device_name = None;
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_name: None,
            print_history_on_exit: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn fields_are_camel_case() {
        let config: Config = serde_json::from_str(r#"{"deviceName": "Corne", "printHistoryOnExit": false}"#).unwrap();
        assert_eq!(config.device_name.as_deref(), Some("Corne"));
        assert!(!config.print_history_on_exit);

        let json = serde_json::to_string(&Config::default()).unwrap();
        assert_eq!(json, r#"{"deviceName":null,"printHistoryOnExit":true}"#);
    }

    #[test]
    fn blank_device_name_means_any_device() {
        let mut config = Config { device_name: Some("  ".to_string()), print_history_on_exit: true };
        config.normalize();
        assert_eq!(config.device_name, None);
    }
}
