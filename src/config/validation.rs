use super::{ConfigError, ConfigResult, RegistryConfig};
use crate::route::HijackMode;
use crate::tree::cleaner::PressureCondition;

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &RegistryConfig) -> ConfigResult<()> {
        if config.node_root.is_empty() || config.node_root.contains('/') {
            return Err(ConfigError::InvalidValue {
                field: "node_root".to_string(),
                value: config.node_root.clone(),
                reason: "must be a single non-empty path component".to_string(),
            });
        }

        if config.intents.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "intents".to_string(),
            });
        }

        if config.holder.init_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "holder.init_timeout_secs".to_string(),
                value: "0".to_string(),
                reason: "initialization must be bounded by a non-zero timeout".to_string(),
            });
        }

        if config.holder.startup_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "holder.startup_concurrency".to_string(),
                value: "0".to_string(),
                reason: "at least one holder must be allowed to initialize".to_string(),
            });
        }

        Self::validate_hijack_modes(config)?;

        if config.cleaner.clean_enabled {
            PressureCondition::parse(&config.cleaner.pressure_condition).map_err(|error| {
                ConfigError::InvalidValue {
                    field: "cleaner.pressure_condition".to_string(),
                    value: config.cleaner.pressure_condition.clone(),
                    reason: error.to_string(),
                }
            })?;

            if config.cleaner.period_secs == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "cleaner.period_secs".to_string(),
                    value: "0".to_string(),
                    reason: "cleaner period must be non-zero".to_string(),
                });
            }
        }

        Ok(())
    }

    fn validate_hijack_modes(config: &RegistryConfig) -> ConfigResult<()> {
        let staged = config
            .hijack
            .staged
            .iter()
            .flat_map(|(application, by_ezone)| {
                by_ezone
                    .values()
                    .map(move |mode| (format!("hijack.staged.{}", application), mode))
            });
        let defaults = config
            .hijack
            .ezone_default
            .iter()
            .map(|(ezone, mode)| (format!("hijack.ezone_default.{}", ezone), mode));

        for (field, mode) in staged.chain(defaults) {
            mode.parse::<HijackMode>()
                .map_err(|error| ConfigError::InvalidValue {
                    field,
                    value: mode.clone(),
                    reason: error.to_string(),
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CleanerConfig, HolderConfig};
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        ConfigValidator::validate(&RegistryConfig::default()).unwrap();
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = RegistryConfig {
            holder: HolderConfig {
                init_timeout_secs: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_unknown_hijack_mode_rejected() {
        let mut ezone_default = HashMap::new();
        ezone_default.insert("alta1".to_string(), "sometimes".to_string());
        let mut config = RegistryConfig::default();
        config.hijack.ezone_default = ezone_default;
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_bad_pressure_condition_rejected_when_cleaning() {
        let config = RegistryConfig {
            cleaner: CleanerConfig {
                clean_enabled: true,
                pressure_condition: "disk > 90".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_empty_intents_rejected() {
        let config = RegistryConfig {
            intents: Vec::new(),
            ..Default::default()
        };
        assert!(ConfigValidator::validate(&config).is_err());
    }
}
