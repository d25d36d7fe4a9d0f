use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

pub const LEVEL_DIRECTORY_KEY: &str = "levelDirectory";
pub const MIXER_SEED_KEY: &str = "mixerSeed";

/// Engine-supplied configuration. Reserved keys configure the bridge; every
/// other key is handed to the level's `init`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub level_directory: Option<PathBuf>,
    pub mixer_seed: u32,
    #[serde(flatten)]
    pub level: BTreeMap<String, String>,
}

impl Settings {
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            LEVEL_DIRECTORY_KEY => self.level_directory = Some(PathBuf::from(value)),
            MIXER_SEED_KEY => {
                self.mixer_seed = value.parse().map_err(|err| BridgeError::InvalidSetting {
                    key: key.to_string(),
                    value: value.to_string(),
                    reason: format!("{err}"),
                })?
            }
            _ => {
                if self.level.insert(key.to_string(), value.to_string()).is_some() {
                    log::warn!("setting {key} given more than once; keeping {value}");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_keys_configure_the_bridge() {
        let mut settings = Settings::default();
        settings.apply("levelDirectory", "/levels").expect("dir");
        settings.apply("mixerSeed", "42").expect("seed");
        settings.apply("episodeLengthSeconds", "60").expect("level key");
        assert_eq!(settings.level_directory, Some(PathBuf::from("/levels")));
        assert_eq!(settings.mixer_seed, 42);
        assert_eq!(
            settings.level.get("episodeLengthSeconds").map(String::as_str),
            Some("60")
        );
        assert!(!settings.level.contains_key("mixerSeed"));
    }

    #[test]
    fn bad_mixer_seed_is_rejected() {
        let mut settings = Settings::default();
        let err = settings.apply("mixerSeed", "-1").expect_err("negative");
        assert!(matches!(err, BridgeError::InvalidSetting { ref key, .. } if key == "mixerSeed"));
        assert_eq!(settings.mixer_seed, 0);
    }
}
