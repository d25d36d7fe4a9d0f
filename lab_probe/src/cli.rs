use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    about = "Hosts a level script against a recording engine and summarises what it does",
    version
)]
pub struct Args {
    /// Level name (resolved in the level directory) or path to a .lua file
    #[arg(long)]
    pub level: String,

    /// Directory searched for <level>.lua
    #[arg(long)]
    pub level_directory: Option<PathBuf>,

    /// Extra level setting as key=value (repeatable)
    #[arg(long = "setting", value_parser = parse_setting)]
    pub settings: Vec<(String, String)>,

    /// JSON file with settings, applied before --setting values
    #[arg(long)]
    pub settings_json: Option<PathBuf>,

    /// Number of episodes to run
    #[arg(long, default_value_t = 1)]
    pub episodes: u32,

    /// Frames per episode
    #[arg(long, default_value_t = 10)]
    pub frames: u32,

    /// Seed of the first episode; later episodes use seed + episode
    #[arg(long, default_value_t = 0)]
    pub seed: i32,

    /// Path to write the run summary as JSON
    #[arg(long)]
    pub summary_json: Option<PathBuf>,

    /// Log bridge lifecycle at debug level
    #[arg(long)]
    pub verbose: bool,
}

impl Args {
    pub fn validate(&self) -> Result<()> {
        if self.level.is_empty() {
            bail!("--level must not be empty");
        }
        if self.episodes == 0 {
            bail!("--episodes must be at least 1");
        }
        Ok(())
    }
}

fn parse_setting(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_parse_as_pairs() {
        let args = Args::try_parse_from([
            "lab_probe",
            "--level",
            "demo",
            "--setting",
            "reward=2",
            "--setting",
            "name=a=b",
        ])
        .expect("args");
        assert_eq!(
            args.settings,
            vec![
                ("reward".to_string(), "2".to_string()),
                ("name".to_string(), "a=b".to_string())
            ]
        );
        assert_eq!(args.frames, 10);
        args.validate().expect("valid");
    }

    #[test]
    fn malformed_setting_is_rejected() {
        assert!(Args::try_parse_from(["lab_probe", "--level", "demo", "--setting", "=1"]).is_err());
    }
}
