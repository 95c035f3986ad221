use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::ConfigError;
use super::sync::SyncThresholds;

/// Settings for the resident compatibility checker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompatConfig {
    pub pipeline_folder: PathBuf,
    /// External checker executable; the built-in validator is used when absent
    pub checker_path: Option<PathBuf>,
    pub interval_secs: u64,
}

impl Default for CompatConfig {
    fn default() -> Self {
        Self {
            pipeline_folder: PathBuf::from("None"),
            checker_path: None,
            interval_secs: 60,
        }
    }
}

/// Settings for archive verification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArchiveConfig {
    pub search_dirs: Vec<PathBuf>,
    /// `7z` executable used to list and extract rar/7z archives
    pub archiver_path: PathBuf,
    pub temp_dir: PathBuf,
    pub list_path: PathBuf,
    pub interval_secs: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            search_dirs: Vec::new(),
            archiver_path: PathBuf::from("7z"),
            temp_dir: PathBuf::from("./tmp_dir"),
            list_path: PathBuf::from("matching_folders.txt"),
            interval_secs: 60,
        }
    }
}

/// Settings for the resident conversion controller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConverterConfig {
    /// Folder watched for session folders
    pub input_folder: PathBuf,
    /// Folder the exporter writes EDF files into
    pub output_folder: PathBuf,
    /// Handled session folders are moved below this folder
    pub archive_folder: PathBuf,
    pub exporter_path: PathBuf,
    pub template_path: PathBuf,
    pub processed_list: PathBuf,
    pub interval_secs: u64,
    /// Minimum output growth while exporting, in MiB per minute
    pub stall_mb_per_min: f64,
    pub monitor_interval_secs: f64,
    /// How long growth may stay below the minimum before the export is killed
    pub stall_window_secs: f64,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            input_folder: PathBuf::from("None"),
            output_folder: PathBuf::from("None"),
            archive_folder: PathBuf::from("None"),
            exporter_path: PathBuf::from("None"),
            template_path: PathBuf::from("None"),
            processed_list: PathBuf::from("processed_list.txt"),
            interval_secs: 10,
            stall_mb_per_min: 10.0,
            monitor_interval_secs: 15.0,
            stall_window_secs: 60.0,
        }
    }
}

impl ConverterConfig {
    /// Check that the folders and executables exist
    pub fn validate(&self) -> Result<(), ConfigError> {
        for path in [
            &self.input_folder,
            &self.output_folder,
            &self.exporter_path,
            &self.template_path,
        ] {
            if !path.exists() {
                return Err(ConfigError::BadFilePath(path.clone()));
            }
        }
        if self.monitor_interval_secs <= 0.0 {
            return Err(ConfigError::MissingSetting("converter.monitor_interval_secs"));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs_f64(self.monitor_interval_secs.max(0.001))
    }

    pub fn stall_window(&self) -> Duration {
        Duration::from_secs_f64(self.stall_window_secs.max(0.0))
    }

    /// Bytes the output has to grow by between two checks
    pub fn min_growth_per_check(&self) -> u64 {
        (self.stall_mb_per_min * 1024.0 * 1024.0 / 60.0 * self.monitor_interval_secs) as u64
    }
}

/// Settings for the server sync
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub copy_after_hours: i64,
    pub ignore_after_years: i64,
    /// Where conflict sheets and table exports are written
    pub report_dir: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            copy_after_hours: 36,
            ignore_after_years: 4,
            report_dir: PathBuf::from("."),
        }
    }
}

impl SyncConfig {
    pub fn thresholds(&self) -> SyncThresholds {
        SyncThresholds {
            copy_after: time::Duration::hours(self.copy_after_hours),
            ignore_after: time::Duration::days(self.ignore_after_years * 365),
        }
    }
}

/// Settings of the resident tools and the external executables they drive.
/// Configs are serializable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub compat: CompatConfig,
    pub archive: ArchiveConfig,
    pub converter: ConverterConfig,
    pub sync: SyncConfig,
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write this configuration as YAML, e.g. to produce a template
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        std::fs::write(config_path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_round() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        assert!(matches!(
            Config::read_config_file(&path),
            Err(ConfigError::BadFilePath(_))
        ));

        Config::default().write_config_file(&path).unwrap();
        assert_eq!(Config::read_config_file(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_partial_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "converter:\n  input_folder: /data/in\n  stall_mb_per_min: 6\nsync:\n  copy_after_hours: 12\n",
        )
        .unwrap();
        let config = Config::read_config_file(&path).unwrap();
        assert_eq!(config.converter.input_folder, PathBuf::from("/data/in"));
        assert_eq!(config.converter.interval_secs, 10);
        assert_eq!(config.converter.min_growth_per_check(), 1_572_864);
        assert_eq!(config.sync.thresholds().copy_after, time::Duration::hours(12));
        assert_eq!(config.archive, ArchiveConfig::default());
        assert!(config.converter.validate().is_err());
    }
}
