// SPDX-License-Identifier: AGPL-3.0-or-later

//! Data structures and helper methods around influencing the configuration
//! of the application.

use ini::Ini;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppConfig {
    pub port: Option<u16>,
    pub socket: Option<PathBuf>,
    pub file: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_config_file(config_file: &Path) -> Option<Self> {
        if config_file.exists() {
            let conf = Ini::load_from_file(config_file)
                .expect("Could not access config file, even though it exists");
            let general_section = conf.general_section();
            Some(Self {
                port: general_section.get("port").map(|p| {
                    p.parse()
                        .expect("Failed to parse config parameter `port` as a port number")
                }),
                socket: general_section.get("socket").map(PathBuf::from),
                file: general_section.get("file").map(PathBuf::from),
            })
        } else {
            None
        }
    }

    /// Values in `self` (the command line) win over values from the file.
    #[must_use]
    pub fn merge(self, other: Option<Self>) -> Self {
        let Some(other) = other else {
            return self;
        };
        Self {
            port: self.port.or(other.port),
            socket: self.socket.or(other.socket),
            file: self.file.or(other.file),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use temp_dir::TempDir;

    #[test]
    fn missing_file_yields_nothing() {
        assert_eq!(AppConfig::from_config_file(Path::new("/nonexistent")), None);
    }

    #[test]
    fn file_values_fill_unset_flags() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let config_file = dir.path().join("config");
        std::fs::write(&config_file, "port=5000\nfile=doc.txt\n").unwrap();

        let cli = AppConfig {
            port: Some(6000),
            socket: None,
            file: None,
        };
        let merged = cli.merge(AppConfig::from_config_file(&config_file));
        assert_eq!(merged.port, Some(6000));
        assert_eq!(merged.file, Some(PathBuf::from("doc.txt")));
        assert_eq!(merged.socket, None);
    }
}
