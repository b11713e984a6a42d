use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

/// The `log` section: where records go and from which level on.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Log {
    pub to: To,
    pub level: Level,
    pub dir: String,
    pub file: String,
}

impl Default for Log {
    fn default() -> Self {
        Self { to: To::Console, level: Level(slog::Level::Info), dir: "/var/log/rjms".into(), file: "rjms.log".into() }
    }
}

impl Log {
    /// Full path of the log file, empty when no file is configured.
    pub fn filename(&self) -> String {
        match (self.dir.trim_end_matches(['/', '\\']), self.file.as_str()) {
            (_, "") => String::new(),
            ("", file) => file.to_owned(),
            (dir, file) => format!("{dir}/{file}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl<'de> Deserialize<'de> for To {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match String::deserialize(deserializer)?.to_ascii_lowercase().as_str() {
            "off" => Ok(To::Off),
            "file" => Ok(To::File),
            "console" => Ok(To::Console),
            "both" => Ok(To::Both),
            other => Err(de::Error::custom(format!("invalid log target {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Level(slog::Level);

impl Level {
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.0
    }
}

impl From<slog::Level> for Level {
    #[inline]
    fn from(level: slog::Level) -> Self {
        Level(level)
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = String::deserialize(deserializer)?;
        slog::Level::from_str(&level).map(Level).map_err(|_| de::Error::custom(format!("invalid log level {level:?}")))
    }
}
