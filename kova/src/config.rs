//! Process settings.
//!
//! Sources, later ones winning:
//!
//! 1. Serde defaults
//! 2. `kova.toml`, or the file named by `KOVA_CONFIG`
//! 3. `KOVA_` environment variables, `__` separating nested keys
//!    (`KOVA_MAILER__POOL_SIZE=4`)
//! 4. The legacy variables `SMTP_SERVER`, `SMTP_USERNAME`, `SMTP_PASSWORD`,
//!    `SMTP_PORTS`, `PERSONAL_EMAIL` and `INPUT_EMAIL`
//!
//! ```toml
//! personal_email = "me@example.com"
//!
//! [mailer]
//! host = "smtp.example.com"
//! username = "reports@example.com"
//! ports = "465,587"
//! pool_size = 2
//!
//! [paths]
//! data_dir = "/var/lib/kova"
//! ```

use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use kova_delivery::MailerConfig;
use serde::Deserialize;

/// Used when `KOVA_CONFIG` is not set.
pub const DEFAULT_CONFIG_FILE: &str = "kova.toml";

/// Legacy variable name and the settings key it feeds.
const LEGACY_KEYS: [(&str, &str); 6] = [
    ("SMTP_SERVER", "mailer.host"),
    ("SMTP_USERNAME", "mailer.username"),
    ("SMTP_PASSWORD", "mailer.password"),
    ("SMTP_PORTS", "mailer.ports"),
    ("PERSONAL_EMAIL", "personal_email"),
    ("INPUT_EMAIL", "input_email"),
];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub mailer: MailerConfig,

    /// Default recipient of bulk jobs
    #[serde(default)]
    pub personal_email: Option<String>,

    /// Default recipient of input jobs
    #[serde(default)]
    pub input_email: Option<String>,

    #[serde(default)]
    pub paths: Paths,
}

impl Settings {
    /// Load settings from the process environment.
    pub fn load() -> anyhow::Result<Self> {
        let file = std::env::var_os("KOVA_CONFIG")
            .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from);
        let legacy = LEGACY_KEYS
            .iter()
            .filter_map(|(var, key)| std::env::var(var).ok().map(|value| (*key, value)));

        Ok(Self::figment(&file, legacy).extract()?)
    }

    /// Layer the configuration sources.
    ///
    /// `legacy` holds `(settings key, value)` pairs. They are merged as plain
    /// strings so a numeric password stays a string.
    pub fn figment<'a>(
        file: &Path,
        legacy: impl IntoIterator<Item = (&'a str, String)>,
    ) -> Figment {
        let mut figment = Figment::new()
            .merge(Toml::file(file))
            .merge(Env::prefixed("KOVA_").split("__").ignore(&["config"]));

        for (key, value) in legacy {
            figment = figment.merge(Serialized::default(key, value));
        }
        figment
    }

    /// Create the data directory layout and the archive directory.
    pub fn bootstrap(&self) -> std::io::Result<()> {
        self.paths.create()?;
        std::fs::create_dir_all(&self.mailer.temp_dir)
    }
}

/// Data directory layout.
#[derive(Debug, Clone, Deserialize)]
pub struct Paths {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Paths {
    #[must_use]
    pub fn input(&self) -> PathBuf {
        self.data_dir.join("input")
    }

    #[must_use]
    pub fn output(&self) -> PathBuf {
        self.data_dir.join("output")
    }

    #[must_use]
    pub fn groups(&self) -> PathBuf {
        self.data_dir.join("groups")
    }

    #[must_use]
    pub fn logs(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    #[must_use]
    pub fn temp(&self) -> PathBuf {
        self.data_dir.join("temp")
    }

    pub fn create(&self) -> std::io::Result<()> {
        for dir in [
            self.input(),
            self.output(),
            self.groups(),
            self.logs(),
            self.temp(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
