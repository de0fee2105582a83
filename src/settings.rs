use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

pub const GLOBAL_CONFIG_PATH: &str = "/etc/craftctl.toml";
pub const USER_CONFIG_SUFFIX: &str = ".config/craftctl.toml";
pub const CONFIG_ENV: &str = "CRAFTCTL_CONFIG";

const DEFAULT_SERVICE_USER: &str = "mcserver";
const DEFAULT_UNIT_PREFIX: &str = "mcserver@";
const DEFAULT_ENV_FILE: &str = "jvm-env";
const DEFAULT_EDITOR: &str = "/usr/bin/vi";
const DEFAULT_SHELL: &str = "/bin/bash";
const DEFAULT_JAVA: &str = "/bin/java";

/// Process-wide configuration, parsed once at startup and passed by
/// reference to everything that needs it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub system: SystemSettings,
    #[serde(default)]
    pub tools: ToolSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    /// Account that owns instance data and runs the server units.
    #[serde(default = "default_service_user")]
    pub server_user: String,
    /// Instantiated systemd template, e.g. `mcserver@<instance>`.
    #[serde(default = "default_unit_prefix")]
    pub unit_prefix: String,
    /// Filename of the per-instance environment override file.
    #[serde(default = "default_env_file")]
    pub env_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    #[serde(default = "default_editor")]
    pub editor: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_java")]
    pub java: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            system: SystemSettings::default(),
            tools: ToolSettings::default(),
        }
    }
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            server_user: default_service_user(),
            unit_prefix: default_unit_prefix(),
            env_file: default_env_file(),
        }
    }
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            editor: default_editor(),
            shell: default_shell(),
            java: default_java(),
        }
    }
}

fn default_service_user() -> String {
    DEFAULT_SERVICE_USER.to_string()
}

fn default_unit_prefix() -> String {
    DEFAULT_UNIT_PREFIX.to_string()
}

fn default_env_file() -> String {
    DEFAULT_ENV_FILE.to_string()
}

fn default_editor() -> String {
    env::var("EDITOR").unwrap_or_else(|_| DEFAULT_EDITOR.to_string())
}

fn default_shell() -> String {
    DEFAULT_SHELL.to_string()
}

fn default_java() -> String {
    DEFAULT_JAVA.to_string()
}

/// Load the global settings file, then overlay the invoking user's override.
/// A missing global file is seeded with defaults when we have permission to
/// do so; failure to seed is not an error. `CRAFTCTL_CONFIG` points the
/// global file somewhere else, mainly for tests.
pub fn load() -> Settings {
    let global = env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(GLOBAL_CONFIG_PATH));
    load_from(&global, user_config_path().as_deref())
}

pub fn load_from(global_path: &Path, user_path: Option<&Path>) -> Settings {
    let mut settings = if global_path.exists() {
        read_settings_file(global_path).unwrap_or_default()
    } else {
        let defaults = Settings::default();
        seed_config_file(global_path, &defaults);
        defaults
    };

    if let Some(user_path) = user_path {
        if let Some(user_settings) = read_settings_file(user_path) {
            // Only the tool preferences may be overridden per user; the
            // system section stays authoritative from the global file.
            settings.tools = user_settings.tools;
        }
    }

    settings
}

fn read_settings_file(path: &Path) -> Option<Settings> {
    let raw = fs::read_to_string(path).ok()?;
    match toml::from_str::<Settings>(&raw) {
        Ok(settings) => Some(settings),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring unparsable settings file");
            None
        }
    }
}

fn seed_config_file(path: &Path, settings: &Settings) {
    let contents = match toml::to_string_pretty(settings) {
        Ok(contents) => contents,
        Err(_) => return,
    };
    if let Err(err) = fs::write(path, contents) {
        tracing::debug!(path = %path.display(), error = %err, "unable to seed settings file");
    } else {
        tracing::info!(path = %path.display(), "created settings file");
    }
}

fn user_config_path() -> Option<PathBuf> {
    // SUDO_USER points back at the invoking login user after elevation,
    // so their editor/shell preferences survive the re-exec.
    let home = match env::var("SUDO_USER") {
        Ok(login) => crate::privileges::lookup_user(&login).ok().map(|u| u.home),
        Err(_) => env::var("HOME").ok().map(PathBuf::from),
    }?;
    Some(home.join(USER_CONFIG_SUFFIX))
}
