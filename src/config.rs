use crate::env_file::{self, EnvFileError, EnvMap};
use crate::sys::{self, Signal};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Keys and defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_CONFIG_FILE: &str = ".env";

pub const KEY_PORT: &str = "PORT";
pub const KEY_COMMAND: &str = "BOTCTL_COMMAND";
pub const KEY_PATTERNS: &str = "BOTCTL_PATTERNS";
pub const KEY_CWD: &str = "BOTCTL_CWD";
pub const KEY_LOG: &str = "BOTCTL_LOG";
pub const KEY_GRACE_SECS: &str = "BOTCTL_GRACE_SECS";
pub const KEY_STOP_SIGNAL: &str = "BOTCTL_STOP_SIGNAL";
pub const KEY_STARTUP_CHECK_MS: &str = "BOTCTL_STARTUP_CHECK_MS";
pub const KEY_REQUIRE: &str = "BOTCTL_REQUIRE";

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_COMMAND: &str = "python3 -m mattermost_bot";
pub const DEFAULT_PATTERNS: &[&str] = &["mattermost_bot"];
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_STOP_SIGNAL: &str = "SIGTERM";
pub const DEFAULT_STARTUP_CHECK: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found: {path}")]
    Missing { path: String },
    #[error("failed to read configuration '{path}': {reason}")]
    Read { path: String, reason: String },
    #[error("invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("required setting {key} is missing or empty")]
    MissingKey { key: String },
}

impl From<EnvFileError> for ConfigError {
    fn from(e: EnvFileError) -> Self {
        match e {
            EnvFileError::NotFound { path } => ConfigError::Missing { path },
            EnvFileError::ReadError { path, source } => ConfigError::Read {
                path,
                reason: source.to_string(),
            },
        }
    }
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Everything needed to launch the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSpec {
    pub command: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub log: Option<PathBuf>,
    /// File variables not already present in the process environment.
    pub env: EnvMap,
    pub startup_check: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub port: u16,
    pub patterns: Vec<String>,
    pub grace: Duration,
    pub stop_signal: Signal,
    pub worker: WorkerSpec,
    /// The file the settings came from, `None` when built-in defaults were used.
    pub source: Option<PathBuf>,
}

impl Settings {
    /// Where these settings came from, for log output.
    pub fn describe_source(&self) -> String {
        match &self.source {
            Some(path) => format!("configuration from {}", path.display()),
            None => "built-in default configuration".to_string(),
        }
    }
}

pub fn parse_command(command: &str) -> Result<(String, Vec<String>), ConfigError> {
    let words = shell_words::split(command)
        .map_err(|e| invalid(KEY_COMMAND, command, format!("failed to parse: {e}")))?;

    let Some((program, args)) = words.split_first() else {
        return Err(invalid(KEY_COMMAND, command, "command is empty"));
    };
    Ok((program.clone(), args.to_vec()))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let path = Path::new(raw);
    match base_dir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    }
}

/// Build `Settings` from parsed file variables. `env` looks up the process
/// environment, which takes precedence over the file.
pub fn resolve<F>(file: &EnvMap, base_dir: Option<&Path>, env: F) -> Result<Settings, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| env(key).or_else(|| file.get(key).cloned());
    // Set but blank counts as unset
    let get_set = |key: &str| get(key).filter(|v| !v.trim().is_empty());

    let port = match get_set(KEY_PORT) {
        None => DEFAULT_PORT,
        Some(raw) => match raw.trim().parse::<u16>() {
            Ok(0) => return Err(invalid(KEY_PORT, &raw, "port must be non-zero")),
            Ok(p) => p,
            Err(e) => return Err(invalid(KEY_PORT, &raw, e.to_string())),
        },
    };

    let patterns = match get(KEY_PATTERNS) {
        None => DEFAULT_PATTERNS.iter().map(|s| s.to_string()).collect(),
        Some(raw) => {
            let list = split_list(&raw);
            if list.is_empty() {
                return Err(invalid(KEY_PATTERNS, &raw, "no patterns given"));
            }
            list
        }
    };

    let grace = match get_set(KEY_GRACE_SECS) {
        None => DEFAULT_GRACE,
        Some(raw) => {
            let secs: f64 = raw
                .trim()
                .parse()
                .map_err(|_| invalid(KEY_GRACE_SECS, &raw, "expected seconds"))?;
            Duration::try_from_secs_f64(secs)
                .map_err(|_| invalid(KEY_GRACE_SECS, &raw, "out of range"))?
        }
    };

    let signal_name =
        get_set(KEY_STOP_SIGNAL).unwrap_or_else(|| DEFAULT_STOP_SIGNAL.to_string());
    let stop_signal = sys::parse_signal(&signal_name)
        .map_err(|e| invalid(KEY_STOP_SIGNAL, &signal_name, e.to_string()))?;

    let startup_check = match get_set(KEY_STARTUP_CHECK_MS) {
        None => DEFAULT_STARTUP_CHECK,
        Some(raw) => Duration::from_millis(
            raw.trim()
                .parse()
                .map_err(|_| invalid(KEY_STARTUP_CHECK_MS, &raw, "expected milliseconds"))?,
        ),
    };

    let command = get(KEY_COMMAND).unwrap_or_else(|| DEFAULT_COMMAND.to_string());
    let (program, args) = parse_command(&command)?;

    let cwd = get_set(KEY_CWD).map(|s| resolve_path(s.trim(), base_dir));
    let log = get_set(KEY_LOG).map(|s| resolve_path(s.trim(), base_dir));

    let worker_env = file
        .iter()
        .filter(|(k, _)| env(k.as_str()).is_none())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(Settings {
        port,
        patterns,
        grace,
        stop_signal,
        worker: WorkerSpec {
            command,
            program,
            args,
            cwd,
            log,
            env: worker_env,
            startup_check,
        },
        source: None,
    })
}

/// Keys listed in `BOTCTL_REQUIRE` that are absent or empty.
pub fn missing_required<F>(file: &EnvMap, env: F) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| env(key).or_else(|| file.get(key).cloned());
    let Some(raw) = get(KEY_REQUIRE) else {
        return Vec::new();
    };
    split_list(&raw)
        .into_iter()
        .filter(|key| get(key).is_none_or(|v| v.trim().is_empty()))
        .collect()
}

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn settings_from_file(path: &Path, file: &EnvMap) -> Result<Settings, ConfigError> {
    let base_dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut settings = resolve(file, base_dir, process_env)?;
    settings.source = Some(path.to_path_buf());
    Ok(settings)
}

/// Settings for `start`: the file must exist and every required key be set.
pub fn load_for_start(path: &Path) -> Result<Settings, ConfigError> {
    let file = env_file::load_env_file(path)?;
    if let Some(key) = missing_required(&file, process_env).into_iter().next() {
        return Err(ConfigError::MissingKey { key });
    }
    settings_from_file(path, &file)
}

/// Settings for `stop` and `status`: a missing file falls back to defaults.
pub fn load_for_stop(path: &Path) -> Result<Settings, ConfigError> {
    match env_file::load_env_file(path) {
        Ok(file) => settings_from_file(path, &file),
        Err(EnvFileError::NotFound { path }) => {
            tracing::info!("no configuration at {path}, using built-in defaults");
            resolve(&EnvMap::new(), None, process_env)
        }
        Err(e) => Err(e.into()),
    }
}
