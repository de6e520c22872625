//! # CommonCast Configuration Module
//!
//! This module provides configuration management for CommonCast, including:
//! - Loading configuration from YAML files
//! - Merging with embedded default configuration
//! - Environment variable overrides
//! - Type-safe getters and setters for configuration values
//! - Thread-safe shared access through [`get_config`]
//!
//! ## Usage
//!
//! ```no_run
//! use ccconfig::get_config;
//!
//! let config = get_config();
//!
//! let host = config.get_media_host();
//! let port = config.get_media_port();
//!
//! config.set_backend_enabled("dlna", false)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{Result, anyhow};
use dirs::home_dir;
use lazy_static::lazy_static;
use serde_yaml::{Mapping, Number, Value};
use std::{
    collections::BTreeMap,
    env, fs,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{info, warn};

// Configuration par défaut intégrée
const DEFAULT_CONFIG: &str = include_str!("commoncast.yaml");

lazy_static! {
    static ref CONFIG: Arc<Config> =
        Arc::new(Config::load_config("").expect("Failed to load CommonCast configuration"));
}

const ENV_CONFIG_DIR: &str = "COMMONCAST_CONFIG";
const ENV_PREFIX: &str = "COMMONCAST_CONFIG__";
const CONFIG_DIR_NAME: &str = ".commoncast";

// Default values for configuration
const DEFAULT_MEDIA_HOST: &str = "0.0.0.0";
const DEFAULT_MEDIA_PORT: u16 = 0;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: usize = 5000;
const DEFAULT_DISCOVERY_TIMEOUT_SECS: usize = 5;
const DEFAULT_LOG_MIN_LEVEL: &str = "INFO";
const DEFAULT_LOG_ENABLE_CONSOLE: bool = true;

/// Macro to generate getter/setter for usize values with default
macro_rules! impl_usize_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<usize> {
            match self.get_value($path) {
                Ok(Value::Number(n)) => Ok(n.as_u64().map(|v| v as usize).unwrap_or($default)),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, size: usize) -> Result<()> {
            let n = Number::from(size);
            self.set_value($path, Value::Number(n))
        }
    };
}

/// Macro to generate getter/setter for bool values with default
macro_rules! impl_bool_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<bool> {
            match self.get_value($path) {
                Ok(Value::Bool(b)) => Ok(b),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, value: bool) -> Result<()> {
            self.set_value($path, Value::Bool(value))
        }
    };
}

/// Configuration manager for CommonCast
///
/// Holds the merged YAML tree (embedded defaults, `config.yaml`, environment
/// overrides) and writes every change back to `config.yaml`.
///
/// # Examples
///
/// ```no_run
/// use ccconfig::Config;
///
/// let config = Config::load_config("/tmp/commoncast")?;
/// println!("media port: {}", config.get_media_port());
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug)]
pub struct Config {
    config_dir: String,
    path: String,
    data: Mutex<Value>,
}

impl Config {
    /// Finds a config directory by trying different locations in order
    fn find_config_dir(directory: &str) -> String {
        // 1. Try provided directory
        if !directory.is_empty() {
            return directory.to_string();
        }

        // 2. Try environment variable
        if let Ok(env_path) = env::var(ENV_CONFIG_DIR) {
            info!(env_var = ENV_CONFIG_DIR, path = %env_path, "Trying to load config from env");
            return env_path;
        }

        // 3. Try current directory
        if Path::new(CONFIG_DIR_NAME).exists() {
            return CONFIG_DIR_NAME.to_string();
        }

        // 4. Try home directory
        if let Some(home) = home_dir() {
            let home_config = home.join(CONFIG_DIR_NAME);
            if home_config.exists() {
                return home_config.to_string_lossy().to_string();
            }
        }

        CONFIG_DIR_NAME.to_string()
    }

    /// Validates and prepares a config directory
    fn validate_config_dir(path: &Path) -> Result<()> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }

        if !path.is_dir() {
            return Err(anyhow!("{} is not a directory", path.display()));
        }

        // Test write permission
        let test_file = path.join(".write_test");
        fs::write(&test_file, b"test")?;
        fs::remove_file(&test_file)?;

        // Test read permission
        fs::read_dir(path)?;

        Ok(())
    }

    /// Determines and validates the configuration directory
    ///
    /// The directory is searched in the following order:
    /// 1. The provided `directory` parameter if not empty
    /// 2. The `COMMONCAST_CONFIG` environment variable
    /// 3. `.commoncast` in the current directory
    /// 4. `.commoncast` in the user's home directory
    ///
    /// The directory is created if it doesn't exist, and validated for read/write permissions.
    pub fn config_dir(directory: &str) -> Result<String> {
        let dir_path = Self::find_config_dir(directory);
        Self::validate_config_dir(Path::new(&dir_path))?;
        Ok(dir_path)
    }

    /// Loads the configuration from the specified directory
    ///
    /// This method:
    /// 1. Determines the configuration directory
    /// 2. Loads the default embedded configuration
    /// 3. Merges it with the external config.yaml file if present
    /// 4. Applies environment variable overrides
    /// 5. Saves the merged configuration
    pub fn load_config(directory: &str) -> Result<Self> {
        let config_dir = Self::config_dir(directory)?;
        info!(config_dir = %config_dir, "Using config directory");

        let config_file_path = Path::new(&config_dir).join("config.yaml");
        let path = config_file_path.to_string_lossy().to_string();

        let mut default_value: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;

        let yaml_data = if let Ok(data) = fs::read(&path) {
            info!(config_file = %path, "Loaded config file");
            data
        } else {
            info!(config_file = %path, "Config file not found, using default embedded config");
            DEFAULT_CONFIG.as_bytes().to_vec()
        };

        // Un fichier vide est parsé en Null : on garde alors les valeurs par défaut
        let external_value: Value = serde_yaml::from_slice(&yaml_data)?;
        merge_yaml(&mut default_value, &external_value);
        let mut config_value = Self::lower_keys_value(default_value);

        Self::apply_env_overrides(&mut config_value);

        let config = Config {
            config_dir,
            path,
            data: Mutex::new(config_value),
        };

        config.save()?;
        Ok(config)
    }

    fn data(&self) -> MutexGuard<'_, Value> {
        // Un panic pendant une écriture laisse un arbre YAML cohérent : on ignore l'empoisonnement
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Directory holding `config.yaml`
    pub fn directory(&self) -> &str {
        &self.config_dir
    }

    /// Saves the current configuration to the config.yaml file
    pub fn save(&self) -> Result<()> {
        let yaml = serde_yaml::to_string(&*self.data())?;
        fs::write(&self.path, yaml)?;
        Ok(())
    }

    /// Sets a configuration value at the specified path and saves it
    ///
    /// # Arguments
    ///
    /// * `path` - Array of keys representing the path (e.g., `&["media_server", "port"]`)
    /// * `value` - The YAML value to set
    pub fn set_value(&self, path: &[&str], value: Value) -> Result<()> {
        {
            let mut data = self.data();
            Self::set_value_internal(&mut data, path, value)?;
        }
        self.save()
    }

    fn set_value_internal(data: &mut Value, path: &[&str], value: Value) -> Result<()> {
        if path.is_empty() {
            *data = value;
            return Ok(());
        }
        if let Value::Null = data {
            *data = Value::Mapping(Mapping::new());
        }
        if let Value::Mapping(map) = data {
            let key_value = Value::String(path[0].to_lowercase());
            if path.len() == 1 {
                map.insert(key_value, value);
            } else {
                let entry = map
                    .entry(key_value)
                    .or_insert(Value::Mapping(Mapping::new()));
                Self::set_value_internal(entry, &path[1..], value)?;
            }
            Ok(())
        } else {
            Err(anyhow!("Current node is not a map"))
        }
    }

    /// Gets a configuration value at the specified path
    ///
    /// Returns an error if the path doesn't exist.
    pub fn get_value(&self, path: &[&str]) -> Result<Value> {
        let data = self.data();
        Self::get_value_internal(&data, path)
    }

    fn get_value_internal(data: &Value, path: &[&str]) -> Result<Value> {
        let mut current = data;
        for (i, key) in path.iter().enumerate() {
            if let Value::Mapping(map) = current {
                if let Some(next) = map.get(Value::String(key.to_lowercase())) {
                    current = next;
                } else {
                    return Err(anyhow!("Path {} does not exist", path[..=i].join(".")));
                }
            } else {
                return Err(anyhow!("Path {} is not a Config", path[..i].join(".")));
            }
        }
        Ok(current.clone())
    }

    fn apply_env_overrides(config: &mut Value) {
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                let key_path = stripped.split("__").collect::<Vec<_>>();
                let yaml_value = Self::convert_env_value(&value);
                if let Err(err) = Self::set_value_internal(config, &key_path, yaml_value) {
                    warn!(env_var = %key, error = %err, "Ignoring configuration override");
                }
            }
        }
    }

    fn convert_env_value(value: &str) -> Value {
        if let Ok(parsed) = serde_yaml::from_str::<Value>(value) {
            return parsed;
        }
        Value::String(value.to_string())
    }

    fn lower_keys_value(value: Value) -> Value {
        match value {
            Value::Mapping(map) => {
                let mut new_map = Mapping::new();
                for (k, v) in map {
                    let new_key = match k {
                        Value::String(s) => Value::String(s.to_lowercase()),
                        other => other,
                    };
                    new_map.insert(new_key, Self::lower_keys_value(v));
                }
                Value::Mapping(new_map)
            }
            Value::Sequence(seq) => {
                Value::Sequence(seq.into_iter().map(Self::lower_keys_value).collect())
            }
            _ => value,
        }
    }

    /// Host the embedded media server binds to.
    ///
    /// `"disabled"` turns the media server off.
    pub fn get_media_host(&self) -> String {
        match self.get_value(&["media_server", "host"]) {
            Ok(Value::String(s)) if !s.is_empty() => s,
            Ok(_) | Err(_) => DEFAULT_MEDIA_HOST.to_string(),
        }
    }

    pub fn set_media_host(&self, host: &str) -> Result<()> {
        self.set_value(&["media_server", "host"], Value::String(host.to_string()))
    }

    /// Port of the embedded media server (`0` picks a free port)
    pub fn get_media_port(&self) -> u16 {
        match self.get_value(&["media_server", "port"]) {
            Ok(Value::Number(n)) => match n.as_u64().and_then(|p| u16::try_from(p).ok()) {
                Some(port) => port,
                None => {
                    warn!("Invalid media port '{}', using default {}", n, DEFAULT_MEDIA_PORT);
                    DEFAULT_MEDIA_PORT
                }
            },
            Ok(Value::String(s)) => s.parse::<u16>().unwrap_or_else(|_| {
                warn!("Invalid media port '{}', using default {}", s, DEFAULT_MEDIA_PORT);
                DEFAULT_MEDIA_PORT
            }),
            Ok(_) | Err(_) => DEFAULT_MEDIA_PORT,
        }
    }

    pub fn set_media_port(&self, port: u16) -> Result<()> {
        self.set_value(&["media_server", "port"], Value::Number(Number::from(port)))
    }

    impl_usize_config!(
        get_shutdown_timeout_ms,
        set_shutdown_timeout_ms,
        &["registry", "shutdown_timeout_ms"],
        DEFAULT_SHUTDOWN_TIMEOUT_MS
    );

    impl_usize_config!(
        get_discovery_timeout_secs,
        set_discovery_timeout_secs,
        &["discovery", "timeout_secs"],
        DEFAULT_DISCOVERY_TIMEOUT_SECS
    );

    impl_bool_config!(
        get_log_enable_console,
        set_log_enable_console,
        &["logger", "enable_console"],
        DEFAULT_LOG_ENABLE_CONSOLE
    );

    /// Récupère le niveau de log minimum depuis la configuration
    pub fn get_log_min_level(&self) -> Result<String> {
        match self.get_value(&["logger", "min_level"]) {
            Ok(Value::String(s)) => Ok(s),
            _ => Ok(DEFAULT_LOG_MIN_LEVEL.to_string()),
        }
    }

    /// Définit le niveau de log minimum dans la configuration
    pub fn set_log_min_level(&self, level: String) -> Result<()> {
        self.set_value(&["logger", "min_level"], Value::String(level))
    }

    /// Returns the `backends` section, one raw YAML record per backend name.
    ///
    /// A record that is a bare boolean (`dial: false`) is expanded to
    /// `{enabled: <bool>}`.
    pub fn get_backends(&self) -> Result<BTreeMap<String, Value>> {
        let section = match self.get_value(&["backends"]) {
            Ok(Value::Mapping(map)) => map,
            Ok(Value::Null) | Err(_) => return Ok(BTreeMap::new()),
            Ok(_) => return Err(anyhow!("backends is not a map")),
        };

        let mut backends = BTreeMap::new();
        for (key, value) in section {
            let Value::String(name) = key else {
                warn!("Ignoring backend entry with a non-string name");
                continue;
            };
            let record = match value {
                Value::Bool(enabled) => {
                    let mut map = Mapping::new();
                    map.insert(Value::String("enabled".into()), Value::Bool(enabled));
                    Value::Mapping(map)
                }
                Value::Null => Value::Mapping(Mapping::new()),
                other => other,
            };
            backends.insert(name, record);
        }
        Ok(backends)
    }

    pub fn set_backend_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.set_value(&["backends", name, "enabled"], Value::Bool(enabled))
    }
}

/// Returns the global configuration instance
///
/// Lazily loaded on first access from the directory resolved by
/// [`Config::config_dir`].
///
/// # Panics
///
/// Panics on first access if the configuration directory cannot be prepared
/// or the YAML cannot be parsed.
pub fn get_config() -> Arc<Config> {
    CONFIG.clone()
}

/// Merges external YAML configuration into default configuration
///
/// - For mappings, keys from `external` are merged recursively into `default`
/// - For scalars and sequences, external values replace default values
/// - A null external document leaves `default` untouched
fn merge_yaml(default: &mut Value, external: &Value) {
    match (default, external) {
        (_, Value::Null) => {}
        (Value::Mapping(dmap), Value::Mapping(emap)) => {
            for (k, v) in emap {
                match dmap.get_mut(k) {
                    Some(dv) => merge_yaml(dv, v),
                    None => {
                        dmap.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (d, e) => *d = e.clone(), // pour les scalaires ou séquences, on remplace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_in(dir: &tempfile::TempDir) -> Config {
        Config::load_config(dir.path().to_str().unwrap()).unwrap()
    }

    #[test]
    fn test_defaults_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_in(&dir);

        assert_eq!(config.get_media_host(), "0.0.0.0");
        assert_eq!(config.get_media_port(), 0);
        assert_eq!(config.get_shutdown_timeout_ms().unwrap(), 5000);
        assert_eq!(config.get_log_min_level().unwrap(), "INFO");
        assert!(config.get_log_enable_console().unwrap());
        assert!(dir.path().join("config.yaml").exists());
    }

    #[test]
    fn test_external_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.yaml"),
            "Media_Server:\n  Port: 8765\nbackends:\n  dial: false\n",
        )
        .unwrap();

        let config = load_in(&dir);

        assert_eq!(config.get_media_port(), 8765);
        // la valeur par défaut non surchargée est conservée
        assert_eq!(config.get_media_host(), "0.0.0.0");

        let backends = config.get_backends().unwrap();
        assert_eq!(
            backends["dial"].get("enabled"),
            Some(&Value::Bool(false))
        );
        assert_eq!(
            backends["dlna"].get("enabled"),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn test_set_value_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        {
            let config = load_in(&dir);
            config.set_media_host("disabled").unwrap();
            config.set_backend_enabled("chromecast", false).unwrap();
        }

        let reloaded = load_in(&dir);
        assert_eq!(reloaded.get_media_host(), "disabled");
        assert_eq!(
            reloaded.get_value(&["backends", "chromecast", "enabled"]).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_in(&dir);

        assert!(config.get_value(&["nope", "nothing"]).is_err());
    }

    #[test]
    fn test_merge_yaml_replaces_scalars_and_merges_maps() {
        let mut default: Value = serde_yaml::from_str("a: 1\nb:\n  c: 2\n  d: 3\n").unwrap();
        let external: Value = serde_yaml::from_str("b:\n  c: 20\ne: 5\n").unwrap();

        merge_yaml(&mut default, &external);

        let expected: Value = serde_yaml::from_str("a: 1\nb:\n  c: 20\n  d: 3\ne: 5\n").unwrap();
        assert_eq!(default, expected);
    }
}
