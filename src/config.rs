//! TOML configuration with layered sources.
//!
//! Configuration is assembled from (lowest to highest precedence) built-in
//! defaults, the system config file, the user config file, and command-line
//! overrides. Each recognized option keeps one value slot per source;
//! the effective value comes from the highest-precedence slot that is set.
//!
//! The intermediate layer stringly-types all values: TOML booleans and
//! arrays are re-serialized textually when read, and typed accessors parse
//! the string form back. This keeps the per-source storage uniform and lets
//! higher layers display any option's effective value and provenance.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::warn;

/// Name of the product's private state directory under `$HOME`.
const DEFAULT_STATE_DIR: &str = ".veilfs";
/// Name of the user ignore file under `$HOME`.
const DEFAULT_USER_IGNORE_FILE: &str = ".veilfsignore";
/// Name of the system-wide ignore file under the system config directory.
const DEFAULT_SYSTEM_IGNORE_FILE: &str = "ignore";

/// Where a config value came from. Later variants take precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigSourceType {
    Default,
    SystemConfig,
    UserConfig,
    CommandLine,
}

const SOURCE_COUNT: usize = 4;

impl ConfigSourceType {
    fn slot(self) -> usize {
        match self {
            ConfigSourceType::Default => 0,
            ConfigSourceType::SystemConfig => 1,
            ConfigSourceType::UserConfig => 2,
            ConfigSourceType::CommandLine => 3,
        }
    }
}

/// Errors from explicit config operations (command-line overrides and typed
/// reads). File-loading problems are logged and ignored instead, so a broken
/// config file never takes the daemon down.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown config option: {0}")]
    UnknownOption(String),
    #[error("config key must be of the form section.key: {0}")]
    MalformedKey(String),
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Variables available for `${NAME}` substitution in path-typed options.
///
/// Lookups fall back to the process environment for names not present in
/// the map.
#[derive(Debug, Default, Clone)]
pub struct ConfigVariables {
    values: HashMap<String, String>,
}

impl ConfigVariables {
    pub fn new() -> ConfigVariables {
        ConfigVariables::default()
    }

    /// The standard variable set for a user: `HOME`, `USER`, `USER_ID`.
    pub fn for_user(home: &Path, user: &str, user_id: u32) -> ConfigVariables {
        let mut vars = ConfigVariables::new();
        vars.set("HOME", home.to_string_lossy());
        vars.set("USER", user);
        vars.set("USER_ID", user_id.to_string());
        vars
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    fn get(&self, name: &str) -> Option<String> {
        match self.values.get(name) {
            Some(value) => Some(value.clone()),
            None => std::env::var(name).ok(),
        }
    }

    /// Expand every `${NAME}` occurrence. Unresolvable names fail the whole
    /// value.
    fn substitute(&self, input: &str) -> Result<String, String> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                return Err(format!("unterminated ${{ in \"{input}\""));
            };
            let name = &after[..end];
            match self.get(name) {
                Some(value) => out.push_str(&value),
                None => return Err(format!("undefined variable ${{{name}}}")),
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// How a setting's string value is interpreted, which also decides whether
/// variable substitution applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SettingKind {
    /// An absolute path; `${VAR}` substitution applies.
    Path,
    /// A list of absolute paths (stringified TOML array); substitution
    /// applies to each element.
    PathList,
    Bool,
    String,
}

#[derive(Debug)]
struct Setting {
    kind: SettingKind,
    /// One slot per source; effective value is the highest set slot.
    values: [Option<String>; SOURCE_COUNT],
}

impl Setting {
    fn effective(&self) -> Option<&str> {
        self.values.iter().rev().flatten().next().map(String::as_str)
    }

    fn clear(&mut self, source: ConfigSourceType) {
        self.values[source.slot()] = None;
    }
}

/// The loaded configuration.
#[derive(Debug)]
pub struct VfsConfig {
    substitutions: ConfigVariables,
    user_config_path: PathBuf,
    system_config_path: PathBuf,
    sections: BTreeMap<String, BTreeMap<String, Setting>>,
}

impl VfsConfig {
    /// Build a config with defaults derived from the user's home directory
    /// and the system config directory, then load both config files.
    pub fn load(
        substitutions: ConfigVariables,
        user_home: &Path,
        user_config_path: PathBuf,
        system_config_dir: &Path,
        system_config_path: PathBuf,
    ) -> VfsConfig {
        let mut config = VfsConfig::with_defaults(
            substitutions,
            user_home,
            user_config_path,
            system_config_dir,
            system_config_path,
        );
        config.reload_system_config();
        config.reload_user_config();
        config
    }

    /// Build the config registry with default values only; no files are
    /// read. Used by `load` and by tests that drive file loading manually.
    pub fn with_defaults(
        substitutions: ConfigVariables,
        user_home: &Path,
        user_config_path: PathBuf,
        system_config_dir: &Path,
        system_config_path: PathBuf,
    ) -> VfsConfig {
        let mut config = VfsConfig {
            substitutions,
            user_config_path,
            system_config_path,
            sections: BTreeMap::new(),
        };

        config.register(
            "core",
            "ignore-file",
            SettingKind::Path,
            user_home.join(DEFAULT_USER_IGNORE_FILE).to_string_lossy(),
        );
        config.register(
            "core",
            "system-ignore-file",
            SettingKind::Path,
            system_config_dir
                .join(DEFAULT_SYSTEM_IGNORE_FILE)
                .to_string_lossy(),
        );
        config.register(
            "core",
            "veilfs-dir",
            SettingKind::Path,
            user_home.join(DEFAULT_STATE_DIR).to_string_lossy(),
        );
        config.register("silo", "use-silo", SettingKind::Bool, "false");
        config.register("ssl", "client-certificate-locations", SettingKind::PathList, "[]");
        config.register("ssl", "client-certificate", SettingKind::Path, "");

        config
    }

    fn register(
        &mut self,
        section: &str,
        key: &str,
        kind: SettingKind,
        default: impl Into<String>,
    ) {
        let mut values: [Option<String>; SOURCE_COUNT] = Default::default();
        values[ConfigSourceType::Default.slot()] = Some(default.into());
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), Setting { kind, values });
    }

    /// Re-read the system config file, dropping any values it previously
    /// contributed.
    pub fn reload_system_config(&mut self) {
        self.clear_source(ConfigSourceType::SystemConfig);
        let path = self.system_config_path.clone();
        self.load_file(&path, ConfigSourceType::SystemConfig);
    }

    /// Re-read the user config file, dropping any values it previously
    /// contributed.
    pub fn reload_user_config(&mut self) {
        self.clear_source(ConfigSourceType::UserConfig);
        let path = self.user_config_path.clone();
        self.load_file(&path, ConfigSourceType::UserConfig);
    }

    fn clear_source(&mut self, source: ConfigSourceType) {
        for section in self.sections.values_mut() {
            for setting in section.values_mut() {
                setting.clear(source);
            }
        }
    }

    fn load_file(&mut self, path: &Path, source: ConfigSourceType) {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("error accessing config file {}: {err}", path.display());
                }
                return;
            }
        };

        let root: toml::value::Table = match toml::from_str(&contents) {
            Ok(root) => root,
            Err(err) => {
                warn!(
                    "failed to parse config file {}, skipping: {err}",
                    path.display()
                );
                return;
            }
        };

        for (section_name, section_value) in &root {
            let Some(registered) = self.sections.get_mut(section_name) else {
                warn!(
                    "ignoring unknown section in config: {}, key: {section_name}",
                    path.display()
                );
                continue;
            };
            let Some(table) = section_value.as_table() else {
                warn!(
                    "ignoring non-table section in config: {}, key: {section_name}",
                    path.display()
                );
                continue;
            };
            for (key, value) in table {
                let Some(setting) = registered.get_mut(key) else {
                    warn!(
                        "ignoring unknown key in config: {}, {section_name}.{key}",
                        path.display()
                    );
                    continue;
                };
                let Some(stringified) = item_as_string(value) else {
                    warn!(
                        "ignoring invalid config entry {} {section_name}.{key}: \
                         not a string, boolean, number, or array",
                        path.display()
                    );
                    continue;
                };
                if let Err(message) =
                    apply_value(setting, &self.substitutions, &stringified, source)
                {
                    warn!(
                        "ignoring invalid config entry {} {section_name}.{key}, \
                         value '{stringified}': {message}",
                        path.display()
                    );
                }
            }
        }
    }

    /// Apply one `section.key=value` override from the command line. Unlike
    /// file values, bad overrides are reported to the caller.
    pub fn apply_command_line(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let (section, key_name) = key
            .split_once('.')
            .ok_or_else(|| ConfigError::MalformedKey(key.to_string()))?;
        let setting = self
            .sections
            .get_mut(section)
            .and_then(|s| s.get_mut(key_name))
            .ok_or_else(|| ConfigError::UnknownOption(key.to_string()))?;
        apply_value(setting, &self.substitutions, value, ConfigSourceType::CommandLine).map_err(
            |message| ConfigError::InvalidValue {
                key: key.to_string(),
                message,
            },
        )
    }

    /// The effective string value of `section.key`, if the option exists.
    pub fn get_value(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .and_then(Setting::effective)
    }

    /// The source whose value is in effect for `section.key`.
    pub fn get_source(&self, section: &str, key: &str) -> Option<ConfigSourceType> {
        let setting = self.sections.get(section)?.get(key)?;
        for source in [
            ConfigSourceType::CommandLine,
            ConfigSourceType::UserConfig,
            ConfigSourceType::SystemConfig,
            ConfigSourceType::Default,
        ] {
            if setting.values[source.slot()].is_some() {
                return Some(source);
            }
        }
        None
    }

    pub fn user_config_path(&self) -> &Path {
        &self.user_config_path
    }

    pub fn system_config_path(&self) -> &Path {
        &self.system_config_path
    }

    /// `core.ignore-file`: the user's ignore rule file.
    pub fn user_ignore_file(&self) -> PathBuf {
        PathBuf::from(self.get_value("core", "ignore-file").unwrap_or_default())
    }

    /// `core.system-ignore-file`: the system-wide ignore rule file.
    pub fn system_ignore_file(&self) -> PathBuf {
        PathBuf::from(
            self.get_value("core", "system-ignore-file")
                .unwrap_or_default(),
        )
    }

    /// `core.veilfs-dir`: the product's private state directory.
    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(self.get_value("core", "veilfs-dir").unwrap_or_default())
    }

    /// `silo.use-silo`: which remote fetch backend to use.
    pub fn use_silo(&self) -> bool {
        self.get_value("silo", "use-silo") == Some("true")
    }

    /// `ssl.client-certificate-locations`, parsed back from its stringified
    /// array form.
    pub fn client_certificate_locations(&self) -> Vec<PathBuf> {
        let raw = self
            .get_value("ssl", "client-certificate-locations")
            .unwrap_or("[]");
        parse_string_array(raw)
            .unwrap_or_default()
            .into_iter()
            .map(PathBuf::from)
            .collect()
    }

    /// The legacy single-path certificate option.
    pub fn client_certificate(&self) -> Option<PathBuf> {
        match self.get_value("ssl", "client-certificate") {
            Some("") | None => None,
            Some(path) => Some(PathBuf::from(path)),
        }
    }

    /// The client certificate to use: the first configured location that
    /// exists on disk, falling back to the legacy single-path option.
    pub fn get_client_certificate(&self) -> Option<PathBuf> {
        for candidate in self.client_certificate_locations() {
            if candidate.exists() {
                return Some(candidate);
            }
        }
        self.client_certificate()
    }
}

/// Stringify a TOML value the way the option layer stores it. Tables are
/// not representable as single options.
fn item_as_string(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Boolean(b) => Some(if *b { "true" } else { "false" }.to_string()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        // Re-serialize arrays textually; typed accessors parse them back.
        toml::Value::Array(_) => Some(value.to_string()),
        toml::Value::Datetime(_) | toml::Value::Table(_) => None,
    }
}

/// Parse a stringified TOML array of strings.
fn parse_string_array(raw: &str) -> Option<Vec<String>> {
    #[derive(serde::Deserialize)]
    struct Wrapper {
        v: Vec<String>,
    }
    toml::from_str::<Wrapper>(&format!("v = {raw}")).ok().map(|w| w.v)
}

/// Validate + substitute a raw string value and store it in the setting's
/// slot for `source`.
fn apply_value(
    setting: &mut Setting,
    substitutions: &ConfigVariables,
    raw: &str,
    source: ConfigSourceType,
) -> Result<(), String> {
    let stored = match setting.kind {
        SettingKind::String => raw.to_string(),
        SettingKind::Bool => match raw {
            "true" | "false" => raw.to_string(),
            _ => return Err(format!("\"{raw}\" is not a boolean")),
        },
        SettingKind::Path => {
            let substituted = substitutions.substitute(raw)?;
            if !substituted.is_empty() && !substituted.starts_with('/') {
                return Err(format!("\"{substituted}\" is not an absolute path"));
            }
            substituted
        }
        SettingKind::PathList => {
            let elements = parse_string_array(raw)
                .ok_or_else(|| format!("\"{raw}\" is not an array of strings"))?;
            let mut substituted = Vec::with_capacity(elements.len());
            for element in &elements {
                let path = substitutions.substitute(element)?;
                if !path.starts_with('/') {
                    return Err(format!("\"{path}\" is not an absolute path"));
                }
                substituted.push(toml::Value::String(path));
            }
            toml::Value::Array(substituted).to_string()
        }
    };
    setting.values[source.slot()] = Some(stored);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vars() -> ConfigVariables {
        ConfigVariables::for_user(Path::new("/home/bob"), "bob", 1000)
    }

    fn write_config(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn config_with_files(system: &str, user: &str) -> VfsConfig {
        let dir = tempfile::tempdir().unwrap();
        let system_path = write_config(dir.path(), "system.toml", system);
        let user_path = write_config(dir.path(), "user.toml", user);
        VfsConfig::load(
            test_vars(),
            Path::new("/home/bob"),
            user_path,
            dir.path(),
            system_path,
        )
    }

    #[test]
    fn defaults_derive_from_home() {
        let dir = tempfile::tempdir().unwrap();
        let config = VfsConfig::with_defaults(
            test_vars(),
            Path::new("/home/bob"),
            dir.path().join("user.toml"),
            Path::new("/etc/veilfs"),
            dir.path().join("system.toml"),
        );
        assert_eq!(
            config.user_ignore_file(),
            PathBuf::from("/home/bob/.veilfsignore")
        );
        assert_eq!(
            config.system_ignore_file(),
            PathBuf::from("/etc/veilfs/ignore")
        );
        assert_eq!(config.state_dir(), PathBuf::from("/home/bob/.veilfs"));
        assert!(!config.use_silo());
        assert_eq!(
            config.get_source("core", "ignore-file"),
            Some(ConfigSourceType::Default)
        );
    }

    #[test]
    fn user_config_overrides_system_config() {
        let config = config_with_files(
            "[core]\nignore-file = \"/should_be_over_ridden\"\n",
            "[core]\nignore-file = \"${HOME}/${USER}/userCustomIgnore\"\n",
        );
        assert_eq!(
            config.user_ignore_file(),
            PathBuf::from("/home/bob/bob/userCustomIgnore")
        );
        assert_eq!(
            config.get_source("core", "ignore-file"),
            Some(ConfigSourceType::UserConfig)
        );
    }

    #[test]
    fn system_config_applies_when_user_is_silent() {
        let config = config_with_files("[core]\nignore-file = \"/etc/global-ignore\"\n", "");
        assert_eq!(config.user_ignore_file(), PathBuf::from("/etc/global-ignore"));
        assert_eq!(
            config.get_source("core", "ignore-file"),
            Some(ConfigSourceType::SystemConfig)
        );
    }

    #[test]
    fn command_line_outranks_everything() {
        let mut config = config_with_files("", "[core]\nignore-file = \"/from-user\"\n");
        config
            .apply_command_line("core.ignore-file", "/from-cli")
            .unwrap();
        assert_eq!(config.user_ignore_file(), PathBuf::from("/from-cli"));
        assert_eq!(
            config.get_source("core", "ignore-file"),
            Some(ConfigSourceType::CommandLine)
        );
    }

    #[test]
    fn unknown_sections_and_keys_are_ignored() {
        let config = config_with_files(
            "[mystery]\nvalue = \"x\"\n[core]\nbogus-key = \"y\"\n",
            "",
        );
        // Still using the defaults; nothing blew up.
        assert_eq!(
            config.get_source("core", "ignore-file"),
            Some(ConfigSourceType::Default)
        );
        assert!(config.get_value("mystery", "value").is_none());
    }

    #[test]
    fn malformed_file_is_skipped_entirely() {
        let config = config_with_files("not [valid toml", "[core]\nveilfs-dir = \"/opt/state\"\n");
        assert_eq!(config.state_dir(), PathBuf::from("/opt/state"));
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = config_with_files(
            "",
            "[core]\nignore-file = \"relative/path\"\n[silo]\nuse-silo = \"maybe\"\n",
        );
        assert_eq!(
            config.user_ignore_file(),
            PathBuf::from("/home/bob/.veilfsignore")
        );
        assert!(!config.use_silo());
    }

    #[test]
    fn booleans_are_stringified() {
        let config = config_with_files("", "[silo]\nuse-silo = true\n");
        assert_eq!(config.get_value("silo", "use-silo"), Some("true"));
        assert!(config.use_silo());
    }

    #[test]
    fn arrays_round_trip_with_substitution() {
        let config = config_with_files(
            "",
            "[ssl]\nclient-certificate-locations = [\"${HOME}/cert1.pem\", \"/etc/cert2.pem\"]\n",
        );
        assert_eq!(
            config.client_certificate_locations(),
            vec![
                PathBuf::from("/home/bob/cert1.pem"),
                PathBuf::from("/etc/cert2.pem")
            ]
        );
    }

    #[test]
    fn client_certificate_picks_first_existing_location() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.pem");
        std::fs::write(&present, "cert").unwrap();

        let user = format!(
            "[ssl]\nclient-certificate-locations = [\"/does/not/exist.pem\", \"{}\"]\n\
             client-certificate = \"/legacy.pem\"\n",
            present.display()
        );
        let config = config_with_files("", &user);
        assert_eq!(config.get_client_certificate(), Some(present));
    }

    #[test]
    fn client_certificate_falls_back_to_legacy_path() {
        let config = config_with_files(
            "",
            "[ssl]\nclient-certificate-locations = [\"/does/not/exist.pem\"]\n\
             client-certificate = \"/legacy.pem\"\n",
        );
        assert_eq!(
            config.get_client_certificate(),
            Some(PathBuf::from("/legacy.pem"))
        );
    }

    #[test]
    fn reload_drops_stale_values() {
        let dir = tempfile::tempdir().unwrap();
        let system_path = write_config(dir.path(), "system.toml", "");
        let user_path = write_config(
            dir.path(),
            "user.toml",
            "[core]\nveilfs-dir = \"/opt/state\"\n",
        );
        let mut config = VfsConfig::load(
            test_vars(),
            Path::new("/home/bob"),
            user_path.clone(),
            dir.path(),
            system_path,
        );
        assert_eq!(config.state_dir(), PathBuf::from("/opt/state"));

        std::fs::write(&user_path, "").unwrap();
        config.reload_user_config();
        assert_eq!(config.state_dir(), PathBuf::from("/home/bob/.veilfs"));
    }

    #[test]
    fn unresolved_variables_are_rejected() {
        let config = config_with_files(
            "",
            "[core]\nignore-file = \"${DEFINITELY_NOT_SET_ANYWHERE_42}/x\"\n",
        );
        assert_eq!(
            config.get_source("core", "ignore-file"),
            Some(ConfigSourceType::Default)
        );
    }
}
