//! Loads program descriptors from an INI-style configuration file (spec §4.4, §6).

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use ini::Ini;

use crate::descriptor::{AutoRestart, ProgramDescriptor, StopSignal};
use crate::error::ConfigError;

const KNOWN_KEYS: &[&str] = &[
    "cmd",
    "numprocs",
    "umask",
    "workingdir",
    "autostart",
    "autorestart",
    "exitcodes",
    "startretries",
    "starttime",
    "stopsignal",
    "stoptime",
    "stdout",
    "stderr",
    "env",
];

/// Parses `path` into a map of program name to validated descriptor.
///
/// A single invalid section fails the whole load; there is no partial
/// application of a bad config (spec §4.4).
pub fn load_config(path: &Path) -> Result<HashMap<String, ProgramDescriptor>, ConfigError> {
    let ini = Ini::load_from_file(path).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    let mut programs = HashMap::new();
    for (section, props) in ini.iter() {
        let Some(name) = section else { continue };

        for key in props.iter().map(|(k, _)| k) {
            if !KNOWN_KEYS.contains(&key) {
                return Err(ConfigError::UnknownKey {
                    section: name.to_string(),
                    key: key.to_string(),
                });
            }
        }

        let descriptor = parse_program(name, props)?;
        programs.insert(name.to_string(), descriptor);
    }

    Ok(programs)
}

fn parse_program(
    name: &str,
    props: &ini::Properties,
) -> Result<ProgramDescriptor, ConfigError> {
    let cmd = require(name, props, "cmd")?.to_string();
    let workingdir = PathBuf::from(require(name, props, "workingdir")?);

    let numprocs = parse_u32(name, props, "numprocs", 1)?;
    if numprocs < 1 {
        return Err(ConfigError::InvalidValue {
            section: name.to_string(),
            key: "numprocs".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    let umask = parse_umask(name, props)?;
    let autostart = parse_bool(name, props, "autostart", true)?;
    let autorestart = match props.get("autorestart") {
        Some(raw) => AutoRestart::parse(raw).ok_or_else(|| ConfigError::InvalidValue {
            section: name.to_string(),
            key: "autorestart".to_string(),
            reason: format!("'{raw}' is not always/never/unexpected"),
        })?,
        None => AutoRestart::default(),
    };
    let exitcodes = parse_exitcodes(name, props)?;
    let startretries = parse_u32(name, props, "startretries", 3)?;
    let starttime = parse_u64(name, props, "starttime", 5)?;
    let stopsignal = match props.get("stopsignal") {
        Some(raw) => StopSignal::parse(raw).ok_or_else(|| ConfigError::InvalidValue {
            section: name.to_string(),
            key: "stopsignal".to_string(),
            reason: format!("'{raw}' is not a recognized signal name"),
        })?,
        None => StopSignal::default(),
    };
    let stoptime = parse_u64(name, props, "stoptime", 10)?;
    let stdout = props.get("stdout").map(PathBuf::from);
    let stderr = props.get("stderr").map(PathBuf::from);
    let env = parse_env(props);

    Ok(ProgramDescriptor {
        name: name.to_string(),
        cmd,
        numprocs,
        umask,
        workingdir,
        autostart,
        autorestart,
        exitcodes,
        startretries,
        starttime,
        stopsignal,
        stoptime,
        stdout,
        stderr,
        env,
    })
}

fn require<'a>(
    section: &str,
    props: &'a ini::Properties,
    key: &str,
) -> Result<&'a str, ConfigError> {
    props.get(key).ok_or_else(|| ConfigError::MissingKey {
        section: section.to_string(),
        key: key.to_string(),
    })
}

fn parse_u32(
    section: &str,
    props: &ini::Properties,
    key: &str,
    default: u32,
) -> Result<u32, ConfigError> {
    match props.get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            section: section.to_string(),
            key: key.to_string(),
            reason: format!("'{raw}' is not a non-negative integer"),
        }),
        None => Ok(default),
    }
}

fn parse_u64(
    section: &str,
    props: &ini::Properties,
    key: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    match props.get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            section: section.to_string(),
            key: key.to_string(),
            reason: format!("'{raw}' is not a non-negative integer"),
        }),
        None => Ok(default),
    }
}

fn parse_umask(section: &str, props: &ini::Properties) -> Result<u32, ConfigError> {
    match props.get("umask") {
        Some(raw) => u32::from_str_radix(raw.trim(), 8).map_err(|_| ConfigError::InvalidValue {
            section: section.to_string(),
            key: "umask".to_string(),
            reason: format!("'{raw}' is not a valid octal umask"),
        }),
        None => Ok(0o022),
    }
}

fn parse_bool(
    section: &str,
    props: &ini::Properties,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match props.get(key) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                section: section.to_string(),
                key: key.to_string(),
                reason: format!("'{raw}' is not true/false"),
            }),
        },
        None => Ok(default),
    }
}

fn parse_exitcodes(section: &str, props: &ini::Properties) -> Result<BTreeSet<i32>, ConfigError> {
    match props.get("exitcodes") {
        Some(raw) => raw
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<i32>()
                    .map_err(|_| ConfigError::InvalidValue {
                        section: section.to_string(),
                        key: "exitcodes".to_string(),
                        reason: format!("'{part}' is not an integer"),
                    })
            })
            .collect(),
        None => Ok(BTreeSet::from([0])),
    }
}



fn parse_env(props: &ini::Properties) -> HashMap<String, String> {
    let Some(raw) = props.get("env") else {
        return HashMap::new();
    };

    raw.split(',')
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.trim();
            let value = parts.next().unwrap_or("").trim();
            if key.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}
