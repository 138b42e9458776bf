//! INI-style configuration loading.
//!
//! No off-the-shelf crate here parses this format, so the small
//! `[section]` / `key = value` grammar is hand-rolled directly, the same
//! way the line codec hand-rolls its CRLF search rather than pulling in a
//! framing crate for one delimiter.

use std::collections::HashMap;
use std::path::Path;

use crate::error::ArcError;
use crate::log::Facility;

/// A parsed INI document: section name -> (key -> value), plus a top-level
/// (sectionless) map for completeness even though this format always uses
/// sections.
#[derive(Debug, Default, Clone)]
pub struct Ini {
    sections: HashMap<String, HashMap<String, String>>,
}

impl Ini {
    pub fn parse(text: &str) -> Result<Self, ArcError> {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current = String::new();

        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(stripped) = line.strip_prefix('[') {
                let name = stripped.strip_suffix(']').ok_or_else(|| {
                    ArcError::Config(format!("line {}: unterminated section header", lineno + 1))
                })?;
                current = name.trim().to_string();
                sections.entry(current.clone()).or_default();
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                ArcError::Config(format!("line {}: expected 'key = value'", lineno + 1))
            })?;

            if current.is_empty() {
                return Err(ArcError::Config(format!(
                    "line {}: key outside of any [section]",
                    lineno + 1
                )));
            }

            sections
                .entry(current.clone())
                .or_default()
                .insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(Self { sections })
    }

    pub fn load(path: &Path) -> Result<Self, ArcError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ArcError::Config(format!("reading {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    #[must_use]
    pub fn section(&self, name: &str) -> Option<&HashMap<String, String>> {
        self.sections.get(name)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)?.get(key).map(String::as_str)
    }

    pub fn require(&self, section: &str, key: &str) -> Result<&str, ArcError> {
        self.get(section, key).ok_or_else(|| {
            ArcError::Config(format!("missing required key [{section}] {key}"))
        })
    }
}

/// One entry in the `[commands]` table: a command name mapped to an
/// executable path plus an argv template.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: String,
    pub executable: String,
    pub args: Vec<String>,
}

/// The fully assembled server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub service_name: String,
    pub timeout_seconds: u64,

    pub log_level: Facility,
    pub log_destination: LogDestination,

    pub host: String,
    pub ports: Vec<u16>,
    pub pid_file: String,
    pub max_requests_per_worker: u32,
    pub min_servers: u32,
    pub max_servers: u32,
    pub min_spare_servers: u32,
    pub max_spare_servers: u32,
    pub sasl_mechanisms: Vec<String>,

    pub commands: HashMap<String, CommandSpec>,
    pub acl: HashMap<String, Vec<String>>,
    pub identities: HashMap<String, (u32, u32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDestination {
    Stderr,
    Syslog,
}

impl std::str::FromStr for LogDestination {
    type Err = ArcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stderr" => Ok(Self::Stderr),
            "syslog" => Ok(Self::Syslog),
            other => Err(ArcError::Config(format!("unknown log destination {other:?}"))),
        }
    }
}

impl Config {
    pub fn from_ini(ini: &Ini) -> Result<Self, ArcError> {
        let service_name = ini.get("main", "service").unwrap_or("arcd").to_string();
        let timeout_seconds = ini
            .get("main", "timeout")
            .unwrap_or("30")
            .parse()
            .map_err(|_| ArcError::Config("[main] timeout must be an integer".into()))?;

        let log_level: Facility = ini
            .get("logging", "level")
            .unwrap_or("7")
            .parse()
            .map_err(|_| ArcError::Config("[logging] level must be an integer bitmask".into()))?;
        let log_destination: LogDestination = ini
            .get("logging", "destination")
            .unwrap_or("stderr")
            .parse()?;

        let host = ini.get("arcd", "host").unwrap_or("0.0.0.0").to_string();
        let ports = ini
            .get("arcd", "port")
            .unwrap_or("4373")
            .split(',')
            .map(|p| {
                p.trim()
                    .parse()
                    .map_err(|_| ArcError::Config(format!("invalid port {p:?}")))
            })
            .collect::<Result<Vec<u16>, ArcError>>()?;
        let pid_file = ini
            .get("arcd", "pid_file")
            .unwrap_or("/var/run/arcd.pid")
            .to_string();

        let parse_u32 = |key: &str, default: u32| -> Result<u32, ArcError> {
            match ini.get("arcd", key) {
                Some(v) => v
                    .parse()
                    .map_err(|_| ArcError::Config(format!("[arcd] {key} must be an integer"))),
                None => Ok(default),
            }
        };

        let max_requests_per_worker = parse_u32("max_requests", 1000)?;
        let min_servers = parse_u32("min_servers", 2)?;
        let max_servers = parse_u32("max_servers", 8)?;
        let min_spare_servers = parse_u32("min_spare_servers", 1)?;
        let max_spare_servers = parse_u32("max_spare_servers", 4)?;

        let sasl_mechanisms = ini
            .get("arcd", "sasl_mechanisms")
            .unwrap_or("PLAIN,SCRAM-SHA-256")
            .split(',')
            .map(|m| m.trim().to_uppercase())
            .collect();

        let mut commands = HashMap::new();
        if let Some(section) = ini.section("commands") {
            for (name, value) in section {
                let mut parts = value.split_whitespace();
                let executable = parts
                    .next()
                    .ok_or_else(|| {
                        ArcError::Config(format!("[commands] {name} has no executable"))
                    })?
                    .to_string();
                commands.insert(
                    name.clone(),
                    CommandSpec {
                        name: name.clone(),
                        executable,
                        args: parts.map(str::to_string).collect(),
                    },
                );
            }
        }

        let mut acl = HashMap::new();
        if let Some(section) = ini.section("acl") {
            for (name, value) in section {
                let mut users: Vec<String> =
                    value.split(',').map(|u| u.trim().to_string()).collect();
                users.sort();
                users.dedup();
                acl.insert(name.clone(), users);
            }
        }

        let mut identities = HashMap::new();
        if let Some(section) = ini.section("uids") {
            for (name, value) in section {
                let (uid, gid) = value.split_once(':').ok_or_else(|| {
                    ArcError::Config(format!("[uids] {name} must be 'uid:gid'"))
                })?;
                let uid: u32 = uid
                    .trim()
                    .parse()
                    .map_err(|_| ArcError::Config(format!("[uids] {name} has a non-numeric uid")))?;
                let gid: u32 = gid
                    .trim()
                    .parse()
                    .map_err(|_| ArcError::Config(format!("[uids] {name} has a non-numeric gid")))?;
                identities.insert(name.clone(), (uid, gid));
            }
        }

        Ok(Self {
            service_name,
            timeout_seconds,
            log_level,
            log_destination,
            host,
            ports,
            pid_file,
            max_requests_per_worker,
            min_servers,
            max_servers,
            min_spare_servers,
            max_spare_servers,
            sasl_mechanisms,
            commands,
            acl,
            identities,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ArcError> {
        Self::from_ini(&Ini::load(path)?)
    }
}
