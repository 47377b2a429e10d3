//! The immutable, validated description of one supervised program (spec §3).

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

/// How a program should be restarted after an instance exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoRestart {
    Always,
    Never,
    Unexpected,
}

impl Default for AutoRestart {
    fn default() -> Self {
        AutoRestart::Unexpected
    }
}

impl AutoRestart {
    /// Parses the config value, accepting the enum's canonical spelling plus
    /// the legacy boolean aliases documented in spec §9 note 1.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "always" | "true" => Some(AutoRestart::Always),
            "never" | "false" => Some(AutoRestart::Never),
            "unexpected" => Some(AutoRestart::Unexpected),
            _ => None,
        }
    }
}

/// A signal usable as a program's `stopsignal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Term,
    Hup,
    Int,
    Usr1,
    Usr2,
    Quit,
    Kill,
}

impl Default for StopSignal {
    fn default() -> Self {
        StopSignal::Term
    }
}

impl StopSignal {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "TERM" => Some(StopSignal::Term),
            "HUP" => Some(StopSignal::Hup),
            "INT" => Some(StopSignal::Int),
            "USR1" => Some(StopSignal::Usr1),
            "USR2" => Some(StopSignal::Usr2),
            "QUIT" => Some(StopSignal::Quit),
            "KILL" => Some(StopSignal::Kill),
            _ => None,
        }
    }

    pub fn as_libc(self) -> libc::c_int {
        match self {
            StopSignal::Term => libc::SIGTERM,
            StopSignal::Hup => libc::SIGHUP,
            StopSignal::Int => libc::SIGINT,
            StopSignal::Usr1 => libc::SIGUSR1,
            StopSignal::Usr2 => libc::SIGUSR2,
            StopSignal::Quit => libc::SIGQUIT,
            StopSignal::Kill => libc::SIGKILL,
        }
    }
}

/// Immutable, validated description of one program (spec §3).
///
/// `PartialEq`/`Eq` drive the reload diff in the registry: two descriptors
/// that compare equal are never restarted (spec §9 note 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramDescriptor {
    pub name: String,
    pub cmd: String,
    pub numprocs: u32,
    pub umask: u32,
    pub workingdir: PathBuf,
    pub autostart: bool,
    pub autorestart: AutoRestart,
    pub exitcodes: BTreeSet<i32>,
    pub startretries: u32,
    pub starttime: u64,
    pub stopsignal: StopSignal,
    pub stoptime: u64,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl ProgramDescriptor {
    /// The output sink path for a given instance index, suffixed with
    /// `.<index>` when the program runs more than one instance (spec §6).
    pub fn stdout_path(&self, index: u32) -> Option<PathBuf> {
        suffixed(&self.stdout, index, self.numprocs)
    }

    pub fn stderr_path(&self, index: u32) -> Option<PathBuf> {
        suffixed(&self.stderr, index, self.numprocs)
    }
}

fn suffixed(path: &Option<PathBuf>, index: u32, numprocs: u32) -> Option<PathBuf> {
    path.as_ref().map(|p| {
        if numprocs > 1 {
            let mut os = p.clone().into_os_string();
            os.push(format!(".{index}"));
            PathBuf::from(os)
        } else {
            p.clone()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autorestart_accepts_legacy_bool_aliases() {
        assert_eq!(AutoRestart::parse("always"), Some(AutoRestart::Always));
        assert_eq!(AutoRestart::parse("TRUE"), Some(AutoRestart::Always));
        assert_eq!(AutoRestart::parse("never"), Some(AutoRestart::Never));
        assert_eq!(AutoRestart::parse("false"), Some(AutoRestart::Never));
        assert_eq!(AutoRestart::parse("unexpected"), Some(AutoRestart::Unexpected));
        assert_eq!(AutoRestart::parse("garbage"), None);
    }

    #[test]
    fn stopsignal_parses_case_insensitively() {
        assert_eq!(StopSignal::parse("term"), Some(StopSignal::Term));
        assert_eq!(StopSignal::parse("KILL"), Some(StopSignal::Kill));
        assert_eq!(StopSignal::parse("sigterm"), None);
    }

    fn base_descriptor() -> ProgramDescriptor {
        ProgramDescriptor {
            name: "a".into(),
            cmd: "true".into(),
            numprocs: 1,
            umask: 0o022,
            workingdir: PathBuf::from("/tmp"),
            autostart: true,
            autorestart: AutoRestart::default(),
            exitcodes: BTreeSet::from([0]),
            startretries: 3,
            starttime: 5,
            stopsignal: StopSignal::default(),
            stoptime: 10,
            stdout: Some(PathBuf::from("/var/log/a.log")),
            stderr: None,
            env: HashMap::new(),
        }
    }

    #[test]
    fn single_instance_programs_are_not_suffixed() {
        let d = base_descriptor();
        assert_eq!(d.stdout_path(0).unwrap(), PathBuf::from("/var/log/a.log"));
    }

    #[test]
    fn multi_instance_programs_get_index_suffix() {
        let mut d = base_descriptor();
        d.numprocs = 3;
        assert_eq!(d.stdout_path(0).unwrap(), PathBuf::from("/var/log/a.log.0"));
        assert_eq!(d.stdout_path(2).unwrap(), PathBuf::from("/var/log/a.log.2"));
        assert_eq!(d.stderr_path(0), None);
    }
}
