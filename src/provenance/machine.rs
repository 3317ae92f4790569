//! Description of the machine a computation ran on

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Machine description persisted with every remote execution.
///
/// Field names and types are part of the log format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    /// Host name
    pub name: String,

    /// Operating system
    pub os: String,

    /// Pointer width: 32 or 64
    pub architecture: u8,

    /// Processor brand, "n/a" when unavailable
    pub processor: String,

    /// Total memory in bytes, 0 when unknown
    pub ram: u64,
}

impl MachineInfo {
    /// Description of the current machine, gathered once per process
    pub fn current() -> Self {
        static CURRENT: OnceLock<MachineInfo> = OnceLock::new();
        CURRENT.get_or_init(Self::from_system).clone()
    }

    /// Gather info from the current system
    pub fn from_system() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_all();

        let processor = system
            .cpus()
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .filter(|brand| !brand.is_empty())
            .unwrap_or_else(|| "n/a".to_string());

        Self {
            name: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_string()),
            os: std::env::consts::OS.to_string(),
            architecture: if cfg!(target_pointer_width = "64") { 64 } else { 32 },
            processor,
            ram: system.total_memory(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_info_from_system() {
        let info = MachineInfo::from_system();
        assert!(!info.name.is_empty());
        assert!(!info.os.is_empty());
        assert!(info.architecture == 32 || info.architecture == 64);
        assert!(!info.processor.is_empty());
    }

    #[test]
    fn test_current_is_stable() {
        assert_eq!(MachineInfo::current(), MachineInfo::current());
    }

    #[test]
    fn test_log_format_fields() {
        let info = MachineInfo {
            name: "worker-1".to_string(),
            os: "linux".to_string(),
            architecture: 64,
            processor: "n/a".to_string(),
            ram: 0,
        };
        let encoded = serde_json::to_value(&info).unwrap();
        let mut keys: Vec<&str> = encoded
            .as_object()
            .unwrap()
            .keys()
            .map(|k| k.as_str())
            .collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["architecture", "name", "os", "processor", "ram"]);
    }
}
