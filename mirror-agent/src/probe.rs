//! Source application detection through the process table.

use mirror_engine::ports::ProcessProbe;
use std::ffi::OsStr;
use std::sync::{Mutex, PoisonError};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

/// Reports whether a process with exactly the configured name is running.
pub struct SysinfoProcessProbe {
    name: String,
    system: Mutex<System>,
}

impl SysinfoProcessProbe {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system: Mutex::new(System::new()),
        }
    }
}

impl ProcessProbe for SysinfoProcessProbe {
    fn is_running(&self) -> bool {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::nothing());

        let running = system.processes_by_exact_name(OsStr::new(&self.name)).next().is_some();
        running
    }
}
