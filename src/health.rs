//! Published daemon health: a structured record and its cached JSON form,
//! each behind its own reader/writer lock so the status server never holds
//! the record lock while sending.
//!
//! The writer thread owns the updates; system metrics (memory, load,
//! process count, uptime) are refreshed on each update.

use std::io;
use std::path::Path;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sysinfo::{ProcessesToUpdate, System};

use crate::rundir::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DaqState {
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub state: DaqState,
    pub run_start: u64,
    pub sys_last_updated: u64,
    pub event_last_updated: u64,
    pub current_run: u32,
    pub num_events: u64,
    pub num_last_cycle: u64,
    pub last_cycle_length: f32,
    pub num_force_events: u64,
    pub free_space_output_mb: u64,
    pub free_space_runfile_mb: u64,
    pub mem_total_kb: u64,
    pub mem_available_kb: u64,
    pub load_avg: [f64; 3],
    pub num_processes: usize,
    pub uptime_secs: u64,
}

impl Default for HealthRecord {
    fn default() -> Self {
        HealthRecord {
            state: DaqState::Starting,
            run_start: 0,
            sys_last_updated: 0,
            event_last_updated: 0,
            current_run: 0,
            num_events: 0,
            num_last_cycle: 0,
            last_cycle_length: 0.0,
            num_force_events: 0,
            free_space_output_mb: 0,
            free_space_runfile_mb: 0,
            mem_total_kb: 0,
            mem_available_kb: 0,
            load_avg: [0.0; 3],
            num_processes: 0,
            uptime_secs: 0,
        }
    }
}

pub struct Health {
    record: RwLock<HealthRecord>,
    text: RwLock<String>,
    sys: Mutex<System>,
}

impl Default for Health {
    fn default() -> Self {
        Health::new()
    }
}

impl Health {
    pub fn new() -> Health {
        let health = Health {
            record: RwLock::new(HealthRecord::default()),
            text: RwLock::new(String::new()),
            sys: Mutex::new(System::new()),
        };
        health.update(|_| {});
        health
    }

    /// Apply `f` to the record, refresh the system metrics, and re-cache the
    /// JSON text.
    pub fn update<F: FnOnce(&mut HealthRecord)>(&self, f: F) {
        let json = {
            let mut record = self.record.write();
            f(&mut record);
            self.refresh_system(&mut record);
            serde_json::to_string(&*record).expect("health record serializes")
        };
        *self.text.write() = json;
    }

    fn refresh_system(&self, record: &mut HealthRecord) {
        let mut sys = self.sys.lock();
        sys.refresh_memory();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        record.mem_total_kb = sys.total_memory() / 1024;
        record.mem_available_kb = sys.available_memory() / 1024;
        record.num_processes = sys.processes().len();
        let load = System::load_average();
        record.load_avg = [load.one, load.five, load.fifteen];
        record.uptime_secs = System::uptime();
    }

    /// A copy of the current record.
    pub fn snapshot(&self) -> HealthRecord {
        self.record.read().clone()
    }

    /// The cached JSON text, as served by the status endpoint.
    pub fn json(&self) -> String {
        self.text.read().clone()
    }

    /// Rewrite the published state file via tmp + rename.
    pub fn publish(&self, path: &Path) -> io::Result<()> {
        let text = self.json();
        write_atomic(path, text.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn update_refreshes_json_cache() {
        let health = Health::new();
        health.update(|r| {
            r.state = DaqState::Running;
            r.current_run = 123;
            r.num_events = 7;
        });
        let json = health.json();
        assert!(json.contains("\"state\":\"running\""));
        assert!(json.contains("\"current_run\":123"));
        assert!(json.contains("\"num_events\":7"));
    }

    #[test]
    fn system_metrics_are_populated() {
        let health = Health::new();
        let rec = health.snapshot();
        assert!(rec.mem_total_kb > 0);
        assert!(rec.num_processes > 0);
    }

    #[test]
    fn publish_writes_parseable_json_atomically() {
        let health = Health::new();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        health.publish(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(v.get("uptime_secs").is_some());
        assert!(!dir.path().join("state.json.tmp").exists());
    }
}
