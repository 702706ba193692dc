//! Acquisition configuration: the typed tree, its defaults, the search
//! path, one-time config consumption and effective-config dumps.
//!
//! The file format is TOML; every group and field is optional in the file
//! and falls back to the defaults below, so a sparse config overlays a
//! default-initialized tree. The tree is only ever mutated by the main
//! thread while holding the config write lock.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::records::{NUM_LT_CHANNELS, NUM_RADIANT_CHANNELS};

/// Servo periods considered per channel.
pub const NUM_SERVO_PERIODS: usize = 3;

/// Config file name looked for along the search path.
pub const CONFIG_NAME: &str = "acq.cfg";
/// Environment variable contributing `$RNO_G_INSTALL_DIR/cfg` to the path.
pub const INSTALL_DIR_ENV: &str = "RNO_G_INSTALL_DIR";
/// Fixed last-resort config directory.
pub const SYSTEM_CONFIG_DIR: &str = "/rno-g/cfg";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AcqConfig {
    pub output: OutputConfig,
    pub runtime: RuntimeConfig,
    pub radiant: RadiantConfig,
    pub lt: LtConfig,
    pub calpulser: CalpulserConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub base_dir: PathBuf,
    pub runfile: PathBuf,
    /// Free-form operator comment, copied into `aux/comment.txt`.
    pub comment: String,
    pub daqstatus_interval: f32,
    pub seconds_per_run: u32,
    pub max_events_per_file: u32,
    pub max_daqstatuses_per_file: u32,
    pub max_seconds_per_file: u32,
    /// 0 disables the byte cap.
    pub max_kb_per_file: u32,
    pub min_free_space_mb: u32,
    pub print_interval: u32,
    pub allow_rundir_overwrite: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            base_dir: PathBuf::from("/data/daq"),
            runfile: PathBuf::from("/rno-g/var/runfile"),
            comment: String::new(),
            daqstatus_interval: 5.0,
            seconds_per_run: 7200,
            max_events_per_file: 100,
            max_daqstatuses_per_file: 100,
            max_seconds_per_file: 60,
            max_kb_per_file: 0,
            min_free_space_mb: 512,
            print_interval: 10,
            allow_rundir_overwrite: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub status_shmem_file: PathBuf,
    pub acq_buf_size: usize,
    pub mon_buf_size: usize,
    pub status_port: u16,
    /// Published health JSON, rewritten via tmp+rename.
    pub state_file: PathBuf,
    pub state_publish_interval: f32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            status_shmem_file: PathBuf::from("/rno-g/run/daqstatus.dat"),
            acq_buf_size: 256,
            mon_buf_size: 128,
            status_port: 1056,
            state_file: PathBuf::from("/rno-g/run/acq-state.json"),
            state_publish_interval: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RadiantConfig {
    pub device: RadiantDeviceConfig,
    pub pps: RadiantPpsConfig,
    pub scalers: RadiantScalersConfig,
    pub thresholds: RadiantThresholdsConfig,
    pub servo: RadiantServoConfig,
    pub trigger: RadiantTriggerConfig,
    pub readout: RadiantReadoutConfig,
    pub pedestals: PedestalsConfig,
    pub analog: AnalogConfig,
    pub bias_scan: BiasScanConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadiantDeviceConfig {
    pub spi_device: String,
    pub uart_device: String,
    pub poll_gpio: i32,
    pub spi_enable_gpio: i32,
    pub reset_script: String,
}

impl Default for RadiantDeviceConfig {
    fn default() -> Self {
        RadiantDeviceConfig {
            spi_device: "/dev/spidev0.0".into(),
            uart_device: "/dev/ttyRadiant".into(),
            poll_gpio: 46,
            spi_enable_gpio: -61,
            reset_script: "/rno-g/bin/reset-radiant".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadiantPpsConfig {
    pub use_internal: bool,
    pub sync_out: bool,
    pub pps_holdoff: u32,
}

impl Default for RadiantPpsConfig {
    fn default() -> Self {
        RadiantPpsConfig { use_internal: false, sync_out: false, pps_holdoff: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadiantScalersConfig {
    /// Use the PPS as the scaler gate; otherwise `period` is used.
    pub use_pps: bool,
    pub period: f32,
    pub prescal_m1: [u8; NUM_RADIANT_CHANNELS],
}

impl Default for RadiantScalersConfig {
    fn default() -> Self {
        RadiantScalersConfig {
            use_pps: true,
            period: 1.0,
            prescal_m1: [0; NUM_RADIANT_CHANNELS],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadiantThresholdsConfig {
    /// Recover thresholds from the shared status file when its image is
    /// usable; otherwise apply `initial`.
    pub load_from_shared_file: bool,
    /// Initial thresholds in volts.
    pub initial: [f32; NUM_RADIANT_CHANNELS],
    /// Servo clamp range, in volts.
    pub min: f32,
    pub max: f32,
}

impl Default for RadiantThresholdsConfig {
    fn default() -> Self {
        RadiantThresholdsConfig {
            load_from_shared_file: true,
            initial: [1.0; NUM_RADIANT_CHANNELS],
            min: 0.5,
            max: 1.45,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadiantServoConfig {
    pub enable: bool,
    pub scaler_update_interval: f32,
    pub servo_interval: f32,
    /// Scaler samples contributing to each of the three rolling periods.
    pub nscaler_periods_per_servo_period: [u32; NUM_SERVO_PERIODS],
    /// Weights of the periods; should sum to one for the goals to keep
    /// their units.
    pub period_weights: [f32; NUM_SERVO_PERIODS],
    pub scaler_goals: [f32; NUM_RADIANT_CHANNELS],
    /// Per-step threshold change clamp, in volts.
    pub max_thresh_change: f32,
    /// Clamp on the accumulated error sum.
    pub max_sum_err: f32,
    pub p: f32,
    pub i: f32,
    pub d: f32,
    /// Compare log10(offset + x) instead of raw rates.
    pub use_log: bool,
    pub log_offset: f32,
}

impl Default for RadiantServoConfig {
    fn default() -> Self {
        RadiantServoConfig {
            enable: true,
            scaler_update_interval: 0.5,
            servo_interval: 1.0,
            nscaler_periods_per_servo_period: [1, 2, 3],
            period_weights: [1.0, 0.0, 0.0],
            scaler_goals: [5.0; NUM_RADIANT_CHANNELS],
            max_thresh_change: 0.05,
            max_sum_err: 50.0,
            p: 0.5,
            i: 0.5,
            d: 0.0,
            use_log: false,
            log_offset: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftTriggerConfig {
    pub enabled: bool,
    pub use_exponential_distribution: bool,
    pub interval: f32,
    pub interval_jitter: f32,
    pub output_enabled: bool,
}

impl Default for SoftTriggerConfig {
    fn default() -> Self {
        SoftTriggerConfig {
            enabled: true,
            use_exponential_distribution: true,
            interval: 10.0,
            interval_jitter: 0.0,
            output_enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RfTriggerConfig {
    pub enabled: bool,
    pub mask: u32,
    /// Coincidence window in ns.
    pub window: f32,
    pub num_coincidences: u32,
}

impl Default for RfTriggerConfig {
    fn default() -> Self {
        RfTriggerConfig { enabled: false, mask: 0, window: 30.0, num_coincidences: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadiantTriggerConfig {
    pub clear_mode: bool,
    pub output_enabled: bool,
    pub soft: SoftTriggerConfig,
    pub ext: ExtTriggerConfig,
    pub pps: PpsTriggerConfig,
    pub rf0: RfTriggerConfig,
    pub rf1: RfTriggerConfig,
}

impl Default for RadiantTriggerConfig {
    fn default() -> Self {
        RadiantTriggerConfig {
            clear_mode: false,
            output_enabled: true,
            soft: SoftTriggerConfig::default(),
            ext: ExtTriggerConfig::default(),
            pps: PpsTriggerConfig::default(),
            rf0: RfTriggerConfig {
                enabled: true,
                mask: 0x1ff000,
                window: 30.0,
                num_coincidences: 3,
            },
            rf1: RfTriggerConfig {
                enabled: true,
                mask: 0xf,
                window: 20.0,
                num_coincidences: 2,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtTriggerConfig {
    pub enabled: bool,
}

impl Default for ExtTriggerConfig {
    fn default() -> Self {
        ExtTriggerConfig { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PpsTriggerConfig {
    pub enabled: bool,
    pub output_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadiantReadoutConfig {
    pub readout_mask: u32,
    /// 1024-sample buffers per readout; 1 or 2.
    pub nbuffers_per_readout: u32,
    /// Trigger-ready poll timeout in ms.
    pub poll_ms: u32,
}

impl Default for RadiantReadoutConfig {
    fn default() -> Self {
        RadiantReadoutConfig { readout_mask: 0xffffff, nbuffers_per_readout: 2, poll_ms: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PedestalsConfig {
    pub compute_at_start: bool,
    pub ntriggers_per_computation: u32,
    pub apply_attenuation: bool,
    pub attenuation: f32,
    pub pedestal_file: PathBuf,
    pub pedestal_subtract: bool,
}

impl Default for PedestalsConfig {
    fn default() -> Self {
        PedestalsConfig {
            compute_at_start: true,
            ntriggers_per_computation: 512,
            apply_attenuation: false,
            attenuation: 0.0,
            pedestal_file: PathBuf::from("/rno-g/var/peds.dat"),
            pedestal_subtract: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalogConfig {
    pub apply_lab4_vbias: bool,
    pub lab4_vbias: [f32; 2],
    pub apply_diode_vbias: bool,
    pub diode_vbias: [f32; NUM_RADIANT_CHANNELS],
    pub apply_attenuations: bool,
    pub digi_attenuation: [f32; NUM_RADIANT_CHANNELS],
    pub trig_attenuation: [f32; NUM_RADIANT_CHANNELS],
    /// Wait after setting analog parameters, in seconds.
    pub settle_time: f32,
}

impl Default for AnalogConfig {
    fn default() -> Self {
        AnalogConfig {
            apply_lab4_vbias: false,
            lab4_vbias: [1.5, 1.5],
            apply_diode_vbias: false,
            diode_vbias: [1.25; NUM_RADIANT_CHANNELS],
            apply_attenuations: false,
            digi_attenuation: [0.0; NUM_RADIANT_CHANNELS],
            trig_attenuation: [0.0; NUM_RADIANT_CHANNELS],
            settle_time: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiasScanConfig {
    pub enable: bool,
    /// Run the scan when `run_number % skip_runs == 0`.
    pub skip_runs: u32,
    pub start_vbias: f32,
    pub stop_vbias: f32,
    pub step_vbias: f32,
    pub navg_per_step: u32,
    pub sleep_ms: u32,
}

impl Default for BiasScanConfig {
    fn default() -> Self {
        BiasScanConfig {
            enable: false,
            skip_runs: 10,
            start_vbias: 0.5,
            stop_vbias: 2.5,
            step_vbias: 0.1,
            navg_per_step: 64,
            sleep_ms: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LtConfig {
    pub device: LtDeviceConfig,
    pub trigger: LtTriggerConfig,
    pub thresholds: LtThresholdsConfig,
    pub servo: LtServoConfig,
    pub gain: LtGainConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LtDeviceConfig {
    pub spi_device: String,
    pub spi_enable_gpio: i32,
    /// When set, failure to open the board is fatal (after a grace wait).
    pub required: bool,
}

impl Default for LtDeviceConfig {
    fn default() -> Self {
        LtDeviceConfig {
            spi_device: "/dev/spidev1.0".into(),
            spi_enable_gpio: 0,
            required: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LtTriggerConfig {
    pub enable: bool,
    pub vpp: u32,
    pub min_coincidence: u32,
    pub window: u32,
}

impl Default for LtTriggerConfig {
    fn default() -> Self {
        LtTriggerConfig { enable: true, vpp: 1, min_coincidence: 2, window: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LtThresholdsConfig {
    pub load_from_shared_file: bool,
    pub initial: [u8; NUM_LT_CHANNELS],
}

impl Default for LtThresholdsConfig {
    fn default() -> Self {
        LtThresholdsConfig { load_from_shared_file: true, initial: [30; NUM_LT_CHANNELS] }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LtServoConfig {
    pub enable: bool,
    pub subtract_gated: bool,
    pub scaler_goals: [f32; NUM_LT_CHANNELS],
    /// trigger = (servo - offset) / frac
    pub servo_thresh_frac: f32,
    pub servo_thresh_offset: f32,
    pub fast_scaler_weight: f32,
    pub slow_scaler_weight: f32,
    pub scaler_update_interval: f32,
    pub servo_interval: f32,
    pub p: f32,
    pub i: f32,
    pub d: f32,
    pub max_sum_err: f32,
}

impl Default for LtServoConfig {
    fn default() -> Self {
        LtServoConfig {
            enable: true,
            subtract_gated: true,
            scaler_goals: [30.0; NUM_LT_CHANNELS],
            servo_thresh_frac: 0.67,
            servo_thresh_offset: -10.0,
            fast_scaler_weight: 0.7,
            slow_scaler_weight: 0.3,
            scaler_update_interval: 0.5,
            servo_interval: 1.0,
            p: 0.5,
            i: 0.5,
            d: 0.0,
            max_sum_err: 50.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LtGainConfig {
    pub auto_gain: bool,
    pub target_rms: f32,
    pub fixed_gain_codes: [u8; NUM_LT_CHANNELS],
}

impl Default for LtGainConfig {
    fn default() -> Self {
        LtGainConfig { auto_gain: true, target_rms: 3.0, fixed_gain_codes: [5; NUM_LT_CHANNELS] }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalpulserKind {
    #[default]
    None,
    Baseband,
    Pulser,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalpulserConfig {
    pub kind: CalpulserKind,
    pub channel: u8,
    /// Fixed attenuation in dB when no sweep is active.
    pub attenuation: f32,
    pub sweep: CalpulserSweepConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalpulserSweepConfig {
    pub enable: bool,
    /// Sweep attenuation bounds and step, in dB.
    pub start_atten: f32,
    pub stop_atten: f32,
    pub step_atten: f32,
    /// Seconds spent at each attenuation step.
    pub step_time: f32,
}

impl Default for CalpulserSweepConfig {
    fn default() -> Self {
        CalpulserSweepConfig {
            enable: false,
            start_atten: 0.0,
            stop_atten: 31.5,
            step_atten: 0.5,
            step_time: 10.0,
        }
    }
}

impl AcqConfig {
    /// Parse a config file, overlaying the defaults.
    pub fn from_file(path: &Path) -> Result<AcqConfig, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Serialize the effective configuration.
    pub fn dump(&self) -> String {
        toml::to_string_pretty(self).expect("config tree serializes")
    }

    /// Write the effective configuration under a `.tmp` suffix and rename it
    /// into place.
    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        crate::rundir::write_atomic(path, self.dump().as_bytes())
    }
}

/// Where a config file was found, and whether it came from a one-time
/// directory (and must be marked used after loading).
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub path: PathBuf,
    pub once: bool,
}

/// Resolve the config along the search path: the caller-supplied path (file
/// or directory), then the working directory, then `$RNO_G_INSTALL_DIR/cfg`,
/// then `/rno-g/cfg`. Each location's `<name>.once/` directory wins over the
/// plain file.
pub fn find_config(arg: Option<&Path>) -> Option<ResolvedConfig> {
    if let Some(arg) = arg {
        if arg.is_dir() {
            return resolve_in_dir(arg);
        }
        return resolve_file(arg);
    }

    if let Some(found) = resolve_in_dir(Path::new(".")) {
        return Some(found);
    }

    if let Ok(install_dir) = std::env::var(INSTALL_DIR_ENV) {
        if let Some(found) = resolve_in_dir(&Path::new(&install_dir).join("cfg")) {
            return Some(found);
        }
    }

    resolve_in_dir(Path::new(SYSTEM_CONFIG_DIR))
}

fn resolve_in_dir(dir: &Path) -> Option<ResolvedConfig> {
    resolve_file(&dir.join(CONFIG_NAME))
}

fn resolve_file(file: &Path) -> Option<ResolvedConfig> {
    let mut once_dir = file.as_os_str().to_os_string();
    once_dir.push(".once");
    let once_dir = PathBuf::from(once_dir);

    if once_dir.is_dir() {
        if let Some(path) = earliest_once_file(&once_dir) {
            return Some(ResolvedConfig { path, once: true });
        }
    }

    if file.is_file() {
        return Some(ResolvedConfig { path: file.to_path_buf(), once: false });
    }
    None
}

/// Pick the unconsumed file with the earliest change timestamp.
fn earliest_once_file(dir: &Path) -> Option<PathBuf> {
    let mut best: Option<(i64, i64, PathBuf)> = None;
    for entry in fs::read_dir(dir).ok()? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name() else { continue };
        if name.to_string_lossy().contains(".used") {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let key = (meta.ctime(), meta.ctime_nsec());
        match &best {
            Some((s, ns, _)) if (*s, *ns) <= key => {}
            _ => best = Some((key.0, key.1, path)),
        }
    }
    best.map(|(_, _, p)| p)
}

/// Rename a consumed one-time config to `<name>.used`, appending a numeric
/// suffix if a previous consumption already claimed the name.
pub fn mark_once_used(path: &Path) -> std::io::Result<PathBuf> {
    let mut base = path.as_os_str().to_os_string();
    base.push(".used");
    let mut target = PathBuf::from(base.clone());
    let mut n = 0u32;
    while target.exists() {
        n += 1;
        let mut with_n = base.clone();
        with_n.push(format!(".{n}"));
        target = PathBuf::from(with_n);
    }
    fs::rename(path, &target)?;
    Ok(target)
}

/// Load the configuration, consuming a one-time file when that is what the
/// search found. Returns the defaults (with a warning) when nothing is
/// found; a later reload can still pick a file up.
pub fn load_config(arg: Option<&Path>) -> (AcqConfig, Option<ResolvedConfig>) {
    let Some(found) = find_config(arg) else {
        warn!("[config] no {} found along the search path, using defaults", CONFIG_NAME);
        return (AcqConfig::default(), None);
    };

    info!("[config] using {}", found.path.display());
    let cfg = match AcqConfig::from_file(&found.path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("[config] {}: {}, using defaults", found.path.display(), e);
            AcqConfig::default()
        }
    };

    if found.once {
        match mark_once_used(&found.path) {
            Ok(used) => info!("[config] consumed one-time config, now {}", used.display()),
            Err(e) => warn!("[config] could not archive one-time config: {}", e),
        }
    }

    (cfg, Some(found))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_sane() {
        let cfg = AcqConfig::default();
        assert_eq!(cfg.runtime.acq_buf_size, 256);
        assert_eq!(cfg.output.max_events_per_file, 100);
        assert!(cfg.radiant.servo.enable);
        assert_eq!(cfg.radiant.thresholds.initial[0], 1.0);
        assert_eq!(cfg.lt.servo.servo_thresh_frac, 0.67);
        assert_eq!(cfg.calpulser.kind, CalpulserKind::None);
    }

    #[test]
    fn sparse_file_overlays_defaults() {
        let text = r#"
[output]
seconds_per_run = 1
max_kb_per_file = 1

[runtime]
acq_buf_size = 4

[radiant.trigger.soft]
enabled = false
"#;
        let cfg: AcqConfig = toml::from_str(text).unwrap();
        assert_eq!(cfg.output.seconds_per_run, 1);
        assert_eq!(cfg.output.max_kb_per_file, 1);
        assert_eq!(cfg.runtime.acq_buf_size, 4);
        assert!(!cfg.radiant.trigger.soft.enabled);
        // untouched groups keep their defaults
        assert_eq!(cfg.output.max_events_per_file, 100);
        assert!(cfg.radiant.servo.enable);
    }

    #[test]
    fn dump_round_trips() {
        let mut cfg = AcqConfig::default();
        cfg.radiant.thresholds.initial[0] = 1.2;
        cfg.lt.device.required = true;
        let text = cfg.dump();
        let back: AcqConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn finds_config_in_directory_argument() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_NAME);
        fs::write(&path, "").unwrap();
        let found = find_config(Some(dir.path())).unwrap();
        assert_eq!(found, ResolvedConfig { path, once: false });
    }

    #[test]
    fn missing_config_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let (cfg, found) = load_config(Some(&dir.path().join("nope.cfg")));
        assert!(found.is_none());
        assert_eq!(cfg, AcqConfig::default());
    }

    #[test]
    fn once_dir_wins_and_consumes_in_ctime_order() {
        let dir = TempDir::new().unwrap();
        let main_cfg = dir.path().join(CONFIG_NAME);
        fs::write(&main_cfg, "").unwrap();

        let once = dir.path().join(format!("{CONFIG_NAME}.once"));
        fs::create_dir(&once).unwrap();
        fs::write(once.join("a.cfg"), "[output]\nseconds_per_run = 11\n").unwrap();
        sleep(Duration::from_millis(20));
        fs::write(once.join("b.cfg"), "[output]\nseconds_per_run = 22\n").unwrap();

        let (cfg, found) = load_config(Some(&main_cfg));
        let found = found.unwrap();
        assert!(found.once);
        assert_eq!(found.path, once.join("a.cfg"));
        assert_eq!(cfg.output.seconds_per_run, 11);
        assert!(once.join("a.cfg.used").exists());
        assert!(once.join("b.cfg").exists());

        // second start consumes b.cfg
        let (cfg, found) = load_config(Some(&main_cfg));
        assert_eq!(found.unwrap().path, once.join("b.cfg"));
        assert_eq!(cfg.output.seconds_per_run, 22);
        assert!(once.join("b.cfg.used").exists());

        // once dir exhausted, plain file wins again
        let (_, found) = load_config(Some(&main_cfg));
        assert_eq!(found.unwrap(), ResolvedConfig { path: main_cfg, once: false });
    }

    #[test]
    fn used_names_get_unique_suffixes() {
        let dir = TempDir::new().unwrap();
        let f = dir.path().join("x.cfg");
        fs::write(&f, "").unwrap();
        fs::write(dir.path().join("x.cfg.used"), "").unwrap();
        let target = mark_once_used(&f).unwrap();
        assert_eq!(target, dir.path().join("x.cfg.used.1"));
    }
}
