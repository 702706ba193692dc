//! Shared runtime state and the main thread's jobs: setup, signal
//! handling, configuration reload, run-duration and disk-space
//! enforcement, and teardown.
//!
//! Locking discipline:
//! - `cfg` is read-locked by every worker while consuming any field and
//!   write-locked only here, during reload.
//! - `radiant` / `flower` are read-locked for operation (acquire uses the
//!   SPI path, monitor the UART path, so concurrent readers are fine) and
//!   write-locked for reconfiguration.
//! - `ds` is the authoritative status snapshot; the monitor writes it,
//!   everyone else takes short read locks.
//!
//! Threads are joined acquire → monitor → writer; the status server exits
//! on the same quit flag within its one-second accept poll.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, bail};
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::arena::Arena;
use crate::buf;
use crate::config::{self, AcqConfig, CalpulserConfig, CalpulserKind, ResolvedConfig};
use crate::device::radiant::{
    AttenPath, TRIG_EN, TRIG_EXT, TRIG_PPS, TRIGOUT_EN, TRIGOUT_PPS, TRIGOUT_SOFT,
};
use crate::device::{DeviceError, Flower, Radiant};
use crate::health::{DaqState, Health};
use crate::pipeline::{self, EventArena};
use crate::records::{
    CalpulserInfo, DaqStatus, NUM_LT_CHANNELS, NUM_RADIANT_CHANNELS, Pedestal, volts_to_dac,
};
use crate::rundir::{self, RunDirs};
use crate::serve::{Handler, HttpServer, Response, ResponseCode};
use crate::servo::{LT_THRESH_MAX, LT_THRESH_MIN};
use crate::status::{PedestalFile, StatusFile};
use crate::watchdog::Watchdog;

/// Station identifier lives at this fixed path.
pub const STATION_ID_FILE: &str = "/STATION_ID";

const RADIANT_OPEN_RETRIES: u32 = 3;
const RADIANT_OPEN_RETRY_WAIT: Duration = Duration::from_secs(1);
const FLOWER_REQUIRED_GRACE: Duration = Duration::from_secs(20);
const FREE_SPACE_POLL: Duration = Duration::from_secs(20);
const MAIN_LOOP_SLEEP: Duration = Duration::from_millis(500);

static SIG_QUIT: AtomicBool = AtomicBool::new(false);
static SIG_REREAD: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(sig: i32) {
    if sig == libc::SIGUSR1 {
        SIG_REREAD.store(true, Ordering::Release);
    } else {
        SIG_QUIT.store(true, Ordering::Release);
    }
}

/// SIGINT/SIGTERM request graceful shutdown, SIGUSR1 a config reread.
pub fn install_signal_handlers() -> anyhow::Result<()> {
    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGUSR1] {
        unsafe { sigaction(sig, &action) }.with_context(|| format!("installing {sig}"))?;
    }
    Ok(())
}

/// Calibration-pulser runtime state, advanced by the monitor thread during
/// sweeps.
#[derive(Debug, Clone)]
pub struct CalpulserState {
    pub kind: CalpulserKind,
    pub channel: u8,
    pub attenuation_db: f32,
    pub sweeping: bool,
}

impl CalpulserState {
    pub fn from_config(cfg: &CalpulserConfig) -> CalpulserState {
        let sweeping = cfg.sweep.enable && cfg.kind != CalpulserKind::None;
        CalpulserState {
            kind: cfg.kind,
            channel: cfg.channel,
            attenuation_db: if sweeping { cfg.sweep.start_atten } else { cfg.attenuation },
            sweeping,
        }
    }

    pub fn info(&self) -> CalpulserInfo {
        CalpulserInfo {
            kind: match self.kind {
                CalpulserKind::None => 0,
                CalpulserKind::Baseband => 1,
                CalpulserKind::Pulser => 2,
            },
            channel: self.channel,
            sweeping: self.sweeping as u8,
            attenuation_db: self.attenuation_db,
        }
    }
}

pub struct Daq {
    pub cfg: RwLock<AcqConfig>,
    /// Bumped on every reload; the monitor rebuilds servo state when it
    /// observes a change.
    pub cfg_generation: AtomicU64,
    pub radiant: RwLock<Radiant>,
    pub flower: RwLock<Option<Flower>>,
    /// Authoritative status snapshot.
    pub ds: RwLock<DaqStatus>,
    pub status_file: Mutex<Option<StatusFile>>,
    pub pedestal_file: Mutex<Option<PedestalFile>>,
    pub health: Health,
    pub watchdog: Watchdog,
    pub run: RunDirs,
    pub station: u16,
    pub run_start_wall: u64,
    pub quit: Arc<AtomicBool>,
    /// Test hook: while set, the writer leaves both queues alone.
    pub writer_hold: AtomicBool,
    pub num_force_triggers: AtomicU64,
    pub num_events_written: AtomicU64,
    pub calpulser: Mutex<CalpulserState>,
    pub pedestals: Option<Box<Pedestal>>,
    pub bias_scan: Vec<Pedestal>,
    pub gain_codes: Option<[u8; NUM_LT_CHANNELS]>,
    config_arg: Option<std::path::PathBuf>,
}

impl Daq {
    pub fn request_stop(&self) {
        if !self.quit.swap(true, Ordering::AcqRel) {
            info!("[daq] stop requested");
        }
    }

    /// Reload the configuration: parse first (a broken file leaves the
    /// previous record in effect), swap under the write lock, dump the
    /// effective record into the run's cfg directory, and reconfigure the
    /// subsystems whose subtrees changed.
    pub fn reload_config(&self) {
        let found = config::find_config(self.config_arg.as_deref());
        let Some(ResolvedConfig { path, once }) = found else {
            warn!("[daq] reread requested but no config found; keeping current");
            return;
        };
        let new_cfg = match AcqConfig::from_file(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("[daq] reread of {} failed ({}); keeping current", path.display(), e);
                return;
            }
        };
        if once {
            if let Err(e) = config::mark_once_used(&path) {
                warn!("[daq] could not archive one-time config: {}", e);
            }
        }
        info!("[daq] rereading config from {}", path.display());

        let snapshot = {
            let mut cfg = self.cfg.write();
            let snapshot = cfg.clone();
            *cfg = new_cfg.clone();
            snapshot
        };
        let generation = self.cfg_generation.fetch_add(1, Ordering::AcqRel) + 1;

        let ts = wall_secs();
        let dump = self.run.cfg().join(format!("acq.{generation}.{ts}.cfg"));
        if let Err(e) = new_cfg.write_to(&dump) {
            warn!("[daq] could not dump reloaded config: {}", e);
        }

        if snapshot.radiant != new_cfg.radiant {
            info!("[daq] radiant subtree changed, reconfiguring");
            let radiant = self.radiant.write();
            let cfg = self.cfg.read();
            if let Err(e) = radiant_configure(&radiant, &cfg) {
                error!("[daq] radiant reconfigure failed: {}", e);
            }
            if snapshot.radiant.thresholds != new_cfg.radiant.thresholds {
                let mut ds = self.ds.write();
                for (dac, v) in ds
                    .radiant_thresholds
                    .iter_mut()
                    .zip(cfg.radiant.thresholds.initial.iter())
                {
                    *dac = volts_to_dac(*v as f64);
                }
                radiant.set_trigger_thresholds(&ds.radiant_thresholds);
            }
        }

        if snapshot.lt != new_cfg.lt {
            info!("[daq] lt subtree changed, reconfiguring");
            let flower = self.flower.write();
            let cfg = self.cfg.read();
            if let Some(fl) = flower.as_ref() {
                if let Err(e) = flower_configure(fl, &cfg) {
                    error!("[daq] flower reconfigure failed: {}", e);
                }
                if snapshot.lt.thresholds != new_cfg.lt.thresholds {
                    let mut ds = self.ds.write();
                    init_lt_thresholds(&cfg, &mut ds);
                    fl.set_thresholds(&ds.lt_trigger_thresholds, &ds.lt_servo_thresholds, 0xf);
                }
            }
        }

        if snapshot.calpulser != new_cfg.calpulser {
            info!("[daq] calpulser subtree changed, reconfiguring");
            let cfg = self.cfg.read();
            *self.calpulser.lock() = CalpulserState::from_config(&cfg.calpulser);
        }
    }
}

/// Apply the full trigger/scaler/PPS configuration to the RADIANT. Callers
/// hold the device lock (write for reconfiguration) and the config read
/// lock.
pub fn radiant_configure(radiant: &Radiant, cfg: &AcqConfig) -> Result<(), DeviceError> {
    let r = &cfg.radiant;
    radiant.set_pps_config(r.pps.use_internal, r.pps.sync_out, r.pps.pps_holdoff);
    radiant.set_scaler_period(if r.scalers.use_pps { 0.0 } else { r.scalers.period });
    for (chan, prescal) in r.scalers.prescal_m1.iter().enumerate() {
        radiant.set_prescaler(chan, *prescal);
    }

    let global_mask = (if r.trigger.rf0.enabled { r.trigger.rf0.mask } else { 0 })
        | (if r.trigger.rf1.enabled { r.trigger.rf1.mask } else { 0 });
    radiant.set_global_trigger_mask(global_mask);
    radiant.configure_rf_trigger(0, &r.trigger.rf0)?;
    radiant.configure_rf_trigger(1, &r.trigger.rf1)?;

    // labs must run before the enables latch
    radiant.labs_start();
    let mut enables = TRIG_EN;
    if r.trigger.output_enabled {
        enables |= TRIGOUT_EN;
    }
    if r.trigger.ext.enabled {
        enables |= TRIG_EXT;
    }
    if r.trigger.pps.enabled {
        enables |= TRIG_PPS;
        if r.trigger.pps.output_enabled {
            enables |= TRIGOUT_PPS;
        }
    }
    if r.trigger.soft.output_enabled {
        enables |= TRIGOUT_SOFT;
    }
    radiant.set_trigger_enables(enables);
    Ok(())
}

/// Apply the trigger configuration to the FLOWER.
pub fn flower_configure(flower: &Flower, cfg: &AcqConfig) -> Result<(), DeviceError> {
    flower.configure_trigger(&cfg.lt.trigger)
}

fn wall_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn bias_volts_to_dac(v: f32) -> u32 {
    (v / 3.3 * 4095.0).clamp(0.0, 4095.0) as u32
}

/// Drop the kernel page cache; SPI opens on the target fail spuriously
/// under memory pressure and this clears the decks between retries.
fn drop_page_caches() {
    unsafe { libc::sync() };
    if let Err(e) = fs::write("/proc/sys/vm/drop_caches", "3") {
        log::debug!("[daq] could not drop page caches: {}", e);
    }
}

fn open_radiant_with_retry(cfg: &AcqConfig) -> Result<Radiant, DeviceError> {
    let mut last = None;
    for attempt in 1..=RADIANT_OPEN_RETRIES {
        match Radiant::open(&cfg.radiant.device) {
            Ok(radiant) => return Ok(radiant),
            Err(e) => {
                warn!("[daq] radiant open attempt {}/{} failed: {}", attempt, RADIANT_OPEN_RETRIES, e);
                last = Some(e);
                if attempt < RADIANT_OPEN_RETRIES {
                    drop_page_caches();
                    thread::sleep(RADIANT_OPEN_RETRY_WAIT);
                }
            }
        }
    }
    Err(last.expect("at least one attempt"))
}

fn open_flower(cfg: &AcqConfig) -> anyhow::Result<Option<Flower>> {
    match Flower::open(&cfg.lt.device) {
        Ok(flower) => Ok(Some(flower)),
        Err(e) if cfg.lt.device.required => {
            error!("[daq] required flower failed to open: {}", e);
            thread::sleep(FLOWER_REQUIRED_GRACE);
            bail!("required flower unavailable: {e}");
        }
        Err(e) => {
            warn!("[daq] proceeding without flower: {}", e);
            Ok(None)
        }
    }
}

/// Seed the LT threshold pair from the configured initial trigger
/// thresholds.
fn init_lt_thresholds(cfg: &AcqConfig, ds: &mut DaqStatus) {
    for chan in 0..NUM_LT_CHANNELS {
        let trigger = cfg.lt.thresholds.initial[chan];
        ds.lt_trigger_thresholds[chan] = trigger;
        let servo = (trigger as f64 * cfg.lt.servo.servo_thresh_frac as f64
            + cfg.lt.servo.servo_thresh_offset as f64)
            .clamp(LT_THRESH_MIN, LT_THRESH_MAX);
        ds.lt_servo_thresholds[chan] = servo.round() as u8;
    }
}

pub struct DaqRuntime {
    pub daq: Arc<Daq>,
    pub serve_port: u16,
    acquire: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    serve: Option<JoinHandle<usize>>,
    started: Instant,
}

/// Full setup per the startup sequence: config, disk space, station and run
/// number, devices, calibration, shared status, queues and threads.
pub fn start(config_arg: Option<&Path>) -> anyhow::Result<DaqRuntime> {
    let (cfg, _found) = config::load_config(config_arg);
    let watchdog = Watchdog::from_env();

    // Low space before the run starts is a wait, never an exit.
    fs::create_dir_all(&cfg.output.base_dir)
        .with_context(|| format!("creating {}", cfg.output.base_dir.display()))?;
    let runfile_dir = cfg.output.runfile.parent().unwrap_or(Path::new("/")).to_path_buf();
    let _ = fs::create_dir_all(&runfile_dir);
    while cfg.output.min_free_space_mb > 0 && !SIG_QUIT.load(Ordering::Acquire) {
        let out_free = rundir::free_space_mb(&cfg.output.base_dir).unwrap_or(0);
        let run_free = rundir::free_space_mb(&runfile_dir).unwrap_or(0);
        if out_free >= cfg.output.min_free_space_mb as u64
            && run_free >= cfg.output.min_free_space_mb as u64
        {
            break;
        }
        warn!(
            "[daq] waiting for free space (output {} MB, runfile {} MB, need {} MB)",
            out_free, run_free, cfg.output.min_free_space_mb
        );
        watchdog.feed();
        thread::sleep(FREE_SPACE_POLL);
    }
    if SIG_QUIT.load(Ordering::Acquire) {
        bail!("shutdown requested during free-space wait");
    }

    let station = rundir::read_station_id(Path::new(STATION_ID_FILE));
    let run = rundir::next_run(
        &cfg.output.runfile,
        &cfg.output.base_dir,
        cfg.output.allow_rundir_overwrite,
    )?;

    let radiant = open_radiant_with_retry(&cfg).context("opening radiant")?;
    radiant.labs_stop();

    // analog settling before anything samples
    let analog = &cfg.radiant.analog;
    let mut settle = false;
    if analog.apply_lab4_vbias {
        radiant.set_dc_bias(
            bias_volts_to_dac(analog.lab4_vbias[0]),
            bias_volts_to_dac(analog.lab4_vbias[1]),
        );
        settle = true;
    }
    if analog.apply_diode_vbias {
        for (chan, v) in analog.diode_vbias.iter().enumerate() {
            radiant.set_td_bias(chan, (v / 2.0 * 4095.0) as u32);
        }
        settle = true;
    }
    if settle {
        thread::sleep(Duration::from_secs_f32(analog.settle_time.max(0.0)));
    }

    let bias_scan = run_bias_scan_if_due(&radiant, &cfg, run.run_number)?;

    let (pedestal_file, pedestals) = setup_pedestals(&radiant, &cfg, station)?;

    if analog.apply_attenuations {
        for chan in 0..NUM_RADIANT_CHANNELS {
            radiant.set_attenuator(chan, AttenPath::Signal, (analog.digi_attenuation[chan] * 4.0) as u32)?;
            radiant.set_attenuator(chan, AttenPath::Trigger, (analog.trig_attenuation[chan] * 4.0) as u32)?;
        }
    }

    radiant.reset_counters();
    radiant.set_nbuffers_per_readout(cfg.radiant.readout.nbuffers_per_readout);
    radiant.dma_setup_event(cfg.radiant.readout.readout_mask);
    radiant_configure(&radiant, &cfg).context("configuring radiant")?;

    let flower = open_flower(&cfg)?;
    let mut gain_codes = None;
    if let Some(fl) = &flower {
        flower_configure(fl, &cfg).context("configuring flower")?;
        gain_codes = Some(if cfg.lt.gain.auto_gain {
            fl.auto_gain(cfg.lt.gain.target_rms)
        } else {
            fl.set_gain_codes(&cfg.lt.gain.fixed_gain_codes);
            fl.gain_codes()
        });
    }

    // shared status: recover prior thresholds when permitted
    let (status_file, prior) = match StatusFile::open(&cfg.runtime.status_shmem_file) {
        Ok((sf, prior)) => (Some(sf), prior),
        Err(e) => {
            warn!(
                "[daq] no shared status at {} ({}); continuing without",
                cfg.runtime.status_shmem_file.display(),
                e
            );
            (None, None)
        }
    };

    let mut ds = DaqStatus::default();
    ds.station = station;
    match prior {
        Some(prior) if cfg.radiant.thresholds.load_from_shared_file => {
            ds.radiant_thresholds = prior.radiant_thresholds;
        }
        _ => {
            for (dac, v) in ds
                .radiant_thresholds
                .iter_mut()
                .zip(cfg.radiant.thresholds.initial.iter())
            {
                *dac = volts_to_dac(*v as f64);
            }
        }
    }
    match prior {
        Some(prior) if cfg.lt.thresholds.load_from_shared_file => {
            ds.lt_trigger_thresholds = prior.lt_trigger_thresholds;
            ds.lt_servo_thresholds = prior.lt_servo_thresholds;
        }
        _ => init_lt_thresholds(&cfg, &mut ds),
    }
    radiant.set_trigger_thresholds(&ds.radiant_thresholds);
    if let Some(fl) = &flower {
        fl.set_thresholds(&ds.lt_trigger_thresholds, &ds.lt_servo_thresholds, 0xf);
    }

    let quit = Arc::new(AtomicBool::new(false));
    let calpulser = CalpulserState::from_config(&cfg.calpulser);
    let run_start_wall = wall_secs();

    let acq_buf_size = cfg.runtime.acq_buf_size.max(1);
    let mon_buf_size = cfg.runtime.mon_buf_size.max(1);
    let status_port = cfg.runtime.status_port;

    let daq = Arc::new(Daq {
        cfg: RwLock::new(cfg),
        cfg_generation: AtomicU64::new(0),
        radiant: RwLock::new(radiant),
        flower: RwLock::new(flower),
        ds: RwLock::new(ds),
        status_file: Mutex::new(status_file),
        pedestal_file: Mutex::new(pedestal_file),
        health: Health::new(),
        watchdog,
        run,
        station,
        run_start_wall,
        quit: quit.clone(),
        writer_hold: AtomicBool::new(false),
        num_force_triggers: AtomicU64::new(0),
        num_events_written: AtomicU64::new(0),
        calpulser: Mutex::new(calpulser),
        pedestals,
        bias_scan,
        gain_codes,
        config_arg: config_arg.map(Path::to_path_buf),
    });

    daq.health.update(|h| {
        h.state = DaqState::Running;
        h.run_start = run_start_wall;
        h.current_run = daq.run.run_number;
    });

    // queues and workers; the arena keeps one spare buffer beyond the ring
    // so the producer can stage an event while the ring is full
    let arena: Arc<EventArena> = Arc::new(Arena::new("acq", acq_buf_size + 1));
    let (ev_tx, ev_rx) = buf::spsc::<u32>("acq", acq_buf_size);
    let (mon_tx, mon_rx) = buf::spsc::<DaqStatus>("mon", mon_buf_size);

    let acquire = {
        let daq = daq.clone();
        let arena = arena.clone();
        thread::spawn(move || pipeline::acquire::run(daq, arena, ev_tx))
    };
    let monitor = {
        let daq = daq.clone();
        thread::spawn(move || pipeline::monitor::run(daq, mon_tx))
    };
    let writer = {
        let daq = daq.clone();
        let arena = arena.clone();
        thread::spawn(move || pipeline::writer::run(daq, arena, ev_rx, mon_rx))
    };

    let server = HttpServer::bind(status_port).context("binding status port")?;
    let serve_port = server.local_port();
    let serve = {
        let daq = daq.clone();
        let quit = quit.clone();
        let handler: Handler = Box::new(move |req| {
            if req.resource == "/" {
                Response::ok("application/json", daq.health.json())
            } else {
                Response::code(ResponseCode::NotFound)
            }
        });
        thread::spawn(move || server.run(&handler, &quit))
    };

    daq.watchdog.ready();
    info!("[daq] run {} started (station {})", daq.run.run_number, station);

    Ok(DaqRuntime {
        daq,
        serve_port,
        acquire: Some(acquire),
        monitor: Some(monitor),
        writer: Some(writer),
        serve: Some(serve),
        started: Instant::now(),
    })
}

/// Sweep the lab bias and collect one pedestal record per step, when this
/// run is scheduled for it.
fn run_bias_scan_if_due(
    radiant: &Radiant,
    cfg: &AcqConfig,
    run_number: u32,
) -> anyhow::Result<Vec<Pedestal>> {
    let scan = &cfg.radiant.bias_scan;
    if !scan.enable || scan.skip_runs == 0 || run_number % scan.skip_runs != 0 {
        return Ok(Vec::new());
    }
    if scan.step_vbias <= 0.0 || scan.stop_vbias < scan.start_vbias {
        warn!("[daq] bias scan misconfigured, skipping");
        return Ok(Vec::new());
    }

    info!(
        "[daq] bias scan: {} .. {} V in {} V steps",
        scan.start_vbias, scan.stop_vbias, scan.step_vbias
    );
    let mut records = Vec::new();
    let mut v = scan.start_vbias;
    while v <= scan.stop_vbias {
        radiant.set_dc_bias(bias_volts_to_dac(v), bias_volts_to_dac(v));
        thread::sleep(Duration::from_millis(scan.sleep_ms as u64));
        let mut ped = Pedestal::default();
        radiant
            .compute_pedestals(cfg.radiant.readout.readout_mask, scan.navg_per_step, &mut ped)
            .map_err(|e| anyhow::anyhow!("bias scan pedestal: {e}"))?;
        records.push(ped);
        v += scan.step_vbias;
    }

    // put the bias back where the run wants it
    if cfg.radiant.analog.apply_lab4_vbias {
        radiant.set_dc_bias(
            bias_volts_to_dac(cfg.radiant.analog.lab4_vbias[0]),
            bias_volts_to_dac(cfg.radiant.analog.lab4_vbias[1]),
        );
    } else {
        radiant.set_dc_bias(0, 0);
    }
    Ok(records)
}

/// Pedestal policy: mmap the cache file when configured, recompute at run
/// start when asked (attenuation applied then restored), and hand the
/// resulting table to the board for subtraction.
fn setup_pedestals(
    radiant: &Radiant,
    cfg: &AcqConfig,
    station: u16,
) -> anyhow::Result<(Option<PedestalFile>, Option<Box<Pedestal>>)> {
    let pcfg = &cfg.radiant.pedestals;
    let mut pedestal_file = None;
    let mut pedestals: Option<Box<Pedestal>> = None;

    if !pcfg.pedestal_file.as_os_str().is_empty() {
        match PedestalFile::open(&pcfg.pedestal_file) {
            Ok((pf, prior)) => {
                pedestal_file = Some(pf);
                if let Some(prior) = prior {
                    if prior.nevents > 0 {
                        pedestals = Some(Box::new(prior));
                    }
                }
            }
            Err(e) => warn!(
                "[daq] could not open pedestal file {}: {}",
                pcfg.pedestal_file.display(),
                e
            ),
        }
    }

    if pcfg.compute_at_start {
        if pcfg.apply_attenuation {
            for chan in 0..NUM_RADIANT_CHANNELS {
                radiant.set_attenuator(chan, AttenPath::Signal, (pcfg.attenuation * 4.0) as u32)?;
            }
        }
        let mut ped = Pedestal::default();
        ped.station = station;
        radiant
            .compute_pedestals(0xffffff, pcfg.ntriggers_per_computation, &mut ped)
            .map_err(|e| anyhow::anyhow!("pedestal computation: {e}"))?;
        if pcfg.apply_attenuation {
            for chan in 0..NUM_RADIANT_CHANNELS {
                radiant.set_attenuator(chan, AttenPath::Signal, 0)?;
            }
        }
        if let Some(pf) = &mut pedestal_file {
            pf.write(&ped);
            if let Err(e) = pf.flush() {
                warn!("[daq] pedestal cache flush failed: {}", e);
            }
        }
        pedestals = Some(Box::new(ped));
    }

    if pcfg.pedestal_subtract {
        match &pedestals {
            Some(ped) => radiant.set_pedestals(ped),
            None => warn!(
                "[daq] pedestal subtraction enabled but no usable pedestals; \
                 enable compute_at_start or point pedestal_file at valid data"
            ),
        }
    }

    Ok((pedestal_file, pedestals))
}

impl DaqRuntime {
    /// Enforce run duration and the mid-run free-space floor, react to
    /// signals, and sleep. Returns the process exit code.
    pub fn main_loop(&mut self) -> i32 {
        let mut exit_code = 0;
        while !self.daq.quit.load(Ordering::Acquire) {
            if SIG_QUIT.load(Ordering::Acquire) {
                self.daq.request_stop();
                break;
            }
            if SIG_REREAD.swap(false, Ordering::AcqRel) {
                self.daq.reload_config();
            }

            let (min_free, seconds_per_run, base_dir) = {
                let cfg = self.daq.cfg.read();
                (
                    cfg.output.min_free_space_mb,
                    cfg.output.seconds_per_run,
                    cfg.output.base_dir.clone(),
                )
            };

            if min_free > 0 {
                let free = rundir::free_space_mb(&base_dir).unwrap_or(u64::MAX);
                if free < min_free as u64 {
                    error!("[daq] only {} MB free, stopping run", free);
                    exit_code = 1;
                    self.daq.request_stop();
                    break;
                }
            }

            if seconds_per_run > 0 && self.started.elapsed() >= Duration::from_secs(seconds_per_run as u64)
            {
                info!("[daq] run duration reached");
                self.daq.request_stop();
                break;
            }

            thread::sleep(MAIN_LOOP_SLEEP);
        }
        exit_code
    }

    /// Join the workers (acquire → monitor → writer, then the status
    /// server) and release the devices.
    pub fn shutdown(mut self) {
        self.daq.request_stop();
        self.daq.health.update(|h| h.state = DaqState::Stopping);

        for (name, handle) in [
            ("acquire", self.acquire.take()),
            ("monitor", self.monitor.take()),
            ("writer", self.writer.take()),
        ] {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    error!("[daq] {} thread panicked", name);
                }
            }
        }
        if let Some(serve) = self.serve.take() {
            match serve.join() {
                Ok(n) => info!("[daq] status server answered {} requests", n),
                Err(_) => error!("[daq] serve thread panicked"),
            }
        }

        self.daq.radiant.read().labs_stop();
        if let Some(sf) = self.daq.status_file.lock().as_ref() {
            sf.flush_async();
        }
        info!("[daq] run {} finished", self.daq.run.run_number);
    }

    /// Convenience for the binary: loop, then tear down.
    pub fn run(mut self) -> i32 {
        let code = self.main_loop();
        self.shutdown();
        code
    }
}
