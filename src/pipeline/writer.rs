//! Writer thread: drains both queues, rotates the gzip output streams, and
//! mirrors status into shared memory.
//!
//! One event and one status item at most per cycle; every output file is
//! written under a `.tmp` suffix, renamed into place on close, and then
//! appended to the run's file list. The writer also owns the run-start
//! artifact dumps (config, pedestals, bias scan, runinfo, comment, gain
//! codes), the periodic progress report, the published health state and the
//! supervisor heartbeat.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use flate2::Compression;
use flate2::write::GzEncoder;
use log::{error, info, warn};

use super::{EventArena, EventIndexConsumer, StatusConsumer};
use crate::daq::Daq;
use crate::records::{DaqStatus, Pedestal};
use crate::rundir::{self, append_file_list, finalize_tmp, with_tmp_suffix};

/// Idle sleep when both queues are empty.
const IDLE_SLEEP: Duration = Duration::from_millis(50);
/// Sleep while the test hook holds the writer.
const HOLD_SLEEP: Duration = Duration::from_millis(10);

/// Rotation caps; first to trip wins.
#[derive(Clone, Copy)]
struct Caps {
    max_kb: u32,
    max_records: u32,
    max_secs: u32,
}

/// One rotating gzip output stream.
struct Stream {
    label: &'static str,
    enc: Option<GzEncoder<File>>,
    tmp_path: PathBuf,
    bytes: u64,
    records: u32,
    opened_at: Instant,
}

impl Stream {
    fn new(label: &'static str) -> Stream {
        Stream {
            label,
            enc: None,
            tmp_path: PathBuf::new(),
            bytes: 0,
            records: 0,
            opened_at: Instant::now(),
        }
    }

    fn needs_rotation(&self, caps: &Caps) -> bool {
        if self.enc.is_none() {
            return true;
        }
        (caps.max_kb > 0 && self.bytes >= caps.max_kb as u64 * 1024)
            || (caps.max_records > 0 && self.records >= caps.max_records)
            || (caps.max_secs > 0 && self.opened_at.elapsed().as_secs() >= caps.max_secs as u64)
    }

    fn open(&mut self, final_path: PathBuf) -> io::Result<()> {
        let tmp = with_tmp_suffix(&final_path);
        let file = File::create(&tmp)?;
        self.enc = Some(GzEncoder::new(file, Compression::default()));
        self.tmp_path = tmp;
        self.bytes = 0;
        self.records = 0;
        self.opened_at = Instant::now();
        Ok(())
    }

    /// Finish the gzip stream, drop the tmp suffix, record the final name.
    fn close(&mut self, file_list: &std::path::Path) {
        let Some(enc) = self.enc.take() else { return };
        match enc.finish().and_then(|f| f.sync_all()) {
            Ok(()) => match finalize_tmp(&self.tmp_path) {
                Ok(final_path) => {
                    if let Err(e) = append_file_list(file_list, &final_path) {
                        warn!("[writer] file-list append failed: {}", e);
                    }
                }
                Err(e) => error!("[writer] could not finalize {}: {}", self.tmp_path.display(), e),
            },
            Err(e) => error!("[writer] closing {} stream: {}", self.label, e),
        }
    }

    fn write_record<F>(&mut self, serialize: F) -> io::Result<()>
    where
        F: FnOnce(&mut GzEncoder<File>) -> io::Result<usize>,
    {
        let enc = self.enc.as_mut().expect("stream opened before write");
        let n = serialize(enc)?;
        self.bytes += n as u64;
        self.records += 1;
        Ok(())
    }
}

fn wall_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// gzip a batch of pedestal records to `final_path` via the tmp suffix.
fn write_pedestal_gz<'a>(
    final_path: &std::path::Path,
    records: impl IntoIterator<Item = &'a Pedestal>,
) -> io::Result<()> {
    let tmp = with_tmp_suffix(final_path);
    let mut enc = GzEncoder::new(File::create(&tmp)?, Compression::default());
    for rec in records {
        rec.write_to(&mut enc)?;
    }
    enc.finish()?.sync_all()?;
    finalize_tmp(&tmp)?;
    Ok(())
}

/// Versions, sample rate, free space and the start stamp; the end stamp is
/// appended at shutdown.
fn write_runinfo(daq: &Daq) -> io::Result<()> {
    let mut text = String::new();
    text.push_str(&format!("run {}\n", daq.run.run_number));
    text.push_str(&format!("station {}\n", daq.station));
    text.push_str(&format!("daq-version {}\n", env!("CARGO_PKG_VERSION")));
    {
        let radiant = daq.radiant.read();
        text.push_str(&format!("radiant-fw {}\n", radiant.fw_version()));
        text.push_str(&format!("sample-rate-msps {}\n", radiant.sample_rate_msps()));
    }
    match daq.flower.read().as_ref() {
        Some(fl) => text.push_str(&format!("flower-fw {}\n", fl.fw_version())),
        None => text.push_str("flower-fw absent\n"),
    }
    let cfg = daq.cfg.read();
    let out_free = rundir::free_space_mb(&cfg.output.base_dir).unwrap_or(0);
    text.push_str(&format!("free-space-at-start-mb {}\n", out_free));
    drop(cfg);
    text.push_str(&format!("start-time {}\n", daq.run_start_wall));
    rundir::write_atomic(&daq.run.runinfo(), text.as_bytes())
}

fn append_runinfo_end(daq: &Daq) {
    if let Ok(mut file) = std::fs::OpenOptions::new().append(true).open(daq.run.runinfo()) {
        let _ = writeln!(file, "end-time {}", wall_secs());
    }
}

/// Run-start artifact dumps into the run directory.
fn dump_startup_artifacts(daq: &Daq) {
    let cfg_path = daq.run.cfg().join("acq.cfg");
    if let Err(e) = daq.cfg.read().write_to(&cfg_path) {
        error!("[writer] could not dump config: {}", e);
    }

    let comment = daq.cfg.read().output.comment.clone();
    if !comment.is_empty() {
        if let Err(e) = rundir::write_atomic(&daq.run.comment(), comment.as_bytes()) {
            warn!("[writer] could not write comment: {}", e);
        }
    }

    if let Some(codes) = &daq.gain_codes {
        let mut text = String::new();
        for (chan, code) in codes.iter().enumerate() {
            text.push_str(&format!("{chan} {code}\n"));
        }
        if let Err(e) = rundir::write_atomic(&daq.run.gain_codes(daq.station), text.as_bytes()) {
            warn!("[writer] could not write gain codes: {}", e);
        }
    }

    if let Some(peds) = &daq.pedestals {
        if let Err(e) = write_pedestal_gz(&daq.run.pedestals(), std::iter::once(peds.as_ref())) {
            error!("[writer] could not write pedestals: {}", e);
        }
    }

    if !daq.bias_scan.is_empty() {
        if let Err(e) = write_pedestal_gz(&daq.run.bias_scan(), daq.bias_scan.iter()) {
            error!("[writer] could not write bias scan: {}", e);
        }
    }

    if let Err(e) = write_runinfo(daq) {
        warn!("[writer] could not write runinfo: {}", e);
    }
}

pub fn run(
    daq: Arc<Daq>,
    arena: Arc<EventArena>,
    mut ev_rx: EventIndexConsumer,
    mut mon_rx: StatusConsumer,
) {
    info!("[writer] started");
    dump_startup_artifacts(&daq);

    let start = Instant::now();
    let mut last_print = start;
    let mut last_publish = start;
    let mut num_events: u64 = 0;
    let mut events_this_cycle: u64 = 0;
    let mut last_event_wall: u64 = 0;
    let mut ds_index: u32 = 0;

    let mut wf_stream = Stream::new("waveform");
    let mut hd_stream = Stream::new("header");
    let mut ds_stream = Stream::new("daqstatus");
    let mut status_scratch = DaqStatus::default();
    let file_list = daq.run.file_list();

    loop {
        daq.watchdog.feed();

        let (print_interval, publish_interval, state_file, ev_caps, ds_caps) = {
            let cfg = daq.cfg.read();
            (
                cfg.output.print_interval,
                cfg.runtime.state_publish_interval,
                cfg.runtime.state_file.clone(),
                Caps {
                    max_kb: cfg.output.max_kb_per_file,
                    max_records: cfg.output.max_events_per_file,
                    max_secs: cfg.output.max_seconds_per_file,
                },
                Caps {
                    max_kb: cfg.output.max_kb_per_file,
                    max_records: cfg.output.max_daqstatuses_per_file,
                    max_secs: cfg.output.max_seconds_per_file,
                },
            )
        };

        if print_interval > 0 && last_print.elapsed().as_secs() >= print_interval as u64 {
            let cycle = last_print.elapsed().as_secs_f32();
            let rate = events_this_cycle as f32 / cycle.max(1e-6);
            info!(
                "[writer] after {} s: {} events written ({:.2} Hz), acq queue {}/{}, mon queue {}/{}",
                start.elapsed().as_secs(),
                num_events,
                rate,
                ev_rx.occupancy(),
                ev_rx.capacity(),
                mon_rx.occupancy(),
                mon_rx.capacity()
            );
            let force = daq.num_force_triggers.load(Ordering::Relaxed);
            daq.health.update(|h| {
                h.num_events = num_events;
                h.num_last_cycle = events_this_cycle;
                h.last_cycle_length = cycle;
                h.num_force_events = force;
                h.event_last_updated = last_event_wall;
                h.sys_last_updated = wall_secs();
            });
            events_this_cycle = 0;
            last_print = Instant::now();
        }

        if publish_interval > 0.0 && last_publish.elapsed().as_secs_f32() >= publish_interval {
            let cfg = daq.cfg.read();
            let out_free = rundir::free_space_mb(&cfg.output.base_dir).unwrap_or(0);
            let run_free = cfg
                .output
                .runfile
                .parent()
                .and_then(|p| rundir::free_space_mb(p).ok())
                .unwrap_or(0);
            drop(cfg);
            let force = daq.num_force_triggers.load(Ordering::Relaxed);
            daq.health.update(|h| {
                h.num_events = num_events;
                h.num_force_events = force;
                h.event_last_updated = last_event_wall;
                h.sys_last_updated = wall_secs();
                h.free_space_output_mb = out_free;
                h.free_space_runfile_mb = run_free;
            });
            if let Err(e) = daq.health.publish(&state_file) {
                warn!("[writer] state publish failed: {}", e);
            }
            last_publish = Instant::now();
        }

        let quitting = daq.quit.load(Ordering::Acquire);
        if daq.writer_hold.load(Ordering::Acquire) && !quitting {
            thread::sleep(HOLD_SLEEP);
            continue;
        }

        let event_idx = ev_rx.pop();
        let have_status = mon_rx.pop_into(&mut status_scratch);

        if event_idx.is_none() && !have_status {
            if quitting {
                wf_stream.close(&file_list);
                hd_stream.close(&file_list);
                ds_stream.close(&file_list);
                break;
            }
            thread::sleep(IDLE_SLEEP);
            continue;
        }

        if let Some(idx) = event_idx {
            // the index was detached by the acquire thread; adopting it
            // here is the hand-off back to the arena
            let slot = unsafe { arena.adopt(idx as usize) };

            if wf_stream.needs_rotation(&ev_caps) || hd_stream.needs_rotation(&ev_caps) {
                wf_stream.close(&file_list);
                hd_stream.close(&file_list);
                let event_number = slot.hd.event_number;
                let opened = wf_stream
                    .open(daq.run.waveforms().join(format!("{event_number:06}.wf.dat.gz")))
                    .and_then(|()| {
                        hd_stream.open(daq.run.header().join(format!("{event_number:06}.hd.dat.gz")))
                    });
                if let Err(e) = opened {
                    error!("[writer] cannot open event streams: {}", e);
                    daq.request_stop();
                    continue;
                }
            }

            let written = wf_stream
                .write_record(|enc| slot.wf.write_to(enc))
                .and_then(|()| hd_stream.write_record(|enc| slot.hd.write_to(enc)));
            match written {
                Ok(()) => {
                    num_events += 1;
                    events_this_cycle += 1;
                    last_event_wall = wall_secs();
                    daq.num_events_written.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    error!("[writer] event write failed: {}", e);
                    daq.request_stop();
                }
            }
        }

        if have_status {
            if ds_stream.needs_rotation(&ds_caps) {
                ds_stream.close(&file_list);
                if let Err(e) =
                    ds_stream.open(daq.run.daqstatus().join(format!("{ds_index:05}.ds.dat.gz")))
                {
                    error!("[writer] cannot open daqstatus stream: {}", e);
                    daq.request_stop();
                    continue;
                }
            }
            if let Err(e) = ds_stream.write_record(|enc| status_scratch.write_to(enc)) {
                error!("[writer] daqstatus write failed: {}", e);
                daq.request_stop();
            }
            ds_index += 1;

            let mut shared = daq.status_file.lock();
            if let Some(sf) = shared.as_mut() {
                sf.write(&status_scratch);
                sf.flush_async();
            }
        }
    }

    append_runinfo_end(&daq);
    let force = daq.num_force_triggers.load(Ordering::Relaxed);
    daq.health.update(|h| {
        h.num_events = num_events;
        h.num_force_events = force;
        h.sys_last_updated = wall_secs();
    });
    info!("[writer] exiting after {} events", num_events);
}
