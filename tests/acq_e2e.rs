//! End-to-end runs of the full daemon against the simulated boards: forced
//! triggers flow from the acquire thread through the ring to finalized
//! gzip files, backpressure holds when the writer is paused, reload
//! re-applies thresholds, and the byte cap rotates files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use ice_daq::config::AcqConfig;
use ice_daq::daq;
use ice_daq::records::volts_to_dac;
use tempfile::TempDir;

/// A config that keeps everything quiet (no soft/RF triggers, no servo, no
/// status snapshots) and confines all paths to `dir`.
fn quiet_config(dir: &Path) -> AcqConfig {
    let mut cfg = AcqConfig::default();
    cfg.output.base_dir = dir.join("data");
    cfg.output.runfile = dir.join("runfile");
    cfg.output.min_free_space_mb = 0;
    cfg.output.seconds_per_run = 0;
    cfg.output.print_interval = 0;
    cfg.output.daqstatus_interval = 0.0;
    cfg.runtime.status_shmem_file = dir.join("daqstatus.dat");
    cfg.runtime.state_file = dir.join("state.json");
    cfg.runtime.status_port = 0;
    cfg.runtime.acq_buf_size = 4;
    cfg.radiant.trigger.soft.enabled = false;
    cfg.radiant.trigger.rf0.enabled = false;
    cfg.radiant.trigger.rf1.enabled = false;
    cfg.radiant.servo.enable = false;
    cfg.radiant.servo.scaler_update_interval = 0.0;
    cfg.radiant.pedestals.compute_at_start = false;
    cfg.radiant.pedestals.pedestal_subtract = false;
    cfg.radiant.pedestals.pedestal_file = dir.join("peds.dat");
    cfg.radiant.thresholds.load_from_shared_file = false;
    cfg.lt.servo.enable = false;
    cfg.lt.servo.scaler_update_interval = 0.0;
    cfg.lt.thresholds.load_from_shared_file = false;
    cfg.calpulser.sweep.enable = false;
    cfg
}

fn write_config(dir: &Path, cfg: &AcqConfig) -> PathBuf {
    let path = dir.join("acq.cfg");
    fs::write(&path, cfg.dump()).unwrap();
    path
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn list_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

// Quiet startup, one forced event, clean shutdown: exactly one waveform
// file with a matching header file, no tmp leftovers.
#[test]
fn single_forced_event_lands_in_matching_files() {
    let tmp = TempDir::new().unwrap();
    let cfg = quiet_config(tmp.path());
    let cfg_path = write_config(tmp.path(), &cfg);

    let runtime = daq::start(Some(&cfg_path)).unwrap();
    let daq = runtime.daq.clone();

    daq.radiant.read().soft_trigger();
    assert!(
        wait_until(Duration::from_secs(10), || {
            daq.num_events_written.load(Ordering::Relaxed) >= 1
        }),
        "event never reached the writer"
    );

    daq.request_stop();
    runtime.shutdown();

    let run_dir = tmp.path().join("data").join("run0");
    assert_eq!(list_files(&run_dir.join("waveforms")), vec!["000001.wf.dat.gz"]);
    assert_eq!(list_files(&run_dir.join("header")), vec!["000001.hd.dat.gz"]);
    assert!(run_dir.join("cfg").join("acq.cfg").exists());
    assert!(run_dir.join("aux").join("runinfo.txt").exists());

    let listed = fs::read_to_string(run_dir.join("aux").join("acq-file-list.txt")).unwrap();
    assert!(listed.contains("000001.wf.dat.gz"));
    assert!(!listed.contains(".tmp"));
}

// Queue backpressure: with the writer paused and a capacity-2 ring, three
// forced events stall the producer; resuming drains all three in order.
#[test]
fn paused_writer_applies_backpressure_then_drains_in_order() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = quiet_config(tmp.path());
    cfg.runtime.acq_buf_size = 2;
    cfg.output.max_events_per_file = 1;
    let cfg_path = write_config(tmp.path(), &cfg);

    let runtime = daq::start(Some(&cfg_path)).unwrap();
    let daq = runtime.daq.clone();
    daq.writer_hold.store(true, Ordering::Release);

    for _ in 0..3 {
        daq.radiant.read().soft_trigger();
    }

    // the writer is held, so nothing lands on disk
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(daq.num_events_written.load(Ordering::Relaxed), 0);
    let waveforms = tmp.path().join("data").join("run0").join("waveforms");
    assert!(list_files(&waveforms).is_empty());

    daq.writer_hold.store(false, Ordering::Release);
    assert!(
        wait_until(Duration::from_secs(10), || {
            daq.num_events_written.load(Ordering::Relaxed) == 3
        }),
        "held events never drained"
    );

    daq.request_stop();
    runtime.shutdown();

    assert_eq!(
        list_files(&waveforms),
        vec!["000001.wf.dat.gz", "000002.wf.dat.gz", "000003.wf.dat.gz"]
    );
}

// Config reload re-applies a changed initial threshold to both the status
// record and the device before the next event.
#[test]
fn reload_applies_new_initial_threshold() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = quiet_config(tmp.path());
    cfg.radiant.thresholds.initial[0] = 1.0;
    let cfg_path = write_config(tmp.path(), &cfg);

    let runtime = daq::start(Some(&cfg_path)).unwrap();
    let daq = runtime.daq.clone();
    assert_eq!(daq.ds.read().radiant_thresholds[0], volts_to_dac(1.0));

    cfg.radiant.thresholds.initial[0] = 1.2;
    fs::write(&cfg_path, cfg.dump()).unwrap();
    daq.reload_config();

    let want = volts_to_dac(1.2);
    assert_eq!(daq.ds.read().radiant_thresholds[0], want);
    assert_eq!(daq.radiant.read().thresholds()[0], want);

    // each reload dumps the effective config into the run's cfg directory
    let cfg_dir = tmp.path().join("data").join("run0").join("cfg");
    let dumps = list_files(&cfg_dir);
    assert!(
        dumps.iter().any(|name| name.starts_with("acq.1.")),
        "no reload dump in {dumps:?}"
    );

    daq.request_stop();
    runtime.shutdown();
}

// Rotation on the byte cap: with a 1 kB cap every event opens its own
// file, and every tmp suffix is resolved on close.
#[test]
fn byte_cap_rotates_per_event() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = quiet_config(tmp.path());
    cfg.output.max_kb_per_file = 1;
    let cfg_path = write_config(tmp.path(), &cfg);

    let runtime = daq::start(Some(&cfg_path)).unwrap();
    let daq = runtime.daq.clone();

    for _ in 0..3 {
        daq.radiant.read().soft_trigger();
    }
    assert!(wait_until(Duration::from_secs(10), || {
        daq.num_events_written.load(Ordering::Relaxed) == 3
    }));

    daq.request_stop();
    runtime.shutdown();

    let waveforms = tmp.path().join("data").join("run0").join("waveforms");
    let files = list_files(&waveforms);
    assert_eq!(files.len(), 3, "expected one file per event, got {files:?}");
    assert!(files.iter().all(|f| f.ends_with(".wf.dat.gz")));
}

// Distinct runs never collide on disk: a second start from the same base
// directory lands in the next run directory.
#[test]
fn successive_runs_use_disjoint_directories() {
    let tmp = TempDir::new().unwrap();
    let cfg = quiet_config(tmp.path());
    let cfg_path = write_config(tmp.path(), &cfg);

    let first = daq::start(Some(&cfg_path)).unwrap();
    let first_run = first.daq.run.run_number;
    first.daq.request_stop();
    first.shutdown();

    let second = daq::start(Some(&cfg_path)).unwrap();
    let second_run = second.daq.run.run_number;
    second.daq.request_stop();
    second.shutdown();

    assert_ne!(first_run, second_run);
    assert!(tmp.path().join("data").join(format!("run{first_run}")).is_dir());
    assert!(tmp.path().join("data").join(format!("run{second_run}")).is_dir());
}

// Reload is atomic for readers: any worker holding the config read lock
// sees either the old record in full or the new record in full.
#[test]
fn reload_is_atomic_for_readers() {
    let tmp = TempDir::new().unwrap();
    let mut cfg_a = quiet_config(tmp.path());
    cfg_a.output.comment = "variant-a".into();
    cfg_a.output.print_interval = 1111;
    let mut cfg_b = cfg_a.clone();
    cfg_b.output.comment = "variant-b".into();
    cfg_b.output.print_interval = 2222;
    let cfg_path = write_config(tmp.path(), &cfg_a);

    let runtime = daq::start(Some(&cfg_path)).unwrap();
    let daq = runtime.daq.clone();

    let reader_daq = daq.clone();
    let reader = std::thread::spawn(move || {
        for _ in 0..2000 {
            let cfg = reader_daq.cfg.read();
            let pair = (cfg.output.comment.clone(), cfg.output.print_interval);
            drop(cfg);
            assert!(
                pair == ("variant-a".to_string(), 1111)
                    || pair == ("variant-b".to_string(), 2222),
                "observed a half-updated config: {pair:?}"
            );
        }
    });

    for i in 0..20 {
        let next = if i % 2 == 0 { &cfg_b } else { &cfg_a };
        fs::write(&cfg_path, next.dump()).unwrap();
        daq.reload_config();
    }
    reader.join().unwrap();

    daq.request_stop();
    runtime.shutdown();
}

// The health endpoint answers on the ephemeral status port while running.
#[test]
fn health_endpoint_serves_json() {
    use std::io::{Read, Write};

    let tmp = TempDir::new().unwrap();
    let cfg = quiet_config(tmp.path());
    let cfg_path = write_config(tmp.path(), &cfg);

    let runtime = daq::start(Some(&cfg_path)).unwrap();
    let mut stream =
        std::net::TcpStream::connect(("127.0.0.1", runtime.serve_port)).unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: station\r\n\r\n")
        .unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).unwrap();
    assert!(reply.starts_with("HTTP/1.1 200 OK"));
    assert!(reply.contains("\"current_run\""));
    assert!(reply.contains("\"state\":\"running\""));

    runtime.daq.request_stop();
    runtime.shutdown();
}
