//! Monitor thread: scaler reads, both threshold servos, soft triggers,
//! calpulser sweeps and periodic status snapshots.
//!
//! Runs at a cadence of at most 100 ms; every piece of work has its own
//! interval measured against the monotonic clock. Threshold writes to
//! hardware happen only here, so they are strictly ordered, and the status
//! snapshot always carries the thresholds the device was just given.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spin_sleep::{SpinSleeper, SpinStrategy};

use super::StatusProducer;
use crate::config::SoftTriggerConfig;
use crate::daq::Daq;
use crate::device::Radiant;
use crate::records::DaqStatus;
use crate::servo::{FlowerServo, FlowerServoParams, RadiantServo, RadiantServoParams};

/// Upper bound on the pass cadence.
const MAX_SLEEP: Duration = Duration::from_millis(100);
/// Plausible cycle-counter range for the delayed-PPS estimate.
const CYCLE_COUNTER_RANGE: std::ops::RangeInclusive<f64> = 1.0e8..=1.36e8;
/// Cycle counts per delayed-PPS microsecond.
const CYCLES_PER_US: f64 = 11.8;

/// Schedule the next soft trigger relative to `now` (seconds on the
/// monitor's monotonic clock).
pub fn next_soft_trigger(now: f64, soft: &SoftTriggerConfig, rng: &mut StdRng) -> f64 {
    let mut interval = soft.interval as f64;
    if soft.interval_jitter > 0.0 {
        let u: f64 = rng.random();
        interval += 2.0 * soft.interval_jitter as f64 * (u - 0.5);
    }
    if soft.use_exponential_distribution {
        let u: f64 = rng.random_range(1e-12..1.0);
        now - u.ln() * interval
    } else {
        now + interval
    }
}

/// Read the device status until two consecutive reads agree on the scaler
/// array, logging every retry.
pub fn read_radiant_scalers(radiant: &Radiant, quit: &AtomicBool, out: &mut DaqStatus) {
    let mut check = DaqStatus::default();
    radiant.read_daqstatus(out);
    loop {
        radiant.read_daqstatus(&mut check);
        if check.radiant_scalers == out.radiant_scalers {
            return;
        }
        warn!("[monitor] scaler reads disagree, rereading");
        *out = check;
        if quit.load(Ordering::Acquire) {
            return;
        }
    }
}

pub fn run(daq: Arc<Daq>, mut tx: StatusProducer) {
    info!("[monitor] started");
    let sleeper = SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread);
    let mut rng = StdRng::from_os_rng();
    let start = Instant::now();

    let mut last_scalers_radiant = 0.0f64;
    let mut last_scalers_lt = 0.0f64;
    let mut last_servo_radiant = 0.0f64;
    let mut last_servo_lt = 0.0f64;
    let mut last_status_out = 0.0f64;
    let mut last_calpulser_step = 0.0f64;
    let mut next_soft: Option<f64> = None;

    let mut seen_generation = u64::MAX;
    let mut rad_servo: Option<RadiantServo> = None;
    let mut lt_servo: Option<FlowerServo> = None;

    while !daq.quit.load(Ordering::Acquire) {
        let now = start.elapsed().as_secs_f64();

        // reload invalidates servo history and the soft-trigger schedule
        let generation = daq.cfg_generation.load(Ordering::Acquire);
        if generation != seen_generation {
            seen_generation = generation;
            let cfg = daq.cfg.read();
            rad_servo = Some(RadiantServo::new(RadiantServoParams::from_config(&cfg)));
            lt_servo = daq
                .flower
                .read()
                .as_ref()
                .map(|fl| FlowerServo::new(FlowerServoParams::from_config(&cfg), fl.fw_version()));
            next_soft = None;
        }

        let radiant = daq.radiant.read();
        let flower = daq.flower.read();
        let cfg = daq.cfg.read();

        let scaler_int_radiant = cfg.radiant.servo.scaler_update_interval as f64;
        if scaler_int_radiant > 0.0 && now - last_scalers_radiant > scaler_int_radiant {
            let mut fresh = DaqStatus::default();
            read_radiant_scalers(&radiant, &daq.quit, &mut fresh);
            let mut ds = daq.ds.write();
            ds.when_secs = fresh.when_secs;
            ds.radiant_scalers = fresh.radiant_scalers;
            ds.radiant_prescalers = fresh.radiant_prescalers;
            ds.radiant_scaler_period = fresh.radiant_scaler_period;
            let snapshot = *ds;
            drop(ds);
            if let Some(servo) = rad_servo.as_mut() {
                servo.update_scalers(&snapshot);
            }
            last_scalers_radiant = now;
        }

        let servo_int_radiant = cfg.radiant.servo.servo_interval as f64;
        if cfg.radiant.servo.enable
            && servo_int_radiant > 0.0
            && now - last_servo_radiant > servo_int_radiant
        {
            if let Some(servo) = rad_servo.as_mut() {
                let mut ds = daq.ds.write();
                if servo.step(&mut ds.radiant_thresholds) {
                    radiant.set_trigger_thresholds(&ds.radiant_thresholds);
                }
            }
            last_servo_radiant = now;
        }

        if let Some(fl) = flower.as_ref() {
            let scaler_int_lt = cfg.lt.servo.scaler_update_interval as f64;
            if scaler_int_lt > 0.0 && now - last_scalers_lt > scaler_int_lt {
                let mut ds = daq.ds.write();
                fl.fill_daqstatus(&mut ds);
                let cycles = ds.lt_cycle_counter as f64;
                if CYCLE_COUNTER_RANGE.contains(&cycles) {
                    ds.lt_delayed_pps = (cycles / CYCLES_PER_US) as f32;
                }
                let snapshot = *ds;
                drop(ds);
                if let Some(servo) = lt_servo.as_mut() {
                    servo.update_scalers(&snapshot);
                }
                last_scalers_lt = now;
            }

            let servo_int_lt = cfg.lt.servo.servo_interval as f64;
            if cfg.lt.servo.enable && servo_int_lt > 0.0 && now - last_servo_lt > servo_int_lt {
                if let Some(servo) = lt_servo.as_mut() {
                    let mut ds = daq.ds.write();
                    let mut servo_th = ds.lt_servo_thresholds;
                    let mut trigger_th = ds.lt_trigger_thresholds;
                    servo.step(&mut servo_th, &mut trigger_th);
                    ds.lt_servo_thresholds = servo_th;
                    ds.lt_trigger_thresholds = trigger_th;
                    fl.set_thresholds(&trigger_th, &servo_th, 0xf);
                }
                last_servo_lt = now;
            }
        }

        let status_int = cfg.output.daqstatus_interval as f64;
        if status_int > 0.0 && now - last_status_out > status_int {
            let mut snapshot = *daq.ds.read();
            snapshot.calpulser = daq.calpulser.lock().info();
            let mut slot = tx.reserve();
            *slot = snapshot;
            slot.commit();
            last_status_out = now;
        }

        // calpulser attenuation sweep: march toward stop, wrap to start
        let sweep = cfg.calpulser.sweep.clone();
        if sweep.enable && sweep.step_time > 0.0 && now - last_calpulser_step > sweep.step_time as f64
        {
            let mut cal = daq.calpulser.lock();
            if cal.sweeping {
                cal.attenuation_db += sweep.step_atten;
                if cal.attenuation_db > sweep.stop_atten {
                    cal.attenuation_db = sweep.start_atten;
                }
            }
            last_calpulser_step = now;
        }

        let soft_cfg = cfg.radiant.trigger.soft.clone();
        if soft_cfg.enabled {
            if next_soft.is_none() {
                next_soft = Some(next_soft_trigger(now, &soft_cfg, &mut rng));
            }
            if let Some(at) = next_soft {
                if now >= at {
                    radiant.soft_trigger();
                    daq.num_force_triggers.fetch_add(1, Ordering::Relaxed);
                    next_soft = Some(next_soft_trigger(now, &soft_cfg, &mut rng));
                }
            }
        } else {
            next_soft = None;
        }

        drop(cfg);
        drop(flower);
        drop(radiant);

        // sleep at most 100 ms, less when a soft trigger is due sooner
        let mut sleep = MAX_SLEEP;
        if let Some(at) = next_soft {
            let until = (at - start.elapsed().as_secs_f64()).max(0.0);
            sleep = sleep.min(Duration::from_secs_f64((until * 0.75).max(0.001)));
        }
        sleeper.sleep(sleep);
    }
    info!("[monitor] exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RadiantDeviceConfig;

    #[test]
    fn soft_trigger_schedule_is_deterministic_under_a_seed() {
        let soft = SoftTriggerConfig {
            enabled: true,
            use_exponential_distribution: false,
            interval: 10.0,
            interval_jitter: 0.0,
            output_enabled: false,
        };
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(next_soft_trigger(5.0, &soft, &mut rng), 15.0);

        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        let jittered = SoftTriggerConfig { interval_jitter: 2.0, ..soft.clone() };
        assert_eq!(
            next_soft_trigger(0.0, &jittered, &mut a),
            next_soft_trigger(0.0, &jittered, &mut b)
        );
    }

    #[test]
    fn jitter_stays_within_its_band() {
        let soft = SoftTriggerConfig {
            enabled: true,
            use_exponential_distribution: false,
            interval: 10.0,
            interval_jitter: 1.0,
            output_enabled: false,
        };
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..200 {
            let at = next_soft_trigger(0.0, &soft, &mut rng);
            assert!((9.0..=11.0).contains(&at), "{at} outside jitter band");
        }
    }

    #[test]
    fn exponential_draws_are_positive_and_average_near_interval() {
        let soft = SoftTriggerConfig {
            enabled: true,
            use_exponential_distribution: true,
            interval: 2.0,
            interval_jitter: 0.0,
            output_enabled: false,
        };
        let mut rng = StdRng::seed_from_u64(3);
        let n = 4000;
        let mut sum = 0.0;
        for _ in 0..n {
            let at = next_soft_trigger(0.0, &soft, &mut rng);
            assert!(at > 0.0);
            sum += at;
        }
        let mean = sum / n as f64;
        assert!((mean - 2.0).abs() < 0.2, "mean inter-arrival {mean}");
    }

    #[test]
    fn scaler_read_retries_until_agreement() {
        let radiant = Radiant::open(&RadiantDeviceConfig::default()).unwrap();
        radiant.set_scaler_period(1000.0);
        radiant.inject_scaler_flicker(2);
        let quit = AtomicBool::new(false);
        let mut out = DaqStatus::default();
        read_radiant_scalers(&radiant, &quit, &mut out);
        let mut check = DaqStatus::default();
        radiant.read_daqstatus(&mut check);
        assert_eq!(out.radiant_scalers, check.radiant_scalers);
    }
}
