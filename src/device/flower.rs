//! FLOWER handle: the low-threshold trigger board.
//!
//! Provides the secondary trigger path, the gated scaler groups the servo
//! feeds on, per-channel gain codes, and the cycle counter behind the
//! delayed-PPS clock estimate. Commands take `&self` so the acquire and
//! monitor threads can share the device read lock; scalers refresh on a
//! one-second cadence so back-to-back reads agree within a window.

use std::time::Instant;

use log::info;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{DeviceError, FirmwareVersion};
use crate::config::{LtDeviceConfig, LtTriggerConfig};
use crate::records::{DaqStatus, EventHeader, NUM_LT_CHANNELS};

/// Nominal cycle-counter center; ~11.8 counts per delayed-PPS microsecond.
const CYCLE_COUNTER_CENTER: f64 = 1.18e8;

struct FlowerModel {
    rng: StdRng,
    trigger_thresholds: [u8; NUM_LT_CHANNELS],
    servo_thresholds: [u8; NUM_LT_CHANNELS],
    gain_codes: [u8; NUM_LT_CHANNELS],
    trigger_enabled: bool,
    min_coincidence: u32,
    fast: [u16; NUM_LT_CHANNELS],
    slow: [u16; NUM_LT_CHANNELS],
    gated: [u16; NUM_LT_CHANNELS],
    cycle_counter: u32,
    scaler_epoch: u64,
}

pub struct Flower {
    start: Instant,
    fw: FirmwareVersion,
    model: Mutex<FlowerModel>,
}

impl Flower {
    pub fn open(cfg: &LtDeviceConfig) -> Result<Flower, DeviceError> {
        if cfg.spi_device.is_empty() {
            return Err(DeviceError::Open {
                device: "flower".into(),
                reason: "no spi device configured".into(),
            });
        }
        info!("[flower] opened on {}", cfg.spi_device);
        Ok(Flower {
            start: Instant::now(),
            fw: FirmwareVersion::new(0, 1, 2),
            model: Mutex::new(FlowerModel {
                rng: StdRng::from_os_rng(),
                trigger_thresholds: [0; NUM_LT_CHANNELS],
                servo_thresholds: [0; NUM_LT_CHANNELS],
                gain_codes: [5; NUM_LT_CHANNELS],
                trigger_enabled: false,
                min_coincidence: 2,
                fast: [0; NUM_LT_CHANNELS],
                slow: [0; NUM_LT_CHANNELS],
                gated: [0; NUM_LT_CHANNELS],
                cycle_counter: 0,
                scaler_epoch: u64::MAX,
            }),
        })
    }

    pub fn fw_version(&self) -> FirmwareVersion {
        self.fw
    }

    pub fn configure_trigger(&self, trig: &LtTriggerConfig) -> Result<(), DeviceError> {
        if trig.min_coincidence < 1 {
            return Err(DeviceError::BadArgument("min_coincidence < 1".into()));
        }
        let mut model = self.model.lock();
        model.trigger_enabled = trig.enable;
        model.min_coincidence = trig.min_coincidence;
        Ok(())
    }

    /// Write both threshold sets for the masked channels.
    pub fn set_thresholds(
        &self,
        trigger: &[u8; NUM_LT_CHANNELS],
        servo: &[u8; NUM_LT_CHANNELS],
        mask: u8,
    ) {
        let mut model = self.model.lock();
        for chan in 0..NUM_LT_CHANNELS {
            if mask & (1 << chan) != 0 {
                model.trigger_thresholds[chan] = trigger[chan];
                model.servo_thresholds[chan] = servo[chan];
            }
        }
    }

    pub fn trigger_thresholds(&self) -> [u8; NUM_LT_CHANNELS] {
        self.model.lock().trigger_thresholds
    }

    pub fn set_gain_codes(&self, codes: &[u8; NUM_LT_CHANNELS]) {
        self.model.lock().gain_codes = *codes;
    }

    /// Tune gains toward a target RMS; returns the chosen codes.
    pub fn auto_gain(&self, target_rms: f32) -> [u8; NUM_LT_CHANNELS] {
        let code = (target_rms * 1.7).round().clamp(0.0, 15.0) as u8;
        let mut model = self.model.lock();
        model.gain_codes = [code; NUM_LT_CHANNELS];
        model.gain_codes
    }

    pub fn gain_codes(&self) -> [u8; NUM_LT_CHANNELS] {
        self.model.lock().gain_codes
    }

    /// Stamp the auxiliary fields of an event header.
    pub fn fill_event_header(&self, hd: &mut EventHeader) {
        let mut model = self.model.lock();
        let jitter = model.rng.random_range(-0.01..0.01);
        hd.lt_cycle_counter = (CYCLE_COUNTER_CENTER * (1.0 + jitter)) as u32;
        hd.lt_num_coincidences = model.min_coincidence as u8;
        hd.lt_trigger_beams = if model.trigger_enabled { 0xf } else { 0 };
    }

    /// Fill the FLOWER part of a status snapshot.
    pub fn fill_daqstatus(&self, ds: &mut DaqStatus) {
        let mut model = self.model.lock();
        let model = &mut *model;
        let epoch = self.start.elapsed().as_secs();
        if epoch != model.scaler_epoch {
            model.scaler_epoch = epoch;
            for chan in 0..NUM_LT_CHANNELS {
                // crossing rate falls off with the trigger threshold
                let thresh = model.trigger_thresholds[chan].max(1) as f64;
                let jitter: f64 = model.rng.random_range(-0.05..0.05);
                let slow = 3000.0 / thresh * (1.0 + jitter);
                model.slow[chan] = slow as u16;
                model.gated[chan] = (slow * 0.3) as u16;
                model.fast[chan] = (slow / 100.0) as u16;
            }
            let cc_jitter: f64 = model.rng.random_range(-0.01..0.01);
            model.cycle_counter = (CYCLE_COUNTER_CENTER * (1.0 + cc_jitter)) as u32;
        }
        ds.lt_scalers_fast = model.fast;
        ds.lt_scalers_slow = model.slow;
        ds.lt_scalers_slow_gated = model.gated;
        ds.lt_trigger_thresholds = model.trigger_thresholds;
        ds.lt_servo_thresholds = model.servo_thresholds;
        ds.lt_cycle_counter = model.cycle_counter;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Flower {
        Flower::open(&LtDeviceConfig::default()).unwrap()
    }

    #[test]
    fn open_requires_a_device_path() {
        let mut cfg = LtDeviceConfig::default();
        cfg.spi_device.clear();
        assert!(Flower::open(&cfg).is_err());
    }

    #[test]
    fn threshold_writes_honor_the_channel_mask() {
        let f = open();
        f.set_thresholds(&[50; NUM_LT_CHANNELS], &[40; NUM_LT_CHANNELS], 0b0101);
        assert_eq!(f.trigger_thresholds(), [50, 0, 50, 0]);
    }

    #[test]
    fn daqstatus_carries_plausible_cycle_counter() {
        let f = open();
        f.set_thresholds(&[30; NUM_LT_CHANNELS], &[30; NUM_LT_CHANNELS], 0xf);
        let mut ds = DaqStatus::default();
        f.fill_daqstatus(&mut ds);
        assert!(ds.lt_cycle_counter > 100_000_000 && ds.lt_cycle_counter < 136_000_000);
        assert!(ds.lt_scalers_slow[0] > 0);
        assert!(ds.lt_scalers_slow_gated[0] <= ds.lt_scalers_slow[0]);
    }

    #[test]
    fn consecutive_reads_agree_within_a_second() {
        let f = open();
        let mut a = DaqStatus::default();
        let mut b = DaqStatus::default();
        f.fill_daqstatus(&mut a);
        f.fill_daqstatus(&mut b);
        assert_eq!(a.lt_scalers_slow, b.lt_scalers_slow);
        assert_eq!(a.lt_cycle_counter, b.lt_cycle_counter);
    }

    #[test]
    fn auto_gain_sets_all_channels() {
        let f = open();
        let codes = f.auto_gain(3.0);
        assert_eq!(codes, f.gain_codes());
        assert!(codes.iter().all(|c| *c == codes[0]));
    }
}
