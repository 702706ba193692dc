//! RADIANT handle: the 24-channel waveform digitizer.
//!
//! Command surface used by the daemon: analog setup (biases, attenuators),
//! pedestal computation and subtraction, scaler and trigger configuration,
//! trigger-ready polling, event readout, daqstatus reads and threshold
//! writes.
//!
//! Event readout rides the SPI path while status and configuration ride
//! UART, so the acquire and monitor threads may both hold the device read
//! lock; the handle keeps its mutable state behind internal primitives and
//! every command takes `&self`. The device write lock is reserved for
//! reconfiguration.
//!
//! Waveforms and scaler rates come from a behavioral model: uniform noise
//! around the pedestal level and a threshold-dependent crossing rate that
//! refreshes once per scaler period, so back-to-back status reads inside one
//! period agree.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spin_sleep::{SpinSleeper, SpinStrategy};

use super::{DeviceError, FirmwareVersion};
use crate::config::{RadiantDeviceConfig, RfTriggerConfig};
use crate::records::{
    DaqStatus, EventHeader, NUM_RADIANT_CHANNELS, Pedestal, RADIANT_SAMPLES_PER_BUFFER,
    TRIGGER_SOFT, Waveform, dac_to_volts,
};

/// Attenuator paths on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttenPath {
    Signal,
    Trigger,
}

// Trigger-enable bits.
pub const TRIG_EN: u32 = 1 << 0;
pub const TRIGOUT_EN: u32 = 1 << 1;
pub const TRIG_EXT: u32 = 1 << 2;
pub const TRIG_PPS: u32 = 1 << 3;
pub const TRIGOUT_PPS: u32 = 1 << 4;
pub const TRIGOUT_SOFT: u32 = 1 << 5;

/// Nominal ADC counts of the DC baseline.
const PEDESTAL_LEVEL: f64 = 1800.0;
/// Uniform noise half-range in ADC counts.
const NOISE_HALF_RANGE: f64 = 60.0;
/// Noise crossing rate extrapolated to a zero threshold, in Hz.
const NOISE_RATE_AT_ZERO: f64 = 1.0e4;
/// Threshold scale of the crossing-rate falloff, in volts.
const NOISE_RATE_SCALE_V: f64 = 0.25;
/// Granularity of the trigger-ready poll.
const POLL_SLICE: Duration = Duration::from_millis(1);

struct RadiantModel {
    rng: StdRng,
    thresholds: [u32; NUM_RADIANT_CHANNELS],
    prescalers: [u8; NUM_RADIANT_CHANNELS],
    /// 0 means the scalers gate on the PPS (1 s).
    scaler_period: f32,
    readout_mask: u32,
    nbuffers_per_readout: u32,
    pedestal_subtract: Option<Box<Pedestal>>,
    dc_bias: [u32; 2],
    scaler_cache: [f32; NUM_RADIANT_CHANNELS],
    scaler_epoch: u64,
    /// Status reads left that deliberately disagree (model-level fault
    /// injection for the reread path).
    flicker_reads: u32,
}

pub struct Radiant {
    start: Instant,
    fw: FirmwareVersion,
    sample_rate_msps: u32,
    labs_running: AtomicBool,
    pending_soft: AtomicU32,
    event_counter: AtomicU32,
    sleeper: SpinSleeper,
    model: Mutex<RadiantModel>,
}

impl Radiant {
    pub fn open(cfg: &RadiantDeviceConfig) -> Result<Radiant, DeviceError> {
        if cfg.spi_device.is_empty() || cfg.uart_device.is_empty() {
            return Err(DeviceError::Open {
                device: "radiant".into(),
                reason: "no spi/uart device configured".into(),
            });
        }
        info!(
            "[radiant] opened on {} / {} (poll gpio {})",
            cfg.spi_device, cfg.uart_device, cfg.poll_gpio
        );
        Ok(Radiant {
            start: Instant::now(),
            fw: FirmwareVersion::new(0, 3, 2),
            sample_rate_msps: 2400,
            labs_running: AtomicBool::new(false),
            pending_soft: AtomicU32::new(0),
            event_counter: AtomicU32::new(0),
            sleeper: SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread),
            model: Mutex::new(RadiantModel {
                rng: StdRng::from_os_rng(),
                thresholds: [0; NUM_RADIANT_CHANNELS],
                prescalers: [0; NUM_RADIANT_CHANNELS],
                scaler_period: 1.0,
                readout_mask: 0xffffff,
                nbuffers_per_readout: 2,
                pedestal_subtract: None,
                dc_bias: [0, 0],
                scaler_cache: [0.0; NUM_RADIANT_CHANNELS],
                scaler_epoch: u64::MAX,
                flicker_reads: 0,
            }),
        })
    }

    pub fn fw_version(&self) -> FirmwareVersion {
        self.fw
    }

    pub fn sample_rate_msps(&self) -> u32 {
        self.sample_rate_msps
    }

    pub fn labs_start(&self) {
        self.labs_running.store(true, Ordering::Release);
    }

    pub fn labs_stop(&self) {
        self.labs_running.store(false, Ordering::Release);
    }

    pub fn set_dc_bias(&self, left: u32, right: u32) {
        self.model.lock().dc_bias = [left, right];
    }

    pub fn set_td_bias(&self, _chan: usize, _dac: u32) {}

    pub fn set_attenuator(&self, chan: usize, _path: AttenPath, _half_db: u32) -> Result<(), DeviceError> {
        if chan >= NUM_RADIANT_CHANNELS {
            return Err(DeviceError::BadArgument(format!("attenuator channel {chan}")));
        }
        Ok(())
    }

    pub fn set_scaler_period(&self, period: f32) {
        self.model.lock().scaler_period = period;
    }

    pub fn set_prescaler(&self, chan: usize, prescal_m1: u8) {
        if chan < NUM_RADIANT_CHANNELS {
            self.model.lock().prescalers[chan] = prescal_m1;
        }
    }

    pub fn set_global_trigger_mask(&self, _mask: u32) {}

    pub fn configure_rf_trigger(&self, which: usize, rf: &RfTriggerConfig) -> Result<(), DeviceError> {
        if which > 1 {
            return Err(DeviceError::BadArgument(format!("rf trigger {which}")));
        }
        debug!(
            "[radiant] rf{} mask {:#x} ncoinc {} window {} ns",
            which, rf.mask, rf.num_coincidences, rf.window
        );
        Ok(())
    }

    pub fn set_trigger_enables(&self, _enables: u32) {}

    pub fn set_pps_config(&self, _use_internal: bool, _sync_out: bool, _holdoff: u32) {}

    pub fn reset_counters(&self) {
        self.event_counter.store(0, Ordering::Release);
    }

    pub fn set_nbuffers_per_readout(&self, n: u32) {
        self.model.lock().nbuffers_per_readout = n.clamp(1, 2);
    }

    pub fn dma_setup_event(&self, readout_mask: u32) {
        self.model.lock().readout_mask = readout_mask;
    }

    /// Fill a pedestal table from `ntriggers` forced readouts.
    pub fn compute_pedestals(
        &self,
        mask: u32,
        ntriggers: u32,
        out: &mut Pedestal,
    ) -> Result<(), DeviceError> {
        let mut model = self.model.lock();
        let model = &mut *model;
        out.nevents = ntriggers;
        out.when_secs = wall_secs();
        out.vbias = [
            model.dc_bias[0] as f32 * 3.3 / 4095.0,
            model.dc_bias[1] as f32 * 3.3 / 4095.0,
        ];
        let bias_shift = model.dc_bias[0] as f64 * 0.05;
        for chan in 0..NUM_RADIANT_CHANNELS {
            if mask & (1 << chan) == 0 {
                continue;
            }
            for s in out.pedestals[chan].iter_mut() {
                let jitter: f64 = model.rng.random_range(-2.0..2.0);
                *s = (PEDESTAL_LEVEL + bias_shift + jitter) as u16;
            }
        }
        Ok(())
    }

    pub fn set_pedestals(&self, peds: &Pedestal) {
        self.model.lock().pedestal_subtract = Some(Box::new(*peds));
    }

    /// Queue a forced trigger; a pending poll reports ready.
    pub fn soft_trigger(&self) {
        self.pending_soft.fetch_add(1, Ordering::AcqRel);
    }

    fn trigger_ready(&self) -> bool {
        self.labs_running.load(Ordering::Acquire) && self.pending_soft.load(Ordering::Acquire) > 0
    }

    /// Wait up to `timeout_ms` for a triggered event.
    pub fn poll_trigger_ready(&self, timeout_ms: u32) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            if self.trigger_ready() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.sleeper.sleep(POLL_SLICE);
        }
    }

    /// Read the pending event into `hd`/`wf`. Call only after a successful
    /// poll.
    pub fn read_event(&self, hd: &mut EventHeader, wf: &mut Waveform) -> Result<(), DeviceError> {
        if self
            .pending_soft
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            return Err(DeviceError::NotResponding("no event pending".into()));
        }
        let event_number = self.event_counter.fetch_add(1, Ordering::AcqRel) + 1;

        let mut model = self.model.lock();
        let model = &mut *model;
        let nsamples = (model.nbuffers_per_readout as usize * RADIANT_SAMPLES_PER_BUFFER) as u16;
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();

        hd.event_number = event_number;
        hd.trigger_type = TRIGGER_SOFT;
        hd.readout_time_secs = now.as_secs();
        hd.readout_time_nsecs = now.subsec_nanos();
        hd.pps_count = self.start.elapsed().as_secs() as u32;
        hd.sys_clk = self.start.elapsed().as_nanos() as u32;
        hd.radiant_nsamples = nsamples;
        hd.radiant_readout_mask = model.readout_mask;

        wf.event_number = event_number;
        wf.nsamples = nsamples;
        wf.readout_mask = model.readout_mask;
        for chan in 0..NUM_RADIANT_CHANNELS {
            if model.readout_mask & (1 << chan) == 0 {
                continue;
            }
            let base = match &model.pedestal_subtract {
                Some(peds) => PEDESTAL_LEVEL - peds.pedestals[chan][0] as f64,
                None => PEDESTAL_LEVEL,
            };
            let rng = &mut model.rng;
            for s in wf.samples[chan][..nsamples as usize].iter_mut() {
                let noise: f64 = rng.random_range(-NOISE_HALF_RANGE..NOISE_HALF_RANGE);
                *s = (base + noise) as i16;
            }
        }
        Ok(())
    }

    /// Fill the RADIANT part of a status snapshot.
    pub fn read_daqstatus(&self, ds: &mut DaqStatus) {
        let mut model = self.model.lock();
        let model = &mut *model;
        let period = if model.scaler_period > 0.0 { model.scaler_period as f64 } else { 1.0 };
        let epoch = (self.start.elapsed().as_secs_f64() / period) as u64;
        if epoch != model.scaler_epoch {
            model.scaler_epoch = epoch;
            for chan in 0..NUM_RADIANT_CHANNELS {
                let v = dac_to_volts(model.thresholds[chan]);
                let rate = NOISE_RATE_AT_ZERO * (-v / NOISE_RATE_SCALE_V).exp();
                let jitter = 1.0 + model.rng.random_range(-0.05..0.05);
                model.scaler_cache[chan] =
                    (rate * jitter * period / (1.0 + model.prescalers[chan] as f64)) as f32;
            }
        }
        ds.when_secs = wall_secs();
        ds.radiant_scalers = model.scaler_cache;
        if model.flicker_reads > 0 {
            // decreasing shift so consecutive glitched reads disagree too
            let shift = model.flicker_reads as f32;
            model.flicker_reads -= 1;
            for s in ds.radiant_scalers.iter_mut() {
                *s += shift;
            }
        }
        ds.radiant_prescalers = model.prescalers;
        ds.radiant_scaler_period = period as f32;
        ds.radiant_thresholds = model.thresholds;
    }

    pub fn set_trigger_thresholds(&self, thresholds: &[u32; NUM_RADIANT_CHANNELS]) {
        self.model.lock().thresholds = *thresholds;
    }

    pub fn thresholds(&self) -> [u32; NUM_RADIANT_CHANNELS] {
        self.model.lock().thresholds
    }

    /// Make the next `reads` status reads disagree with the settled scaler
    /// values, as a glitching UART read would.
    pub fn inject_scaler_flicker(&self, reads: u32) {
        self.model.lock().flicker_reads = reads;
    }
}

fn wall_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Radiant {
        Radiant::open(&RadiantDeviceConfig::default()).unwrap()
    }

    #[test]
    fn open_requires_device_paths() {
        let mut cfg = RadiantDeviceConfig::default();
        cfg.spi_device.clear();
        assert!(Radiant::open(&cfg).is_err());
    }

    #[test]
    fn soft_trigger_produces_exactly_one_event() {
        let r = open();
        r.labs_start();
        assert!(!r.poll_trigger_ready(1));
        r.soft_trigger();
        assert!(r.poll_trigger_ready(1));

        let mut hd = EventHeader::default();
        let mut wf = Waveform::default();
        r.read_event(&mut hd, &mut wf).unwrap();
        assert_eq!(hd.event_number, 1);
        assert_eq!(hd.trigger_type, TRIGGER_SOFT);
        assert_eq!(wf.nsamples as usize, 2 * RADIANT_SAMPLES_PER_BUFFER);
        assert!(!r.poll_trigger_ready(1));
        assert!(r.read_event(&mut hd, &mut wf).is_err());
    }

    #[test]
    fn stopped_labs_never_report_ready() {
        let r = open();
        r.soft_trigger();
        assert!(!r.poll_trigger_ready(1));
    }

    #[test]
    fn consecutive_status_reads_agree_within_a_period() {
        let r = open();
        r.set_scaler_period(1000.0);
        let mut a = DaqStatus::default();
        let mut b = DaqStatus::default();
        r.read_daqstatus(&mut a);
        r.read_daqstatus(&mut b);
        assert_eq!(a.radiant_scalers, b.radiant_scalers);
    }

    #[test]
    fn flicker_injection_breaks_agreement_then_clears() {
        let r = open();
        r.set_scaler_period(1000.0);
        r.inject_scaler_flicker(1);
        let mut a = DaqStatus::default();
        let mut b = DaqStatus::default();
        r.read_daqstatus(&mut a);
        r.read_daqstatus(&mut b);
        assert_ne!(a.radiant_scalers, b.radiant_scalers);
        let mut c = DaqStatus::default();
        r.read_daqstatus(&mut c);
        assert_eq!(b.radiant_scalers, c.radiant_scalers);
    }

    #[test]
    fn higher_thresholds_lower_the_scaler_rate() {
        let r = open();
        r.set_scaler_period(1000.0);
        let mut low = DaqStatus::default();
        r.set_trigger_thresholds(&[crate::records::volts_to_dac(0.5); NUM_RADIANT_CHANNELS]);
        r.read_daqstatus(&mut low);

        let r2 = open();
        r2.set_scaler_period(1000.0);
        let mut high = DaqStatus::default();
        r2.set_trigger_thresholds(&[crate::records::volts_to_dac(1.2); NUM_RADIANT_CHANNELS]);
        r2.read_daqstatus(&mut high);

        assert!(high.radiant_scalers[0] < low.radiant_scalers[0]);
    }
}
