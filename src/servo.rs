//! Closed-loop threshold servoing for both boards.
//!
//! Each channel gets its own PID controller (setpoint = scaler goal,
//! measurement = observed rate, output = threshold change), so the control
//! law is `Δ = P·e + I·Σe + D·Δe` with `e = goal − value`. The integral
//! term is clamped to `±|I|·max_sum_err` and the per-step output to the
//! configured maximum threshold change. Rates that are too high therefore
//! push the threshold down in the DAC domain, matching the board's sense.
//!
//! The RADIANT servo feeds each controller a weighted mix of rolling-window
//! means over up to three configurable periods; the FLOWER servo mixes its
//! two scaler timebases instantaneously.

use pid::Pid;

use crate::config::{AcqConfig, NUM_SERVO_PERIODS};
use crate::device::FirmwareVersion;
use crate::records::{
    DaqStatus, NUM_LT_CHANNELS, NUM_RADIANT_CHANNELS, RADIANT_DAC_MAX, volts_to_dac,
};

/// FLOWER servo/trigger thresholds live in this range.
pub const LT_THRESH_MIN: f64 = 4.0;
pub const LT_THRESH_MAX: f64 = 120.0;

/// Firmware revisions older than this scale the fast scaler by 1000
/// instead of 100.
const LT_FAST_FACTOR_CUTOFF: FirmwareVersion = FirmwareVersion { major: 0, minor: 0, rev: 6 };

/// RADIANT servo parameters in the DAC domain.
#[derive(Debug, Clone)]
pub struct RadiantServoParams {
    pub goals: [f64; NUM_RADIANT_CHANNELS],
    pub p: f64,
    pub i: f64,
    pub d: f64,
    pub max_sum_err: f64,
    /// Per-step clamp on |Δthreshold| in DAC counts; 0 disables.
    pub max_step: f64,
    pub min_thresh: f64,
    pub max_thresh: f64,
    pub periods: [u32; NUM_SERVO_PERIODS],
    pub weights: [f64; NUM_SERVO_PERIODS],
    pub use_log: bool,
    pub log_offset: f64,
    /// Channels in at least one enabled RF trigger; only these servo.
    pub servoed_mask: u32,
}

impl RadiantServoParams {
    /// Build DAC-domain parameters from the volts-denominated config.
    pub fn from_config(cfg: &AcqConfig) -> RadiantServoParams {
        let servo = &cfg.radiant.servo;
        let trig = &cfg.radiant.trigger;
        let mut goals = [0.0; NUM_RADIANT_CHANNELS];
        for (g, s) in goals.iter_mut().zip(servo.scaler_goals.iter()) {
            *g = *s as f64;
        }
        let mut weights = [0.0; NUM_SERVO_PERIODS];
        for (w, s) in weights.iter_mut().zip(servo.period_weights.iter()) {
            *w = *s as f64;
        }
        let mask = (if trig.rf0.enabled { trig.rf0.mask } else { 0 })
            | (if trig.rf1.enabled { trig.rf1.mask } else { 0 });
        RadiantServoParams {
            goals,
            p: servo.p as f64,
            i: servo.i as f64,
            d: servo.d as f64,
            max_sum_err: servo.max_sum_err as f64,
            max_step: volts_to_dac(servo.max_thresh_change as f64) as f64,
            min_thresh: volts_to_dac(cfg.radiant.thresholds.min as f64) as f64,
            max_thresh: volts_to_dac(cfg.radiant.thresholds.max as f64) as f64,
            periods: servo.nscaler_periods_per_servo_period,
            weights,
            use_log: servo.use_log,
            log_offset: servo.log_offset as f64,
            servoed_mask: mask,
        }
    }
}

fn build_pid(setpoint: f64, p: f64, i: f64, d: f64, max_sum_err: f64, max_step: f64) -> Pid<f64> {
    let output_limit = if max_step > 0.0 { max_step } else { f64::INFINITY };
    let mut pid = Pid::new(setpoint, output_limit);
    pid.p(p, f64::INFINITY);
    pid.i(i, i.abs() * max_sum_err);
    pid.d(d, f64::INFINITY);
    pid
}

pub struct RadiantServo {
    params: RadiantServoParams,
    pids: Vec<Pid<f64>>,
    /// Rolling scaler window, `max_periods` samples per channel.
    window: Vec<f64>,
    max_periods: usize,
    nperiods_populated: usize,
    values: [f64; NUM_RADIANT_CHANNELS],
}

impl RadiantServo {
    pub fn new(params: RadiantServoParams) -> RadiantServo {
        let max_periods = params.periods.iter().copied().max().unwrap_or(1).max(1) as usize;
        let transform = |v: f64| {
            if params.use_log { (params.log_offset + v).log10() } else { v }
        };
        let pids = params
            .goals
            .iter()
            .map(|g| {
                build_pid(
                    transform(*g),
                    params.p,
                    params.i,
                    params.d,
                    params.max_sum_err,
                    params.max_step,
                )
            })
            .collect();
        RadiantServo {
            window: vec![0.0; max_periods * NUM_RADIANT_CHANNELS],
            max_periods,
            nperiods_populated: 0,
            values: [0.0; NUM_RADIANT_CHANNELS],
            pids,
            params,
        }
    }

    /// Fold one scaler snapshot into the rolling window and recompute the
    /// weighted per-channel values.
    pub fn update_scalers(&mut self, ds: &DaqStatus) {
        let slot = self.nperiods_populated % self.max_periods;
        self.nperiods_populated += 1;
        let filled = self.nperiods_populated.min(self.max_periods);
        let period = if ds.radiant_scaler_period > 0.0 { ds.radiant_scaler_period as f64 } else { 1.0 };

        for chan in 0..NUM_RADIANT_CHANNELS {
            let adjusted =
                ds.radiant_scalers[chan] as f64 * (1.0 + ds.radiant_prescalers[chan] as f64) / period;
            self.window[chan * self.max_periods + slot] = adjusted;

            let mut value = 0.0;
            for j in 0..NUM_SERVO_PERIODS {
                if self.params.weights[j] == 0.0 {
                    continue;
                }
                let n = (self.params.periods[j] as usize).min(filled).max(1);
                let mut sum = 0.0;
                for back in 0..n {
                    let idx = (self.nperiods_populated - 1 - back) % self.max_periods;
                    sum += self.window[chan * self.max_periods + idx];
                }
                value += self.params.weights[j] * sum / n as f64;
            }
            self.values[chan] = value;
        }
    }

    pub fn value(&self, chan: usize) -> f64 {
        self.values[chan]
    }

    /// Run one servo step, mutating the DAC-domain thresholds in place.
    /// Returns true when any threshold changed.
    pub fn step(&mut self, thresholds: &mut [u32; NUM_RADIANT_CHANNELS]) -> bool {
        let mut changed = false;
        for chan in 0..NUM_RADIANT_CHANNELS {
            if self.params.servoed_mask & (1 << chan) == 0 {
                continue;
            }
            let measurement = if self.params.use_log {
                (self.params.log_offset + self.values[chan]).log10()
            } else {
                self.values[chan]
            };
            let delta = self.pids[chan].next_control_output(measurement).output;
            let next = (thresholds[chan] as f64 + delta)
                .clamp(self.params.min_thresh, self.params.max_thresh)
                .clamp(0.0, RADIANT_DAC_MAX as f64)
                .round() as u32;
            if next != thresholds[chan] {
                changed = true;
            }
            thresholds[chan] = next;
        }
        changed
    }
}

/// FLOWER servo parameters.
#[derive(Debug, Clone)]
pub struct FlowerServoParams {
    pub goals: [f64; NUM_LT_CHANNELS],
    pub p: f64,
    pub i: f64,
    pub d: f64,
    pub max_sum_err: f64,
    pub subtract_gated: bool,
    pub fast_weight: f64,
    pub slow_weight: f64,
    /// trigger = (servo - offset) / frac
    pub thresh_frac: f64,
    pub thresh_offset: f64,
}

impl FlowerServoParams {
    pub fn from_config(cfg: &AcqConfig) -> FlowerServoParams {
        let servo = &cfg.lt.servo;
        let mut goals = [0.0; NUM_LT_CHANNELS];
        for (g, s) in goals.iter_mut().zip(servo.scaler_goals.iter()) {
            *g = *s as f64;
        }
        FlowerServoParams {
            goals,
            p: servo.p as f64,
            i: servo.i as f64,
            d: servo.d as f64,
            max_sum_err: servo.max_sum_err as f64,
            subtract_gated: servo.subtract_gated,
            fast_weight: servo.fast_scaler_weight as f64,
            slow_weight: servo.slow_scaler_weight as f64,
            thresh_frac: servo.servo_thresh_frac as f64,
            thresh_offset: servo.servo_thresh_offset as f64,
        }
    }
}

/// Scale applied to the fast-window scaler to put both timebases in common
/// units. Firmware-dependent, determined once per board.
pub fn lt_fast_factor(fw: FirmwareVersion) -> f64 {
    if fw < LT_FAST_FACTOR_CUTOFF { 1000.0 } else { 100.0 }
}

pub struct FlowerServo {
    params: FlowerServoParams,
    fast_factor: f64,
    pids: Vec<Pid<f64>>,
    values: [f64; NUM_LT_CHANNELS],
}

impl FlowerServo {
    pub fn new(params: FlowerServoParams, fw: FirmwareVersion) -> FlowerServo {
        let pids = params
            .goals
            .iter()
            .map(|g| build_pid(*g, params.p, params.i, params.d, params.max_sum_err, 0.0))
            .collect();
        FlowerServo {
            fast_factor: lt_fast_factor(fw),
            values: [0.0; NUM_LT_CHANNELS],
            pids,
            params,
        }
    }

    pub fn fast_factor(&self) -> f64 {
        self.fast_factor
    }

    /// Mix the two scaler timebases into the per-channel values.
    pub fn update_scalers(&mut self, ds: &DaqStatus) {
        let sub = if self.params.subtract_gated { 1.0 } else { 0.0 };
        for chan in 0..NUM_LT_CHANNELS {
            let fast = ds.lt_scalers_fast[chan] as f64;
            let slow = ds.lt_scalers_slow[chan] as f64;
            let gated = ds.lt_scalers_slow_gated[chan] as f64;
            self.values[chan] = self.params.fast_weight * self.fast_factor * fast
                + self.params.slow_weight * (slow - sub * gated);
        }
    }

    pub fn value(&self, chan: usize) -> f64 {
        self.values[chan]
    }

    /// Run one servo step: adjust the servo thresholds and derive the
    /// trigger thresholds from them, both clamped to [4, 120].
    pub fn step(
        &mut self,
        servo_thresholds: &mut [u8; NUM_LT_CHANNELS],
        trigger_thresholds: &mut [u8; NUM_LT_CHANNELS],
    ) {
        for chan in 0..NUM_LT_CHANNELS {
            let delta = self.pids[chan].next_control_output(self.values[chan]).output;
            let servo = (servo_thresholds[chan] as f64 + delta).clamp(LT_THRESH_MIN, LT_THRESH_MAX);
            let trigger = ((servo - self.params.thresh_offset) / self.params.thresh_frac)
                .clamp(LT_THRESH_MIN, LT_THRESH_MAX);
            servo_thresholds[chan] = servo.round() as u8;
            trigger_thresholds[chan] = trigger.round() as u8;
        }
    }
}
