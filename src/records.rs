//! On-disk record types: event headers, waveform blocks, daqstatus
//! snapshots and pedestal tables.
//!
//! All records are fixed-layout plain-old-data so the daqstatus snapshot can
//! be mirrored byte-wise into the shared status map and the pedestal table
//! can live behind a file mapping. Writers emit little-endian fields behind a
//! small magic/version preamble; sizes are returned so the writer thread can
//! account file rotation against bytes actually serialized.

use std::io::{self, Write};

/// RADIANT channel count.
pub const NUM_RADIANT_CHANNELS: usize = 24;
/// FLOWER channel count.
pub const NUM_LT_CHANNELS: usize = 4;
/// Samples per LAB4D buffer.
pub const RADIANT_SAMPLES_PER_BUFFER: usize = 1024;
/// Maximum samples per readout (two buffers).
pub const RADIANT_MAX_SAMPLES: usize = 2 * RADIANT_SAMPLES_PER_BUFFER;

/// Full scale of the 24-bit threshold DAC, in volts.
pub const RADIANT_DAC_FULL_SCALE_V: f64 = 2.5;
/// Largest threshold DAC code.
pub const RADIANT_DAC_MAX: u32 = (1 << 24) - 1;

/// Convert a threshold in volts to the 24-bit DAC domain.
pub fn volts_to_dac(v: f64) -> u32 {
    let dac = (v * RADIANT_DAC_MAX as f64 / RADIANT_DAC_FULL_SCALE_V).round();
    dac.clamp(0.0, RADIANT_DAC_MAX as f64) as u32
}

/// Convert a 24-bit DAC code back to volts.
pub fn dac_to_volts(dac: u32) -> f64 {
    dac as f64 * RADIANT_DAC_FULL_SCALE_V / RADIANT_DAC_MAX as f64
}

// Trigger-type bits in EventHeader::trigger_type.
pub const TRIGGER_SOFT: u32 = 1 << 0;
pub const TRIGGER_RF0: u32 = 1 << 1;
pub const TRIGGER_RF1: u32 = 1 << 2;
pub const TRIGGER_PPS: u32 = 1 << 3;
pub const TRIGGER_EXT: u32 = 1 << 4;

const HEADER_MAGIC: u16 = 0xead0;
const WAVEFORM_MAGIC: u16 = 0xead1;
const DAQSTATUS_MAGIC: u16 = 0xead2;
const PEDESTAL_MAGIC: u16 = 0xead3;
const RECORD_VERSION: u16 = 3;

/// Per-event header, filled by both boards during readout.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct EventHeader {
    pub event_number: u32,
    pub run_number: u32,
    pub station: u16,
    pub trigger_type: u32,
    /// Wall-clock readout stamp.
    pub readout_time_secs: u64,
    pub readout_time_nsecs: u32,
    /// PPS count since run start, as counted by the RADIANT.
    pub pps_count: u32,
    /// RADIANT sysclk latch at trigger time.
    pub sys_clk: u32,
    pub radiant_nsamples: u16,
    pub radiant_readout_mask: u32,
    /// FLOWER trigger context, filled by the auxiliary board.
    pub lt_cycle_counter: u32,
    pub lt_trigger_beams: u8,
    pub lt_num_coincidences: u8,
}

impl Default for EventHeader {
    fn default() -> Self {
        EventHeader {
            event_number: 0,
            run_number: 0,
            station: 0,
            trigger_type: 0,
            readout_time_secs: 0,
            readout_time_nsecs: 0,
            pps_count: 0,
            sys_clk: 0,
            radiant_nsamples: 0,
            radiant_readout_mask: 0,
            lt_cycle_counter: 0,
            lt_trigger_beams: 0,
            lt_num_coincidences: 0,
        }
    }
}

impl EventHeader {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        let mut n = 0;
        n += write_u16(w, HEADER_MAGIC)?;
        n += write_u16(w, RECORD_VERSION)?;
        n += write_u32(w, self.event_number)?;
        n += write_u32(w, self.run_number)?;
        n += write_u16(w, self.station)?;
        n += write_u32(w, self.trigger_type)?;
        n += write_u64(w, self.readout_time_secs)?;
        n += write_u32(w, self.readout_time_nsecs)?;
        n += write_u32(w, self.pps_count)?;
        n += write_u32(w, self.sys_clk)?;
        n += write_u16(w, self.radiant_nsamples)?;
        n += write_u32(w, self.radiant_readout_mask)?;
        n += write_u32(w, self.lt_cycle_counter)?;
        w.write_all(&[self.lt_trigger_beams, self.lt_num_coincidences])?;
        n += 2;
        Ok(n)
    }
}

/// One readout's worth of samples for every channel.
///
/// The sample block is sized for the largest readout; `nsamples` says how
/// much of each channel row is meaningful.
#[derive(Clone)]
#[repr(C)]
pub struct Waveform {
    pub event_number: u32,
    pub run_number: u32,
    pub station: u16,
    pub nsamples: u16,
    pub readout_mask: u32,
    pub samples: [[i16; RADIANT_MAX_SAMPLES]; NUM_RADIANT_CHANNELS],
}

impl Default for Waveform {
    fn default() -> Self {
        Waveform {
            event_number: 0,
            run_number: 0,
            station: 0,
            nsamples: 0,
            readout_mask: 0,
            samples: [[0; RADIANT_MAX_SAMPLES]; NUM_RADIANT_CHANNELS],
        }
    }
}

impl Waveform {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        let mut n = 0;
        n += write_u16(w, WAVEFORM_MAGIC)?;
        n += write_u16(w, RECORD_VERSION)?;
        n += write_u32(w, self.event_number)?;
        n += write_u32(w, self.run_number)?;
        n += write_u16(w, self.station)?;
        n += write_u16(w, self.nsamples)?;
        n += write_u32(w, self.readout_mask)?;
        let ns = self.nsamples as usize;
        for chan in 0..NUM_RADIANT_CHANNELS {
            if self.readout_mask & (1 << chan) == 0 {
                continue;
            }
            for s in &self.samples[chan][..ns] {
                n += write_u16(w, *s as u16)?;
            }
        }
        Ok(n)
    }
}

/// An item in the event pipeline: header plus waveform, reused in place.
#[derive(Clone, Default)]
pub struct EventItem {
    pub hd: EventHeader,
    pub wf: Waveform,
}

/// Calibration-pulser state as carried in the status snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[repr(C)]
pub struct CalpulserInfo {
    pub kind: u8,
    pub channel: u8,
    pub sweeping: u8,
    pub attenuation_db: f32,
}

/// Flat device-health snapshot, written by the monitor thread and mirrored
/// into the shared status map for external readers.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DaqStatus {
    pub station: u16,
    pub when_secs: u64,
    pub radiant_scalers: [f32; NUM_RADIANT_CHANNELS],
    pub radiant_prescalers: [u8; NUM_RADIANT_CHANNELS],
    pub radiant_scaler_period: f32,
    pub radiant_thresholds: [u32; NUM_RADIANT_CHANNELS],
    /// ~100 Hz window scalers.
    pub lt_scalers_fast: [u16; NUM_LT_CHANNELS],
    /// ~1 Hz window scalers and their gated companion.
    pub lt_scalers_slow: [u16; NUM_LT_CHANNELS],
    pub lt_scalers_slow_gated: [u16; NUM_LT_CHANNELS],
    pub lt_trigger_thresholds: [u8; NUM_LT_CHANNELS],
    pub lt_servo_thresholds: [u8; NUM_LT_CHANNELS],
    pub lt_cycle_counter: u32,
    /// Delayed-PPS clock estimate, refined from the cycle counter.
    pub lt_delayed_pps: f32,
    pub calpulser: CalpulserInfo,
}

impl Default for DaqStatus {
    fn default() -> Self {
        DaqStatus {
            station: 0,
            when_secs: 0,
            radiant_scalers: [0.0; NUM_RADIANT_CHANNELS],
            radiant_prescalers: [0; NUM_RADIANT_CHANNELS],
            radiant_scaler_period: 1.0,
            radiant_thresholds: [0; NUM_RADIANT_CHANNELS],
            lt_scalers_fast: [0; NUM_LT_CHANNELS],
            lt_scalers_slow: [0; NUM_LT_CHANNELS],
            lt_scalers_slow_gated: [0; NUM_LT_CHANNELS],
            lt_trigger_thresholds: [0; NUM_LT_CHANNELS],
            lt_servo_thresholds: [0; NUM_LT_CHANNELS],
            lt_cycle_counter: 0,
            lt_delayed_pps: 0.0,
            calpulser: CalpulserInfo::default(),
        }
    }
}

impl DaqStatus {
    /// Byte view for the shared status map. Sound because the type is
    /// `repr(C)` plain-old-data and only this crate's layout reads it back.
    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self as *const DaqStatus as *const u8, size_of::<DaqStatus>())
        }
    }

    /// Rebuild a snapshot from a byte image of the same layout.
    pub fn from_bytes(bytes: &[u8]) -> Option<DaqStatus> {
        if bytes.len() < size_of::<DaqStatus>() {
            return None;
        }
        Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const DaqStatus) })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        let mut n = 0;
        n += write_u16(w, DAQSTATUS_MAGIC)?;
        n += write_u16(w, RECORD_VERSION)?;
        n += write_u16(w, self.station)?;
        n += write_u64(w, self.when_secs)?;
        for v in &self.radiant_scalers {
            n += write_u32(w, v.to_bits())?;
        }
        w.write_all(&self.radiant_prescalers)?;
        n += NUM_RADIANT_CHANNELS;
        n += write_u32(w, self.radiant_scaler_period.to_bits())?;
        for v in &self.radiant_thresholds {
            n += write_u32(w, *v)?;
        }
        for group in [
            &self.lt_scalers_fast,
            &self.lt_scalers_slow,
            &self.lt_scalers_slow_gated,
        ] {
            for v in group.iter() {
                n += write_u16(w, *v)?;
            }
        }
        w.write_all(&self.lt_trigger_thresholds)?;
        w.write_all(&self.lt_servo_thresholds)?;
        n += 2 * NUM_LT_CHANNELS;
        n += write_u32(w, self.lt_cycle_counter)?;
        n += write_u32(w, self.lt_delayed_pps.to_bits())?;
        w.write_all(&[
            self.calpulser.kind,
            self.calpulser.channel,
            self.calpulser.sweeping,
        ])?;
        n += 3;
        n += write_u32(w, self.calpulser.attenuation_db.to_bits())?;
        Ok(n)
    }
}

/// Per-channel DC baseline table. Lives behind a file mapping so a restart
/// can reuse the previous run's pedestals.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Pedestal {
    pub station: u16,
    pub when_secs: u64,
    pub nevents: u32,
    pub vbias: [f32; 2],
    pub pedestals: [[u16; RADIANT_MAX_SAMPLES]; NUM_RADIANT_CHANNELS],
}

impl Default for Pedestal {
    fn default() -> Self {
        Pedestal {
            station: 0,
            when_secs: 0,
            nevents: 0,
            vbias: [0.0; 2],
            pedestals: [[0; RADIANT_MAX_SAMPLES]; NUM_RADIANT_CHANNELS],
        }
    }
}

impl Pedestal {
    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self as *const Pedestal as *const u8, size_of::<Pedestal>())
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Pedestal> {
        if bytes.len() < size_of::<Pedestal>() {
            return None;
        }
        Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const Pedestal) })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        let mut n = 0;
        n += write_u16(w, PEDESTAL_MAGIC)?;
        n += write_u16(w, RECORD_VERSION)?;
        n += write_u16(w, self.station)?;
        n += write_u64(w, self.when_secs)?;
        n += write_u32(w, self.nevents)?;
        n += write_u32(w, self.vbias[0].to_bits())?;
        n += write_u32(w, self.vbias[1].to_bits())?;
        for chan in &self.pedestals {
            for v in chan {
                n += write_u16(w, *v)?;
            }
        }
        Ok(n)
    }
}

fn write_u16<W: Write>(w: &mut W, v: u16) -> io::Result<usize> {
    w.write_all(&v.to_le_bytes())?;
    Ok(2)
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<usize> {
    w.write_all(&v.to_le_bytes())?;
    Ok(4)
}

fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<usize> {
    w.write_all(&v.to_le_bytes())?;
    Ok(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dac_conversion_round_trips_at_full_scale() {
        assert_eq!(volts_to_dac(0.0), 0);
        assert_eq!(volts_to_dac(2.5), RADIANT_DAC_MAX);
        assert_eq!(volts_to_dac(3.0), RADIANT_DAC_MAX);
        let dac = volts_to_dac(1.2);
        assert_eq!(dac, (1.2 * RADIANT_DAC_MAX as f64 / 2.5).round() as u32);
        assert!((dac_to_volts(dac) - 1.2).abs() < 1e-6);
    }

    #[test]
    fn header_write_counts_bytes() {
        let hd = EventHeader::default();
        let mut out = Vec::new();
        let n = hd.write_to(&mut out).unwrap();
        assert_eq!(n, out.len());
    }

    #[test]
    fn waveform_write_respects_mask_and_nsamples() {
        let mut wf = Waveform::default();
        wf.nsamples = 16;
        wf.readout_mask = 0b11;
        let mut out = Vec::new();
        let n = wf.write_to(&mut out).unwrap();
        // preamble + ids + 2 channels of 16 samples
        assert_eq!(n, out.len());
        assert_eq!(n, 2 + 2 + 4 + 4 + 2 + 2 + 4 + 2 * 16 * 2);
    }

    #[test]
    fn daqstatus_byte_image_round_trips() {
        let mut ds = DaqStatus::default();
        ds.station = 21;
        ds.radiant_thresholds[5] = 123_456;
        ds.lt_scalers_slow[2] = 77;
        ds.lt_delayed_pps = 1.18e8 / 11.8;
        let bytes = ds.as_bytes().to_vec();
        let back = DaqStatus::from_bytes(&bytes).unwrap();
        assert_eq!(back.station, 21);
        assert_eq!(back.radiant_thresholds[5], 123_456);
        assert_eq!(back.lt_scalers_slow[2], 77);
        assert_eq!(back.lt_delayed_pps, ds.lt_delayed_pps);
    }
}
