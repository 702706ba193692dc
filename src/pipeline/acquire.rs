//! Acquire thread: sole user of the RADIANT SPI readout path.
//!
//! Each pass takes the radiant, flower and config read locks in that order,
//! polls for a triggered event, and on readiness fills an arena buffer and
//! publishes its index on the event ring. The two suspension points are the
//! bounded trigger poll and the ring push when the writer falls behind.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::{debug, info, warn};

use super::{EventArena, EventIndexProducer};
use crate::daq::Daq;

pub fn run(daq: Arc<Daq>, arena: Arc<EventArena>, mut tx: EventIndexProducer) {
    info!("[acquire] started");
    let mut nacquired: u64 = 0;

    while !daq.quit.load(Ordering::Acquire) {
        let radiant = daq.radiant.read();
        let flower = daq.flower.read();
        let cfg = daq.cfg.read();
        let poll_ms = cfg.radiant.readout.poll_ms;
        drop(cfg);

        if radiant.poll_trigger_ready(poll_ms) {
            let mut slot = arena.acquire();
            let filled = {
                let item = &mut *slot;
                match radiant.read_event(&mut item.hd, &mut item.wf) {
                    Ok(()) => {
                        if let Some(fl) = flower.as_ref() {
                            fl.fill_event_header(&mut item.hd);
                        }
                        item.hd.run_number = daq.run.run_number;
                        item.hd.station = daq.station;
                        item.wf.run_number = daq.run.run_number;
                        item.wf.station = daq.station;
                        true
                    }
                    Err(e) => {
                        warn!("[acquire] event read failed: {}", e);
                        false
                    }
                }
            };
            if filled {
                let idx = slot.into_index() as u32;
                // blocks while the ring is full; backpressure on the device
                tx.push(idx);
                nacquired += 1;
            }
        }

        drop(flower);
        drop(radiant);
    }

    debug!("[acquire] ring occupancy at exit: {}", tx.occupancy());
    info!("[acquire] exiting after {} events", nacquired);
}
