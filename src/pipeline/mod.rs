//! The worker threads: acquire → event queue → writer, and
//! monitor → status queue → writer. The status HTTP responder lives in
//! [`crate::serve`]; the main thread's setup/reload/teardown in
//! [`crate::daq`].

pub mod acquire;
pub mod monitor;
pub mod writer;

use crate::arena::Arena;
use crate::buf::{BufConsumer, BufProducer};
use crate::records::{DaqStatus, EventItem};

/// Pool of reusable event buffers; indices travel through the event ring.
pub type EventArena = Arena<EventItem>;

pub type EventIndexProducer = BufProducer<u32>;
pub type EventIndexConsumer = BufConsumer<u32>;
pub type StatusProducer = BufProducer<DaqStatus>;
pub type StatusConsumer = BufConsumer<DaqStatus>;
