//! Process-supervisor notifications over `$NOTIFY_SOCKET`.
//!
//! The supervisor expects a `WATCHDOG=1` datagram at least every watchdog
//! interval; callers feed from their own loops and the feeder rate-limits to
//! one datagram per ten seconds. Without a notify socket in the environment
//! everything is a no-op.

use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::Mutex;

/// Minimum spacing between WATCHDOG datagrams.
pub const FEED_INTERVAL: Duration = Duration::from_secs(10);

pub struct Watchdog {
    target: Option<(UnixDatagram, SocketAddr)>,
    last_feed: Mutex<Option<Instant>>,
}

impl Watchdog {
    /// Build from `$NOTIFY_SOCKET`; supports abstract (`@name`) and
    /// filesystem socket addresses.
    pub fn from_env() -> Watchdog {
        let target = std::env::var("NOTIFY_SOCKET").ok().and_then(|path| {
            let addr = if let Some(name) = path.strip_prefix('@') {
                SocketAddr::from_abstract_name(name.as_bytes()).ok()?
            } else {
                SocketAddr::from_pathname(&path).ok()?
            };
            let sock = UnixDatagram::unbound().ok()?;
            info!("[watchdog] notifying supervisor at {}", path);
            Some((sock, addr))
        });
        Watchdog { target, last_feed: Mutex::new(None) }
    }

    /// A watchdog with no supervisor attached.
    pub fn disabled() -> Watchdog {
        Watchdog { target: None, last_feed: Mutex::new(None) }
    }

    fn notify(&self, msg: &str) {
        if let Some((sock, addr)) = &self.target {
            if let Err(e) = sock.send_to_addr(msg.as_bytes(), addr) {
                debug!("[watchdog] notify failed: {}", e);
            }
        }
    }

    /// Tell the supervisor startup finished.
    pub fn ready(&self) {
        self.notify("READY=1");
    }

    /// Feed the watchdog, at most once per [`FEED_INTERVAL`].
    pub fn feed(&self) {
        let mut last = self.last_feed.lock();
        if let Some(at) = *last {
            if at.elapsed() < FEED_INTERVAL {
                return;
            }
        }
        *last = Some(Instant::now());
        drop(last);
        self.notify("WATCHDOG=1");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram as TestSock;
    use tempfile::TempDir;

    #[test]
    fn disabled_watchdog_is_inert() {
        let wd = Watchdog::disabled();
        wd.ready();
        wd.feed();
        wd.feed();
    }

    #[test]
    fn feed_is_rate_limited() {
        let dir = TempDir::new().unwrap();
        let sock_path = dir.path().join("notify.sock");
        let receiver = TestSock::bind(&sock_path).unwrap();
        receiver.set_nonblocking(true).unwrap();

        let addr = SocketAddr::from_pathname(&sock_path).unwrap();
        let wd = Watchdog {
            target: Some((UnixDatagram::unbound().unwrap(), addr)),
            last_feed: Mutex::new(None),
        };

        wd.feed();
        wd.feed();
        wd.feed();

        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"WATCHDOG=1");
        // the back-to-back feeds were suppressed
        assert!(receiver.recv(&mut buf).is_err());
    }
}
