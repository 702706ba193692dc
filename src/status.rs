//! Fixed-size shared-memory files: the daqstatus snapshot other processes
//! map read-only for liveness monitoring, and the pedestal cache that lets a
//! restart reuse the previous run's pedestals.
//!
//! Both files are sized exactly to their record, truncated into shape on
//! open, and flushed asynchronously after writes. A file that already had
//! the right size yields its prior contents back to the caller.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use log::warn;
use memmap2::MmapMut;

use crate::records::{DaqStatus, Pedestal};

pub struct StatusFile {
    map: MmapMut,
}

impl StatusFile {
    /// Open (or create) the shared status file. Returns the mapping and,
    /// when the file already held a full image, the prior snapshot.
    pub fn open(path: &Path) -> io::Result<(StatusFile, Option<DaqStatus>)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let want = size_of::<DaqStatus>() as u64;
        let had = file.metadata()?.len();
        if had != want {
            file.set_len(want)?;
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        let prior = if had == want { DaqStatus::from_bytes(&map) } else { None };
        Ok((StatusFile { map }, prior))
    }

    /// Mirror a snapshot into the map.
    pub fn write(&mut self, ds: &DaqStatus) {
        self.map.copy_from_slice(ds.as_bytes());
    }

    /// Schedule the dirty pages for writeback without waiting.
    pub fn flush_async(&self) {
        if let Err(e) = self.map.flush_async() {
            warn!("[status] async flush failed: {}", e);
        }
    }
}

pub struct PedestalFile {
    map: MmapMut,
}

impl PedestalFile {
    /// Open (or create) the pedestal cache file. A full-size prior image is
    /// returned so subtraction can start from the cached table.
    pub fn open(path: &Path) -> io::Result<(PedestalFile, Option<Pedestal>)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let want = size_of::<Pedestal>() as u64;
        let had = file.metadata()?.len();
        if had != want {
            file.set_len(want)?;
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        let prior = if had == want { Pedestal::from_bytes(&map) } else { None };
        Ok((PedestalFile { map }, prior))
    }

    pub fn write(&mut self, peds: &Pedestal) {
        self.map.copy_from_slice(peds.as_bytes());
    }

    /// Synchronous flush; pedestals are written once per run, so waiting is
    /// fine.
    pub fn flush(&self) -> io::Result<()> {
        self.map.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn status_file_round_trips_across_opens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daqstatus.dat");

        let (mut sf, prior) = StatusFile::open(&path).unwrap();
        assert!(prior.is_none());

        let mut ds = DaqStatus::default();
        ds.station = 11;
        ds.radiant_thresholds[3] = 42;
        sf.write(&ds);
        sf.flush_async();
        drop(sf);

        let (_sf, prior) = StatusFile::open(&path).unwrap();
        let prior = prior.unwrap();
        assert_eq!(prior.station, 11);
        assert_eq!(prior.radiant_thresholds[3], 42);
    }

    #[test]
    fn wrong_size_file_is_resized_and_yields_no_prior() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daqstatus.dat");
        std::fs::write(&path, b"short").unwrap();

        let (_sf, prior) = StatusFile::open(&path).unwrap();
        assert!(prior.is_none());
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            size_of::<DaqStatus>() as u64
        );
    }

    #[test]
    fn pedestal_file_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("peds.dat");

        let (mut pf, prior) = PedestalFile::open(&path).unwrap();
        assert!(prior.is_none());
        let mut peds = Pedestal::default();
        peds.nevents = 512;
        peds.pedestals[1][7] = 2048;
        pf.write(&peds);
        pf.flush().unwrap();
        drop(pf);

        let (_pf, prior) = PedestalFile::open(&path).unwrap();
        let prior = prior.unwrap();
        assert_eq!(prior.nevents, 512);
        assert_eq!(prior.pedestals[1][7], 2048);
    }
}
