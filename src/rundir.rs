//! Run bookkeeping on disk: the persisted run number, the per-run output
//! tree, free-space checks, atomic tmp-suffix publication and the
//! append-only list of finalized files.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use nix::fcntl::{Flock, FlockArg};
use nix::sys::statvfs::statvfs;

/// Suffix carried by every artifact until it is complete.
pub const TMP_SUFFIX: &str = ".tmp";

const RUN_SUBDIRS: &[&str] = &["waveforms", "header", "daqstatus", "aux", "cfg"];

/// Free space on the filesystem holding `path`, in MB.
pub fn free_space_mb(path: &Path) -> io::Result<u64> {
    let vfs = statvfs(path).map_err(io::Error::from)?;
    Ok(vfs.blocks_available() as u64 * vfs.fragment_size() as u64 / (1 << 20))
}

/// Station identifier from its fixed file; 0 with a warning when absent.
pub fn read_station_id(path: &Path) -> u16 {
    match fs::read_to_string(path) {
        Ok(text) => match text.trim().parse() {
            Ok(id) => id,
            Err(_) => {
                warn!("[run] unparseable station id in {}, using 0", path.display());
                0
            }
        },
        Err(_) => {
            warn!("[run] no station id at {}, using 0", path.display());
            0
        }
    }
}

/// Write `contents` under a tmp suffix, then rename into place.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = with_tmp_suffix(path);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

pub fn with_tmp_suffix(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(TMP_SUFFIX);
    PathBuf::from(os)
}

/// Strip a `.tmp` suffix by renaming; falls back to copy + unlink when the
/// rename crosses filesystems.
pub fn finalize_tmp(path: &Path) -> io::Result<PathBuf> {
    let name = path.to_string_lossy();
    let Some(final_name) = name.strip_suffix(TMP_SUFFIX) else {
        return Ok(path.to_path_buf());
    };
    let final_path = PathBuf::from(final_name);
    match fs::rename(path, &final_path) {
        Ok(()) => Ok(final_path),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            fs::copy(path, &final_path)?;
            fs::remove_file(path)?;
            Ok(final_path)
        }
        Err(e) => Err(e),
    }
}

/// The output tree of one run.
#[derive(Debug, Clone)]
pub struct RunDirs {
    pub run_number: u32,
    pub dir: PathBuf,
}

impl RunDirs {
    pub fn waveforms(&self) -> PathBuf {
        self.dir.join("waveforms")
    }
    pub fn header(&self) -> PathBuf {
        self.dir.join("header")
    }
    pub fn daqstatus(&self) -> PathBuf {
        self.dir.join("daqstatus")
    }
    pub fn aux(&self) -> PathBuf {
        self.dir.join("aux")
    }
    pub fn cfg(&self) -> PathBuf {
        self.dir.join("cfg")
    }
    pub fn file_list(&self) -> PathBuf {
        self.aux().join("acq-file-list.txt")
    }
    pub fn runinfo(&self) -> PathBuf {
        self.aux().join("runinfo.txt")
    }
    pub fn comment(&self) -> PathBuf {
        self.aux().join("comment.txt")
    }
    pub fn gain_codes(&self, station: u16) -> PathBuf {
        self.aux().join(format!("flower_gain_codes.{station}.txt"))
    }
    pub fn pedestals(&self) -> PathBuf {
        self.dir.join("pedestals.dat.gz")
    }
    pub fn bias_scan(&self) -> PathBuf {
        self.dir.join("bias_scan.dat.gz")
    }
}

/// Read and advance the persisted run number, derive a collision-free run
/// directory, and create its subtree.
///
/// The runfile update goes through a tmp file and rename so a crash cannot
/// leave a half-written number behind.
pub fn next_run(runfile: &Path, base_dir: &Path, allow_overwrite: bool) -> io::Result<RunDirs> {
    let mut run_number: u32 = match fs::read_to_string(runfile) {
        Ok(text) => text.trim().parse().unwrap_or(0),
        Err(_) => {
            warn!("[run] no runfile at {}, starting from run 0", runfile.display());
            0
        }
    };

    fs::create_dir_all(base_dir)?;
    let mut dir = base_dir.join(format!("run{run_number}"));
    if !allow_overwrite {
        while dir.exists() {
            run_number += 1;
            dir = base_dir.join(format!("run{run_number}"));
        }
    }

    if let Some(parent) = runfile.parent() {
        fs::create_dir_all(parent)?;
    }
    write_atomic(runfile, format!("{}\n", run_number + 1).as_bytes())?;

    fs::create_dir_all(&dir)?;
    for sub in RUN_SUBDIRS {
        fs::create_dir_all(dir.join(sub))?;
    }

    info!("[run] starting run {} in {}", run_number, dir.display());
    Ok(RunDirs { run_number, dir })
}

/// Append one finalized path to the run's file list, under an exclusive
/// advisory lock held for the duration of the write.
pub fn append_file_list(list_path: &Path, finalized: &Path) -> io::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(list_path)?;
    let mut locked: Flock<File> = Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| io::Error::from(errno))?;
    writeln!(locked, "{}", finalized.display())?;
    locked.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn run_number_advances_and_tree_is_created() {
        let dir = TempDir::new().unwrap();
        let runfile = dir.path().join("runfile");
        fs::write(&runfile, "41\n").unwrap();
        let base = dir.path().join("data");

        let run = next_run(&runfile, &base, false).unwrap();
        assert_eq!(run.run_number, 41);
        assert_eq!(run.dir, base.join("run41"));
        for sub in RUN_SUBDIRS {
            assert!(run.dir.join(sub).is_dir());
        }
        assert_eq!(fs::read_to_string(&runfile).unwrap().trim(), "42");
    }

    #[test]
    fn missing_runfile_starts_at_zero() {
        let dir = TempDir::new().unwrap();
        let runfile = dir.path().join("runfile");
        let run = next_run(&runfile, &dir.path().join("data"), false).unwrap();
        assert_eq!(run.run_number, 0);
        assert_eq!(fs::read_to_string(&runfile).unwrap().trim(), "1");
    }

    // Distinct runs must never share an output directory.
    #[test]
    fn colliding_run_dir_advances_until_free() {
        let dir = TempDir::new().unwrap();
        let runfile = dir.path().join("runfile");
        fs::write(&runfile, "5\n").unwrap();
        let base = dir.path().join("data");
        fs::create_dir_all(base.join("run5")).unwrap();
        fs::create_dir_all(base.join("run6")).unwrap();

        let run = next_run(&runfile, &base, false).unwrap();
        assert_eq!(run.run_number, 7);
        assert_eq!(fs::read_to_string(&runfile).unwrap().trim(), "8");
    }

    #[test]
    fn overwrite_policy_reuses_the_directory() {
        let dir = TempDir::new().unwrap();
        let runfile = dir.path().join("runfile");
        fs::write(&runfile, "5\n").unwrap();
        let base = dir.path().join("data");
        fs::create_dir_all(base.join("run5")).unwrap();

        let run = next_run(&runfile, &base, true).unwrap();
        assert_eq!(run.run_number, 5);
    }

    #[test]
    fn finalize_strips_the_tmp_suffix() {
        let dir = TempDir::new().unwrap();
        let tmp = dir.path().join("000001.wf.dat.gz.tmp");
        fs::write(&tmp, b"x").unwrap();
        let final_path = finalize_tmp(&tmp).unwrap();
        assert_eq!(final_path, dir.path().join("000001.wf.dat.gz"));
        assert!(final_path.exists());
        assert!(!tmp.exists());
    }

    #[test]
    fn file_list_appends_lines() {
        let dir = TempDir::new().unwrap();
        let list = dir.path().join("acq-file-list.txt");
        append_file_list(&list, Path::new("/a/b.dat.gz")).unwrap();
        append_file_list(&list, Path::new("/a/c.dat.gz")).unwrap();
        let text = fs::read_to_string(&list).unwrap();
        assert_eq!(text, "/a/b.dat.gz\n/a/c.dat.gz\n");
    }

    #[test]
    fn free_space_is_nonzero_on_a_real_fs() {
        let dir = TempDir::new().unwrap();
        assert!(free_space_mb(dir.path()).unwrap() > 0);
    }

    #[test]
    fn station_id_parses_or_defaults() {
        let dir = TempDir::new().unwrap();
        let f = dir.path().join("STATION_ID");
        fs::write(&f, "21\n").unwrap();
        assert_eq!(read_station_id(&f), 21);
        assert_eq!(read_station_id(&dir.path().join("missing")), 0);
    }
}
