//! Per-trial console transcripts.
//!
//! Every fragment seen during a trial is written verbatim to
//! `<prefix>_<index>_SUCCESS.txt`. When the trial ends the handle is closed
//! and the file is renamed to match the outcome.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::classifier::Outcome;
use crate::error::{HarnessError, Result};

/// File name suffix for an outcome.
pub fn status_suffix(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Success => "SUCCESS",
        Outcome::Failure => "FAIL",
        Outcome::Unknown => "TIMEOUT",
    }
}

/// `<prefix>_<index>_<STATUS>.txt`
pub fn log_path(prefix: &str, index: u32, outcome: Outcome) -> PathBuf {
    PathBuf::from(format!("{prefix}_{index}_{}.txt", status_suffix(outcome)))
}

/// Open transcript for one trial.
///
/// Dropping it without [`finish`](Self::finish) still closes the file; the
/// transcript then keeps its provisional name.
pub struct TrialLog {
    writer: BufWriter<File>,
    path: PathBuf,
    prefix: String,
    index: u32,
}

impl TrialLog {
    /// Create (or truncate) the provisional `_SUCCESS` transcript.
    pub fn create(prefix: &str, index: u32) -> Result<Self> {
        let path = log_path(prefix, index, Outcome::Success);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| HarnessError::Log {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let file = File::create(&path).map_err(|source| HarnessError::Log {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "opened trial log");

        Ok(Self {
            writer: BufWriter::new(file),
            path,
            prefix: prefix.to_string(),
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a fragment exactly as received.
    pub fn append(&mut self, fragment: &str) -> Result<()> {
        self.writer
            .write_all(fragment.as_bytes())
            .and_then(|()| self.writer.flush())
            .map_err(|source| HarnessError::Log {
                path: self.path.clone(),
                source,
            })
    }

    /// Close the transcript and give it its final name.
    pub fn finish(self, outcome: Outcome) -> Result<PathBuf> {
        let Self {
            mut writer,
            path,
            prefix,
            index,
        } = self;

        writer.flush().map_err(|source| HarnessError::Log {
            path: path.clone(),
            source,
        })?;
        drop(writer);

        let target = log_path(&prefix, index, outcome);
        if target != path {
            fs::rename(&path, &target).map_err(|source| HarnessError::Log {
                path: path.clone(),
                source,
            })?;
            debug!(from = %path.display(), to = %target.display(), "renamed trial log");
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn prefix_in(dir: &Path) -> String {
        dir.join("log").display().to_string()
    }

    #[test]
    fn names_follow_prefix_index_status() {
        assert_eq!(log_path("log", 0, Outcome::Success), PathBuf::from("log_0_SUCCESS.txt"));
        assert_eq!(log_path("run", 7, Outcome::Failure), PathBuf::from("run_7_FAIL.txt"));
        assert_eq!(log_path("run", 2, Outcome::Unknown), PathBuf::from("run_2_TIMEOUT.txt"));
    }

    #[test]
    fn success_keeps_provisional_name() {
        let tmp = tempfile::tempdir().unwrap();
        let prefix = prefix_in(tmp.path());

        let mut log = TrialLog::create(&prefix, 0).unwrap();
        log.append("boot\n").unwrap();
        log.append("Provisioning was successful.\n").unwrap();
        let final_path = log.finish(Outcome::Success).unwrap();

        assert_eq!(final_path, tmp.path().join("log_0_SUCCESS.txt"));
        assert_eq!(
            fs::read_to_string(&final_path).unwrap(),
            "boot\nProvisioning was successful.\n"
        );
    }

    #[test]
    fn failure_renames_to_fail() {
        let tmp = tempfile::tempdir().unwrap();
        let prefix = prefix_in(tmp.path());

        let mut log = TrialLog::create(&prefix, 3).unwrap();
        log.append("Rebooting...\n").unwrap();
        let final_path = log.finish(Outcome::Failure).unwrap();

        assert_eq!(final_path, tmp.path().join("log_3_FAIL.txt"));
        assert!(final_path.exists());
        assert!(!tmp.path().join("log_3_SUCCESS.txt").exists());
    }

    #[test]
    fn timeout_renames_to_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let log = TrialLog::create(&prefix_in(tmp.path()), 1).unwrap();
        let final_path = log.finish(Outcome::Unknown).unwrap();
        assert_eq!(final_path, tmp.path().join("log_1_TIMEOUT.txt"));
    }

    #[test]
    fn appends_are_visible_before_finish() {
        let tmp = tempfile::tempdir().unwrap();
        let mut log = TrialLog::create(&prefix_in(tmp.path()), 0).unwrap();
        log.append("partial").unwrap();
        assert_eq!(fs::read_to_string(log.path()).unwrap(), "partial");
    }

    #[test]
    fn drop_without_finish_leaves_provisional_file() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut log = TrialLog::create(&prefix_in(tmp.path()), 5).unwrap();
            log.append("cut short").unwrap();
        }
        let path = tmp.path().join("log_5_SUCCESS.txt");
        assert_eq!(fs::read_to_string(path).unwrap(), "cut short");
    }

    #[test]
    fn creates_missing_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let prefix = tmp.path().join("runs").join("bench-a").display().to_string();
        let log = TrialLog::create(&prefix, 0).unwrap();
        assert!(log.path().exists());
    }

    #[test]
    fn existing_transcript_is_truncated() {
        let tmp = tempfile::tempdir().unwrap();
        let prefix = prefix_in(tmp.path());
        fs::write(tmp.path().join("log_0_SUCCESS.txt"), "stale run").unwrap();

        let log = TrialLog::create(&prefix, 0).unwrap();
        let path = log.finish(Outcome::Success).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "");
    }

    #[test]
    fn unwritable_location_is_a_log_error() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("file");
        fs::write(&blocker, "").unwrap();
        let prefix = blocker.join("log").display().to_string();

        let err = TrialLog::create(&prefix, 0).err().unwrap();
        assert!(matches!(err, HarnessError::Log { .. }));
    }

    proptest! {
        #[test]
        fn transcript_preserves_every_fragment_in_order(
            fragments in proptest::collection::vec("[ -~\r\n]{1,64}", 0..20),
        ) {
            let tmp = tempfile::tempdir().unwrap();
            let mut log = TrialLog::create(&prefix_in(tmp.path()), 0).unwrap();
            for f in &fragments {
                log.append(f).unwrap();
            }
            let path = log.finish(Outcome::Failure).unwrap();
            prop_assert_eq!(fs::read_to_string(path).unwrap(), fragments.concat());
        }
    }
}
