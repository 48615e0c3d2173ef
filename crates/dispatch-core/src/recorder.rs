//! CDR sinks
//!
//! A [`Recorder`] receives every finished [`CallDetailRecord`]. Recorders are
//! grouped in a [`RecorderSet`] that is shared between the queue (rejected
//! calls) and the operator pool (serviced calls), and survives pool
//! hot-swaps by reference.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cdr::CallDetailRecord;
use crate::error::Result;

/// Width of the banner written at the top of a CDR file
const BANNER_WIDTH: usize = 136;

/// Write-only consumer of call detail records
///
/// Implementations must tolerate calls from any operator thread.
pub trait Recorder: Send + Sync {
    /// Persist one record
    fn write(&self, cdr: &CallDetailRecord) -> Result<()>;
}

/// Fan-out over all registered recorders
///
/// Writes are serialized by a lock of their own, separate from any queue
/// lock, so a slow sink never stalls admission.
#[derive(Default)]
pub struct RecorderSet {
    recorders: Mutex<Vec<Arc<dyn Recorder>>>,
}

impl RecorderSet {
    /// Create a set from the given recorders
    pub fn new(recorders: Vec<Arc<dyn Recorder>>) -> Self {
        Self {
            recorders: Mutex::new(recorders),
        }
    }

    /// Empty set; records are dropped until a recorder is added
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register another recorder
    pub fn add(&self, recorder: Arc<dyn Recorder>) {
        self.recorders.lock().push(recorder);
    }

    /// Replace every registered recorder
    pub fn replace(&self, recorders: Vec<Arc<dyn Recorder>>) {
        *self.recorders.lock() = recorders;
    }

    /// Number of registered recorders
    pub fn len(&self) -> usize {
        self.recorders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand the record to every recorder
    ///
    /// A failing recorder is logged and skipped; the others still receive
    /// the record.
    pub fn write(&self, cdr: &CallDetailRecord) {
        let recorders = self.recorders.lock();
        for recorder in recorders.iter() {
            if let Err(e) = recorder.write(cdr) {
                warn!(call_id = cdr.call_id, error = %e, "Failed to write CDR");
            }
        }
    }
}

impl std::fmt::Debug for RecorderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecorderSet")
            .field("recorders", &self.len())
            .finish()
    }
}

/// Recorder appending one line per CDR to a file
pub struct FileRecorder {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileRecorder {
    /// Open (or create) the file in append mode and write the column banner
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);

        let rule = "#".repeat(BANNER_WIDTH);
        writeln!(writer, "{}", rule)?;
        writeln!(
            writer,
            "#DT of the incoming call;Incoming Call ID;Caller number;DT of call termination;Call status;\
             DT operator answer;Operator ID;Call duration#"
        )?;
        writeln!(writer, "{}", rule)?;
        writer.flush()?;

        info!("📝 CDR file opened: {}", path.display());
        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    /// Location of the CDR file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Recorder for FileRecorder {
    fn write(&self, cdr: &CallDetailRecord) -> Result<()> {
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", cdr.to_record_line())?;
        writer.flush()?;
        debug!(call_id = cdr.call_id, status = %cdr.status, "CDR written to file");
        Ok(())
    }
}

/// Recorder keeping records in memory
#[derive(Default)]
pub struct MemoryRecorder {
    records: Mutex<Vec<CallDetailRecord>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all records received so far
    pub fn records(&self) -> Vec<CallDetailRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Recorder for MemoryRecorder {
    fn write(&self, cdr: &CallDetailRecord) -> Result<()> {
        self.records.lock().push(cdr.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdr::CallStatus;
    use crate::error::DispatchError;
    use chrono::Local;

    struct FailingRecorder;

    impl Recorder for FailingRecorder {
        fn write(&self, _cdr: &CallDetailRecord) -> Result<()> {
            Err(DispatchError::internal("disk full"))
        }
    }

    fn cdr(number: &str) -> CallDetailRecord {
        let mut cdr = CallDetailRecord::new(Arc::from(number), Local::now());
        cdr.finish_unserviced(CallStatus::Overloaded);
        cdr
    }

    #[test]
    fn test_fan_out_skips_failing_recorder() {
        let memory = Arc::new(MemoryRecorder::new());
        let set = RecorderSet::new(vec![Arc::new(FailingRecorder), memory.clone()]);

        set.write(&cdr("100"));
        set.write(&cdr("200"));

        assert_eq!(memory.len(), 2);
        assert_eq!(&*memory.records()[1].number, "200");
    }

    #[test]
    fn test_replace_recorders() {
        let first = Arc::new(MemoryRecorder::new());
        let second = Arc::new(MemoryRecorder::new());
        let set = RecorderSet::new(vec![first.clone()]);

        set.write(&cdr("1"));
        set.replace(vec![second.clone()]);
        set.write(&cdr("2"));

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_file_recorder_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cdr.txt");

        let recorder = FileRecorder::open(&path).unwrap();
        recorder.write(&cdr("89990001122")).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].chars().all(|c| c == '#'));
        assert!(lines[1].starts_with("#DT of the incoming call"));
        assert!(lines[3].contains(";89990001122;"));
        assert!(lines[3].contains(";Overloaded;"));
        assert!(lines[3].ends_with("0s"));
    }
}
