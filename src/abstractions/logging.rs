use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::abstractions::{EventKind, EventRecord, MachineId};

/// Receives one record per tick. Must not block the machine.
pub trait EventSink: Send + 'static {
    fn record(&self, record: EventRecord);
}

impl EventSink for mpsc::UnboundedSender<EventRecord> {
    fn record(&self, record: EventRecord) {
        // A closed logger only means nobody is listening any more.
        let _ = self.send(record);
    }
}

/// Keeps every record in memory, shared across clones.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<EventRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn records_for(&self, machine_id: MachineId) -> Vec<EventRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.machine_id == machine_id)
            .collect()
    }
}

impl EventSink for MemorySink {
    fn record(&self, record: EventRecord) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }
}

/// `<unix seconds> - <KIND> - Logical Clock: <n> - <details>`
pub fn format_line(record: &EventRecord) -> String {
    let seconds = record
        .timestamp
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default();
    let details = match &record.kind {
        EventKind::Internal => "Internal event occurred".to_string(),
        EventKind::Send { targets } if targets.is_empty() => "Sent to no peer".to_string(),
        EventKind::Send { targets } => {
            let targets: Vec<String> = targets.iter().map(ToString::to_string).collect();
            format!("Sent to VM {}", targets.join(", "))
        }
        EventKind::Receive {
            from, queue_length, ..
        } => format!("Received from VM {from}. Queue length: {queue_length}"),
    };
    format!(
        "{seconds:.3} - {} - Logical Clock: {} - {details}",
        record.kind, record.logical_clock
    )
}

pub fn log_path(dir: &Path, machine_id: MachineId, trial: u32) -> PathBuf {
    dir.join(format!("vm_{machine_id}_trial{trial}.log"))
}

/// Writes records to one append-only file per machine and trial.
///
/// Runs until every sender of its channel is dropped.
pub struct EventLogger {
    dir: PathBuf,
    trial: u32,
    event_receiver: mpsc::UnboundedReceiver<EventRecord>,
}

impl EventLogger {
    pub fn new(
        dir: impl Into<PathBuf>,
        trial: u32,
    ) -> (Self, mpsc::UnboundedSender<EventRecord>) {
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let logger = Self {
            dir: dir.into(),
            trial,
            event_receiver,
        };
        (logger, event_sender)
    }

    /// Returns the number of lines written.
    pub fn start(mut self) -> JoinHandle<io::Result<u64>> {
        tokio::spawn(async move {
            fs::create_dir_all(&self.dir).await?;
            let mut files: HashMap<MachineId, File> = HashMap::new();
            let mut written = 0;

            while let Some(record) = self.event_receiver.recv().await {
                let line = format_line(&record);
                debug!(machine = record.machine_id, "{line}");

                let file = match files.entry(record.machine_id) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => {
                        let path = log_path(&self.dir, record.machine_id, self.trial);
                        let file = OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(&path)
                            .await?;
                        entry.insert(file)
                    }
                };
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await?;
                file.flush().await?;
                written += 1;
            }
            Ok::<u64, io::Error>(written)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn record(machine_id: MachineId, kind: EventKind, logical_clock: u64) -> EventRecord {
        EventRecord {
            machine_id,
            timestamp: UNIX_EPOCH + Duration::from_millis(1_700_000_000_250),
            kind,
            logical_clock,
        }
    }

    #[test]
    fn receive_line_carries_sender_and_queue_length() {
        let line = format_line(&record(
            2,
            EventKind::Receive {
                from: 1,
                sender_clock: 3,
                queue_length: 1,
            },
            4,
        ));
        assert_eq!(
            line,
            "1700000000.250 - RECEIVE - Logical Clock: 4 - Received from VM 1. Queue length: 1"
        );
    }

    #[test]
    fn send_and_internal_lines() {
        let send = format_line(&record(1, EventKind::Send { targets: vec![2, 3] }, 7));
        assert!(send.ends_with("- SEND - Logical Clock: 7 - Sent to VM 2, 3"));

        let internal = format_line(&record(1, EventKind::Internal, 8));
        assert!(internal.ends_with("- INTERNAL - Logical Clock: 8 - Internal event occurred"));
    }

    #[test]
    fn memory_sink_filters_by_machine() {
        let sink = MemorySink::new();
        sink.record(record(1, EventKind::Internal, 1));
        sink.clone().record(record(2, EventKind::Internal, 1));
        sink.record(record(1, EventKind::Internal, 2));

        assert_eq!(sink.records().len(), 3);
        let clocks: Vec<u64> = sink.records_for(1).iter().map(|r| r.logical_clock).collect();
        assert_eq!(clocks, vec![1, 2]);
    }

    #[tokio::test]
    async fn logger_writes_one_file_per_machine() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, sender) = EventLogger::new(dir.path(), 4);
        let handle = logger.start();

        sender.record(EventRecord {
            timestamp: SystemTime::now(),
            ..record(1, EventKind::Internal, 1)
        });
        sender.record(record(2, EventKind::Send { targets: vec![1] }, 1));
        sender.record(record(1, EventKind::Internal, 2));
        drop(sender);

        assert_eq!(handle.await.unwrap().unwrap(), 3);

        let first = std::fs::read_to_string(log_path(dir.path(), 1, 4)).unwrap();
        let second = std::fs::read_to_string(log_path(dir.path(), 2, 4)).unwrap();
        assert_eq!(first.lines().count(), 2);
        assert!(first.lines().last().unwrap().contains("Logical Clock: 2"));
        assert!(second.contains("Sent to VM 1"));
    }
}
