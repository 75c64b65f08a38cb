//! Append-only event journal for a single run, with live fan-out.
//!
//! Events are stored as newline-delimited JSON in
//! `runs/<run_id>/logs/events.ndjson` and then handed to every registered
//! subscriber in registration order.
//!
//! Sequence assignment and the append share one critical section, so the
//! on-disk order is the sequence order. Subscriber callbacks run outside that
//! section, but under a delivery lock taken before it is released, so every
//! subscriber also sees events in sequence order.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::domain::{Event, EventKind, RunId};
use crate::error::{serialization_error, PersistContext, Result};

use super::lock;

/// Name of the journal file inside `runs/<run_id>/logs/`
pub const EVENTS_FILE: &str = "events.ndjson";

/// Callback invoked synchronously for every emitted event
pub type EventCallback = Box<dyn Fn(&Event) + Send + Sync + 'static>;

struct Slot {
    id: u64,
    callback: Mutex<Option<EventCallback>>,
}

impl Slot {
    fn deliver(&self, event: &Event) {
        let guard = lock(&self.callback);
        if let Some(callback) = guard.as_ref() {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!(
                    subscriber = self.id,
                    seq = ?event.seq,
                    event = event.label(),
                    "Event subscriber panicked; continuing delivery"
                );
            }
        }
    }
}

struct Journal {
    next_seq: u64,
    next_subscriber: u64,
    slots: Vec<Arc<Slot>>,
}

/// Per-run event journal
pub struct EventLog {
    run_id: RunId,
    events_path: PathBuf,
    journal: Mutex<Journal>,
    delivery: Mutex<()>,
}

impl EventLog {
    /// Create or open the journal for a run beneath `runs_root`.
    ///
    /// Sequence numbering continues after any events already on disk.
    pub fn open(run_id: RunId, runs_root: &Path) -> Result<Arc<Self>> {
        let logs_dir = runs_root.join(run_id.as_str()).join("logs");
        fs::create_dir_all(&logs_dir).persist_context(|| {
            format!("Failed to create logs directory: {}", logs_dir.display())
        })?;

        let events_path = logs_dir.join(EVENTS_FILE);
        let next_seq = if events_path.exists() {
            replay_file(&events_path)?
                .iter()
                .filter_map(|e| e.seq)
                .max()
                .map(|seq| seq + 1)
                .unwrap_or(0)
        } else {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&events_path)
                .persist_context(|| {
                    format!("Failed to create events file: {}", events_path.display())
                })?;
            0
        };

        Ok(Arc::new(Self {
            run_id,
            events_path,
            journal: Mutex::new(Journal {
                next_seq,
                next_subscriber: 0,
                slots: Vec::new(),
            }),
            delivery: Mutex::new(()),
        }))
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Location of the NDJSON journal
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Register a callback for every subsequently emitted event.
    ///
    /// Callbacks run on the emitting thread and must not emit into, or
    /// unsubscribe from, the same log.
    pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut journal = lock(&self.journal);
        let id = journal.next_subscriber;
        journal.next_subscriber += 1;

        let slot = Arc::new(Slot {
            id,
            callback: Mutex::new(Some(Box::new(callback))),
        });
        journal.slots.push(Arc::clone(&slot));
        debug!(run_id = %self.run_id, subscriber = id, "Subscriber registered");

        Subscription {
            slot,
            log: Arc::downgrade(self),
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        lock(&self.journal).slots.len()
    }

    /// Emit an event: assign its sequence number, stamp the run id, append it
    /// to the journal, then notify subscribers.
    ///
    /// A pre-assigned sequence number below the next unused one is replaced,
    /// so numbers never repeat. A failed append is returned to the caller and
    /// consumes no sequence number.
    pub fn emit(&self, mut event: Event) -> Result<Event> {
        let (slots, delivery) = {
            let mut journal = lock(&self.journal);

            event.run_id = self.run_id.clone();
            let seq = match event.seq {
                Some(seq) if seq >= journal.next_seq => seq,
                Some(stale) => {
                    warn!(
                        run_id = %self.run_id,
                        seq = stale,
                        next_seq = journal.next_seq,
                        "Pre-assigned sequence already used; renumbering"
                    );
                    journal.next_seq
                }
                None => journal.next_seq,
            };
            event.seq = Some(seq);

            self.append(&event)?;
            journal.next_seq = seq + 1;

            (journal.slots.clone(), lock(&self.delivery))
        };

        for slot in &slots {
            slot.deliver(&event);
        }
        drop(delivery);

        Ok(event)
    }

    /// Convenience wrapper: build and emit an event of the given kind
    pub fn emit_kind(&self, kind: EventKind) -> Result<Event> {
        self.emit(Event::new(self.run_id.clone(), kind))
    }

    /// Replay every journaled event in order
    pub fn replay(&self) -> Result<Vec<Event>> {
        replay_file(&self.events_path)
    }

    fn append(&self, event: &Event) -> Result<()> {
        let mut line = serde_json::to_string(event).map_err(serialization_error("event"))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .persist_context(|| {
                format!("Failed to open events file: {}", self.events_path.display())
            })?;

        file.lock_exclusive()
            .persist_context(|| "Failed to acquire file lock on events.ndjson".to_string())?;
        file.write_all(line.as_bytes())
            .persist_context(|| "Failed to write event".to_string())?;
        file.flush()
            .persist_context(|| "Failed to flush event".to_string())?;

        // Lock is released when file is dropped
        Ok(())
    }

    fn detach(&self, id: u64) {
        lock(&self.journal).slots.retain(|slot| slot.id != id);
    }
}

/// Handle returned by [`EventLog::subscribe`]
pub struct Subscription {
    slot: Arc<Slot>,
    log: Weak<EventLog>,
}

impl Subscription {
    /// Deregister the callback. Idempotent.
    ///
    /// Waits for an in-flight delivery to this subscriber to finish; once this
    /// returns the callback is never invoked again.
    pub fn unsubscribe(&self) {
        let removed = lock(&self.slot.callback).take();
        if removed.is_none() {
            return;
        }
        if let Some(log) = self.log.upgrade() {
            log.detach(self.slot.id);
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.slot.callback).is_some()
    }
}

/// Read a journal file back into events, skipping blank lines
pub fn replay_file(path: &Path) -> Result<Vec<Event>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)
        .persist_context(|| format!("Failed to open events file: {}", path.display()))?;

    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.persist_context(|| format!("Failed to read events file: {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line)
            .map_err(serialization_error(format!("event line: {}", line)))?;
        events.push(event);
    }

    Ok(events)
}
