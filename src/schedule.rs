use std::sync::{RwLock, RwLockReadGuard};

use tracing::error;

use crate::error::{ReplayError, Result};

/// One packet of the recorded timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleRecord {
    pub id: u32,
    /// Milliseconds since the trace's own epoch.
    pub release_time: u64,
    pub size: u32,
    pub priority: i32,
}

/// Position in the store. `Start` sits before the first record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Cursor {
    #[default]
    Start,
    At(usize),
}

impl Cursor {
    fn next_index(self) -> usize {
        match self {
            Cursor::Start => 0,
            Cursor::At(i) => i + 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Found { index: usize, record: ScheduleRecord },
    NotFound,
}

/// Insertion-ordered schedule. Loading may overlap interception, so appends
/// and lookups share one reader/writer lock.
#[derive(Debug, Default)]
pub struct ScheduleStore {
    records: RwLock<Vec<ScheduleRecord>>,
}

impl ScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<ScheduleRecord>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn append(&self, record: ScheduleRecord) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if records.try_reserve(1).is_err() {
            error!(id = record.id, "cannot grow schedule store");
            return Err(ReplayError::ResourceExhaustion("schedule store"));
        }
        records.push(record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lazy walk in insertion order, one record per step under the read
    /// lock. Calling again restarts from the first record.
    pub fn iterate(&self) -> Records<'_> {
        Records {
            store: self,
            next: 0,
        }
    }

    pub fn clear(&self) {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Forward-only scan for `id`, starting just after `cursor`.
    pub fn find_after(&self, cursor: Cursor, id: u32) -> Lookup {
        let records = self.read();
        let start = cursor.next_index();
        records
            .get(start..)
            .and_then(|tail| tail.iter().position(|r| r.id == id))
            .map_or(Lookup::NotFound, |offset| Lookup::Found {
                index: start + offset,
                record: records[start + offset],
            })
    }

    /// True when `cursor` is on (or past) the last record.
    pub fn is_last(&self, cursor: Cursor) -> bool {
        cursor.next_index() >= self.read().len()
    }
}

/// Iterator returned by [`ScheduleStore::iterate`]. Records appended while
/// it is live are picked up; a `clear` ends it.
#[derive(Debug, Clone)]
pub struct Records<'a> {
    store: &'a ScheduleStore,
    next: usize,
}

impl Iterator for Records<'_> {
    type Item = ScheduleRecord;

    fn next(&mut self) -> Option<ScheduleRecord> {
        let record = self.store.read().get(self.next).copied()?;
        self.next += 1;
        Some(record)
    }
}

#[cfg(test)]
pub(crate) fn record(id: u32, release_time: u64) -> ScheduleRecord {
    ScheduleRecord {
        id,
        release_time,
        size: 1500,
        priority: 0,
    }
}
