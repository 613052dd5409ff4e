//! Bounded in-memory buffer of capture records

use crate::record::CaptureRecord;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default maximum number of retained captures.
pub const DEFAULT_CAPACITY: usize = 100;

/// Bounded FIFO of capture records.
///
/// `append` assigns strictly increasing insertion ordinals; when the buffer
/// is full the oldest record is dropped. Operators address records by
/// 1-based position into the current contents, so after eviction the oldest
/// surviving record is position 1.
pub struct CaptureBuffer {
  inner: Mutex<Inner>,
}

struct Inner {
  records: VecDeque<CaptureRecord>,
  capacity: usize,
  next_ordinal: u64,
}

impl CaptureBuffer {
  /// Create a buffer retaining at most `capacity` records.
  pub fn new(capacity: usize) -> Self {
    Self {
      inner: Mutex::new(Inner {
        records: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
        capacity: capacity.max(1),
        next_ordinal: 1,
      }),
    }
  }

  /// Append a record, evicting the oldest when full.
  ///
  /// Returns the insertion ordinal assigned to the record.
  pub fn append(&self, mut record: CaptureRecord) -> u64 {
    let mut inner = self.lock();
    let ordinal = inner.next_ordinal;
    inner.next_ordinal += 1;
    record.ordinal = ordinal;
    if inner.records.len() == inner.capacity {
      if let Some(evicted) = inner.records.pop_front() {
        tracing::debug!(
          ordinal = evicted.ordinal,
          url = %evicted.request.url,
          "capture buffer full, dropping oldest record"
        );
      }
    }
    inner.records.push_back(record);
    ordinal
  }

  /// Retrieve the record at 1-based `position` in the current contents.
  pub fn get(&self, position: usize) -> Option<CaptureRecord> {
    if position == 0 {
      return None;
    }
    self.lock().records.get(position - 1).cloned()
  }

  /// Snapshot of the current contents in insertion order.
  pub fn list(&self) -> Vec<CaptureRecord> {
    self.lock().records.iter().cloned().collect()
  }

  /// Drop every record.
  pub fn clear(&self) {
    self.lock().records.clear();
  }

  /// Number of retained records.
  pub fn len(&self) -> usize {
    self.lock().records.len()
  }

  /// Whether the buffer holds no records.
  pub fn is_empty(&self) -> bool {
    self.lock().records.is_empty()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

impl Default for CaptureBuffer {
  fn default() -> Self {
    Self::new(DEFAULT_CAPACITY)
  }
}
