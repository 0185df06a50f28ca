use std::borrow::Borrow;
use std::hash::{Hash, Hasher};
use std::io;
use std::slice;

use fxhash::FxHashMap;

use crate::memory::Memory;
use crate::object::{object_size, ObjectRef};
use crate::segment::Segment;

/// Sizing for a [`Log`].
#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
  /// Total bytes to request from the operating system.
  pub memory_size: usize,
  /// Size of one segment; `memory_size / segment_size` is the number of
  /// ring slots.
  pub segment_size: usize,
}

/// Index key: a view into the key bytes of the live object the entry
/// points to. No second copy of the key is kept anywhere.
///
/// Soundness rests on the log's index invariant: an entry is removed
/// before the object holding its key bytes is expired or its segment is
/// recycled, so the view can never dangle while it is inside the map.
struct KeyRef {
  ptr: *const u8,
  len: usize,
}

impl KeyRef {
  fn of(object: &ObjectRef) -> Self {
    let key = object.key();
    Self {
      ptr: key.as_ptr(),
      len: key.len(),
    }
  }

  fn as_slice(&self) -> &[u8] {
    unsafe { slice::from_raw_parts(self.ptr, self.len) }
  }
}

impl Borrow<[u8]> for KeyRef {
  fn borrow(&self) -> &[u8] {
    self.as_slice()
  }
}

impl Hash for KeyRef {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.as_slice().hash(state)
  }
}

impl PartialEq for KeyRef {
  fn eq(&self, other: &Self) -> bool {
    self.as_slice() == other.as_slice()
  }
}

impl Eq for KeyRef {}

/// A log of objects.
///
/// Owns one mapped memory region split into a ring of segments. `head`
/// is the oldest in-use slot and `tail` the one receiving appends; the
/// tail never steps onto the head, so the slots between them (going
/// forward from the tail) are always clean.
pub struct Log {
  #[allow(dead_code)]
  memory: Memory,
  segments: Vec<Segment>,
  head: usize,
  tail: usize,
  index: FxHashMap<KeyRef, ObjectRef>,
  segment_size: usize,
}

impl Log {
  /// Map memory and carve it into segments.
  pub fn new(config: &LogConfig) -> io::Result<Self> {
    assert!(config.segment_size > 0, "segment size must be non-zero");
    assert!(
      config.memory_size >= config.segment_size,
      "memory must hold at least one segment"
    );

    let memory = Memory::map(config.memory_size)?;

    let nr_segments = config.memory_size / config.segment_size;
    let segments = (0..nr_segments)
      .map(|i| {
        // SAFETY: Disjoint segment_size slices of the mapping, which
        //         lives as long as the log does.
        unsafe {
          Segment::new(
            memory.addr().add(i * config.segment_size),
            config.segment_size,
          )
        }
      })
      .collect();

    Ok(Self {
      memory,
      segments,
      head: 0,
      tail: 0,
      index: FxHashMap::default(),
      segment_size: config.segment_size,
    })
  }

  /// Store a key/blob pair.
  ///
  /// Returns false if the object is larger than one segment, or if the
  /// ring is full and reclamation could not free a slot. On success any
  /// prior object with the same key is expired; its bytes come back when
  /// its segment is recycled.
  pub fn append(&mut self, key: &[u8], blob: &[u8]) -> bool {
    let size = object_size(key.len(), blob.len());
    if size > self.segment_size {
      return false;
    }

    if self.try_to_append(key, blob) {
      return true;
    }
    self.expire(size);
    self.try_to_append(key, blob)
  }

  /// Look up the blob stored for `key`.
  ///
  /// The returned view is valid until the next mutation of the log;
  /// callers that need it longer must copy it out.
  pub fn find(&self, key: &[u8]) -> Option<&[u8]> {
    self.index.get(key).map(|object| object.blob())
  }

  /// Expire the object stored for `key` and forget the key. Returns
  /// whether the key existed.
  pub fn remove(&mut self, key: &[u8]) -> bool {
    match self.index.remove_entry(key) {
      Some((_, object)) => {
        object.expire();
        true
      }
      None => false,
    }
  }

  fn try_to_append(&mut self, key: &[u8], blob: &[u8]) -> bool {
    if let Some(object) = self.segments[self.tail].append(key, blob) {
      self.index_insert(object);
      return true;
    }

    let next_tail = self.next(self.tail);
    if next_tail == self.head {
      return false;
    }
    self.tail = next_tail;

    match self.segments[self.tail].append(key, blob) {
      Some(object) => {
        self.index_insert(object);
        true
      }
      None => false,
    }
  }

  fn index_insert(&mut self, object: ObjectRef) {
    if let Some((_, old)) = self.index.remove_entry(object.key()) {
      old.expire();
    }
    self.index.insert(KeyRef::of(&object), object);
  }

  /// Recycle segments from the head of the ring until `reclaim_target`
  /// bytes have been freed or only the tail segment remains. Returns the
  /// number of bytes actually freed.
  ///
  /// Reclamation is strictly FIFO: whatever keys still live in a
  /// recycled segment cease to exist.
  fn expire(&mut self, reclaim_target: usize) -> usize {
    let mut nr_reclaimed = 0;
    while nr_reclaimed < reclaim_target && self.head != self.tail {
      nr_reclaimed += self.expire_segment(self.head);
      self.head = self.next(self.head);
    }
    nr_reclaimed
  }

  fn expire_segment(&mut self, idx: usize) -> usize {
    let segment = &self.segments[idx];
    let freed = segment.occupancy();

    for object in segment.objects() {
      if !object.is_expired() {
        self.index.remove(object.key());
      }
    }

    self.segments[idx].reset();
    freed
  }

  fn next(&self, idx: usize) -> usize {
    let next = idx + 1;
    match next == self.segments.len() {
      true => 0,
      false => next,
    }
  }
}
