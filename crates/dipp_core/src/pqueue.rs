//! Bounded priority queues on top of an array-backed min-heap, ordered by a
//! batch's absolute deadline (`priority`, lower = sooner = more urgent).
//! Two named instances exist in the scheduler: `ingest` and `partial`.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use byteorder::{ByteOrder, LittleEndian};
use memmap2::MmapMut;

use crate::error::{DippError, DippResult};
use crate::model::{BatchIdentity, StorageMode};

pub const MAX_QUEUE_SIZE: usize = 100;
pub const MAX_PARTIAL_QUEUE_SIZE: usize = 10;
pub const LOW_QUEUE_DEPTH_THRESHOLD: usize = 30;

fn heapify_up(heap: &mut [BatchIdentity]) {
    let mut i = heap.len() - 1;
    while i > 0 {
        let parent = (i - 1) / 2;
        if heap[i].priority < heap[parent].priority {
            heap.swap(i, parent);
            i = parent;
        } else {
            break;
        }
    }
}

fn heapify_down(heap: &mut [BatchIdentity]) {
    let len = heap.len();
    let mut i = 0;
    loop {
        let left = 2 * i + 1;
        let right = 2 * i + 2;
        let mut smallest = i;
        if left < len && heap[left].priority < heap[smallest].priority {
            smallest = left;
        }
        if right < len && heap[right].priority < heap[smallest].priority {
            smallest = right;
        }
        if smallest == i {
            break;
        }
        heap.swap(i, smallest);
        i = smallest;
    }
}

pub trait PQueue: Send {
    fn enqueue(&mut self, batch: BatchIdentity) -> DippResult<()>;
    fn dequeue(&mut self) -> Option<BatchIdentity>;
    fn peek(&self) -> Option<BatchIdentity>;
    fn size(&self) -> usize;
}

/// Heap-backed queue: a `Vec` used as a fixed-capacity array heap, matching
/// the reference implementation's array-of-`MAX_QUEUE_SIZE` shape rather
/// than a general-purpose binary heap.
pub struct RamPQueue {
    items: Vec<BatchIdentity>,
    capacity: usize,
}

impl RamPQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }
}

impl PQueue for RamPQueue {
    fn enqueue(&mut self, batch: BatchIdentity) -> DippResult<()> {
        if self.items.len() >= self.capacity {
            return Err(DippError::QueueFull);
        }
        self.items.push(batch);
        heapify_up(&mut self.items);
        Ok(())
    }

    fn dequeue(&mut self) -> Option<BatchIdentity> {
        if self.items.is_empty() {
            return None;
        }
        let root = self.items[0].clone();
        let last = self.items.pop().unwrap();
        if !self.items.is_empty() {
            self.items[0] = last;
            heapify_down(&mut self.items);
        }
        Some(root)
    }

    fn peek(&self) -> Option<BatchIdentity> {
        self.items.first().cloned()
    }

    fn size(&self) -> usize {
        self.items.len()
    }
}

/// File-backed queue. The heap lives inside a memory-mapped record of
/// `capacity` fixed-size slots plus a size counter; every mutating operation
/// flushes before returning.
pub struct MmapPQueue {
    mmap: Mutex<MmapMut>,
    capacity: usize,
}

const SIZE_FIELD_LEN: usize = 8;

fn record_len(capacity: usize) -> usize {
    SIZE_FIELD_LEN + capacity * slot_len()
}

fn slot_len() -> usize {
    // uuid (fixed 36 bytes, NUL-padded), filename (fixed 128 bytes, NUL-padded),
    // pipeline_id, num_images, batch_size, shmid (4 bytes each), priority (8
    // bytes), progress (4 bytes), storage_mode (1 byte).
    36 + 128 + 4 + 4 + 4 + 4 + 8 + 4 + 1
}

fn write_fixed_str(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
    for b in &mut buf[n..] {
        *b = 0;
    }
}

fn read_fixed_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn write_slot(buf: &mut [u8], identity: &BatchIdentity) {
    write_fixed_str(&mut buf[0..36], &identity.uuid);
    write_fixed_str(&mut buf[36..164], &identity.filename);
    let mut off = 164;
    LittleEndian::write_i32(&mut buf[off..off + 4], identity.pipeline_id);
    off += 4;
    LittleEndian::write_i32(&mut buf[off..off + 4], identity.num_images);
    off += 4;
    LittleEndian::write_i32(&mut buf[off..off + 4], identity.batch_size);
    off += 4;
    LittleEndian::write_i32(&mut buf[off..off + 4], identity.shmid);
    off += 4;
    LittleEndian::write_i64(&mut buf[off..off + 8], identity.priority);
    off += 8;
    LittleEndian::write_i32(&mut buf[off..off + 4], identity.progress);
    off += 4;
    buf[off] = match identity.storage_mode {
        StorageMode::Mmap => 0,
        StorageMode::Mem => 1,
    };
}

fn read_slot(buf: &[u8]) -> BatchIdentity {
    let uuid = read_fixed_str(&buf[0..36]);
    let filename = read_fixed_str(&buf[36..164]);
    let mut off = 164;
    let pipeline_id = LittleEndian::read_i32(&buf[off..off + 4]);
    off += 4;
    let num_images = LittleEndian::read_i32(&buf[off..off + 4]);
    off += 4;
    let batch_size = LittleEndian::read_i32(&buf[off..off + 4]);
    off += 4;
    let shmid = LittleEndian::read_i32(&buf[off..off + 4]);
    off += 4;
    let priority = LittleEndian::read_i64(&buf[off..off + 8]);
    off += 8;
    let progress = LittleEndian::read_i32(&buf[off..off + 4]);
    off += 4;
    let storage_mode = if buf[off] == 1 {
        StorageMode::Mem
    } else {
        StorageMode::Mmap
    };
    BatchIdentity {
        uuid,
        pipeline_id,
        num_images,
        batch_size,
        priority,
        progress,
        storage_mode,
        filename,
        shmid,
    }
}

impl MmapPQueue {
    pub fn open(path: &Path, capacity: usize) -> DippResult<Self> {
        let file_len = record_len(capacity) as u64;
        let is_new = !path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| DippError::Storage(format!("open {}: {e}", path.display())))?;
        file.set_len(file_len)
            .map_err(|e| DippError::Storage(format!("ftruncate {}: {e}", path.display())))?;

        let mut mmap = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|e| DippError::Storage(format!("mmap {}: {e}", path.display())))?
        };

        if is_new {
            for byte in mmap.iter_mut() {
                *byte = 0;
            }
            mmap.flush()
                .map_err(|e| DippError::Storage(format!("msync {}: {e}", path.display())))?;
        }

        Ok(Self {
            mmap: Mutex::new(mmap),
            capacity,
        })
    }

    fn load_heap(&self, mmap: &MmapMut) -> Vec<BatchIdentity> {
        let size = LittleEndian::read_u64(&mmap[0..SIZE_FIELD_LEN]) as usize;
        let slot = slot_len();
        (0..size)
            .map(|i| {
                let off = SIZE_FIELD_LEN + i * slot;
                read_slot(&mmap[off..off + slot])
            })
            .collect()
    }

    fn store_heap(&self, mmap: &mut MmapMut, heap: &[BatchIdentity]) {
        LittleEndian::write_u64(&mut mmap[0..SIZE_FIELD_LEN], heap.len() as u64);
        let slot = slot_len();
        for (i, identity) in heap.iter().enumerate() {
            let off = SIZE_FIELD_LEN + i * slot;
            write_slot(&mut mmap[off..off + slot], identity);
        }
    }
}

impl PQueue for MmapPQueue {
    fn enqueue(&mut self, batch: BatchIdentity) -> DippResult<()> {
        let mut mmap = self.mmap.lock().unwrap();
        let mut heap = self.load_heap(&mmap);
        if heap.len() >= self.capacity {
            return Err(DippError::QueueFull);
        }
        heap.push(batch);
        heapify_up(&mut heap);
        self.store_heap(&mut mmap, &heap);
        mmap.flush()
            .map_err(|e| DippError::Storage(format!("msync queue: {e}")))
    }

    fn dequeue(&mut self) -> Option<BatchIdentity> {
        let mut mmap = self.mmap.lock().unwrap();
        let mut heap = self.load_heap(&mmap);
        if heap.is_empty() {
            return None;
        }
        let root = heap[0].clone();
        let last = heap.pop().unwrap();
        if !heap.is_empty() {
            heap[0] = last;
            heapify_down(&mut heap);
        }
        self.store_heap(&mut mmap, &heap);
        let _ = mmap.flush();
        Some(root)
    }

    fn peek(&self) -> Option<BatchIdentity> {
        let mmap = self.mmap.lock().unwrap();
        let heap = self.load_heap(&mmap);
        heap.first().cloned()
    }

    fn size(&self) -> usize {
        let mmap = self.mmap.lock().unwrap();
        LittleEndian::read_u64(&mmap[0..SIZE_FIELD_LEN]) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(priority: i64) -> BatchIdentity {
        BatchIdentity {
            uuid: "00000000-0000-0000-0000-000000000000".into(),
            pipeline_id: 0,
            num_images: 1,
            batch_size: 1024,
            priority,
            progress: -1,
            storage_mode: StorageMode::Mem,
            filename: "batch".into(),
            shmid: 0,
        }
    }

    #[test]
    fn dequeues_in_priority_order() {
        let mut q = RamPQueue::new(MAX_QUEUE_SIZE);
        q.enqueue(batch(50)).unwrap();
        q.enqueue(batch(10)).unwrap();
        q.enqueue(batch(30)).unwrap();
        assert_eq!(q.dequeue().unwrap().priority, 10);
        assert_eq!(q.dequeue().unwrap().priority, 30);
        assert_eq!(q.dequeue().unwrap().priority, 50);
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn full_queue_rejects_enqueue() {
        let mut q = RamPQueue::new(2);
        q.enqueue(batch(1)).unwrap();
        q.enqueue(batch(2)).unwrap();
        assert!(matches!(q.enqueue(batch(3)), Err(DippError::QueueFull)));
    }

    #[test]
    fn mmap_backend_round_trips_heap_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue");
        let mut q = MmapPQueue::open(&path, MAX_QUEUE_SIZE).unwrap();
        q.enqueue(batch(5)).unwrap();
        q.enqueue(batch(1)).unwrap();
        q.enqueue(batch(3)).unwrap();
        assert_eq!(q.size(), 3);
        assert_eq!(q.dequeue().unwrap().priority, 1);
        assert_eq!(q.dequeue().unwrap().priority, 3);
        assert_eq!(q.dequeue().unwrap().priority, 5);
    }
}
