use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Single-producer / single-consumer ring buffer of stereo i16 frames.
///
/// The emulator thread pushes during `update`; the host audio callback pops.
/// No locks; when the queue is full new frames are dropped.
pub fn audio_queue(capacity_frames: usize) -> (AudioProducer, AudioConsumer) {
    let cap = capacity_frames.max(2).next_power_of_two();
    let shared = Arc::new(Shared {
        frames: (0..cap).map(|_| AtomicFrame::default()).collect(),
        mask: cap - 1,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    (
        AudioProducer {
            shared: Arc::clone(&shared),
        },
        AudioConsumer { shared },
    )
}

#[derive(Default)]
struct AtomicFrame {
    // Left/right packed into one atomic word so a frame is always consistent.
    packed: AtomicUsize,
}

struct Shared {
    frames: Box<[AtomicFrame]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl Shared {
    fn len(&self) -> usize {
        self.head
            .load(Ordering::Acquire)
            .wrapping_sub(self.tail.load(Ordering::Acquire))
    }
}

fn pack(left: i16, right: i16) -> usize {
    ((left as u16 as usize) << 16) | right as u16 as usize
}

fn unpack(word: usize) -> (i16, i16) {
    ((word >> 16) as u16 as i16, word as u16 as i16)
}

pub struct AudioProducer {
    shared: Arc<Shared>,
}

impl AudioProducer {
    /// Push one stereo frame. Returns false (dropping the frame) when full.
    #[inline]
    pub fn push(&self, left: i16, right: i16) -> bool {
        let head = self.shared.head.load(Ordering::Relaxed);
        let tail = self.shared.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) > self.shared.mask {
            return false;
        }
        self.shared.frames[head & self.shared.mask]
            .packed
            .store(pack(left, right), Ordering::Relaxed);
        self.shared.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity_frames(&self) -> usize {
        self.shared.mask + 1
    }
}

pub struct AudioConsumer {
    shared: Arc<Shared>,
}

impl AudioConsumer {
    /// Pop one stereo frame, or `None` when the queue is empty.
    #[inline]
    pub fn pop(&self) -> Option<(i16, i16)> {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let head = self.shared.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        let word = self.shared.frames[tail & self.shared.mask]
            .packed
            .load(Ordering::Relaxed);
        self.shared.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(unpack(word))
    }

    /// Fill an interleaved stereo buffer, substituting silence on underflow.
    pub fn fill(&self, out: &mut [i16]) {
        for frame in out.chunks_exact_mut(2) {
            let (l, r) = self.pop().unwrap_or((0, 0));
            frame[0] = l;
            frame[1] = r;
        }
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
