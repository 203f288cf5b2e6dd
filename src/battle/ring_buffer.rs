//! Fixed-capacity frame window addressed by monotonically increasing frame id

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RingBufferError {
    #[error("slot for frame {frame_id} was never pre-allocated (st={st_frame_id}, ed={ed_frame_id}, cnt={cnt}, n={n})")]
    NotPreallocated {
        frame_id: i32,
        st_frame_id: i32,
        ed_frame_id: i32,
        cnt: usize,
        n: usize,
    },

    #[error("frame {frame_id} already left the window starting at {st_frame_id}")]
    FrameTooOld { frame_id: i32, st_frame_id: i32 },
}

/// Circular buffer of `n` slots holding frames `st_frame_id..ed_frame_id`.
///
/// Slots are filled once with `put` and then recycled by `dry_put`, so the
/// steady state never allocates.
#[derive(Debug)]
pub struct FrameRingBuffer<T> {
    ed: usize,
    st: usize,
    n: usize,
    cnt: usize,
    st_frame_id: i32,
    ed_frame_id: i32,
    eles: Vec<Option<T>>,
}

impl<T> FrameRingBuffer<T> {
    pub fn new(n: usize) -> Self {
        let n = n.max(1);
        let mut eles = Vec::with_capacity(n);
        eles.resize_with(n, || None);
        Self {
            ed: 0,
            st: 0,
            n,
            cnt: 0,
            st_frame_id: 0,
            ed_frame_id: 0,
            eles,
        }
    }

    pub fn capacity(&self) -> usize {
        self.n
    }

    pub fn cnt(&self) -> usize {
        self.cnt
    }

    pub fn st_frame_id(&self) -> i32 {
        self.st_frame_id
    }

    pub fn ed_frame_id(&self) -> i32 {
        self.ed_frame_id
    }

    fn evict_oldest_if_full(&mut self) {
        if self.cnt > 0 && self.cnt >= self.n {
            self.st = (self.st + 1) % self.n;
            self.st_frame_id += 1;
            self.cnt -= 1;
        }
    }

    fn advance_ed(&mut self) -> usize {
        let slot = self.ed;
        self.ed_frame_id += 1;
        self.cnt += 1;
        self.ed = (self.ed + 1) % self.n;
        slot
    }

    /// Appends `item` as frame `ed_frame_id`, evicting the oldest frame when full
    pub fn put(&mut self, item: T) {
        self.evict_oldest_if_full();
        let slot = self.advance_ed();
        self.eles[slot] = Some(item);
    }

    /// Appends frame `ed_frame_id` by recycling its slot, which must already hold a value
    pub fn dry_put(&mut self) -> Result<&mut T, RingBufferError> {
        let err = self.not_preallocated(self.ed_frame_id);
        if self.eles[self.ed].is_none() {
            return Err(err);
        }
        self.evict_oldest_if_full();
        let slot = self.advance_ed();
        self.eles[slot].as_mut().ok_or(err)
    }

    /// Writable slot for `frame_id`: inside the window it is overwritten, at
    /// `ed_frame_id` it is appended, past it the window restarts at `frame_id`.
    pub fn dry_set_by_frame_id(&mut self, frame_id: i32) -> Result<&mut T, RingBufferError> {
        if frame_id < self.st_frame_id {
            return Err(RingBufferError::FrameTooOld {
                frame_id,
                st_frame_id: self.st_frame_id,
            });
        }
        if frame_id > self.ed_frame_id {
            self.st = self.ed;
            self.cnt = 0;
            self.st_frame_id = frame_id;
            self.ed_frame_id = frame_id;
        }
        if frame_id == self.ed_frame_id {
            return self.dry_put();
        }
        let err = self.not_preallocated(frame_id);
        self.get_mut_by_frame_id(frame_id).ok_or(err)
    }

    fn arr_idx_by_offset(&self, offset: usize) -> Option<usize> {
        if offset >= self.cnt {
            return None;
        }
        Some((self.st + offset) % self.n)
    }

    pub fn get_by_offset(&self, offset: usize) -> Option<&T> {
        let idx = self.arr_idx_by_offset(offset)?;
        self.eles[idx].as_ref()
    }

    fn offset_of(&self, frame_id: i32) -> Option<usize> {
        if frame_id < self.st_frame_id || frame_id >= self.ed_frame_id {
            return None;
        }
        Some((frame_id - self.st_frame_id) as usize)
    }

    pub fn get_by_frame_id(&self, frame_id: i32) -> Option<&T> {
        self.get_by_offset(self.offset_of(frame_id)?)
    }

    pub fn get_mut_by_frame_id(&mut self, frame_id: i32) -> Option<&mut T> {
        let idx = self.arr_idx_by_offset(self.offset_of(frame_id)?)?;
        self.eles[idx].as_mut()
    }

    /// Drops the oldest frame from the window, its slot stays allocated
    pub fn pop(&mut self) -> Option<&T> {
        if self.cnt == 0 {
            return None;
        }
        let slot = self.st;
        self.st = (self.st + 1) % self.n;
        self.st_frame_id += 1;
        self.cnt -= 1;
        self.eles[slot].as_ref()
    }

    /// Empties the window and restarts ids at zero, keeping slot memory
    pub fn clear(&mut self) {
        self.st = 0;
        self.ed = 0;
        self.cnt = 0;
        self.st_frame_id = 0;
        self.ed_frame_id = 0;
    }

    fn not_preallocated(&self, frame_id: i32) -> RingBufferError {
        RingBufferError::NotPreallocated {
            frame_id,
            st_frame_id: self.st_frame_id,
            ed_frame_id: self.ed_frame_id,
            cnt: self.cnt,
            n: self.n,
        }
    }
}
