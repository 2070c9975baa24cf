//! Reference-counted physical frames

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use exo_api::{PAGE_SIZE, SysError, SysResult};

/// Index of a physical frame
pub type FrameNo = usize;

struct Frame {
    data: Box<[u8]>,
    refs: usize,
}

/// Frame arena with an optional allocation limit
pub(crate) struct FrameTable {
    slots: Vec<Option<Frame>>,
    free: Vec<FrameNo>,
    in_use: usize,
    limit: Option<usize>,
}

impl FrameTable {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            in_use: 0,
            limit,
        }
    }

    /// Allocate a zeroed frame with no references yet.
    pub(crate) fn alloc(&mut self) -> SysResult<FrameNo> {
        if self.limit.is_some_and(|limit| self.in_use >= limit) {
            return Err(SysError::NoMem);
        }
        let frame = Frame {
            data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
            refs: 0,
        };
        let no = match self.free.pop() {
            Some(no) => {
                self.slots[no] = Some(frame);
                no
            }
            None => {
                self.slots.push(Some(frame));
                self.slots.len() - 1
            }
        };
        self.in_use += 1;
        Ok(no)
    }

    pub(crate) fn incref(&mut self, no: FrameNo) {
        if let Some(frame) = self.slots[no].as_mut() {
            frame.refs += 1;
        }
    }

    /// Drop one reference, releasing the frame when none remain.
    pub(crate) fn decref(&mut self, no: FrameNo) {
        let release = match self.slots[no].as_mut() {
            Some(frame) => {
                frame.refs = frame.refs.saturating_sub(1);
                frame.refs == 0
            }
            None => false,
        };
        if release {
            self.slots[no] = None;
            self.free.push(no);
            self.in_use -= 1;
        }
    }

    pub(crate) fn refs(&self, no: FrameNo) -> usize {
        self.slots[no].as_ref().map_or(0, |frame| frame.refs)
    }

    pub(crate) fn data(&self, no: FrameNo) -> &[u8] {
        self.slots[no].as_ref().map_or(&[][..], |frame| &frame.data[..])
    }

    pub(crate) fn data_mut(&mut self, no: FrameNo) -> &mut [u8] {
        self.slots[no].as_mut().map_or(&mut [][..], |frame| &mut frame.data[..])
    }

    pub(crate) fn in_use(&self) -> usize {
        self.in_use
    }

    pub(crate) fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_are_recycled() {
        let mut table = FrameTable::new(Some(2));
        let a = table.alloc().unwrap();
        table.incref(a);
        let b = table.alloc().unwrap();
        table.incref(b);
        assert_eq!(table.alloc(), Err(SysError::NoMem));

        table.decref(a);
        assert_eq!(table.in_use(), 1);
        let c = table.alloc().unwrap();
        assert_eq!(c, a);
        assert!(table.data(c).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_shared_frame_survives_one_release() {
        let mut table = FrameTable::new(None);
        let a = table.alloc().unwrap();
        table.incref(a);
        table.incref(a);
        table.decref(a);
        assert_eq!(table.refs(a), 1);
        assert_eq!(table.in_use(), 1);
    }
}
