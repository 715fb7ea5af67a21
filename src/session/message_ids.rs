//! Message identifier allocation

use crate::error::{MqttError, MqttResult};
use crate::protocol::{MAX_MESSAGE_ID, MIN_MESSAGE_ID};
use std::collections::HashSet;

const ID_SPACE: usize = (MAX_MESSAGE_ID - MIN_MESSAGE_ID) as usize + 1;

/// Hands out ids in `[1, 65535]`, never returning one that is still in use
#[derive(Debug, Default)]
pub struct MessageIdAllocator {
    /// Last id handed out; 0 before the first allocation
    next: u16,
    in_use: HashSet<u16>,
}

impl MessageIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan forward from the last allocated id, wrapping at 65535 back to 1.
    /// Gives up after two full passes over the id space.
    pub fn allocate(&mut self) -> MqttResult<u16> {
        for _ in 0..ID_SPACE * 2 {
            self.next = if self.next >= MAX_MESSAGE_ID {
                MIN_MESSAGE_ID
            } else {
                self.next + 1
            };
            if self.in_use.insert(self.next) {
                return Ok(self.next);
            }
        }
        Err(MqttError::NoMessageIdsAvailable)
    }

    pub fn release(&mut self, id: u16) {
        self.in_use.remove(&id);
    }

    /// Reserve an id read back from the durable store
    pub fn mark_in_use(&mut self, id: u16) {
        if id != 0 {
            self.in_use.insert(id);
        }
    }

    pub fn is_in_use(&self, id: u16) -> bool {
        self.in_use.contains(&id)
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    /// Continue allocation after `id`
    pub fn set_next(&mut self, id: u16) {
        self.next = id;
    }

    pub fn clear(&mut self) {
        self.in_use.clear();
        self.next = 0;
    }
}
