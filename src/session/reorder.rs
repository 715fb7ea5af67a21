//! Wraparound-aware ordering of restored messages
//!
//! Ids are allocated in increasing order and wrap from 65535 to 1, so after a
//! wrap the oldest message is the one just after the largest gap in the
//! sorted id sequence.

use crate::protocol::MAX_MESSAGE_ID;

/// Sort `items` by id, then rotate so the list starts just after the
/// largest gap between consecutive ids. The wrap gap (highest id back to the
/// lowest) counts as a gap; when it is the largest the list stays ascending.
pub fn reorder<T>(mut items: Vec<T>, id_of: impl Fn(&T) -> u16) -> Vec<T> {
    if items.len() < 2 {
        return items;
    }
    items.sort_by_key(|item| id_of(item));

    let mut previous: u32 = 0;
    let mut largest_gap: u32 = 0;
    let mut start = 0;
    for (position, item) in items.iter().enumerate() {
        let current = u32::from(id_of(item));
        if current - previous > largest_gap {
            largest_gap = current - previous;
            start = position;
        }
        previous = current;
    }

    let lowest = u32::from(id_of(&items[0]));
    let wrap_gap = u32::from(MAX_MESSAGE_ID) - previous + lowest;
    if wrap_gap > largest_gap {
        start = 0;
    }

    items.rotate_left(start);
    items
}
