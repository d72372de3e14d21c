//! A [LinkedSlab] is a vec-backed doubly linked list with stable indices.
//!
//! Both LRU structures in this crate need "move this node to the front/back in O(1)" plus an auxiliary hash index
//! pointing at nodes.  Freed slots are threaded onto a free list and reused, so indices handed out stay valid until
//! the node they name is removed.
//!
//! The front of the list is the most recently used end; the back is where eviction starts.

struct Node<T> {
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

enum Slot<T> {
    /// This slot is empty, possibly with a pointer at the next empty slot.
    Vacant { next_free: Option<usize> },
    /// This slot is occupied, and doubly linked to the previous and next node.
    Occupied(Node<T>),
}

impl<T> Slot<T> {
    fn node(&self) -> Option<&Node<T>> {
        match self {
            Slot::Occupied(n) => Some(n),
            Slot::Vacant { .. } => None,
        }
    }

    fn node_mut(&mut self) -> Option<&mut Node<T>> {
        match self {
            Slot::Occupied(n) => Some(n),
            Slot::Vacant { .. } => None,
        }
    }
}

pub(crate) struct LinkedSlab<T> {
    slots: Vec<Slot<T>>,
    head: Option<usize>,
    tail: Option<usize>,
    free_head: Option<usize>,
    len: usize,
}

impl<T> Default for LinkedSlab<T> {
    fn default() -> Self {
        LinkedSlab {
            slots: Vec::new(),
            head: None,
            tail: None,
            free_head: None,
            len: 0,
        }
    }
}

impl<T> LinkedSlab<T> {
    pub(crate) fn new() -> LinkedSlab<T> {
        Default::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Index of the most recently used node.
    #[cfg(test)]
    pub(crate) fn front(&self) -> Option<usize> {
        self.head
    }

    /// Index of the least recently used node.
    pub(crate) fn back(&self) -> Option<usize> {
        self.tail
    }

    /// The neighbour of `index` one step towards the front.
    pub(crate) fn prev(&self, index: usize) -> Option<usize> {
        self.slots.get(index)?.node()?.prev
    }

    pub(crate) fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index)?.node().map(|n| &n.value)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index)?.node_mut().map(|n| &mut n.value)
    }

    fn is_occupied(&self, index: usize) -> bool {
        matches!(self.slots.get(index), Some(Slot::Occupied(_)))
    }

    /// Find an available empty slot, or make one if necessary.
    fn claim_slot(&mut self, value: T) -> usize {
        let node = Slot::Occupied(Node {
            value,
            prev: None,
            next: None,
        });

        if let Some(free) = self.free_head {
            self.free_head = match self.slots[free] {
                Slot::Vacant { next_free } => next_free,
                Slot::Occupied(_) => None,
            };
            self.slots[free] = node;
            return free;
        }

        self.slots.push(node);
        self.slots.len() - 1
    }

    /// Entirely unlink an occupied index from the list, leaving the node itself in place.
    fn unlink(&mut self, index: usize) {
        let (prev, next) = match self.slots[index].node() {
            Some(n) => (n.prev, n.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(n) = self.slots[p].node_mut() {
                    n.next = next;
                }
            }
            None => self.head = next,
        }

        match next {
            Some(nx) => {
                if let Some(n) = self.slots[nx].node_mut() {
                    n.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(n) = self.slots[index].node_mut() {
            n.prev = None;
            n.next = None;
        }
    }

    fn link_front(&mut self, index: usize) {
        let old_head = self.head;
        if let Some(n) = self.slots[index].node_mut() {
            n.prev = None;
            n.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(n) = self.slots[h].node_mut() {
                n.prev = Some(index);
            }
        }
        self.head = Some(index);

        // If this is the only node, it is also the tail.
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }

    fn link_back(&mut self, index: usize) {
        let old_tail = self.tail;
        if let Some(n) = self.slots[index].node_mut() {
            n.prev = old_tail;
            n.next = None;
        }
        if let Some(t) = old_tail {
            if let Some(n) = self.slots[t].node_mut() {
                n.next = Some(index);
            }
        }
        self.tail = Some(index);

        if self.head.is_none() {
            self.head = Some(index);
        }
    }

    pub(crate) fn push_front(&mut self, value: T) -> usize {
        let index = self.claim_slot(value);
        self.link_front(index);
        self.len += 1;
        index
    }

    #[cfg(test)]
    pub(crate) fn push_back(&mut self, value: T) -> usize {
        let index = self.claim_slot(value);
        self.link_back(index);
        self.len += 1;
        index
    }

    pub(crate) fn move_to_front(&mut self, index: usize) {
        if !self.is_occupied(index) || self.head == Some(index) {
            return;
        }
        self.unlink(index);
        self.link_front(index);
    }

    pub(crate) fn move_to_back(&mut self, index: usize) {
        if !self.is_occupied(index) || self.tail == Some(index) {
            return;
        }
        self.unlink(index);
        self.link_back(index);
    }

    /// Remove the node at `index`, returning its value and putting the slot on the free list.
    pub(crate) fn remove(&mut self, index: usize) -> Option<T> {
        if !self.is_occupied(index) {
            return None;
        }
        self.unlink(index);
        let old = std::mem::replace(
            &mut self.slots[index],
            Slot::Vacant {
                next_free: self.free_head,
            },
        );
        self.free_head = Some(index);
        self.len -= 1;
        match old {
            Slot::Occupied(n) => Some(n.value),
            Slot::Vacant { .. } => None,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.head = None;
        self.tail = None;
        self.free_head = None;
        self.len = 0;
    }

    /// Iterator visiting values from the front (most recent) to the back.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        let mut ind = self.head;
        std::iter::from_fn(move || {
            let node = self.slots.get(ind?)?.node()?;
            ind = node.next;
            Some(&node.value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(slab: &LinkedSlab<u32>) -> Vec<u32> {
        slab.iter().copied().collect()
    }

    #[test]
    fn push_and_move() {
        let mut slab = LinkedSlab::new();
        let a = slab.push_front(1);
        let b = slab.push_front(2);
        let c = slab.push_back(3);
        assert_eq!(contents(&slab), vec![2, 1, 3]);

        slab.move_to_front(c);
        assert_eq!(contents(&slab), vec![3, 2, 1]);
        slab.move_to_back(b);
        assert_eq!(contents(&slab), vec![3, 1, 2]);
        assert_eq!(slab.back(), Some(b));
        assert_eq!(slab.prev(b), Some(a));
        assert_eq!(slab.front(), Some(c));
    }

    #[test]
    fn removed_slots_are_reused() {
        let mut slab = LinkedSlab::new();
        let a = slab.push_front(1);
        slab.push_front(2);
        assert_eq!(slab.remove(a), Some(1));
        assert_eq!(slab.remove(a), None);
        assert_eq!(slab.len(), 1);

        let reused = slab.push_back(7);
        assert_eq!(reused, a);
        assert_eq!(contents(&slab), vec![2, 7]);
    }

    #[test]
    fn removing_everything_resets_ends() {
        let mut slab = LinkedSlab::new();
        let a = slab.push_front(1);
        let b = slab.push_front(2);
        slab.remove(a);
        slab.remove(b);
        assert!(slab.is_empty());
        assert_eq!(slab.front(), None);
        assert_eq!(slab.back(), None);

        slab.push_front(5);
        assert_eq!(contents(&slab), vec![5]);
    }
}
