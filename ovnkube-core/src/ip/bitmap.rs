/// Fixed size bitset used by both allocators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotBitmap {
    words: Vec<u64>,
    len: u32,
    used: u32,
}

impl SlotBitmap {
    pub fn new(len: u32) -> Self {
        let word_count = (len as usize + 63) / 64;

        Self {
            words: vec![0; word_count],
            len,
            used: 0,
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn is_full(&self) -> bool {
        self.used == self.len
    }

    pub fn is_set(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }

        self.words[(index / 64) as usize] & (1 << (index % 64)) != 0
    }

    /// Returns `false` if the slot was already taken or is out of range.
    pub fn set(&mut self, index: u32) -> bool {
        if index >= self.len || self.is_set(index) {
            return false;
        }

        self.words[(index / 64) as usize] |= 1 << (index % 64);
        self.used += 1;

        true
    }

    /// Returns `false` if the slot was already free.
    pub fn clear(&mut self, index: u32) -> bool {
        if !self.is_set(index) {
            return false;
        }

        self.words[(index / 64) as usize] &= !(1 << (index % 64));
        self.used -= 1;

        true
    }

    /// Lowest free slot, if any.
    pub fn first_free(&self) -> Option<u32> {
        if self.is_full() {
            return None;
        }

        self.words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(word_index, word)| word_index as u32 * 64 + (!word).trailing_zeros())
            .filter(|index| *index < self.len)
    }
}
