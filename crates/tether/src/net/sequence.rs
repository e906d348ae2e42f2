const SEQUENCE_WRAP_THRESHOLD: u16 = 32768;

#[inline]
pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[inline]
pub fn sequence_less_than(s1: u16, s2: u16) -> bool {
    sequence_greater_than(s2, s1)
}

/// Fixed-size ring of entries keyed by a wrapping 16-bit sequence.
///
/// An entry only answers for the exact sequence it was inserted with, so a
/// slot reused by a newer sequence never aliases the older one.
#[derive(Debug)]
pub struct SequenceBuffer<T> {
    entries: Vec<Option<(u16, T)>>,
}

impl<T> SequenceBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity <= 65536,
            "sequence buffer capacity {capacity} out of range"
        );
        Self {
            entries: (0..capacity).map(|_| None).collect(),
        }
    }

    #[inline]
    fn index(&self, sequence: u16) -> usize {
        sequence as usize % self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn insert(&mut self, sequence: u16, value: T) -> Option<T> {
        let index = self.index(sequence);
        self.entries[index]
            .replace((sequence, value))
            .map(|(_, old)| old)
    }

    pub fn get(&self, sequence: u16) -> Option<&T> {
        match &self.entries[self.index(sequence)] {
            Some((stored, value)) if *stored == sequence => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, sequence: u16) -> Option<&mut T> {
        let index = self.index(sequence);
        match &mut self.entries[index] {
            Some((stored, value)) if *stored == sequence => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, sequence: u16) -> bool {
        self.get(sequence).is_some()
    }

    pub fn remove(&mut self, sequence: u16) -> Option<T> {
        let index = self.index(sequence);
        match &self.entries[index] {
            Some((stored, _)) if *stored == sequence => self.entries[index].take().map(|(_, v)| v),
            _ => None,
        }
    }

    /// True when the slot `sequence` maps to holds nothing at all.
    pub fn available(&self, sequence: u16) -> bool {
        self.entries[self.index(sequence)].is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &T)> {
        self.entries
            .iter()
            .filter_map(|e| e.as_ref().map(|(s, v)| (*s, v)))
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.entries
            .iter_mut()
            .filter_map(|e| e.take().map(|(_, v)| v))
    }

    pub fn clear(&mut self) {
        for entry in &mut self.entries {
            *entry = None;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_comparison() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(sequence_greater_than(0, u16::MAX));
        assert!(!sequence_greater_than(u16::MAX, 0));
        assert!(sequence_less_than(65000, 10));
    }

    #[test]
    fn reused_slot_does_not_alias() {
        let mut buffer = SequenceBuffer::new(16);
        buffer.insert(3, "old");
        buffer.insert(19, "new");

        assert!(buffer.get(3).is_none());
        assert_eq!(buffer.get(19), Some(&"new"));
        assert!(buffer.remove(3).is_none());
        assert!(!buffer.available(3));
    }

    #[test]
    fn wraps_across_sequence_boundary() {
        let mut buffer = SequenceBuffer::new(8);
        for sequence in 65530..=65535u16 {
            buffer.insert(sequence, sequence);
        }
        buffer.insert(0, 0);
        buffer.insert(1, 1);

        assert_eq!(buffer.len(), 8);
        assert_eq!(buffer.remove(65535), Some(65535));
        assert_eq!(buffer.get(1), Some(&1));
        assert_eq!(buffer.drain().count(), 7);
        assert!(buffer.is_empty());
    }
}
