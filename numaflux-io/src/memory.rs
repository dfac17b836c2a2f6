use std::fmt;
use std::sync::OnceLock;

use libc::c_ulong;
use log::warn;
use nix::unistd::{sysconf, SysconfVar};

/// Fallback paging constant when `sysconf` cannot answer.
const DEFAULT_PAGE_SIZE: usize = 4096;

const WORD_BITS: usize = c_ulong::BITS as usize;

/// Returns the OS page size, queried once per process.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => {
            warn!("sysconf(_SC_PAGESIZE) failed, assuming {} byte pages", DEFAULT_PAGE_SIZE);
            DEFAULT_PAGE_SIZE
        }
    })
}

/// Rounds `value` down to a multiple of `page` (a power of two).
#[inline]
pub fn align_down(value: usize, page: usize) -> usize {
    value & !(page - 1)
}

/// Rounds `value` up to a multiple of `page` (a power of two).
#[inline]
pub fn align_up(value: usize, page: usize) -> usize {
    value.saturating_add(page - 1) & !(page - 1)
}

#[inline]
pub fn is_aligned(value: usize, page: usize) -> bool {
    value & (page - 1) == 0
}

/// A set of NUMA node ids, stored in the kernel's `unsigned long` bitmask layout.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct NodeSet {
    words: Vec<c_ulong>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// A set holding a single node.
    pub fn single(node: u32) -> Self {
        let mut set = Self::new();
        set.insert(node);
        set
    }

    /// All nodes in `0..count`.
    pub fn first_n(count: u32) -> Self {
        (0..count).collect()
    }

    pub fn insert(&mut self, node: u32) {
        let (word, bit) = Self::locate(node);
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << bit;
    }

    pub fn remove(&mut self, node: u32) {
        let (word, bit) = Self::locate(node);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !(1 << bit);
        }
    }

    pub fn contains(&self, node: u32) -> bool {
        let (word, bit) = Self::locate(node);
        self.words.get(word).map_or(false, |w| w & (1 << bit) != 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Node ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            (0..WORD_BITS)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| (i * WORD_BITS + bit) as u32)
        })
    }

    /// Raw mask words and the `maxnode` argument expected by `mbind`.
    ///
    /// The kernel reads `maxnode - 1` bits, so one extra bit is reported.
    pub fn as_mask(&self) -> (&[c_ulong], c_ulong) {
        let words: &[c_ulong] = if self.words.is_empty() { &[0] } else { &self.words };
        let bits = (words.len().max(1) * WORD_BITS) as c_ulong;
        (words, bits + 1)
    }

    fn locate(node: u32) -> (usize, usize) {
        let node = node as usize;
        (node / WORD_BITS, node % WORD_BITS)
    }
}

impl FromIterator<u32> for NodeSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut set = NodeSet::new();
        for node in iter {
            set.insert(node);
        }
        set
    }
}

impl fmt::Debug for NodeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_alignment() {
        assert_eq!(align_down(0x1fff, 4096), 0x1000);
        assert_eq!(align_up(0x1001, 4096), 0x2000);
        assert_eq!(align_up(0x2000, 4096), 0x2000);
        assert!(is_aligned(0x3000, 4096));
        assert!(!is_aligned(0x3001, 4096));
    }

    #[test]
    fn test_node_set_mask_layout() {
        let set: NodeSet = [0, 3, 65].into_iter().collect();
        assert_eq!(set.len(), 3);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 3, 65]);

        let (words, maxnode) = set.as_mask();
        assert_eq!(words.len(), 65 / WORD_BITS + 1);
        assert_eq!(words[0] & 0b1001, 0b1001);
        assert_eq!(maxnode as usize, words.len() * WORD_BITS + 1);

        let mut set = set;
        set.remove(3);
        assert!(!set.contains(3));
        assert!(set.contains(65));
    }

    #[test]
    fn test_empty_set_still_yields_a_mask() {
        let set = NodeSet::new();
        let (words, maxnode) = set.as_mask();
        assert_eq!(words, &[0]);
        assert_eq!(maxnode as usize, WORD_BITS + 1);
    }
}
