//! Sequence number keyed windows
//! 
//! Fixed-size storage indexed by SN with modular SN arithmetic helpers.

use super::pdu::SN_MODULUS;

/// `sn + n` in the SN space
pub fn sn_add(sn: u16, n: u16) -> u16 {
    (sn + n) % SN_MODULUS
}

/// Distance from `base` forward to `sn`, i.e. `(sn - base) mod 1024`
pub fn sn_distance(base: u16, sn: u16) -> u16 {
    (sn + SN_MODULUS - base) % SN_MODULUS
}

/// Map from SN to `T` with one slot per SN
#[derive(Debug)]
pub struct SnWindow<T> {
    slots: Vec<Option<T>>,
    count: usize,
}

impl<T> SnWindow<T> {
    pub fn new() -> Self {
        Self {
            slots: (0..SN_MODULUS).map(|_| None).collect(),
            count: 0,
        }
    }
    
    fn index(sn: u16) -> usize {
        (sn % SN_MODULUS) as usize
    }
    
    /// Store `value` under `sn`, returning the previous entry
    pub fn insert(&mut self, sn: u16, value: T) -> Option<T> {
        let old = self.slots[Self::index(sn)].replace(value);
        if old.is_none() {
            self.count += 1;
        }
        old
    }
    
    pub fn remove(&mut self, sn: u16) -> Option<T> {
        let old = self.slots[Self::index(sn)].take();
        if old.is_some() {
            self.count -= 1;
        }
        old
    }
    
    pub fn get(&self, sn: u16) -> Option<&T> {
        self.slots[Self::index(sn)].as_ref()
    }
    
    pub fn get_mut(&mut self, sn: u16) -> Option<&mut T> {
        self.slots[Self::index(sn)].as_mut()
    }
    
    pub fn contains(&self, sn: u16) -> bool {
        self.slots[Self::index(sn)].is_some()
    }
    
    pub fn len(&self) -> usize {
        self.count
    }
    
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
    
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.count = 0;
    }
    
    /// Stored entries in slot order
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().flatten()
    }
}

impl<T> Default for SnWindow<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_sn_arithmetic() {
        assert_eq!(sn_add(1023, 1), 0);
        assert_eq!(sn_add(500, 512), 1012);
        assert_eq!(sn_distance(1020, 3), 7);
        assert_eq!(sn_distance(3, 1020), 1017);
        assert_eq!(sn_distance(42, 42), 0);
    }
    
    #[test]
    fn test_window_insert_remove() {
        let mut window = SnWindow::new();
        assert!(window.is_empty());
        
        assert_eq!(window.insert(1023, "a"), None);
        assert_eq!(window.insert(0, "b"), None);
        assert_eq!(window.insert(0, "c"), Some("b"));
        assert_eq!(window.len(), 2);
        assert!(window.contains(1023));
        assert_eq!(window.get(0), Some(&"c"));
        
        assert_eq!(window.remove(1023), Some("a"));
        assert_eq!(window.remove(1023), None);
        assert_eq!(window.len(), 1);
        
        window.clear();
        assert!(window.is_empty());
        assert!(!window.contains(0));
    }
    
    #[test]
    fn test_window_values() {
        let mut window = SnWindow::new();
        window.insert(5, 50usize);
        window.insert(7, 70usize);
        if let Some(v) = window.get_mut(5) {
            *v += 1;
        }
        assert_eq!(window.values().sum::<usize>(), 121);
    }
}
