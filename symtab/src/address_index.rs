//! Sorted table of function start addresses.
//!
//! Most binaries fit below 4GB, so addresses are stored as `u32` until a
//! value that does not fit shows up. From then on the whole index is `u64`.

#[derive(Debug, Clone)]
enum Slots {
    Narrow(Vec<u32>),
    Wide(Vec<u64>),
}

#[derive(Debug, Clone)]
pub struct AddressIndex {
    slots: Slots,
}

impl AddressIndex {
    pub fn new(len: usize) -> Self {
        AddressIndex {
            slots: Slots::Narrow(vec![0; len]),
        }
    }

    pub fn len(&self) -> usize {
        match &self.slots {
            Slots::Narrow(v) => v.len(),
            Slots::Wide(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_wide(&self) -> bool {
        matches!(self.slots, Slots::Wide(_))
    }

    /// Assigns slot `idx`. Promotes the index to `u64` the first time a value
    /// `>= u32::MAX` is stored.
    pub fn set(&mut self, idx: usize, value: u64) {
        if let Slots::Narrow(narrow) = &mut self.slots {
            if value < u32::MAX as u64 {
                narrow[idx] = value as u32;
                return;
            }
            let wide = narrow.iter().map(|&v| v as u64).collect();
            self.slots = Slots::Wide(wide);
        }
        if let Slots::Wide(wide) = &mut self.slots {
            wide[idx] = value;
        }
    }

    pub fn get(&self, idx: usize) -> u64 {
        match &self.slots {
            Slots::Narrow(v) => v[idx] as u64,
            Slots::Wide(v) => v[idx],
        }
    }

    pub fn first(&self) -> Option<u64> {
        if self.is_empty() {
            None
        } else {
            Some(self.get(0))
        }
    }

    /// Index of the greatest entry `<= addr`. When several entries share that
    /// address the first of them wins.
    pub fn find_index(&self, addr: u64) -> Option<usize> {
        match &self.slots {
            Slots::Narrow(v) => match u32::try_from(addr) {
                Ok(key) => find_in(v, key),
                // above every narrow entry
                Err(_) => last_of_run_start(v),
            },
            Slots::Wide(v) => find_in(v, addr),
        }
    }
}

fn find_in<T: Ord + Copy>(values: &[T], addr: T) -> Option<usize> {
    let first = *values.first()?;
    if addr < first {
        return None;
    }
    let mut i = values.partition_point(|&v| v <= addr) - 1;
    let v = values[i];
    while i > 0 && values[i - 1] == v {
        i -= 1;
    }
    Some(i)
}

fn last_of_run_start<T: Ord + Copy>(values: &[T]) -> Option<usize> {
    let last = *values.last()?;
    let mut i = values.len() - 1;
    while i > 0 && values[i - 1] == last {
        i -= 1;
    }
    Some(i)
}
