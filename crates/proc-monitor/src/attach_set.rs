//! Dense attachment bitmap over the pid space.

use nix::unistd::Pid;

pub(crate) const PID_MAX: usize = 32768;
const WORDS: usize = PID_MAX / 64;

/// One bit per pid in `[1, PID_MAX]`: set while we hold a trace attachment
/// and expect stop notifications from that pid. 4 KiB total.
///
/// Owned exclusively by the monitor thread.
pub(crate) struct PidSet {
    bits: Box<[u64; WORDS]>,
}

impl PidSet {
    pub(crate) fn new() -> Self {
        Self {
            bits: Box::new([0; WORDS]),
        }
    }

    fn index(pid: Pid) -> (usize, u64) {
        let raw = pid.as_raw();
        assert!(
            raw >= 1 && raw as usize <= PID_MAX,
            "pid {raw} out of range"
        );
        let bit = (raw - 1) as usize;
        (bit / 64, 1u64 << (bit % 64))
    }

    pub(crate) fn set(&mut self, pid: Pid) {
        let (word, mask) = Self::index(pid);
        self.bits[word] |= mask;
    }

    pub(crate) fn clear(&mut self, pid: Pid) {
        let (word, mask) = Self::index(pid);
        self.bits[word] &= !mask;
    }

    pub(crate) fn test(&self, pid: Pid) -> bool {
        let (word, mask) = Self::index(pid);
        self.bits[word] & mask != 0
    }

    pub(crate) fn clear_all(&mut self) {
        self.bits.fill(0);
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.bits.iter().all(|word| *word == 0)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = Pid> + '_ {
        self.bits.iter().enumerate().flat_map(|(word, &bits)| {
            (0..64)
                .filter(move |bit| bits & (1u64 << bit) != 0)
                .map(move |bit| Pid::from_raw((word * 64 + bit + 1) as i32))
        })
    }
}
