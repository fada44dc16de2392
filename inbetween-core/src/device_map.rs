#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl DeviceMap {
    /// Device placement for one replica: each worker owns the accelerator matching its local rank.
    pub fn for_worker(local_rank: usize, force_cpu: bool) -> Self {
        if force_cpu {
            Self::ForceCpu
        } else {
            Self::Ordinal(local_rank)
        }
    }
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}
