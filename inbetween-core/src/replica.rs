//! Replica identity when the same pipeline runs once per worker process.
//!
//! Workers are launched externally (one process per accelerator) with
//! `LOCAL_RANK` and `WORLD_SIZE` set. Every worker generates; only the
//! coordinator writes results.

use std::path::PathBuf;

use crate::{DeviceMap, DiscardSink, Error, GifSink, Result, VideoSink};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerRank {
    pub local_rank: usize,
    pub world_size: usize,
}

impl Default for WorkerRank {
    fn default() -> Self {
        Self {
            local_rank: 0,
            world_size: 1,
        }
    }
}

impl WorkerRank {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(
            std::env::var("LOCAL_RANK").ok().as_deref(),
            std::env::var("WORLD_SIZE").ok().as_deref(),
        )
    }

    pub fn from_vars(local_rank: Option<&str>, world_size: Option<&str>) -> Result<Self> {
        fn parse(name: &str, value: Option<&str>, default: usize) -> Result<usize> {
            match value {
                None => Ok(default),
                Some(v) => v
                    .trim()
                    .parse()
                    .map_err(|e| Error::Config(format!("{name}=`{v}`: {e}"))),
            }
        }
        let rank = Self {
            local_rank: parse("LOCAL_RANK", local_rank, 0)?,
            world_size: parse("WORLD_SIZE", world_size, 1)?,
        };
        if rank.world_size == 0 || rank.local_rank >= rank.world_size {
            return Err(Error::Config(format!(
                "rank {} is outside a world of {}",
                rank.local_rank, rank.world_size
            )));
        }
        Ok(rank)
    }

    pub fn is_coordinator(&self) -> bool {
        self.local_rank == 0
    }

    pub fn device_map(&self, force_cpu: bool) -> DeviceMap {
        DeviceMap::for_worker(self.local_rank, force_cpu)
    }

    /// The coordinator writes into `result_dir`; everyone else discards.
    pub fn sink(&self, result_dir: impl Into<PathBuf>) -> Box<dyn VideoSink> {
        if self.is_coordinator() {
            Box::new(GifSink::new(result_dir))
        } else {
            Box::new(DiscardSink::new(result_dir))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_single_worker() -> Result<()> {
        let rank = WorkerRank::from_vars(None, None)?;
        assert_eq!(rank, WorkerRank::default());
        assert!(rank.is_coordinator());
        assert_eq!(rank.device_map(false), DeviceMap::Ordinal(0));
        assert_eq!(rank.device_map(true), DeviceMap::ForceCpu);
        Ok(())
    }

    #[test]
    fn secondary_workers_use_their_own_device() -> Result<()> {
        let rank = WorkerRank::from_vars(Some("3"), Some("4"))?;
        assert!(!rank.is_coordinator());
        assert_eq!(rank.device_map(false), DeviceMap::Ordinal(3));
        Ok(())
    }

    #[test]
    fn rejects_inconsistent_ranks() {
        assert!(WorkerRank::from_vars(Some("2"), Some("2")).is_err());
        assert!(WorkerRank::from_vars(Some("x"), None).is_err());
        assert!(WorkerRank::from_vars(None, Some("0")).is_err());
    }

    #[test]
    fn only_the_coordinator_writes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let video = candle_core::Tensor::zeros(
            (1, 3, 2, 8, 8),
            candle_core::DType::F32,
            &candle_core::Device::Cpu,
        )?;
        let worker = WorkerRank::from_vars(Some("1"), Some("2"))?;
        worker.sink(dir.path()).save(&video, "clip", 8)?;
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);

        let coordinator = WorkerRank::from_vars(Some("0"), Some("2"))?;
        let path = coordinator.sink(dir.path()).save(&video, "clip", 8)?;
        assert!(path.exists());
        Ok(())
    }
}
