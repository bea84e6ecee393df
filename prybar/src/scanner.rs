//! Successive-refinement memory scanning.
//!
//! A scan keeps, per region, a bitmap of positions that still match every
//! value searched so far. Each search can only turn candidates off; the
//! bitmap resets on demand.

use crate::error::Result;
use crate::os::{Protection, RegionKind};
use crate::process::Process;
use std::sync::Arc;

/// One cached readable region.
pub struct ScanRegion {
    pub base: u64,
    pub size: usize,
    pub protect: Protection,
    pub kind: RegionKind,
    matches: Vec<bool>,
    current: Vec<u8>,
}

impl ScanRegion {
    pub fn match_count(&self) -> usize {
        self.matches.iter().filter(|&&m| m).count()
    }
}

type ProgressObserver = Box<dyn Fn(u32) + Send>;

pub struct Scanner {
    process: Arc<Process>,
    regions: Vec<ScanRegion>,
    progress: Option<ProgressObserver>,
}

impl Scanner {
    pub fn new(process: Arc<Process>) -> Self {
        Self {
            process,
            regions: Vec::new(),
            progress: None,
        }
    }

    /// Registers an observer for scan progress, in integer percent.
    #[must_use]
    pub fn with_progress(mut self, observer: impl Fn(u32) + Send + 'static) -> Self {
        self.progress = Some(Box::new(observer));
        self
    }

    pub fn regions(&self) -> &[ScanRegion] {
        &self.regions
    }

    /// Replaces the region list with the readable regions in
    /// `[min, max)`. All match state starts fresh.
    pub fn identify_regions(&mut self, min: u64, max: u64) -> Result<usize> {
        self.regions = self
            .process
            .readable_regions(min, max)?
            .into_iter()
            .map(|info| {
                let size = info.size as usize;
                ScanRegion {
                    base: info.base,
                    size,
                    protect: info.protect,
                    kind: info.kind,
                    matches: vec![true; size],
                    current: vec![0u8; size],
                }
            })
            .collect();
        log::debug!("Identified {} scannable regions", self.regions.len());
        Ok(self.regions.len())
    }

    /// Refreshes every region's byte cache from the live target. Regions
    /// that shrank or vanished keep their stale tail; a warning is logged.
    pub fn update_cache(&mut self) -> Result<()> {
        for region in &mut self.regions {
            match self.process.read_available(region.base, &mut region.current) {
                Ok(transferred) if transferred < region.size => {
                    log::warn!(
                        "Short read of region {:#x}: {transferred} of {} bytes",
                        region.base,
                        region.size
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    log::warn!("Failed to refresh region {:#x}: {err}", region.base);
                }
            }
        }
        Ok(())
    }

    /// Searches the cached bytes for `value`, narrowing the candidate set.
    /// Returns the addresses that still match.
    pub fn search_cache(&mut self, value: &[u8]) -> Vec<u64> {
        let mut found = Vec::new();
        if value.is_empty() {
            return found;
        }

        let total = self.regions.len();
        for (index, region) in self.regions.iter_mut().enumerate() {
            if value.len() > region.size {
                region.matches.iter_mut().for_each(|m| *m = false);
            } else {
                let tail = region.size - value.len();
                for i in 0..tail {
                    if !region.matches[i] {
                        continue;
                    }
                    let still = &region.current[i..i + value.len()] == value;
                    region.matches[i] = still;
                    if still {
                        found.push(region.base + i as u64);
                    }
                }
                // Positions at the end can never hold the value.
                region.matches[tail..].iter_mut().for_each(|m| *m = false);
            }

            if let Some(observer) = &self.progress {
                observer(((index + 1) * 100 / total) as u32);
            }
        }
        found
    }

    /// Forgets all refinement; every position is a candidate again.
    pub fn reset_matches(&mut self) {
        for region in &mut self.regions {
            region.matches.iter_mut().for_each(|m| *m = true);
        }
    }

    /// Candidates that survived every search so far.
    pub fn match_count(&self) -> usize {
        self.regions.iter().map(ScanRegion::match_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::sim::SimPlatform;
    use crate::os::RegionKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn scanner_over(bytes: &[u8]) -> (Arc<SimPlatform>, Scanner) {
        let sim = Arc::new(SimPlatform::new());
        sim.add_process(42, "target.exe");
        sim.add_region(
            0x1000,
            bytes.len(),
            Protection::READ | Protection::WRITE,
            RegionKind::Private,
        );
        sim.poke(0x1000, bytes);
        let process = Arc::new(Process::new(sim.clone()));
        process.open_by_pid(42).unwrap();
        let mut scanner = Scanner::new(process);
        scanner.identify_regions(0x1000, 0x2000).unwrap();
        scanner.update_cache().unwrap();
        (sim, scanner)
    }

    #[test]
    fn test_search_finds_single_byte() {
        let (_sim, mut scanner) = scanner_over(&[
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D,
            0x0E, 0x0F,
        ]);
        assert_eq!(scanner.search_cache(&[0x04]), vec![0x1004]);
        assert_eq!(scanner.match_count(), 1);
    }

    #[test]
    fn test_refinement_is_monotone() {
        let (sim, mut scanner) = scanner_over(&[
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D,
            0x0E, 0x0F,
        ]);
        assert_eq!(scanner.search_cache(&[0x04]), vec![0x1004]);

        // The value moves on; the old candidate dies and no position may
        // come back without a reset.
        sim.poke(0x1004, &[0x44]);
        scanner.update_cache().unwrap();
        assert_eq!(scanner.search_cache(&[0x04]), Vec::<u64>::new());
        assert_eq!(scanner.search_cache(&[0x44]), Vec::<u64>::new());

        scanner.reset_matches();
        assert_eq!(scanner.search_cache(&[0x44]), vec![0x1004]);
    }

    #[test]
    fn test_tail_positions_are_eliminated() {
        let (_sim, mut scanner) = scanner_over(&[0xAB, 0xCD, 0xAB, 0xCD]);
        // The window at offset 2 falls in the tail [size-L, size) and is
        // eliminated rather than matched.
        assert_eq!(scanner.search_cache(&[0xAB, 0xCD]), vec![0x1000]);
        assert_eq!(scanner.match_count(), 1);
        // A pattern longer than the region kills everything.
        assert_eq!(
            scanner.search_cache(&[0xAB, 0xCD, 0xAB, 0xCD, 0x00]),
            Vec::<u64>::new()
        );
        assert_eq!(scanner.match_count(), 0);
    }

    #[test]
    fn test_progress_reaches_hundred_percent() {
        let (_sim, scanner) = scanner_over(&[0u8; 8]);
        let last = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&last);
        let mut scanner = scanner.with_progress(move |percent| {
            seen.store(percent, Ordering::SeqCst);
        });
        scanner.search_cache(&[0x00]);
        assert_eq!(last.load(Ordering::SeqCst), 100);
    }
}
