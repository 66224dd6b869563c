//! Parallel execution of chunk batches, one color group at a time.

use rayon::prelude::*;

/// Worker pool that runs every batch of one color concurrently and joins
/// before the caller advances to the next color.
pub(crate) struct Scheduler {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl Scheduler {
    pub fn new(workers: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()?;
        Ok(Self { pool, workers })
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `task` once per `(batch index, chunk list)` pair. Returns only
    /// after every batch finished; a panic inside a task propagates to the
    /// caller and aborts the tick.
    pub fn run_color<F>(&self, batches: &[(usize, &[usize])], task: F)
    where
        F: Fn(usize, &[usize]) + Send + Sync,
    {
        self.pool.install(|| {
            batches
                .par_iter()
                .for_each(|&(batch, chunks)| task(batch, chunks));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn every_batch_runs_before_returning() {
        let scheduler = Scheduler::new(3).expect("pool");
        assert_eq!(scheduler.workers(), 3);

        let chunks: Vec<Vec<usize>> = (0..7).map(|i| vec![i]).collect();
        let batches: Vec<(usize, &[usize])> = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| (i, c.as_slice()))
            .collect();

        let visited = AtomicUsize::new(0);
        scheduler.run_color(&batches, |_, chunks| {
            visited.fetch_add(chunks.len(), Ordering::Relaxed);
        });
        assert_eq!(visited.load(Ordering::Relaxed), 7);
    }
}
