//! Two-level fair queue.
//!
//! Level 1 orders by priority (descending, FIFO within a submitter's own
//! jobs). Level 2 round-robins across submitter ids inside each priority
//! band so one submitter's backlog cannot starve another's. Jobs that do
//! not currently fit host capacity are skipped in place and retried on
//! the next dispatch pass.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use super::Job;

/// One priority band: per-submitter FIFOs plus a rotation cursor.
#[derive(Debug, Default)]
struct Band {
    /// Submitters in first-seen order; rotation starts at `cursor`.
    submitters: Vec<String>,
    cursor: usize,
    jobs: FxHashMap<String, VecDeque<Job>>,
}

impl Band {
    fn is_empty(&self) -> bool {
        self.jobs.values().all(VecDeque::is_empty)
    }
}

/// The scheduler's pending-job structure. Not thread-safe by itself —
/// the scheduler guards it with its single state mutex.
#[derive(Debug, Default)]
pub struct FairQueue {
    /// Priority bands, keyed by priority value.
    bands: FxHashMap<u8, Band>,
    len: usize,
}

impl FairQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn enqueue(&mut self, job: Job) {
        let band = self.bands.entry(job.priority).or_default();
        if !band.submitters.iter().any(|s| *s == job.submitter) {
            band.submitters.push(job.submitter.clone());
        }
        band.jobs
            .entry(job.submitter.clone())
            .or_default()
            .push_back(job);
        self.len += 1;
    }

    /// Pop the next dispatchable job: highest priority first, then
    /// round-robin over submitters, FIFO within a submitter. `fits`
    /// filters on current capacity; a job that does not fit stays put
    /// (its submitter's turn is not consumed).
    pub fn pop_where(&mut self, fits: impl Fn(&Job) -> bool) -> Option<Job> {
        let mut priorities: Vec<u8> = self
            .bands
            .iter()
            .filter(|(_, band)| !band.is_empty())
            .map(|(p, _)| *p)
            .collect();
        priorities.sort_unstable_by(|a, b| b.cmp(a));

        for priority in priorities {
            let band = self.bands.get_mut(&priority)?;
            let submitter_count = band.submitters.len();
            for offset in 0..submitter_count {
                let slot = (band.cursor + offset) % submitter_count;
                let submitter = band.submitters[slot].clone();
                let Some(fifo) = band.jobs.get_mut(&submitter) else {
                    continue;
                };
                if let Some(front) = fifo.front() {
                    if fits(front) {
                        let job = fifo.pop_front().expect("front checked");
                        band.cursor = (slot + 1) % submitter_count;
                        self.len -= 1;
                        return Some(job);
                    }
                }
            }
        }
        None
    }

    /// Remove a queued job by id (operator cancellation before dispatch).
    pub fn remove(&mut self, job_id: &str) -> Option<Job> {
        for band in self.bands.values_mut() {
            for fifo in band.jobs.values_mut() {
                if let Some(pos) = fifo.iter().position(|j| j.id == job_id) {
                    self.len -= 1;
                    return fifo.remove(pos);
                }
            }
        }
        None
    }

    /// Whether a job with this id is waiting.
    #[must_use]
    pub fn contains(&self, job_id: &str) -> bool {
        self.bands
            .values()
            .any(|band| band.jobs.values().any(|fifo| fifo.iter().any(|j| j.id == job_id)))
    }
}

// ============================================================================
// Tests
// ============================================================================
