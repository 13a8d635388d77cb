//! Job bookkeeping for the loader.
//!
//! The queue owns every outstanding [`FetchJob`] and guarantees there is at most
//! one per [`TileId`], whether it is waiting, running or sleeping before a
//! retry. Pending jobs sit in a binary heap ordered by priority and then by
//! submission order. Priority raises and cancellations leave stale heap
//! entries behind; `pop` skips them.
//!
//! This type is not synchronized; the loader wraps it in a mutex.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use super::policy::Priority;
use crate::projection::TileId;

/// Result of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new job was created
    Enqueued,
    /// A job for this tile already existed; its priority was raised if needed
    Coalesced,
    /// The loader does not accept this tile (other source, zoom out of range,
    /// or shut down)
    Rejected,
}

/// A unit of work handed to a worker.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub id: TileId,
    pub priority: Priority,
    /// 1-based attempt number
    pub attempt: u32,
    /// Skip the disk cache
    pub forced: bool,
    pub enqueued_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Pending,
    InFlight,
    Backoff,
}

#[derive(Debug)]
struct JobRecord {
    state: JobState,
    priority: Priority,
    sequence: u64,
    attempt: u32,
    forced: bool,
    enqueued_at: Instant,
}

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    priority: Priority,
    sequence: u64,
    id: TileId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier sequence number
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Deduplicating priority queue of fetch jobs.
#[derive(Debug, Default)]
pub struct JobQueue {
    heap: BinaryHeap<HeapEntry>,
    jobs: HashMap<TileId, JobRecord>,
    next_sequence: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job, or merge into the existing one for the same tile.
    ///
    /// Merging keeps the job's place in line among equal priorities, raises
    /// its priority to the maximum of both, and makes it forced if either
    /// submission was.
    pub fn submit(&mut self, id: TileId, priority: Priority, forced: bool) -> SubmitOutcome {
        if let Some(job) = self.jobs.get_mut(&id) {
            job.forced |= forced;
            if priority > job.priority {
                job.priority = priority;
                if job.state == JobState::Pending {
                    self.heap.push(HeapEntry {
                        priority,
                        sequence: job.sequence,
                        id,
                    });
                }
            }
            return SubmitOutcome::Coalesced;
        }

        let sequence = self.next_sequence();
        self.jobs.insert(
            id.clone(),
            JobRecord {
                state: JobState::Pending,
                priority,
                sequence,
                attempt: 1,
                forced,
                enqueued_at: Instant::now(),
            },
        );
        self.heap.push(HeapEntry {
            priority,
            sequence,
            id,
        });
        SubmitOutcome::Enqueued
    }

    /// Take the highest-priority pending job and mark it in flight.
    pub fn pop(&mut self) -> Option<FetchJob> {
        while let Some(entry) = self.heap.pop() {
            let Some(job) = self.jobs.get_mut(&entry.id) else {
                continue;
            };
            let current = job.state == JobState::Pending
                && job.priority == entry.priority
                && job.sequence == entry.sequence;
            if !current {
                continue;
            }

            job.state = JobState::InFlight;
            return Some(FetchJob {
                id: entry.id,
                priority: job.priority,
                attempt: job.attempt,
                forced: job.forced,
                enqueued_at: job.enqueued_at,
            });
        }
        None
    }

    /// Forget a finished job.
    pub fn complete(&mut self, id: &TileId) {
        self.jobs.remove(id);
    }

    /// Park an in-flight job while it waits for its next attempt.
    pub fn start_backoff(&mut self, id: &TileId) {
        if let Some(job) = self.jobs.get_mut(id) {
            job.state = JobState::Backoff;
            job.attempt += 1;
        }
    }

    /// Put a job back in line after its backoff.
    ///
    /// Returns `false` when the job was cancelled in the meantime.
    pub fn requeue(&mut self, id: &TileId) -> bool {
        let sequence = self.next_sequence();
        let Some(job) = self.jobs.get_mut(id) else {
            return false;
        };
        if job.state != JobState::Backoff {
            return false;
        }

        job.state = JobState::Pending;
        job.sequence = sequence;
        self.heap.push(HeapEntry {
            priority: job.priority,
            sequence,
            id: id.clone(),
        });
        true
    }

    /// Put an in-flight job back in line without counting an attempt.
    ///
    /// Used when the source changed under a running fetch. The job skips the
    /// disk cache from then on, since the replaced source may have written
    /// it. Returns `false` if the job is not in flight.
    pub fn restart(&mut self, id: &TileId) -> bool {
        let sequence = self.next_sequence();
        let Some(job) = self.jobs.get_mut(id) else {
            return false;
        };
        if job.state != JobState::InFlight {
            return false;
        }

        job.state = JobState::Pending;
        job.forced = true;
        job.sequence = sequence;
        self.heap.push(HeapEntry {
            priority: job.priority,
            sequence,
            id: id.clone(),
        });
        true
    }

    /// Drop a job that has not started. In-flight jobs are left alone.
    pub fn cancel(&mut self, id: &TileId) -> bool {
        let cancellable = self
            .jobs
            .get(id)
            .is_some_and(|job| job.state != JobState::InFlight);
        if cancellable {
            self.jobs.remove(id);
        }
        cancellable
    }

    /// Drop every job matching `predicate` that has not started.
    pub fn cancel_where<P>(&mut self, mut predicate: P) -> Vec<TileId>
    where
        P: FnMut(&TileId) -> bool,
    {
        let doomed: Vec<TileId> = self
            .jobs
            .iter()
            .filter(|(id, job)| job.state != JobState::InFlight && predicate(id))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &doomed {
            self.jobs.remove(id);
        }
        let jobs = &self.jobs;
        self.heap.retain(|entry| jobs.contains_key(&entry.id));
        doomed
    }

    pub fn contains(&self, id: &TileId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn is_in_flight(&self, id: &TileId) -> bool {
        self.jobs
            .get(id)
            .is_some_and(|job| job.state == JobState::InFlight)
    }

    /// Jobs waiting for a worker or for their next retry.
    pub fn pending_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|job| job.state != JobState::InFlight)
            .count()
    }

    pub fn in_flight_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|job| job.state == JobState::InFlight)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Whether a worker could pick something up right now.
    pub fn has_ready(&self) -> bool {
        self.jobs.values().any(|job| job.state == JobState::Pending)
    }

    fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }
}
