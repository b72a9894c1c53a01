//! Live-capture table and job index, kept consistent under one lock.

use std::collections::{BTreeSet, HashMap};

use podcap_core::{CaptureId, CaptureRecord};
use podcap_model::{JobKey, PodKey};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::admission::{Slot, SlotPool};

pub(super) struct LiveCapture {
    pub record: CaptureRecord,
    pub timer: Option<AbortHandle>,
    /// Asks the observer to kill the process group.
    pub kill: CancellationToken,
    pub observer: Option<JoinHandle<bool>>,
    pub slot: Slot,
}

/// A capture taken out of the table; its slot has already been returned.
pub(super) struct Removed {
    pub record: CaptureRecord,
    pub timer: Option<AbortHandle>,
    pub kill: CancellationToken,
    pub observer: Option<JoinHandle<bool>>,
}

pub(super) struct Table {
    pub slots: SlotPool,
    next_id: u64,
    captures: HashMap<PodKey, LiveCapture>,
    by_job: HashMap<JobKey, BTreeSet<PodKey>>,
}

impl Table {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: SlotPool::new(capacity),
            next_id: 0,
            captures: HashMap::new(),
            by_job: HashMap::new(),
        }
    }

    pub fn next_id(&mut self) -> CaptureId {
        self.next_id += 1;
        CaptureId(self.next_id)
    }

    pub fn contains(&self, pod: &PodKey) -> bool {
        self.captures.contains_key(pod)
    }

    pub fn get(&self, pod: &PodKey) -> Option<&LiveCapture> {
        self.captures.get(pod)
    }

    pub fn get_mut(&mut self, pod: &PodKey) -> Option<&mut LiveCapture> {
        self.captures.get_mut(pod)
    }

    /// Insert a capture. The caller has checked that `pod` has no live record.
    pub fn insert(&mut self, live: LiveCapture) {
        let pod = live.record.pod.clone();
        self.by_job
            .entry(live.record.job.clone())
            .or_default()
            .insert(pod.clone());
        self.captures.insert(pod, live);
    }

    pub fn remove(&mut self, pod: &PodKey) -> Option<Removed> {
        let LiveCapture {
            record,
            timer,
            kill,
            observer,
            slot,
        } = self.captures.remove(pod)?;

        if let Some(pods) = self.by_job.get_mut(&record.job) {
            pods.remove(pod);
            if pods.is_empty() {
                self.by_job.remove(&record.job);
            }
        }
        self.slots.release(slot);
        Some(Removed {
            record,
            timer,
            kill,
            observer,
        })
    }

    /// Remove the record of `pod` only if it is still incarnation `id`.
    pub fn remove_if(&mut self, pod: &PodKey, id: CaptureId) -> Option<Removed> {
        if self.captures.get(pod)?.record.id != id {
            return None;
        }
        self.remove(pod)
    }

    pub fn records(&self) -> impl Iterator<Item = &CaptureRecord> {
        self.captures.values().map(|live| &live.record)
    }

    pub fn records_for_job(&self, job: &JobKey) -> Vec<CaptureRecord> {
        self.by_job
            .get(job)
            .into_iter()
            .flatten()
            .filter_map(|pod| self.captures.get(pod))
            .map(|live| live.record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.captures.len()
    }

    /// Every record reachable by pod key is indexed under its job and vice versa, and
    /// every held slot belongs to exactly one record.
    #[cfg(test)]
    pub fn is_consistent(&self) -> bool {
        let indexed: usize = self.by_job.values().map(BTreeSet::len).sum();
        indexed == self.captures.len()
            && self.slots.held() == self.captures.len()
            && self.by_job.iter().all(|(job, pods)| {
                pods.iter()
                    .all(|pod| self.captures.get(pod).is_some_and(|l| &l.record.job == job))
            })
    }
}
