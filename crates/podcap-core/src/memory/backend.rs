use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use podcap_model::{ContainerRef, JobKey, PodKey};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{CaptureBackend, CaptureId, CaptureRecord, CaptureRequest, StopMode},
    error::CaptureError,
};

struct Live {
    record: CaptureRecord,
    timer: Option<AbortHandle>,
}

struct State {
    capacity: usize,
    next_id: u64,
    captures: BTreeMap<PodKey, Live>,
    fail_next: Option<CaptureError>,
    stops: Vec<(PodKey, StopMode)>,
    cleaned: Vec<JobKey>,
}

/// Capture backend that tracks records and admission slots only.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(State {
                capacity,
                next_id: 0,
                captures: BTreeMap::new(),
                fail_next: None,
                stops: Vec::new(),
                cleaned: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Fail the next admitted start with `err`.
    pub fn fail_next_start(&self, err: CaptureError) {
        self.state().fail_next = Some(err);
    }

    /// Simulate the capture process of `pod` exiting on its own.
    pub fn exit(&self, pod: &PodKey) -> Option<CaptureRecord> {
        let live = self.state().captures.remove(pod)?;
        if let Some(timer) = live.timer {
            timer.abort();
        }
        Some(live.record)
    }

    /// Every stop performed so far, in order.
    pub fn stops(&self) -> Vec<(PodKey, StopMode)> {
        self.state().stops.clone()
    }

    pub fn cleaned_jobs(&self) -> Vec<JobKey> {
        self.state().cleaned.clone()
    }
}

#[async_trait]
impl CaptureBackend for MemoryBackend {
    async fn start(
        &self,
        req: CaptureRequest,
        cancel: &CancellationToken,
    ) -> Result<CaptureRecord, CaptureError> {
        if cancel.is_cancelled() {
            return Err(CaptureError::Cancelled);
        }
        req.container.parse::<ContainerRef>()?;

        let mut st = self.state();
        if st.captures.len() >= st.capacity {
            return Err(CaptureError::AtCapacity);
        }
        if st.captures.contains_key(&req.pod) {
            return Err(CaptureError::AlreadyRunning(req.pod));
        }
        if let Some(err) = st.fail_next.take() {
            return Err(err);
        }

        st.next_id += 1;
        let base = format!("/captures/capture-{}-{}.pcap", req.job.name(), req.pod.name());
        let record = CaptureRecord {
            id: CaptureId(st.next_id),
            pod: req.pod.clone(),
            job: req.job,
            file_pattern: format!("{base}*"),
            file_location: base,
            max_files: req.max_files,
            timeout: req.timeout,
            pid: 1000 + st.next_id as u32,
        };
        st.captures.insert(
            req.pod,
            Live {
                record: record.clone(),
                timer: None,
            },
        );
        Ok(record)
    }

    async fn stop(&self, pod: &PodKey, mode: StopMode) -> Option<CaptureRecord> {
        let mut st = self.state();
        let live = st.captures.remove(pod)?;
        if let Some(timer) = live.timer {
            timer.abort();
        }
        st.stops.push((pod.clone(), mode));
        Some(live.record)
    }

    async fn stop_expired(&self, pod: &PodKey, id: CaptureId) -> Option<CaptureRecord> {
        let mut st = self.state();
        if st.captures.get(pod).map(|live| live.record.id) != Some(id) {
            return None;
        }
        let live = st.captures.remove(pod)?;
        st.stops.push((pod.clone(), StopMode::Retain));
        Some(live.record)
    }

    fn attach_timer(&self, pod: &PodKey, id: CaptureId, timer: AbortHandle) -> bool {
        match self.state().captures.get_mut(pod) {
            Some(live) if live.record.id == id => {
                live.timer = Some(timer);
                true
            }
            _ => false,
        }
    }

    fn capture(&self, pod: &PodKey) -> Option<CaptureRecord> {
        self.state().captures.get(pod).map(|live| live.record.clone())
    }

    fn captures_for_job(&self, job: &JobKey) -> Vec<CaptureRecord> {
        self.state()
            .captures
            .values()
            .filter(|live| &live.record.job == job)
            .map(|live| live.record.clone())
            .collect()
    }

    fn captures(&self) -> Vec<CaptureRecord> {
        self.state()
            .captures
            .values()
            .map(|live| live.record.clone())
            .collect()
    }

    fn latest_artifact(&self, records: &[CaptureRecord]) -> Option<String> {
        records.first().map(|r| r.file_location.clone())
    }

    fn cleanup_job_artifacts(&self, job: &JobKey) {
        self.state().cleaned.push(job.clone());
    }
}
