//! Admission control: the running set and the global concurrency cap.
//!
//! Both live behind one mutex so two executions of the same pipeline id
//! can never both be admitted. A [`RunToken`] is the membership proof; it
//! removes its id from the running set on drop.

use crate::errors::EtlError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared between a running execution and
/// the engine's `stop_pipeline` surface.
#[derive(Debug, Default)]
pub struct CancelFlag {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl CancelFlag {
    /// Creates an unset flag.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// True once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Requests cancellation. Idempotent; only the first reason is kept.
    pub fn cancel(&self, reason: impl Into<String>) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            *self.reason.lock() = Some(reason.into());
        }
    }

    /// The recorded cancellation reason, if cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

#[derive(Debug, Default)]
struct RunState {
    running: HashMap<String, Arc<CancelFlag>>,
}

/// Gatekeeper for the running set and the global concurrency cap.
#[derive(Debug)]
pub struct AdmissionControl {
    limit: usize,
    state: Mutex<RunState>,
}

impl AdmissionControl {
    /// Creates admission control with the given global cap.
    #[must_use]
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit: limit.max(1),
            state: Mutex::new(RunState::default()),
        })
    }

    /// The configured global cap.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Attempts to admit one execution of `pipeline_id`.
    ///
    /// Checks the global cap first, then same-id exclusivity; both checks
    /// and the insertion happen under one lock. Rejections never queue;
    /// the caller decides whether to retry later.
    pub fn admit(self: &Arc<Self>, pipeline_id: &str) -> Result<RunToken, EtlError> {
        let mut state = self.state.lock();
        if state.running.len() >= self.limit {
            return Err(EtlError::ConcurrencyLimit { limit: self.limit });
        }
        if state.running.contains_key(pipeline_id) {
            return Err(EtlError::AlreadyRunning(pipeline_id.to_string()));
        }

        let cancel = CancelFlag::new();
        state
            .running
            .insert(pipeline_id.to_string(), cancel.clone());

        Ok(RunToken {
            control: Arc::clone(self),
            pipeline_id: pipeline_id.to_string(),
            cancel,
        })
    }

    /// True while `pipeline_id` holds a token.
    #[must_use]
    pub fn is_running(&self, pipeline_id: &str) -> bool {
        self.state.lock().running.contains_key(pipeline_id)
    }

    /// Number of executions currently admitted.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.state.lock().running.len()
    }

    /// Ids currently in the running set.
    #[must_use]
    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.state.lock().running.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cancels the running execution of `pipeline_id`, if any. Returns
    /// whether a run was signalled.
    pub fn cancel(&self, pipeline_id: &str, reason: impl Into<String>) -> bool {
        let state = self.state.lock();
        match state.running.get(pipeline_id) {
            Some(flag) => {
                flag.cancel(reason);
                true
            }
            None => false,
        }
    }

    /// Runs `action` while holding the admission lock, but only if
    /// `pipeline_id` is not in the running set. Used by the registry so a
    /// pipeline can never be removed while its id is running.
    pub fn while_not_running<T>(
        &self,
        pipeline_id: &str,
        action: impl FnOnce() -> T,
    ) -> Result<T, EtlError> {
        let state = self.state.lock();
        if state.running.contains_key(pipeline_id) {
            return Err(EtlError::PipelineRunning(pipeline_id.to_string()));
        }
        Ok(action())
    }

    fn release(&self, pipeline_id: &str) {
        self.state.lock().running.remove(pipeline_id);
    }
}

/// RAII proof that a pipeline id occupies the running set.
#[derive(Debug)]
pub struct RunToken {
    control: Arc<AdmissionControl>,
    pipeline_id: String,
    cancel: Arc<CancelFlag>,
}

impl RunToken {
    /// The pipeline this token admits.
    #[must_use]
    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    /// The cancellation flag tied to this run.
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<CancelFlag> {
        self.cancel.clone()
    }
}

impl Drop for RunToken {
    fn drop(&mut self) {
        self.control.release(&self.pipeline_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_id_rejected_while_running() {
        let control = AdmissionControl::new(4);
        let token = control.admit("p1").unwrap();

        assert!(matches!(
            control.admit("p1"),
            Err(EtlError::AlreadyRunning(_))
        ));

        drop(token);
        assert!(control.admit("p1").is_ok());
    }

    #[test]
    fn test_global_cap_checked_before_exclusivity() {
        let control = AdmissionControl::new(1);
        let _a = control.admit("a").unwrap();

        // Cap is full; even a duplicate id reports the limit first.
        assert!(matches!(
            control.admit("b"),
            Err(EtlError::ConcurrencyLimit { limit: 1 })
        ));
        assert!(matches!(
            control.admit("a"),
            Err(EtlError::ConcurrencyLimit { limit: 1 })
        ));
    }

    #[test]
    fn test_token_drop_frees_slot() {
        let control = AdmissionControl::new(1);
        let token = control.admit("a").unwrap();
        assert_eq!(control.running_count(), 1);

        drop(token);
        assert_eq!(control.running_count(), 0);
        assert!(control.admit("b").is_ok());
    }

    #[test]
    fn test_while_not_running_guards_removal() {
        let control = AdmissionControl::new(4);
        let token = control.admit("p").unwrap();

        let refused = control.while_not_running("p", || ());
        assert!(matches!(refused, Err(EtlError::PipelineRunning(_))));

        drop(token);
        assert!(control.while_not_running("p", || ()).is_ok());
    }

    #[test]
    fn test_cancel_reaches_running_flag() {
        let control = AdmissionControl::new(4);
        let token = control.admit("p").unwrap();
        let flag = token.cancel_flag();

        assert!(!flag.is_cancelled());
        assert!(control.cancel("p", "stopped by operator"));
        assert!(flag.is_cancelled());
        assert_eq!(flag.reason().as_deref(), Some("stopped by operator"));

        assert!(!control.cancel("ghost", "nobody home"));
    }

    #[test]
    fn test_concurrent_same_id_admits_exactly_once() {
        let control = AdmissionControl::new(8);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let control = control.clone();
                // Tokens are returned, not dropped, so every admit attempt
                // races against a live holder.
                std::thread::spawn(move || control.admit("p"))
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .collect();

        let admitted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 1);
        assert!(results
            .iter()
            .all(|r| matches!(r, Ok(_) | Err(EtlError::AlreadyRunning(_)))));
    }
}
