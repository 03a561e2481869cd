//! Object processor contract.
//!
//! A processor owns the business action of one use case together with the
//! status graph the engine walks: which statuses it claims, what the claim
//! stamps, where success leads and where a failed attempt reverts to. The
//! graph is plain data (maps); the engine never invents an edge.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use objproc_core::{ProcessableObject, ProcessingPhase, ProcessingStatus};

use crate::config::ConfigError;
use crate::error::ProcessingFailure;

/// Status-to-status edges of a processor's graph.
pub type TransitionMap<S> = HashMap<S, S>;

/// Where `process()` wants the object to go next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStatus<S> {
    /// Explicit target status.
    To(S),
    /// Follow the processor's success map from the current status.
    Advance,
}

/// Outcome of one successful `process()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectProcessingResult<S> {
    next: NextStatus<S>,
    delay: Option<Duration>,
}

impl<S: ProcessingStatus> ObjectProcessingResult<S> {
    pub fn transition_to(status: S) -> Self {
        Self {
            next: NextStatus::To(status),
            delay: None,
        }
    }

    pub fn advance() -> Self {
        Self {
            next: NextStatus::Advance,
            delay: None,
        }
    }

    /// Re-schedule a PENDING target no earlier than `delay` from now.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn next(&self) -> NextStatus<S> {
        self.next
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }
}

/// When a retried object becomes eligible again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryDelay {
    Immediate,
    After(Duration),
    /// Use the engine's `retry_delay_millis`.
    #[default]
    EngineDefault,
}

impl RetryDelay {
    /// Processor-specified delays win; the engine default only fills the gap.
    pub fn resolve(self, engine_default: Duration) -> Duration {
        match self {
            RetryDelay::Immediate => Duration::ZERO,
            RetryDelay::After(delay) => delay,
            RetryDelay::EngineDefault => engine_default,
        }
    }
}

/// Where a failed attempt reverts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryHandling<S> {
    pub next_status: S,
    pub delay: RetryDelay,
}

impl<S> RetryHandling<S> {
    pub fn immediate(next_status: S) -> Self {
        Self {
            next_status,
            delay: RetryDelay::Immediate,
        }
    }

    pub fn after(next_status: S, delay: Duration) -> Self {
        Self {
            next_status,
            delay: RetryDelay::After(delay),
        }
    }

    pub fn engine_default(next_status: S) -> Self {
        Self {
            next_status,
            delay: RetryDelay::EngineDefault,
        }
    }
}

/// Pluggable business logic of one use case.
///
/// `process()` may fail freely (`?` on anything convertible to `anyhow::Error`);
/// the engine catches the error, classifies it by attempt count and applies
/// either [`determine_retry_handling`](Self::determine_retry_handling) or
/// [`determine_failure_status`](Self::determine_failure_status).
pub trait ObjectProcessor<O: ProcessableObject>: Send + Sync {
    /// Perform the unit of work for the object's current status.
    fn process(&self, object: &O) -> anyhow::Result<ObjectProcessingResult<O::Status>>;

    /// Statuses this processor claims work for.
    fn pending_statuses(&self) -> HashSet<O::Status>;

    /// PENDING -> PROCESSING edges stamped at claim time.
    fn claim_transitions(&self) -> TransitionMap<O::Status>;

    /// Edges followed by [`ObjectProcessingResult::advance`].
    fn success_transitions(&self) -> TransitionMap<O::Status> {
        HashMap::new()
    }

    /// PROCESSING -> PENDING edges applied when an attempt fails.
    fn retry_transitions(&self) -> TransitionMap<O::Status> {
        HashMap::new()
    }

    fn determine_processing_status_on_claim(&self, _object: &O, current: O::Status) -> O::Status {
        self.claim_transitions()
            .get(&current)
            .copied()
            .unwrap_or(current)
    }

    fn determine_status_on_success(&self, _object: &O, current: O::Status) -> Option<O::Status> {
        self.success_transitions().get(&current).copied()
    }

    /// Retry map first, then the claim map read backwards.
    fn determine_retry_handling(
        &self,
        _object: &O,
        current: O::Status,
        _cause: &ProcessingFailure,
    ) -> RetryHandling<O::Status> {
        let next_status = self
            .retry_transitions()
            .get(&current)
            .copied()
            .or_else(|| reverse_lookup(&self.claim_transitions(), current))
            .unwrap_or(current);
        RetryHandling::engine_default(next_status)
    }

    /// Terminal FAILED-phase status assigned once attempts are exhausted.
    fn determine_failure_status(
        &self,
        object: &O,
        current: O::Status,
        cause: &ProcessingFailure,
    ) -> O::Status;

    /// `None` defers to the engine configuration.
    fn max_processing_attempts(&self) -> Option<u32> {
        None
    }
}

impl<O, P> ObjectProcessor<O> for Arc<P>
where
    O: ProcessableObject,
    P: ObjectProcessor<O> + ?Sized,
{
    fn process(&self, object: &O) -> anyhow::Result<ObjectProcessingResult<O::Status>> {
        (**self).process(object)
    }

    fn pending_statuses(&self) -> HashSet<O::Status> {
        (**self).pending_statuses()
    }

    fn claim_transitions(&self) -> TransitionMap<O::Status> {
        (**self).claim_transitions()
    }

    fn success_transitions(&self) -> TransitionMap<O::Status> {
        (**self).success_transitions()
    }

    fn retry_transitions(&self) -> TransitionMap<O::Status> {
        (**self).retry_transitions()
    }

    fn determine_processing_status_on_claim(&self, object: &O, current: O::Status) -> O::Status {
        (**self).determine_processing_status_on_claim(object, current)
    }

    fn determine_status_on_success(&self, object: &O, current: O::Status) -> Option<O::Status> {
        (**self).determine_status_on_success(object, current)
    }

    fn determine_retry_handling(
        &self,
        object: &O,
        current: O::Status,
        cause: &ProcessingFailure,
    ) -> RetryHandling<O::Status> {
        (**self).determine_retry_handling(object, current, cause)
    }

    fn determine_failure_status(
        &self,
        object: &O,
        current: O::Status,
        cause: &ProcessingFailure,
    ) -> O::Status {
        (**self).determine_failure_status(object, current, cause)
    }

    fn max_processing_attempts(&self) -> Option<u32> {
        (**self).max_processing_attempts()
    }
}

fn reverse_lookup<S: ProcessingStatus>(map: &TransitionMap<S>, target: S) -> Option<S> {
    map.iter().find(|(_, to)| **to == target).map(|(from, _)| *from)
}

/// The validated status graph of a processor, captured once at engine construction.
#[derive(Debug, Clone)]
pub struct ProcessorDeclaration<S> {
    pub pending_statuses: HashSet<S>,
    pub claim_transitions: TransitionMap<S>,
    /// PROCESSING -> PENDING edges used for stale-lock recovery.
    pub stale_reversions: TransitionMap<S>,
}

impl<S: ProcessingStatus> ProcessorDeclaration<S> {
    /// Check the processor's graph and derive the recovery edges.
    pub fn from_processor<O, P>(processor: &P) -> Result<Self, ConfigError>
    where
        O: ProcessableObject<Status = S>,
        P: ObjectProcessor<O> + ?Sized,
    {
        let pending_statuses = processor.pending_statuses();
        let claim_transitions = processor.claim_transitions();
        let success_transitions = processor.success_transitions();
        let retry_transitions = processor.retry_transitions();

        if pending_statuses.is_empty() {
            return Err(ConfigError::NoPendingStatuses);
        }

        for status in &pending_statuses {
            if status.processing_phase() != ProcessingPhase::Pending {
                return Err(ConfigError::InvalidStatusDeclaration(format!(
                    "pending status {status} is in phase {}",
                    status.processing_phase()
                )));
            }
            let Some(target) = claim_transitions.get(status) else {
                return Err(ConfigError::MissingClaimTransition(status.to_string()));
            };
            if target.processing_phase() != ProcessingPhase::Processing {
                return Err(ConfigError::InvalidStatusDeclaration(format!(
                    "claim transition {status} -> {target} must target a PROCESSING status"
                )));
            }
        }

        for (from, to) in &retry_transitions {
            if to.processing_phase() != ProcessingPhase::Pending {
                return Err(ConfigError::InvalidStatusDeclaration(format!(
                    "retry transition {from} -> {to} must target a PENDING status"
                )));
            }
        }

        for (from, to) in &success_transitions {
            if from.processing_phase() != ProcessingPhase::Processing {
                return Err(ConfigError::InvalidStatusDeclaration(format!(
                    "success transition {from} -> {to} must start from a PROCESSING status"
                )));
            }
        }

        let mut stale_reversions: TransitionMap<S> = retry_transitions
            .iter()
            .filter(|(from, _)| from.processing_phase() == ProcessingPhase::Processing)
            .map(|(from, to)| (*from, *to))
            .collect();
        for (pending, processing) in &claim_transitions {
            stale_reversions.entry(*processing).or_insert(*pending);
        }

        Ok(Self {
            pending_statuses,
            claim_transitions,
            stale_reversions,
        })
    }
}
