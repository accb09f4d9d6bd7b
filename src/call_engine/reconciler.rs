//! Candidate Reconciler
//!
//! ICE Candidates dürfen erst angewendet werden, wenn der Transport eine
//! Remote Description hat. Früh eintreffende Candidates werden hier
//! gepuffert und nach dem Setzen der Remote Description in
//! Empfangsreihenfolge nachgereicht.

use super::transport::SessionTransport;
use crate::signaling::IceCandidate;

/// Ergebnis eines [`CandidateReconciler::flush`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub failed: usize,
}

/// Puffer für Candidates vor der Remote Description
#[derive(Debug, Default)]
pub struct CandidateReconciler {
    queue: Vec<IceCandidate>,
}

impl CandidateReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hängt einen Candidate an die Queue an
    pub fn enqueue(&mut self, candidate: IceCandidate) {
        self.queue.push(candidate);
    }

    /// Einziger Entscheidungspunkt für eingehende Candidates:
    /// puffern, solange kein Transport oder keine Remote Description existiert
    pub async fn should_queue(transport: Option<&dyn SessionTransport>) -> bool {
        match transport {
            Some(transport) => !transport.has_remote_description().await,
            None => true,
        }
    }

    /// Wendet alle gepufferten Candidates in FIFO-Reihenfolge an
    ///
    /// Die Queue wird vorab geleert; ein abgelehnter Candidate blockiert
    /// die übrigen nicht.
    pub async fn flush(&mut self, transport: &dyn SessionTransport) -> FlushReport {
        let queued = std::mem::take(&mut self.queue);
        let mut report = FlushReport::default();

        for candidate in queued {
            match transport.add_candidate(candidate).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    tracing::warn!("Failed to apply queued candidate: {}", e);
                    report.failed += 1;
                }
            }
        }

        if report.applied + report.failed > 0 {
            tracing::debug!(
                "Flushed candidates: {} applied, {} failed",
                report.applied,
                report.failed
            );
        }
        report
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

// ============================================================================
// TESTS
// ============================================================================
