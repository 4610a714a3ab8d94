//! Aggregation of per-entity resynchronization results.
//!
//! Each entity is resynchronized independently after a reconnect. Failures
//! are collected into one report so that a single `errors.unhandled` event
//! describes the whole pass.

use feed_types::{ReconciliationFailure, UnhandledErrorEvent};

/// Outcome of one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Entities attempted.
    pub attempted: usize,
    /// Entities that failed, in completion order.
    pub failures: Vec<ReconciliationFailure>,
}

impl RecoveryReport {
    /// Build a report from `(entity_id, result)` pairs.
    pub fn collect<I, E>(results: I) -> Self
    where
        I: IntoIterator<Item = (String, Result<(), E>)>,
        E: ToString,
    {
        let mut report = Self::default();
        for (entity_id, result) in results {
            report.attempted += 1;
            if let Err(e) = result {
                report.failures.push(ReconciliationFailure {
                    entity_id,
                    reason: e.to_string(),
                });
            }
        }
        report
    }

    /// Number of entities that resynchronized.
    pub fn succeeded(&self) -> usize {
        self.attempted - self.failures.len()
    }

    /// The aggregate event, if anything failed.
    pub fn into_event(self) -> Option<UnhandledErrorEvent> {
        if self.failures.is_empty() {
            None
        } else {
            Some(UnhandledErrorEvent::reconciliation(self.failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_success_emits_nothing() {
        let report = RecoveryReport::collect(vec![
            ("user:a".to_string(), Ok::<(), String>(())),
            ("user:b".to_string(), Ok(())),
        ]);
        assert_eq!(report.succeeded(), 2);
        assert!(report.into_event().is_none());
    }

    #[test]
    fn failures_are_aggregated_into_one_event() {
        let results = (0..5).map(|i| {
            let id = format!("user:{i}");
            let result = if i == 1 || i == 3 {
                Err(format!("boom {i}"))
            } else {
                Ok(())
            };
            (id, result)
        });
        let report = RecoveryReport::collect(results);
        assert_eq!(report.attempted, 5);
        assert_eq!(report.succeeded(), 3);

        let event = report.into_event().unwrap();
        assert_eq!(event.error_type, "reconnection-reconciliation");
        let ids: Vec<_> = event.failures.iter().map(|f| f.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["user:1", "user:3"]);
        assert_eq!(event.failures[0].reason, "boom 1");
    }
}
