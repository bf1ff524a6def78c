//! Property tests for the fan-in guarantees.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{test_config, FixedBatchSource, Harness, ScriptedConverter, Step};
use docbatch_core::barrier::{BarrierSignal, CompletionBarrier, InMemoryCompletionBarrier};
use docbatch_core::state_machine::{JobState, UnitState};
use proptest::prelude::*;
use uuid::Uuid;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

/// Notification order plus a number of yields each notifier performs first
fn interleaving_strategy() -> impl Strategy<Value = Vec<(usize, u8)>> {
    (1usize..48).prop_flat_map(|n| {
        (
            Just((0..n).collect::<Vec<_>>()).prop_shuffle(),
            prop::collection::vec(0u8..8, n),
        )
            .prop_map(|(order, yields)| order.into_iter().zip(yields).collect())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Exactly one of N concurrent notifiers observes the release
    #[test]
    fn concurrent_notifications_release_exactly_once(interleaving in interleaving_strategy()) {
        let signals = runtime().block_on(async move {
            let barrier = Arc::new(InMemoryCompletionBarrier::new());
            let job_id = Uuid::new_v4();
            let unit_ids: Vec<Uuid> = (0..interleaving.len()).map(|_| Uuid::new_v4()).collect();
            barrier.seed(job_id, unit_ids.len() as u32).await.unwrap();

            let handles: Vec<_> = interleaving
                .into_iter()
                .map(|(index, yields)| {
                    let barrier = Arc::clone(&barrier);
                    let unit_id = unit_ids[index];
                    tokio::spawn(async move {
                        for _ in 0..yields {
                            tokio::task::yield_now().await;
                        }
                        barrier.notify(job_id, unit_id).await.unwrap()
                    })
                })
                .collect();

            let mut signals = Vec::new();
            for handle in handles {
                signals.push(handle.await.unwrap());
            }
            assert_eq!(barrier.outstanding(job_id).await.unwrap(), Some(0));
            signals
        });

        let released = signals.iter().filter(|s| s.is_released()).count();
        prop_assert_eq!(released, 1);

        let mut outstanding: Vec<u32> = signals
            .iter()
            .filter_map(|s| match s {
                BarrierSignal::Pending { outstanding } => Some(*outstanding),
                BarrierSignal::Released => None,
            })
            .collect();
        outstanding.sort_unstable();
        let expected: Vec<u32> = (1..signals.len() as u32).collect();
        prop_assert_eq!(outstanding, expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Counts always add up, attempts stay within budget and the terminal
    /// status follows from the unit outcomes
    #[test]
    fn job_outcome_follows_unit_outcomes(failures in prop::collection::vec(0usize..4, 1..6)) {
        const MAX_ATTEMPTS: u32 = 3;

        let members: Vec<String> = (0..failures.len()).map(|i| format!("doc{i}.docx")).collect();
        let report = runtime().block_on({
            let members = members.clone();
            let failures = failures.clone();
            async move {
                let mut converter = ScriptedConverter::new();
                for (member, &count) in members.iter().zip(&failures) {
                    let mut steps = vec![Step::Fail("transient"); count];
                    steps.push(Step::Succeed);
                    converter = converter.script(member, steps);
                }

                let member_refs: Vec<&str> = members.iter().map(String::as_str).collect();
                let harness = Harness::start(
                    FixedBatchSource::new(&member_refs),
                    converter,
                    test_config(3, MAX_ATTEMPTS),
                );
                let job_id = harness.system.submit("batch.zip").await.unwrap();
                let report = harness
                    .system
                    .wait_for_terminal(job_id, Duration::from_secs(10))
                    .await
                    .unwrap();
                harness.system.shutdown().await;
                assert_eq!(harness.packager.calls().len(), usize::from(report.completed_units > 0));
                report
            }
        });

        let expected_failed = failures.iter().filter(|&&f| f >= MAX_ATTEMPTS as usize).count() as u32;
        let total = failures.len() as u32;

        prop_assert_eq!(report.total_units, total);
        prop_assert_eq!(report.failed_units, expected_failed);
        prop_assert_eq!(report.completed_units + report.failed_units, total);
        prop_assert!(report.units.iter().all(|u| u.attempt_count >= 1 && u.attempt_count <= MAX_ATTEMPTS));
        prop_assert!(report.units.iter().all(|u| u.status.is_terminal()));

        let expected_status = if expected_failed == 0 {
            JobState::Completed
        } else if expected_failed == total {
            JobState::Failed
        } else {
            JobState::CompletedWithErrors
        };
        prop_assert_eq!(report.status, expected_status);

        for (unit, &count) in report.units.iter().zip(&failures) {
            let expected = if count >= MAX_ATTEMPTS as usize { UnitState::Failed } else { UnitState::Completed };
            prop_assert_eq!(unit.status, expected);
        }
    }
}
