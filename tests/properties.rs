//! Property tests for queue ordering and retry backoff

use proptest::prelude::*;
use std::sync::Arc;

use ticketwatch::clock::{ManualClock, SharedClock};
use ticketwatch::scheduler::{JobRequest, Priority, Scheduler, SchedulerConfig};
use ticketwatch::utils::retry::RetryConfig;

fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Normal),
        Just(Priority::High),
        Just(Priority::Critical),
    ]
}

proptest! {
    #[test]
    fn prop_dispatch_order_is_score_then_fifo(
        jobs in prop::collection::vec((priority_strategy(), any::<bool>()), 1..40)
    ) {
        let clock: SharedClock = Arc::new(ManualClock::starting_now());
        let scheduler = Scheduler::new(SchedulerConfig::default(), clock);

        for (i, (priority, high_demand)) in jobs.iter().enumerate() {
            let mut request = JobRequest::new("stubhub", "listings", format!("{i:03}"))
                .with_priority(*priority);
            if *high_demand {
                request = request.high_demand();
            }
            scheduler.enqueue(request).unwrap();
        }

        let mut popped = Vec::new();
        while let Some(job) = scheduler.pop_ready("stubhub") {
            popped.push(job);
        }
        prop_assert_eq!(popped.len(), jobs.len());

        for pair in popped.windows(2) {
            prop_assert!(pair[0].score >= pair[1].score);
            if pair[0].score == pair[1].score {
                let first: usize = pair[0].target.parse().unwrap();
                let second: usize = pair[1].target.parse().unwrap();
                prop_assert!(first < second);
            }
        }
    }

    #[test]
    fn prop_backoff_is_capped_and_monotonic(
        base in 1u64..5_000,
        extra in 0u64..120_000,
        attempts in 0u32..80,
    ) {
        let max = base + extra;
        let config = RetryConfig::with_delays(3, base, max);

        let mut previous = std::time::Duration::ZERO;
        for attempt in 0..=attempts {
            let delay = config.backoff_delay(attempt);
            prop_assert!(delay.as_millis() <= u128::from(max));
            prop_assert!(delay >= previous);
            previous = delay;
        }
    }
}
