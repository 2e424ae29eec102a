//! Integration tests for the full receive path.
//!
//! Tests: Sender → InMemoryBroker → PrefetchBuffer → FetchEngine → PartitionReceiver
//!
//! Verifies:
//! - Start positions select the right first event in every scheme
//! - Batches are bounded, ordered and gapless across calls
//! - Timeouts, faults, detaches and close surface as the right outcome

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    use hubstream_client::{
        ClientConfig, EventHubClient, EventSender, PartitionReceiver, ReceiverOptions,
        ReceiverState,
    };
    use hubstream_core::{
        Offset, PartitionId, Position, PositionScheme, ReceiveError, ReceivedEvent,
        SequenceNumber,
    };

    use crate::broker::{InMemoryBroker, InMemoryBrokerConfig};

    const GROUP: &str = "$default";
    const PARTITION: &str = "0";
    const SHORT: Duration = Duration::from_millis(150);
    const LONG: Duration = Duration::from_secs(2);

    fn setup_with(config: InMemoryBrokerConfig) -> (Arc<InMemoryBroker>, EventHubClient) {
        let broker = Arc::new(InMemoryBroker::start(config).unwrap());
        let client = EventHubClient::with_config(
            broker.clone(),
            ClientConfig::default().with_open_timeout(LONG),
        )
        .unwrap()
        .with_sender(broker.clone());
        (broker, client)
    }

    fn setup() -> (Arc<InMemoryBroker>, EventHubClient) {
        setup_with(InMemoryBrokerConfig::default())
    }

    fn partition() -> PartitionId {
        PartitionId::new(PARTITION).unwrap()
    }

    fn send(broker: &InMemoryBroker, payload: &str) -> ReceivedEvent {
        let position = broker.append(&partition(), payload.as_bytes().to_vec()).unwrap();
        ReceivedEvent::new(partition(), position, payload.as_bytes().to_vec())
    }

    fn payloads(events: &[ReceivedEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| e.payload_str().unwrap_or_default().to_string())
            .collect()
    }

    /// Receive until `expected` events arrived (or the deadline passes).
    fn collect(receiver: &PartitionReceiver, expected: usize, batch: usize) -> Vec<ReceivedEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut out = Vec::new();
        while out.len() < expected && Instant::now() < deadline {
            out.extend(receiver.receive(batch, SHORT).unwrap());
        }
        out
    }

    fn assert_gapless(events: &[ReceivedEvent]) {
        for pair in events.windows(2) {
            assert_eq!(
                pair[1].sequence_number().value(),
                pair[0].sequence_number().value() + 1,
                "gap or duplicate between consecutive deliveries"
            );
        }
    }

    #[test]
    fn receives_from_stream_start() {
        let (broker, client) = setup();
        send(&broker, "first");
        send(&broker, "Receiving a single event");

        let receiver = client.add_receiver(GROUP, PARTITION, Position::StreamStart).unwrap();
        let events = collect(&receiver, 2, 10);

        assert_eq!(payloads(&events), vec!["first", "Receiving a single event"]);
        assert_eq!(events[0].sequence_number(), SequenceNumber::new(0));
    }

    #[test]
    fn stream_end_sees_only_later_events() {
        let (broker, client) = setup();
        send(&broker, "old");

        let receiver = client.add_receiver(GROUP, PARTITION, Position::StreamEnd).unwrap();
        assert!(receiver.receive(10, SHORT).unwrap().is_empty());
        assert_eq!(receiver.state(), ReceiverState::Open);

        send(&broker, "Receiving only a single event");
        let batch = receiver.receive(10, LONG).unwrap();

        assert_eq!(payloads(&batch), vec!["Receiving only a single event"]);
    }

    #[test]
    fn stream_end_on_empty_partition_sees_the_first_event() {
        let (broker, client) = setup();
        let receiver = client.add_receiver(GROUP, PARTITION, Position::StreamEnd).unwrap();
        assert!(receiver.receive(5, SHORT).unwrap().is_empty());

        send(&broker, "hello");
        let batch = receiver.receive(5, LONG).unwrap();
        assert_eq!(payloads(&batch), vec!["hello"]);
        assert_eq!(batch[0].sequence_number(), SequenceNumber::new(0));
    }

    #[test]
    fn batch_size_bounds_each_call_without_losing_events() {
        let (broker, client) = setup();
        let receiver = client.add_receiver(GROUP, PARTITION, Position::StreamEnd).unwrap();
        assert!(receiver.receive(1, SHORT).unwrap().is_empty());

        for i in 0..10 {
            send(&broker, &format!("event {i}"));
        }

        let first = receiver.receive(5, LONG).unwrap();
        let second = receiver.receive(5, LONG).unwrap();
        assert_eq!(first.len(), 5);
        assert_eq!(second.len(), 5);

        let all: Vec<ReceivedEvent> = first.into_iter().chain(second).collect();
        assert_gapless(&all);
        assert_eq!(all[0].payload_str(), Some("event 0"));
        assert_eq!(all[9].payload_str(), Some("event 9"));

        assert!(receiver.receive(5, SHORT).unwrap().is_empty());
    }

    #[test]
    fn exclusive_offset_skips_the_named_event() {
        let (broker, client) = setup();
        let a = send(&broker, "A");
        let _b = send(&broker, "B");

        let receiver = client
            .add_receiver(GROUP, PARTITION, Position::offset(a.offset()))
            .unwrap();
        let batch = receiver.receive(10, LONG).unwrap();
        assert_eq!(payloads(&batch), vec!["B"]);
    }

    #[test]
    fn inclusive_offset_starts_at_the_named_event() {
        let (broker, client) = setup();
        let _a = send(&broker, "A");
        let b = send(&broker, "B");

        let receiver = client
            .add_receiver(GROUP, PARTITION, Position::offset(b.offset()).inclusive())
            .unwrap();
        let batch = receiver.receive(10, LONG).unwrap();
        assert_eq!(payloads(&batch), vec!["B"]);
    }

    #[test]
    fn offset_at_the_tail_then_new_event() {
        let (broker, client) = setup();
        let _a = send(&broker, "A");
        let b = send(&broker, "B");

        let receiver = client
            .add_receiver(GROUP, PARTITION, Position::offset(b.offset()))
            .unwrap();
        assert!(receiver.receive(10, SHORT).unwrap().is_empty());

        send(&broker, "C");
        let batch = receiver.receive(10, LONG).unwrap();
        assert_eq!(payloads(&batch), vec!["C"]);
    }

    #[test]
    fn sequence_number_positions() {
        let (broker, client) = setup();
        let a = send(&broker, "A");
        send(&broker, "B");

        let exclusive = client
            .add_receiver(GROUP, PARTITION, Position::sequence_number(a.sequence_number()))
            .unwrap();
        assert_eq!(payloads(&exclusive.receive(10, LONG).unwrap()), vec!["B"]);

        let inclusive = client
            .add_receiver(
                GROUP,
                PARTITION,
                Position::sequence_number(a.sequence_number()).inclusive(),
            )
            .unwrap();
        assert_eq!(payloads(&collect(&inclusive, 2, 10)), vec!["A", "B"]);
    }

    #[test]
    fn timestamp_positions() {
        let (broker, client) = setup();
        send(&broker, "A");
        let b = send(&broker, "B");

        let exclusive = client
            .add_receiver(GROUP, PARTITION, Position::enqueued_time(b.enqueued_time()))
            .unwrap();
        assert!(exclusive.receive(10, SHORT).unwrap().is_empty());

        let inclusive = client
            .add_receiver(
                GROUP,
                PARTITION,
                Position::enqueued_time(b.enqueued_time()).inclusive(),
            )
            .unwrap();
        assert_eq!(payloads(&inclusive.receive(10, LONG).unwrap()), vec!["B"]);

        send(&broker, "C");
        assert_eq!(payloads(&exclusive.receive(10, LONG).unwrap()), vec!["C"]);
    }

    #[test]
    fn timestamp_ties_are_all_included_or_all_skipped() {
        let (broker, client) = setup();
        let p = partition();
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        broker.append_at(&p, b"before".to_vec(), t - chrono::TimeDelta::seconds(1)).unwrap();
        broker.append_at(&p, b"tie-1".to_vec(), t).unwrap();
        broker.append_at(&p, b"tie-2".to_vec(), t).unwrap();
        broker.append_at(&p, b"after".to_vec(), t + chrono::TimeDelta::seconds(1)).unwrap();

        let inclusive = client
            .add_receiver(GROUP, PARTITION, Position::enqueued_time(t).inclusive())
            .unwrap();
        assert_eq!(
            payloads(&collect(&inclusive, 3, 10)),
            vec!["tie-1", "tie-2", "after"]
        );

        let exclusive = client
            .add_receiver(GROUP, PARTITION, Position::enqueued_time(t))
            .unwrap();
        assert_eq!(payloads(&exclusive.receive(10, LONG).unwrap()), vec!["after"]);
    }

    #[test]
    fn exclusive_positions_agree_across_schemes() {
        let (broker, client) = setup();
        let a = send(&broker, "A");
        send(&broker, "B");
        send(&broker, "C");

        for scheme in [
            PositionScheme::Offset,
            PositionScheme::SequenceNumber,
            PositionScheme::Timestamp,
        ] {
            let receiver = client
                .add_receiver(GROUP, PARTITION, Position::after(&a, scheme))
                .unwrap();
            let batch = receiver.receive(1, LONG).unwrap();
            assert_eq!(payloads(&batch), vec!["B"], "scheme {scheme:?}");
            receiver.close();
        }
    }

    #[test]
    fn repeated_timeouts_return_empty_within_bound() {
        let (_broker, client) = setup();
        let receiver = client.add_receiver(GROUP, PARTITION, Position::StreamEnd).unwrap();
        receiver.receive(1, SHORT).unwrap();

        for _ in 0..3 {
            let started = Instant::now();
            let batch = receiver.receive(10, SHORT).unwrap();
            assert!(batch.is_empty());
            assert!(started.elapsed() >= SHORT);
            assert!(started.elapsed() < SHORT + Duration::from_secs(1));
        }
        assert_eq!(receiver.state(), ReceiverState::Open);
    }

    #[test]
    fn small_prefetch_still_delivers_a_large_backlog_in_order() {
        let (broker, client) = setup();
        for i in 0..50 {
            send(&broker, &format!("e{i}"));
        }

        let receiver = client
            .add_receiver_with(
                GROUP,
                PARTITION,
                Position::StreamStart,
                ReceiverOptions::default().with_prefetch(3),
            )
            .unwrap();
        let events = collect(&receiver, 50, 10);

        assert_eq!(events.len(), 50);
        assert!(events.iter().all(|e| e.payload_str().is_some()));
        assert_gapless(&events);
    }

    #[test]
    fn transport_fault_follows_buffered_events_and_receiver_recovers() {
        let (broker, client) = setup();
        let receiver = client.add_receiver(GROUP, PARTITION, Position::StreamEnd).unwrap();
        receiver.receive(1, SHORT).unwrap();

        send(&broker, "A");
        assert_eq!(broker.inject_fault(&partition(), "link reset"), 1);

        assert_eq!(payloads(&receiver.receive(10, LONG).unwrap()), vec!["A"]);
        assert!(matches!(
            receiver.receive(10, LONG),
            Err(ReceiveError::Transport(_))
        ));

        send(&broker, "B");
        assert_eq!(payloads(&receiver.receive(10, LONG).unwrap()), vec!["B"]);
    }

    #[test]
    fn detached_link_reports_link_closed_until_repositioned() {
        let (broker, client) = setup();
        let receiver = client.add_receiver(GROUP, PARTITION, Position::StreamStart).unwrap();
        send(&broker, "A");
        assert_eq!(payloads(&receiver.receive(10, LONG).unwrap()), vec!["A"]);

        assert_eq!(broker.detach_links(&partition()), 1);
        send(&broker, "B");

        let err = receiver.receive(10, LONG).unwrap_err();
        assert!(matches!(err, ReceiveError::LinkClosed { .. }));
        assert!(err.is_terminal());

        receiver.reposition(receiver.resume_position()).unwrap();
        assert_eq!(payloads(&receiver.receive(10, LONG).unwrap()), vec!["B"]);
    }

    #[test]
    fn resume_position_continues_after_last_delivered() {
        let (broker, client) = setup();
        for name in ["A", "B", "C", "D"] {
            send(&broker, name);
        }

        let first = client.add_receiver(GROUP, PARTITION, Position::StreamStart).unwrap();
        assert_eq!(payloads(&first.receive(2, LONG).unwrap()), vec!["A", "B"]);
        let resume = first.resume_position();
        first.close();

        assert_eq!(resume, Position::sequence_number(SequenceNumber::new(1)));

        let second = client.add_receiver(GROUP, PARTITION, resume).unwrap();
        assert_eq!(payloads(&collect(&second, 2, 10)), vec!["C", "D"]);
    }

    #[test]
    fn reposition_discards_the_old_cursor() {
        let (broker, client) = setup();
        for name in ["A", "B", "C"] {
            send(&broker, name);
        }

        let receiver = client.add_receiver(GROUP, PARTITION, Position::StreamStart).unwrap();
        assert_eq!(payloads(&receiver.receive(1, LONG).unwrap()), vec!["A"]);

        receiver
            .reposition(Position::sequence_number(SequenceNumber::new(2)).inclusive())
            .unwrap();
        assert_eq!(payloads(&receiver.receive(10, LONG).unwrap()), vec!["C"]);
        assert_eq!(broker.link_count(), 1);
    }

    #[test]
    fn evicted_inclusive_position_starts_at_oldest_retained_event() {
        let (broker, client) = setup_with(InMemoryBrokerConfig::default().with_retention(2));
        let a = send(&broker, "A");
        send(&broker, "B");
        send(&broker, "C");

        let receiver = client
            .add_receiver(GROUP, PARTITION, Position::offset(a.offset()).inclusive())
            .unwrap();
        assert_eq!(payloads(&collect(&receiver, 2, 10)), vec!["B", "C"]);
    }

    #[test]
    fn slow_open_reports_not_ready() {
        let (broker, _client) =
            setup_with(InMemoryBrokerConfig::default().with_open_delay(Duration::from_millis(400)));
        let client = EventHubClient::with_config(
            broker.clone(),
            ClientConfig::default().with_open_timeout(Duration::from_millis(50)),
        )
        .unwrap();

        let receiver = client.add_receiver(GROUP, PARTITION, Position::StreamEnd).unwrap();
        let err = receiver.receive(10, SHORT).unwrap_err();
        assert!(matches!(err, ReceiveError::NotReady { .. }));
        assert!(err.is_retryable());

        thread::sleep(Duration::from_millis(500));
        assert!(receiver.receive(10, SHORT).unwrap().is_empty());
    }

    #[test]
    fn unknown_partition_fails_the_open() {
        let (_broker, client) = setup_with(InMemoryBrokerConfig::default().with_partition_count(2));
        let receiver = client.add_receiver(GROUP, "7", Position::StreamStart).unwrap();
        assert!(matches!(
            receiver.receive(10, SHORT),
            Err(ReceiveError::Transport(_))
        ));
    }

    #[test]
    fn close_interrupts_a_blocked_receive() {
        let (_broker, client) = setup();
        let receiver = client.add_receiver(GROUP, PARTITION, Position::StreamEnd).unwrap();
        receiver.receive(1, SHORT).unwrap();

        let waiter = {
            let receiver = receiver.clone();
            thread::spawn(move || {
                let started = Instant::now();
                (receiver.receive(10, Duration::from_secs(30)), started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(100));
        receiver.close();

        let (result, elapsed) = waiter.join().unwrap();
        assert!(matches!(result, Err(ReceiveError::Closed)));
        assert!(elapsed < Duration::from_secs(5));
        assert!(matches!(receiver.receive(1, SHORT), Err(ReceiveError::Closed)));
    }

    #[test]
    fn receivers_on_one_partition_are_independent() {
        let (broker, client) = setup();
        for name in ["A", "B"] {
            send(&broker, name);
        }

        let left = client.add_receiver(GROUP, PARTITION, Position::StreamStart).unwrap();
        let right = client.add_receiver("audit", PARTITION, Position::StreamStart).unwrap();

        assert_eq!(payloads(&collect(&left, 2, 10)), vec!["A", "B"]);
        assert_eq!(payloads(&collect(&right, 2, 10)), vec!["A", "B"]);

        client.stop();
        assert_eq!(left.state(), ReceiverState::Closed);
        assert_eq!(right.state(), ReceiverState::Closed);
    }

    #[test]
    fn offsets_are_byte_positions() {
        let (broker, _client) = setup();
        let a = send(&broker, "abc");
        let b = send(&broker, "de");
        assert_eq!(a.offset(), Offset::new(0));
        assert_eq!(b.offset().value(), 3 + crate::broker::RECORD_HEADER_BYTES);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn consecutive_batches_partition_the_log(total in 1usize..40, batch in 1usize..8) {
            let (broker, client) = setup();
            for i in 0..total {
                send(&broker, &format!("e{i}"));
            }

            let receiver = client.add_receiver(GROUP, PARTITION, Position::StreamStart).unwrap();
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut events = Vec::new();
            while events.len() < total && Instant::now() < deadline {
                let got = receiver.receive(batch, SHORT).unwrap();
                prop_assert!(got.len() <= batch);
                events.extend(got);
            }

            prop_assert_eq!(events.len(), total);
            prop_assert_eq!(events[0].sequence_number(), SequenceNumber::new(0));
            for pair in events.windows(2) {
                prop_assert_eq!(
                    pair[1].sequence_number().value(),
                    pair[0].sequence_number().value() + 1
                );
            }
        }
    }
}
