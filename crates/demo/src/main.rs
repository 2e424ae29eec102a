//! Walks the receive path end to end against the in-memory broker.
//!
//! Usage: `hubstream-demo [POSITION]`, where POSITION is `@start`, `@latest`,
//! `offset:N`, `seq:N` or `time:RFC3339` (append `+` to include the event at it).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use hubstream_client::{ClientConfig, EventHubClient, EventSender, PartitionReceiver};
use hubstream_core::{PartitionId, Position, PositionScheme};
use hubstream_infra::InMemoryBroker;

const PARTITION: &str = "0";

fn main() -> anyhow::Result<()> {
    hubstream_observability::init();

    let start: Position = match std::env::args().nth(1) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid start position '{raw}'"))?,
        None => Position::StreamEnd,
    };

    let config = ClientConfig::from_env().context("loading client configuration")?;
    let broker = Arc::new(InMemoryBroker::new().context("starting in-memory broker")?);
    let client = EventHubClient::with_config(broker.clone(), config)
        .context("building client")?
        .with_sender(broker.clone());

    let partition = PartitionId::new(PARTITION)?;
    let a = broker.append(&partition, b"A".to_vec())?;
    let b = broker.append(&partition, b"B".to_vec())?;
    info!(offset = %a.offset, "appended A");
    info!(offset = %b.offset, "appended B");

    let receiver = client.add_default_receiver(PARTITION, start)?;
    drain("requested start", &receiver)?;

    let after_b = client.add_default_receiver(PARTITION, Position::offset(b.offset))?;
    drain("after B", &after_b)?;

    broker.append(&partition, b"C".to_vec())?;
    drain("after B, once C exists", &after_b)?;

    let event = after_b
        .last_delivered()
        .context("expected C to have been delivered")?;
    info!(
        sequence_number = %event.sequence_number,
        resume = %after_b.resume_position(),
        "cursor advanced"
    );

    for scheme in [
        PositionScheme::Offset,
        PositionScheme::SequenceNumber,
        PositionScheme::Timestamp,
    ] {
        let b_event = broker
            .events(&partition)
            .into_iter()
            .nth(1)
            .context("B is retained")?;
        let receiver = client.add_default_receiver(PARTITION, Position::after(&b_event, scheme))?;
        let batch = receiver.receive(1, Duration::from_secs(2))?;
        if batch.first().and_then(|e| e.payload_str()) != Some("C") {
            warn!(?scheme, "position scheme disagreed on the next event");
        }
        receiver.close();
    }

    client.stop();
    broker.shutdown();
    info!("done");
    Ok(())
}

fn drain(label: &str, receiver: &PartitionReceiver) -> anyhow::Result<()> {
    let batch = receiver
        .receive_batch(Duration::from_millis(500))
        .with_context(|| format!("receiving {label}"))?;
    let payloads: Vec<&str> = batch.iter().filter_map(|e| e.payload_str()).collect();
    info!(label, count = batch.len(), ?payloads, "received");
    Ok(())
}
