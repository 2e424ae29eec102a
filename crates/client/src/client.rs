//! Client: hands out partition receivers over one shared transport.

use std::sync::{Arc, Mutex, Weak};

use tracing::info;

use hubstream_core::{ConsumerGroup, PartitionId, Position, ReceiveError, ReceiveResult};

use crate::config::{ClientConfig, ConfigError, ReceiverOptions, ResolvedOptions};
use crate::receiver::{PartitionReceiver, ReceiverShared};
use crate::transport::{EventSender, PartitionClient};

/// Entry point for consuming a stream.
///
/// The transport (and its background driver) is shared by every receiver
/// created here; receivers are logical handles multiplexed over it.
pub struct EventHubClient {
    config: ClientConfig,
    transport: Arc<dyn PartitionClient>,
    sender: Option<Arc<dyn EventSender>>,
    receivers: Mutex<Vec<Weak<ReceiverShared>>>,
}

impl core::fmt::Debug for EventHubClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventHubClient")
            .field("config", &self.config)
            .field("has_sender", &self.sender.is_some())
            .finish_non_exhaustive()
    }
}

impl EventHubClient {
    /// Create a client with default configuration.
    pub fn new(transport: Arc<dyn PartitionClient>) -> Self {
        Self {
            config: ClientConfig::default(),
            transport,
            sender: None,
            receivers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_config(
        transport: Arc<dyn PartitionClient>,
        config: ClientConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::new(transport)
        })
    }

    /// Create a client configured from `HUBSTREAM_*` environment variables.
    pub fn from_env(transport: Arc<dyn PartitionClient>) -> Result<Self, ConfigError> {
        Self::with_config(transport, ClientConfig::from_env()?)
    }

    /// Attach the producer side, for callers that also append.
    pub fn with_sender(mut self, sender: Arc<dyn EventSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn sender(&self) -> Option<Arc<dyn EventSender>> {
        self.sender.clone()
    }

    /// Create a receiver on `(group, partition)` starting at `position` and
    /// begin opening its link in the background.
    pub fn add_receiver(
        &self,
        group: &str,
        partition: &str,
        position: Position,
    ) -> ReceiveResult<PartitionReceiver> {
        self.add_receiver_with(group, partition, position, ReceiverOptions::default())
    }

    /// Like [`Self::add_receiver`], in the client's default consumer group.
    pub fn add_default_receiver(
        &self,
        partition: &str,
        position: Position,
    ) -> ReceiveResult<PartitionReceiver> {
        let group = self.config.consumer_group.clone();
        self.add_receiver(group.as_str(), partition, position)
    }

    pub fn add_receiver_with(
        &self,
        group: &str,
        partition: &str,
        position: Position,
        options: ReceiverOptions,
    ) -> ReceiveResult<PartitionReceiver> {
        let group = ConsumerGroup::new(group)?;
        let partition = PartitionId::new(partition)?;
        let options = ResolvedOptions::merge(&self.config, &options)
            .map_err(|e| ReceiveError::invalid_argument(e.to_string()))?;

        let receiver = PartitionReceiver::new(
            Arc::clone(&self.transport),
            group,
            partition,
            position,
            options,
        )?;
        receiver.open()?;

        if let Ok(mut receivers) = self.receivers.lock() {
            receivers.retain(|r| r.strong_count() > 0);
            receivers.push(Arc::downgrade(receiver.shared()));
        }

        info!(
            group = %receiver.consumer_group(),
            partition = %receiver.partition(),
            %position,
            "receiver added"
        );
        Ok(receiver)
    }

    /// Receivers created by this client that are still alive and not closed.
    pub fn receivers(&self) -> Vec<PartitionReceiver> {
        let Ok(receivers) = self.receivers.lock() else {
            return Vec::new();
        };
        receivers
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|shared| !shared.is_closed())
            .map(PartitionReceiver::from_shared)
            .collect()
    }

    /// Close every receiver handed out by this client.
    pub fn stop(&self) {
        let receivers = self.receivers();
        let count = receivers.len();
        for receiver in receivers {
            receiver.close();
        }
        if let Ok(mut all) = self.receivers.lock() {
            all.clear();
        }
        info!(closed = count, "client stopped");
    }
}
