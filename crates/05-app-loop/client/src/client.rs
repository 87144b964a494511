use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use driver_protocol::{Destination, MAX_COMMAND_LENGTH};
use parking_lot::Mutex;
use transport::{AtomicArray, ManyToOneRingBuffer, RegionInit, SharedRegion};
use transport_fabric::{Agent, AgentRunner, RingConsumer, RingProducer};

use crate::config::{
    ClientConfig, ReceiverConfig, SourceConfig, ADMIN_BUFFER_LENGTH,
};
use crate::coordinator::{AdminCoordinator, CoordinatorCounters, CoordinatorParts, CoordinatorStats};
use crate::dispatch::ErrorDispatch;
use crate::endpoint::{Channel, ConsumerChannel, Receiver, Source};
use crate::error::{ClientError, ClientResult};
use crate::proxy::AdminProxy;
use crate::session::SessionAllocator;

enum Mode {
    Threaded(Mutex<AgentRunner>),
    Invoker(Mutex<AdminCoordinator>),
}

/// Entry point for creating sources and receivers against a media driver.
///
/// Each client owns an admin command ring and an admin coordinator, either
/// running on its own thread or driven through [`Client::invoke`].
pub struct Client {
    proxy: AdminProxy,
    sessions: SessionAllocator,
    channels: Arc<AtomicArray<Channel>>,
    receivers: Arc<AtomicArray<ConsumerChannel>>,
    counters: Arc<CoordinatorCounters>,
    closed: Arc<AtomicBool>,
    mode: Mode,
}

impl Client {
    /// Builds the rings and starts the coordinator. Any failure here leaves
    /// nothing running.
    ///
    /// A client takes the single consumer claim on the strategy's to-client
    /// buffer, so one strategy serves one live client at a time. Connecting a
    /// second client to the same buffers fails until the first is dropped.
    pub fn connect(config: ClientConfig) -> ClientResult<Self> {
        config.settings.validate()?;
        let settings = &config.settings;

        let admin_region = SharedRegion::new_aligned(ADMIN_BUFFER_LENGTH, 64, RegionInit::Zeroed)
            .map_err(|err| ClientError::construction("allocating admin buffer", err))?;
        let admin_ring = Arc::new(
            ManyToOneRingBuffer::new(Arc::new(admin_region))
                .map_err(|err| ClientError::construction("initialising admin buffer", err))?,
        );

        let to_driver_region = config
            .buffer_strategy
            .to_driver()
            .map_err(|err| ClientError::construction("mapping to-driver buffer", err))?;
        let to_client_region = config
            .buffer_strategy
            .to_client()
            .map_err(|err| ClientError::construction("mapping to-client buffer", err))?;
        let to_driver = Arc::new(
            ManyToOneRingBuffer::new(to_driver_region)
                .map_err(|err| ClientError::construction("initialising to-driver buffer", err))?,
        );
        let to_client = Arc::new(
            ManyToOneRingBuffer::new(to_client_region)
                .map_err(|err| ClientError::construction("initialising to-client buffer", err))?,
        );

        if to_driver.max_payload_length() < MAX_COMMAND_LENGTH {
            return Err(ClientError::InvalidConfig(
                "to-driver buffer cannot carry the largest admin command",
            ));
        }

        let commands = RingConsumer::new(Arc::clone(&admin_ring))
            .map_err(|err| ClientError::construction("claiming admin buffer", err))?;
        let from_driver = RingConsumer::new(to_client)
            .map_err(|err| ClientError::construction("claiming to-client buffer", err))?;

        let (handoff_tx, handoff_rx) = crossbeam_channel::bounded(settings.handoff_capacity);
        let channels = Arc::new(AtomicArray::new());
        let receivers = Arc::new(AtomicArray::new());
        let counters = Arc::new(CoordinatorCounters::default());
        let closed = Arc::new(AtomicBool::new(false));

        let coordinator = AdminCoordinator::new(CoordinatorParts {
            commands,
            to_driver: RingProducer::new(Arc::clone(&to_driver)),
            from_driver,
            handoff: handoff_rx,
            channels: Arc::clone(&channels),
            receivers: Arc::clone(&receivers),
            dispatch: ErrorDispatch::new(
                config.error_handler.clone(),
                config.invalid_destination_handler.clone(),
            ),
            producer_control: Arc::clone(&config.producer_control),
            counters: Arc::clone(&counters),
            command_budget: settings.command_budget,
            response_budget: settings.response_budget,
        });

        let mode = if settings.use_invoker {
            Mode::Invoker(Mutex::new(coordinator))
        } else {
            let runner = AgentRunner::start(coordinator, settings.idle)
                .map_err(|err| ClientError::construction("starting admin coordinator", err))?;
            Mode::Threaded(Mutex::new(runner))
        };

        let proxy = AdminProxy::new(
            RingProducer::new(admin_ring),
            handoff_tx,
            to_driver,
            settings.offer_attempts,
            Arc::clone(&closed),
        );

        tracing::debug!(invoker = settings.use_invoker, "client connected");
        Ok(Self {
            proxy,
            sessions: SessionAllocator::new(Arc::clone(&channels), settings.session_attempts),
            channels,
            receivers,
            counters,
            closed,
            mode,
        })
    }

    /// Connects one independent client per configuration.
    pub fn connect_many<I>(configs: I) -> ClientResult<Vec<Client>>
    where
        I: IntoIterator<Item = ClientConfig>,
    {
        configs.into_iter().map(Client::connect).collect()
    }

    /// Creates a source. The handle is returned in `Requested` state and
    /// becomes `Active` once the driver confirms it.
    pub fn add_source(&self, config: SourceConfig) -> ClientResult<Source> {
        self.ensure_open()?;
        let session_id =
            self.sessions
                .allocate(&config.destination, config.stream_id, config.session_id)?;
        let channel = Arc::new(Channel::new(
            self.proxy.next_correlation_id(),
            config.destination,
            config.stream_id,
            session_id,
        ));
        self.proxy.add_channel(&channel)?;
        Ok(Source::new(channel, self.proxy.clone()))
    }

    /// Source on stream 0 with a random session id.
    pub fn add_source_to(&self, destination: Destination) -> ClientResult<Source> {
        self.add_source(SourceConfig::new(destination, 0))
    }

    /// Creates several sources. If one fails, those already created by this
    /// call are closed and the error is returned.
    pub fn add_sources<I>(&self, configs: I) -> ClientResult<Vec<Source>>
    where
        I: IntoIterator<Item = SourceConfig>,
    {
        let mut sources = Vec::new();
        for config in configs {
            match self.add_source(config) {
                Ok(source) => sources.push(source),
                Err(err) => {
                    for source in &sources {
                        if let Err(close_err) = source.close() {
                            tracing::warn!(%close_err, "failed to close partial batch source");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(sources)
    }

    pub fn add_receiver(&self, config: ReceiverConfig) -> ClientResult<Receiver> {
        self.ensure_open()?;
        config.validate()?;
        let destination = config
            .destination
            .ok_or(ClientError::InvalidConfig("receiver destination is required"))?;
        let consumer = Arc::new(ConsumerChannel::new(
            self.proxy.next_correlation_id(),
            destination,
            config.streams,
        ));
        self.proxy.add_receiver(&consumer)?;
        Ok(Receiver::new(consumer, self.proxy.clone()))
    }

    /// Creates a receiver from a configuration filled in by `configure`.
    pub fn add_receiver_with<F>(&self, configure: F) -> ClientResult<Receiver>
    where
        F: FnOnce(&mut ReceiverConfig),
    {
        let mut config = ReceiverConfig::default();
        configure(&mut config);
        self.add_receiver(config)
    }

    /// Live source channels; safe to iterate from any thread.
    pub fn channels(&self) -> &AtomicArray<Channel> {
        &self.channels
    }

    /// Live receivers; safe to iterate from any thread.
    pub fn receivers(&self) -> &AtomicArray<ConsumerChannel> {
        &self.receivers
    }

    pub fn coordinator_stats(&self) -> CoordinatorStats {
        self.counters.snapshot()
    }

    /// Runs one coordinator duty cycle. Only valid with `use_invoker`.
    pub fn invoke(&self) -> ClientResult<usize> {
        self.ensure_open()?;
        match &self.mode {
            Mode::Invoker(coordinator) => Ok(coordinator.lock().duty_cycle()),
            Mode::Threaded(_) => Err(ClientError::InvalidConfig(
                "invoke requires use_invoker = true",
            )),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops the coordinator. Idempotent; later endpoint operations fail with
    /// [`ClientError::Closed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.mode {
            Mode::Threaded(runner) => runner.lock().close(),
            Mode::Invoker(coordinator) => coordinator.lock().on_close(),
        }
        tracing::debug!("client closed");
    }

    fn ensure_open(&self) -> ClientResult<()> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}
