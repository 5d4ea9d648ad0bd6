//! Per-channel machine binding

use super::{FsmError, Machine, Requests, Status};
use crate::tunnel::{Channel, ChannelId, Channels};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, Span};

/// Binds one channel to at most one live request machine
pub struct ChannelMachine {
    channel: Arc<Channel>,
    requests: Arc<Requests>,
    span: Span,
    current: Option<Box<dyn Machine>>,
}

impl ChannelMachine {
    pub fn new(channel: Arc<Channel>, requests: Arc<Requests>, span: Span) -> Self {
        Self {
            channel,
            requests,
            span,
            current: None,
        }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// No request is in progress
    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    /// Advance the channel by one dispatched frame.
    ///
    /// The channel is finalized whatever the outcome, so the dispatch gate
    /// always comes back. A finished or failed request leaves the channel
    /// idle for the next one.
    pub async fn tick(&mut self) -> Result<Status, FsmError> {
        let advanced = self.advance().await;
        let finalized = self.channel.done().await;

        if !matches!(advanced, Ok(Status::Running)) {
            self.current = None;
        }

        let status = advanced?;
        finalized?;
        Ok(status)
    }

    async fn advance(&mut self) -> Result<Status, FsmError> {
        if self.current.is_none() {
            let mut kind = [0u8; 1];
            self.channel.read_exact(&mut kind).await?;

            let request = self
                .requests
                .get(kind[0])
                .ok_or(FsmError::UnknownRequest(kind[0]))?;

            debug!(parent: &self.span, channel = self.channel.id(), request = kind[0], "Request started");
            self.current = Some(request.new_machine(self.channel.clone(), self.span.clone()));
        }

        match self.current.as_mut() {
            Some(machine) => machine.tick().await,
            None => Ok(Status::Finished),
        }
    }
}

/// A channel machine shared between the routing loop and tick jobs
pub type SharedMachine = Arc<AsyncMutex<ChannelMachine>>;

/// Fixed slot table of channel machines, indexed by channel ID
pub struct MachineTable {
    slots: Vec<Option<SharedMachine>>,
}

impl MachineTable {
    pub fn new(max_channels: usize) -> Self {
        Self {
            slots: vec![None; max_channels],
        }
    }

    /// Put `machine` in the slot of its channel
    pub fn insert(&mut self, machine: ChannelMachine) -> SharedMachine {
        let id = machine.channel.id() as usize;
        if id >= self.slots.len() {
            self.slots.resize(id + 1, None);
        }

        let machine = Arc::new(AsyncMutex::new(machine));
        self.slots[id] = Some(machine.clone());
        machine
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Channels for MachineTable {
    type Machine = SharedMachine;

    fn get(&self, id: ChannelId) -> Option<SharedMachine> {
        self.slots.get(id as usize).and_then(Clone::clone)
    }
}
