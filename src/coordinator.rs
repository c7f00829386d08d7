use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::abstractions::choice::{Sampler, SeededSampler};
use crate::abstractions::communication::tcp_links::TcpLinks;
use crate::abstractions::communication::LocalLinkFactory;
use crate::abstractions::inbound_queue::InboundQueue;
use crate::abstractions::logging::EventSink;
use crate::abstractions::process::{IdGenerator, Machine, MachineReport, Runnable};
use crate::abstractions::MachineId;
use crate::config::{NodeConfig, SimulationConfig};
use crate::error::{ProcessError, SimulationError};

pub type SamplerFactory = Box<dyn FnMut(MachineId) -> Box<dyn Sampler> + Send>;

#[derive(Clone, Debug)]
pub struct SimulationReport {
    pub run_id: Uuid,
    pub trial: u32,
    /// Ordered by machine id.
    pub machines: Vec<MachineReport>,
}

impl SimulationReport {
    pub fn machine(&self, id: MachineId) -> Option<&MachineReport> {
        self.machines.iter().find(|report| report.id == id)
    }
}

/// Owns every machine of one trial and the link table between them.
pub struct Coordinator<S> {
    config: SimulationConfig,
    sink: S,
    sampler_factory: SamplerFactory,
}

impl<S> Coordinator<S>
where
    S: EventSink + Clone,
{
    /// Fails before anything is created if the configuration is invalid.
    pub fn new(config: SimulationConfig, sink: S) -> Result<Self, SimulationError> {
        config.validate()?;
        let seed = config.seed;
        Ok(Self {
            config,
            sink,
            sampler_factory: Box::new(move |id| default_sampler(seed, id)),
        })
    }

    pub fn with_sampler_factory(mut self, sampler_factory: SamplerFactory) -> Self {
        self.sampler_factory = sampler_factory;
        self
    }

    /// Runs every machine for the configured duration, or until
    /// `cancel_token` fires, then waits for all of them to stop.
    pub async fn run(
        mut self,
        cancel_token: CancellationToken,
    ) -> Result<SimulationReport, SimulationError> {
        let run_id = Uuid::now_v1(&rand::random());
        info!(%run_id, trial = self.config.trial, machines = self.config.machines, "starting trial");

        let mut ids = IdGenerator::starting_at(1);
        let mut link_factory = LocalLinkFactory::new();
        let inbound: Vec<(MachineId, InboundQueue)> = (0..self.config.machines)
            .map(|_| {
                let id = ids.next_id();
                (id, link_factory.new_inbound_queue(id))
            })
            .collect();
        // Every queue exists before any sender is handed out.
        let links = link_factory.into_links();

        let machines: Vec<_> = inbound
            .into_iter()
            .map(|(id, inbound)| {
                let mut sampler = (self.sampler_factory)(id);
                let rate = sampler.sample_rate(&self.config.rates);
                Machine::new(id, rate, links.sender(), self.sink.clone())
                    .with_inbound(inbound)
                    .with_peers(links.peers_of(id))
                    .with_sampler(sampler)
                    .with_weights(self.config.weights)
            })
            .collect();

        let machine_token = cancel_token.child_token();
        let handles: Vec<(MachineId, JoinHandle<MachineReport>)> = machines
            .into_iter()
            .map(|machine| (machine.id(), machine.run(machine_token.clone())))
            .collect();

        wait_for_shutdown(self.config.duration, &cancel_token).await;
        machine_token.cancel();

        let mut reports = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            let report = handle.await.map_err(|err| {
                error!(machine = id, %err, "machine task failed");
                ProcessError::Crash(id)
            })?;
            reports.push(report);
        }
        info!(%run_id, trial = self.config.trial, "trial finished");

        Ok(SimulationReport {
            run_id,
            trial: self.config.trial,
            machines: reports,
        })
    }
}

fn default_sampler(seed: Option<u64>, id: MachineId) -> Box<dyn Sampler> {
    match seed {
        Some(seed) => Box::new(SeededSampler::for_machine(seed, id)),
        None => Box::new(SeededSampler::from_entropy()),
    }
}

async fn wait_for_shutdown(duration: Option<Duration>, cancel_token: &CancellationToken) {
    match duration {
        Some(duration) => {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = cancel_token.cancelled() => {}
            }
        }
        None => cancel_token.cancelled().await,
    }
}

/// Runs one machine in this process, linked to its peers over TCP.
///
/// The machine only starts ticking once every peer connection is up.
pub async fn run_node<S>(
    config: NodeConfig,
    sink: S,
    cancel_token: CancellationToken,
) -> Result<MachineReport, SimulationError>
where
    S: EventSink,
{
    config.validate()?;

    let links = TcpLinks::new(config.id);
    let inbound = InboundQueue::new();
    let transport_token = cancel_token.child_token();
    let (local_addr, listener) = links
        .listen(config.listen, inbound.clone(), transport_token.clone())
        .await?;
    info!(machine = config.id, %local_addr, peers = config.peers.len(), "waiting for peers");

    if let Err(err) = links
        .connect_all(&config.peers, config.connect_retry, cancel_token.clone())
        .await
    {
        transport_token.cancel();
        return Err(err.into());
    }

    let mut sampler = default_sampler(config.seed, config.id);
    let rate = sampler.sample_rate(&config.rates);
    let machine = Machine::new(config.id, rate, links, sink)
        .with_inbound(inbound)
        .with_peers(config.peers.keys().copied().collect())
        .with_sampler(sampler)
        .with_weights(config.weights);

    let machine_token = cancel_token.child_token();
    let handle = machine.run(machine_token.clone());
    wait_for_shutdown(config.duration, &cancel_token).await;
    machine_token.cancel();

    let report = handle.await.map_err(|err| {
        error!(machine = config.id, %err, "machine task failed");
        ProcessError::Crash(config.id)
    })?;
    transport_token.cancel();
    let _ = listener.await;
    Ok(report)
}
