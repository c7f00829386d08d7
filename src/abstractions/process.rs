use std::time::SystemTime;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::abstractions::choice::{EventChoice, EventWeights, Sampler, SeededSampler, TickRate};
use crate::abstractions::clock::LamportClock;
use crate::abstractions::communication::LinkSender;
use crate::abstractions::inbound_queue::{Dequeued, InboundQueue};
use crate::abstractions::logging::EventSink;
use crate::abstractions::{EventKind, EventRecord, MachineId, Message};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineState {
    Running,
    Stopping,
    Stopped,
}

/// Events performed so far, by kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventCounts {
    pub internal: u64,
    pub send: u64,
    pub receive: u64,
    /// Per target, not per tick: one `SendBoth` can fail twice.
    pub delivery_failures: u64,
}

impl EventCounts {
    fn count(&mut self, kind: &EventKind) {
        match kind {
            EventKind::Internal => self.internal += 1,
            EventKind::Send { .. } => self.send += 1,
            EventKind::Receive { .. } => self.receive += 1,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.internal + self.send + self.receive
    }
}

/// Final state of a machine, returned once it has stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MachineReport {
    pub id: MachineId,
    pub rate: TickRate,
    pub final_clock: u64,
    pub counts: EventCounts,
    /// Messages still queued at shutdown; dropped, not processed.
    pub discarded_backlog: usize,
}

/// One simulated process: a Lamport clock, an inbound queue and a fixed
/// tick rate. Each tick performs exactly one event.
pub struct Machine<L, S> {
    id: MachineId,
    rate: TickRate,
    clock: LamportClock,
    inbound: InboundQueue,
    peers: Vec<MachineId>,
    link: L,
    sink: S,
    sampler: Box<dyn Sampler>,
    weights: EventWeights,
    state: MachineState,
    counts: EventCounts,
}

impl<L, S> Machine<L, S>
where
    L: LinkSender,
    S: EventSink,
{
    pub fn new(id: MachineId, rate: TickRate, link: L, sink: S) -> Self {
        Self {
            id,
            rate,
            clock: LamportClock::new(),
            inbound: InboundQueue::new(),
            peers: Vec::new(),
            link,
            sink,
            sampler: Box::new(SeededSampler::from_entropy()),
            weights: EventWeights::default(),
            state: MachineState::Running,
            counts: EventCounts::default(),
        }
    }

    pub fn with_inbound(mut self, inbound: InboundQueue) -> Self {
        self.inbound = inbound;
        self
    }

    /// Peer order matters: the first entry is "first peer", the second is
    /// "second peer".
    pub fn with_peers(mut self, peers: Vec<MachineId>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_sampler(mut self, sampler: Box<dyn Sampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_weights(mut self, weights: EventWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_clock(mut self, clock: LamportClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn id(&self) -> MachineId {
        self.id
    }

    pub fn rate(&self) -> TickRate {
        self.rate
    }

    pub fn clock(&self) -> u64 {
        self.clock.value()
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn inbound(&self) -> &InboundQueue {
        &self.inbound
    }

    pub fn counts(&self) -> EventCounts {
        self.counts
    }

    /// Performs one event. Returns `None` once the machine has left
    /// `Running`.
    pub fn tick(&mut self) -> Option<EventRecord> {
        if self.state != MachineState::Running {
            return None;
        }

        let kind = match self.inbound.try_dequeue_counted() {
            Some(dequeued) => self.receive(dequeued),
            None => match self.sampler.sample_event(&self.weights) {
                EventChoice::Internal => {
                    self.clock.advance();
                    EventKind::Internal
                }
                choice => self.send(choice),
            },
        };

        let record = EventRecord {
            machine_id: self.id,
            timestamp: SystemTime::now(),
            kind,
            logical_clock: self.clock.value(),
        };
        self.counts.count(&record.kind);
        debug!(
            machine = self.id,
            clock = record.logical_clock,
            event = %record.kind,
            "tick"
        );
        self.sink.record(record.clone());
        Some(record)
    }

    fn receive(&mut self, dequeued: Dequeued) -> EventKind {
        let Dequeued { message, backlog } = dequeued;
        self.clock.observe(message.clock);
        EventKind::Receive {
            from: message.sender,
            sender_clock: message.clock,
            queue_length: backlog,
        }
    }

    /// Advances once, then delivers the same message to every target.
    fn send(&mut self, choice: EventChoice) -> EventKind {
        let targets = self.targets(choice);
        let message = Message {
            sender: self.id,
            clock: self.clock.advance(),
        };
        for &to in &targets {
            if let Err(err) = self.link.send(to, message) {
                self.counts.delivery_failures += 1;
                warn!(machine = self.id, peer = to, %err, "message dropped");
            }
        }
        EventKind::Send { targets }
    }

    /// With a single peer, "second" falls back to it. "Both" means every
    /// peer.
    fn targets(&self, choice: EventChoice) -> Vec<MachineId> {
        match choice {
            EventChoice::SendFirst => self.peers.first().copied().into_iter().collect(),
            EventChoice::SendSecond => self
                .peers
                .get(1)
                .or(self.peers.first())
                .copied()
                .into_iter()
                .collect(),
            EventChoice::SendBoth => self.peers.clone(),
            EventChoice::Internal => Vec::new(),
        }
    }

    /// Leaves `Running`, closes the inbound queue and drops its backlog.
    pub fn stop(&mut self) -> MachineReport {
        self.state = MachineState::Stopping;
        let discarded_backlog = self.inbound.close();
        self.state = MachineState::Stopped;
        info!(
            machine = self.id,
            clock = self.clock.value(),
            ticks = self.counts.ticks(),
            discarded_backlog,
            "machine stopped"
        );
        MachineReport {
            id: self.id,
            rate: self.rate,
            final_clock: self.clock.value(),
            counts: self.counts,
            discarded_backlog,
        }
    }

    /// Ticks once per tick interval until the token is cancelled. The token
    /// is checked before every tick, so shutdown is seen within one interval.
    pub async fn run_until_cancelled(mut self, cancel_token: CancellationToken) -> MachineReport {
        info!(
            machine = self.id,
            rate = self.rate.per_second(),
            peers = ?self.peers,
            "machine running"
        );
        let mut ticker = time::interval(self.rate.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => {
                    break;
                }
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
        self.stop()
    }
}

pub trait Runnable {
    type Output;
    fn run(self, cancel_token: CancellationToken) -> JoinHandle<Self::Output>;
}

impl<L, S> Runnable for Machine<L, S>
where
    L: LinkSender,
    S: EventSink,
{
    type Output = MachineReport;

    fn run(self, cancel_token: CancellationToken) -> JoinHandle<MachineReport> {
        tokio::spawn(self.run_until_cancelled(cancel_token))
    }
}

/// Hands out machine ids in order.
pub struct IdGenerator {
    next: MachineId,
}

impl IdGenerator {
    pub fn starting_at(first: MachineId) -> Self {
        Self { next: first }
    }

    pub fn next_id(&mut self) -> MachineId {
        let id = self.next;
        self.next += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstractions::choice::ScriptedSampler;
    use crate::abstractions::communication::LocalLinkFactory;
    use crate::abstractions::logging::MemorySink;
    use crate::error::DeliveryError;
    use proptest::prelude::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Link that remembers what it was asked to deliver.
    #[derive(Default)]
    struct CapturingLink {
        sent: Mutex<Vec<(MachineId, Message)>>,
    }

    impl LinkSender for CapturingLink {
        fn send(&self, to: MachineId, message: Message) -> Result<(), DeliveryError> {
            self.sent.lock().unwrap().push((to, message));
            Ok(())
        }
    }

    struct DownLink;

    impl LinkSender for DownLink {
        fn send(&self, to: MachineId, _message: Message) -> Result<(), DeliveryError> {
            Err(DeliveryError::NotConnected(to))
        }
    }

    fn rate(per_second: u32) -> TickRate {
        TickRate::new(per_second).unwrap()
    }

    fn scripted(choices: Vec<EventChoice>) -> Box<dyn Sampler> {
        Box::new(ScriptedSampler::new(choices))
    }

    #[test]
    fn always_internal_for_ten_ticks_reaches_ten() {
        let sink = MemorySink::new();
        let mut machine = Machine::new(1, rate(1), CapturingLink::default(), sink.clone())
            .with_peers(vec![2, 3])
            .with_weights(EventWeights::internal_only())
            .with_sampler(Box::new(SeededSampler::new(3)));

        for _ in 0..10 {
            machine.tick().unwrap();
        }

        assert_eq!(machine.clock(), 10);
        let records = sink.records();
        assert_eq!(records.len(), 10);
        assert!(records.iter().all(|r| r.kind == EventKind::Internal));
        assert_eq!(machine.counts().send + machine.counts().receive, 0);
    }

    #[test]
    fn receive_takes_priority_and_observes_sender_clock() {
        let mut factory = LocalLinkFactory::new();
        let inbound_a = factory.new_inbound_queue(1);
        let inbound_b = factory.new_inbound_queue(2);
        let links = factory.into_links();

        let mut a = Machine::new(1, rate(1), links.sender(), MemorySink::new())
            .with_inbound(inbound_a)
            .with_peers(vec![2])
            .with_clock(LamportClock::starting_at(2))
            .with_sampler(scripted(vec![EventChoice::SendFirst]));
        let sink_b = MemorySink::new();
        let mut b = Machine::new(2, rate(1), links.sender(), sink_b.clone())
            .with_inbound(inbound_b)
            .with_peers(vec![1])
            .with_clock(LamportClock::starting_at(1))
            .with_sampler(scripted(vec![EventChoice::SendFirst]));

        let sent = a.tick().unwrap();
        assert_eq!(sent.kind, EventKind::Send { targets: vec![2] });
        assert_eq!(sent.logical_clock, 3);

        let received = b.tick().unwrap();
        assert_eq!(
            received.kind,
            EventKind::Receive {
                from: 1,
                sender_clock: 3,
                queue_length: 1
            }
        );
        assert_eq!(received.logical_clock, 4);
        assert_eq!(sink_b.records().len(), 1);
        assert!(b.inbound().is_empty());
    }

    #[test]
    fn backlog_drains_one_message_per_tick() {
        let sink = MemorySink::new();
        let mut machine = Machine::new(1, rate(1), CapturingLink::default(), sink.clone())
            .with_peers(vec![2]);
        let k = 5;
        for clock in 1..=k {
            machine
                .inbound()
                .enqueue(Message { sender: 2, clock })
                .unwrap();
        }

        for _ in 0..k {
            machine.tick().unwrap();
        }

        assert!(machine.inbound().is_empty());
        let lengths: Vec<usize> = sink
            .records()
            .iter()
            .filter_map(|r| r.kind.queue_length())
            .collect();
        assert_eq!(lengths, vec![5, 4, 3, 2, 1]);
        assert_eq!(machine.counts().receive, k);
    }

    #[test]
    fn send_both_advances_once_and_delivers_to_every_peer() {
        let link = CapturingLink::default();
        let mut machine = Machine::new(1, rate(1), link, MemorySink::new())
            .with_peers(vec![2, 3])
            .with_sampler(scripted(vec![EventChoice::SendBoth]));

        let record = machine.tick().unwrap();

        assert_eq!(record.logical_clock, 1);
        assert_eq!(record.kind, EventKind::Send { targets: vec![2, 3] });
        let sent = machine.link.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                (2, Message { sender: 1, clock: 1 }),
                (3, Message { sender: 1, clock: 1 })
            ]
        );
    }

    #[test]
    fn send_second_with_one_peer_uses_that_peer() {
        let mut machine = Machine::new(1, rate(1), CapturingLink::default(), MemorySink::new())
            .with_peers(vec![4])
            .with_sampler(scripted(vec![EventChoice::SendSecond]));

        let record = machine.tick().unwrap();
        assert_eq!(record.kind, EventKind::Send { targets: vec![4] });
    }

    #[test]
    fn delivery_failure_is_counted_and_clock_still_advances() {
        let mut machine = Machine::new(1, rate(1), DownLink, MemorySink::new())
            .with_peers(vec![2, 3])
            .with_sampler(scripted(vec![EventChoice::SendBoth, EventChoice::Internal]));

        assert_eq!(machine.tick().unwrap().logical_clock, 1);
        assert_eq!(machine.tick().unwrap().logical_clock, 2);
        assert_eq!(machine.counts().delivery_failures, 2);
        assert_eq!(machine.state(), MachineState::Running);
    }

    #[test]
    fn stopped_machine_rejects_messages_and_ticks() {
        let mut machine = Machine::new(2, rate(1), CapturingLink::default(), MemorySink::new());
        machine
            .inbound()
            .enqueue(Message { sender: 1, clock: 9 })
            .unwrap();

        let report = machine.stop();

        assert_eq!(machine.state(), MachineState::Stopped);
        assert_eq!(report.discarded_backlog, 1);
        assert!(machine.tick().is_none());
        assert!(machine
            .inbound()
            .enqueue(Message { sender: 1, clock: 10 })
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn run_ticks_at_its_rate_until_cancelled() {
        let sink = MemorySink::new();
        let machine = Machine::new(1, rate(4), CapturingLink::default(), sink.clone())
            .with_weights(EventWeights::internal_only());
        let cancel_token = CancellationToken::new();
        let handle = machine.run(cancel_token.clone());

        time::sleep(Duration::from_millis(1_100)).await;
        cancel_token.cancel();
        let report = handle.await.unwrap();

        // Ticks at 0, 250, 500, 750 and 1000 ms.
        assert_eq!(report.counts.internal, 5);
        assert_eq!(report.final_clock, 5);
        assert_eq!(sink.records().len(), 5);
    }

    #[test]
    fn id_generator_counts_up() {
        let mut ids = IdGenerator::starting_at(1);
        assert_eq!((ids.next_id(), ids.next_id(), ids.next_id()), (1, 2, 3));
    }

    fn choice() -> impl Strategy<Value = EventChoice> {
        prop_oneof![
            Just(EventChoice::Internal),
            Just(EventChoice::SendFirst),
            Just(EventChoice::SendSecond),
            Just(EventChoice::SendBoth),
        ]
    }

    /// Each step either delivers a message with the given clock before the
    /// tick, or not.
    fn replay(steps: &[(Option<u64>, EventChoice)]) -> (Vec<(EventKind, u64)>, u64) {
        let sink = MemorySink::new();
        let choices = steps.iter().map(|(_, choice)| *choice).collect();
        let mut machine = Machine::new(1, rate(1), CapturingLink::default(), sink.clone())
            .with_peers(vec![2, 3])
            .with_sampler(scripted(choices));
        for (arrival, _) in steps {
            if let Some(clock) = arrival {
                machine
                    .inbound()
                    .enqueue(Message { sender: 2, clock: *clock })
                    .unwrap();
            }
            machine.tick().unwrap();
        }
        let records = sink
            .records()
            .into_iter()
            .map(|r| (r.kind, r.logical_clock))
            .collect();
        (records, machine.clock())
    }

    proptest! {
        #[test]
        fn same_inputs_replay_identically(
            steps in proptest::collection::vec((proptest::option::of(0u64..100), choice()), 1..40)
        ) {
            prop_assert_eq!(replay(&steps), replay(&steps));
        }

        #[test]
        fn clock_is_monotone_and_receives_pass_sender(
            steps in proptest::collection::vec((proptest::option::of(0u64..100), choice()), 1..40)
        ) {
            let (records, _) = replay(&steps);
            let mut last = 0;
            for (kind, clock) in records {
                prop_assert!(clock > last);
                if let EventKind::Receive { sender_clock, .. } = kind {
                    prop_assert!(clock > sender_clock);
                }
                last = clock;
            }
        }
    }
}
