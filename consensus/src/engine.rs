//! The consensus state machine.
//!
//! One engine instance drives one validator. All inputs (inbound message
//! bytes, timer fires, height starts) arrive as [`ConsensusEvent`]s on a
//! single queue and are processed to completion one at a time, so round
//! state never sees interleaved partial updates. Outputs are fire-and-forget
//! sends through the [`NetworkAdapter`] and finalized blocks on a channel.

use crate::config::ConsensusConfig;
use crate::context::{RecordOutcome, RejectReason, RoundContext};
use crate::payload::{tx_root, ConsensusPayload, Envelope, MessageKind, RecoveryPayload};
use crate::recovery;
use crate::timer::{RoundTimer, TimerEpoch};
use crate::traits::{ExecutionEngine, HeaderSummary, LedgerStore, NetworkAdapter};
use crate::validators::ValidatorSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use talos_common::{
    Block, BlockHeader, ExecutionError, Hash, Height, SigningKeyPair, TalosError, TalosResult,
    ValidatorIndex, View,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Where the engine is within the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initial,
    AwaitingProposal,
    AwaitingAcknowledgment,
    AwaitingCommitment,
    Locked,
    Finalized,
    /// Persistence failed after retries; block production for this height
    /// stops pending operator intervention.
    Halted,
}

/// Inputs driving the state machine.
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    HeightStart(Height),
    Inbound {
        sender: ValidatorIndex,
        bytes: Vec<u8>,
    },
    TimerFired(TimerEpoch),
    Shutdown,
}

/// Cloneable handle feeding events into a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    events: mpsc::Sender<ConsensusEvent>,
}

impl EngineHandle {
    pub async fn on_height_start(&self, height: Height) {
        let _ = self.events.send(ConsensusEvent::HeightStart(height)).await;
    }

    pub async fn on_message(&self, sender: ValidatorIndex, bytes: Vec<u8>) {
        let _ = self
            .events
            .send(ConsensusEvent::Inbound { sender, bytes })
            .await;
    }

    pub async fn on_timer_fired(&self, epoch: TimerEpoch) {
        let _ = self.events.send(ConsensusEvent::TimerFired(epoch)).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.events.send(ConsensusEvent::Shutdown).await;
    }
}

/// dBFT state machine for one validator.
pub struct ConsensusEngine {
    config: ConsensusConfig,
    keypair: SigningKeyPair,
    execution: Arc<dyn ExecutionEngine>,
    ledger: Arc<dyn LedgerStore>,
    network: Arc<dyn NetworkAdapter>,
    events_rx: Option<mpsc::Receiver<ConsensusEvent>>,
    finalized_tx: mpsc::Sender<Block>,
    timer: RoundTimer,
    context: RoundContext,
    /// Our index in the current height's validator set; `None` means we are
    /// observing this height without voting rights.
    my_index: Option<ValidatorIndex>,
    phase: Phase,
    /// Parent header for the current height, cached at height start.
    parent: HeaderSummary,
    /// Timer fires seen at the current view; escalates the re-arm timeout.
    timeout_attempts: u32,
}

impl ConsensusEngine {
    /// Build an engine positioned at the height after the ledger head.
    ///
    /// Fails only on structural configuration problems: an invalid
    /// validator set or a missing parent header.
    pub async fn new(
        config: ConsensusConfig,
        keypair: SigningKeyPair,
        execution: Arc<dyn ExecutionEngine>,
        ledger: Arc<dyn LedgerStore>,
        network: Arc<dyn NetworkAdapter>,
    ) -> TalosResult<(Self, EngineHandle, mpsc::Receiver<Block>)> {
        config.validate()?;
        let height = ledger.current_height().await + 1;
        let validators = ValidatorSet::new(ledger.validator_set(height).await)?;
        let parent = ledger
            .block_header(height - 1)
            .await
            .ok_or_else(|| TalosError::Config(format!("missing parent header for height {height}")))?;
        let my_index = validators.index_of(&keypair.public_key_bytes());
        if my_index.is_none() {
            warn!(height, "local key is not in the validator set; observing only");
        }

        let (events_tx, events_rx) = mpsc::channel(config.event_queue_depth);
        let (finalized_tx, finalized_rx) = mpsc::channel(16);
        let handle = EngineHandle {
            events: events_tx.clone(),
        };
        let engine = Self {
            config,
            keypair,
            execution,
            ledger,
            network,
            events_rx: Some(events_rx),
            finalized_tx,
            timer: RoundTimer::new(events_tx),
            context: RoundContext::new(height, Arc::new(validators)),
            my_index,
            phase: Phase::Initial,
            parent,
            timeout_attempts: 0,
        };
        Ok((engine, handle, finalized_rx))
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn height(&self) -> Height {
        self.context.height()
    }

    pub fn view(&self) -> View {
        self.context.view()
    }

    pub fn context(&self) -> &RoundContext {
        &self.context
    }

    /// Epoch of the armed round timer, if any. Lets an embedder inject a
    /// timeout without waiting for wall-clock time.
    pub fn timer_epoch(&self) -> Option<TimerEpoch> {
        self.timer.current()
    }

    /// Consume events until shutdown, starting with the current height.
    pub async fn run(mut self) {
        let Some(mut events) = self.events_rx.take() else {
            return;
        };
        let height = self.context.height();
        self.handle_event(ConsensusEvent::HeightStart(height)).await;
        while let Some(event) = events.recv().await {
            if matches!(event, ConsensusEvent::Shutdown) {
                break;
            }
            self.handle_event(event).await;
        }
        self.timer.disarm();
        debug!("consensus engine stopped");
    }

    /// Process one event to completion. Exposed so embedders and tests can
    /// drive the machine deterministically without the queue.
    pub async fn handle_event(&mut self, event: ConsensusEvent) {
        match event {
            ConsensusEvent::HeightStart(height) => self.handle_height_start(height).await,
            ConsensusEvent::Inbound { sender, bytes } => {
                self.handle_inbound(sender, &bytes).await
            }
            ConsensusEvent::TimerFired(epoch) => self.handle_timer(epoch).await,
            ConsensusEvent::Shutdown => {}
        }
    }

    async fn handle_height_start(&mut self, height: Height) {
        if height < self.context.height()
            || (height == self.context.height() && self.phase == Phase::Finalized)
        {
            debug!(height, current = self.context.height(), "ignoring stale height start");
            return;
        }
        let keys = self.ledger.validator_set(height).await;
        let validators = match ValidatorSet::new(keys) {
            Ok(set) => set,
            Err(e) => {
                error!(height, error = %e, "invalid validator set; halting");
                self.phase = Phase::Halted;
                self.timer.disarm();
                return;
            }
        };
        let Some(parent) = self.ledger.block_header(height - 1).await else {
            error!(height, "missing parent header; halting");
            self.phase = Phase::Halted;
            self.timer.disarm();
            return;
        };
        self.my_index = validators.index_of(&self.keypair.public_key_bytes());
        self.parent = parent;
        self.context = RoundContext::new(height, Arc::new(validators));
        self.phase = Phase::Initial;
        self.timeout_attempts = 0;
        info!(height, "height started");
        self.start_view().await;
    }

    /// Begin the current (height, view): arm the round timer and, if we are
    /// the primary, construct and broadcast a proposal.
    async fn start_view(&mut self) {
        let height = self.context.height();
        let view = self.context.view();
        self.timer
            .arm(height, view, self.config.view_timeout(view));

        let primary = self.context.primary();
        if self.my_index != Some(primary) {
            self.phase = Phase::AwaitingProposal;
            debug!(height, view, primary, "awaiting proposal");
            return;
        }

        let parent = self.parent;
        let tx_hashes = match with_timeout(
            self.config.execution_timeout(),
            self.execution.propose_transaction_set(&parent),
        )
        .await
        {
            Ok(txs) => txs,
            Err(e) => {
                warn!(height, view, error = %e, "could not assemble a proposal");
                self.phase = Phase::AwaitingProposal;
                return;
            }
        };
        let payload = ConsensusPayload::Proposal {
            prev_hash: parent.hash,
            timestamp_ms: now_ms(),
            tx_hashes,
        };
        let envelope = Envelope::signed(height, view, payload, primary, &self.keypair);
        // recording the accepted proposal also registers our implicit
        // acknowledgment as primary
        if self.context.record_message(envelope.clone()) != RecordOutcome::Recorded {
            warn!(height, view, "own proposal was not accepted locally");
            return;
        }
        info!(height, view, hash = ?self.context.current_proposal_hash(), "proposing block");
        self.network.broadcast(envelope.encode()).await;
        self.phase = Phase::AwaitingAcknowledgment;
    }

    async fn handle_inbound(&mut self, sender: ValidatorIndex, bytes: &[u8]) {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(sender, error = %e, "dropping undecodable message");
                return;
            }
        };
        // height gate first: we cannot resolve signing keys for another
        // height's validator set, and stale traffic carries no information
        if envelope.height != self.context.height() {
            debug!(
                sender,
                height = envelope.height,
                current = self.context.height(),
                "dropping message for another height"
            );
            return;
        }
        if let Err(e) = envelope.verify(self.context.validators()) {
            warn!(sender, signer = envelope.signer, error = %e, "dropping unverifiable message");
            return;
        }
        if self.phase == Phase::Halted {
            debug!(sender, "halted; ignoring message");
            return;
        }

        match envelope.kind() {
            MessageKind::Proposal => self.handle_proposal(envelope).await,
            MessageKind::RecoveryRequest => self.handle_recovery_request(envelope).await,
            MessageKind::RecoveryMessage => {
                if let ConsensusPayload::RecoveryMessage(recovery) = envelope.payload {
                    self.handle_recovery(recovery).await;
                }
            }
            MessageKind::ChangeView => {
                let signer = envelope.signer;
                match self.context.record_message(envelope) {
                    RecordOutcome::Recorded => {
                        debug!(signer, "change-view recorded");
                        // a round that already has commitments cannot move;
                        // help the requester catch up instead
                        if self.context.commitment_count() > 0 {
                            self.send_recovery_to(signer).await;
                        }
                        self.try_progress().await;
                    }
                    RecordOutcome::Rejected(RejectReason::Locked) => {
                        self.send_recovery_to(signer).await;
                    }
                    RecordOutcome::Rejected(reason) => {
                        log_rejection(signer, MessageKind::ChangeView, &reason)
                    }
                }
            }
            MessageKind::Acknowledgment | MessageKind::Commitment => {
                let kind = envelope.kind();
                let signer = envelope.signer;
                match self.context.record_message(envelope) {
                    RecordOutcome::Recorded => {
                        debug!(signer, ?kind, "recorded");
                        self.try_progress().await;
                    }
                    RecordOutcome::Rejected(RejectReason::FutureView { got, current }) => {
                        // the sender is ahead of us; ask it for its round
                        debug!(signer, got, current, "behind the round; requesting recovery");
                        self.request_recovery_from(signer).await;
                    }
                    RecordOutcome::Rejected(reason) => log_rejection(signer, kind, &reason),
                }
            }
        }
    }

    /// Validate and accept a proposal from the designated primary, then
    /// acknowledge it.
    async fn handle_proposal(&mut self, envelope: Envelope) {
        let signer = envelope.signer;
        if let Err(reason) = self.context.check_proposal(&envelope) {
            log_rejection(signer, MessageKind::Proposal, &reason);
            return;
        }
        let ConsensusPayload::Proposal {
            prev_hash,
            timestamp_ms,
            ref tx_hashes,
        } = envelope.payload
        else {
            return;
        };

        // content validation: a proposal that fails here is never accepted,
        // and the round recovers through the ordinary timeout path
        if prev_hash != self.parent.hash {
            warn!(signer, %prev_hash, expected = %self.parent.hash, "proposal built on wrong parent");
            return;
        }
        if timestamp_ms <= self.parent.timestamp_ms
            || timestamp_ms > now_ms() + self.config.timestamp_tolerance_ms
        {
            warn!(signer, timestamp_ms, "proposal timestamp out of tolerance");
            return;
        }
        let height = self.context.height();
        let parent = self.parent;
        if let Err(e) = with_timeout(
            self.config.execution_timeout(),
            self.execution.validate_proposal(height, &parent, tx_hashes),
        )
        .await
        {
            warn!(signer, error = %e, "proposal failed validation");
            return;
        }

        if self.context.record_message(envelope) != RecordOutcome::Recorded {
            return;
        }
        let Some(proposal_hash) = self.context.current_proposal_hash() else {
            return;
        };
        debug!(signer, %proposal_hash, "proposal accepted");
        self.phase = Phase::AwaitingAcknowledgment;

        if let Some(my_index) = self.my_index {
            if my_index != signer {
                let ack = Envelope::signed(
                    height,
                    self.context.view(),
                    ConsensusPayload::Acknowledgment { proposal_hash },
                    my_index,
                    &self.keypair,
                );
                self.context.record_message(ack.clone());
                self.network.broadcast(ack.encode()).await;
            }
        }
        self.try_progress().await;
    }

    /// React to newly reached quorums: acknowledge → commit → finalize, or
    /// a change-view quorum → advance the view.
    async fn try_progress(&mut self) {
        if matches!(self.phase, Phase::Locked | Phase::Finalized | Phase::Halted) {
            return;
        }

        if self.context.quorum_reached(MessageKind::Acknowledgment) {
            self.broadcast_own_commitment().await;
        }

        if self.context.quorum_reached(MessageKind::Commitment) {
            self.context.lock();
            self.phase = Phase::Locked;
            self.timer.disarm();
            self.finalize().await;
            return;
        }

        if self.context.is_locked() || self.own_commitment_sent() {
            // our commitment may be part of a quorum somewhere; abandoning
            // the view now could let two blocks finalize for one height
            return;
        }
        if let Some(target) = self.context.change_view_target() {
            self.advance_view(target).await;
        }
    }

    fn own_commitment_sent(&self) -> bool {
        match self.my_index {
            Some(my_index) => self
                .context
                .commitment_envelopes()
                .any(|env| env.signer == my_index),
            None => false,
        }
    }

    async fn broadcast_own_commitment(&mut self) {
        let Some(my_index) = self.my_index else {
            return;
        };
        let Some(proposal_hash) = self.context.current_proposal_hash() else {
            return;
        };
        if self.own_commitment_sent() {
            if self.phase == Phase::AwaitingAcknowledgment {
                self.phase = Phase::AwaitingCommitment;
            }
            return;
        }
        let signature = self.keypair.sign(proposal_hash.as_ref()).to_vec();
        let commitment = Envelope::signed(
            self.context.height(),
            self.context.view(),
            ConsensusPayload::Commitment { signature },
            my_index,
            &self.keypair,
        );
        if self.context.record_message(commitment.clone()) == RecordOutcome::Recorded {
            info!(height = self.context.height(), view = self.context.view(), %proposal_hash, "committing");
            self.network.broadcast(commitment.encode()).await;
            self.phase = Phase::AwaitingCommitment;
        }
    }

    /// Assemble, execute, and persist the locked block, then move to the
    /// next height.
    async fn finalize(&mut self) {
        let height = self.context.height();
        let Some((hash, timestamp_ms, tx_hashes)) = self.locked_proposal() else {
            error!(height, "locked without an accepted proposal");
            self.phase = Phase::Halted;
            return;
        };
        let mut block = Block {
            header: BlockHeader {
                prev_hash: self.parent.hash,
                height,
                timestamp_ms,
                tx_root: tx_root(&tx_hashes),
                state_root: Hash::ZERO,
            },
            hash,
            tx_hashes,
            witness: self.context.witness(),
        };

        match with_timeout(
            self.config.execution_timeout(),
            self.execution.apply_block(&block),
        )
        .await
        {
            Ok(state_root) => block.header.state_root = state_root,
            Err(e) => {
                // the block is final for this height; failing to execute it
                // locally is as unrecoverable as failing to store it
                error!(height, error = %e, "failed to apply finalized block; halting");
                self.phase = Phase::Halted;
                return;
            }
        }

        let mut persisted = false;
        for attempt in 0..=self.config.persist_retries {
            match self.ledger.persist_block(&block).await {
                Ok(()) => {
                    persisted = true;
                    break;
                }
                Err(e) => {
                    warn!(height, attempt, error = %e, "persist failed");
                }
            }
        }
        if !persisted {
            error!(
                height,
                hash = %block.hash,
                "could not persist finalized block; halting height"
            );
            self.phase = Phase::Halted;
            return;
        }

        info!(%block, view = self.context.view(), "block finalized");
        self.phase = Phase::Finalized;
        let _ = self.finalized_tx.send(block).await;
        self.handle_height_start(height + 1).await;
    }

    fn locked_proposal(&self) -> Option<(Hash, u64, Vec<Hash>)> {
        let hash = self.context.current_proposal_hash()?;
        let proposal = self.context.proposal()?;
        match &proposal.payload {
            ConsensusPayload::Proposal {
                timestamp_ms,
                tx_hashes,
                ..
            } => Some((hash, *timestamp_ms, tx_hashes.clone())),
            _ => None,
        }
    }

    /// Timer fired: broadcast our change-view vote and re-arm with a longer
    /// timeout. The view itself only advances on a quorum.
    async fn handle_timer(&mut self, epoch: TimerEpoch) {
        if !self.timer.is_current(&epoch) {
            debug!(?epoch, "stale timer fire");
            return;
        }
        if matches!(self.phase, Phase::Locked | Phase::Finalized | Phase::Halted) {
            return;
        }
        let height = self.context.height();
        let view = self.context.view();

        // our own commitment may already be part of a quorum elsewhere, so
        // ask for the missing pieces rather than voting to abandon the view
        if self.own_commitment_sent() {
            info!(height, view, "round timed out after commitments; requesting recovery");
            if let Some(my_index) = self.my_index {
                let request = Envelope::signed(
                    height,
                    view,
                    ConsensusPayload::RecoveryRequest,
                    my_index,
                    &self.keypair,
                );
                self.network.broadcast(request.encode()).await;
            }
            self.timeout_attempts += 1;
            self.timer.arm(
                height,
                view,
                self.config.view_timeout(view + self.timeout_attempts),
            );
            return;
        }

        let target = view + 1;
        info!(height, view, target, "round timed out; voting to change view");

        if let Some(my_index) = self.my_index {
            let change_view = Envelope::signed(
                height,
                view,
                ConsensusPayload::ChangeView {
                    new_view: target,
                    timestamp_ms: now_ms(),
                },
                my_index,
                &self.keypair,
            );
            self.context.record_message(change_view.clone());
            self.network.broadcast(change_view.encode()).await;
        }

        self.timeout_attempts += 1;
        self.timer.arm(
            height,
            view,
            self.config.view_timeout(view + self.timeout_attempts),
        );
        self.try_progress().await;
    }

    async fn advance_view(&mut self, target: View) {
        let height = self.context.height();
        info!(height, from = self.context.view(), to = target, "view change");
        self.context.advance_view(target);
        self.phase = Phase::Initial;
        self.timeout_attempts = 0;
        self.start_view().await;
    }

    /// Answer a peer's RecoveryRequest with our view of the round.
    async fn handle_recovery_request(&mut self, request: Envelope) {
        debug!(requester = request.signer, "answering recovery request");
        self.send_recovery_to(request.signer).await;
    }

    async fn send_recovery_to(&mut self, peer: ValidatorIndex) {
        let Some(my_index) = self.my_index else {
            return;
        };
        let payload = recovery::build(&self.context);
        let response = Envelope::signed(
            self.context.height(),
            self.context.view(),
            ConsensusPayload::RecoveryMessage(payload),
            my_index,
            &self.keypair,
        );
        self.network.send_to(peer, response.encode()).await;
    }

    async fn request_recovery_from(&mut self, peer: ValidatorIndex) {
        let Some(my_index) = self.my_index else {
            return;
        };
        let request = Envelope::signed(
            self.context.height(),
            self.context.view(),
            ConsensusPayload::RecoveryRequest,
            my_index,
            &self.keypair,
        );
        self.network.send_to(peer, request.encode()).await;
    }

    /// Merge a peer's RecoveryMessage: the embedded proposal goes through
    /// the full acceptance path, the votes through the ordinary record
    /// rules. The merge can only add information.
    async fn handle_recovery(&mut self, recovery: RecoveryPayload) {
        if let Some(proposal) = recovery.proposal.clone() {
            if proposal.verify(self.context.validators()).is_ok() {
                self.handle_proposal(*proposal).await;
            } else {
                warn!("recovery message carried an unverifiable proposal");
            }
        }
        let stats = recovery::merge_votes(&mut self.context, &recovery);
        debug!(
            recorded = stats.recorded,
            rejected = stats.rejected,
            "merged recovery message"
        );
        self.try_progress().await;
    }
}

fn log_rejection(signer: ValidatorIndex, kind: MessageKind, reason: &RejectReason) {
    match reason {
        RejectReason::WrongPrimary { .. } | RejectReason::ConflictingProposal => {
            // evidence of primary misbehavior; logged, not punished here
            warn!(signer, ?kind, ?reason, "rejected message");
        }
        _ => debug!(signer, ?kind, ?reason, "rejected message"),
    }
}

/// Bound a collaborator call; exceeding the bound maps to
/// [`ExecutionError::Timeout`].
async fn with_timeout<T>(
    bound: Duration,
    fut: impl Future<Output = Result<T, ExecutionError>>,
) -> Result<T, ExecutionError> {
    match tokio::time::timeout(bound, fut).await {
        Ok(result) => result,
        Err(_) => Err(ExecutionError::Timeout {
            timeout_ms: bound.as_millis() as u64,
        }),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockExecution, MockLedger, MockNetwork};

    struct Node {
        engine: ConsensusEngine,
        network: Arc<MockNetwork>,
        ledger: Arc<MockLedger>,
    }

    async fn node_at(
        keypairs: &[SigningKeyPair],
        own: usize,
        head_height: Height,
    ) -> Node {
        let keys: Vec<Vec<u8>> = keypairs
            .iter()
            .map(|k| k.public_key_bytes().to_vec())
            .collect();
        let execution = Arc::new(MockExecution::default());
        let ledger = Arc::new(MockLedger::new(keys, head_height));
        let network = Arc::new(MockNetwork::default());
        let (engine, _handle, _finalized) = ConsensusEngine::new(
            ConsensusConfig::default(),
            keypairs[own].clone(),
            execution,
            Arc::clone(&ledger) as Arc<dyn LedgerStore>,
            Arc::clone(&network) as Arc<dyn NetworkAdapter>,
        )
        .await
        .unwrap();
        Node {
            engine,
            network,
            ledger,
        }
    }

    fn four_keypairs() -> Vec<SigningKeyPair> {
        (0..4).map(|_| SigningKeyPair::generate()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn backup_waits_for_a_proposal() {
        let keypairs = four_keypairs();
        // height 10, view 0: primary index is (10 + 0) % 4 = 2
        let mut node = node_at(&keypairs, 0, 9).await;
        node.engine.handle_event(ConsensusEvent::HeightStart(10)).await;

        assert_eq!(node.engine.phase(), Phase::AwaitingProposal);
        assert_eq!(node.engine.context().primary(), 2);
        assert!(node.network.take_broadcasts().is_empty());
        assert!(node.engine.timer_epoch().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn primary_proposes_at_height_start() {
        let keypairs = four_keypairs();
        let mut node = node_at(&keypairs, 2, 9).await;
        node.engine.handle_event(ConsensusEvent::HeightStart(10)).await;

        assert_eq!(node.engine.phase(), Phase::AwaitingAcknowledgment);
        let sent = node.network.take_broadcasts();
        assert_eq!(sent.len(), 1);
        let envelope = Envelope::decode(&sent[0]).unwrap();
        assert_eq!(envelope.kind(), MessageKind::Proposal);
        assert_eq!(envelope.height, 10);
        assert_eq!(envelope.signer, 2);
        // proposing registers the primary's implicit acknowledgment
        assert_eq!(node.engine.context().acknowledgment_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_for_other_heights_are_dropped() {
        let keypairs = four_keypairs();
        let mut node = node_at(&keypairs, 0, 9).await;
        node.engine.handle_event(ConsensusEvent::HeightStart(10)).await;

        let stale = Envelope::signed(
            9,
            2,
            ConsensusPayload::Acknowledgment {
                proposal_hash: Hash::ZERO,
            },
            1,
            &keypairs[1],
        );
        node.engine
            .handle_event(ConsensusEvent::Inbound {
                sender: 1,
                bytes: stale.encode(),
            })
            .await;

        assert_eq!(node.engine.phase(), Phase::AwaitingProposal);
        assert_eq!(node.engine.context().acknowledgment_count(), 0);
        assert!(node.network.take_broadcasts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_bytes_are_dropped() {
        let keypairs = four_keypairs();
        let mut node = node_at(&keypairs, 0, 9).await;
        node.engine.handle_event(ConsensusEvent::HeightStart(10)).await;

        node.engine
            .handle_event(ConsensusEvent::Inbound {
                sender: 1,
                bytes: vec![0xff, 0x01, 0x02],
            })
            .await;
        assert_eq!(node.engine.phase(), Phase::AwaitingProposal);
    }

    #[tokio::test(start_paused = true)]
    async fn proposal_on_wrong_parent_is_not_acknowledged() {
        let keypairs = four_keypairs();
        let mut node = node_at(&keypairs, 0, 9).await;
        node.engine.handle_event(ConsensusEvent::HeightStart(10)).await;

        let proposal = Envelope::signed(
            10,
            0,
            ConsensusPayload::Proposal {
                prev_hash: Hash([0xaa; 32]),
                timestamp_ms: now_ms(),
                tx_hashes: vec![],
            },
            2,
            &keypairs[2],
        );
        node.engine
            .handle_event(ConsensusEvent::Inbound {
                sender: 2,
                bytes: proposal.encode(),
            })
            .await;

        assert_eq!(node.engine.phase(), Phase::AwaitingProposal);
        assert!(node.engine.context().current_proposal_hash().is_none());
        assert!(node.network.take_broadcasts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn valid_proposal_is_acknowledged() {
        let keypairs = four_keypairs();
        let mut node = node_at(&keypairs, 0, 9).await;
        node.engine.handle_event(ConsensusEvent::HeightStart(10)).await;

        let parent = node.ledger.head();
        let proposal = Envelope::signed(
            10,
            0,
            ConsensusPayload::Proposal {
                prev_hash: parent.hash,
                timestamp_ms: parent.timestamp_ms + 500,
                tx_hashes: vec![Hash([1; 32])],
            },
            2,
            &keypairs[2],
        );
        node.engine
            .handle_event(ConsensusEvent::Inbound {
                sender: 2,
                bytes: proposal.encode(),
            })
            .await;

        assert_eq!(node.engine.phase(), Phase::AwaitingAcknowledgment);
        let sent = node.network.take_broadcasts();
        assert_eq!(sent.len(), 1);
        let ack = Envelope::decode(&sent[0]).unwrap();
        assert_eq!(ack.kind(), MessageKind::Acknowledgment);
        assert_eq!(ack.signer, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_epoch_is_ignored() {
        let keypairs = four_keypairs();
        let mut node = node_at(&keypairs, 0, 9).await;
        node.engine.handle_event(ConsensusEvent::HeightStart(10)).await;

        let forged = TimerEpoch {
            height: 10,
            view: 0,
            generation: 9999,
        };
        node.engine
            .handle_event(ConsensusEvent::TimerFired(forged))
            .await;
        assert_eq!(node.engine.view(), 0);
        assert!(node.network.take_broadcasts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_broadcasts_a_change_view_vote() {
        let keypairs = four_keypairs();
        let mut node = node_at(&keypairs, 0, 9).await;
        node.engine.handle_event(ConsensusEvent::HeightStart(10)).await;

        let epoch = node.engine.timer_epoch().unwrap();
        node.engine
            .handle_event(ConsensusEvent::TimerFired(epoch))
            .await;

        // a single vote is not a quorum; the view must not move yet
        assert_eq!(node.engine.view(), 0);
        let sent = node.network.take_broadcasts();
        assert_eq!(sent.len(), 1);
        let vote = Envelope::decode(&sent[0]).unwrap();
        assert!(matches!(
            vote.payload,
            ConsensusPayload::ChangeView { new_view: 1, .. }
        ));
        // re-armed with the escalated timeout
        assert!(node.engine.timer_epoch().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn observer_without_voting_rights_stays_silent() {
        let keypairs = four_keypairs();
        let outsider = SigningKeyPair::generate();
        let keys: Vec<Vec<u8>> = keypairs
            .iter()
            .map(|k| k.public_key_bytes().to_vec())
            .collect();
        let execution = Arc::new(MockExecution::default());
        let ledger = Arc::new(MockLedger::new(keys, 9));
        let network = Arc::new(MockNetwork::default());
        let (mut engine, _handle, _finalized) = ConsensusEngine::new(
            ConsensusConfig::default(),
            outsider,
            execution,
            ledger.clone() as Arc<dyn LedgerStore>,
            Arc::clone(&network) as Arc<dyn NetworkAdapter>,
        )
        .await
        .unwrap();
        engine.handle_event(ConsensusEvent::HeightStart(10)).await;

        let parent = ledger.head();
        let proposal = Envelope::signed(
            10,
            0,
            ConsensusPayload::Proposal {
                prev_hash: parent.hash,
                timestamp_ms: parent.timestamp_ms + 500,
                tx_hashes: vec![],
            },
            2,
            &keypairs[2],
        );
        engine
            .handle_event(ConsensusEvent::Inbound {
                sender: 2,
                bytes: proposal.encode(),
            })
            .await;

        // the proposal is tracked but no acknowledgment goes out
        assert!(engine.context().current_proposal_hash().is_some());
        assert!(network.take_broadcasts().is_empty());
    }
}
