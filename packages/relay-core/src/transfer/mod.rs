use alloy::primitives::{keccak256, U256};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use crate::{
    chain_adapter::{CallRequest, ChainAdapterFactory, DefaultChainAdapterFactory, MessageProxy},
    config::{EffectiveLimits, QuorumConfig},
    peers::{PeerCache, StaticPeers},
    scheduler::time_framing::TimeFraming,
    tx::{ContractCall, PayedReceipt, TxSubmitter},
    types::{Direction, Message, MessageCounters},
    unix_now, Error,
};

pub mod details;
pub mod discovery;
pub mod quorum;
pub mod s2s;
pub mod signing;
pub mod stats;

#[cfg(test)]
pub(crate) mod fake;

pub use details::RunLog;
pub use discovery::{BlockHints, DiscoveryStrategy};
pub use signing::{IdentitySigner, MessageSigner, SignRequest, SignedBatch};
pub use stats::{TransferErrorRecord, TransferEvent, TransferStats};

/// 时间分片检查点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingPhase {
    BeforeGathering,
    AfterGathering,
    AfterSigning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialReason {
    StepBudget,
    TimeFraming(FramingPhase),
    TransactionCap,
}

/// 一次转发运行的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed { processed: u64 },
    /// 提前结束但不算失败，下次运行从新的计数器继续
    Partial { processed: u64, reason: PartialReason },
    /// 同方向已有运行在进行
    Skipped,
    Failed { reason: String },
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::Completed { .. } | TransferOutcome::Partial { .. })
    }

    pub fn processed(&self) -> u64 {
        match self {
            TransferOutcome::Completed { processed } | TransferOutcome::Partial { processed, .. } => *processed,
            _ => 0,
        }
    }
}

/// 转发的一端：链名和该链上的 MessageProxy
#[derive(Clone)]
pub struct ChainEndpoint {
    pub name: String,
    pub proxy: MessageProxy,
}

/// 一次 transfer 调用所需的句柄，submitter 属于目标链
#[derive(Clone)]
pub struct TransferRequest {
    pub direction: Direction,
    pub src: ChainEndpoint,
    pub dst: ChainEndpoint,
    pub submitter: Arc<TxSubmitter>,
    pub limits: EffectiveLimits,
}

/// 一轮收集到的消息
#[derive(Debug, Default)]
struct Batch {
    start: u64,
    messages: Vec<Message>,
    counters: Vec<u64>,
    cap_hit: bool,
}

struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn direction_slot(direction: Direction) -> usize {
    match direction {
        Direction::M2S => 0,
        Direction::S2M => 1,
        Direction::S2S => 2,
    }
}

/// 基于消息计数器的转发引擎
///
/// 每次运行读取源链发出计数与目标链接收计数，把 `[incoming, outgoing)`
/// 内的消息按批次收集、签名并提交到目标链。同一方向同时只允许一个运行。
pub struct TransferEngine {
    loop_counter: AtomicU64,
    in_progress: [AtomicBool; 3],
    stats: TransferStats,
    signer: Arc<dyn MessageSigner>,
    framing: TimeFraming,
    peers: Arc<dyn PeerCache>,
    factory: Arc<dyn ChainAdapterFactory>,
    quorum: QuorumConfig,
    discovery: DiscoveryStrategy,
    expose_details: bool,
}

impl TransferEngine {
    pub fn new(stats: TransferStats, signer: Arc<dyn MessageSigner>, framing: TimeFraming) -> Self {
        Self {
            loop_counter: AtomicU64::new(0),
            in_progress: Default::default(),
            stats,
            signer,
            framing,
            peers: Arc::new(StaticPeers::default()),
            factory: Arc::new(DefaultChainAdapterFactory),
            quorum: QuorumConfig::default(),
            discovery: DiscoveryStrategy::default(),
            expose_details: false,
        }
    }

    pub fn with_peers(mut self, peers: Arc<dyn PeerCache>, factory: Arc<dyn ChainAdapterFactory>) -> Self {
        self.peers = peers;
        self.factory = factory;
        self
    }

    pub fn with_quorum(mut self, quorum: QuorumConfig) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn with_discovery(mut self, discovery: DiscoveryStrategy) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_expose_details(mut self, expose_details: bool) -> Self {
        self.expose_details = expose_details;
        self
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn framing(&self) -> &TimeFraming {
        &self.framing
    }

    pub fn peers(&self) -> &Arc<dyn PeerCache> {
        &self.peers
    }

    pub fn factory(&self) -> &Arc<dyn ChainAdapterFactory> {
        &self.factory
    }

    pub fn loop_counter(&self) -> u64 {
        self.loop_counter.load(Ordering::Relaxed)
    }

    /// 执行一次转发
    ///
    /// 运行中的错误会记入统计并转为 `Failed`，不会以 `Err` 返回。
    pub async fn transfer(&self, request: &TransferRequest) -> Result<TransferOutcome, Error> {
        let direction = request.direction;
        let flag = &self.in_progress[direction_slot(direction)];
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(
                "Transfer {} from {} to {} is skipped because another transfer is in progress",
                direction, request.src.name, request.dst.name
            );
            return Ok(TransferOutcome::Skipped);
        }
        let _in_progress = InProgress(flag);

        let loop_counter = self.loop_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let mut run = RunLog::for_transfer(direction, loop_counter, &request.src.name, &request.dst.name);
        let mut receipts = Vec::new();
        let category = direction.error_category();

        let outcome = match self.run_transfer(request, loop_counter, &mut run, &mut receipts).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let name = run.name().to_string();
                run.error(format!("Error in {}: {}", name, e));
                TransferOutcome::Failed { reason: e.to_string() }
            }
        };
        report_gas_usage(&mut run, &request.src.name, &request.dst.name, &receipts);

        match &outcome {
            TransferOutcome::Completed { processed } => {
                self.stats.save_success(&category);
                info!(
                    "{}Transfer completed, {} message(s) processed",
                    run.prefix(),
                    processed
                );
                run.flush(true, self.expose_details);
            }
            TransferOutcome::Partial { processed, reason } => {
                info!(
                    "{}Transfer stopped early ({:?}), {} message(s) processed",
                    run.prefix(),
                    reason,
                    processed
                );
                run.flush(true, self.expose_details);
            }
            TransferOutcome::Failed { .. } => {
                self.stats.save_error(&category, &run.text());
                run.flush(false, self.expose_details);
            }
            TransferOutcome::Skipped => {}
        }
        Ok(outcome)
    }

    fn partial(&self, processed: u64, reason: PartialReason, run: &mut RunLog) -> TransferOutcome {
        run.warn(match reason {
            PartialReason::StepBudget => "Transfer step count overflow".to_string(),
            PartialReason::TransactionCap => "Transaction count cap reached".to_string(),
            PartialReason::TimeFraming(phase) => format!("Time framing overflow ({:?})", phase),
        });
        self.stats.save_success_all();
        TransferOutcome::Partial { processed, reason }
    }

    async fn run_transfer(
        &self,
        request: &TransferRequest,
        loop_counter: u64,
        run: &mut RunLog,
        receipts: &mut Vec<PayedReceipt>,
    ) -> Result<TransferOutcome, Error> {
        let counters = self.query_counters(request, run).await?;
        if counters.pending() == 0 {
            run.debug("Nothing to transfer");
            return Ok(TransferOutcome::Completed { processed: 0 });
        }
        let hints = discovery::discover_message_blocks(
            &request.src.proxy,
            &request.dst.name,
            counters,
            self.discovery,
            run,
        )
        .await?;

        let work = request.direction.work_type();
        let limits = &request.limits;
        let mut next = counters.incoming;
        let mut processed = 0u64;
        let mut steps_done = 0u64;
        while next < counters.outgoing {
            if steps_done > limits.transfer_steps {
                return Ok(self.partial(processed, PartialReason::StepBudget, run));
            }
            run.trace(format!(
                "Entering block former iteration with message counter set to {}, transfer step number is {}",
                next, steps_done
            ));
            if !self.framing.allows(work) {
                return Ok(self.partial(
                    processed,
                    PartialReason::TimeFraming(FramingPhase::BeforeGathering),
                    run,
                ));
            }

            let batch = self
                .gather(request, &hints, &mut next, counters.outgoing, processed, run)
                .await?;
            if batch.messages.is_empty() {
                if batch.cap_hit {
                    return Ok(self.partial(processed, PartialReason::TransactionCap, run));
                }
                break;
            }
            if !self.framing.allows(work) {
                return Ok(self.partial(
                    processed,
                    PartialReason::TimeFraming(FramingPhase::AfterGathering),
                    run,
                ));
            }

            if request.direction == Direction::S2S {
                self.validate_s2s(request, &batch, run).await?;
            }

            let signed = self.sign_batch(request, loop_counter, &batch, run).await?;
            if !self.framing.allows(work) {
                return Ok(self.partial(
                    processed,
                    PartialReason::TimeFraming(FramingPhase::AfterSigning),
                    run,
                ));
            }

            let payed = self.submit(request, &batch, signed, run).await?;
            receipts.push(payed);
            processed += batch.messages.len() as u64;
            steps_done += 1;
        }
        Ok(TransferOutcome::Completed { processed })
    }

    async fn query_counters(&self, request: &TransferRequest, run: &mut RunLog) -> Result<MessageCounters, Error> {
        let outgoing = request.src.proxy.outgoing_messages_counter(&request.dst.name).await?;
        run.debug(format!(
            "Result of src-chain.MessageProxy.getOutgoingMessagesCounter() call: {}",
            outgoing
        ));
        let incoming = request.dst.proxy.incoming_messages_counter(&request.src.name).await?;
        run.debug(format!(
            "Result of dst-chain.MessageProxy.getIncomingMessagesCounter() call: {}",
            incoming
        ));
        if incoming > outgoing {
            return Err(Error::Protocol(format!(
                "Incoming message counter {} on {} is ahead of outgoing message counter {} on {}",
                incoming, request.dst.name, outgoing, request.src.name
            )));
        }
        Ok(MessageCounters { outgoing, incoming })
    }

    /// 收集一批消息，安全检查未通过时提前结束本批
    async fn gather(
        &self,
        request: &TransferRequest,
        hints: &BlockHints,
        next: &mut u64,
        outgoing: u64,
        processed: u64,
        run: &mut RunLog,
    ) -> Result<Batch, Error> {
        let limits = &request.limits;
        let dst_hash = keccak256(request.dst.name.as_bytes());
        let mut batch = Batch {
            start: *next,
            ..Default::default()
        };
        let mut idx_in_block = 0usize;
        while *next < outgoing && idx_in_block < limits.transactions_per_block {
            if processed.saturating_add(idx_in_block as u64) > limits.max_transactions {
                batch.cap_hit = true;
                break;
            }
            let (from_block, to_block) = match hints.get(&*next) {
                Some(&block) if block != 0 => (block, Some(block)),
                _ => (0, None),
            };
            let events = request
                .src
                .proxy
                .outgoing_messages(&request.dst.name, *next, from_block, to_block)
                .await?;
            run.debug(format!(
                "Will review {} found event record(s) (in reverse order, newest to oldest) for message {}",
                events.len(),
                *next
            ));
            let event = events
                .iter()
                .rev()
                .find(|event| event.dst_chain_hash == dst_hash)
                .ok_or_else(|| {
                    Error::Protocol(format!("Can't get events from MessageProxy for message {}", *next))
                })?;

            // 以第一条记录的区块做安全检查
            let event_block = events.first().map(|e| e.block_number).unwrap_or(event.block_number);
            if !self.block_is_settled(request, event_block, run).await? {
                break;
            }

            run.debug(format!(
                "Will process message counter value {} found in block {}",
                *next, event.block_number
            ));
            batch.counters.push(*next);
            batch.messages.push(Message {
                sender: event.src_contract,
                destination_contract: event.dst_contract,
                to: None,
                amount: None,
                data: event.data.clone(),
                source_block_hint: Some(event.block_number),
            });
            *next += 1;
            idx_in_block += 1;
        }
        Ok(batch)
    }

    /// 区块深度与区块年龄检查，未通过返回 false
    async fn block_is_settled(&self, request: &TransferRequest, block: u64, run: &mut RunLog) -> Result<bool, Error> {
        let limits = &request.limits;
        let adapter = request.src.proxy.adapter();
        if limits.block_await_depth > 0 {
            let latest = adapter.block_number().await?;
            let distance = latest.saturating_sub(block);
            let passed = distance >= limits.block_await_depth;
            run.debug(format!(
                "Distance by blockNumber is {}, await check is {}",
                distance,
                if passed { "PASSED" } else { "FAILED" }
            ));
            if !passed {
                run.warn("Block depth check was not passed, canceling search for transfer events");
                return Ok(false);
            }
        }
        if limits.block_age > 0 {
            let block_ts = adapter.block_timestamp(block).await?;
            let age = unix_now().saturating_sub(block_ts);
            let passed = age >= limits.block_age;
            run.debug(format!(
                "Block age is {}, expected at least {}, age check is {}",
                age,
                limits.block_age,
                if passed { "PASSED" } else { "FAILED" }
            ));
            if !passed {
                run.warn("Block age check was not passed, canceling search for transfer events");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn validate_s2s(&self, request: &TransferRequest, batch: &Batch, run: &mut RunLog) -> Result<(), Error> {
        let chain = self.peers.find_chain(&request.src.name).ok_or_else(|| {
            Error::Protocol(format!(
                "Could not validate S2S messages, source S-Chain {} is not in peer cache yet or it's not connected to this {} S-Chain yet, try again later",
                request.src.name, request.dst.name
            ))
        })?;
        let validator = quorum::QuorumValidator {
            factory: self.factory.as_ref(),
            chain: &chain,
            proxy_address: request.src.proxy.address(),
            scan: *request.src.proxy.scan_config(),
            dst_chain: &request.dst.name,
            policy: self.quorum,
        };
        validator.validate_batch(&batch.messages, &batch.counters, run).await
    }

    async fn sign_batch(
        &self,
        request: &TransferRequest,
        loop_counter: u64,
        batch: &Batch,
        run: &mut RunLog,
    ) -> Result<SignedBatch, Error> {
        run.info(format!(
            "Will invoke message signing callback, first real message index is: {}, have {} message(s) to process",
            batch.start,
            batch.messages.len()
        ));
        let sign_request = SignRequest {
            loop_counter,
            direction: request.direction,
            start_index: batch.start,
            src_chain: request.src.name.clone(),
            dst_chain: request.dst.name.clone(),
            messages: batch.messages.clone(),
        };
        match self.signer.sign_messages(sign_request).await {
            Ok(signed) => {
                run.debug(format!(
                    "Did invoke message signing callback, got {} signed message(s)",
                    signed.messages.len()
                ));
                Ok(signed)
            }
            Err(e) => {
                run.error(format!("Error signing messages: {}", e));
                Err(e)
            }
        }
    }

    async fn submit(
        &self,
        request: &TransferRequest,
        batch: &Batch,
        signed: SignedBatch,
        run: &mut RunLog,
    ) -> Result<PayedReceipt, Error> {
        let limits = &request.limits;
        let submitter = &request.submitter;
        let adapter = submitter.adapter().as_ref();
        let data = request.dst.proxy.encode_post_incoming_messages(
            &request.src.name,
            batch.start,
            &signed.messages,
            signed.glue.as_ref(),
        )?;

        let gas_price = submitter
            .customizer()
            .compute_gas_price(adapter, U256::from(limits.max_gas_price))
            .await?;
        run.debug(format!("Using computed gasPrice {}", gas_price));
        let estimate_request = CallRequest {
            from: Some(submitter.from_address()),
            to: request.dst.proxy.address(),
            data: data.clone(),
            ..Default::default()
        };
        let mut gas_limit = submitter
            .customizer()
            .compute_gas(adapter, &estimate_request, limits.recommended_gas)
            .await;
        if request.direction == Direction::S2M {
            let floor = limits
                .per_message_gas
                .saturating_mul(signed.messages.len() as u64)
                .saturating_add(limits.s2m_gas_overhead);
            if gas_limit < floor {
                run.debug(format!("Raising estimated gas {} to S2M floor {}", gas_limit, floor));
                gas_limit = floor;
            }
        }
        run.debug(format!("Using estimated gas {}", gas_limit));

        let call = ContractCall {
            description: "MessageProxy.postIncomingMessages".to_string(),
            to: request.dst.proxy.address(),
            data,
            value: U256::ZERO,
            gas_price,
            gas_limit,
        };
        if let Some(err) = submitter.dry_run(&call).await? {
            return Err(Error::Chain(format!("DRY RUN FAILED: postIncomingMessages: {}", err)));
        }

        let to_main_chain = request.direction.targets_main_chain();
        let payed = submitter.payed_call(&call, !to_main_chain).await?;
        run.info(format!(
            "Messages {}..{} posted as {}",
            batch.start,
            batch.start + signed.messages.len() as u64,
            payed.receipt.transaction_hash
        ));
        if to_main_chain {
            self.verify_no_post_message_error(request, &payed, run).await?;
        }
        Ok(payed)
    }

    async fn verify_no_post_message_error(
        &self,
        request: &TransferRequest,
        payed: &PayedReceipt,
        run: &mut RunLog,
    ) -> Result<(), Error> {
        let Some(block) = payed.receipt.block() else {
            warn!(
                "{}Cannot validate PostMessageError events, no receipt block number",
                run.prefix()
            );
            run.warn("Cannot validate PostMessageError events, no receipt block number");
            return Ok(());
        };
        let tx_hash = payed.receipt.transaction_hash;
        let errors = request.dst.proxy.post_message_errors_for_tx(block, tx_hash).await?;
        debug!("Found {} PostMessageError event(s) for {}", errors.len(), tx_hash);
        if !errors.is_empty() {
            return Err(Error::Protocol(format!(
                "Found {} PostMessageError event(s) in block {} for transaction {}",
                errors.len(),
                block,
                tx_hash
            )));
        }
        run.debug("Validated transaction events, no PostMessageError events found");
        Ok(())
    }
}

fn report_gas_usage(run: &mut RunLog, src: &str, dst: &str, receipts: &[PayedReceipt]) {
    if receipts.is_empty() {
        return;
    }
    let mut total = U256::ZERO;
    for payed in receipts {
        total = total.saturating_add(payed.summary.gas_spent);
        run.info(format!(
            "Gas usage of TRANSFER {} to {}: tx {}, gas spent {}, ETH spent {}",
            src, dst, payed.receipt.transaction_hash, payed.summary.gas_spent, payed.summary.eth_spent
        ));
    }
    run.info(format!("Total gas spent by TRANSFER {} to {}: {}", src, dst, total));
}
