//! 转发引擎测试用的内存链

use alloy::primitives::{address, keccak256, Address, Bytes, LogData, B256, U256, U64};
use alloy::sol_types::{SolCall, SolEvent};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use crate::{
    chain_adapter::{
        message_proxy::{abi, outgoing_message_log},
        BlockTag, CallRequest, ChainAdapter, ChainAdapterFactory, LogFilter,
    },
    config::AccountKind,
    tx::{TxSigner, UnsignedTx},
    types::{RpcLog, TxReceipt},
    Error,
};

pub const PROXY: Address = address!("d2aaa00100000000000000000000000000000000");

/// 目标链收到的一次 postIncomingMessages
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub src_chain: String,
    pub start: u64,
    pub senders: Vec<Address>,
    pub gas_limit: u64,
    pub bls_signature: [U256; 2],
}

#[derive(Default)]
struct FakeState {
    latest: u64,
    timestamps: HashMap<u64, u64>,
    logs: Vec<RpcLog>,
    outgoing: HashMap<String, u64>,
    incoming: HashMap<String, u64>,
    last_block_by_dst: HashMap<String, u64>,
    references_broken: bool,
    estimate_fails: bool,
    post_error: bool,
    submissions: Vec<Submission>,
}

pub struct FakeChain {
    url: String,
    state: Mutex<FakeState>,
}

fn u256_word(value: u64) -> Bytes {
    Bytes::from(U256::from(value).to_be_bytes::<32>().to_vec())
}

fn to_log(data: LogData, block: u64, tx_hash: B256) -> RpcLog {
    RpcLog {
        address: PROXY,
        topics: data.topics().to_vec(),
        data: data.data,
        block_number: Some(U64::from(block)),
        transaction_hash: Some(tx_hash),
        log_index: None,
    }
}

impl FakeChain {
    pub fn new(url: &str, latest: u64) -> Self {
        Self {
            url: url.to_string(),
            state: Mutex::new(FakeState {
                latest,
                ..Default::default()
            }),
        }
    }

    /// 发出一条 OutgoingMessage 及其反向引用，同时推进发出计数
    pub fn emit_outgoing(
        &self,
        dst_chain: &str,
        counter: u64,
        sender: Address,
        dst_contract: Address,
        data: Bytes,
        block: u64,
    ) {
        let mut state = self.state.lock().unwrap();
        let log = outgoing_message_log(PROXY, dst_chain, counter, sender, dst_contract, data, block);
        let tx_hash = log.transaction_hash.unwrap_or_default();
        state.logs.push(log);

        let previous = state.last_block_by_dst.get(dst_chain).copied().unwrap_or(0);
        let reference = abi::PreviousMessageReference {
            currentMessage: U256::from(counter),
            previousOutgoingMessageBlockId: U256::from(previous),
        };
        state.logs.push(to_log(reference.encode_log_data(), block, tx_hash));
        state.last_block_by_dst.insert(dst_chain.to_string(), block);

        let outgoing = state.outgoing.entry(dst_chain.to_string()).or_default();
        *outgoing = (*outgoing).max(counter + 1);
    }

    /// 连续发出 count 条消息，每条一个区块
    pub fn emit_range(&self, dst_chain: &str, from: u64, count: u64, first_block: u64) {
        for i in 0..count {
            self.emit_outgoing(
                dst_chain,
                from + i,
                Address::repeat_byte(0x10 + i as u8),
                Address::repeat_byte(0x20),
                Bytes::from(vec![i as u8]),
                first_block + i,
            );
        }
    }

    pub fn set_incoming(&self, src_chain: &str, value: u64) {
        self.state.lock().unwrap().incoming.insert(src_chain.to_string(), value);
    }

    pub fn incoming(&self, src_chain: &str) -> u64 {
        self.state.lock().unwrap().incoming.get(src_chain).copied().unwrap_or(0)
    }

    pub fn set_latest(&self, block: u64) {
        self.state.lock().unwrap().latest = block;
    }

    pub fn set_block_timestamp(&self, block: u64, ts: u64) {
        self.state.lock().unwrap().timestamps.insert(block, ts);
    }

    pub fn break_references(&self) {
        self.state.lock().unwrap().references_broken = true;
    }

    /// 删除某个区块中的 PreviousMessageReference 记录，反向链表在此中断
    pub fn drop_reference_at(&self, block: u64) {
        let topic = abi::PreviousMessageReference::SIGNATURE_HASH;
        self.state
            .lock()
            .unwrap()
            .logs
            .retain(|log| !(log.block() == Some(block) && log.topics.first() == Some(&topic)));
    }

    pub fn fail_gas_estimation(&self) {
        self.state.lock().unwrap().estimate_fails = true;
    }

    pub fn emit_post_message_errors(&self) {
        self.state.lock().unwrap().post_error = true;
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().unwrap().submissions.clone()
    }

    /// 执行 postIncomingMessages，返回回执
    pub fn apply_post(&self, tx: &UnsignedTx) -> Result<TxReceipt, Error> {
        let call = abi::postIncomingMessagesCall::abi_decode(&tx.data, true)
            .map_err(|e| Error::Chain(format!("bad postIncomingMessages: {}", e)))?;
        let mut state = self.state.lock().unwrap();
        let start = u64::try_from(call.startingCounter).unwrap_or(u64::MAX);
        let incoming = state.incoming.get(&call.fromChainName).copied().unwrap_or(0);
        if start != incoming {
            return Err(Error::Chain(format!(
                "Starting counter {} is not equal to incoming counter {}",
                start, incoming
            )));
        }
        state
            .incoming
            .insert(call.fromChainName.clone(), incoming + call.messages.len() as u64);

        state.latest += 1;
        let block = state.latest;
        let tx_hash = keccak256(format!("post-{}-{}", call.fromChainName, start).as_bytes());
        if state.post_error {
            let event = abi::PostMessageError {
                msgCounter: U256::from(start),
                message: Bytes::from_static(b"revert"),
            };
            state.logs.push(to_log(event.encode_log_data(), block, tx_hash));
        }
        state.submissions.push(Submission {
            src_chain: call.fromChainName,
            start,
            senders: call.messages.iter().map(|m| m.sender).collect(),
            gas_limit: tx.gas_limit,
            bls_signature: call.sign.blsSignature,
        });
        Ok(TxReceipt {
            transaction_hash: tx_hash,
            block_number: Some(U64::from(block)),
            status: Some(U64::from(1)),
            gas_used: Some(U256::from(tx.gas_limit)),
            cumulative_gas_used: U256::from(tx.gas_limit),
            effective_gas_price: None,
            logs: vec![],
        })
    }

    fn string_arg<C: SolCall>(data: &[u8], pick: impl Fn(C) -> String) -> Result<String, Error> {
        C::abi_decode(data, true)
            .map(pick)
            .map_err(|e| Error::Chain(format!("bad call data: {}", e)))
    }
}

#[async_trait]
impl ChainAdapter for FakeChain {
    fn url(&self) -> &str {
        &self.url
    }

    async fn block_number(&self) -> Result<u64, Error> {
        Ok(self.state.lock().unwrap().latest)
    }

    async fn block_timestamp(&self, block: u64) -> Result<u64, Error> {
        Ok(self.state.lock().unwrap().timestamps.get(&block).copied().unwrap_or(0))
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .logs
            .iter()
            .filter(|log| log.address == filter.address)
            .filter(|log| {
                let block = log.block().unwrap_or_default();
                block >= filter.from_block && block <= filter.to_block
            })
            .filter(|log| {
                filter.topics.iter().enumerate().all(|(i, topic)| match topic {
                    Some(topic) => log.topics.get(i) == Some(topic),
                    None => true,
                })
            })
            .cloned()
            .collect())
    }

    async fn call(&self, request: &CallRequest, _block: BlockTag) -> Result<Bytes, Error> {
        let data = request.data.as_ref();
        if data.len() < 4 {
            return Err(Error::Chain("execution reverted".to_string()));
        }
        let selector: [u8; 4] = [data[0], data[1], data[2], data[3]];
        if selector == abi::getOutgoingMessagesCounterCall::SELECTOR {
            let name = Self::string_arg(data, |c: abi::getOutgoingMessagesCounterCall| c.targetChainName)?;
            let state = self.state.lock().unwrap();
            Ok(u256_word(state.outgoing.get(&name).copied().unwrap_or(0)))
        } else if selector == abi::getIncomingMessagesCounterCall::SELECTOR {
            let name = Self::string_arg(data, |c: abi::getIncomingMessagesCounterCall| c.fromChainName)?;
            let state = self.state.lock().unwrap();
            Ok(u256_word(state.incoming.get(&name).copied().unwrap_or(0)))
        } else if selector == abi::getLastOutgoingMessageBlockIdCall::SELECTOR {
            let name =
                Self::string_arg(data, |c: abi::getLastOutgoingMessageBlockIdCall| c.targetChainName)?;
            let state = self.state.lock().unwrap();
            if state.references_broken {
                return Err(Error::Chain("execution reverted: unknown method".to_string()));
            }
            Ok(u256_word(state.last_block_by_dst.get(&name).copied().unwrap_or(0)))
        } else if selector == abi::postIncomingMessagesCall::SELECTOR {
            Ok(Bytes::new())
        } else {
            Err(Error::Chain("execution reverted".to_string()))
        }
    }

    async fn estimate_gas(&self, _request: &CallRequest) -> Result<u64, Error> {
        if self.state.lock().unwrap().estimate_fails {
            return Err(Error::Chain("gas required exceeds allowance".to_string()));
        }
        Ok(500_000)
    }

    async fn gas_price(&self) -> Result<U256, Error> {
        Ok(U256::from(1_000_000_000u64))
    }

    async fn transaction_count(&self, _address: Address, _block: BlockTag) -> Result<u64, Error> {
        Ok(self.state.lock().unwrap().submissions.len() as u64)
    }

    async fn balance(&self, _address: Address) -> Result<U256, Error> {
        Ok(U256::MAX)
    }

    async fn chain_id(&self) -> Result<u64, Error> {
        Ok(1)
    }

    async fn send_raw_transaction(&self, _raw: Bytes) -> Result<B256, Error> {
        Err(Error::Chain("raw transactions are not supported".to_string()))
    }

    async fn transaction_receipt(&self, _hash: B256) -> Result<Option<TxReceipt>, Error> {
        Ok(None)
    }
}

/// 直接把交易应用到目标内存链的签名后端
pub struct ApplySigner {
    pub chain: Arc<FakeChain>,
}

#[async_trait]
impl TxSigner for ApplySigner {
    fn kind(&self) -> AccountKind {
        AccountKind::DirectKey
    }

    fn address(&self) -> Address {
        Address::repeat_byte(0xee)
    }

    async fn sign_and_send(
        &self,
        _adapter: &dyn ChainAdapter,
        tx: &UnsignedTx,
    ) -> Result<Option<TxReceipt>, Error> {
        self.chain.apply_post(tx).map(Some)
    }
}

/// 按 URL 返回预先注册的内存链
#[derive(Default)]
pub struct FakeFactory {
    adapters: HashMap<String, Arc<dyn ChainAdapter>>,
}

impl FakeFactory {
    pub fn insert(&mut self, url: &str, adapter: Arc<dyn ChainAdapter>) {
        self.adapters.insert(url.to_string(), adapter);
    }
}

#[async_trait]
impl ChainAdapterFactory for FakeFactory {
    async fn create_adapter(&self, url: &str) -> Result<Arc<dyn ChainAdapter>, Error> {
        self.adapters
            .get(url)
            .cloned()
            .ok_or_else(|| Error::Network(format!("connection refused: {}", url)))
    }
}
