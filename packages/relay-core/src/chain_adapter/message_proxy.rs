use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::sol_types::{SolCall, SolEvent};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, trace};
use crate::{
    config::ScanConfig,
    types::{GlueResult, Message, OutgoingMessageEvent, ReferenceLogRecord, RpcLog},
    Error,
};
use super::{scan, BlockTag, CallRequest, ChainAdapter, LogFilter};

pub mod abi {
    alloy::sol! {
        struct Message {
            address sender;
            address destinationContract;
            bytes data;
        }

        struct Signature {
            uint256[2] blsSignature;
            uint256 hashA;
            uint256 hashB;
            uint256 counter;
        }

        function getOutgoingMessagesCounter(string targetChainName) external view returns (uint256);
        function getIncomingMessagesCounter(string fromChainName) external view returns (uint256);
        function getLastOutgoingMessageBlockId(string targetChainName) external view returns (uint256);
        function postIncomingMessages(string fromChainName, uint256 startingCounter, Message[] messages, Signature sign) external;

        event OutgoingMessage(bytes32 indexed dstChainHash, uint256 indexed msgCounter, address indexed srcContract, address dstContract, bytes data);
        event PostMessageError(uint256 indexed msgCounter, bytes message);
        event PreviousMessageReference(uint256 currentMessage, uint256 previousOutgoingMessageBlockId);
    }
}

/// PostMessageError 的搜索半径（块）
const POST_MESSAGE_ERROR_RADIUS: u64 = 10;

/// 一个 MessageProxy 合约在某条链上的类型化视图
#[derive(Clone)]
pub struct MessageProxy {
    adapter: Arc<dyn ChainAdapter>,
    address: Address,
    scan: ScanConfig,
}

impl MessageProxy {
    pub fn new(adapter: Arc<dyn ChainAdapter>, address: Address, scan: ScanConfig) -> Self {
        Self {
            adapter,
            address,
            scan,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn adapter(&self) -> &Arc<dyn ChainAdapter> {
        &self.adapter
    }

    pub fn scan_config(&self) -> &ScanConfig {
        &self.scan
    }

    async fn call_u256(&self, method: &str, data: Vec<u8>) -> Result<U256, Error> {
        let request = CallRequest {
            to: self.address,
            data: data.into(),
            ..Default::default()
        };
        let raw = self.adapter.call(&request, BlockTag::Latest).await?;
        if raw.len() < 32 {
            return Err(Error::Protocol(format!(
                "{} returned {} bytes from {}",
                method,
                raw.len(),
                self.address
            )));
        }
        Ok(U256::from_be_slice(&raw[..32]))
    }

    fn to_counter(method: &str, value: U256) -> Result<u64, Error> {
        u64::try_from(value)
            .map_err(|_| Error::Protocol(format!("{} value {} is not a valid integer", method, value)))
    }

    pub async fn outgoing_messages_counter(&self, dst_chain: &str) -> Result<u64, Error> {
        let data = abi::getOutgoingMessagesCounterCall {
            targetChainName: dst_chain.to_string(),
        }
        .abi_encode();
        let value = self.call_u256("getOutgoingMessagesCounter", data).await?;
        Self::to_counter("getOutgoingMessagesCounter", value)
    }

    pub async fn incoming_messages_counter(&self, src_chain: &str) -> Result<u64, Error> {
        let data = abi::getIncomingMessagesCounterCall {
            fromChainName: src_chain.to_string(),
        }
        .abi_encode();
        let value = self.call_u256("getIncomingMessagesCounter", data).await?;
        Self::to_counter("getIncomingMessagesCounter", value)
    }

    pub async fn last_outgoing_message_block_id(&self, dst_chain: &str) -> Result<u64, Error> {
        let data = abi::getLastOutgoingMessageBlockIdCall {
            targetChainName: dst_chain.to_string(),
        }
        .abi_encode();
        let value = self.call_u256("getLastOutgoingMessageBlockId", data).await?;
        Self::to_counter("getLastOutgoingMessageBlockId", value)
    }

    /// 指定区块内的全部 PreviousMessageReference 记录
    pub async fn previous_message_references(&self, block: u64) -> Result<Vec<ReferenceLogRecord>, Error> {
        let filter = LogFilter {
            address: self.address,
            topics: vec![Some(abi::PreviousMessageReference::SIGNATURE_HASH)],
            from_block: block,
            to_block: block,
        };
        let logs = scan::get_logs_progressive(
            self.adapter.as_ref(),
            &filter,
            Some(block),
            scan::DEFAULT_ATTEMPTS,
            &self.scan,
        )
        .await?;
        trace!("Got {} PreviousMessageReference record(s) in block {}", logs.len(), block);

        logs.iter()
            .map(|log| {
                let event = abi::PreviousMessageReference::decode_raw_log(
                    log.topics.iter().copied(),
                    &log.data,
                    true,
                )
                .map_err(|e| Error::Serialization(format!("Bad PreviousMessageReference log: {}", e)))?;
                Ok(ReferenceLogRecord {
                    current_message: Self::to_counter("currentMessage", event.currentMessage)?,
                    previous_outgoing_message_block_id: Self::to_counter(
                        "previousOutgoingMessageBlockId",
                        event.previousOutgoingMessageBlockId,
                    )?,
                    block_id: block,
                })
            })
            .collect()
    }

    /// 按目标链和消息序号查询 OutgoingMessage，to_block 为 None 表示最新块
    pub async fn outgoing_messages(
        &self,
        dst_chain: &str,
        counter: u64,
        from_block: u64,
        to_block: Option<u64>,
    ) -> Result<Vec<OutgoingMessageEvent>, Error> {
        let filter = LogFilter {
            address: self.address,
            topics: vec![
                Some(abi::OutgoingMessage::SIGNATURE_HASH),
                Some(keccak256(dst_chain.as_bytes())),
                Some(B256::from(U256::from(counter))),
            ],
            from_block,
            to_block: to_block.unwrap_or(from_block),
        };
        let logs = scan::get_logs_progressive(
            self.adapter.as_ref(),
            &filter,
            to_block,
            scan::DEFAULT_ATTEMPTS,
            &self.scan,
        )
        .await?;
        logs.iter().map(decode_outgoing_message).collect()
    }

    /// 在回执所在区块附近查找属于该交易的 PostMessageError
    pub async fn post_message_errors_for_tx(&self, block: u64, tx_hash: B256) -> Result<Vec<RpcLog>, Error> {
        let latest = self.adapter.block_number().await?;
        let from_block = block.saturating_sub(POST_MESSAGE_ERROR_RADIUS);
        let mut to_block = block + POST_MESSAGE_ERROR_RADIUS;
        if to_block >= latest {
            to_block = latest + 1;
        }
        let filter = LogFilter {
            address: self.address,
            topics: vec![Some(abi::PostMessageError::SIGNATURE_HASH)],
            from_block,
            to_block,
        };
        debug!(
            "Looking for PostMessageError of tx {} in blocks {}..={}",
            tx_hash, from_block, to_block
        );
        let logs =
            scan::get_logs_iterative(self.adapter.as_ref(), &filter, scan::DEFAULT_ATTEMPTS, &self.scan).await?;
        Ok(logs
            .into_iter()
            .filter(|log| log.transaction_hash == Some(tx_hash))
            .collect())
    }

    /// postIncomingMessages 调用数据，签名缺失时各字段为零
    pub fn encode_post_incoming_messages(
        &self,
        src_chain: &str,
        starting_counter: u64,
        messages: &[Message],
        glue: Option<&GlueResult>,
    ) -> Result<Bytes, Error> {
        let sign = match glue {
            Some(glue) => abi::Signature {
                blsSignature: [parse_u256(&glue.signature.x)?, parse_u256(&glue.signature.y)?],
                hashA: parse_u256(&glue.hash_point.x)?,
                hashB: parse_u256(&glue.hash_point.y)?,
                counter: parse_u256(&glue.hint)?,
            },
            None => abi::Signature {
                blsSignature: [U256::ZERO, U256::ZERO],
                hashA: U256::ZERO,
                hashB: U256::ZERO,
                counter: U256::ZERO,
            },
        };
        let call = abi::postIncomingMessagesCall {
            fromChainName: src_chain.to_string(),
            startingCounter: U256::from(starting_counter),
            messages: messages
                .iter()
                .map(|m| abi::Message {
                    sender: m.sender,
                    destinationContract: m.destination_contract,
                    data: m.data.clone(),
                })
                .collect(),
            sign,
        };
        Ok(call.abi_encode().into())
    }
}

fn parse_u256(s: &str) -> Result<U256, Error> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str(s).map_err(|e| Error::Signing(format!("Bad signature component {}: {}", s, e)))
}

pub fn decode_outgoing_message(log: &RpcLog) -> Result<OutgoingMessageEvent, Error> {
    let event = abi::OutgoingMessage::decode_raw_log(log.topics.iter().copied(), &log.data, true)
        .map_err(|e| Error::Serialization(format!("Bad OutgoingMessage log: {}", e)))?;
    Ok(OutgoingMessageEvent {
        dst_chain_hash: event.dstChainHash,
        msg_counter: MessageProxy::to_counter("msgCounter", event.msgCounter)?,
        src_contract: event.srcContract,
        dst_contract: event.dstContract,
        data: event.data,
        block_number: log.block().unwrap_or_default(),
        transaction_hash: log.transaction_hash,
    })
}

/// 构造一条 OutgoingMessage 日志，测试桩使用
#[cfg(test)]
pub(crate) fn outgoing_message_log(
    proxy: Address,
    dst_chain: &str,
    counter: u64,
    src_contract: Address,
    dst_contract: Address,
    data: Bytes,
    block: u64,
) -> RpcLog {
    use alloy::primitives::{LogData, U64};
    let event = abi::OutgoingMessage {
        dstChainHash: keccak256(dst_chain.as_bytes()),
        msgCounter: U256::from(counter),
        srcContract: src_contract,
        dstContract: dst_contract,
        data,
    };
    let encoded: LogData = event.encode_log_data();
    RpcLog {
        address: proxy,
        topics: encoded.topics().to_vec(),
        data: encoded.data,
        block_number: Some(U64::from(block)),
        transaction_hash: Some(keccak256(format!("tx-{}-{}", dst_chain, counter).as_bytes())),
        log_index: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_adapter::MockChainAdapter;
    use crate::types::XYPoint;
    use alloy::primitives::{address, U64};

    const PROXY: Address = address!("d2aaa00100000000000000000000000000000000");

    fn proxy(adapter: MockChainAdapter) -> MessageProxy {
        MessageProxy::new(Arc::new(adapter), PROXY, ScanConfig::default())
    }

    #[tokio::test]
    async fn test_counter_call() {
        let mut adapter = MockChainAdapter::new();
        adapter
            .expect_call()
            .withf(|req, tag| req.to == PROXY && *tag == BlockTag::Latest)
            .returning(|_, _| Ok(Bytes::from(U256::from(7).to_be_bytes::<32>().to_vec())));

        let counter = proxy(adapter).outgoing_messages_counter("chain1").await.unwrap();
        assert_eq!(counter, 7);
    }

    #[tokio::test]
    async fn test_counter_not_a_valid_integer() {
        let mut adapter = MockChainAdapter::new();
        adapter
            .expect_call()
            .returning(|_, _| Ok(Bytes::from(U256::MAX.to_be_bytes::<32>().to_vec())));

        let err = proxy(adapter).incoming_messages_counter("Mainnet").await.unwrap_err();
        assert!(matches!(err, Error::Protocol(ref m) if m.contains("is not a valid integer")));
    }

    #[tokio::test]
    async fn test_outgoing_messages_decodes_event() {
        let sender = address!("1000000000000000000000000000000000000001");
        let dst = address!("2000000000000000000000000000000000000002");
        let log = outgoing_message_log(PROXY, "chain1", 3, sender, dst, Bytes::from(vec![1, 2]), 77);

        let mut adapter = MockChainAdapter::new();
        adapter.expect_url().return_const("http://node".to_string());
        adapter.expect_block_number().returning(|| Ok(100));
        adapter
            .expect_get_logs()
            .withf(|f| f.from_block == 77 && f.to_block == 77 && f.topics.len() == 3)
            .returning(move |_| Ok(vec![log.clone()]));

        let events = proxy(adapter)
            .outgoing_messages("chain1", 3, 77, Some(77))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].msg_counter, 3);
        assert_eq!(events[0].src_contract, sender);
        assert_eq!(events[0].dst_contract, dst);
        assert_eq!(events[0].dst_chain_hash, keccak256("chain1".as_bytes()));
        assert_eq!(events[0].block_number, 77);
    }

    #[tokio::test]
    async fn test_post_message_errors_filtered_by_tx() {
        let ours = B256::repeat_byte(0xaa);
        let theirs = B256::repeat_byte(0xbb);
        let error_log = |tx: B256| RpcLog {
            address: PROXY,
            topics: vec![abi::PostMessageError::SIGNATURE_HASH, B256::ZERO],
            data: Bytes::new(),
            block_number: Some(U64::from(50)),
            transaction_hash: Some(tx),
            log_index: None,
        };
        let logs = vec![error_log(ours), error_log(theirs)];

        let mut adapter = MockChainAdapter::new();
        adapter.expect_url().return_const("http://node".to_string());
        adapter.expect_block_number().returning(|| Ok(55));
        adapter
            .expect_get_logs()
            .withf(|f| f.from_block == 40 && f.to_block == 56)
            .returning(move |_| Ok(logs.clone()));

        let found = proxy(adapter).post_message_errors_for_tx(50, ours).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].transaction_hash, Some(ours));
    }

    #[test]
    fn test_encode_post_incoming_messages() {
        let proxy = proxy(MockChainAdapter::new());
        let messages = vec![Message {
            sender: Address::repeat_byte(1),
            destination_contract: Address::repeat_byte(2),
            to: None,
            amount: None,
            data: Bytes::from(vec![9]),
            source_block_hint: None,
        }];
        let glue = GlueResult {
            signature: XYPoint {
                x: "0x10".to_string(),
                y: "32".to_string(),
            },
            hash_point: XYPoint::default(),
            hint: "4".to_string(),
        };

        let data = proxy
            .encode_post_incoming_messages("Mainnet", 5, &messages, Some(&glue))
            .unwrap();
        let decoded = abi::postIncomingMessagesCall::abi_decode(&data, true).unwrap();
        assert_eq!(decoded.fromChainName, "Mainnet");
        assert_eq!(decoded.startingCounter, U256::from(5));
        assert_eq!(decoded.messages.len(), 1);
        assert_eq!(decoded.sign.blsSignature, [U256::from(16), U256::from(32)]);
        assert_eq!(decoded.sign.counter, U256::from(4));

        let zero = proxy.encode_post_incoming_messages("Mainnet", 5, &messages, None).unwrap();
        let decoded = abi::postIncomingMessagesCall::abi_decode(&zero, true).unwrap();
        assert_eq!(decoded.sign.hashA, U256::ZERO);
    }
}
