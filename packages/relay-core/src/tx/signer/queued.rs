use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use rand::Rng;
use redis::Commands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, trace};
use crate::{
    chain_adapter::ChainAdapter,
    config::AccountKind,
    types::TxReceipt,
    unix_now, Error,
};
use super::{TxSigner, UnsignedTx};

/// 交易管理器读取的有序集合
pub const TRANSACTION_POOL: &str = "transactions";

/// 记录保留一天
const RECORD_TTL_SECONDS: u64 = 24 * 60 * 60;

const RECEIPT_ATTEMPTS: usize = 10;

/// 共享队列存储
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// 写入记录并加入交易池
    async fn push(&self, id: &str, record: &str, score: u64, ttl_seconds: u64) -> Result<(), Error>;

    async fn get(&self, id: &str) -> Result<Option<String>, Error>;
}

/// 基于 redis 的队列存储，同步客户端放在阻塞线程池里执行
#[derive(Debug, Clone)]
pub struct RedisQueue {
    client: redis::Client,
}

impl RedisQueue {
    pub fn open(url: &str) -> Result<Self, Error> {
        Ok(Self {
            client: redis::Client::open(url)?,
        })
    }
}

#[async_trait]
impl QueueStore for RedisQueue {
    async fn push(&self, id: &str, record: &str, score: u64, ttl_seconds: u64) -> Result<(), Error> {
        let client = self.client.clone();
        let id = id.to_string();
        let record = record.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let mut conn = client.get_connection()?;
            redis::pipe()
                .atomic()
                .set_ex(&id, record, ttl_seconds)
                .ignore()
                .zadd(TRANSACTION_POOL, &id, score)
                .ignore()
                .query::<()>(&mut conn)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Queue(format!("Queue push task failed: {}", e)))?
    }

    async fn get(&self, id: &str) -> Result<Option<String>, Error> {
        let client = self.client.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<String>, Error> {
            let mut conn = client.get_connection()?;
            let value: Option<String> = conn.get(&id)?;
            Ok(value)
        })
        .await
        .map_err(|e| Error::Queue(format!("Queue get task failed: {}", e)))?
    }
}

/// 交易管理器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxStatus {
    Proposed,
    Success,
    Failed,
    Dropped,
    #[serde(other)]
    Unknown,
}

impl TxStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, TxStatus::Success | TxStatus::Failed | TxStatus::Dropped)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProposedRecord<'a> {
    score: u64,
    status: TxStatus,
    from: Address,
    to: Address,
    data: &'a Bytes,
    value: U256,
    gas_price: U256,
    nonce: u64,
    chain_id: u64,
}

#[derive(Debug, Deserialize)]
struct ManagerRecord {
    status: TxStatus,
    #[serde(default)]
    tx_hash: Option<B256>,
}

/// 轮询与重试节奏
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTiming {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub retry_sleep: Duration,
}

impl Default for QueueTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_wait: Duration::from_secs(36_000),
            retry_sleep: Duration::from_secs(30),
        }
    }
}

pub fn make_id() -> String {
    let mut rng = rand::thread_rng();
    let unique: String = (0..16)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect();
    format!("tx-{}js", unique)
}

/// priority * 10^len(ts) + ts，同优先级下越新的分数越高
pub fn make_score(priority: u64, ts: u64) -> u64 {
    let digits = ts.to_string().len() as u32;
    priority
        .saturating_mul(10u64.saturating_pow(digits))
        .saturating_add(ts)
}

/// 把交易交给外部交易管理器签名发送
pub struct QueuedSigner {
    address: Address,
    store: Arc<dyn QueueStore>,
    priority: u64,
    attempts: u32,
    timing: QueueTiming,
}

impl QueuedSigner {
    pub fn new(address: Address, store: Arc<dyn QueueStore>, priority: u64, attempts: u32) -> Self {
        Self {
            address,
            store,
            priority,
            attempts: attempts.max(1),
            timing: QueueTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: QueueTiming) -> Self {
        self.timing = timing;
        self
    }

    async fn send(&self, tx: &UnsignedTx) -> Result<String, Error> {
        let id = make_id();
        let score = make_score(self.priority, unix_now());
        let record = serde_json::to_string(&ProposedRecord {
            score,
            status: TxStatus::Proposed,
            from: tx.from,
            to: tx.to,
            data: &tx.data,
            value: tx.value,
            gas_price: tx.gas_price,
            nonce: tx.nonce,
            chain_id: tx.chain_id,
        })?;
        trace!("TM - sending score {}, record {}", score, record);
        self.store.push(&id, &record, score, RECORD_TTL_SECONDS).await?;
        Ok(id)
    }

    async fn record(&self, id: &str) -> Result<Option<ManagerRecord>, Error> {
        match self.store.get(id).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn wait(&self, adapter: &dyn ChainAdapter, id: &str) -> Result<Option<TxReceipt>, Error> {
        debug!(
            "TM - will wait TX {} to complete for {} second(s) maximum",
            id,
            self.timing.max_wait.as_secs()
        );
        let started = Instant::now();
        let record = loop {
            let record = match self.record(id).await {
                Ok(record) => record,
                Err(e) => {
                    error!("TM - failed to read status of TX {}, will poll again: {}", id, e);
                    None
                }
            };
            let finished = record.as_ref().map(|r| r.status.is_finished()).unwrap_or(false);
            if finished || started.elapsed() >= self.timing.max_wait {
                break record;
            }
            sleep(self.timing.poll_interval).await;
        };

        let Some(record) = record else {
            error!("TM - TX {} status is NULL RECORD", id);
            return Ok(None);
        };
        if !record.status.is_finished() || record.status == TxStatus::Dropped {
            error!("TM - TX {} was unsuccessful with status {:?}, wait failed", id, record.status);
            return Ok(None);
        }
        let Some(hash) = record.tx_hash else {
            error!("TM - TX {} finished without transaction hash", id);
            return Ok(None);
        };
        self.fetch_receipt(adapter, hash).await
    }

    async fn fetch_receipt(&self, adapter: &dyn ChainAdapter, hash: B256) -> Result<Option<TxReceipt>, Error> {
        for attempt in 1..=RECEIPT_ATTEMPTS {
            match adapter.transaction_receipt(hash).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) => {
                    error!(
                        "TM - failed to fetch receipt of {}, attempt {} of {}: {}",
                        hash, attempt, RECEIPT_ATTEMPTS, e
                    );
                    sleep(self.timing.poll_interval).await;
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl TxSigner for QueuedSigner {
    fn kind(&self) -> AccountKind {
        AccountKind::QueuedManager
    }

    fn address(&self) -> Address {
        self.address
    }

    async fn sign_and_send(
        &self,
        adapter: &dyn ChainAdapter,
        tx: &UnsignedTx,
    ) -> Result<Option<TxReceipt>, Error> {
        let mut last_id = String::new();
        for attempt in 1..=self.attempts {
            let id = self.send(tx).await?;
            debug!("TM - next TX {}", id);
            if let Some(receipt) = self.wait(adapter, &id).await? {
                info!("TM - successful TX {}, sending attempt {} of {}", id, attempt, self.attempts);
                return Ok(Some(receipt));
            }
            error!("TM - unsuccessful TX {} sending attempt {} of {}", id, attempt, self.attempts);
            last_id = id;
            if attempt < self.attempts {
                sleep(self.timing.retry_sleep).await;
            }
        }
        Err(Error::Queue(format!("TM unsuccessful transaction {}", last_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_adapter::MockChainAdapter;
    use alloy::primitives::U64;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// 内存队列，push 后立即按预设状态“完成”交易
    #[derive(Default)]
    struct MemoryQueue {
        records: Mutex<HashMap<String, String>>,
        pool: Mutex<Vec<(u64, String)>>,
        complete_with: Option<(&'static str, B256)>,
        /// 前若干次读取返回错误
        failing_reads: AtomicUsize,
    }

    #[async_trait]
    impl QueueStore for MemoryQueue {
        async fn push(&self, id: &str, record: &str, score: u64, _ttl_seconds: u64) -> Result<(), Error> {
            let stored = match self.complete_with {
                Some((status, hash)) => {
                    serde_json::json!({ "status": status, "tx_hash": hash }).to_string()
                }
                None => record.to_string(),
            };
            self.records.lock().unwrap().insert(id.to_string(), stored);
            self.pool.lock().unwrap().push((score, id.to_string()));
            Ok(())
        }

        async fn get(&self, id: &str) -> Result<Option<String>, Error> {
            if self
                .failing_reads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Queue("connection reset by peer".to_string()));
            }
            Ok(self.records.lock().unwrap().get(id).cloned())
        }
    }

    fn fast() -> QueueTiming {
        QueueTiming {
            poll_interval: Duration::from_millis(1),
            max_wait: Duration::from_millis(20),
            retry_sleep: Duration::ZERO,
        }
    }

    fn tx() -> UnsignedTx {
        UnsignedTx {
            from: Address::repeat_byte(1),
            to: Address::repeat_byte(2),
            data: Bytes::from(vec![0xde, 0xad]),
            value: U256::ZERO,
            gas_price: U256::from(1_000_000_000u64),
            gas_limit: 500_000,
            nonce: 4,
            chain_id: 1234,
        }
    }

    #[test]
    fn test_make_id_and_score() {
        let id = make_id();
        assert!(id.starts_with("tx-") && id.ends_with("js"));
        assert_eq!(id.len(), 3 + 16 + 2);

        assert_eq!(make_score(5, 1_700_000_000), 5 * 10_000_000_000 + 1_700_000_000);
        assert!(make_score(6, 1_700_000_000) > make_score(5, 1_799_999_999));
    }

    #[tokio::test]
    async fn test_success_fetches_receipt() {
        let hash = B256::repeat_byte(0x42);
        let store = Arc::new(MemoryQueue {
            complete_with: Some(("SUCCESS", hash)),
            ..Default::default()
        });
        let mut adapter = MockChainAdapter::new();
        adapter
            .expect_transaction_receipt()
            .withf(move |h| *h == hash)
            .returning(move |h| {
                Ok(Some(TxReceipt {
                    transaction_hash: h,
                    block_number: Some(U64::from(9)),
                    status: Some(U64::from(1)),
                    gas_used: None,
                    cumulative_gas_used: U256::from(1),
                    effective_gas_price: None,
                    logs: vec![],
                }))
            });

        let signer = QueuedSigner::new(Address::repeat_byte(1), store.clone(), 5, 1).with_timing(fast());
        let receipt = signer.sign_and_send(&adapter, &tx()).await.unwrap().unwrap();
        assert_eq!(receipt.transaction_hash, hash);
        assert_eq!(store.pool.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_read_error_keeps_polling() {
        let hash = B256::repeat_byte(0x43);
        let store = Arc::new(MemoryQueue {
            complete_with: Some(("SUCCESS", hash)),
            failing_reads: AtomicUsize::new(3),
            ..Default::default()
        });
        let mut adapter = MockChainAdapter::new();
        adapter.expect_transaction_receipt().times(1).returning(move |h| {
            Ok(Some(TxReceipt {
                transaction_hash: h,
                block_number: Some(U64::from(9)),
                status: Some(U64::from(1)),
                gas_used: None,
                cumulative_gas_used: U256::from(1),
                effective_gas_price: None,
                logs: vec![],
            }))
        });

        let timing = QueueTiming {
            max_wait: Duration::from_secs(5),
            ..fast()
        };
        let signer = QueuedSigner::new(Address::repeat_byte(1), store.clone(), 5, 1).with_timing(timing);
        let receipt = signer.sign_and_send(&adapter, &tx()).await.unwrap().unwrap();
        assert_eq!(receipt.transaction_hash, hash);
        assert_eq!(store.failing_reads.load(Ordering::SeqCst), 0);
        assert_eq!(store.pool.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_exhausts_attempts() {
        let store = Arc::new(MemoryQueue {
            complete_with: Some(("DROPPED", B256::ZERO)),
            ..Default::default()
        });
        let adapter = MockChainAdapter::new();

        let signer = QueuedSigner::new(Address::repeat_byte(1), store.clone(), 5, 2).with_timing(fast());
        let err = signer.sign_and_send(&adapter, &tx()).await.unwrap_err();
        assert!(matches!(err, Error::Queue(_)));
        assert_eq!(store.pool.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_proposed_record_times_out() {
        let store = Arc::new(MemoryQueue::default());
        let adapter = MockChainAdapter::new();

        let signer = QueuedSigner::new(Address::repeat_byte(1), store.clone(), 5, 1).with_timing(fast());
        assert!(signer.sign_and_send(&adapter, &tx()).await.is_err());

        // 写入的记录不含 gas 上限
        let records = store.records.lock().unwrap();
        let record: serde_json::Value = serde_json::from_str(records.values().next().unwrap()).unwrap();
        assert_eq!(record["status"], "PROPOSED");
        assert_eq!(record["nonce"], 4);
        assert_eq!(record["chainId"], 1234);
        assert!(record.get("gasLimit").is_none());
    }
}
