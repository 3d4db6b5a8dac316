use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::primitives::{Address, Bytes, TxKind};
use alloy::signers::{local::PrivateKeySigner, SignerSync};
use async_trait::async_trait;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, trace};
use crate::{chain_adapter::ChainAdapter, config::AccountKind, types::TxReceipt, Error};
use super::{TxSigner, UnsignedTx};

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const RECEIPT_POLL_ATTEMPTS: usize = 120;

/// 本地私钥签名
pub struct DirectSigner {
    signer: PrivateKeySigner,
    poll_interval: Duration,
    poll_attempts: usize,
}

impl DirectSigner {
    pub fn from_private_key(private_key: &str) -> Result<Self, Error> {
        let key = private_key.trim();
        let key = key.strip_prefix("0x").unwrap_or(key);
        let signer = PrivateKeySigner::from_str(key)
            .map_err(|e| Error::Config(format!("Invalid private key: {}", e)))?;
        Ok(Self {
            signer,
            poll_interval: RECEIPT_POLL_INTERVAL,
            poll_attempts: RECEIPT_POLL_ATTEMPTS,
        })
    }

    pub fn with_receipt_polling(mut self, interval: Duration, attempts: usize) -> Self {
        self.poll_interval = interval;
        self.poll_attempts = attempts.max(1);
        self
    }

    /// 签名并编码为 EIP-2718 字节
    pub fn sign_raw(&self, tx: &UnsignedTx) -> Result<Bytes, Error> {
        let gas_price = u128::try_from(tx.gas_price)
            .map_err(|_| Error::Signing(format!("Gas price {} is too large", tx.gas_price)))?;
        let legacy = TxLegacy {
            chain_id: Some(tx.chain_id),
            nonce: tx.nonce,
            gas_price,
            gas_limit: tx.gas_limit,
            to: TxKind::Call(tx.to),
            value: tx.value,
            input: tx.data.clone(),
        };
        let signature = self
            .signer
            .sign_hash_sync(&legacy.signature_hash())
            .map_err(|e| Error::Signing(e.to_string()))?;
        let envelope = TxEnvelope::from(legacy.into_signed(signature));
        Ok(envelope.encoded_2718().into())
    }
}

#[async_trait]
impl TxSigner for DirectSigner {
    fn kind(&self) -> AccountKind {
        AccountKind::DirectKey
    }

    fn address(&self) -> Address {
        self.signer.address()
    }

    async fn sign_and_send(
        &self,
        adapter: &dyn ChainAdapter,
        tx: &UnsignedTx,
    ) -> Result<Option<TxReceipt>, Error> {
        let raw = self.sign_raw(tx)?;
        trace!("Signed transaction: {}", raw);
        let hash = adapter.send_raw_transaction(raw).await?;
        debug!("Raw-sent transaction {}", hash);

        for _ in 0..self.poll_attempts {
            if let Some(receipt) = adapter.transaction_receipt(hash).await? {
                return Ok(Some(receipt));
            }
            sleep(self.poll_interval).await;
        }
        Err(Error::Chain(format!("Timed out waiting for receipt of {}", hash)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_adapter::MockChainAdapter;
    use alloy::primitives::{keccak256, U256, U64};

    const KEY: &str = "0x23abdbd3c61b5330af61ebe8bef582f4e5cc08e554053a718bdce7813b9dc1fc";

    fn tx() -> UnsignedTx {
        UnsignedTx {
            from: Address::ZERO,
            to: Address::repeat_byte(9),
            data: Bytes::from(vec![1]),
            value: U256::ZERO,
            gas_price: U256::from(1_000_000_000u64),
            gas_limit: 100_000,
            nonce: 0,
            chain_id: 1234,
        }
    }

    #[test]
    fn test_invalid_key() {
        assert!(matches!(DirectSigner::from_private_key("0xnothex"), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_sign_send_and_poll_receipt() {
        let signer = DirectSigner::from_private_key(KEY)
            .unwrap()
            .with_receipt_polling(Duration::ZERO, 3);
        let raw = signer.sign_raw(&tx()).unwrap();
        let expected_hash = keccak256(&raw);

        let mut adapter = MockChainAdapter::new();
        adapter
            .expect_send_raw_transaction()
            .withf(move |bytes| *bytes == raw)
            .returning(move |_| Ok(expected_hash));
        let mut polls = 0;
        adapter.expect_transaction_receipt().times(2).returning(move |h| {
            polls += 1;
            if polls < 2 {
                return Ok(None);
            }
            Ok(Some(TxReceipt {
                transaction_hash: h,
                block_number: Some(U64::from(3)),
                status: Some(U64::from(1)),
                gas_used: None,
                cumulative_gas_used: U256::from(21_000),
                effective_gas_price: None,
                logs: vec![],
            }))
        });

        let receipt = signer.sign_and_send(&adapter, &tx()).await.unwrap().unwrap();
        assert_eq!(receipt.transaction_hash, expected_hash);
    }
}
