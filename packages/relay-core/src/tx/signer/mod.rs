use alloy::primitives::Address;
use async_trait::async_trait;
use std::sync::Arc;
use crate::{
    chain_adapter::ChainAdapter,
    config::{AccountConfig, AccountKind},
    types::TxReceipt,
    Error,
};
use super::UnsignedTx;

pub mod direct;
pub mod enclave;
pub mod queued;

pub use direct::DirectSigner;
pub use enclave::EnclaveSigner;
pub use queued::{QueueStore, QueuedSigner, RedisQueue};

/// 签名后端，负责把交易送上链并返回回执
#[async_trait]
pub trait TxSigner: Send + Sync {
    fn kind(&self) -> AccountKind;

    /// 发送方地址
    fn address(&self) -> Address;

    /// 返回 Ok(None) 表示交易被丢弃或等待超时
    async fn sign_and_send(
        &self,
        adapter: &dyn ChainAdapter,
        tx: &UnsignedTx,
    ) -> Result<Option<TxReceipt>, Error>;
}

/// 按账户配置选择签名后端
pub fn build_signer(account: &AccountConfig) -> Result<Arc<dyn TxSigner>, Error> {
    match (account.classify(), account) {
        (
            AccountKind::QueuedManager,
            AccountConfig::QueuedManager {
                address,
                redis_url,
                priority,
                attempts,
            },
        ) => {
            let store = RedisQueue::open(redis_url)?;
            Ok(Arc::new(QueuedSigner::new(
                *address,
                Arc::new(store),
                *priority,
                *attempts,
            )))
        }
        (AccountKind::RemoteEnclave, AccountConfig::RemoteEnclave { .. }) => {
            Ok(Arc::new(EnclaveSigner::from_config(account)?))
        }
        (AccountKind::DirectKey, AccountConfig::Direct { private_key }) => {
            Ok(Arc::new(DirectSigner::from_private_key(private_key)?))
        }
        _ => Err(Error::Config(
            "Bad credentials information specified, no explicit SGX, no explicit private key, no explicit queue store URL"
                .to_string(),
        )),
    }
}
