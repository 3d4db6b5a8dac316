use alloy::primitives::{utils::format_ether, Address, Bytes, U256, U64};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use crate::{
    chain_adapter::{BlockTag, CallRequest, ChainAdapter},
    config::{DryRunConfig, PowConfig},
    types::TxReceipt,
    Error,
};

pub mod customizer;
pub mod dry_run;
pub mod pow;
pub mod signer;

pub use customizer::TransactionCustomizer;
pub use signer::{build_signer, TxSigner};

/// 待签名交易
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedTx {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas_price: U256,
    pub gas_limit: u64,
    pub nonce: u64,
    pub chain_id: u64,
}

impl UnsignedTx {
    pub fn to_call_request(&self) -> CallRequest {
        CallRequest {
            from: Some(self.from),
            to: self.to,
            data: self.data.clone(),
            value: Some(self.value),
            gas: Some(U64::from(self.gas_limit)),
            gas_price: Some(self.gas_price),
        }
    }
}

/// 一次合约调用的描述，gas 参数由调用方事先算好
#[derive(Debug, Clone)]
pub struct ContractCall {
    /// 形如 MessageProxy.postIncomingMessages，用于日志
    pub description: String,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas_price: U256,
    pub gas_limit: u64,
}

impl ContractCall {
    pub fn to_call_request(&self, from: Address) -> CallRequest {
        CallRequest {
            from: Some(from),
            to: self.to,
            data: self.data.clone(),
            value: if self.value.is_zero() { None } else { Some(self.value) },
            gas: Some(U64::from(self.gas_limit)),
            gas_price: Some(self.gas_price),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostSummary {
    pub gas_spent: U256,
    pub eth_spent: String,
}

impl CostSummary {
    pub fn new(gas_spent: U256, gas_price: U256) -> Self {
        Self {
            gas_spent,
            eth_spent: format_ether(gas_spent.saturating_mul(gas_price)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayedReceipt {
    pub receipt: TxReceipt,
    pub summary: CostSummary,
}

/// 某条链上、某个账户的交易提交入口
pub struct TxSubmitter {
    adapter: Arc<dyn ChainAdapter>,
    signer: Arc<dyn TxSigner>,
    customizer: TransactionCustomizer,
    dry_run: DryRunConfig,
    pow: PowConfig,
}

impl TxSubmitter {
    pub fn new(
        adapter: Arc<dyn ChainAdapter>,
        signer: Arc<dyn TxSigner>,
        customizer: TransactionCustomizer,
        dry_run: DryRunConfig,
        pow: PowConfig,
    ) -> Self {
        Self {
            adapter,
            signer,
            customizer,
            dry_run,
            pow,
        }
    }

    pub fn adapter(&self) -> &Arc<dyn ChainAdapter> {
        &self.adapter
    }

    pub fn customizer(&self) -> &TransactionCustomizer {
        &self.customizer
    }

    pub fn from_address(&self) -> Address {
        self.signer.address()
    }

    /// 模拟执行，返回 Some(错误信息) 表示调用会失败
    pub async fn dry_run(&self, call: &ContractCall) -> Result<Option<String>, Error> {
        let request = call.to_call_request(self.signer.address());
        dry_run::dry_run_call(self.adapter.as_ref(), &self.dry_run, &request, &call.description).await
    }

    async fn prepare(&self, call: &ContractCall, check_pow: bool) -> Result<UnsignedTx, Error> {
        let from = self.signer.address();
        let nonce = self.adapter.transaction_count(from, BlockTag::Pending).await?;
        let chain_id = self.adapter.chain_id().await?;
        let mut tx = UnsignedTx {
            from,
            to: call.to,
            data: call.data.clone(),
            value: call.value,
            gas_price: call.gas_price,
            gas_limit: call.gas_limit,
            nonce,
            chain_id,
        };
        if check_pow {
            pow::check_transaction_to_schain(self.adapter.as_ref(), &mut tx, &self.pow).await;
        }
        trace!("Populated transaction for {}: {:?}", call.description, tx);
        Ok(tx)
    }

    /// 签名、发送并等待回执
    pub async fn payed_call(&self, call: &ContractCall, check_pow: bool) -> Result<PayedReceipt, Error> {
        debug!(
            "Payed call {} via {:?} signer from {}",
            call.description,
            self.signer.kind(),
            self.signer.address()
        );
        let tx = self.prepare(call, check_pow).await?;
        let receipt = self
            .signer
            .sign_and_send(self.adapter.as_ref(), &tx)
            .await
            .map_err(|e| {
                Error::Chain(format!(
                    "Transaction sign and send error invoking {}, error is: {}",
                    call.description, e
                ))
            })?
            .ok_or_else(|| Error::Chain(format!("No receipt for {}", call.description)))?;

        let summary = CostSummary::new(receipt.cumulative_gas_used, tx.gas_price);
        info!(
            "Done, {} was {:?}-signed-and-sent as {}, gas spent {}, ETH spent {}",
            call.description,
            self.signer.kind(),
            receipt.transaction_hash,
            summary.gas_spent,
            summary.eth_spent
        );
        if !receipt.succeeded() {
            warn!("Transaction {} has failed status", receipt.transaction_hash);
        }
        Ok(PayedReceipt { receipt, summary })
    }
}
