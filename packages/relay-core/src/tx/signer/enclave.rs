use alloy::primitives::Address;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, trace};
use crate::{
    chain_adapter::ChainAdapter,
    config::{AccountConfig, AccountKind},
    types::TxReceipt,
    Error,
};
use super::{TxSigner, UnsignedTx};

/// 通过外部签名进程调用远程飞地钱包
#[derive(Debug, Clone)]
pub struct EnclaveSigner {
    address: Address,
    wallet_url: String,
    key_name: String,
    cert_path: PathBuf,
    key_path: PathBuf,
    signer_binary: PathBuf,
}

impl EnclaveSigner {
    pub fn from_config(account: &AccountConfig) -> Result<Self, Error> {
        match account {
            AccountConfig::RemoteEnclave {
                address,
                wallet_url,
                key_name,
                cert_path,
                key_path,
                signer_binary,
            } => Ok(Self {
                address: *address,
                wallet_url: wallet_url.clone(),
                key_name: key_name.clone(),
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
                signer_binary: signer_binary.clone(),
            }),
            _ => Err(Error::Config("Account is not a remote enclave account".to_string())),
        }
    }

    /// 12 个位置参数，顺序固定
    pub fn command_args(&self, chain_url: &str, tx: &UnsignedTx) -> Vec<String> {
        vec![
            self.wallet_url.clone(),
            self.key_name.clone(),
            chain_url.to_string(),
            tx.chain_id.to_string(),
            format!("0x{}", hex::encode(&tx.data)),
            tx.to.to_string(),
            tx.value.to_string(),
            tx.gas_price.to_string(),
            tx.gas_limit.to_string(),
            tx.nonce.to_string(),
            self.cert_path.display().to_string(),
            self.key_path.display().to_string(),
        ]
    }
}

/// 取标准输出中最后一个 JSON 对象行
fn parse_signer_output(stdout: &str) -> Result<TxReceipt, Error> {
    let line = stdout
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .last()
        .ok_or_else(|| Error::Signing("External signer printed no JSON".to_string()))?;
    let value: serde_json::Value = serde_json::from_str(line)?;
    if let Some(error) = value.get("error") {
        return Err(Error::Signing(format!("External signer error: {}", error)));
    }
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl TxSigner for EnclaveSigner {
    fn kind(&self) -> AccountKind {
        AccountKind::RemoteEnclave
    }

    fn address(&self) -> Address {
        self.address
    }

    async fn sign_and_send(
        &self,
        adapter: &dyn ChainAdapter,
        tx: &UnsignedTx,
    ) -> Result<Option<TxReceipt>, Error> {
        let args = self.command_args(adapter.url(), tx);
        debug!(
            "Running external signer {} for key {}",
            self.signer_binary.display(),
            self.key_name
        );
        let output = Command::new(&self.signer_binary)
            .args(&args)
            .env_clear()
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        trace!("Result from external signer is: {}", stdout);
        if !output.status.success() {
            return Err(Error::Process(format!(
                "External signer exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_signer_output(&stdout).map(Some)
    }
}
