use alloy::primitives::{Address, U256};
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, error, info, trace, warn};
use crate::{chain_adapter::ChainAdapter, config::PowConfig, Error};
use super::UnsignedTx;

/// 调用外部 PoW 工具：`<bin> <checksum 地址去 0x> <nonce> <gas>`
pub async fn calculate_pow_number(
    binary: &Path,
    address: Address,
    nonce: u64,
    gas_limit: u64,
) -> Result<U256, Error> {
    let checksummed = address.to_checksum(None);
    let address_arg = checksummed.trim_start_matches("0x");
    trace!(
        "Will run PoW-mining command: {} {} {} {}",
        binary.display(),
        address_arg,
        nonce,
        gas_limit
    );
    let output = Command::new(binary)
        .arg(address_arg)
        .arg(nonce.to_string())
        .arg(gas_limit.to_string())
        .output()
        .await?;
    if !output.status.success() {
        return Err(Error::Process(format!(
            "PoW-mining tool exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    parse_pow_number(&String::from_utf8_lossy(&output.stdout))
}

fn parse_pow_number(raw: &str) -> Result<U256, Error> {
    let text: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if text.is_empty() {
        return Err(Error::Process(
            "Failed to compute gas price with PoW-mining, got empty text".to_string(),
        ));
    }
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(&text);
    let value = U256::from_str_radix(digits, 16)
        .map_err(|e| Error::Process(format!("Bad PoW-mining number {}: {}", text, e)))?;
    if value.is_zero() {
        return Err(Error::Process(
            "Failed to compute gas price with PoW-mining, got zero value".to_string(),
        ));
    }
    Ok(value)
}

/// 余额不足以支付 gas 时用 PoW 结果替换 gas 价格，失败时保持交易不变
pub async fn check_transaction_to_schain(
    adapter: &dyn ChainAdapter,
    tx: &mut UnsignedTx,
    config: &PowConfig,
) {
    let required = tx.gas_price.saturating_mul(U256::from(tx.gas_limit));
    let balance = match adapter.balance(tx.from).await {
        Ok(balance) => balance,
        Err(e) => {
            error!("PoW-mining: failed to get balance of {}: {}", tx.from, e);
            return;
        }
    };
    trace!(
        "PoW-mining: sender {} has balance {}, required {}",
        tx.from, balance, required
    );
    if balance >= required {
        debug!(
            "PoW-mining: have sufficient funds for {}, PoW-mining is not needed",
            tx.from
        );
        return;
    }
    let Some(binary) = config.binary.as_deref() else {
        warn!(
            "PoW-mining: insufficient funds for {} but no PoW-mining tool is configured",
            tx.from
        );
        return;
    };
    warn!(
        "PoW-mining: insufficient funds for {}, will run PoW-mining to get {} of gas",
        tx.from, tx.gas_limit
    );
    match calculate_pow_number(binary, tx.from, tx.nonce, tx.gas_limit).await {
        Ok(gas_price) => {
            tx.gas_price = gas_price;
            info!("PoW-mining: gas price of transaction from {} is now {}", tx.from, gas_price);
        }
        Err(e) => error!("PoW-mining error: {}", e),
    }
}
