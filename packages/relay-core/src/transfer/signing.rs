use async_trait::async_trait;
use std::sync::Arc;
use crate::{
    config::SigningConfig,
    types::{Direction, GlueResult, Message},
    Error,
};

/// 交给外部门限签名步骤的一批消息
#[derive(Debug, Clone, PartialEq)]
pub struct SignRequest {
    pub loop_counter: u64,
    pub direction: Direction,
    pub start_index: u64,
    pub src_chain: String,
    pub dst_chain: String,
    pub messages: Vec<Message>,
}

/// 签名结果，messages 会替换引擎收集到的批次
#[derive(Debug, Clone, PartialEq)]
pub struct SignedBatch {
    pub messages: Vec<Message>,
    pub glue: Option<GlueResult>,
}

/// 消息批次签名接口，BLS 聚合由实现方负责
#[async_trait]
pub trait MessageSigner: Send + Sync {
    async fn sign_messages(&self, request: SignRequest) -> Result<SignedBatch, Error>;
}

/// 未配置签名时使用，原样返回消息且不带签名
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentitySigner;

#[async_trait]
impl MessageSigner for IdentitySigner {
    async fn sign_messages(&self, request: SignRequest) -> Result<SignedBatch, Error> {
        Ok(SignedBatch {
            messages: request.messages,
            glue: None,
        })
    }
}

/// 按配置选择内置签名实现
///
/// BLS 签名由外部组件提供，开启签名时调用方需要自行注入 [`MessageSigner`]。
pub fn builtin_message_signer(config: &SigningConfig) -> Result<Arc<dyn MessageSigner>, Error> {
    if config.enabled {
        return Err(Error::Config(
            "Message signing is enabled but no BLS signer is linked into this build".to_string(),
        ));
    }
    Ok(Arc::new(IdentitySigner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, Bytes};

    #[tokio::test]
    async fn test_identity_signer_keeps_messages() {
        let message = Message {
            sender: Address::repeat_byte(1),
            destination_contract: Address::repeat_byte(2),
            to: None,
            amount: None,
            data: Bytes::from_static(b"payload"),
            source_block_hint: Some(3),
        };
        let signer = builtin_message_signer(&SigningConfig::default()).unwrap();
        let signed = signer
            .sign_messages(SignRequest {
                loop_counter: 1,
                direction: Direction::M2S,
                start_index: 0,
                src_chain: "Mainnet".to_string(),
                dst_chain: "chain1".to_string(),
                messages: vec![message.clone()],
            })
            .await
            .unwrap();
        assert_eq!(signed.messages, vec![message]);
        assert!(signed.glue.is_none());
    }

    #[test]
    fn test_enabled_signing_needs_external_signer() {
        let err = builtin_message_signer(&SigningConfig { enabled: true }).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
