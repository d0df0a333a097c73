//! EIP-712 signing for publish requests
//!
//! A publish request is signed as typed data so the signature is bound to a
//! domain (name, version, chain) and cannot be replayed elsewhere.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip712::{EIP712Domain, Eip712DomainType, TypedData, Types};
use ethers::types::{Address, Signature};
use serde_json::Value;

use crate::error::{ConfigError, PublishError};

pub const SPOT_ACTION: &str = "Publish";
pub const FUTURE_ACTION: &str = "PublishFuture";

/// Domain separator inputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishDomain {
    pub name: String,
    pub version: String,
    pub chain_id: Option<u64>,
}

impl Default for PublishDomain {
    fn default() -> Self {
        Self {
            name: "Pragma".to_string(),
            version: "1".to_string(),
            chain_id: None,
        }
    }
}

impl PublishDomain {
    fn to_eip712(&self) -> EIP712Domain {
        EIP712Domain {
            name: Some(self.name.clone()),
            version: Some(self.version.clone()),
            chain_id: self.chain_id.map(Into::into),
            verifying_contract: None,
            salt: None,
        }
    }
}

fn field(name: &str, ty: &str) -> Eip712DomainType {
    Eip712DomainType {
        name: name.to_string(),
        r#type: ty.to_string(),
    }
}

fn request_types(future: bool) -> Types {
    let entry_type = if future { "FutureEntry" } else { "Entry" };

    let mut entry_fields = vec![
        field("base", "Base"),
        field("pair_id", "string"),
        field("price", "uint256"),
        field("volume", "uint256"),
    ];
    if future {
        entry_fields.push(field("expiration_timestamp", "uint64"));
    }

    let mut types: Types = BTreeMap::new();
    types.insert(
        "Request".to_string(),
        vec![
            field("action", "string"),
            field("entries", &format!("{}[]", entry_type)),
        ],
    );
    types.insert(entry_type.to_string(), entry_fields);
    types.insert(
        "Base".to_string(),
        vec![
            field("publisher", "string"),
            field("source", "string"),
            field("timestamp", "uint64"),
        ],
    );
    types
}

/// Build the typed `Request` over already-serialized entries
pub fn request_typed_data(domain: &PublishDomain, future: bool, entries: Value) -> TypedData {
    let action = if future { FUTURE_ACTION } else { SPOT_ACTION };

    let mut message = BTreeMap::<String, Value>::new();
    message.insert("action".to_string(), Value::String(action.to_string()));
    message.insert("entries".to_string(), entries);

    TypedData {
        domain: domain.to_eip712(),
        types: request_types(future),
        primary_type: "Request".to_string(),
        message,
    }
}

/// `[r, s, v]` as decimal strings
pub fn signature_parts(signature: &Signature) -> Vec<String> {
    vec![
        signature.r.to_string(),
        signature.s.to_string(),
        signature.v.to_string(),
    ]
}

/// Anything that can sign a typed publish request
#[async_trait]
pub trait PublishSigner: Send + Sync {
    fn address(&self) -> Address;

    async fn sign_typed(&self, typed: &TypedData) -> Result<Signature, PublishError>;
}

/// Signs with a local secp256k1 key
pub struct WalletSigner {
    wallet: LocalWallet,
}

impl WalletSigner {
    pub fn from_private_key(private_key: &str) -> Result<Self, ConfigError> {
        let wallet = private_key
            .trim()
            .parse::<LocalWallet>()
            .map_err(|e| ConfigError::InvalidValue {
                field: "PUBLISHER_PRIVATE_KEY",
                reason: e.to_string(),
            })?;
        Ok(Self { wallet })
    }
}

#[async_trait]
impl PublishSigner for WalletSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign_typed(&self, typed: &TypedData) -> Result<Signature, PublishError> {
        self.wallet
            .sign_typed_data(typed)
            .await
            .map_err(|e| PublishError::Signing(e.to_string()))
    }
}
