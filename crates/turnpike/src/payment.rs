use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::reason::ErrorReason;

/// Which authorization protocol a payload uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentProtocol {
    #[serde(rename = "witness-spend")]
    WitnessSpend,
    #[serde(rename = "direct-auth")]
    DirectAuth,
}

impl PaymentProtocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WitnessSpend => "witness-spend",
            Self::DirectAuth => "direct-auth",
        }
    }
}

impl std::fmt::Display for PaymentProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timestamps arrive as JSON numbers from some clients and decimal strings
/// from others. Serialized back out as strings, matching the dominant
/// client format.
mod unix_ts {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        struct TsVisitor;

        impl Visitor<'_> for TsVisitor {
            type Value = u64;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a unix timestamp as integer or decimal string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
                Ok(v)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
                u64::try_from(v).map_err(|_| E::custom("negative timestamp"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
                v.parse().map_err(|_| E::custom("non-numeric timestamp"))
            }
        }

        deserializer.deserialize_any(TsVisitor)
    }
}

/// Wire-format payment payload sent to `/verify` and `/settle`.
///
/// `scheme`, `network`, and `x402_version` are optional on the wire: one
/// client generation nests them here, the other supplies them only in the
/// requirements. [`PaymentPayload::normalize`] reconciles the two.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x402_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    pub payload: ExactPayload,
}

impl PaymentPayload {
    /// Copy `scheme`/`network`/`version` from the requirements (and an
    /// optional top-level version field) into the payload when absent.
    pub fn normalize(&mut self, requirements: &PaymentRequirements, top_level_version: Option<u32>) {
        if self.x402_version.is_none() {
            self.x402_version = top_level_version;
        }
        if self.scheme.is_none() {
            self.scheme = Some(requirements.scheme.clone());
        }
        if self.network.is_none() {
            self.network = Some(requirements.network.clone());
        }
    }
}

/// The client-signed authorization, in one of two shapes.
///
/// Deserialization is shape-detecting: the witness-spend variant is tried
/// first because its `permitted` field is unique to it. Anything that
/// matches neither shape is malformed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExactPayload {
    WitnessSpend(WitnessSpendPayload),
    DirectAuth(DirectAuthPayload),
}

impl ExactPayload {
    pub const fn protocol(&self) -> PaymentProtocol {
        match self {
            Self::WitnessSpend(_) => PaymentProtocol::WitnessSpend,
            Self::DirectAuth(_) => PaymentProtocol::DirectAuth,
        }
    }

    /// The token the authorization spends. Direct-auth payloads carry no
    /// token field of their own; the token is the requirements' asset.
    pub const fn token(&self) -> Option<Address> {
        match self {
            Self::WitnessSpend(p) => Some(p.authorization.permitted.token),
            Self::DirectAuth(_) => None,
        }
    }

    /// The signed amount, as the raw decimal string from the wire.
    pub fn amount(&self) -> &str {
        match self {
            Self::WitnessSpend(p) => &p.authorization.permitted.amount,
            Self::DirectAuth(p) => &p.authorization.value,
        }
    }

    /// The signed receiver of the funds.
    pub const fn receiver(&self) -> Address {
        match self {
            Self::WitnessSpend(p) => p.authorization.witness.receiver,
            Self::DirectAuth(p) => p.authorization.to,
        }
    }

    /// The replay nonce, as the raw wire string (decimal or 0x-hex).
    pub fn nonce(&self) -> &str {
        match self {
            Self::WitnessSpend(p) => &p.authorization.nonce,
            Self::DirectAuth(p) => &p.authorization.nonce,
        }
    }

    pub fn signature(&self) -> &str {
        match self {
            Self::WitnessSpend(p) => &p.signature,
            Self::DirectAuth(p) => &p.signature,
        }
    }
}

/// Permit2 witness-spend payment: a signed `PermitWitnessTransferFrom`
/// plus the authorization parameters that were signed. The payer is not a
/// wire field; it is recovered from the signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WitnessSpendPayload {
    /// EIP-712 signature (0x-hex, 65 bytes for an EOA).
    pub signature: String,
    pub authorization: WitnessSpendAuthorization,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WitnessSpendAuthorization {
    /// Token and amount the signature permits.
    pub permitted: TokenPermission,
    /// The contract (or account) allowed to pull the funds.
    pub spender: Address,
    /// Permit2 unordered nonce, uint256 as a decimal string.
    pub nonce: String,
    /// Signature expiry, unix seconds.
    #[serde(with = "unix_ts")]
    pub deadline: u64,
    pub witness: TransferWitness,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPermission {
    pub token: Address,
    /// Amount in the token's smallest unit, as a decimal string.
    pub amount: String,
}

/// The application witness bound into the Permit2 signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferWitness {
    pub receiver: Address,
    #[serde(with = "unix_ts")]
    pub valid_after: u64,
    #[serde(with = "unix_ts")]
    pub valid_before: u64,
}

/// ERC-3009 direct-auth payment: a signed `transferWithAuthorization`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectAuthPayload {
    pub signature: String,
    pub authorization: DirectAuthAuthorization,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectAuthAuthorization {
    pub from: Address,
    pub to: Address,
    /// Amount in the token's smallest unit, as a decimal string.
    pub value: String,
    #[serde(with = "unix_ts")]
    pub valid_after: u64,
    #[serde(with = "unix_ts")]
    pub valid_before: u64,
    /// 32-byte opaque tag; 0x-hex, or decimal (left-padded to 32 bytes).
    pub nonce: String,
}

/// The resource server's payment offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    /// CAIP-2 identifier or vendor alias.
    pub network: String,
    pub max_amount_required: String,
    /// URL of the resource being paid for.
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub pay_to: Address,
    /// Token contract. `token` is accepted as an alias for `asset`.
    #[serde(alias = "token")]
    pub asset: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<RequirementsExtra>,
}

/// Optional requirement extensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequirementsExtra {
    /// Overrides the ultimate recipient when `payTo` is a splitter contract.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_recipient: Option<Address>,
    /// EIP-712 domain name override for direct-auth tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// EIP-712 domain version override for direct-auth tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Parse a bounded amount: a non-empty decimal integer, at least 1 and
/// strictly below 2^256. Overflow is rejected by `U256` parsing itself.
pub fn parse_amount(s: &str) -> Result<U256, ErrorReason> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ErrorReason::InvalidAuthorizationValue);
    }
    let value = U256::from_str_radix(s, 10).map_err(|_| ErrorReason::InvalidAuthorizationValue)?;
    if value.is_zero() {
        return Err(ErrorReason::InvalidAuthorizationValue);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn witness_payload_json() -> serde_json::Value {
        serde_json::json!({
            "signature": "0xabcd",
            "authorization": {
                "permitted": {
                    "token": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
                    "amount": "1000000"
                },
                "spender": "0x4020615294c913F045dc10f0a5cdEbd86c280001",
                "nonce": "42",
                "deadline": "1893456000",
                "witness": {
                    "receiver": "0x1111111111111111111111111111111111111111",
                    "validAfter": "0",
                    "validBefore": "1893456000"
                }
            }
        })
    }

    fn direct_auth_payload_json() -> serde_json::Value {
        serde_json::json!({
            "signature": "0xabcd",
            "authorization": {
                "from": "0x2222222222222222222222222222222222222222",
                "to": "0x1111111111111111111111111111111111111111",
                "value": "1000000",
                "validAfter": 0,
                "validBefore": 1893456000u64,
                "nonce": "0x0101010101010101010101010101010101010101010101010101010101010101"
            }
        })
    }

    #[test]
    fn test_shape_detection_witness_spend() {
        let payload: ExactPayload = serde_json::from_value(witness_payload_json()).unwrap();
        assert_eq!(payload.protocol(), PaymentProtocol::WitnessSpend);
        assert_eq!(payload.amount(), "1000000");
    }

    #[test]
    fn test_shape_detection_direct_auth() {
        let payload: ExactPayload = serde_json::from_value(direct_auth_payload_json()).unwrap();
        assert_eq!(payload.protocol(), PaymentProtocol::DirectAuth);
        assert_eq!(payload.amount(), "1000000");
    }

    #[test]
    fn test_malformed_payload_rejected() {
        let malformed = serde_json::json!({
            "signature": "0xabcd",
            "authorization": { "something": "else" }
        });
        assert!(serde_json::from_value::<ExactPayload>(malformed).is_err());
    }

    #[test]
    fn test_timestamps_accept_numbers_and_strings() {
        // direct_auth fixture uses numbers, witness fixture uses strings
        let a: ExactPayload = serde_json::from_value(witness_payload_json()).unwrap();
        let b: ExactPayload = serde_json::from_value(direct_auth_payload_json()).unwrap();
        match (a, b) {
            (ExactPayload::WitnessSpend(w), ExactPayload::DirectAuth(d)) => {
                assert_eq!(w.authorization.witness.valid_before, 1893456000);
                assert_eq!(d.authorization.valid_before, 1893456000);
            }
            _ => panic!("wrong shapes"),
        }
    }

    #[test]
    fn test_normalize_fills_missing_fields() {
        let mut payload = PaymentPayload {
            x402_version: None,
            scheme: None,
            network: None,
            payload: serde_json::from_value(direct_auth_payload_json()).unwrap(),
        };
        let requirements: PaymentRequirements = serde_json::from_value(serde_json::json!({
            "scheme": "exact",
            "network": "eip155:8453",
            "maxAmountRequired": "1000000",
            "resource": "https://api.example.com/data",
            "payTo": "0x1111111111111111111111111111111111111111",
            "asset": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"
        }))
        .unwrap();

        payload.normalize(&requirements, Some(2));
        assert_eq!(payload.scheme.as_deref(), Some("exact"));
        assert_eq!(payload.network.as_deref(), Some("eip155:8453"));
        assert_eq!(payload.x402_version, Some(2));
    }

    #[test]
    fn test_requirements_token_alias() {
        let requirements: PaymentRequirements = serde_json::from_value(serde_json::json!({
            "scheme": "exact",
            "network": "base",
            "maxAmountRequired": "5",
            "resource": "https://api.example.com",
            "payTo": "0x1111111111111111111111111111111111111111",
            "token": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"
        }))
        .unwrap();
        assert_eq!(
            format!("{:#x}", requirements.asset),
            "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913"
        );
    }

    #[test]
    fn test_parse_amount_bounds() {
        assert!(parse_amount("1").is_ok());
        // 2^256 - 1
        let max = U256::MAX.to_string();
        assert!(parse_amount(&max).is_ok());

        assert!(parse_amount("0").is_err());
        assert!(parse_amount("").is_err());
        assert!(parse_amount("-5").is_err());
        assert!(parse_amount("1.5").is_err());
        assert!(parse_amount("0x10").is_err());
        // 2^256
        let over = "115792089237316195423570985008687907853269984665640564039457584007913129639936";
        assert!(parse_amount(over).is_err());
    }
}
