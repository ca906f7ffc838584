//! Typed-data construction and signer recovery for both authorization
//! protocols. Recovery is pure: the same inputs always yield the same
//! address, and the recovered address (lowercased) is the authoritative
//! payer identity.

use alloy::primitives::{Address, FixedBytes, Signature, B256, U256};
use alloy::sol_types::{Eip712Domain, SolStruct};

use crate::constants::PERMIT2_ADDRESS;
use crate::error::FacilitatorError;
use crate::payment::{DirectAuthAuthorization, WitnessSpendAuthorization};
use crate::{
    PermitWitnessTransferFrom, TokenPermissions, TransferWithAuthorization, X402TransferDetails,
};

/// The witness-spend EIP-712 domain. Permit2 publishes no `version` field.
pub fn permit2_domain(chain_id: u64) -> Eip712Domain {
    Eip712Domain {
        name: Some(std::borrow::Cow::Borrowed("Permit2")),
        version: None,
        chain_id: Some(U256::from(chain_id)),
        verifying_contract: Some(PERMIT2_ADDRESS),
        salt: None,
    }
}

/// The direct-auth EIP-712 domain. Name and version are token-specific
/// (e.g. "USD Coin" / "2"); the verifying contract is the token itself.
pub fn token_domain(name: &str, version: &str, chain_id: u64, token: Address) -> Eip712Domain {
    Eip712Domain {
        name: Some(std::borrow::Cow::Owned(name.to_string())),
        version: Some(std::borrow::Cow::Owned(version.to_string())),
        chain_id: Some(U256::from(chain_id)),
        verifying_contract: Some(token),
        salt: None,
    }
}

/// Decode a 0x-prefixed hex signature.
pub fn parse_signature(hex: &str) -> Result<Vec<u8>, FacilitatorError> {
    alloy::hex::decode(hex.strip_prefix("0x").unwrap_or(hex))
        .map_err(|e| FacilitatorError::Signature(format!("invalid hex signature: {e}")))
}

/// Parse a uint256 wire string (decimal).
pub fn parse_u256(s: &str) -> Result<U256, FacilitatorError> {
    U256::from_str_radix(s, 10)
        .map_err(|e| FacilitatorError::InvalidPayment(format!("invalid uint256: {e}")))
}

/// Parse a 32-byte nonce. Accepts 0x-hex (exactly 32 bytes) or a decimal
/// integer, which is left-padded to 32 bytes.
pub fn parse_nonce32(s: &str) -> Result<B256, FacilitatorError> {
    if let Some(hex) = s.strip_prefix("0x") {
        let bytes = alloy::hex::decode(hex)
            .map_err(|e| FacilitatorError::InvalidPayment(format!("invalid nonce hex: {e}")))?;
        if bytes.len() != 32 {
            return Err(FacilitatorError::InvalidPayment(format!(
                "nonce must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(B256::new(arr))
    } else {
        let value = parse_u256(s)?;
        Ok(B256::new(value.to_be_bytes::<32>()))
    }
}

/// Build the `PermitWitnessTransferFrom` struct a witness-spend client signed.
pub fn witness_spend_struct(
    auth: &WitnessSpendAuthorization,
) -> Result<PermitWitnessTransferFrom, FacilitatorError> {
    Ok(PermitWitnessTransferFrom {
        permitted: TokenPermissions {
            token: auth.permitted.token,
            amount: parse_u256(&auth.permitted.amount)?,
        },
        spender: auth.spender,
        nonce: parse_u256(&auth.nonce)?,
        deadline: U256::from(auth.deadline),
        witness: X402TransferDetails {
            receiver: auth.witness.receiver,
            validAfter: U256::from(auth.witness.valid_after),
            validBefore: U256::from(auth.witness.valid_before),
        },
    })
}

/// Hash of the witness struct alone, passed to the on-chain
/// `permitWitnessTransferFrom` call alongside the literal type string.
pub fn witness_hash(auth: &WitnessSpendAuthorization) -> B256 {
    X402TransferDetails {
        receiver: auth.witness.receiver,
        validAfter: U256::from(auth.witness.valid_after),
        validBefore: U256::from(auth.witness.valid_before),
    }
    .eip712_hash_struct()
}

/// Recover the witness-spend signer. The recovered address is the payer.
pub fn recover_witness_spend(
    auth: &WitnessSpendAuthorization,
    signature_bytes: &[u8],
    chain_id: u64,
) -> Result<Address, FacilitatorError> {
    let permit = witness_spend_struct(auth)?;
    let hash = permit.eip712_signing_hash(&permit2_domain(chain_id));
    recover(hash, signature_bytes)
}

/// Build the `TransferWithAuthorization` struct a direct-auth client signed.
pub fn direct_auth_struct(
    auth: &DirectAuthAuthorization,
) -> Result<TransferWithAuthorization, FacilitatorError> {
    Ok(TransferWithAuthorization {
        from: auth.from,
        to: auth.to,
        value: parse_u256(&auth.value)?,
        validAfter: U256::from(auth.valid_after),
        validBefore: U256::from(auth.valid_before),
        nonce: parse_nonce32(&auth.nonce)?,
    })
}

/// Recover the direct-auth signer. Callers must check the result against the
/// declared `from`.
pub fn recover_direct_auth(
    auth: &DirectAuthAuthorization,
    signature_bytes: &[u8],
    domain: &Eip712Domain,
) -> Result<Address, FacilitatorError> {
    let message = direct_auth_struct(auth)?;
    let hash = message.eip712_signing_hash(domain);
    recover(hash, signature_bytes)
}

/// secp256k1 curve order N / 2; signatures with s above this are malleable (EIP-2).
const SECP256K1_N_DIV_2: U256 = U256::from_limbs([
    0xBFD25E8CD0364140,
    0xBAAEDCE6AF48A03B,
    0xFFFFFFFFFFFFFFFE,
    0x7FFFFFFFFFFFFFFF,
]);

/// Rejects high-s signatures: both (r, s, v) and (r, N - s, !v) recover the
/// same address, and a malleated copy of an authorization must not pass as a
/// distinct one.
fn recover(hash: B256, signature_bytes: &[u8]) -> Result<Address, FacilitatorError> {
    if signature_bytes.len() != 65 {
        return Err(FacilitatorError::Signature(format!(
            "signature must be 65 bytes, got {}",
            signature_bytes.len()
        )));
    }

    let sig = Signature::from_raw(signature_bytes)
        .map_err(|e| FacilitatorError::Signature(format!("invalid signature: {e}")))?;

    if sig.s() > SECP256K1_N_DIV_2 {
        return Err(FacilitatorError::Signature(
            "high-s signature rejected (EIP-2 malleability)".to_string(),
        ));
    }

    sig.recover_address_from_prehash(&hash)
        .map_err(|e| FacilitatorError::Signature(format!("recovery failed: {e}")))
}

/// Generate a random 32-byte nonce (keccak256 of 32 random bytes).
pub fn random_nonce() -> FixedBytes<32> {
    use alloy::primitives::keccak256;
    let mut bytes = [0u8; 32];
    rand::fill(&mut bytes);
    keccak256(bytes)
}
