//! The verifier: decides whether a payment *would* settle, without spending
//! ledger resources. No side effects; safe to run concurrently with itself
//! and with settlement.

use std::sync::Arc;

use alloy::primitives::{Address, B256, U256};
use alloy::providers::Provider;

use crate::chain;
use crate::constants::{ChainConfig, ACCEPTED_VERSIONS, SCHEME_EXACT};
use crate::eip712;
use crate::nonce_store::{NonceState, NonceStore};
use crate::payment::{
    parse_amount, ExactPayload, PaymentPayload, PaymentProtocol, PaymentRequirements,
};
use crate::reason::ErrorReason;
use crate::response::VerifyResponse;
use crate::security::redact_address;
use crate::tokens::{TokenRecord, TokenRegistry};

/// Everything settlement needs from a successful verification.
pub(crate) struct Evaluated {
    pub payer: Address,
    pub amount: U256,
    /// Normalized 32-byte nonce, lowercased 0x-hex. The replay-store key.
    pub nonce_hex: String,
    pub token: TokenRecord,
    pub protocol: PaymentProtocol,
    pub signature: Vec<u8>,
}

type Rejection = (ErrorReason, Option<Address>);

pub struct Verifier<P> {
    provider: P,
    facilitator: Address,
    config: ChainConfig,
    registry: Arc<TokenRegistry>,
    nonces: Arc<dyn NonceStore>,
}

impl<P> Verifier<P>
where
    P: Provider + Send + Sync,
{
    pub fn new(
        provider: P,
        facilitator: Address,
        config: ChainConfig,
        registry: Arc<TokenRegistry>,
        nonces: Arc<dyn NonceStore>,
    ) -> Self {
        Self {
            provider,
            facilitator,
            config,
            registry,
            nonces,
        }
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Full verification, including replay and funds checks.
    pub async fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> VerifyResponse {
        self.respond(payload, requirements, true).await
    }

    /// Signature and structure only: skips the ledger-read funds checks.
    pub async fn verify_quick(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> VerifyResponse {
        self.respond(payload, requirements, false).await
    }

    async fn respond(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
        check_funds: bool,
    ) -> VerifyResponse {
        match self.evaluate(payload, requirements, check_funds).await {
            Ok(evaluated) => VerifyResponse::valid(&format!("{:#x}", evaluated.payer)),
            Err((reason, Some(payer))) => {
                VerifyResponse::invalid_with_payer(reason, &format!("{payer:#x}"))
            }
            Err((reason, None)) => VerifyResponse::invalid(reason),
        }
    }

    /// The verification procedure. Ordering matters only where it affects
    /// the reported reason: signature and time before funds, and
    /// allowance-missing before balance-missing, so the most actionable
    /// error surfaces first.
    pub(crate) async fn evaluate(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
        check_funds: bool,
    ) -> Result<Evaluated, Rejection> {
        // Normalization: older clients omit scheme/network/version from the
        // payload and supply them only in the requirements.
        let mut payload = payload.clone();
        payload.normalize(requirements, None);

        self.structural(&payload, requirements)?;

        let required_amount = parse_amount(&requirements.max_amount_required)
            .map_err(|_| (ErrorReason::InvalidPaymentRequirements, None))?;

        let evaluated = match &payload.payload {
            ExactPayload::WitnessSpend(ws) => {
                self.evaluate_witness_spend(ws, requirements, required_amount)?
            }
            ExactPayload::DirectAuth(da) => {
                self.evaluate_direct_auth(da, requirements, required_amount)?
            }
        };

        // Replay: a store that cannot answer is treated as "used".
        match self
            .nonces
            .lookup(&format!("{:#x}", evaluated.payer), &evaluated.nonce_hex)
        {
            NonceState::Unused => {}
            NonceState::Used => {
                return Err((ErrorReason::NonceAlreadyUsed, Some(evaluated.payer)));
            }
            NonceState::Unknown => {
                tracing::warn!(
                    payer = %redact_address(&format!("{:#x}", evaluated.payer)),
                    "nonce store unavailable, failing closed"
                );
                return Err((ErrorReason::NonceAlreadyUsed, Some(evaluated.payer)));
            }
        }

        if check_funds {
            self.check_funds(&evaluated).await?;
        }

        Ok(evaluated)
    }

    fn structural(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<(), Rejection> {
        if requirements.scheme != SCHEME_EXACT {
            return Err((ErrorReason::InvalidScheme, None));
        }
        if payload.scheme.as_deref() != Some(SCHEME_EXACT) {
            return Err((ErrorReason::InvalidScheme, None));
        }

        match payload.x402_version {
            Some(v) if ACCEPTED_VERSIONS.contains(&v) => {}
            _ => return Err((ErrorReason::InvalidX402Version, None)),
        }

        let network = payload
            .network
            .as_deref()
            .ok_or((ErrorReason::InvalidNetwork, None))?;
        if !self.config.matches_network(network) || !self.config.matches_network(&requirements.network)
        {
            return Err((ErrorReason::InvalidNetwork, None));
        }

        if requirements.resource.is_empty() {
            return Err((ErrorReason::InvalidPaymentRequirements, None));
        }

        Ok(())
    }

    fn evaluate_witness_spend(
        &self,
        ws: &crate::payment::WitnessSpendPayload,
        requirements: &PaymentRequirements,
        required_amount: U256,
    ) -> Result<Evaluated, Rejection> {
        let auth = &ws.authorization;

        // Whitelist before anything chain-specific; unknown tokens fail closed.
        let token = self
            .registry
            .by_address(auth.permitted.token)
            .ok_or((ErrorReason::TokenNotWhitelisted, None))?;
        if auth.permitted.token != requirements.asset {
            return Err((ErrorReason::InvalidPaymentRequirements, None));
        }

        // The signed spender must be the contract this deployment spends
        // through, or nothing we submit can move the funds.
        if !self
            .config
            .accepted_spenders(self.facilitator)
            .contains(&auth.spender)
        {
            return Err((ErrorReason::InvalidPayload, None));
        }

        let signature = eip712::parse_signature(&ws.signature)
            .map_err(|_| (ErrorReason::InvalidSignature, None))?;
        eip712::witness_spend_struct(auth)
            .map_err(|_| (ErrorReason::InvalidAuthorizationTypedDataMessage, None))?;
        let payer = eip712::recover_witness_spend(auth, &signature, self.config.chain_id)
            .map_err(|_| (ErrorReason::InvalidSignature, None))?;

        let now = unix_now();
        if now < auth.witness.valid_after {
            return Err((ErrorReason::InvalidAuthorizationValidAfter, Some(payer)));
        }
        if now >= auth.witness.valid_before || now > auth.deadline {
            return Err((ErrorReason::InvalidAuthorizationValidBefore, Some(payer)));
        }

        if auth.witness.receiver != requirements.pay_to {
            return Err((ErrorReason::InvalidPayload, Some(payer)));
        }

        let amount =
            parse_amount(&auth.permitted.amount).map_err(|reason| (reason, Some(payer)))?;
        if amount < required_amount {
            return Err((ErrorReason::InvalidAuthorizationValueTooLow, Some(payer)));
        }

        let nonce = eip712::parse_u256(&auth.nonce)
            .map_err(|_| (ErrorReason::InvalidAuthorizationTypedDataMessage, Some(payer)))?;
        let nonce_hex = format!("{:#x}", B256::new(nonce.to_be_bytes::<32>()));

        Ok(Evaluated {
            payer,
            amount,
            nonce_hex,
            token,
            protocol: PaymentProtocol::WitnessSpend,
            signature,
        })
    }

    fn evaluate_direct_auth(
        &self,
        da: &crate::payment::DirectAuthPayload,
        requirements: &PaymentRequirements,
        required_amount: U256,
    ) -> Result<Evaluated, Rejection> {
        let auth = &da.authorization;

        let token = self
            .registry
            .by_address(requirements.asset)
            .ok_or((ErrorReason::TokenNotWhitelisted, None))?;

        // Direct-auth domains are token-specific; the requirements may carry
        // overrides for tokens whose deployment differs from the registry.
        let extra = requirements.extra.as_ref();
        let name = extra
            .and_then(|e| e.name.as_deref())
            .unwrap_or(&token.eip712_name);
        let version = extra
            .and_then(|e| e.version.as_deref())
            .unwrap_or(&token.eip712_version);
        let domain =
            eip712::token_domain(name, version, self.config.chain_id, requirements.asset);

        let signature = eip712::parse_signature(&da.signature)
            .map_err(|_| (ErrorReason::InvalidSignature, None))?;
        let recovered = eip712::recover_direct_auth(auth, &signature, &domain).map_err(|e| {
            match e {
                crate::error::FacilitatorError::InvalidPayment(_) => {
                    (ErrorReason::InvalidAuthorizationTypedDataMessage, None)
                }
                _ => (ErrorReason::InvalidSignature, None),
            }
        })?;
        if recovered != auth.from {
            return Err((ErrorReason::InvalidSignatureAddress, Some(auth.from)));
        }
        let payer = auth.from;

        let now = unix_now();
        if now < auth.valid_after {
            return Err((ErrorReason::InvalidAuthorizationValidAfter, Some(payer)));
        }
        if now >= auth.valid_before {
            return Err((ErrorReason::InvalidAuthorizationValidBefore, Some(payer)));
        }

        if auth.to != requirements.pay_to {
            return Err((ErrorReason::InvalidPayload, Some(payer)));
        }

        let amount = parse_amount(&auth.value).map_err(|reason| (reason, Some(payer)))?;
        if amount < required_amount {
            return Err((ErrorReason::InvalidAuthorizationValueTooLow, Some(payer)));
        }

        let nonce = eip712::parse_nonce32(&auth.nonce)
            .map_err(|_| (ErrorReason::InvalidAuthorizationTypedDataMessage, Some(payer)))?;
        let nonce_hex = format!("{nonce:#x}");

        Ok(Evaluated {
            payer,
            amount,
            nonce_hex,
            token,
            protocol: PaymentProtocol::DirectAuth,
            signature,
        })
    }

    /// Funds checks, ordered so the reason requiring a client action (the
    /// missing outer approval) surfaces before the plain balance shortfall.
    async fn check_funds(&self, evaluated: &Evaluated) -> Result<(), Rejection> {
        let payer = evaluated.payer;
        let token = evaluated.token.address;

        if evaluated.protocol == PaymentProtocol::WitnessSpend {
            let allowance =
                chain::outer_allowance(&self.provider, token, payer, self.config.permit2)
                    .await
                    .map_err(|e| {
                        tracing::error!(error = %e, "allowance read failed");
                        (ErrorReason::UnexpectedVerifyError, Some(payer))
                    })?;
            if allowance < evaluated.amount {
                tracing::info!(
                    payer = %redact_address(&format!("{payer:#x}")),
                    allowance = %allowance,
                    required = %evaluated.amount,
                    "outer allowance insufficient, client approval required"
                );
                return Err((ErrorReason::OuterAllowanceRequired, Some(payer)));
            }
        }

        let balance = chain::balance_of(&self.provider, token, payer)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "balance read failed");
                (ErrorReason::UnexpectedVerifyError, Some(payer))
            })?;
        if balance < evaluated.amount {
            tracing::info!(
                payer = %redact_address(&format!("{payer:#x}")),
                balance = %balance,
                required = %evaluated.amount,
                "insufficient balance"
            );
            return Err((ErrorReason::InsufficientFunds, Some(payer)));
        }

        Ok(())
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
