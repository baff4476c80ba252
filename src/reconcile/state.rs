//! Claim Reconciliation State Machine
//!
//! Pot claims carry their reconciliation state in a single free-text field so
//! it survives the provider-opaque string channels it passes through. The
//! field is modelled here as a tagged union with strict encode/decode.
//!
//! ```text
//! created ──► transfer_initiated ──(provider failure)──► reconcile_retry_requested
//!    │                                                        │ (sweep CAS)
//!    └─(operator confirms)──────────────────────────────►     ▼
//!                                                  reconcile_retry_inflight
//!                                       ┌───────────────┼────────────────┐
//!                                       ▼               ▼                ▼
//!                          reconcile_retry_initiated  _rejected     _unknown
//! ```
//!
//! # Safety
//!
//! `created` and empty tokens are never auto-retry eligible: a claim whose only
//! local outcome was an error may still have been paid by the provider.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// Reconciliation state of a pot claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimState {
    /// Record written, provider outcome unknown
    Created,
    /// Provider accepted the original transfer
    TransferInitiated,
    /// Safe to re-issue the payout
    RetryRequested,
    /// A sweep holds the claim while calling the provider
    RetryInflight,
    /// Re-issued transfer accepted by the provider
    RetryInitiated,
    /// Provider explicitly declined the re-issue; claim reverted
    RetryRejected,
    /// Re-issue outcome ambiguous; needs more information
    RetryUnknown,
}

impl ClaimState {
    pub const ALL: [ClaimState; 7] = [
        ClaimState::Created,
        ClaimState::TransferInitiated,
        ClaimState::RetryRequested,
        ClaimState::RetryInflight,
        ClaimState::RetryInitiated,
        ClaimState::RetryRejected,
        ClaimState::RetryUnknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimState::Created => "created",
            ClaimState::TransferInitiated => "transfer_initiated",
            ClaimState::RetryRequested => "reconcile_retry_requested",
            ClaimState::RetryInflight => "reconcile_retry_inflight",
            ClaimState::RetryInitiated => "reconcile_retry_initiated",
            ClaimState::RetryRejected => "reconcile_retry_rejected",
            ClaimState::RetryUnknown => "reconcile_retry_unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        ClaimState::ALL.into_iter().find(|state| state.as_str() == s)
    }

    /// A provider transfer is known to have been accepted for this claim
    #[inline]
    pub fn has_initiated_transfer(&self) -> bool {
        matches!(
            self,
            ClaimState::TransferInitiated | ClaimState::RetryInitiated
        )
    }

    /// A failure callback may move the claim to `RetryRequested` from here
    #[inline]
    pub fn can_request_retry(&self) -> bool {
        self.has_initiated_transfer()
    }

    /// The claim was reverted and its slot handed back to the pot
    #[inline]
    pub fn is_reverted(&self) -> bool {
        matches!(self, ClaimState::RetryRejected)
    }
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pot reference carried by a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PotRef {
    Pot(Uuid),
    /// Pot id was not known when the token was written
    Unknown,
}

impl PotRef {
    pub fn pot_id(&self) -> Option<Uuid> {
        match self {
            PotRef::Pot(id) => Some(*id),
            PotRef::Unknown => None,
        }
    }
}

impl From<Option<Uuid>> for PotRef {
    fn from(id: Option<Uuid>) -> Self {
        id.map_or(PotRef::Unknown, PotRef::Pot)
    }
}

/// Type tag written when the pot id is unknown
const CLAIM_TYPE_TAG: &str = "pot_claim";

/// Structured claim state token
///
/// Wire forms: `pot:<uuid>;state:<state>` or `type:pot_claim;state:<state>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateToken {
    pub pot: PotRef,
    pub state: ClaimState,
}

/// Token decode failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("empty state token")]
    Empty,
    #[error("malformed token segment: {0}")]
    MalformedSegment(String),
    #[error("duplicate token key: {0}")]
    DuplicateKey(String),
    #[error("unknown token key: {0}")]
    UnknownKey(String),
    #[error("invalid pot id: {0}")]
    InvalidPotId(String),
    #[error("unknown claim state: {0}")]
    UnknownState(String),
    #[error("token has no state")]
    MissingState,
    #[error("token has neither pot id nor type tag")]
    MissingPot,
}

impl StateToken {
    pub fn new(pot: impl Into<PotRef>, state: ClaimState) -> Self {
        Self {
            pot: pot.into(),
            state,
        }
    }

    pub fn pot_id(&self) -> Option<Uuid> {
        self.pot.pot_id()
    }

    pub fn encode(&self) -> String {
        match self.pot {
            PotRef::Pot(id) => format!("pot:{};state:{}", id, self.state),
            PotRef::Unknown => format!("type:{};state:{}", CLAIM_TYPE_TAG, self.state),
        }
    }

    /// Strict decode: every segment must be a known `key:value` pair and each
    /// key may appear once.
    pub fn decode(raw: &str) -> Result<Self, TokenError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TokenError::Empty);
        }

        let mut pot: Option<PotRef> = None;
        let mut state: Option<ClaimState> = None;

        for segment in raw.split(';') {
            let (key, value) = segment
                .split_once(':')
                .ok_or_else(|| TokenError::MalformedSegment(segment.to_string()))?;
            let value = value.trim();

            match key.trim() {
                "pot" | "type" if pot.is_some() => {
                    return Err(TokenError::DuplicateKey(key.to_string()));
                }
                "pot" => {
                    let id = Uuid::parse_str(value)
                        .map_err(|_| TokenError::InvalidPotId(value.to_string()))?;
                    pot = Some(PotRef::Pot(id));
                }
                "type" => {
                    if value != CLAIM_TYPE_TAG {
                        return Err(TokenError::MalformedSegment(segment.to_string()));
                    }
                    pot = Some(PotRef::Unknown);
                }
                "state" if state.is_some() => {
                    return Err(TokenError::DuplicateKey(key.to_string()));
                }
                "state" => {
                    state = Some(
                        ClaimState::parse(value)
                            .ok_or_else(|| TokenError::UnknownState(value.to_string()))?,
                    );
                }
                other => return Err(TokenError::UnknownKey(other.to_string())),
            }
        }

        Ok(Self {
            pot: pot.ok_or(TokenError::MissingPot)?,
            state: state.ok_or(TokenError::MissingState)?,
        })
    }

    /// Decode an optional stored field; `None` for missing, empty or invalid
    pub fn decode_opt(raw: Option<&str>) -> Option<Self> {
        raw.and_then(|r| Self::decode(r).ok())
    }
}

impl fmt::Display for StateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for StateToken {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

/// Whether the sweep may re-issue the payout for this stored token.
///
/// Eligible only for a non-empty token that decodes strictly to
/// `reconcile_retry_requested`. A token also stamped with another state (a
/// stale snapshot racing another attempt) fails strict decoding and is not
/// eligible either.
pub fn is_auto_retry_eligible(raw: Option<&str>) -> bool {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return false;
    };

    let stamped_elsewhere = [
        ClaimState::TransferInitiated,
        ClaimState::RetryInitiated,
        ClaimState::RetryInflight,
    ]
    .iter()
    .any(|state| raw.contains(state.as_str()));
    if stamped_elsewhere {
        return false;
    }

    matches!(
        StateToken::decode(raw),
        Ok(StateToken {
            state: ClaimState::RetryRequested,
            ..
        })
    )
}
