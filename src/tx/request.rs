//! Transaction requests and submission-time validation
//!
//! Requests arrive from the presentation layer with amounts as decimal
//! strings. Validation runs synchronously before a job is admitted; a
//! rejected request never reaches the daemon.

use serde::{Deserialize, Serialize};

/// Zatoshis per coin (8 decimal places)
pub const COIN: u64 = 100_000_000;

/// Daemon limit for memo payloads
pub const MAX_MEMO_BYTES: usize = 512;

/// Address class, derived from the address encoding
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    /// Base58 t-address; ordinary transaction cost
    Transparent,
    /// Bech32 sapling z-address; construction requires proof generation
    Shielded,
}

/// Classify an address by its encoding, or None if it is neither kind
pub fn classify_address(address: &str) -> Option<AddressKind> {
    const BECH32_CHARSET: &str = "qpzry9x8gf2tvdw0s3jn54khce6mua7l";

    for prefix in ["zs1", "ztestsapling1", "zregtestsapling1"] {
        if let Some(rest) = address.strip_prefix(prefix) {
            let len_ok = (30..=120).contains(&rest.len());
            if len_ok && rest.chars().all(|c| BECH32_CHARSET.contains(c)) {
                return Some(AddressKind::Shielded);
            }
            return None;
        }
    }

    for prefix in ["t1", "t3", "tm", "t2"] {
        if address.starts_with(prefix) {
            let len_ok = (26..=36).contains(&address.len());
            let base58 = address.chars().all(|c| {
                c.is_ascii_alphanumeric() && !matches!(c, '0' | 'O' | 'I' | 'l')
            });
            if len_ok && base58 {
                return Some(AddressKind::Transparent);
            }
            return None;
        }
    }

    None
}

/// Parse a non-negative decimal string into zatoshis
///
/// At most 8 fractional places; no sign, no exponent, no separators.
fn parse_decimal(s: &str) -> Option<u64> {
    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };

    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if frac_part.len() > 8 || !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let whole: u64 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().ok()?
    };

    let frac: u64 = if frac_part.is_empty() {
        0
    } else {
        let padded = format!("{:0<8}", frac_part);
        padded.parse().ok()?
    };

    whole.checked_mul(COIN)?.checked_add(frac)
}

/// Parse a strictly positive amount string into zatoshis
pub fn parse_amount(s: &str) -> Option<u64> {
    match parse_decimal(s) {
        Some(0) | None => None,
        Some(zats) => Some(zats),
    }
}

/// Fee selection for a request
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FeePolicy {
    /// Let the daemon pick its default fee
    #[default]
    Default,
    /// Explicit fee as a decimal string; requires the config opt-in
    Custom { amount: String },
}

/// One payment output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub address: String,
    /// Decimal amount string, e.g. "1.5"
    pub amount: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

/// A transaction as requested by the presentation layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    pub from_address: String,
    pub recipients: Vec<Recipient>,
    #[serde(default)]
    pub fee: FeePolicy,
}

/// Structured rejection reasons
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ValidationError {
    #[error("sending address is not a valid Sable address")]
    InvalidFromAddress,
    #[error("recipient {recipient_index}: address is not a valid Sable address")]
    InvalidAddress { recipient_index: usize },
    #[error("recipient {recipient_index}: memos require shielded addresses on both ends")]
    MemoOnNonShielded { recipient_index: usize },
    #[error("recipient {recipient_index}: amount must be a positive decimal with at most 8 places")]
    InvalidAmount { recipient_index: usize },
    #[error("recipient {recipient_index}: memo exceeds 512 bytes")]
    MemoTooLong { recipient_index: usize },
    #[error("transaction needs at least one recipient")]
    NoRecipients,
    #[error("custom fees are disabled in the wallet configuration")]
    CustomFeeDisabled,
    #[error("custom fee must be a decimal with at most 8 places")]
    InvalidFee,
}

/// A recipient that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRecipient {
    pub address: String,
    pub kind: AddressKind,
    pub zats: u64,
    pub memo: Option<String>,
}

/// A request that passed validation, amounts resolved to zatoshis
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub from_address: String,
    pub from_kind: AddressKind,
    pub recipients: Vec<ValidatedRecipient>,
    /// None means daemon default
    pub fee_zats: Option<u64>,
}

impl ValidatedRequest {
    /// Sum of all recipient amounts
    pub fn total_zats(&self) -> u64 {
        self.recipients.iter().map(|r| r.zats).sum()
    }
}

impl TransactionRequest {
    /// Validate the request; no partial result on failure
    pub fn validate(&self, allow_custom_fees: bool) -> Result<ValidatedRequest, ValidationError> {
        let from_kind =
            classify_address(&self.from_address).ok_or(ValidationError::InvalidFromAddress)?;

        if self.recipients.is_empty() {
            return Err(ValidationError::NoRecipients);
        }

        let mut recipients = Vec::with_capacity(self.recipients.len());
        for (recipient_index, r) in self.recipients.iter().enumerate() {
            let kind = classify_address(&r.address)
                .ok_or(ValidationError::InvalidAddress { recipient_index })?;

            let zats =
                parse_amount(&r.amount).ok_or(ValidationError::InvalidAmount { recipient_index })?;

            if let Some(ref memo) = r.memo {
                if memo.len() > MAX_MEMO_BYTES {
                    return Err(ValidationError::MemoTooLong { recipient_index });
                }
                // Memos only exist inside the shielded pool
                if from_kind != AddressKind::Shielded || kind != AddressKind::Shielded {
                    return Err(ValidationError::MemoOnNonShielded { recipient_index });
                }
            }

            recipients.push(ValidatedRecipient {
                address: r.address.clone(),
                kind,
                zats,
                memo: r.memo.clone(),
            });
        }

        let fee_zats = match &self.fee {
            FeePolicy::Default => None,
            FeePolicy::Custom { amount } => {
                if !allow_custom_fees {
                    return Err(ValidationError::CustomFeeDisabled);
                }
                Some(parse_decimal(amount).ok_or(ValidationError::InvalidFee)?)
            }
        };

        Ok(ValidatedRequest {
            from_address: self.from_address.clone(),
            from_kind,
            recipients,
            fee_zats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T_ADDR: &str = "t1VJL2dPUyXK74WFPesmJh4dzCg45oAwHzK";
    const T_ADDR_2: &str = "t1Wg5Yab9WDX8Y1bXjhyvHSKjzdPZnFQ8rX";
    const Z_ADDR: &str =
        "zs1z7rejlpsa98s2rrrfkwmaxu53e4ue0ulcrw0h4x5g8jl04tak0d3mm47vdtahatqrlkngh9sly";
    const Z_ADDR_2: &str =
        "zs1fhjqvmgyyxgkqnjdxkmwl5rm2xjxqzn083pp498a03wwg7qyv05ak03y4hwtz3c4rkrq0w3etc";

    fn request(from: &str, recipients: Vec<Recipient>) -> TransactionRequest {
        TransactionRequest {
            from_address: from.to_string(),
            recipients,
            fee: FeePolicy::Default,
        }
    }

    fn recipient(address: &str, amount: &str, memo: Option<&str>) -> Recipient {
        Recipient {
            address: address.to_string(),
            amount: amount.to_string(),
            memo: memo.map(|m| m.to_string()),
        }
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("1.5"), Some(150_000_000));
        assert_eq!(parse_amount("0.00000001"), Some(1));
        assert_eq!(parse_amount("21000000"), Some(21_000_000 * COIN));
        assert_eq!(parse_amount(".5"), Some(50_000_000));
        assert_eq!(parse_amount("3."), Some(3 * COIN));

        assert_eq!(parse_amount("0"), None);
        assert_eq!(parse_amount("0.0"), None);
        assert_eq!(parse_amount("-1"), None);
        assert_eq!(parse_amount("1.123456789"), None); // 9 places
        assert_eq!(parse_amount("1,5"), None);
        assert_eq!(parse_amount("1e8"), None);
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("."), None);
        assert_eq!(parse_amount("abc"), None);
    }

    #[test]
    fn test_classify_address() {
        assert_eq!(classify_address(T_ADDR), Some(AddressKind::Transparent));
        assert_eq!(classify_address(Z_ADDR), Some(AddressKind::Shielded));
        assert_eq!(classify_address("bc1qxyz"), None);
        assert_eq!(classify_address(""), None);
        // Base58 never contains 0, O, I or l
        assert_eq!(classify_address("t1VJL2dPUyXK74WFPesmJh4dzCg45oAwH0l"), None);
        // Bech32 body rejects uppercase
        assert_eq!(
            classify_address("zs1Z7REJLPSA98s2rrrfkwmaxu53e4ue0ulcrw0h4x5g8jl04tak0d3mm47vdtah"),
            None
        );
    }

    #[test]
    fn test_valid_transparent_request() {
        let req = request(T_ADDR, vec![recipient(T_ADDR_2, "1.5", None)]);
        let validated = req.validate(false).unwrap();
        assert_eq!(validated.from_kind, AddressKind::Transparent);
        assert_eq!(validated.recipients[0].zats, 150_000_000);
        assert_eq!(validated.fee_zats, None);
        assert_eq!(validated.total_zats(), 150_000_000);
    }

    #[test]
    fn test_memo_on_transparent_from_rejected() {
        let req = request(T_ADDR, vec![recipient(Z_ADDR, "0.1", Some("hello"))]);
        assert_eq!(
            req.validate(false),
            Err(ValidationError::MemoOnNonShielded { recipient_index: 0 })
        );
    }

    #[test]
    fn test_memo_on_transparent_recipient_rejected() {
        let req = request(
            Z_ADDR,
            vec![
                recipient(Z_ADDR_2, "0.1", None),
                recipient(T_ADDR, "0.1", Some("note")),
            ],
        );
        assert_eq!(
            req.validate(false),
            Err(ValidationError::MemoOnNonShielded { recipient_index: 1 })
        );
    }

    #[test]
    fn test_memo_between_shielded_accepted() {
        let req = request(Z_ADDR, vec![recipient(Z_ADDR_2, "0.1", Some("thanks!"))]);
        let validated = req.validate(false).unwrap();
        assert_eq!(validated.recipients[0].memo.as_deref(), Some("thanks!"));
    }

    #[test]
    fn test_memo_too_long_rejected() {
        let memo = "m".repeat(MAX_MEMO_BYTES + 1);
        let req = request(Z_ADDR, vec![recipient(Z_ADDR_2, "0.1", Some(&memo))]);
        assert_eq!(
            req.validate(false),
            Err(ValidationError::MemoTooLong { recipient_index: 0 })
        );
    }

    #[test]
    fn test_invalid_amount_carries_index() {
        let req = request(
            T_ADDR,
            vec![
                recipient(T_ADDR_2, "1.0", None),
                recipient(T_ADDR_2, "0", None),
            ],
        );
        assert_eq!(
            req.validate(false),
            Err(ValidationError::InvalidAmount { recipient_index: 1 })
        );
    }

    #[test]
    fn test_invalid_recipient_address() {
        let req = request(T_ADDR, vec![recipient("not-an-address", "1.0", None)]);
        assert_eq!(
            req.validate(false),
            Err(ValidationError::InvalidAddress { recipient_index: 0 })
        );
    }

    #[test]
    fn test_no_recipients() {
        let req = request(T_ADDR, vec![]);
        assert_eq!(req.validate(false), Err(ValidationError::NoRecipients));
    }

    #[test]
    fn test_custom_fee_requires_opt_in() {
        let mut req = request(T_ADDR, vec![recipient(T_ADDR_2, "1.0", None)]);
        req.fee = FeePolicy::Custom {
            amount: "0.0001".to_string(),
        };

        assert_eq!(req.validate(false), Err(ValidationError::CustomFeeDisabled));

        let validated = req.validate(true).unwrap();
        assert_eq!(validated.fee_zats, Some(10_000));
    }

    #[test]
    fn test_custom_fee_zero_is_allowed() {
        let mut req = request(T_ADDR, vec![recipient(T_ADDR_2, "1.0", None)]);
        req.fee = FeePolicy::Custom {
            amount: "0".to_string(),
        };
        let validated = req.validate(true).unwrap();
        assert_eq!(validated.fee_zats, Some(0));
    }

    #[test]
    fn test_invalid_custom_fee() {
        let mut req = request(T_ADDR, vec![recipient(T_ADDR_2, "1.0", None)]);
        req.fee = FeePolicy::Custom {
            amount: "1.2.3".to_string(),
        };
        assert_eq!(req.validate(true), Err(ValidationError::InvalidFee));
    }
}
