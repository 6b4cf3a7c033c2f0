//! Transaction payload schema, validation rules and the persisted entity.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProcessError;
use crate::record::Record;

const MAX_ID_LEN: usize = 128;

/// How far into the future `occurred_at` may lie, in hours.
const MAX_CLOCK_SKEW_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Credit,
    Debit,
}

/// Wire format of a record payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransactionPayload {
    pub transaction_id: String,
    pub account_id: String,
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
    pub kind: TransactionKind,
    pub occurred_at: DateTime<Utc>,
}

/// Where a transaction was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A validated transaction as persisted in the document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub account_id: String,
    pub amount: i64,
    pub currency: String,
    pub kind: TransactionKind,
    pub occurred_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub source: SourceRef,
}

impl TransactionPayload {
    pub fn parse(bytes: &[u8]) -> Result<Self, ProcessError> {
        serde_json::from_slice(bytes).map_err(|e| ProcessError::Validation {
            message: format!("malformed payload: {e}"),
        })
    }

    /// Check business rules, reporting every violation at once.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ProcessError> {
        let mut problems = Vec::new();

        check_identifier("transaction_id", &self.transaction_id, &mut problems);
        check_identifier("account_id", &self.account_id, &mut problems);

        if self.amount <= 0 {
            problems.push(format!("amount must be positive, got {}", self.amount));
        }

        if self.currency.len() != 3 || !self.currency.bytes().all(|b| b.is_ascii_uppercase()) {
            problems.push(format!(
                "currency must be three uppercase letters, got '{}'",
                self.currency
            ));
        }

        if self.occurred_at > now + Duration::hours(MAX_CLOCK_SKEW_HOURS) {
            problems.push(format!(
                "occurred_at {} is more than 24h in the future",
                self.occurred_at.to_rfc3339()
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ProcessError::Validation {
                message: problems.join("; "),
            })
        }
    }

    pub fn into_transaction(self, record: &Record, processed_at: DateTime<Utc>) -> Transaction {
        Transaction {
            transaction_id: self.transaction_id,
            account_id: self.account_id,
            amount: self.amount,
            currency: self.currency,
            kind: self.kind,
            occurred_at: self.occurred_at,
            processed_at,
            source: SourceRef {
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
            },
        }
    }
}

fn check_identifier(field: &str, value: &str, problems: &mut Vec<String>) {
    if value.is_empty() {
        problems.push(format!("{field} must not be empty"));
    } else if value.len() > MAX_ID_LEN {
        problems.push(format!("{field} exceeds {MAX_ID_LEN} characters"));
    } else if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'))
    {
        problems.push(format!("{field} contains characters outside [A-Za-z0-9._:-]"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(json: &str) -> Result<TransactionPayload, ProcessError> {
        TransactionPayload::parse(json.as_bytes())
    }

    const VALID: &str = r#"{
        "transaction_id": "tx-001",
        "account_id": "acc:42",
        "amount": 1250,
        "currency": "EUR",
        "kind": "credit",
        "occurred_at": "2024-05-01T12:00:00Z"
    }"#;

    #[test]
    fn test_valid_payload() {
        let parsed = payload(VALID).unwrap();
        assert_eq!(parsed.kind, TransactionKind::Credit);
        parsed.validate(Utc::now()).unwrap();
    }

    #[test]
    fn test_unknown_field_rejected() {
        let json = VALID.replace("\"amount\"", "\"memo\": \"x\", \"amount\"");
        let err = payload(&json).unwrap_err();
        assert!(matches!(err, ProcessError::Validation { .. }));
        assert!(err.to_string().contains("malformed payload"));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let json = VALID.replace("credit", "refund");
        assert!(payload(&json).is_err());
    }

    #[test]
    fn test_non_json_rejected() {
        assert!(TransactionPayload::parse(b"\xff\xfe not json").is_err());
    }

    #[test]
    fn test_business_rules_collect_every_problem() {
        let json = VALID
            .replace("tx-001", "tx 001")
            .replace("1250", "-5")
            .replace("EUR", "eur");
        let err = payload(&json).unwrap().validate(Utc::now()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("transaction_id"));
        assert!(message.contains("amount"));
        assert!(message.contains("currency"));
    }

    #[test]
    fn test_identifier_length_limit() {
        let long_id = "a".repeat(129);
        let json = VALID.replace("tx-001", &long_id);
        let err = payload(&json).unwrap().validate(Utc::now()).unwrap_err();
        assert!(err.to_string().contains("exceeds 128"));
    }

    #[test]
    fn test_future_event_time() {
        let parsed = payload(VALID).unwrap();
        let long_before = parsed.occurred_at - Duration::hours(25);
        assert!(parsed.validate(long_before).is_err());

        let slightly_before = parsed.occurred_at - Duration::hours(23);
        assert!(parsed.validate(slightly_before).is_ok());
    }

    #[test]
    fn test_into_transaction_keeps_source() {
        let record = Record {
            topic: "transactions".to_string(),
            partition: 3,
            offset: 17,
            key: None,
            payload: bytes::Bytes::from_static(VALID.as_bytes()),
            received_at: Utc::now(),
        };
        let now = Utc::now();
        let tx = payload(VALID).unwrap().into_transaction(&record, now);
        assert_eq!(tx.source.partition, 3);
        assert_eq!(tx.source.offset, 17);
        assert_eq!(tx.processed_at, now);
    }
}
