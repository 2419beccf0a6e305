//! Typed ID definitions.

use crate::define_id;

// Names the durable record of one termination ledger.
define_id!(LedgerId, "ledger");

// Correlates the creation tasks and rollback of one provisioning batch.
define_id!(BatchId, "batch");

// Names the supplemental instances held by one build.
define_id!(SessionId, "session");

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ledger_id_prefix() {
        let id = LedgerId::new();
        assert!(id.to_string().starts_with("ledger_"));
    }

    #[test]
    fn test_ledger_id_rejects_batch_prefix() {
        let batch = BatchId::new().to_string();
        let err = batch.parse::<LedgerId>().unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_session_id_parses_its_own_display() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!(id.to_string().starts_with("session_"));
    }

    #[test]
    fn test_missing_separator() {
        let input = "ledger01HV4Z2WQXKJNM8GPQY6VBKC3D";
        let err = input.parse::<LedgerId>().unwrap_err();
        assert!(matches!(err, crate::IdError::MissingSeparator { .. }));
        assert_eq!(err.input(), input);
    }

    #[test]
    fn test_empty() {
        let result: Result<BatchId, _> = "".parse();
        assert_eq!(result.unwrap_err(), crate::IdError::Empty);
    }

    #[test]
    fn test_invalid_ulid() {
        let result: Result<LedgerId, _> = "ledger_not-a-ulid".parse();
        let err = result.unwrap_err();
        assert!(matches!(err, crate::IdError::InvalidUlid { .. }));
        assert!(err.to_string().contains("ledger_not-a-ulid"));
    }

    #[test]
    fn test_json_is_plain_string() {
        let id = LedgerId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: LedgerId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_ids_are_unique_within_a_millisecond() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| LedgerId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    proptest! {
        #[test]
        fn prop_display_parses_back(raw in any::<u128>()) {
            let id = LedgerId::from_ulid(crate::Ulid(raw));
            let parsed: LedgerId = id.to_string().parse().unwrap();
            prop_assert_eq!(parsed, id);
        }
    }
}
