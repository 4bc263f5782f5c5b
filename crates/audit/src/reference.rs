//! Human-readable audit reference numbers.

use chrono::NaiveDate;

use crate::audit::AuditId;

/// Format the reference number for a new audit, e.g. `AUD-20250301-9F3A2C`.
///
/// Uniqueness comes from the audit id's UUID tail; the date prefix is for
/// humans reading pick lists and reports.
pub fn audit_reference(date: NaiveDate, audit_id: AuditId) -> String {
    let hex = audit_id.0.as_uuid().simple().to_string();
    let tail = &hex[hex.len() - 6..];
    format!("AUD-{}-{}", date.format("%Y%m%d"), tail.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stocktake_core::AggregateId;

    #[test]
    fn reference_carries_date_and_id_tail() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let reference = audit_reference(date, AuditId::new(AggregateId::new()));

        assert!(reference.starts_with("AUD-20250301-"));
        assert_eq!(reference.len(), "AUD-20250301-".len() + 6);
    }

    #[test]
    fn distinct_audits_get_distinct_references() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let a = audit_reference(date, AuditId::new(AggregateId::new()));
        let b = audit_reference(date, AuditId::new(AggregateId::new()));
        assert_ne!(a, b);
    }
}
