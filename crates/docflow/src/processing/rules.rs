//! Invoice field extraction and validation rules
//!
//! Both functions are pure: the same text always yields the same fields and
//! the same messages, in the same order.

use regex::Regex;
use std::sync::LazyLock;

use crate::types::ExtractedFields;

static INVOICE_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*Invoice\s*(?:Number|No\.?|#)[ \t]*[:#]?[ \t]*([A-Z0-9][A-Z0-9\-/]*)")
        .expect("valid invoice number regex")
});

static CUSTOMER_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*Customer(?:\s*Name)?\s*:[ \t]*(\S[^\r\n]*?)[ \t]*$")
        .expect("valid customer regex")
});

static TOTAL_AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*Total(?:\s*Amount)?\s*:[ \t]*\$?[ \t]*(-?[0-9][0-9,]*(?:\.[0-9]+)?)(?:[ \t]*([A-Z]{3}))?")
        .expect("valid total regex")
});

static CURRENCY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*Currency\s*:[ \t]*([A-Z]{3})\b").expect("valid currency regex")
});

static ISSUE_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:Issue\s*)?Date\s*:[ \t]*(\S+)").expect("valid date regex")
});

static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("valid iso date regex"));

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Pull invoice fields out of recognized text
///
/// A currency code trailing the total is used when there is no `Currency:` line.
pub fn extract_fields(text: &str) -> ExtractedFields {
    let total = TOTAL_AMOUNT.captures(text);
    let total_amount = total
        .as_ref()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().replace(',', "").parse::<f64>().ok());
    let total_currency = total
        .as_ref()
        .and_then(|c| c.get(2))
        .map(|m| m.as_str().to_uppercase());

    ExtractedFields {
        invoice_number: capture(&INVOICE_NUMBER, text),
        customer_name: capture(&CUSTOMER_NAME, text),
        total_amount,
        currency: capture(&CURRENCY, text)
            .map(|c| c.to_uppercase())
            .or(total_currency),
        issue_date: capture(&ISSUE_DATE, text),
    }
}

/// Presence and format checks; an empty list means the fields are valid
pub fn validate_fields(fields: &ExtractedFields) -> Vec<String> {
    let mut errors = Vec::new();

    if fields.invoice_number.as_deref().map_or(true, str::is_empty) {
        errors.push("Invoice number is missing".to_string());
    }
    if fields.customer_name.as_deref().map_or(true, str::is_empty) {
        errors.push("Customer name is missing".to_string());
    }
    match fields.total_amount {
        None => errors.push("Total amount is missing".to_string()),
        Some(amount) if !(amount > 0.0) => {
            errors.push(format!("Total amount must be positive, got {}", amount))
        }
        Some(_) => {}
    }
    if fields.currency.as_deref().map_or(true, str::is_empty) {
        errors.push("Currency is missing".to_string());
    }
    match fields.issue_date.as_deref() {
        None | Some("") => errors.push("Issue date is missing".to_string()),
        Some(date) if !ISO_DATE.is_match(date) => {
            errors.push(format!("Issue date '{}' is not in YYYY-MM-DD format", date))
        }
        Some(_) => {}
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::SAMPLE_INVOICE_TEXT;

    #[test]
    fn test_sample_invoice_extracts_all_fields() {
        let fields = extract_fields(SAMPLE_INVOICE_TEXT);
        assert_eq!(fields.invoice_number.as_deref(), Some("INV-2025-001"));
        assert_eq!(fields.customer_name.as_deref(), Some("Acme Corp"));
        assert_eq!(fields.total_amount, Some(1234.56));
        assert_eq!(fields.currency.as_deref(), Some("USD"));
        assert_eq!(fields.issue_date.as_deref(), Some("2025-07-08"));
        assert!(validate_fields(&fields).is_empty());
    }

    #[test]
    fn test_missing_customer_is_reported() {
        let text = SAMPLE_INVOICE_TEXT.replace("Customer: Acme Corp\n", "");
        let errors = validate_fields(&extract_fields(&text));
        assert_eq!(errors, vec!["Customer name is missing".to_string()]);
    }

    #[test]
    fn test_empty_customer_line_is_missing() {
        let text = SAMPLE_INVOICE_TEXT.replace("Customer: Acme Corp", "Customer:");
        assert_eq!(extract_fields(&text).customer_name, None);
    }

    #[test]
    fn test_bad_date_and_negative_amount() {
        let text = "Invoice No. 77\nCustomer Name: Globex\nIssue Date: 08/07/2025\nTotal Amount: -5.00 EUR";
        let fields = extract_fields(text);
        assert_eq!(fields.invoice_number.as_deref(), Some("77"));
        assert_eq!(fields.currency.as_deref(), Some("EUR"));

        let errors = validate_fields(&fields);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("must be positive"));
        assert!(errors[1].contains("YYYY-MM-DD"));
    }

    #[test]
    fn test_thousands_separator_and_dollar_sign() {
        let fields = extract_fields("Total: $12,500.00\nCurrency: usd");
        assert_eq!(fields.total_amount, Some(12500.0));
        assert_eq!(fields.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn test_every_field_missing() {
        let errors = validate_fields(&extract_fields("nothing useful here"));
        assert_eq!(errors.len(), 5);
    }

    #[test]
    fn test_extraction_is_deterministic() {
        assert_eq!(extract_fields(SAMPLE_INVOICE_TEXT), extract_fields(SAMPLE_INVOICE_TEXT));
    }
}
