//! Resource document codec
//!
//! Converts command-line options or a resources file into a
//! [`ResourceDocument`], and a document back into its canonical JSON form.
//! Canonical output lists sections and fields in descriptor order regardless
//! of input order, so two equal documents always serialize byte-for-byte equal.

use tracing::debug;

use crate::document::{parse_unsigned, FieldId, FieldKind, FieldValue, ResourceDocument};
use crate::{Error, Result};

/// Build a document from `(option-name, raw value)` pairs such as
/// `("cpu-quota", "100000")`.
///
/// A later occurrence of the same option overrides an earlier one.
///
/// # Errors
/// Returns [`Error::Validation`] for an unknown option, a numeric value that
/// is not an unsigned base-10 integer, or a malformed cpu list
pub fn parse_from_options<I, K, V>(options: I) -> Result<ResourceDocument>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut document = ResourceDocument::new();

    for (option, raw) in options {
        let (option, raw) = (option.as_ref(), raw.as_ref());
        let field = FieldId::from_option(option)
            .ok_or_else(|| Error::validation(option, "unknown resource option"))?;

        let value = match field.kind() {
            FieldKind::Numeric => {
                FieldValue::Number(parse_unsigned(raw).map_err(|m| Error::validation(option, m))?)
            }
            FieldKind::CpuList => FieldValue::CpuList(raw.to_string()),
        };

        document = document.with(field, value).map_err(|e| match e {
            Error::Validation { message, .. } => Error::validation(option, message),
            other => other,
        })?;
    }

    debug!(fields = document.fields().count(), "Parsed resource options");
    Ok(document)
}

/// Parse a resources file (generated or hand-authored JSON).
///
/// # Errors
/// Returns [`Error::Parse`] for malformed JSON, unknown keys or invalid
/// numbers, and [`Error::Validation`] for malformed cpu lists
pub fn parse_from_file(bytes: &[u8]) -> Result<ResourceDocument> {
    let document: ResourceDocument = serde_json::from_slice(bytes)?;
    let document = document.normalized();
    document.validate()?;

    debug!(fields = document.fields().count(), "Parsed resources file");
    Ok(document)
}

/// Canonical, pretty-printed JSON form of a document
///
/// # Errors
/// Returns [`Error::Parse`] if serialization fails
pub fn serialize(document: &ResourceDocument) -> Result<Vec<u8>> {
    let mut out = serde_json::to_vec_pretty(&document.clone().normalized())?;
    out.push(b'\n');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::FIELDS;

    fn all_options() -> Vec<(&'static str, &'static str)> {
        FIELDS
            .iter()
            .map(|d| {
                let raw = match d.kind {
                    FieldKind::Numeric => "1000",
                    FieldKind::CpuList => "0-1",
                };
                (d.option, raw)
            })
            .collect()
    }

    #[test]
    fn round_trip_every_option() {
        let options = all_options();

        // Every subset reachable by dropping a prefix of options
        for start in 0..=options.len() {
            let doc = parse_from_options(options[start..].iter().copied()).unwrap();
            let bytes = serialize(&doc).unwrap();
            assert_eq!(parse_from_file(&bytes).unwrap(), doc);
        }
    }

    #[test]
    fn canonical_order_ignores_input_order() {
        let options = [("pids-limit", "5"), ("blkio-weight", "300"), ("cpu-quota", "5000")];
        let forward = parse_from_options(options).unwrap();
        let backward = parse_from_options(options.into_iter().rev()).unwrap();

        let text = String::from_utf8(serialize(&forward).unwrap()).unwrap();
        assert_eq!(serialize(&forward).unwrap(), serialize(&backward).unwrap());

        let block_io = text.find("blockIO").unwrap();
        let cpu = text.find("\"cpu\"").unwrap();
        let pids = text.find("pids").unwrap();
        assert!(block_io < cpu && cpu < pids);
    }

    #[test]
    fn numbers_as_numbers_lists_as_strings() {
        let doc = parse_from_options([("memory", "1048576"), ("cpuset-cpus", "0-3")]).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&serialize(&doc).unwrap()).unwrap();

        assert_eq!(value["memory"]["limit"], serde_json::json!(1_048_576));
        assert_eq!(value["cpu"]["cpus"], serde_json::json!("0-3"));
        assert!(value.get("pids").is_none());
        assert!(value["cpu"].get("quota").is_none());
    }

    #[test]
    fn kernel_tcp_key_spelling() {
        let doc = parse_from_options([("kernel-memory-tcp", "4096")]).unwrap();
        let text = String::from_utf8(serialize(&doc).unwrap()).unwrap();
        assert!(text.contains("\"kernelTCP\": 4096"));
    }

    #[test]
    fn non_digit_numeric_is_validation_error() {
        for bad in ["abc", "-1", "", "12k", " 7"] {
            let err = parse_from_options([("cpu-quota", bad)]).unwrap_err();
            assert!(matches!(err, Error::Validation { ref subject, .. } if subject == "cpu-quota"));
            assert!(err.is_pre_kernel());
        }
    }

    #[test]
    fn unknown_option_rejected() {
        let err = parse_from_options([("cpu-shares", "10")]).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn malformed_cpu_list_names_option() {
        let err = parse_from_options([("cpuset-mems", "1-0")]).unwrap_err();
        assert!(matches!(err, Error::Validation { ref subject, .. } if subject == "cpuset-mems"));
    }

    #[test]
    fn hand_authored_file_accepted() {
        let text = br#"
        {
            "pids": { "limit": "64" },
            "memory": { "swap": 2000000, "limit": 1000000 },
            "cpu": { "mems": "0", "quota": 20000 }
        }"#;

        let doc = parse_from_file(text).unwrap();
        assert_eq!(doc.number(FieldId::PidsLimit), Some(64));
        assert_eq!(doc.number(FieldId::MemoryLimit), Some(1_000_000));
        assert_eq!(doc.number(FieldId::MemorySwap), Some(2_000_000));
        assert_eq!(doc.number(FieldId::CpuQuota), Some(20_000));
        assert_eq!(doc.get(FieldId::CpusetMems), Some(FieldValue::CpuList("0".into())));
    }

    #[test]
    fn file_rejects_unknown_keys_and_bad_numbers() {
        assert!(matches!(parse_from_file(br#"{"network": {}}"#), Err(Error::Parse { .. })));
        assert!(matches!(parse_from_file(br#"{"cpu": {"shares": 2}}"#), Err(Error::Parse { .. })));
        assert!(matches!(parse_from_file(br#"{"cpu": {"quota": -1}}"#), Err(Error::Parse { .. })));
        let fractional = parse_from_file(br#"{"cpu": {"quota": "1.5"}}"#);
        assert!(matches!(fractional, Err(Error::Parse { .. })));
        assert!(matches!(parse_from_file(b"not json"), Err(Error::Parse { .. })));
        assert!(matches!(
            parse_from_file(br#"{"cpu": {"cpus": "2-1"}}"#),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn empty_document_serializes_to_empty_map() {
        let doc = parse_from_options(Vec::<(&str, &str)>::new()).unwrap();
        assert!(doc.is_empty());
        assert_eq!(serialize(&doc).unwrap(), b"{}\n");

        let doc = parse_from_file(br#"{"memory": {}}"#).unwrap();
        assert!(doc.is_empty());
    }
}
