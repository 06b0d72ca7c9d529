//! Content verification for downloaded bytes.

use crate::eligibility::{ContentClass, classify_content_type};

/// PDF header signature.
pub const PDF_MAGIC: &[u8] = b"%PDF-";

/// The signature must start within this many leading bytes.
pub const MAGIC_WINDOW: usize = 1024;

/// Whether `%PDF-` appears in the first [`MAGIC_WINDOW`] bytes.
#[must_use]
pub fn has_pdf_magic(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(MAGIC_WINDOW)];
    window
        .windows(PDF_MAGIC.len())
        .any(|candidate| candidate == PDF_MAGIC)
}

/// Checks that the declared type and the leading bytes agree on "PDF".
///
/// # Errors
///
/// Returns a human-readable mismatch description.
pub fn verify_pdf(bytes: &[u8], declared: Option<&str>) -> Result<(), String> {
    if classify_content_type(declared) == ContentClass::NonDocument {
        return Err(format!(
            "declared content type {} is not a document type",
            declared.unwrap_or_default()
        ));
    }
    if bytes.is_empty() {
        return Err("empty body".to_string());
    }
    if !has_pdf_magic(bytes) {
        return Err(format!("no %PDF- signature in the first {MAGIC_WINDOW} bytes"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_at_start_or_after_junk() {
        assert!(has_pdf_magic(b"%PDF-1.7\n..."));
        let mut padded = vec![b' '; 900];
        padded.extend_from_slice(b"%PDF-1.4");
        assert!(has_pdf_magic(&padded));
    }

    #[test]
    fn test_magic_outside_window_ignored() {
        let mut padded = vec![0u8; MAGIC_WINDOW];
        padded.extend_from_slice(b"%PDF-1.4");
        assert!(!has_pdf_magic(&padded));
    }

    #[test]
    fn test_verify_pdf_rules() {
        assert!(verify_pdf(b"%PDF-1.5", Some("application/pdf")).is_ok());
        assert!(verify_pdf(b"%PDF-1.5", Some("application/octet-stream")).is_ok());
        assert!(verify_pdf(b"%PDF-1.5", None).is_ok());
        assert!(verify_pdf(b"%PDF-1.5", Some("text/html")).is_err());
        assert!(verify_pdf(b"<html>login</html>", Some("application/pdf")).is_err());
        assert!(verify_pdf(b"", Some("application/pdf")).is_err());
    }
}
