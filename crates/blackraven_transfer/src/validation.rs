use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use blackraven_contract::{CreateTransferRequest, FieldError};
use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;
use uuid::Uuid;

use crate::format::parse_timestamp;

pub const MIN_PASSPHRASE_LEN: usize = 8;
const MAX_FILENAME_LEN: usize = 255;
const MAX_ADDRESS_LEN: usize = 254;

static EMAIL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("static email pattern"));

#[derive(Debug, Error)]
#[error("transfer request rejected: {}", summarize(.0))]
pub struct ValidationError(pub Vec<FieldError>);

fn summarize(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|f| format!("{}: {}", f.field, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Limits that depend on deployment configuration.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_payload_bytes: usize,
    pub platforms: BTreeSet<String>,
}

/// A create request that passed every check, with the payload decoded.
pub struct TransferDraft {
    pub filename: String,
    pub media_type: String,
    pub payload: Vec<u8>,
    pub message: Option<String>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub recipients: BTreeMap<String, String>,
    pub passphrase: String,
}

impl fmt::Debug for TransferDraft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferDraft")
            .field("filename", &self.filename)
            .field("media_type", &self.media_type)
            .field("payload_len", &self.payload.len())
            .field("start_date", &self.start_date)
            .field("end_date", &self.end_date)
            .field("recipients", &self.recipients)
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

impl TransferDraft {
    /// Blob path namespaced by owner, with a time-ordered disambiguator.
    pub fn payload_path(&self, owner_id: &str) -> String {
        format!("{owner_id}/{}-{}", Uuid::now_v7(), self.filename)
    }
}

pub fn validate_upload(
    request: CreateTransferRequest,
    policy: &UploadPolicy,
) -> Result<TransferDraft, ValidationError> {
    let mut errors = Vec::new();

    let filename = request.filename.trim().to_string();
    if let Err(message) = check_filename(&filename) {
        errors.push(FieldError::new("filename", message));
    }

    let media_type = match request.media_type.as_deref().map(str::trim) {
        None | Some("") => mime::APPLICATION_OCTET_STREAM.to_string(),
        Some(raw) => match raw.parse::<mime::Mime>() {
            Ok(parsed) => parsed.essence_str().to_string(),
            Err(_) => {
                errors.push(FieldError::new("media_type", "not a valid media type"));
                String::new()
            }
        },
    };

    let payload = match STANDARD.decode(request.payload_base64.trim()) {
        Ok(bytes) if bytes.is_empty() => {
            errors.push(FieldError::new("payload_base64", "file must not be empty"));
            bytes
        }
        Ok(bytes) if bytes.len() > policy.max_payload_bytes => {
            errors.push(FieldError::new(
                "payload_base64",
                format!("file exceeds the {} byte limit", policy.max_payload_bytes),
            ));
            bytes
        }
        Ok(bytes) => bytes,
        Err(_) => {
            errors.push(FieldError::new("payload_base64", "payload is not valid base64"));
            Vec::new()
        }
    };

    let start_date = parse_date("start_date", &request.start_date, &mut errors);
    let end_date = parse_date("end_date", &request.end_date, &mut errors);

    if request.recipients.is_empty() {
        errors.push(FieldError::new("recipients", "at least one recipient is required"));
    }
    let mut recipients = BTreeMap::new();
    for (platform, address) in request.recipients {
        let platform = platform.trim().to_ascii_lowercase();
        let address = address.trim().to_string();
        let field = format!("recipients.{platform}");
        if !policy.platforms.contains(&platform) {
            errors.push(FieldError::new(&field, "unsupported delivery platform"));
        }
        if !is_valid_address(&address) {
            errors.push(FieldError::new(&field, "invalid email address"));
        }
        if recipients.insert(platform, address).is_some() {
            errors.push(FieldError::new(&field, "duplicate delivery platform"));
        }
    }

    for message in passphrase_violations(&request.deactivation_passphrase) {
        errors.push(FieldError::new("deactivation_passphrase", message));
    }

    let message = request
        .message
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty());

    match (start_date, end_date) {
        (Some(start_date), Some(end_date)) if errors.is_empty() => Ok(TransferDraft {
            filename,
            media_type,
            payload,
            message,
            start_date,
            end_date,
            recipients,
            passphrase: request.deactivation_passphrase,
        }),
        _ => Err(ValidationError(errors)),
    }
}

fn parse_date(field: &str, raw: &str, errors: &mut Vec<FieldError>) -> Option<DateTime<Utc>> {
    match parse_timestamp(raw.trim()) {
        Ok(instant) => Some(instant),
        Err(_) => {
            errors.push(FieldError::new(field, "must be an RFC 3339 timestamp"));
            None
        }
    }
}

fn check_filename(filename: &str) -> Result<(), &'static str> {
    if filename.is_empty() {
        return Err("file name is required");
    }
    if filename.len() > MAX_FILENAME_LEN {
        return Err("file name is too long");
    }
    if filename == "." || filename == ".." {
        return Err("file name is reserved");
    }
    if filename.contains(['/', '\\']) || filename.chars().any(char::is_control) {
        return Err("file name must not contain path separators or control characters");
    }
    Ok(())
}

pub fn is_valid_address(address: &str) -> bool {
    address.len() <= MAX_ADDRESS_LEN && EMAIL_PATTERN.is_match(address)
}

/// Every composition rule the passphrase breaks; empty when acceptable.
pub fn passphrase_violations(passphrase: &str) -> Vec<&'static str> {
    let mut violations = Vec::new();
    if passphrase.chars().count() < MIN_PASSPHRASE_LEN {
        violations.push("passphrase must be at least 8 characters long");
    }
    if !passphrase.chars().any(|c| c.is_ascii_lowercase()) {
        violations.push("passphrase must contain at least one lowercase letter");
    }
    if !passphrase.chars().any(|c| c.is_ascii_uppercase()) {
        violations.push("passphrase must contain at least one uppercase letter");
    }
    if !passphrase.chars().any(|c| c.is_ascii_digit()) {
        violations.push("passphrase must contain at least one number");
    }
    if !passphrase.chars().any(|c| !c.is_ascii_alphanumeric()) {
        violations.push("passphrase must contain at least one special character");
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> UploadPolicy {
        UploadPolicy {
            max_payload_bytes: 1024,
            platforms: ["email".to_string(), "gmail".to_string()].into_iter().collect(),
        }
    }

    fn request() -> CreateTransferRequest {
        CreateTransferRequest {
            filename: "will.pdf".to_string(),
            media_type: Some("application/pdf".to_string()),
            payload_base64: STANDARD.encode(b"last words"),
            message: Some("  read me  ".to_string()),
            start_date: "2030-01-01T00:00:00Z".to_string(),
            end_date: "2030-02-01T00:00:00+02:00".to_string(),
            recipients: [("email".to_string(), "heir@example.com".to_string())]
                .into_iter()
                .collect(),
            deactivation_passphrase: "Str0ng!pass".to_string(),
        }
    }

    fn fields(err: ValidationError) -> Vec<String> {
        err.0.into_iter().map(|f| f.field).collect()
    }

    #[test]
    fn accepts_well_formed_request() {
        let draft = validate_upload(request(), &policy()).expect("valid");
        assert_eq!(draft.payload, b"last words");
        assert_eq!(draft.message.as_deref(), Some("read me"));
        assert_eq!(draft.end_date.to_rfc3339(), "2030-01-31T22:00:00+00:00");
        assert_eq!(draft.media_type, "application/pdf");
    }

    #[test]
    fn rejects_invalid_recipient_address() {
        let mut req = request();
        req.recipients.insert("gmail".to_string(), "not-an-email".to_string());
        assert_eq!(fields(validate_upload(req, &policy()).unwrap_err()), vec!["recipients.gmail"]);
    }

    #[test]
    fn rejects_unknown_platform() {
        let mut req = request();
        req.recipients = [("carrier-pigeon".to_string(), "a@b.io".to_string())].into_iter().collect();
        assert_eq!(
            fields(validate_upload(req, &policy()).unwrap_err()),
            vec!["recipients.carrier-pigeon"]
        );
    }

    #[test]
    fn rejects_platforms_differing_only_in_case() {
        let mut req = request();
        req.recipients = [
            ("Email".to_string(), "a@example.com".to_string()),
            ("email".to_string(), "b@example.com".to_string()),
        ]
        .into_iter()
        .collect();
        let ValidationError(errors) = validate_upload(req, &policy()).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "recipients.email");
        assert_eq!(errors[0].message, "duplicate delivery platform");
    }

    #[test]
    fn reports_every_passphrase_rule() {
        assert_eq!(passphrase_violations("Str0ng!pass"), Vec::<&str>::new());
        assert_eq!(passphrase_violations("short").len(), 4);
        assert_eq!(passphrase_violations("alllowercase1!").len(), 1);
        assert_eq!(passphrase_violations("NoDigitsHere!").len(), 1);
        assert_eq!(passphrase_violations("NoSymbols123").len(), 1);
    }

    #[test]
    fn collects_all_field_errors_at_once() {
        let mut req = request();
        req.filename = "../etc/passwd".to_string();
        req.end_date = "tomorrow".to_string();
        req.payload_base64 = "***".to_string();
        req.deactivation_passphrase = "Str0ngpass".to_string();
        let got = fields(validate_upload(req, &policy()).unwrap_err());
        assert_eq!(
            got,
            vec!["filename", "payload_base64", "end_date", "deactivation_passphrase"]
        );
    }

    #[test]
    fn enforces_payload_limits() {
        let mut req = request();
        req.payload_base64 = STANDARD.encode(vec![0u8; 2048]);
        assert_eq!(fields(validate_upload(req, &policy()).unwrap_err()), vec!["payload_base64"]);

        let mut req = request();
        req.payload_base64 = String::new();
        assert_eq!(fields(validate_upload(req, &policy()).unwrap_err()), vec!["payload_base64"]);
    }

    #[test]
    fn requires_a_recipient() {
        let mut req = request();
        req.recipients.clear();
        assert_eq!(fields(validate_upload(req, &policy()).unwrap_err()), vec!["recipients"]);
    }

    #[test]
    fn payload_path_is_namespaced_by_owner() {
        let draft = validate_upload(request(), &policy()).expect("valid");
        let path = draft.payload_path("user-1");
        assert!(path.starts_with("user-1/"));
        assert!(path.ends_with("-will.pdf"));
        assert_ne!(path, draft.payload_path("user-1"));
    }
}
