//! Core domain model, extraction schema and error taxonomy for CIQ.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "ciq-core";

/// Every key of the extraction schema, in corpus order.
pub const SCHEMA_FIELDS: [&str; 14] = [
    "company_name",
    "industry",
    "sub_industry",
    "sector",
    "products_or_services",
    "locations",
    "key_people",
    "short_description",
    "long_description",
    "tags",
    "sic_code",
    "sic_text",
    "logo",
    "domain",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("domain is empty")]
    Empty,
    #[error("domain {input:?} contains invalid character {ch:?}")]
    InvalidChar { input: String, ch: char },
    #[error("domain {0:?} has an empty label")]
    EmptyLabel(String),
}

/// Normalized hostname; the unit of work and the primary key of a run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Domain(String);

impl Domain {
    pub fn parse(input: &str) -> Result<Self, DomainError> {
        let mut rest = input.trim().to_ascii_lowercase();
        for scheme in ["https://", "http://"] {
            if let Some(stripped) = rest.strip_prefix(scheme) {
                rest = stripped.to_string();
                break;
            }
        }
        let host = rest
            .split(['/', '?', '#'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('.')
            .to_string();

        if host.is_empty() {
            return Err(DomainError::Empty);
        }

        let (name, port) = match host.split_once(':') {
            Some((name, port)) => (name, Some(port)),
            None => (host.as_str(), None),
        };
        if let Some(port) = port {
            if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
                let ch = port.chars().find(|c| !c.is_ascii_digit()).unwrap_or(':');
                return Err(DomainError::InvalidChar { input: input.to_string(), ch });
            }
        }
        if let Some(ch) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '.'))
        {
            return Err(DomainError::InvalidChar { input: input.to_string(), ch });
        }
        if name.split('.').any(str::is_empty) {
            return Err(DomainError::EmptyLabel(input.to_string()));
        }

        Ok(Self(host))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe key used by the dump and checkpoint stores.
    pub fn storage_key(&self) -> String {
        self.0.replace(':', "_")
    }

    pub fn from_storage_key(key: &str) -> Result<Self, DomainError> {
        Self::parse(&key.replacen('_', ":", 1))
    }

    /// `www.acme-labs.com` -> `Acme-labs`.
    pub fn display_name(&self) -> String {
        let host = self.0.split(':').next().unwrap_or_default();
        let host = host.strip_prefix("www.").unwrap_or(host);
        let label = host.split('.').next().unwrap_or(host);
        let mut chars = label.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Domain {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Domain> for String {
    fn from(value: Domain) -> Self {
        value.0
    }
}

/// Raw response for one domain, immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    pub domain: Domain,
    pub url_fetched: String,
    pub status_code: u16,
    pub html_bytes: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

/// Offline hints pulled from page markup alongside the visible text.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PageHints {
    pub title: Option<String>,
    pub logo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanedText {
    pub domain: Domain,
    pub text: String,
    pub truncated: bool,
    pub hints: PageHints,
}

/// The extraction schema and the corpus record the dashboard renders.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompanyProfile {
    pub company_name: String,
    pub industry: String,
    pub sub_industry: String,
    pub sector: String,
    pub products_or_services: Vec<String>,
    pub locations: Vec<String>,
    pub key_people: Vec<String>,
    pub short_description: String,
    pub long_description: String,
    pub tags: String,
    pub sic_code: String,
    pub sic_text: String,
    pub logo: String,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("expected a JSON object, found {0}")]
    NotAnObject(&'static str),
    #[error("object carries none of the schema fields")]
    NoSchemaFields,
}

/// What normalization had to do to make an untrusted object schema-shaped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchemaReport {
    pub missing: Vec<&'static str>,
    pub dropped: Vec<String>,
    pub coerced: Vec<&'static str>,
}

impl CompanyProfile {
    /// Decode untrusted JSON into the schema: unknown keys are dropped, missing
    /// keys take their empty default and mistyped values are coerced. The
    /// `domain` field is always the pipeline's domain.
    pub fn from_untrusted(
        domain: &Domain,
        value: JsonValue,
    ) -> Result<(Self, SchemaReport), SchemaError> {
        let mut object = match value {
            JsonValue::Object(object) => object,
            other => return Err(SchemaError::NotAnObject(json_type_name(&other))),
        };

        if !SCHEMA_FIELDS
            .iter()
            .filter(|field| **field != "domain")
            .any(|field| object.contains_key(*field))
        {
            return Err(SchemaError::NoSchemaFields);
        }

        let mut report = SchemaReport {
            dropped: object
                .keys()
                .filter(|key| !SCHEMA_FIELDS.contains(&key.as_str()))
                .cloned()
                .collect(),
            ..SchemaReport::default()
        };
        report.dropped.sort();

        let mut text = |object: &mut Map<String, JsonValue>, field: &'static str| {
            take_text(object, field, &mut report)
        };
        let mut profile = CompanyProfile {
            company_name: text(&mut object, "company_name"),
            industry: text(&mut object, "industry"),
            sub_industry: text(&mut object, "sub_industry"),
            sector: text(&mut object, "sector"),
            short_description: text(&mut object, "short_description"),
            long_description: text(&mut object, "long_description"),
            tags: text(&mut object, "tags"),
            sic_code: text(&mut object, "sic_code"),
            sic_text: text(&mut object, "sic_text"),
            logo: text(&mut object, "logo"),
            domain: domain.to_string(),
            ..CompanyProfile::default()
        };
        profile.products_or_services = take_list(&mut object, "products_or_services", &mut report);
        profile.locations = take_list(&mut object, "locations", &mut report);
        profile.key_people = take_list(&mut object, "key_people", &mut report);
        if !object.contains_key("domain") {
            report.missing.push("domain");
        }

        Ok((profile, report))
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn take_text(object: &mut Map<String, JsonValue>, field: &'static str, report: &mut SchemaReport) -> String {
    match object.remove(field) {
        None => {
            report.missing.push(field);
            String::new()
        }
        Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.trim().to_string(),
        Some(other) => {
            report.coerced.push(field);
            scalar_text(&other).unwrap_or_else(|| match other {
                JsonValue::Array(items) => items
                    .iter()
                    .filter_map(scalar_text)
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
                    .join(", "),
                _ => String::new(),
            })
        }
    }
}

fn take_list(object: &mut Map<String, JsonValue>, field: &'static str, report: &mut SchemaReport) -> Vec<String> {
    match object.remove(field) {
        None => {
            report.missing.push(field);
            Vec::new()
        }
        Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::Array(items)) => {
            if items.iter().any(|item| !item.is_string()) {
                report.coerced.push(field);
            }
            items
                .iter()
                .filter_map(scalar_text)
                .filter(|s| !s.is_empty())
                .collect()
        }
        Some(JsonValue::String(s)) => {
            report.coerced.push(field);
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect()
        }
        Some(other) => {
            report.coerced.push(field);
            scalar_text(&other).filter(|s| !s.is_empty()).into_iter().collect()
        }
    }
}

/// Text for a scalar, or the `name` member of an object (models like to emit
/// `{"name": ..., "title": ...}` for people).
fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Object(map) => map
            .get("name")
            .and_then(JsonValue::as_str)
            .map(|s| s.trim().to_string()),
        _ => None,
    }
}

/// Per-domain lifecycle. Only moves forward; see [`DomainStatus::can_advance_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStatus {
    Pending,
    Fetched,
    FetchFailed,
    Extracted,
    ExtractFailed,
    Merged,
}

impl DomainStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetched => "fetched",
            Self::FetchFailed => "fetch_failed",
            Self::Extracted => "extracted",
            Self::ExtractFailed => "extract_failed",
            Self::Merged => "merged",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::FetchFailed | Self::Extracted | Self::ExtractFailed | Self::Merged
        )
    }

    pub fn can_advance_to(self, next: DomainStatus) -> bool {
        use DomainStatus::*;
        self == next
            || matches!(
                (self, next),
                (Pending, Fetched)
                    | (Pending, FetchFailed)
                    | (Pending, Extracted)
                    | (Pending, ExtractFailed)
                    | (Fetched, Extracted)
                    | (Fetched, ExtractFailed)
                    | (Extracted, Merged)
            )
    }
}

impl fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Clean,
    Extract,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Clean => "clean",
            Self::Extract => "extract",
        }
    }

    /// Terminal status a failure in this stage leaves the domain in.
    pub fn failed_status(self) -> DomainStatus {
        match self {
            Self::Fetch => DomainStatus::FetchFailed,
            Self::Clean | Self::Extract => DomainStatus::ExtractFailed,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureMarker {
    pub domain: String,
    pub stage: Stage,
    pub error_kind: String,
    pub message: String,
}

impl FailureMarker {
    pub fn new(domain: &Domain, stage: Stage, error_kind: &str, message: impl Into<String>) -> Self {
        Self {
            domain: domain.to_string(),
            stage,
            error_kind: error_kind.to_string(),
            message: message.into(),
        }
    }
}

/// Terminal result persisted for one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checkpoint {
    Extracted(CompanyProfile),
    Failed(FailureMarker),
}

#[derive(Debug, Error)]
pub enum CheckpointDecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl Checkpoint {
    pub fn status(&self) -> DomainStatus {
        match self {
            Self::Extracted(_) => DomainStatus::Extracted,
            Self::Failed(marker) => marker.stage.failed_status(),
        }
    }

    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Self::Extracted(profile) => serde_json::to_vec_pretty(profile),
            Self::Failed(marker) => serde_json::to_vec_pretty(marker),
        }
    }

    /// Decode an on-disk artifact. Profiles are re-validated through
    /// [`CompanyProfile::from_untrusted`], so artifacts written under an older
    /// shape are upgraded rather than rejected.
    pub fn decode(domain: &Domain, bytes: &[u8]) -> Result<Self, CheckpointDecodeError> {
        let value: JsonValue = serde_json::from_slice(bytes)?;
        let is_marker = value
            .as_object()
            .is_some_and(|o| o.contains_key("stage") && o.contains_key("error_kind"));
        if is_marker {
            let mut marker: FailureMarker = serde_json::from_value(value)?;
            marker.domain = domain.to_string();
            return Ok(Self::Failed(marker));
        }
        let (profile, _report) = CompanyProfile::from_untrusted(domain, value)?;
        Ok(Self::Extracted(profile))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("dns resolution failed: {0}")]
    DnsFailure(String),
    #[error("tls handshake failed: {0}")]
    TlsFailure(String),
    #[error("request timed out")]
    Timeout,
    #[error("blocked with http status {status}")]
    BotBlocked { status: u16 },
    #[error("too many redirects")]
    RedirectLoopExceeded,
    #[error("response body is empty")]
    EmptyBody,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("server error with http status {status}")]
    ServerError { status: u16 },
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DnsFailure(_) => "dns_failure",
            Self::TlsFailure(_) => "tls_failure",
            Self::Timeout => "timeout",
            Self::BotBlocked { .. } => "bot_blocked",
            Self::RedirectLoopExceeded => "redirect_loop_exceeded",
            Self::EmptyBody => "empty_body",
            Self::Connect(_) => "connect",
            Self::ServerError { .. } => "server_error",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Connect(_) | Self::ServerError { .. })
    }

    /// Errors raised after the server answered rank above transport errors.
    pub fn progress(&self) -> u8 {
        match self {
            Self::DnsFailure(_) | Self::TlsFailure(_) | Self::Timeout | Self::Connect(_) => 0,
            Self::BotBlocked { .. }
            | Self::RedirectLoopExceeded
            | Self::EmptyBody
            | Self::ServerError { .. } => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CleanError {
    #[error("page has {chars} characters of visible text, below the minimum of {min_chars}")]
    EmptyContent { chars: usize, min_chars: usize },
    #[error("cleaning did not finish: {0}")]
    Aborted(String),
}

impl CleanError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyContent { .. } => "empty_content",
            Self::Aborted(_) => "clean_aborted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("model output is not valid JSON: {0}")]
    ParseFailure(String),
    #[error("model output does not match the schema: {0}")]
    SchemaViolation(String),
    #[error("inference call timed out")]
    InferenceTimeout,
    #[error("inference service unavailable: {0}")]
    InferenceUnavailable(String),
}

impl ExtractionError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ParseFailure(_) => "parse_failure",
            Self::SchemaViolation(_) => "schema_violation",
            Self::InferenceTimeout => "inference_timeout",
            Self::InferenceUnavailable(_) => "inference_unavailable",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::InferenceTimeout | Self::InferenceUnavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IoError {
    #[error("writing {path}: {message}")]
    WriteFailure { path: String, message: String },
    #[error("reading {path}: {message}")]
    ReadCorrupt { path: String, message: String },
}

impl IoError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WriteFailure { .. } => "write_failure",
            Self::ReadCorrupt { .. } => "read_corrupt",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn domain(s: &str) -> Domain {
        Domain::parse(s).expect("valid domain")
    }

    #[test]
    fn domain_parse_normalizes_scheme_path_and_case() {
        assert_eq!(domain("  HTTPS://Www.Example.COM/about?x=1 ").as_str(), "www.example.com");
        assert_eq!(domain("example.com.").as_str(), "example.com");
        assert_eq!(domain("127.0.0.1:8080").as_str(), "127.0.0.1:8080");
    }

    #[test]
    fn domain_parse_rejects_junk() {
        assert_eq!(Domain::parse("   "), Err(DomainError::Empty));
        assert!(matches!(
            Domain::parse("exa mple.com"),
            Err(DomainError::InvalidChar { ch: ' ', .. })
        ));
        assert!(matches!(Domain::parse("a..com"), Err(DomainError::EmptyLabel(_))));
        assert!(Domain::parse("example.com:80a").is_err());
    }

    #[test]
    fn storage_key_round_trips_ports() {
        let d = domain("localhost:9000");
        assert_eq!(d.storage_key(), "localhost_9000");
        assert_eq!(Domain::from_storage_key("localhost_9000").unwrap(), d);
    }

    #[test]
    fn display_name_uses_first_label() {
        assert_eq!(domain("www.acme.io").display_name(), "Acme");
        assert_eq!(domain("b.com").display_name(), "B");
    }

    #[test]
    fn untrusted_json_is_defaulted_stripped_and_coerced() {
        let d = domain("acme.io");
        let value = json!({
            "company_name": "  Acme  ",
            "industry": "Software",
            "tags": ["B2B", "SaaS"],
            "sic_code": 7372,
            "locations": "Berlin, Paris",
            "key_people": [{"name": "Ada", "title": "CEO"}, "Grace"],
            "ceo_shoe_size": 44,
            "domain": "evil.example"
        });
        let (profile, report) = CompanyProfile::from_untrusted(&d, value).unwrap();

        assert_eq!(profile.company_name, "Acme");
        assert_eq!(profile.tags, "B2B, SaaS");
        assert_eq!(profile.sic_code, "7372");
        assert_eq!(profile.locations, vec!["Berlin", "Paris"]);
        assert_eq!(profile.key_people, vec!["Ada", "Grace"]);
        assert_eq!(profile.domain, "acme.io");
        assert!(profile.products_or_services.is_empty());
        assert_eq!(report.dropped, vec!["ceo_shoe_size".to_string()]);
        assert!(report.missing.contains(&"short_description"));
        assert!(report.coerced.contains(&"tags"));

        let out = serde_json::to_value(&profile).unwrap();
        let keys: Vec<_> = out.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys.len(), SCHEMA_FIELDS.len());
        assert!(out.get("ceo_shoe_size").is_none());
    }

    #[test]
    fn non_objects_and_unrelated_objects_violate_schema() {
        let d = domain("acme.io");
        assert_eq!(
            CompanyProfile::from_untrusted(&d, json!(["a"])),
            Err(SchemaError::NotAnObject("array"))
        );
        assert_eq!(
            CompanyProfile::from_untrusted(&d, json!({"answer": 42, "domain": "acme.io"})),
            Err(SchemaError::NoSchemaFields)
        );
    }

    #[test]
    fn status_never_regresses() {
        use DomainStatus::*;
        assert!(Pending.can_advance_to(Fetched));
        assert!(Fetched.can_advance_to(Extracted));
        assert!(Extracted.can_advance_to(Merged));
        assert!(Extracted.can_advance_to(Extracted));
        assert!(!Fetched.can_advance_to(Pending));
        assert!(!Merged.can_advance_to(Extracted));
        assert!(!FetchFailed.can_advance_to(Fetched));
        assert!(!ExtractFailed.can_advance_to(Extracted));
    }

    #[test]
    fn checkpoint_decode_distinguishes_markers_from_profiles() {
        let d = domain("a.com");
        let marker = Checkpoint::Failed(FailureMarker::new(&d, Stage::Fetch, "timeout", "request timed out"));
        let bytes = marker.to_json_bytes().unwrap();
        let decoded = Checkpoint::decode(&d, &bytes).unwrap();
        assert_eq!(decoded, marker);
        assert_eq!(decoded.status(), DomainStatus::FetchFailed);

        let legacy = br#"{"company_name": "A", "tags": ["x"], "technology_stack": ["rust"]}"#;
        match Checkpoint::decode(&d, legacy).unwrap() {
            Checkpoint::Extracted(profile) => {
                assert_eq!(profile.company_name, "A");
                assert_eq!(profile.tags, "x");
                assert_eq!(profile.domain, "a.com");
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            Checkpoint::decode(&d, b"{\"company_na"),
            Err(CheckpointDecodeError::Json(_))
        ));
    }

    #[test]
    fn clean_stage_failures_count_as_extract_failed() {
        assert_eq!(Stage::Clean.failed_status(), DomainStatus::ExtractFailed);
        assert_eq!(Stage::Fetch.failed_status(), DomainStatus::FetchFailed);
    }
}
