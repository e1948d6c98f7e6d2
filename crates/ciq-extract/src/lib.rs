//! Text cleaning, page hints and model-based profile extraction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ciq_core::{
    CleanError, CleanedText, CompanyProfile, Domain, ExtractionError, PageHints, RawPage,
    SchemaReport,
};
use scraper::node::Element;
use scraper::{ElementRef, Html, Node, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use url::Url;

pub const CRATE_NAME: &str = "ciq-extract";

const SKIPPED_TAGS: [&str; 12] = [
    "head", "script", "style", "noscript", "template", "svg", "iframe", "nav", "header", "footer",
    "aside", "form",
];

const SKIPPED_CLASS_FRAGMENTS: [&str; 7] = [
    "cookie",
    "banner",
    "popup",
    "modal",
    "navigation",
    "menu",
    "sidebar",
];

#[derive(Debug, Clone, Copy)]
pub struct CleanerConfig {
    pub max_chars: usize,
    pub min_chars: usize,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            max_chars: 3000,
            min_chars: 50,
        }
    }
}

/// Reduces markup to normalized visible text. Pure: the same bytes always
/// produce the same [`CleanedText`].
#[derive(Debug, Clone, Default)]
pub struct Cleaner {
    config: CleanerConfig,
}

impl Cleaner {
    pub fn new(config: CleanerConfig) -> Self {
        Self { config }
    }

    pub fn clean(&self, page: &RawPage) -> Result<CleanedText, CleanError> {
        self.clean_bytes(&page.domain, &page.html_bytes)
    }

    pub fn clean_bytes(&self, domain: &Domain, html_bytes: &[u8]) -> Result<CleanedText, CleanError> {
        let html = String::from_utf8_lossy(html_bytes);
        let document = Html::parse_document(&html);

        let mut raw_text = String::new();
        collect_visible_text(document.root_element(), &mut raw_text);
        let collapsed = raw_text.split_whitespace().collect::<Vec<_>>().join(" ");

        let (text, truncated) = truncate_chars(&collapsed, self.config.max_chars);
        let chars = text.chars().count();
        if chars < self.config.min_chars {
            return Err(CleanError::EmptyContent {
                chars,
                min_chars: self.config.min_chars,
            });
        }

        Ok(CleanedText {
            domain: domain.clone(),
            text,
            truncated,
            hints: page_hints(domain, &document),
        })
    }
}

fn is_skipped(element: &Element) -> bool {
    if SKIPPED_TAGS.contains(&element.name()) {
        return true;
    }
    if element.attr("hidden").is_some()
        || element.attr("aria-hidden") == Some("true")
        || element.attr("role") == Some("navigation")
    {
        return true;
    }
    element.attr("class").is_some_and(|class| {
        let class = class.to_ascii_lowercase();
        SKIPPED_CLASS_FRAGMENTS.iter().any(|frag| class.contains(frag))
    })
}

/// Depth-first text walk with an explicit stack; page nesting depth is
/// attacker controlled.
fn collect_visible_text(root: ElementRef<'_>, out: &mut String) {
    let mut stack: Vec<_> = root.children().rev().collect();
    while let Some(node) = stack.pop() {
        match node.value() {
            Node::Text(text) => {
                out.push_str(text);
                out.push(' ');
            }
            Node::Element(inner) if !is_skipped(inner) => stack.extend(node.children().rev()),
            _ => {}
        }
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => (text[..cut].trim_end().to_string(), true),
        None => (text.to_string(), false),
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn select_first_text(document: &Html, css: &str) -> Option<String> {
    let sel = selector(css)?;
    document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn select_attrs(document: &Html, css: &str, attr: &str) -> Vec<String> {
    let Some(sel) = selector(css) else {
        return Vec::new();
    };
    document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .filter_map(|s| text_or_none(s.to_string()))
        .collect()
}

pub fn page_hints(domain: &Domain, document: &Html) -> PageHints {
    PageHints {
        title: page_title(document),
        logo: page_logo(domain, document),
    }
}

fn page_title(document: &Html) -> Option<String> {
    let cleaned = select_first_text(document, "title").and_then(|title| {
        let mut title = title.as_str();
        for prefix in ["Home - ", "Home | ", "Home – "] {
            if let Some(rest) = title.strip_prefix(prefix) {
                title = rest;
            }
        }
        let cut = [" | ", " - ", " – "]
            .iter()
            .filter_map(|sep| title.find(sep))
            .min()
            .unwrap_or(title.len());
        text_or_none(title[..cut].to_string())
    });
    cleaned.or_else(|| select_first_text(document, "h1"))
}

const LOGO_LINK_SELECTORS: [&str; 5] = [
    "link[rel='apple-touch-icon']",
    "link[rel='icon'][sizes='192x192']",
    "link[rel='icon'][type='image/png']",
    "link[rel='shortcut icon']",
    "link[rel='icon']",
];

fn looks_like_image(href: &str) -> bool {
    let lower = href.to_ascii_lowercase();
    [".ico", ".png", ".jpg", ".jpeg", ".svg", ".gif", ".webp"]
        .iter()
        .any(|ext| lower.contains(ext))
}

fn resolve_href(domain: &Domain, href: &str) -> Option<String> {
    let base = Url::parse(&format!("https://{domain}/")).ok()?;
    let resolved = base.join(href).ok()?;
    is_http_url(resolved.as_str()).then(|| resolved.to_string())
}

fn page_logo(domain: &Domain, document: &Html) -> Option<String> {
    for css in LOGO_LINK_SELECTORS {
        for href in select_attrs(document, css, "href") {
            if looks_like_image(&href) {
                if let Some(url) = resolve_href(domain, &href) {
                    return Some(url);
                }
            }
        }
    }
    select_attrs(document, "meta[property='og:image']", "content")
        .into_iter()
        .find_map(|content| resolve_href(domain, &content))
}

pub fn is_http_url(candidate: &str) -> bool {
    Url::parse(candidate)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
        .unwrap_or(false)
}

pub fn favicon_url(domain: &Domain) -> String {
    let host = domain.as_str().split(':').next().unwrap_or_default();
    let host = host.strip_prefix("www.").unwrap_or(host);
    format!("https://www.google.com/s2/favicons?sz=128&domain={host}")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    #[error("inference request timed out")]
    Timeout,
    #[error("inference service unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected inference response: {0}")]
    Protocol(String),
}

/// The external model: prompt in, text out, no structural guarantee.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, InferenceError>;
}

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub endpoint: String,
    pub model: String,
    pub timeout: Duration,
    pub num_predict: u32,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/api/generate".to_string(),
            model: "phi".to_string(),
            timeout: Duration::from_secs(60),
            num_predict: 500,
            temperature: 0.1,
            top_k: 10,
            top_p: 0.9,
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    num_predict: u32,
    temperature: f32,
    top_k: u32,
    top_p: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: Option<String>,
    error: Option<String>,
}

/// Non-streaming client for an Ollama-style `/api/generate` endpoint.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    config: OllamaConfig,
}

impl OllamaClient {
    pub fn new(config: OllamaConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| anyhow::anyhow!("building inference client: {err}"))?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl InferenceClient for OllamaClient {
    async fn generate(&self, prompt: &str) -> Result<String, InferenceError> {
        let request = GenerateRequest {
            model: &self.config.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                num_predict: self.config.num_predict,
                temperature: self.config.temperature,
                top_k: self.config.top_k,
                top_p: self.config.top_p,
            },
        };

        let resp = self
            .http
            .post(&self.config.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    InferenceError::Timeout
                } else {
                    InferenceError::Unavailable(err.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(InferenceError::Unavailable(format!("http status {status}")));
        }

        let body: GenerateResponse = resp.json().await.map_err(|err| {
            if err.is_timeout() {
                InferenceError::Timeout
            } else {
                InferenceError::Protocol(err.to_string())
            }
        })?;
        match (body.response, body.error) {
            (Some(text), _) => Ok(text.trim().to_string()),
            (None, Some(error)) => Err(InferenceError::Unavailable(error)),
            (None, None) => Err(InferenceError::Protocol("missing `response` field".to_string())),
        }
    }
}

const FIELD_GUIDE: [(&str, &str); 13] = [
    ("company_name", "\"string: the company's name\""),
    ("industry", "\"string: e.g. Software, Healthcare\""),
    ("sub_industry", "\"string: a more specific industry\""),
    ("sector", "\"string: broad sector, e.g. Technology\""),
    ("products_or_services", "[\"string\", \"...\"]"),
    ("locations", "[\"city or country\", \"...\"]"),
    ("key_people", "[\"person name\", \"...\"]"),
    ("short_description", "\"string: one sentence on what they do\""),
    ("long_description", "\"string: two or three sentences\""),
    ("tags", "\"string: comma-separated keywords\""),
    ("sic_code", "\"string: four-digit SIC code\""),
    ("sic_text", "\"string: SIC code title\""),
    ("logo", "\"string: absolute logo URL if one is mentioned\""),
];

pub fn schema_block() -> String {
    let body = FIELD_GUIDE
        .iter()
        .map(|(key, shape)| format!("  \"{key}\": {shape}"))
        .collect::<Vec<_>>()
        .join(",\n");
    format!("{{\n{body}\n}}")
}

pub fn build_prompt(cleaned: &CleanedText, strict: bool) -> String {
    let preamble = if strict {
        "IMPORTANT: your previous answer was not a valid JSON object. Return ONLY one valid JSON \
         object with exactly the keys below. No prose, no Markdown, no code fences.\n\n"
    } else {
        ""
    };
    format!(
        "{preamble}Extract company information from the website text below.\n\
         Respond with a single JSON object and nothing else, using exactly these keys:\n\
         {schema}\n\
         Use \"\" or [] when a value is unknown. Do not add any other keys.\n\n\
         Domain: {domain}\n\
         Website text:\n\
         {text}\n\n\
         JSON:",
        schema = schema_block(),
        domain = cleaned.domain,
        text = cleaned.text,
    )
}

/// Pull a JSON value out of model chatter: code fences are removed, and when
/// the remainder is not JSON the outermost `{ ... }` span is tried.
pub fn parse_model_json(raw: &str) -> Result<JsonValue, ExtractionError> {
    let unfenced = raw.replace("```json", "").replace("```JSON", "").replace("```", "");
    let trimmed = unfenced.trim();
    if let Ok(value) = serde_json::from_str::<JsonValue>(trimmed) {
        return Ok(value);
    }

    let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) else {
        return Err(ExtractionError::ParseFailure("no JSON object in model output".to_string()));
    };
    if end < start {
        return Err(ExtractionError::ParseFailure("no JSON object in model output".to_string()));
    }
    serde_json::from_str(&trimmed[start..=end])
        .map_err(|err| ExtractionError::ParseFailure(err.to_string()))
}

pub fn parse_profile(domain: &Domain, raw: &str) -> Result<(CompanyProfile, SchemaReport), ExtractionError> {
    let value = parse_model_json(raw)?;
    CompanyProfile::from_untrusted(domain, value)
        .map_err(|err| ExtractionError::SchemaViolation(err.to_string()))
}

/// Fill gaps the model left that the page itself can answer.
pub fn finalize_profile(mut profile: CompanyProfile, cleaned: &CleanedText) -> CompanyProfile {
    profile.domain = cleaned.domain.to_string();
    if profile.company_name.is_empty() {
        profile.company_name = cleaned
            .hints
            .title
            .clone()
            .unwrap_or_else(|| cleaned.domain.display_name());
    }
    fill_descriptions(&mut profile, &cleaned.text);
    fill_classification(&mut profile, &cleaned.text);
    if !is_http_url(&profile.logo) {
        profile.logo = cleaned
            .hints
            .logo
            .clone()
            .filter(|logo| is_http_url(logo))
            .unwrap_or_else(|| favicon_url(&cleaned.domain));
    }
    profile
}

fn fill_descriptions(profile: &mut CompanyProfile, text: &str) {
    if !profile.short_description.is_empty() {
        if profile.long_description.is_empty() {
            profile.long_description = profile.short_description.clone();
        }
        return;
    }
    let Some(generated) = describe_from_text(text) else {
        return;
    };
    debug!("short_description taken from page text");
    profile.short_description = generated.short;
    if profile.long_description.is_empty() {
        profile.long_description = generated.long;
    }
}

fn is_unknown(value: &str) -> bool {
    value.is_empty() || value.eq_ignore_ascii_case("unknown")
}

/// Fills empty taxonomy fields from [`classify_business`]. Fields the model
/// answered are kept, and nothing below a sector or industry that disagrees
/// with the classifier is filled.
fn fill_classification(profile: &mut CompanyProfile, text: &str) {
    if is_unknown(&profile.sector) {
        profile.sector.clear();
    }
    if is_unknown(&profile.industry) {
        profile.industry.clear();
    }
    let complete = [
        &profile.sector,
        &profile.industry,
        &profile.sub_industry,
        &profile.sic_code,
        &profile.sic_text,
        &profile.tags,
    ]
    .iter()
    .all(|field| !field.is_empty());
    if complete {
        return;
    }
    let Some(class) = classify_business(text) else {
        return;
    };

    if profile.sector.is_empty() {
        profile.sector = class.sector.to_string();
    } else if !profile.sector.eq_ignore_ascii_case(class.sector) {
        return;
    }
    if profile.industry.is_empty() {
        profile.industry = class.industry.to_string();
    } else if !profile.industry.eq_ignore_ascii_case(class.industry) {
        return;
    }
    if profile.sub_industry.is_empty() {
        profile.sub_industry = class.industry.to_string();
    }
    if profile.sic_code.is_empty() && profile.sic_text.is_empty() {
        profile.sic_code = class.sic_code.to_string();
        profile.sic_text = class.sic_text.to_string();
    }
    if profile.tags.is_empty() {
        profile.tags = format!("{}, {}", profile.sector, profile.industry);
    }
}

/// Lowercased words separated and surrounded by single spaces, so a term
/// matches only on word boundaries.
fn padded_words(text: &str) -> String {
    let mut out = String::from(" ");
    for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        out.push_str(&word.to_lowercase());
        out.push(' ');
    }
    out
}

fn has_term(padded: &str, term: &str) -> bool {
    padded.contains(&format!(" {term} "))
}

fn count_terms(padded: &str, terms: &[&str]) -> usize {
    terms.iter().filter(|term| has_term(padded, term)).count()
}

struct IndustryRule {
    name: &'static str,
    keywords: &'static [&'static str],
    sic_code: &'static str,
    sic_text: &'static str,
}

struct SectorRule {
    name: &'static str,
    keywords: &'static [&'static str],
    industries: &'static [IndustryRule],
}

// Terms are pre-split the way `padded_words` splits page text.
const SECTOR_RULES: &[SectorRule] = &[
    SectorRule {
        name: "Technology",
        keywords: &[
            "software", "saas", "cloud", "app", "platform", "tech", "digital", "ai", "ml", "data",
            "cyber", "it solutions", "computer", "programming", "web", "mobile", "api", "database",
            "server",
        ],
        industries: &[
            IndustryRule {
                name: "Software",
                keywords: &["software", "saas", "application", "app development", "platform", "program"],
                sic_code: "7372",
                sic_text: "Prepackaged Software",
            },
            IndustryRule {
                name: "IT Services",
                keywords: &["consulting", "it services", "managed services", "support", "it consulting"],
                sic_code: "7371",
                sic_text: "Computer Programming Services",
            },
            IndustryRule {
                name: "Cybersecurity",
                keywords: &["security", "cyber", "encryption", "firewall", "protection", "antivirus"],
                sic_code: "7373",
                sic_text: "Computer Integrated Systems Design",
            },
            IndustryRule {
                name: "Web Development",
                keywords: &["web", "website", "web design", "web development", "frontend", "backend"],
                sic_code: "7371",
                sic_text: "Computer Programming Services",
            },
        ],
    },
    SectorRule {
        name: "Financial Services",
        keywords: &[
            "bank", "banking", "finance", "investment", "insurance", "trading", "wealth", "credit",
            "loan", "mortgage", "fintech", "payment", "payments", "accounting", "financial",
        ],
        industries: &[
            IndustryRule {
                name: "Banking",
                keywords: &["bank", "banking", "savings", "checking", "deposit", "atm"],
                sic_code: "6020",
                sic_text: "Commercial Banks",
            },
            IndustryRule {
                name: "Investment",
                keywords: &["investment", "portfolio", "trading", "stocks", "securities", "broker"],
                sic_code: "6211",
                sic_text: "Security Brokers & Dealers",
            },
            IndustryRule {
                name: "Insurance",
                keywords: &["insurance", "coverage", "policy", "claims", "underwriting"],
                sic_code: "6311",
                sic_text: "Life Insurance",
            },
            IndustryRule {
                name: "Accounting",
                keywords: &["accounting", "bookkeeping", "tax", "audit", "cpa"],
                sic_code: "8721",
                sic_text: "Accounting, Auditing & Bookkeeping",
            },
        ],
    },
    SectorRule {
        name: "Healthcare",
        keywords: &[
            "health", "medical", "hospital", "clinic", "patient", "doctor", "nurse",
            "pharmaceutical", "biotech", "medicine", "care", "wellness", "therapy", "healthcare",
        ],
        industries: &[
            IndustryRule {
                name: "Healthcare Services",
                keywords: &["hospital", "clinic", "patient care", "medical services", "healthcare"],
                sic_code: "8062",
                sic_text: "General Medical & Surgical Hospitals",
            },
            IndustryRule {
                name: "Pharmaceuticals",
                keywords: &["pharmaceutical", "drug", "medication", "pharmacy", "prescription"],
                sic_code: "2834",
                sic_text: "Pharmaceutical Preparations",
            },
            IndustryRule {
                name: "Medical Devices",
                keywords: &["medical device", "equipment", "diagnostic", "imaging", "surgical"],
                sic_code: "3841",
                sic_text: "Surgical & Medical Instruments",
            },
        ],
    },
    SectorRule {
        name: "Retail",
        keywords: &[
            "retail", "store", "shop", "ecommerce", "e commerce", "marketplace", "buy", "sell",
            "products", "shopping", "merchant", "sales",
        ],
        industries: &[
            IndustryRule {
                name: "E-commerce",
                keywords: &["ecommerce", "e commerce", "online store", "marketplace", "shopping", "online shop"],
                sic_code: "5961",
                sic_text: "Catalog & Mail-Order Houses",
            },
            IndustryRule {
                name: "Consumer Goods",
                keywords: &["products", "goods", "merchandise", "consumer"],
                sic_code: "5399",
                sic_text: "Miscellaneous General Merchandise Stores",
            },
        ],
    },
    SectorRule {
        name: "Manufacturing",
        keywords: &[
            "manufacturing", "production", "factory", "industrial", "machinery", "equipment",
            "fabrication", "assembly", "manufacture",
        ],
        industries: &[IndustryRule {
            name: "Industrial Manufacturing",
            keywords: &["manufacturing", "production", "assembly", "factory"],
            sic_code: "3569",
            sic_text: "General Industrial Machinery",
        }],
    },
    SectorRule {
        name: "Professional Services",
        keywords: &[
            "consulting", "advisory", "professional services", "legal", "accounting", "marketing",
            "advertising", "design", "agency", "recruitment", "consulting firm",
        ],
        industries: &[
            IndustryRule {
                name: "Consulting",
                keywords: &["consulting", "advisory", "strategy", "consultant"],
                sic_code: "8742",
                sic_text: "Management Consulting Services",
            },
            IndustryRule {
                name: "Legal Services",
                keywords: &["legal", "law", "attorney", "lawyer", "law firm"],
                sic_code: "8111",
                sic_text: "Legal Services",
            },
            IndustryRule {
                name: "Marketing",
                keywords: &["marketing", "advertising", "branding", "agency", "digital marketing"],
                sic_code: "7311",
                sic_text: "Advertising Agencies",
            },
            IndustryRule {
                name: "Design",
                keywords: &["design", "graphic", "creative", "branding", "ux", "ui"],
                sic_code: "7336",
                sic_text: "Commercial Art & Graphic Design",
            },
        ],
    },
    SectorRule {
        name: "Education",
        keywords: &[
            "education", "school", "university", "training", "learning", "course", "teaching",
            "e learning", "academic", "tutor",
        ],
        industries: &[IndustryRule {
            name: "Educational Services",
            keywords: &["education", "training", "learning", "school", "university"],
            sic_code: "8200",
            sic_text: "Educational Services",
        }],
    },
    SectorRule {
        name: "Real Estate",
        keywords: &[
            "real estate", "property", "housing", "commercial property", "residential", "realtor",
            "broker",
        ],
        industries: &[IndustryRule {
            name: "Real Estate Services",
            keywords: &["real estate", "property management", "realtor", "broker"],
            sic_code: "6531",
            sic_text: "Real Estate Agents & Managers",
        }],
    },
    SectorRule {
        name: "Transportation",
        keywords: &["transportation", "logistics", "shipping", "delivery", "freight", "trucking", "transport"],
        industries: &[IndustryRule {
            name: "Logistics",
            keywords: &["logistics", "shipping", "freight", "delivery"],
            sic_code: "4213",
            sic_text: "Trucking, Except Local",
        }],
    },
    SectorRule {
        name: "Hospitality",
        keywords: &["hotel", "restaurant", "hospitality", "travel", "tourism", "accommodation", "food service"],
        industries: &[
            IndustryRule {
                name: "Hotels",
                keywords: &["hotel", "accommodation", "lodging", "resort"],
                sic_code: "7011",
                sic_text: "Hotels & Motels",
            },
            IndustryRule {
                name: "Restaurants",
                keywords: &["restaurant", "dining", "food service", "cafe", "catering"],
                sic_code: "5812",
                sic_text: "Eating Places",
            },
        ],
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub sector: &'static str,
    pub industry: &'static str,
    pub sic_code: &'static str,
    pub sic_text: &'static str,
}

/// Offline keyword classifier. The sector with the most keyword hits wins,
/// then the best industry inside it (the first listed when none hits). Ties
/// go to the earlier rule. `None` when no sector keyword occurs at all.
pub fn classify_business(text: &str) -> Option<Classification> {
    let padded = padded_words(text);
    let sector = best_rule(SECTOR_RULES, |rule| count_terms(&padded, rule.keywords))?;
    let industry = best_rule(sector.industries, |rule| count_terms(&padded, rule.keywords))
        .or_else(|| sector.industries.first())?;
    Some(Classification {
        sector: sector.name,
        industry: industry.name,
        sic_code: industry.sic_code,
        sic_text: industry.sic_text,
    })
}

fn best_rule<T>(rules: &[T], score: impl Fn(&T) -> usize) -> Option<&T> {
    let mut best: Option<(&T, usize)> = None;
    for rule in rules {
        let hits = score(rule);
        if hits > 0 && best.map_or(true, |(_, top)| hits > top) {
            best = Some((rule, hits));
        }
    }
    best.map(|(rule, _)| rule)
}

const SENTENCE_NOISE: [&str; 12] = [
    "cookie",
    "privacy policy",
    "terms of service",
    "login",
    "sign up",
    "subscribe",
    "newsletter",
    "click here",
    "read more",
    "all rights reserved",
    "skip to content",
    "follow us",
];

const BUSINESS_PHRASES: [&str; 21] = [
    "we provide", "we offer", "we help", "we are", "we specialize", "our company", "our mission",
    "our service", "our product", "leading provider", "established", "founded", "specializes in",
    "delivers", "creates", "develops", "builds", "designs", "trusted by", "serving", "dedicated to",
];

const INDUSTRY_TERMS: [&str; 19] = [
    "software", "technology", "services", "solutions", "platform", "healthcare", "financial",
    "consulting", "manufacturing", "retail", "education", "enterprise", "business", "professional",
    "digital", "innovative", "comprehensive", "quality", "expert",
];

const WEAK_TERMS: [&str; 5] = ["click", "here", "more info", "learn more", "contact us"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptions {
    pub short: String,
    pub long: String,
}

fn candidate_sentences(text: &str) -> Vec<&str> {
    text.split(['.', '!', '?'])
        .map(str::trim)
        .filter(|sentence| (20..=200).contains(&sentence.chars().count()))
        .filter(|sentence| {
            let lower = sentence.to_lowercase();
            !SENTENCE_NOISE.iter().any(|noise| lower.contains(noise))
        })
        .filter(|sentence| {
            let total = sentence.chars().count();
            let symbols = sentence
                .chars()
                .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
                .count();
            symbols * 10 <= total * 3
        })
        .collect()
}

fn sentence_score(sentence: &str) -> i64 {
    let padded = padded_words(sentence);
    let strong = count_terms(&padded, &BUSINESS_PHRASES) as i64;
    let topical = count_terms(&padded, &INDUSTRY_TERMS) as i64;
    let weak = count_terms(&padded, &WEAK_TERMS) as i64;
    strong * 15 + topical * 5 - weak * 20
}

/// Offline description fallback: rank the page's sentences by business
/// phrasing. Short is the best sentence, long the best three. `None` when
/// the page has no usable sentence.
pub fn describe_from_text(text: &str) -> Option<Descriptions> {
    let sentences = candidate_sentences(text);
    if sentences.is_empty() {
        return None;
    }
    let mut ranked: Vec<(&str, i64)> = sentences.iter().map(|s| (*s, sentence_score(s))).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    let mut best: Vec<&str> = ranked
        .iter()
        .filter(|(_, score)| *score > 0)
        .map(|(sentence, _)| *sentence)
        .collect();
    if best.is_empty() {
        best = sentences;
    }
    best.truncate(3);

    let short = format!("{}.", best[0]);
    let long = format!("{}.", best.join(". "));
    let long = if long.chars().count() < 40 { short.clone() } else { long };
    Some(Descriptions { short, long })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total inference calls per domain, first attempt included.
    pub max_attempts: usize,
    /// Pause before the first re-attempt after a timeout or unavailability;
    /// doubles per re-attempt up to `max_delay`.
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Re-attempts follow each other without pausing.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// `retry` counts re-attempts from zero.
    pub fn delay_before(&self, retry: usize) -> Duration {
        let factor = 1u32.checked_shl(retry as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractorConfig {
    pub retry: RetryPolicy,
    pub inference_timeout: Duration,
    pub inference_concurrency: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            inference_timeout: Duration::from_secs(60),
            inference_concurrency: 1,
        }
    }
}

pub struct Extractor {
    client: Arc<dyn InferenceClient>,
    config: ExtractorConfig,
    permits: Arc<Semaphore>,
}

impl Extractor {
    pub fn new(client: Arc<dyn InferenceClient>, config: ExtractorConfig) -> Self {
        Self {
            client,
            permits: Arc::new(Semaphore::new(config.inference_concurrency.max(1))),
            config,
        }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    async fn generate(&self, prompt: &str) -> Result<String, ExtractionError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ExtractionError::InferenceUnavailable("inference permits closed".to_string()))?;

        match tokio::time::timeout(self.config.inference_timeout, self.client.generate(prompt)).await {
            Err(_elapsed) => Err(ExtractionError::InferenceTimeout),
            Ok(Err(InferenceError::Timeout)) => Err(ExtractionError::InferenceTimeout),
            Ok(Err(InferenceError::Unavailable(msg))) => Err(ExtractionError::InferenceUnavailable(msg)),
            Ok(Err(InferenceError::Protocol(msg))) => Err(ExtractionError::ParseFailure(msg)),
            Ok(Ok(text)) => Ok(text),
        }
    }

    /// Prompt, validate and retry until a schema-shaped profile comes back or
    /// the attempt budget is spent. The error of the final attempt is returned.
    pub async fn extract(&self, cleaned: &CleanedText) -> Result<CompanyProfile, ExtractionError> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut last_error: Option<ExtractionError> = None;

        for attempt in 0..max_attempts {
            if let Some(err) = &last_error {
                if err.is_transient() {
                    tokio::time::sleep(self.config.retry.delay_before(attempt - 1)).await;
                }
            }
            let strict = matches!(
                last_error,
                Some(ExtractionError::ParseFailure(_) | ExtractionError::SchemaViolation(_))
            );
            let prompt = build_prompt(cleaned, strict);

            let outcome = match self.generate(&prompt).await {
                Ok(raw) => parse_profile(&cleaned.domain, &raw),
                Err(err) => Err(err),
            };
            match outcome {
                Ok((profile, report)) => {
                    if !report.dropped.is_empty() || !report.missing.is_empty() {
                        debug!(
                            attempt,
                            dropped = ?report.dropped,
                            missing = ?report.missing,
                            coerced = ?report.coerced,
                            "normalized model output"
                        );
                    }
                    return Ok(finalize_profile(profile, cleaned));
                }
                Err(err) => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts,
                        error_kind = err.kind(),
                        error = %err,
                        "extraction attempt failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ExtractionError::ParseFailure("no extraction attempt was made".to_string())))
    }
}
