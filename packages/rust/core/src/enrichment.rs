//! AI analysis for the Enrich stages.
//!
//! [`Analyzer`] is the collaborator the stage runner calls; [`ChatAnalyzer`]
//! implements it against any OpenAI-compatible chat-completions endpoint
//! (DeepSeek by default). Replies are free text that contains one JSON
//! object; we pull that object out and deserialize it.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use dealdriver_shared::{
    AnalysisConfig, CompanyAnalysis, DealDriverError, LeadAnalysis, Result, resolve_secret,
};

/// Company analysis needs at least this much scraped text.
pub const MIN_CONTENT_CHARS: usize = 50;

/// Scraped text sent to the model is cut to this many characters.
const MAX_PROMPT_CONTENT: usize = 12_000;

/// Personas the lead prompt may return.
pub const BUYER_PERSONAS: &[&str] = &[
    "Technical Decision Maker",
    "Business Executive",
    "End User",
    "Influencer",
    "Unknown",
];

static JSON_OBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

// ---------------------------------------------------------------------------
// Analyzer trait
// ---------------------------------------------------------------------------

/// What the analyzer knows about a contact.
#[derive(Debug, Clone)]
pub struct LeadContext<'a> {
    pub email: &'a str,
    pub first_name: &'a str,
    pub last_name: &'a str,
    pub company_domain: &'a str,
    /// Start of the scraped site text.
    pub company_content: &'a str,
}

/// The Enrich stage collaborator.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze_company(
        &self,
        domain: &str,
        content: &str,
        emails: &[String],
    ) -> Result<CompanyAnalysis>;

    async fn analyze_lead(&self, lead: &LeadContext<'_>) -> Result<LeadAnalysis>;
}

// ---------------------------------------------------------------------------
// Chat completions client
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// [`Analyzer`] backed by an OpenAI-compatible chat API.
pub struct ChatAnalyzer {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl ChatAnalyzer {
    pub fn new(config: &AnalysisConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DealDriverError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    /// Build from config, reading the key from the configured env var.
    pub fn from_config(config: &AnalysisConfig) -> Result<Self> {
        let api_key = resolve_secret(&config.api_key_env, "Analysis API key")?;
        Self::new(config, api_key)
    }

    async fn complete(&self, system: &str, prompt: String) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: system.into(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| DealDriverError::Network(format!("analysis request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(1);
            return Err(DealDriverError::RateLimitTimeout {
                resource: "ai-api".into(),
                waited: Duration::from_secs(retry_after),
            });
        }
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(DealDriverError::Analysis(format!("HTTP {status}: {message}")));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| DealDriverError::Analysis(format!("malformed response: {e}")))?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| DealDriverError::Analysis("response has no choices".into()))
    }
}

#[async_trait]
impl Analyzer for ChatAnalyzer {
    #[instrument(skip_all, fields(domain = %domain))]
    async fn analyze_company(
        &self,
        domain: &str,
        content: &str,
        emails: &[String],
    ) -> Result<CompanyAnalysis> {
        if content.trim().chars().count() < MIN_CONTENT_CHARS {
            return Err(DealDriverError::Analysis(format!(
                "not enough content to analyze ({} chars)",
                content.trim().chars().count()
            )));
        }

        let reply = self
            .complete(
                "You are a B2B market analyst. Reply with a single JSON object and nothing else.",
                company_prompt(domain, content, emails),
            )
            .await?;
        let mut analysis: CompanyAnalysis = parse_json_reply(&reply)?;
        analysis.confidence_score = analysis.confidence_score.clamp(0.0, 1.0);
        debug!(industry = %analysis.industry, "company analyzed");
        Ok(analysis)
    }

    #[instrument(skip_all, fields(email = %lead.email))]
    async fn analyze_lead(&self, lead: &LeadContext<'_>) -> Result<LeadAnalysis> {
        let reply = self
            .complete(
                "You classify B2B contacts into buyer personas. Reply with a single JSON object and nothing else.",
                lead_prompt(lead),
            )
            .await?;
        let mut analysis: LeadAnalysis = parse_json_reply(&reply)?;
        normalize_lead_analysis(&mut analysis);
        Ok(analysis)
    }
}

// ---------------------------------------------------------------------------
// Prompts & parsing
// ---------------------------------------------------------------------------

fn company_prompt(domain: &str, content: &str, emails: &[String]) -> String {
    let content = dealdriver_crawler::extract::truncate_chars(content, MAX_PROMPT_CONTENT);
    format!(
        r#"Analyze the company behind {domain} using its website text below.

Return JSON with exactly these keys:
{{
  "business_type_description": string,
  "company_summary": string,
  "industry": string,
  "naics_code": string,
  "target_market": string,
  "primary_products_services": [string],
  "value_propositions": [string],
  "competitive_advantages": [string],
  "technologies_used": [string],
  "certifications_awards": [string],
  "pain_points_addressed": [string],
  "headquarters_location": string or null,
  "company_size": string or null,
  "confidence_score": number between 0 and 1
}}

Known contact addresses: {emails}

Website text:
{content}"#,
        emails = if emails.is_empty() {
            "none".to_string()
        } else {
            emails.join(", ")
        },
    )
}

fn lead_prompt(lead: &LeadContext<'_>) -> String {
    let context = dealdriver_crawler::extract::truncate_chars(lead.company_content, 2_000);
    format!(
        r#"Classify this contact.

Email: {email}
Name: {first} {last}
Company domain: {domain}
Company context: {context}

Return JSON:
{{
  "buyer_persona": one of {personas:?},
  "lead_score_adjustment": integer from -10 to 10,
  "confidence": number between 0 and 1,
  "reasoning": short string
}}"#,
        email = lead.email,
        first = lead.first_name,
        last = lead.last_name,
        domain = lead.company_domain,
        personas = BUYER_PERSONAS,
    )
}

/// Extract and deserialize the JSON object embedded in a model reply.
pub fn parse_json_reply<T: serde::de::DeserializeOwned>(reply: &str) -> Result<T> {
    let json = JSON_OBJECT_RE
        .find(reply)
        .map(|m| m.as_str())
        .ok_or_else(|| DealDriverError::Analysis("reply contains no JSON object".into()))?;
    serde_json::from_str(json)
        .map_err(|e| DealDriverError::Analysis(format!("reply JSON does not match schema: {e}")))
}

fn normalize_lead_analysis(analysis: &mut LeadAnalysis) {
    analysis.lead_score_adjustment = analysis.lead_score_adjustment.clamp(-10, 10);
    analysis.confidence = analysis.confidence.clamp(0.0, 1.0);
    if !BUYER_PERSONAS.contains(&analysis.buyer_persona.as_str()) {
        analysis.buyer_persona = "Unknown".into();
    }
}

/// First and last name guessed from an e-mail local part.
///
/// `jane.doe@` → ("Jane", "Doe"); `j_r_smith@` → ("J", "Smith"); `info@` → ("Info", "").
pub fn derive_lead_name(email: &str) -> (String, String) {
    let local = email.split('@').next().unwrap_or_default();
    let separator = ['.', '_', '-'].into_iter().find(|sep| local.contains(*sep));

    match separator {
        Some(sep) => {
            let parts: Vec<&str> = local.split(sep).filter(|p| !p.is_empty()).collect();
            match parts.as_slice() {
                [] => (String::new(), String::new()),
                [only] => (title_case(only), String::new()),
                [first, .., last] => (title_case(first), title_case(last)),
            }
        }
        None => (title_case(local), String::new()),
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}
