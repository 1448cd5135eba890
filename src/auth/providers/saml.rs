//! SAML identity provider — signed assertion validation.
//!
//! # Hardening
//!
//! The assertion is rejected outright if it contains a DTD or entity
//! declaration: external entity resolution (XXE) is never attempted because
//! the document never reaches the parser with one present, and `quick-xml`
//! does not resolve external entities in any case.
//!
//! # Checks, in order
//!
//! 1. No `<!DOCTYPE` / `<!ENTITY` anywhere in the document.
//! 2. Structural parse: conditions, audience, subject confirmation, NameID,
//!    attributes, signature parts.
//! 3. `NotBefore` / `NotOnOrAfter` window with configured clock skew.
//! 4. Audience restriction matches our entity id.
//! 5. `InReplyTo` matches an outstanding AuthnRequest within its TTL.
//! 6. RSA-SHA256 `SignatureValue` over `SignedInfo`, and the reference
//!    digest over the document with the signature element excised. The
//!    document is expected to arrive in the canonical form the IdP signed,
//!    which holds for exclusive-c14n emitters.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use aws_lc_rs::signature::{RSA_PKCS1_2048_8192_SHA256, UnparsedPublicKey};
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use quick_xml::Reader;
use quick_xml::events::Event;
use tracing::{debug, warn};

use crate::auth::credentials::Credential;
use crate::auth::principal::{Principal, PrincipalKind};
use crate::auth::providers::{IdentityProvider, ProviderError};
use crate::config::SamlProviderConfig;

/// SAML provider validating assertions against one trusted IdP certificate.
pub struct SamlProvider {
    config: SamlProviderConfig,
    /// DER-encoded RSA public key extracted from the trusted certificate
    idp_public_key: Vec<u8>,
    /// Outstanding AuthnRequest ids awaiting an InReplyTo binding
    outstanding: DashMap<String, Instant>,
}

/// Everything pulled out of the assertion document.
#[derive(Debug, Default)]
struct ParsedAssertion {
    not_before: Option<String>,
    not_on_or_after: Option<String>,
    audience: Option<String>,
    in_reply_to: Option<String>,
    name_id: Option<String>,
    attributes: HashMap<String, Vec<String>>,
    signature_value: Option<String>,
    digest_value: Option<String>,
}

impl SamlProvider {
    /// Create from configuration, parsing the trusted certificate.
    pub fn new(config: SamlProviderConfig) -> Result<Self, ProviderError> {
        let idp_public_key = public_key_from_pem(&config.idp_certificate_pem)?;
        Ok(Self {
            config,
            idp_public_key,
            outstanding: DashMap::new(),
        })
    }

    /// Record an outgoing AuthnRequest id for later InReplyTo binding.
    pub fn register_request(&self, request_id: impl Into<String>) {
        // Opportunistic purge keeps the map bounded without a reaper task.
        let ttl = self.config.request_ttl;
        self.outstanding.retain(|_, issued| issued.elapsed() < ttl);
        self.outstanding.insert(request_id.into(), Instant::now());
    }

    fn consume_request(&self, request_id: &str) -> bool {
        match self.outstanding.remove(request_id) {
            Some((_, issued)) => issued.elapsed() < self.config.request_ttl,
            None => false,
        }
    }

    fn check_window(&self, parsed: &ParsedAssertion) -> Result<(), ProviderError> {
        let now = Utc::now();
        let skew = chrono::Duration::from_std(self.config.clock_skew)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let not_before = parse_saml_instant(parsed.not_before.as_deref())?;
        let not_on_or_after = parse_saml_instant(parsed.not_on_or_after.as_deref())?;

        if now + skew < not_before {
            return Err(ProviderError::AssertionExpired);
        }
        if now - skew >= not_on_or_after {
            return Err(ProviderError::AssertionExpired);
        }
        Ok(())
    }

    fn verify_signature(&self, xml: &str, parsed: &ParsedAssertion) -> Result<(), ProviderError> {
        let signature_b64 = parsed
            .signature_value
            .as_deref()
            .ok_or_else(|| ProviderError::AssertionInvalid("assertion is not signed".to_string()))?;
        let signature = decode_b64(signature_b64)?;

        let (start, end) = element_span(xml, "SignedInfo")
            .ok_or_else(|| ProviderError::AssertionInvalid("missing SignedInfo".to_string()))?;
        let signed_info = &xml.as_bytes()[start..end];

        UnparsedPublicKey::new(&RSA_PKCS1_2048_8192_SHA256, &self.idp_public_key)
            .verify(signed_info, &signature)
            .map_err(|_| {
                warn!("SAML assertion signature verification failed");
                ProviderError::AssertionInvalid("signature verification failed".to_string())
            })?;

        // The signature covers SignedInfo; the reference digest binds the
        // rest of the document to it.
        let digest_b64 = parsed
            .digest_value
            .as_deref()
            .ok_or_else(|| ProviderError::AssertionInvalid("missing DigestValue".to_string()))?;
        let expected = decode_b64(digest_b64)?;

        let without_signature = excise_element(xml, "Signature")
            .ok_or_else(|| ProviderError::AssertionInvalid("missing Signature".to_string()))?;
        let actual = sha256_raw(without_signature.as_bytes());

        if actual != expected {
            warn!("SAML reference digest mismatch");
            return Err(ProviderError::AssertionInvalid("digest mismatch".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl IdentityProvider for SamlProvider {
    fn name(&self) -> &'static str {
        "saml"
    }

    fn handles(&self, credential: &Credential) -> bool {
        matches!(credential, Credential::Saml { .. })
    }

    async fn verify(&self, credential: &Credential) -> Result<Principal, ProviderError> {
        let Credential::Saml { assertion_xml, relay_state: _ } = credential else {
            return Err(ProviderError::CredentialInvalid);
        };

        reject_dtd(assertion_xml)?;
        let parsed = parse_assertion(assertion_xml)?;

        self.check_window(&parsed)?;

        let audience = parsed.audience.as_deref().unwrap_or("");
        if audience != self.config.audience {
            return Err(ProviderError::AssertionInvalid(format!(
                "audience '{audience}' is not this service"
            )));
        }

        let in_reply_to = parsed
            .in_reply_to
            .as_deref()
            .ok_or_else(|| ProviderError::AssertionInvalid("missing InReplyTo".to_string()))?;
        if !self.consume_request(in_reply_to) {
            return Err(ProviderError::AssertionInvalid(
                "InReplyTo does not match an outstanding request".to_string(),
            ));
        }

        self.verify_signature(assertion_xml, &parsed)?;

        let name_id = parsed
            .name_id
            .as_deref()
            .ok_or_else(|| ProviderError::AssertionInvalid("missing NameID".to_string()))?;

        let teams: BTreeSet<String> = parsed
            .attributes
            .get("groups")
            .or_else(|| parsed.attributes.get("memberOf"))
            .map(|v| v.iter().cloned().collect())
            .unwrap_or_default();

        let email = parsed
            .attributes
            .get("email")
            .or_else(|| parsed.attributes.get("mail"))
            .and_then(|v| v.first())
            .cloned();

        let display_name = parsed
            .attributes
            .get("displayName")
            .and_then(|v| v.first())
            .cloned()
            .unwrap_or_else(|| name_id.to_string());

        debug!(name_id = %name_id, "SAML assertion accepted");

        Ok(Principal {
            principal_id: format!("saml:{name_id}"),
            kind: PrincipalKind::User,
            display_name,
            email,
            roles: BTreeSet::new(),
            teams,
            attributes: HashMap::new(),
        })
    }
}

/// Reject documents carrying DTD or entity declarations before parsing.
fn reject_dtd(xml: &str) -> Result<(), ProviderError> {
    let upper = xml.to_ascii_uppercase();
    if upper.contains("<!DOCTYPE") || upper.contains("<!ENTITY") {
        warn!("SAML assertion rejected: contains DTD/entity declaration");
        return Err(ProviderError::AssertionInvalid(
            "document type definitions are not allowed".to_string(),
        ));
    }
    Ok(())
}

/// Walk the document once, collecting the fields the checks need.
fn parse_assertion(xml: &str) -> Result<ParsedAssertion, ProviderError> {
    let mut reader = Reader::from_str(xml);
    let mut parsed = ParsedAssertion::default();
    let mut stack: Vec<String> = Vec::new();
    let mut current_attribute_name: Option<String> = None;

    loop {
        match reader.read_event() {
            Err(e) => {
                return Err(ProviderError::AssertionInvalid(format!("malformed XML: {e}")));
            }
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                let local = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                collect_attrs(&e, &local, &mut parsed, &mut current_attribute_name)?;
                stack.push(local);
            }
            Ok(Event::Empty(e)) => {
                let local = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                collect_attrs(&e, &local, &mut parsed, &mut current_attribute_name)?;
            }
            Ok(Event::End(_)) => {
                if stack.pop().as_deref() == Some("Attribute") {
                    current_attribute_name = None;
                }
            }
            Ok(Event::Text(t)) => {
                let decoded = t
                    .decode()
                    .map_err(|e| ProviderError::AssertionInvalid(format!("malformed XML: {e}")))?;
                let text = quick_xml::escape::unescape(&decoded)
                    .map_err(|e| ProviderError::AssertionInvalid(format!("malformed XML: {e}")))?
                    .trim()
                    .to_string();
                if text.is_empty() {
                    continue;
                }
                match stack.last().map(String::as_str) {
                    Some("Audience") => parsed.audience = Some(text),
                    Some("NameID") => parsed.name_id = Some(text),
                    Some("SignatureValue") => parsed.signature_value = Some(text),
                    Some("DigestValue") => parsed.digest_value = Some(text),
                    Some("AttributeValue") => {
                        if let Some(name) = &current_attribute_name {
                            parsed.attributes.entry(name.clone()).or_default().push(text);
                        }
                    }
                    _ => {}
                }
            }
            Ok(_) => {}
        }
    }

    Ok(parsed)
}

fn collect_attrs(
    e: &quick_xml::events::BytesStart<'_>,
    local: &str,
    parsed: &mut ParsedAssertion,
    current_attribute_name: &mut Option<String>,
) -> Result<(), ProviderError> {
    let get = |wanted: &str| -> Result<Option<String>, ProviderError> {
        for attr in e.attributes() {
            let attr =
                attr.map_err(|e| ProviderError::AssertionInvalid(format!("malformed XML: {e}")))?;
            if attr.key.local_name().as_ref() == wanted.as_bytes() {
                let value = attr
                    .unescape_value()
                    .map_err(|e| ProviderError::AssertionInvalid(format!("malformed XML: {e}")))?;
                return Ok(Some(value.into_owned()));
            }
        }
        Ok(None)
    };

    match local {
        "Conditions" => {
            parsed.not_before = get("NotBefore")?;
            parsed.not_on_or_after = get("NotOnOrAfter")?;
        }
        "SubjectConfirmationData" => {
            parsed.in_reply_to = get("InReplyTo")?;
            // SubjectConfirmationData may carry its own NotOnOrAfter; the
            // Conditions window is the one enforced.
        }
        "Attribute" => {
            *current_attribute_name = get("Name")?;
        }
        _ => {}
    }
    Ok(())
}

fn parse_saml_instant(value: Option<&str>) -> Result<DateTime<Utc>, ProviderError> {
    let value = value
        .ok_or_else(|| ProviderError::AssertionInvalid("missing validity window".to_string()))?;
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ProviderError::AssertionInvalid(format!("bad timestamp '{value}'")))
}

/// Byte span `[start, end)` of the first element named `local` (any prefix),
/// including its tags.
fn element_span(xml: &str, local: &str) -> Option<(usize, usize)> {
    let bytes = xml.as_bytes();
    let mut search = 0;
    while let Some(offset) = xml[search..].find('<') {
        let lt = search + offset;
        let rest = &xml[lt + 1..];
        let name_end = rest
            .find(|c: char| c == ' ' || c == '>' || c == '/' || c == '\t' || c == '\n')
            .unwrap_or(rest.len());
        let name = &rest[..name_end];
        if !name.starts_with('/')
            && !name.starts_with('?')
            && !name.starts_with('!')
            && (name == local || name.ends_with(&format!(":{local}")))
        {
            let end_tag = format!("</{name}>");
            if let Some(end_offset) = xml[lt..].find(&end_tag) {
                return Some((lt, lt + end_offset + end_tag.len()));
            }
            // Self-closing form
            if let Some(close) = xml[lt..].find("/>") {
                return Some((lt, lt + close + 2));
            }
            return None;
        }
        search = lt + 1;
        if search >= bytes.len() {
            break;
        }
    }
    None
}

/// The document with the first element named `local` removed.
fn excise_element(xml: &str, local: &str) -> Option<String> {
    let (start, end) = element_span(xml, local)?;
    let mut out = String::with_capacity(xml.len() - (end - start));
    out.push_str(&xml[..start]);
    out.push_str(&xml[end..]);
    Some(out)
}

fn decode_b64(value: &str) -> Result<Vec<u8>, ProviderError> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|_| ProviderError::AssertionInvalid("bad base64".to_string()))
}

fn sha256_raw(data: &[u8]) -> Vec<u8> {
    use sha2::Digest;
    let mut hasher = sha2::Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Extract the DER RSA public key from a PEM certificate.
fn public_key_from_pem(pem: &str) -> Result<Vec<u8>, ProviderError> {
    let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| ProviderError::ConfigurationError(format!("bad IdP certificate PEM: {e}")))?;
    let cert = parsed
        .parse_x509()
        .map_err(|e| ProviderError::ConfigurationError(format!("bad IdP certificate: {e}")))?;
    Ok(cert.public_key().subject_public_key.data.to_vec())
}
