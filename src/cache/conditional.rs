//! Conditional GET evaluation.
//!
//! Validators are derived from cache keys, never from rendered bytes, so the
//! 304 path and the 200 path attach identical headers without rendering.

use std::future::Future;

use axum::http::header::{CACHE_CONTROL, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::counter;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::debug;

use crate::domain::{CacheError, Cacheable};

use super::keys::{CacheKey, KeyContext, KeyGenerator};

const METRIC_NOT_MODIFIED_TOTAL: &str = "cachet_conditional_not_modified_total";
const TOKEN_LEN: usize = 32;

const HTTP_DATE: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// `Cache-Control` policy attached to conditional responses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Allow shared caches (proxies, CDNs) to store the response.
    pub public: bool,
    /// Freshness lifetime; clients skip revalidation until it lapses.
    pub max_age_seconds: u64,
    pub must_revalidate: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            public: false,
            max_age_seconds: 0,
            must_revalidate: true,
        }
    }
}

impl CachePolicy {
    pub fn header_value(&self) -> String {
        let scope = if self.public { "public" } else { "private" };
        let mut value = format!("{scope}, max-age={}", self.max_age_seconds);
        if self.must_revalidate {
            value.push_str(", must-revalidate");
        }
        value
    }
}

/// Freshness validators for one response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConditionalValidators {
    pub strong_token: Option<String>,
    pub weak_timestamp: Option<OffsetDateTime>,
}

impl ConditionalValidators {
    pub fn new(strong_token: Option<String>, weak_timestamp: Option<OffsetDateTime>) -> Self {
        Self {
            strong_token,
            weak_timestamp: weak_timestamp.map(truncate_to_second),
        }
    }

    /// Validators for a response rendered from `resources` under `context`.
    ///
    /// The token digests the ordered cache keys; the timestamp is the latest
    /// of each resource's own modification time and its last touch.
    pub fn for_resources(
        generator: &KeyGenerator,
        resources: &[&dyn Cacheable],
        context: &KeyContext,
    ) -> Result<Self, CacheError> {
        let mut keys = Vec::with_capacity(resources.len());
        let mut latest: Option<OffsetDateTime> = None;

        for resource in resources {
            keys.push(generator.key_for(*resource, context)?);

            let touched_at = resource
                .identity()
                .and_then(|id| generator.versions().current(&id).touched_at);
            for candidate in [resource.last_modified(), touched_at].into_iter().flatten() {
                latest = Some(latest.map_or(candidate, |l| l.max(candidate)));
            }
        }

        Ok(Self::for_keys(&keys, latest))
    }

    pub fn for_keys(keys: &[CacheKey], last_modified: Option<OffsetDateTime>) -> Self {
        let token = if keys.is_empty() {
            None
        } else {
            let mut hasher = Sha256::new();
            for key in keys {
                hasher.update(key.as_str().as_bytes());
                hasher.update(b"\n");
            }
            let digest = hex::encode(hasher.finalize());
            Some(digest[..TOKEN_LEN].to_string())
        };
        Self::new(token, last_modified)
    }

    /// Quoted entity tag, as sent in `ETag`.
    pub fn etag(&self) -> Option<String> {
        self.strong_token.as_ref().map(|token| format!("\"{token}\""))
    }

    pub fn last_modified_header(&self) -> Option<String> {
        self.weak_timestamp.and_then(format_http_date)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntityTagCondition {
    Any,
    Tags(Vec<String>),
}

/// Validators supplied by the client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestValidators {
    if_none_match: Option<EntityTagCondition>,
    if_modified_since: Option<OffsetDateTime>,
}

impl RequestValidators {
    /// Parse `If-None-Match` and `If-Modified-Since`. Malformed values are
    /// ignored, as if the header were absent.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let if_none_match = headers
            .get_all(IF_NONE_MATCH)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .fold(None, |acc: Option<EntityTagCondition>, raw| {
                match (acc, parse_entity_tags(raw)) {
                    (Some(EntityTagCondition::Any), _) | (_, Some(EntityTagCondition::Any)) => {
                        Some(EntityTagCondition::Any)
                    }
                    (Some(EntityTagCondition::Tags(mut a)), Some(EntityTagCondition::Tags(b))) => {
                        a.extend(b);
                        Some(EntityTagCondition::Tags(a))
                    }
                    (acc, None) => acc,
                    (None, parsed) => parsed,
                }
            });

        let if_modified_since = headers
            .get(IF_MODIFIED_SINCE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_http_date);

        Self {
            if_none_match,
            if_modified_since,
        }
    }

    pub fn if_none_match(tags: &[&str]) -> Self {
        Self {
            if_none_match: Some(EntityTagCondition::Tags(
                tags.iter().map(|t| opaque_tag(t).to_string()).collect(),
            )),
            if_modified_since: None,
        }
    }

    pub fn if_modified_since(at: OffsetDateTime) -> Self {
        Self {
            if_none_match: None,
            if_modified_since: Some(truncate_to_second(at)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.if_none_match.is_none() && self.if_modified_since.is_none()
    }
}

/// Outcome of a conditional check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Client copy is stale or absent; render.
    Fresh,
    /// Client copy is current; respond 304 without a body.
    NotModified,
}

/// Decide between rendering and 304.
///
/// With no request validators the answer is `Fresh`. Otherwise every
/// validator the client sent must match: entity tags by weak comparison
/// (`*` matches any existing representation), and the modification time must
/// not be newer than the client's.
pub fn evaluate(validators: &ConditionalValidators, request: &RequestValidators) -> Freshness {
    if request.is_empty() {
        return Freshness::Fresh;
    }

    let etag_ok = match (&request.if_none_match, &validators.strong_token) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(EntityTagCondition::Any), Some(_)) => true,
        (Some(EntityTagCondition::Tags(tags)), Some(token)) => tags.iter().any(|t| t == token),
    };
    let date_ok = match (request.if_modified_since, validators.weak_timestamp) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(since), Some(modified)) => modified <= since,
    };

    if etag_ok && date_ok {
        Freshness::NotModified
    } else {
        Freshness::Fresh
    }
}

/// Evaluated validators plus the policy to advertise.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub freshness: Freshness,
    pub validators: ConditionalValidators,
    pub policy: CachePolicy,
}

impl Evaluation {
    pub fn is_not_modified(&self) -> bool {
        self.freshness == Freshness::NotModified
    }

    /// Headers attached to both the 200 and the 304 response.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = self
            .validators
            .etag()
            .and_then(|etag| HeaderValue::from_str(&etag).ok())
        {
            headers.insert(ETAG, value);
        }
        if let Some(value) = self
            .validators
            .last_modified_header()
            .and_then(|date| HeaderValue::from_str(&date).ok())
        {
            headers.insert(LAST_MODIFIED, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.policy.header_value()) {
            headers.insert(CACHE_CONTROL, value);
        }
        headers
    }

    pub fn not_modified_response(&self) -> Response {
        (StatusCode::NOT_MODIFIED, self.headers()).into_response()
    }
}

/// Evaluator bound to a default policy.
#[derive(Debug, Clone, Default)]
pub struct ConditionalEvaluator {
    policy: CachePolicy,
}

impl ConditionalEvaluator {
    pub fn new(policy: CachePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn evaluate(
        &self,
        validators: ConditionalValidators,
        request: &RequestValidators,
    ) -> Evaluation {
        self.evaluate_with_policy(validators, request, self.policy.clone())
    }

    pub fn evaluate_with_policy(
        &self,
        validators: ConditionalValidators,
        request: &RequestValidators,
        policy: CachePolicy,
    ) -> Evaluation {
        let freshness = evaluate(&validators, request);
        if freshness == Freshness::NotModified {
            counter!(METRIC_NOT_MODIFIED_TOTAL).increment(1);
        }
        debug!(
            freshness = ?freshness,
            etag = validators.strong_token.as_deref().unwrap_or("-"),
            "Conditional request evaluated"
        );
        Evaluation {
            freshness,
            validators,
            policy,
        }
    }

    /// Parse the request headers and evaluate in one step.
    pub fn evaluate_headers(
        &self,
        headers: &HeaderMap,
        validators: ConditionalValidators,
    ) -> Evaluation {
        self.evaluate(validators, &RequestValidators::from_headers(headers))
    }
}

/// Answer 304 when the client copy is current, otherwise render and attach
/// the same validators to the fresh response.
pub async fn respond_conditionally<F, Fut, R>(evaluation: &Evaluation, render: F) -> Response
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = R>,
    R: IntoResponse,
{
    if evaluation.is_not_modified() {
        return evaluation.not_modified_response();
    }

    let mut response = render().await.into_response();
    if response.status().is_success() {
        for (name, value) in evaluation.headers().iter() {
            response.headers_mut().insert(name.clone(), value.clone());
        }
    }
    response
}

pub fn format_http_date(at: OffsetDateTime) -> Option<String> {
    at.to_offset(UtcOffset::UTC).format(HTTP_DATE).ok()
}

pub fn parse_http_date(raw: &str) -> Option<OffsetDateTime> {
    PrimitiveDateTime::parse(raw.trim(), HTTP_DATE)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

fn truncate_to_second(at: OffsetDateTime) -> OffsetDateTime {
    let at = at.to_offset(UtcOffset::UTC);
    at.replace_nanosecond(0).unwrap_or(at)
}

fn parse_entity_tags(raw: &str) -> Option<EntityTagCondition> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw == "*" {
        return Some(EntityTagCondition::Any);
    }
    let tags: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| opaque_tag(t).to_string())
        .collect();
    if tags.is_empty() {
        None
    } else {
        Some(EntityTagCondition::Tags(tags))
    }
}

/// Strip the weakness indicator and quotes from an entity tag.
fn opaque_tag(tag: &str) -> &str {
    let tag = tag.trim();
    let tag = tag.strip_prefix("W/").unwrap_or(tag);
    tag.trim_matches('"')
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use time::macros::datetime;

    use super::*;
    use crate::cache::versions::VersionRegistry;
    use crate::domain::{ResourceId, ResourceSnapshot};

    fn id(s: &str) -> ResourceId {
        s.parse().expect("valid id")
    }

    fn generator() -> KeyGenerator {
        KeyGenerator::new("views", Arc::new(VersionRegistry::new()))
    }

    fn validators() -> ConditionalValidators {
        ConditionalValidators::new(
            Some("abc123".to_string()),
            Some(datetime!(2024-03-01 12:00:00.750 UTC)),
        )
    }

    #[test]
    fn default_policy_is_private_and_revalidating() {
        assert_eq!(
            CachePolicy::default().header_value(),
            "private, max-age=0, must-revalidate"
        );
        let public = CachePolicy {
            public: true,
            max_age_seconds: 60,
            must_revalidate: false,
        };
        assert_eq!(public.header_value(), "public, max-age=60");
    }

    #[test]
    fn weak_timestamp_is_truncated_to_seconds() {
        assert_eq!(
            validators().weak_timestamp,
            Some(datetime!(2024-03-01 12:00:00 UTC))
        );
    }

    #[test]
    fn http_dates_round_trip() {
        let at = datetime!(1994-11-06 08:49:37 UTC);
        let formatted = format_http_date(at).expect("format");
        assert_eq!(formatted, "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_http_date(&formatted), Some(at));
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[test]
    fn no_request_validators_is_fresh() {
        assert_eq!(
            evaluate(&validators(), &RequestValidators::default()),
            Freshness::Fresh
        );
    }

    #[test]
    fn matching_etag_is_not_modified_including_weak_and_lists() {
        let v = validators();
        for header in ["\"abc123\"", "W/\"abc123\"", "\"zzz\", \"abc123\"", "*"] {
            let mut headers = HeaderMap::new();
            headers.insert(IF_NONE_MATCH, HeaderValue::from_static(header));
            let request = RequestValidators::from_headers(&headers);
            assert_eq!(evaluate(&v, &request), Freshness::NotModified, "{header}");
        }
    }

    #[test]
    fn mismatched_etag_is_fresh() {
        let request = RequestValidators::if_none_match(&["\"other\""]);
        assert_eq!(evaluate(&validators(), &request), Freshness::Fresh);
    }

    #[test]
    fn star_without_representation_is_fresh() {
        let mut headers = HeaderMap::new();
        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("*"));
        let request = RequestValidators::from_headers(&headers);
        assert_eq!(
            evaluate(&ConditionalValidators::default(), &request),
            Freshness::Fresh
        );
    }

    #[test]
    fn if_modified_since_compares_whole_seconds() {
        let v = validators();
        let same = RequestValidators::if_modified_since(datetime!(2024-03-01 12:00:00 UTC));
        let later = RequestValidators::if_modified_since(datetime!(2024-03-02 00:00:00 UTC));
        let earlier = RequestValidators::if_modified_since(datetime!(2024-03-01 11:59:59 UTC));

        assert_eq!(evaluate(&v, &same), Freshness::NotModified);
        assert_eq!(evaluate(&v, &later), Freshness::NotModified);
        assert_eq!(evaluate(&v, &earlier), Freshness::Fresh);
    }

    #[test]
    fn every_supplied_validator_must_match() {
        let v = validators();
        let mut headers = HeaderMap::new();
        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("\"abc123\""));
        headers.insert(
            IF_MODIFIED_SINCE,
            HeaderValue::from_static("Thu, 29 Feb 2024 00:00:00 GMT"),
        );
        assert_eq!(
            evaluate(&v, &RequestValidators::from_headers(&headers)),
            Freshness::Fresh
        );
    }

    #[test]
    fn unparseable_if_modified_since_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(IF_MODIFIED_SINCE, HeaderValue::from_static("not a date"));
        let request = RequestValidators::from_headers(&headers);
        assert!(request.is_empty());
        assert_eq!(evaluate(&validators(), &request), Freshness::Fresh);
    }

    #[test]
    fn validators_are_deterministic_and_version_sensitive() {
        let generator = generator();
        let ctx = KeyContext::anonymous();
        let v1 = ResourceSnapshot::new(id("company#1"), 10);
        let v2 = ResourceSnapshot::new(id("company#1"), 11);

        let a = ConditionalValidators::for_resources(&generator, &[&v1], &ctx).expect("a");
        let b = ConditionalValidators::for_resources(&generator, &[&v1], &ctx).expect("b");
        let c = ConditionalValidators::for_resources(&generator, &[&v2], &ctx).expect("c");

        assert_eq!(a, b);
        assert_ne!(a.strong_token, c.strong_token);
        assert_eq!(a.strong_token.as_ref().map(String::len), Some(TOKEN_LEN));
    }

    #[test]
    fn validators_change_with_context() {
        let generator = generator();
        let company = ResourceSnapshot::new(id("company#1"), 10);

        let anon = ConditionalValidators::for_resources(
            &generator,
            &[&company],
            &KeyContext::anonymous(),
        )
        .expect("anon");
        let viewer = ConditionalValidators::for_resources(
            &generator,
            &[&company],
            &KeyContext::viewer("user-42"),
        )
        .expect("viewer");
        assert_ne!(anon.strong_token, viewer.strong_token);
    }

    #[test]
    fn weak_timestamp_takes_latest_of_resources_and_touches() {
        let generator = generator();
        let older = ResourceSnapshot::new(id("company#1"), 1)
            .with_updated_at(datetime!(2024-01-01 00:00:00 UTC));
        let newer = ResourceSnapshot::new(id("company#2"), 1)
            .with_updated_at(datetime!(2024-02-01 00:00:00.5 UTC));

        let v = ConditionalValidators::for_resources(
            &generator,
            &[&older, &newer],
            &KeyContext::anonymous(),
        )
        .expect("validators");
        assert_eq!(v.weak_timestamp, Some(datetime!(2024-02-01 00:00:00 UTC)));

        generator.versions().touch(&id("company#1"));
        let touched = ConditionalValidators::for_resources(
            &generator,
            &[&older, &newer],
            &KeyContext::anonymous(),
        )
        .expect("validators");
        assert!(touched.weak_timestamp > v.weak_timestamp);
        assert_ne!(touched.strong_token, v.strong_token);
    }

    #[test]
    fn resource_without_identity_is_rejected() {
        let generator = generator();
        let unsaved = ResourceSnapshot::unsaved();
        let err = ConditionalValidators::for_resources(
            &generator,
            &[&unsaved],
            &KeyContext::anonymous(),
        )
        .expect_err("no identity");
        assert!(matches!(err, CacheError::InvalidResource { .. }));
    }

    #[test]
    fn headers_identical_for_fresh_and_not_modified() {
        let evaluator = ConditionalEvaluator::default();
        let fresh = evaluator.evaluate(validators(), &RequestValidators::default());
        let not_modified =
            evaluator.evaluate(validators(), &RequestValidators::if_none_match(&["abc123"]));

        assert_eq!(fresh.freshness, Freshness::Fresh);
        assert_eq!(not_modified.freshness, Freshness::NotModified);
        assert_eq!(fresh.headers(), not_modified.headers());

        let headers = fresh.headers();
        assert_eq!(headers[ETAG], "\"abc123\"");
        assert_eq!(headers[LAST_MODIFIED], "Fri, 01 Mar 2024 12:00:00 GMT");
        assert_eq!(headers[CACHE_CONTROL], "private, max-age=0, must-revalidate");
    }

    #[tokio::test]
    async fn respond_conditionally_skips_render_on_match() {
        let evaluator = ConditionalEvaluator::default();
        let evaluation =
            evaluator.evaluate(validators(), &RequestValidators::if_none_match(&["abc123"]));

        let rendered = AtomicBool::new(false);
        let flag = &rendered;
        let response = respond_conditionally(&evaluation, move || async move {
            flag.store(true, Ordering::SeqCst);
            "body"
        })
        .await;

        assert!(!rendered.load(Ordering::SeqCst));
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(response.headers()[ETAG], "\"abc123\"");
    }

    #[tokio::test]
    async fn respond_conditionally_renders_with_validators() {
        let evaluator = ConditionalEvaluator::default();
        let evaluation = evaluator.evaluate(validators(), &RequestValidators::default());

        let response = respond_conditionally(&evaluation, || async { "hello" }).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[ETAG], "\"abc123\"");
        assert!(response.headers().contains_key(CACHE_CONTROL));
    }
}
