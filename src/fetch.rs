//! Outbound HTTP: client-identifier metadata, profile h-cards, and
//! ticket delivery.
//!
//! Markup is mined with a minimal tag scanner rather than a full
//! microformats parser: rel links (`redirect_uri`, `ticket_endpoint`),
//! the h-app name, and the handful of h-card properties the consent and
//! userinfo surfaces need.

use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),
}

/// What a client-identifier URL says about itself
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub name: Option<String>,
    pub url: Option<String>,
    /// Alternate redirect endpoints advertised via `rel="redirect_uri"`.
    pub redirect_uris: Vec<String>,
}

/// Properties mined from a profile page's h-card and rels
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileInfo {
    pub name: Option<String>,
    pub photo: Option<String>,
    pub url: Option<String>,
    pub email: Option<String>,
    pub ticket_endpoint: Option<String>,
}

impl ProfileInfo {
    /// The claims object stored with a redeemed code and returned by
    /// the userinfo endpoint. Email is always recorded; disclosure is
    /// scope-gated at response time.
    pub fn to_profile_data(&self) -> Value {
        let mut data = json!({});
        if let Some(name) = &self.name {
            data["name"] = json!(name);
        }
        if let Some(photo) = &self.photo {
            data["photo"] = json!(photo);
        }
        if let Some(url) = &self.url {
            data["url"] = json!(url);
        }
        if let Some(email) = &self.email {
            data["email"] = json!(email);
        }
        data
    }
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<(?:link|a)\b[^>]*>").expect("tag regex"))
}

fn attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)([a-z][a-z0-9-]*)\s*=\s*"([^"]*)""#).expect("attr regex")
    })
}

fn class_prop_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<([a-z][a-z0-9]*)\b[^>]*class="[^"]*"[^>]*>"#).expect("class regex")
    })
}

fn attributes(tag: &str) -> HashMap<String, String> {
    attr_re()
        .captures_iter(tag)
        .map(|cap| (cap[1].to_lowercase(), cap[2].to_string()))
        .collect()
}

fn rel_matches(attrs: &HashMap<String, String>, rel: &str) -> bool {
    attrs
        .get("rel")
        .map(|value| value.split_ascii_whitespace().any(|token| token == rel))
        .unwrap_or(false)
}

/// All targets of `<link>`/`<a>` elements carrying the given rel,
/// resolved against the document URL.
fn rel_targets(html: &str, base: &Url, rel: &str) -> Vec<String> {
    let mut targets = Vec::new();
    for tag in tag_re().find_iter(html) {
        let attrs = attributes(tag.as_str());
        if !rel_matches(&attrs, rel) {
            continue;
        }
        if let Some(href) = attrs.get("href") {
            if let Ok(resolved) = base.join(href) {
                targets.push(resolved.to_string());
            }
        }
    }
    targets
}

/// Find the first tag whose class list contains `class_name` and return
/// (attributes, immediately following text).
fn classed_tag(html: &str, class_name: &str) -> Option<(HashMap<String, String>, String)> {
    for tag in class_prop_re().find_iter(html) {
        let attrs = attributes(tag.as_str());
        let has_class = attrs
            .get("class")
            .map(|value| value.split_ascii_whitespace().any(|c| c == class_name))
            .unwrap_or(false);
        if !has_class {
            continue;
        }
        let rest = &html[tag.end()..];
        let text = rest.split('<').next().unwrap_or("").trim().to_string();
        return Some((attrs, text));
    }
    None
}

fn classed_text(html: &str, class_name: &str) -> Option<String> {
    classed_tag(html, class_name)
        .map(|(_, text)| text)
        .filter(|t| !t.is_empty())
}

fn classed_link(html: &str, base: &Url, class_name: &str) -> Option<String> {
    let (attrs, _) = classed_tag(html, class_name)?;
    let target = attrs.get("href").or_else(|| attrs.get("src"))?;
    base.join(target).ok().map(|u| u.to_string())
}

/// Parse `Link: <target>; rel="name"` response headers for a rel.
fn header_rel_targets(headers: &reqwest::header::HeaderMap, base: &Url, rel: &str) -> Vec<String> {
    let mut targets = Vec::new();
    for value in headers.get_all(reqwest::header::LINK) {
        let Ok(raw) = value.to_str() else { continue };
        for part in raw.split(',') {
            let mut pieces = part.split(';');
            let Some(target) = pieces.next() else { continue };
            let target = target.trim().trim_start_matches('<').trim_end_matches('>');
            let named = pieces.any(|p| {
                let p = p.trim();
                p.strip_prefix("rel=")
                    .map(|r| r.trim_matches('"').split_ascii_whitespace().any(|t| t == rel))
                    .unwrap_or(false)
            });
            if named {
                if let Ok(resolved) = base.join(target) {
                    targets.push(resolved.to_string());
                }
            }
        }
    }
    targets
}

/// Client over the outbound fetches the authorization engine performs.
pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    /// Build with the configured outbound timeout.
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("indieauthd/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    /// Fetch a client identifier and mine its h-app and redirect rels.
    pub async fn client_metadata(&self, client_id: &Url) -> Result<ClientMetadata, FetchError> {
        let response = self.client.get(client_id.clone()).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status()));
        }

        let mut redirect_uris = header_rel_targets(response.headers(), client_id, "redirect_uri");
        let html = response.text().await?;
        redirect_uris.extend(rel_targets(&html, client_id, "redirect_uri"));
        redirect_uris.dedup();

        let metadata = ClientMetadata {
            name: classed_text(&html, "p-name"),
            url: classed_link(&html, client_id, "u-url"),
            redirect_uris,
        };
        debug!(client_id = %client_id, ?metadata, "fetched client metadata");
        Ok(metadata)
    }

    /// Fetch a profile URL and mine its h-card and ticket endpoint.
    pub async fn profile(&self, profile: &Url) -> Result<ProfileInfo, FetchError> {
        let response = self.client.get(profile.clone()).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status()));
        }

        let mut ticket_endpoint =
            header_rel_targets(response.headers(), profile, "ticket_endpoint")
                .into_iter()
                .next();
        let html = response.text().await?;
        if ticket_endpoint.is_none() {
            ticket_endpoint = rel_targets(&html, profile, "ticket_endpoint").into_iter().next();
        }

        let email = classed_tag(&html, "u-email").and_then(|(attrs, text)| {
            attrs
                .get("href")
                .and_then(|href| href.strip_prefix("mailto:").map(|m| m.to_string()))
                .or_else(|| (!text.is_empty()).then_some(text))
        });

        let info = ProfileInfo {
            name: classed_text(&html, "p-name"),
            photo: classed_link(&html, profile, "u-photo"),
            url: classed_link(&html, profile, "u-url").or_else(|| Some(profile.to_string())),
            email,
            ticket_endpoint,
        };
        debug!(profile = %profile, ?info, "fetched profile");
        Ok(info)
    }

    /// Deliver a minted ticket to a subject's ticket endpoint.
    pub async fn deliver_ticket(
        &self,
        endpoint: &str,
        ticket: &str,
        resource: &str,
        subject: &str,
        iss: &str,
    ) -> Result<(), FetchError> {
        let response = self
            .client
            .post(endpoint)
            .form(&[
                ("ticket", ticket),
                ("resource", resource),
                ("subject", subject),
                ("iss", iss),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CLIENT_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<link rel="redirect_uri" href="/alt-callback">
<link rel="redirect_uri other" href="https://cdn.app.example/cb">
</head>
<body>
<div class="h-app">
  <a class="u-url p-name" href="/">Example App</a>
</div>
</body>
</html>"#;

    const PROFILE_HTML: &str = r#"<html>
<head><link rel="ticket_endpoint" href="/tickets"></head>
<body class="h-card">
<span class="p-name">Alice Adams</span>
<img class="u-photo" src="/alice.jpg">
<a class="u-url" href="https://alice.example/">home</a>
<a class="u-email" href="mailto:alice@example.com">email me</a>
</body>
</html>"#;

    fn base() -> Url {
        Url::parse("https://app.example/").unwrap()
    }

    #[test]
    fn test_rel_targets_resolution() {
        let targets = rel_targets(CLIENT_HTML, &base(), "redirect_uri");
        assert_eq!(
            targets,
            vec![
                "https://app.example/alt-callback",
                "https://cdn.app.example/cb"
            ]
        );
        assert!(rel_targets(CLIENT_HTML, &base(), "authorization_endpoint").is_empty());
    }

    #[test]
    fn test_hcard_properties() {
        let profile = Url::parse("https://alice.example/").unwrap();
        assert_eq!(
            classed_text(PROFILE_HTML, "p-name"),
            Some("Alice Adams".to_string())
        );
        assert_eq!(
            classed_link(PROFILE_HTML, &profile, "u-photo"),
            Some("https://alice.example/alice.jpg".to_string())
        );
    }

    #[test]
    fn test_profile_data_shape() {
        let info = ProfileInfo {
            name: Some("Alice".to_string()),
            photo: None,
            url: Some("https://alice.example/".to_string()),
            email: Some("alice@example.com".to_string()),
            ticket_endpoint: None,
        };
        let data = info.to_profile_data();
        assert_eq!(data["name"], "Alice");
        assert_eq!(data["email"], "alice@example.com");
        assert!(data.get("photo").is_none());
    }

    #[tokio::test]
    async fn test_client_metadata_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CLIENT_HTML))
            .mount(&server)
            .await;

        let fetcher = Fetcher::new(Duration::from_secs(5));
        let client_id = Url::parse(&format!("{}/", server.uri())).unwrap();
        let metadata = fetcher.client_metadata(&client_id).await.unwrap();

        assert_eq!(metadata.name, Some("Example App".to_string()));
        assert_eq!(metadata.redirect_uris.len(), 2);
        assert!(metadata.redirect_uris[0].ends_with("/alt-callback"));
    }

    #[tokio::test]
    async fn test_profile_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PROFILE_HTML))
            .mount(&server)
            .await;

        let fetcher = Fetcher::new(Duration::from_secs(5));
        let profile = Url::parse(&format!("{}/", server.uri())).unwrap();
        let info = fetcher.profile(&profile).await.unwrap();

        assert_eq!(info.name, Some("Alice Adams".to_string()));
        assert_eq!(info.email, Some("alice@example.com".to_string()));
        assert!(info.ticket_endpoint.unwrap().ends_with("/tickets"));
    }

    #[tokio::test]
    async fn test_fetch_failure_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = Fetcher::new(Duration::from_secs(5));
        let url = Url::parse(&server.uri()).unwrap();
        match fetcher.client_metadata(&url).await {
            Err(FetchError::Status(status)) => assert_eq!(status.as_u16(), 404),
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ticket_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tickets"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let fetcher = Fetcher::new(Duration::from_secs(5));
        fetcher
            .deliver_ticket(
                &format!("{}/tickets", server.uri()),
                "sealed",
                "https://alice.example/feed",
                "https://bob.example/",
                "https://auth.alice.example/",
            )
            .await
            .unwrap();
    }
}
