//! Microsoft Graph mailbox client

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use super::{normalize_content_id, Mailbox};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::models::{Address, BodyType, Email};
use crate::rate_limiter::GlobalRateLimiter;

/// One page of a Graph collection
#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,

    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    subject: Option<String>,
    from: Option<GraphRecipient>,
    body: Option<GraphBody>,
    received_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    has_attachments: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: Option<GraphEmailAddress>,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    name: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    content_type: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphAttachment {
    content_id: Option<String>,
    content_bytes: Option<String>,
}

impl From<GraphMessage> for Email {
    fn from(message: GraphMessage) -> Self {
        let from = message
            .from
            .and_then(|r| r.email_address)
            .and_then(|a| {
                let email = a.address.filter(|addr| !addr.trim().is_empty())?;
                Some(Address {
                    name: a.name.filter(|n| !n.is_empty()),
                    email,
                })
            });

        let (body, body_type) = match message.body {
            Some(body) => {
                let body_type = match body.content_type.as_deref() {
                    Some(t) if t.eq_ignore_ascii_case("text") => BodyType::Text,
                    _ => BodyType::Html,
                };
                (body.content.unwrap_or_default(), body_type)
            }
            None => (String::new(), BodyType::Text),
        };

        Email {
            id: message.id,
            from,
            subject: message.subject.unwrap_or_default(),
            body,
            body_type,
            received_at: message.received_date_time,
            has_attachments: message.has_attachments,
            inline_images: BTreeMap::new(),
        }
    }
}

/// Graph REST client bound to one access token
pub struct GraphClient {
    client: Client,
    base_url: Url,
    access_token: String,
    rate_limiter: GlobalRateLimiter,
}

impl GraphClient {
    /// Create a client with default settings
    pub fn new(access_token: impl Into<String>) -> Result<Self> {
        Self::with_settings(access_token, &Settings::default())
    }

    /// Create a client from runtime settings
    pub fn with_settings(access_token: impl Into<String>, settings: &Settings) -> Result<Self> {
        let base_url = Url::parse(settings.graph_base_url.trim_end_matches('/')).map_err(|e| {
            Error::InvalidConfig {
                field: "graph_base_url".to_string(),
                reason: e.to_string(),
            }
        })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url,
            access_token: access_token.into(),
            rate_limiter: GlobalRateLimiter::new(settings.rate_limit_per_second),
        })
    }

    /// Build `{base}/me/<segments...>` with each segment percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .push("me")
            .extend(segments);
        Ok(url)
    }

    /// GET one page and decode it, any non-success status is a transport error
    async fn get_page<T: DeserializeOwned>(&self, url: &str) -> Result<Page<T>> {
        self.rate_limiter.wait().await;

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport {
                status: status.as_u16(),
                url: url.to_string(),
                body,
            });
        }

        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| Error::InvalidResponse(format!("{} from {}", e, url)))
    }
}

#[async_trait]
impl Mailbox for GraphClient {
    async fn fetch_messages(&self, max_count: Option<usize>) -> Result<Vec<Email>> {
        let max_count = max_count.filter(|max| *max > 0);
        let mut next = Some(self.endpoint(&["messages"])?.to_string());
        let mut emails = Vec::new();
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            if max_count.is_some_and(|max| emails.len() >= max) {
                break;
            }

            let page: Page<GraphMessage> = self.get_page(&url).await?;
            pages += 1;
            debug!("Fetched page {} with {} messages", pages, page.value.len());

            emails.extend(page.value.into_iter().map(Email::from));
            next = page.next_link;
        }

        if let Some(max) = max_count {
            emails.truncate(max);
        }

        info!("Fetched {} messages in {} pages", emails.len(), pages);
        Ok(emails)
    }

    async fn fetch_inline_images(
        &self,
        message_id: &str,
        content_ids: &[String],
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let wanted: HashSet<String> = content_ids
            .iter()
            .map(|cid| normalize_content_id(cid))
            .collect();
        let mut images = BTreeMap::new();
        if wanted.is_empty() {
            return Ok(images);
        }

        let mut next = Some(
            self.endpoint(&["messages", message_id, "attachments"])?
                .to_string(),
        );
        while let Some(url) = next.take() {
            let page: Page<GraphAttachment> = self.get_page(&url).await?;

            for attachment in page.value {
                let Some(cid) = attachment.content_id.as_deref().map(normalize_content_id) else {
                    continue;
                };
                if !wanted.contains(&cid) {
                    continue;
                }
                let Some(encoded) = attachment.content_bytes else {
                    continue;
                };
                let bytes = STANDARD.decode(encoded.trim()).map_err(|e| {
                    Error::InvalidResponse(format!("attachment {} is not base64: {}", cid, e))
                })?;
                images.insert(cid, bytes);
            }

            next = page.next_link;
        }

        debug!(
            "Resolved {}/{} inline images for message {}",
            images.len(),
            wanted.len(),
            message_id
        );
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client_for(server: &mockito::ServerGuard) -> GraphClient {
        let settings = Settings {
            graph_base_url: server.url(),
            rate_limit_per_second: 1000,
            ..Settings::default()
        };
        GraphClient::with_settings("token", &settings).unwrap()
    }

    fn message_page(start: usize, count: usize, next_link: Option<String>) -> String {
        let value: Vec<serde_json::Value> = (start..start + count)
            .map(|i| {
                serde_json::json!({
                    "id": format!("msg-{}", i),
                    "subject": format!("Subject {}", i),
                    "from": {"emailAddress": {"name": "Sender", "address": format!("s{}@biolevate.com", i)}},
                    "body": {"contentType": "html", "content": "<p>hi</p>"},
                    "receivedDateTime": "2024-10-01T09:30:00Z",
                    "hasAttachments": false
                })
            })
            .collect();
        let mut page = serde_json::json!({ "value": value });
        if let Some(link) = next_link {
            page["@odata.nextLink"] = serde_json::Value::String(link);
        }
        page.to_string()
    }

    async fn three_pages(server: &mut mockito::ServerGuard) -> Vec<mockito::Mock> {
        let base = server.url();
        let mut mocks = Vec::new();
        mocks.push(
            server
                .mock("GET", "/me/messages")
                .match_query(Matcher::Missing)
                .match_header("authorization", "Bearer token")
                .with_status(200)
                .with_body(message_page(0, 5, Some(format!("{}/me/messages?page=2", base))))
                .create_async()
                .await,
        );
        mocks.push(
            server
                .mock("GET", "/me/messages")
                .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
                .with_status(200)
                .with_body(message_page(5, 5, Some(format!("{}/me/messages?page=3", base))))
                .create_async()
                .await,
        );
        mocks.push(
            server
                .mock("GET", "/me/messages")
                .match_query(Matcher::UrlEncoded("page".into(), "3".into()))
                .with_status(200)
                .with_body(message_page(10, 5, None))
                .create_async()
                .await,
        );
        mocks
    }

    #[tokio::test]
    async fn test_fetch_all_pages_in_order() {
        let mut server = mockito::Server::new_async().await;
        let mocks = three_pages(&mut server).await;
        let client = client_for(&server);

        let emails = client.fetch_messages(None).await.unwrap();
        assert_eq!(emails.len(), 15);
        let ids: Vec<String> = emails.iter().map(|e| e.id.clone()).collect();
        let expected: Vec<String> = (0..15).map(|i| format!("msg-{}", i)).collect();
        assert_eq!(ids, expected);
        assert_eq!(emails[0].sender_address(), Some("s0@biolevate.com"));
        assert_eq!(emails[0].body_type, BodyType::Html);

        for mock in mocks {
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn test_fetch_stops_at_max_count() {
        let mut server = mockito::Server::new_async().await;
        let _mocks = three_pages(&mut server).await;
        let client = client_for(&server);

        let emails = client.fetch_messages(Some(7)).await.unwrap();
        assert_eq!(emails.len(), 7);
        assert_eq!(emails[6].id, "msg-6");

        let emails = client.fetch_messages(Some(5)).await.unwrap();
        assert_eq!(emails.len(), 5);

        // Zero means no cap
        let emails = client.fetch_messages(Some(0)).await.unwrap();
        assert_eq!(emails.len(), 15);
    }

    #[tokio::test]
    async fn test_failed_page_aborts_fetch() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let _first = server
            .mock("GET", "/me/messages")
            .match_query(Matcher::Missing)
            .with_status(200)
            .with_body(message_page(0, 5, Some(format!("{}/me/messages?page=2", base))))
            .create_async()
            .await;
        let _second = server
            .mock("GET", "/me/messages")
            .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
            .with_status(503)
            .with_body("busy")
            .create_async()
            .await;

        let err = client_for(&server).fetch_messages(None).await.unwrap_err();
        assert!(matches!(err, Error::Transport { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_message_without_sender() {
        let mut server = mockito::Server::new_async().await;
        let _page = server
            .mock("GET", "/me/messages")
            .with_status(200)
            .with_body(r#"{"value": [{"id": "draft-1", "subject": null, "body": {"contentType": "text", "content": "notes"}}]}"#)
            .create_async()
            .await;

        let emails = client_for(&server).fetch_messages(None).await.unwrap();
        assert_eq!(emails.len(), 1);
        assert!(emails[0].from.is_none());
        assert_eq!(emails[0].body_type, BodyType::Text);
        assert_eq!(emails[0].subject, "");
    }

    #[tokio::test]
    async fn test_fetch_inline_images_filters_and_decodes() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "value": [
                {"contentId": "<logo@corp>", "contentBytes": STANDARD.encode(b"png-bytes"), "isInline": true},
                {"contentId": "other", "contentBytes": STANDARD.encode(b"ignored")},
                {"name": "report.pdf", "contentBytes": STANDARD.encode(b"pdf")}
            ]
        });
        let mock = server
            .mock("GET", "/me/messages/msg-1/attachments")
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let images = client_for(&server)
            .fetch_inline_images("msg-1", &["logo@corp".to_string()])
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(images.len(), 1);
        assert_eq!(images["logo@corp"], b"png-bytes".to_vec());
    }

    #[tokio::test]
    async fn test_no_content_ids_skips_request() {
        let server = mockito::Server::new_async().await;
        let images = client_for(&server)
            .fetch_inline_images("msg-1", &[])
            .await
            .unwrap();
        assert!(images.is_empty());
    }

    #[tokio::test]
    async fn test_attachment_listing_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/me/messages/msg-1/attachments")
            .with_status(401)
            .create_async()
            .await;

        let err = client_for(&server)
            .fetch_inline_images("msg-1", &["logo".to_string()])
            .await
            .unwrap_err();
        assert!(err.requires_reauth());
    }
}
