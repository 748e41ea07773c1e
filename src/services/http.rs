//! HTTP client for the commerce backend's store API

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use super::{BundleLineRequest, CartService, CatalogService, PromoService, PromoValidation, RemoteError};
use crate::domain::aggregates::{BundleDefinition, Cart, Metadata};
use crate::domain::value_objects::{BundleId, CartId};

const PUBLISHABLE_KEY_HEADER: &str = "x-publishable-api-key";

#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Backend base URL (e.g. "http://localhost:9000")
    pub base_url: String,
    pub publishable_key: Option<String>,
    /// Request timeout in seconds
    pub timeout: u64,
}

impl HttpSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), publishable_key: None, timeout: 30 }
    }
}

/// Talks to the backend's `/store` routes for carts, bundles and promos.
#[derive(Debug, Clone)]
pub struct CommerceHttpClient {
    client: Client,
    base_url: String,
    publishable_key: Option<String>,
}

#[derive(Deserialize)]
struct CartEnvelope { cart: Cart }

#[derive(Deserialize)]
struct BundleEnvelope { bundle: BundleDefinition }

#[derive(Deserialize)]
struct BundleListEnvelope { bundles: Vec<BundleDefinition> }

#[derive(Serialize)]
struct AddBundleBody<'a> { bundle_id: &'a BundleId, items: &'a [BundleLineRequest] }

#[derive(Serialize)]
struct ReplaceBundleBody<'a> { items: &'a [BundleLineRequest] }

#[derive(Serialize)]
struct MetadataBody { metadata: Metadata }

#[derive(Serialize)]
struct ValidatePromoBody<'a> { code: &'a str, email: &'a str }

#[derive(Serialize)]
struct RedeemPromoBody<'a> { code: &'a str, cart_id: &'a CartId }

impl CommerceHttpClient {
    pub fn new(settings: &HttpSettings) -> Result<Self, RemoteError> {
        let client = Client::builder().timeout(Duration::from_secs(settings.timeout)).build()?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            publishable_key: settings.publishable_key.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        debug!(%method, %url, "Commerce backend request");
        let request = self.client.request(method, url);
        match &self.publishable_key {
            Some(key) => request.header(PUBLISHABLE_KEY_HEADER, key),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, RemoteError> {
        let response = Self::check(request.send().await?).await?;
        response.json().await.map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }

    async fn send_empty(request: RequestBuilder) -> Result<(), RemoteError> {
        Self::check(request.send().await?).await.map(|_| ())
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        let status = response.status();
        if status.is_success() { return Ok(response); }
        let text = response.text().await.unwrap_or_default();
        let message = extract_message(&text);
        Err(match status {
            StatusCode::NOT_FOUND => RemoteError::NotFound(message),
            _ => RemoteError::Rejected { status: status.as_u16(), message },
        })
    }
}

/// Prefers the backend's `{"message": ...}` body over the raw text.
fn extract_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

#[async_trait]
impl CartService for CommerceHttpClient {
    async fn retrieve(&self, cart_id: &CartId) -> Result<Cart, RemoteError> {
        let envelope: CartEnvelope = Self::send(self.request(Method::GET, &format!("store/carts/{cart_id}"))).await?;
        Ok(envelope.cart)
    }

    async fn add_bundle_items(&self, cart_id: &CartId, bundle_id: &BundleId, items: &[BundleLineRequest]) -> Result<(), RemoteError> {
        let request = self
            .request(Method::POST, &format!("store/carts/{cart_id}/flexible-bundles"))
            .json(&AddBundleBody { bundle_id, items });
        Self::send_empty(request).await
    }

    async fn replace_bundle_items(&self, cart_id: &CartId, bundle_id: &BundleId, items: &[BundleLineRequest]) -> Result<(), RemoteError> {
        let request = self
            .request(Method::PATCH, &format!("store/carts/{cart_id}/flexible-bundles/{bundle_id}"))
            .json(&ReplaceBundleBody { items });
        Self::send_empty(request).await
    }

    async fn remove_bundle(&self, cart_id: &CartId, bundle_id: &BundleId) -> Result<(), RemoteError> {
        Self::send_empty(self.request(Method::DELETE, &format!("store/carts/{cart_id}/flexible-bundles/{bundle_id}"))).await
    }

    async fn update_metadata(&self, cart_id: &CartId, patch: Metadata) -> Result<(), RemoteError> {
        let request = self.request(Method::POST, &format!("store/carts/{cart_id}")).json(&MetadataBody { metadata: patch });
        Self::send_empty(request).await
    }
}

#[async_trait]
impl CatalogService for CommerceHttpClient {
    async fn bundle_by_id(&self, bundle_id: &BundleId) -> Result<Option<BundleDefinition>, RemoteError> {
        match Self::send::<BundleEnvelope>(self.request(Method::GET, &format!("store/bundles/{bundle_id}"))).await {
            Ok(envelope) => Ok(Some(envelope.bundle)),
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn bundle_by_handle(&self, handle: &str) -> Result<Option<BundleDefinition>, RemoteError> {
        let request = self.request(Method::GET, "store/bundles").query(&[("handle", handle)]);
        let envelope: BundleListEnvelope = Self::send(request).await?;
        Ok(envelope.bundles.into_iter().find(|b| b.handle == handle))
    }
}

#[async_trait]
impl PromoService for CommerceHttpClient {
    async fn validate(&self, code: &str, email: &str) -> Result<PromoValidation, RemoteError> {
        let request = self.request(Method::POST, "store/custom-promo/validate").json(&ValidatePromoBody { code, email });
        Self::send(request).await
    }

    async fn redeem(&self, code: &str, cart_id: &CartId) -> Result<(), RemoteError> {
        let request = self.request(Method::POST, "store/custom-promo/apply").json(&RedeemPromoBody { code, cart_id });
        Self::send_empty(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_message() {
        assert_eq!(extract_message(r#"{"type":"invalid_data","message":"Variant is out of stock"}"#), "Variant is out of stock");
        assert_eq!(extract_message("Bad Gateway"), "Bad Gateway");
    }

    #[test]
    fn test_client_trims_base_url() {
        let client = CommerceHttpClient::new(&HttpSettings::new("http://localhost:9000/")).unwrap();
        assert_eq!(client.base_url, "http://localhost:9000");
    }

    #[test]
    fn test_add_body_shape() {
        let bundle_id = BundleId::from("b_1");
        let body = serde_json::to_value(AddBundleBody { bundle_id: &bundle_id, items: &[] }).unwrap();
        assert_eq!(body, serde_json::json!({"bundle_id": "b_1", "items": []}));
    }
}
