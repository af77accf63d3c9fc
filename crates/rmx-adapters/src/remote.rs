//! Remote Source adapter: typed JSON over HTTP against the per-Source
//! endpoint recorded on the company row.
//!
//! The wire contract mirrors the [`SourceAdapter`] trait one-to-one:
//!
//! - `POST {base}/availability`      takes criteria + agreement_ref, returns `{offers}`
//! - `GET  {base}/locations`         returns `{locations}`
//! - `POST {base}/booking/create`    create request; `Idempotency-Key` +
//!   `X-Request-Id` headers carry the Agent's key and the middleware
//!   request id verbatim
//! - `POST {base}/booking/modify|cancel|check`
//! - `POST {base}/echo`              liveness probe; payload echoed back
//!
//! Deadlines are enforced with per-request timeouts; an elapsed one maps to
//! `TIMEOUT`, any non-2xx response to `SOURCE_ERROR`.

use std::time::Duration;

use async_trait::async_trait;
use rmx_schemas::{AvailabilityCriteria, CoreError, EchoPayload, Offer};
use serde::{Deserialize, Serialize};

use crate::types::{BookingCreateRequest, BookingModifyRequest, SourceBookingResponse};
use crate::SourceAdapter;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RemoteSourceAdapter {
    base_url: String,
    http: reqwest::Client,
    command_timeout: Duration,
}

impl RemoteSourceAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn map_transport_error(err: reqwest::Error) -> CoreError {
        if err.is_timeout() {
            CoreError::Timeout
        } else {
            CoreError::SourceError(format!("transport failure: {err}"))
        }
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, CoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(CoreError::SourceError(format!(
            "source returned {}: {}",
            status.as_u16(),
            body.chars().take(200).collect::<String>()
        )))
    }
}

#[derive(Debug, Serialize)]
struct AvailabilityWireRequest<'a> {
    #[serde(flatten)]
    criteria: &'a AvailabilityCriteria,
    agreement_ref: &'a str,
}

#[derive(Debug, Deserialize)]
struct AvailabilityWireResponse {
    offers: Vec<Offer>,
}

#[derive(Debug, Deserialize)]
struct LocationsWireResponse {
    locations: Vec<String>,
}

#[derive(Debug, Serialize)]
struct BookingRefWireRequest<'a> {
    supplier_booking_ref: &'a str,
    agreement_ref: &'a str,
}

#[derive(Debug, Serialize)]
struct EchoWireRequest<'a> {
    #[serde(flatten)]
    payload: &'a EchoPayload,
    agreement_ref: &'a str,
}

#[async_trait]
impl SourceAdapter for RemoteSourceAdapter {
    async fn availability(
        &self,
        criteria: &AvailabilityCriteria,
        agreement_ref: &str,
        deadline: Duration,
    ) -> Result<Vec<Offer>, CoreError> {
        let resp = self
            .http
            .post(self.url("availability"))
            .timeout(deadline)
            .json(&AvailabilityWireRequest {
                criteria,
                agreement_ref,
            })
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        let resp = Self::check_status(resp).await?;
        let body: AvailabilityWireResponse = resp
            .json()
            .await
            .map_err(|e| CoreError::SourceError(format!("availability decode failed: {e}")))?;
        Ok(body.offers)
    }

    async fn booking_create(
        &self,
        req: BookingCreateRequest,
    ) -> Result<SourceBookingResponse, CoreError> {
        let resp = self
            .http
            .post(self.url("booking/create"))
            .timeout(self.command_timeout)
            .header("Idempotency-Key", req.idempotency_key.clone())
            .header("X-Request-Id", req.middleware_request_id.to_string())
            .json(&req)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        let resp = Self::check_status(resp).await?;
        resp.json()
            .await
            .map_err(|e| CoreError::SourceError(format!("booking_create decode failed: {e}")))
    }

    async fn booking_modify(
        &self,
        req: BookingModifyRequest,
    ) -> Result<SourceBookingResponse, CoreError> {
        let resp = self
            .http
            .post(self.url("booking/modify"))
            .timeout(self.command_timeout)
            .json(&req)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        let resp = Self::check_status(resp).await?;
        resp.json()
            .await
            .map_err(|e| CoreError::SourceError(format!("booking_modify decode failed: {e}")))
    }

    async fn booking_cancel(
        &self,
        supplier_booking_ref: &str,
        agreement_ref: &str,
    ) -> Result<SourceBookingResponse, CoreError> {
        let resp = self
            .http
            .post(self.url("booking/cancel"))
            .timeout(self.command_timeout)
            .json(&BookingRefWireRequest {
                supplier_booking_ref,
                agreement_ref,
            })
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        let resp = Self::check_status(resp).await?;
        resp.json()
            .await
            .map_err(|e| CoreError::SourceError(format!("booking_cancel decode failed: {e}")))
    }

    async fn booking_check(
        &self,
        supplier_booking_ref: &str,
        agreement_ref: &str,
    ) -> Result<SourceBookingResponse, CoreError> {
        let resp = self
            .http
            .post(self.url("booking/check"))
            .timeout(self.command_timeout)
            .json(&BookingRefWireRequest {
                supplier_booking_ref,
                agreement_ref,
            })
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        let resp = Self::check_status(resp).await?;
        resp.json()
            .await
            .map_err(|e| CoreError::SourceError(format!("booking_check decode failed: {e}")))
    }

    async fn locations(&self) -> Result<Vec<String>, CoreError> {
        let resp = self
            .http
            .get(self.url("locations"))
            .timeout(self.command_timeout)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        let resp = Self::check_status(resp).await?;
        let body: LocationsWireResponse = resp
            .json()
            .await
            .map_err(|e| CoreError::SourceError(format!("locations decode failed: {e}")))?;
        Ok(body.locations)
    }

    async fn echo(
        &self,
        payload: &EchoPayload,
        agreement_ref: &str,
        deadline: Duration,
    ) -> Result<EchoPayload, CoreError> {
        let resp = self
            .http
            .post(self.url("echo"))
            .timeout(deadline)
            .json(&EchoWireRequest {
                payload,
                agreement_ref,
            })
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        let resp = Self::check_status(resp).await?;
        resp.json()
            .await
            .map_err(|e| CoreError::SourceError(format!("echo decode failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use rmx_schemas::BookingStatus;
    use serde_json::json;
    use uuid::Uuid;

    fn criteria() -> AvailabilityCriteria {
        AvailabilityCriteria {
            pickup_unlocode: "GBMAN".into(),
            dropoff_unlocode: "GBGLA".into(),
            pickup_iso: "2026-09-01T10:00:00Z".into(),
            dropoff_iso: "2026-09-03T10:00:00Z".into(),
            driver_age: 28,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn availability_round_trip() {
        let server = MockServer::start_async().await;
        let m = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/availability")
                    .json_body_partial(r#"{"agreement_ref": "AGR-1", "pickup_unlocode": "GBMAN"}"#);
                then.status(200).json_body(json!({
                    "offers": [{
                        "supplier_offer_ref": "OFF-9",
                        "agreement_ref": "AGR-1",
                        "vehicle_class": "suv",
                        "price": "300.00",
                        "currency": "GBP"
                    }]
                }));
            })
            .await;

        let adapter = RemoteSourceAdapter::new(server.base_url());
        let offers = adapter
            .availability(&criteria(), "AGR-1", Duration::from_secs(2))
            .await
            .unwrap();

        m.assert_async().await;
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].supplier_offer_ref, "OFF-9");
    }

    #[tokio::test]
    async fn availability_deadline_maps_to_timeout() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/availability");
                then.status(200)
                    .delay(std::time::Duration::from_millis(500))
                    .json_body(json!({"offers": []}));
            })
            .await;

        let adapter = RemoteSourceAdapter::new(server.base_url());
        let err = adapter
            .availability(&criteria(), "AGR-1", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");
    }

    #[tokio::test]
    async fn non_2xx_maps_to_source_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/availability");
                then.status(500).body("supplier exploded");
            })
            .await;

        let adapter = RemoteSourceAdapter::new(server.base_url());
        let err = adapter
            .availability(&criteria(), "AGR-1", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SOURCE_ERROR");
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn booking_create_propagates_key_and_request_id_headers() {
        let server = MockServer::start_async().await;
        let request_id = Uuid::new_v4();
        let m = server
            .mock_async(move |when, then| {
                when.method(POST)
                    .path("/booking/create")
                    .header("Idempotency-Key", "K-42")
                    .header("X-Request-Id", request_id.to_string());
                then.status(200).json_body(json!({
                    "supplier_booking_ref": "SBR-1",
                    "status": "REQUESTED",
                    "extra": null
                }));
            })
            .await;

        let adapter = RemoteSourceAdapter::new(server.base_url());
        let resp = adapter
            .booking_create(BookingCreateRequest {
                agreement_ref: "AGR-1".into(),
                supplier_offer_ref: None,
                agent_booking_ref: None,
                idempotency_key: "K-42".into(),
                middleware_request_id: request_id,
                agent_id: Uuid::new_v4(),
            })
            .await
            .unwrap();

        m.assert_async().await;
        assert_eq!(resp.supplier_booking_ref, "SBR-1");
        assert_eq!(resp.status, BookingStatus::Requested);
    }

    #[tokio::test]
    async fn locations_round_trip() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/locations");
                then.status(200)
                    .json_body(json!({"locations": ["GBMAN", "GBGLA"]}));
            })
            .await;

        let adapter = RemoteSourceAdapter::new(server.base_url());
        let locs = adapter.locations().await.unwrap();
        assert_eq!(locs, vec!["GBMAN".to_string(), "GBGLA".to_string()]);
    }
}
