//! Gateway HTTP surface: a root status endpoint with per-channel
//! connectivity, and a pairing-assist page that renders a scannable QR
//! when a channel is waiting to be linked.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use qrcode::render::svg;
use qrcode::QrCode;
use tracing::{error, info};

use crate::manager::StatusHandle;

const WAITING_PAGE: &str = "<!DOCTYPE html>\
<html><head><title>Pairing</title><meta http-equiv=\"refresh\" content=\"3\"></head>\
<body><p>No pairing code available yet. This page refreshes automatically.</p></body></html>";

pub fn router(status: StatusHandle) -> Router {
    Router::new()
        .route("/", get(root_status))
        .route("/pair", get(pairing_page))
        .with_state(status)
}

/// Bind the gateway address. A failure here is fatal to startup and is
/// returned to the caller; steady-state serve errors are only logged.
pub async fn bind(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind gateway address {addr}"))?;
    info!("Gateway HTTP listening on http://{addr}");
    Ok(listener)
}

pub async fn serve(listener: tokio::net::TcpListener, router: Router) {
    if let Err(e) = axum::serve(listener, router).await {
        error!("Gateway HTTP server error: {e}");
    }
}

async fn root_status(State(status): State<StatusHandle>) -> Json<serde_json::Value> {
    let channels = status.connectivity().await;
    Json(serde_json::json!({
        "status": "ok",
        "channels": channels,
    }))
}

async fn pairing_page(State(status): State<StatusHandle>) -> Response {
    match status.pairing_code().await {
        Some(code) => match render_pairing_svg(&code) {
            Ok(image) => ([(header::CONTENT_TYPE, "image/svg+xml")], image).into_response(),
            Err(e) => {
                error!("Failed to render pairing code: {e}");
                Html(WAITING_PAGE).into_response()
            }
        },
        None => Html(WAITING_PAGE).into_response(),
    }
}

fn render_pairing_svg(code: &str) -> Result<String> {
    let trimmed = code.trim();
    if trimmed.is_empty() {
        anyhow::bail!("empty pairing payload");
    }
    let qr = QrCode::new(trimmed.as_bytes()).context("failed to encode pairing payload")?;
    Ok(qr
        .render::<svg::Color>()
        .min_dimensions(256, 256)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::Channel;
    use crate::manager::ChannelManager;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tether_core::bus::{InboundMessage, OutboundMessage};
    use tokio::sync::{broadcast, mpsc};

    struct StubChannel {
        name: &'static str,
        connected: bool,
        pairing: Option<String>,
    }

    #[async_trait]
    impl Channel for StubChannel {
        fn name(&self) -> &str {
            self.name
        }
        async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn send(&self, _msg: &OutboundMessage) -> Result<()> {
            Ok(())
        }
        fn is_allowed(&self, _sender_id: &str) -> bool {
            true
        }
        fn is_connected(&self) -> bool {
            self.connected
        }
        fn pairing_code(&self) -> Option<String> {
            self.pairing.clone()
        }
    }

    async fn handle_with(channels: Vec<StubChannel>) -> StatusHandle {
        let (_tx, rx) = broadcast::channel(4);
        let manager = ChannelManager::new(rx);
        for ch in channels {
            manager.register(Arc::new(ch)).await;
        }
        manager.status_handle()
    }

    #[tokio::test]
    async fn root_reports_per_channel_connectivity() {
        let handle = handle_with(vec![
            StubChannel {
                name: "telegram",
                connected: true,
                pairing: None,
            },
            StubChannel {
                name: "web",
                connected: false,
                pairing: None,
            },
        ])
        .await;

        let Json(body) = root_status(State(handle)).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["channels"]["telegram"], true);
        assert_eq!(body["channels"]["web"], false);
    }

    #[tokio::test]
    async fn pairing_page_waits_without_a_code() {
        let handle = handle_with(vec![StubChannel {
            name: "telegram",
            connected: true,
            pairing: None,
        }])
        .await;

        let response = pairing_page(State(handle)).await;
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.starts_with("text/html"));
    }

    #[tokio::test]
    async fn pairing_page_renders_svg_when_code_present() {
        let handle = handle_with(vec![StubChannel {
            name: "phone",
            connected: false,
            pairing: Some("LINK-1234".into()),
        }])
        .await;

        let response = pairing_page(State(handle)).await;
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/svg+xml"
        );
    }

    #[test]
    fn empty_pairing_payload_is_rejected() {
        assert!(render_pairing_svg("   ").is_err());
        assert!(render_pairing_svg("LINK-1").unwrap().contains("<svg"));
    }
}
