use std::collections::BTreeMap;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::State,
    response::Html,
    routing::get,
};
use serde::Serialize;
use tokio::{net::TcpListener, sync::watch};
use tower_http::cors::CorsLayer;

use crate::store::{ReadingsStore, SensorStatus};

const DASHBOARD_HTML: &str = include_str!("../assets/dashboard.html");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Offline,
}

/// One sensor as reported by `GET /api/data`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorView {
    pub temperature_c: Option<f64>,
    pub temperature_f: Option<f64>,
    pub humidity: Option<u8>,
    pub raw_data: Option<String>,
    pub last_updated: Option<String>,
    pub status: Status,
}

impl From<SensorStatus> for SensorView {
    fn from(s: SensorStatus) -> Self {
        let reading = s.reading.as_ref();
        SensorView {
            temperature_c: reading.map(|r| r.temperature_celsius),
            temperature_f: reading.map(|r| r.temperature_fahrenheit),
            humidity: reading.map(|r| r.humidity_percent),
            raw_data: s.reading.map(|r| r.raw_hex),
            last_updated: s.last_updated.map(|t| t.to_rfc3339()),
            status: if s.online {
                Status::Online
            } else {
                Status::Offline
            },
        }
    }
}

pub fn router(store: ReadingsStore) -> Router {
    Router::new()
        .route("/", get(dashboard_handler))
        .route("/api/data", get(data_handler))
        .layer(CorsLayer::permissive())
        .with_state(store)
}

/// Serves the API until `shutdown` turns true or its sender is dropped.
pub async fn serve(
    listener: TcpListener,
    store: ReadingsStore,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), anyhow::Error> {
    axum::serve(listener, router(store))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("HTTP server failed")?;

    Ok(())
}

async fn dashboard_handler() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

async fn data_handler(State(store): State<ReadingsStore>) -> Json<BTreeMap<String, SensorView>> {
    let sensors = store
        .snapshot()
        .await
        .into_iter()
        .map(|s| (s.name.clone(), SensorView::from(s)))
        .collect();

    Json(sensors)
}
