use crate::collector::Collector;
use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::error;

/// Serve the exposition payload. Always answers 200: scrapers treat any
/// other status as "target down", and partial metrics beat no metrics.
pub async fn metrics(Extension(collector): Extension<Arc<Collector>>) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        "content-type",
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );

    match collector.render_metrics().await {
        Ok(body) => (StatusCode::OK, headers, body),
        Err(e) => {
            error!("failed to render metrics: {e}");
            (StatusCode::OK, headers, String::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    #[test]
    fn test_content_type_header() {
        let value = HeaderValue::from_static("text/plain; charset=utf-8");
        assert_eq!(value.to_str().unwrap(), "text/plain; charset=utf-8");
    }
}
