pub mod admin_auth_layer;
pub mod api_metrics_layer;
pub mod timeout_layer;
