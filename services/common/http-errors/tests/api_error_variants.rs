use common_http_errors::ApiError;
use axum::response::IntoResponse;
use axum::http::StatusCode;
use uuid::Uuid;

#[test]
fn bad_request_variant() {
    let err = ApiError::BadRequest { code: "invalid_quantity", trace_id: None, message: None };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "invalid_quantity");
}

#[test]
fn unprocessable_variant() {
    let err = ApiError::unprocessable("insufficient_stock", "Insufficient stock.");
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "insufficient_stock");
}

#[test]
fn not_found_variant() {
    let err = ApiError::not_found("product_not_found");
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "product_not_found");
}

#[test]
fn internal_variant() {
    let trace = Some(Uuid::new_v4());
    let err = ApiError::Internal { trace_id: trace, message: Some("boom".into()) };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "internal_error");
}
