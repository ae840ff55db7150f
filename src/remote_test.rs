use super::*;
use crate::product::default_products;
use serde_json::json;

fn products_json() -> Value {
    serde_json::to_value(default_products()).unwrap()
}

#[test]
fn parse_nested_record_products() {
    let body = json!({ "record": { "products": products_json() }, "metadata": { "id": "abc" } });
    let products = parse_payload(&body.to_string()).unwrap();
    assert_eq!(products, default_products());
}

#[test]
fn parse_record_array() {
    let body = json!({ "record": products_json() });
    assert_eq!(parse_payload(&body.to_string()).unwrap().len(), 6);
}

#[test]
fn parse_top_level_products_and_bare_array() {
    let wrapped = json!({ "products": products_json() });
    assert_eq!(parse_payload(&wrapped.to_string()).unwrap().len(), 6);
    assert_eq!(parse_payload(&products_json().to_string()).unwrap().len(), 6);
}

#[test]
fn parse_empty_collection_is_ok() {
    let body = json!({ "record": { "products": [] } });
    assert!(parse_payload(&body.to_string()).unwrap().is_empty());
}

#[test]
fn parse_record_without_products_errors() {
    let body = json!({ "record": { "something": "else" } });
    assert!(matches!(parse_payload(&body.to_string()), Err(MirrorError::Parse(_))));
}

#[test]
fn parse_invalid_json_errors() {
    assert!(matches!(parse_payload("<html>502</html>"), Err(MirrorError::Parse(_))));
}

#[test]
fn parse_normalizes_scraped_prices() {
    let body = json!({ "record": { "products": [
        { "id": "s1", "title": "Scraped", "price": "9,500", "image": "https://example.test/s.jpg", "description": "d" },
        { "id": "s2", "title": "Half scraped" }
    ] } });
    let products = parse_payload(&body.to_string()).unwrap();
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].id, "s1");
    assert!((products[0].price - 9500.0).abs() < f64::EPSILON);
}

#[test]
fn parse_records_missing_required_fields_errors() {
    let body = json!({ "products": [{ "id": "x" }] });
    assert!(matches!(parse_payload(&body.to_string()), Err(MirrorError::Parse(_))));
}

#[test]
fn put_body_wraps_products() {
    let products = default_products();
    let body = serde_json::to_value(PutBody { products: &products }).unwrap();
    assert_eq!(body["products"].as_array().unwrap().len(), 6);
    assert_eq!(body["products"][0]["id"], "p1");
}

#[test]
fn retryable_covers_transport_and_server_errors() {
    assert!(MirrorError::Request("timeout".into()).retryable());
    assert!(MirrorError::Status { status: 503, body: String::new() }.retryable());
    assert!(MirrorError::Status { status: 429, body: String::new() }.retryable());
    assert!(!MirrorError::Status { status: 401, body: String::new() }.retryable());
    assert!(!MirrorError::Parse("bad".into()).retryable());
}
