use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use whisperer::catalog::{Catalog, CatalogSource, LazyCatalog};
use whisperer::consts::DEFAULT_CATALOG;

const BODY: &str = r#"[
    {"id": 7, "common_name": "Jade Plant", "scientific_name": "Crassula ovata", "category": "Succulents"},
    {"id": "HC-8", "common_name": "Aloe Vera", "scientific_name": "Aloe barbadensis", "category": "Succulents"}
]"#;

#[tokio::test]
async fn catalog_fetched_once_by_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/assets/heartyculture_plants.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(BODY))
        .expect(1)
        .mount(&server)
        .await;

    let source = CatalogSource::parse(&format!("{}/assets/heartyculture_plants.json", server.uri()));
    assert!(matches!(source, CatalogSource::Url(_)));

    let catalog = LazyCatalog::new(source);
    let first = catalog.build_context("my jade plant is drooping").await;
    assert!(first.contains("1. Jade Plant (Crassula ovata). Category: Succulents. ID: 7"));
    let second = catalog.build_context("any succulents in stock?").await;
    assert!(second.contains("ID: HC-8"));
    assert_eq!(catalog.loaded_len(), 2);
}

#[tokio::test]
async fn failed_fetch_degrades_to_no_context() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let catalog = LazyCatalog::new(CatalogSource::parse(&format!("{}/missing.json", server.uri())));
    assert_eq!(catalog.build_context("jade plant").await, "");
    assert_eq!(catalog.loaded_len(), 0);
}

#[tokio::test]
async fn bundled_catalog_parses() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CATALOG);
    let catalog = Catalog::load(&CatalogSource::File(path)).await.unwrap();
    assert!(catalog.len() >= 10);
    assert!(!catalog.matches("snake plant care", 5).is_empty());
}
