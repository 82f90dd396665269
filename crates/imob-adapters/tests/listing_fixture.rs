use imob_adapters::{extract_listing, extract_property, RenderedPage};
use imob_core::Address;
use uuid::Uuid;

fn fixture(name: &str) -> String {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/listing")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()))
}

#[test]
fn rendered_listing_parses_into_property_row() {
    let link = "https://www.vivareal.com.br/imovel/apartamento-2-quartos-santa-maria-bairros-santos-68m2-venda-RS489000-id-2712345678/";
    let page = RenderedPage {
        url: format!("{link}?source=ranking"),
        html: fixture("apartamento.html"),
    };
    let job_id = Uuid::new_v4();

    let property = extract_property(&page, link, job_id);

    assert_eq!(property.link, link);
    assert_eq!(property.job_id, job_id);
    assert_eq!(property.property_type, "apartamento");
    assert_eq!(property.price, 489000.0);
    assert_eq!(property.private_area, 68.0);
    assert_eq!(property.bedrooms, 2);
    assert_eq!(property.bathrooms, 2);
    assert_eq!(property.parking_spaces, 1);
    assert_eq!(property.suites, 1);
    assert_eq!(property.floor, 7);
    assert!(property.balcony);
    assert!(property.elevator);
    assert!(!property.pool, "noscript text must not count as page text");
    assert_eq!(
        property.address,
        Address {
            street: Some("Rua Doutor Carvalho de Mendonça, 120".to_string()),
            neighborhood: Some("Santa Maria".to_string()),
            city: Some("Santos".to_string()),
            state: Some("SP".to_string()),
        }
    );
    assert_eq!(
        property.full_address.as_deref(),
        Some("Rua Doutor Carvalho de Mendonça, 120 - Santa Maria, Santos - SP")
    );
}

#[test]
fn sparse_listing_defaults_missing_fields() {
    let raw = extract_listing(&fixture("sem_endereco.html"));
    assert_eq!(raw.price, None);
    assert_eq!(raw.area, None);
    assert_eq!(raw.address.as_deref(), Some("Estrada Velha"));

    let page = RenderedPage {
        url: "https://h/imovel/lote-terreno-id-9/".to_string(),
        html: fixture("sem_endereco.html"),
    };
    let property = extract_property(&page, "https://h/imovel/lote-terreno-id-9/", Uuid::nil());
    assert_eq!(property.property_type, "lote terreno");
    assert_eq!(property.price, 0.0);
    assert_eq!(property.address, Address::street_only("Estrada Velha"));
}
