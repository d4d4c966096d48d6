//! Pure HTML scanning shared by the extractors.
//!
//! `scraper::Html` is not `Send`, so every function here parses, queries and
//! drops the document synchronously.

use chrono::Utc;
use harvest_core::error::ExtractError;
use harvest_core::models::{Availability, ProductRecord, compute_hash};
use harvest_core::profile::SupplierProfile;
use scraper::{ElementRef, Html, Selector};

const ORIGIN: &str = "parser";

fn selector(raw: &str) -> Result<Selector, ExtractError> {
    Selector::parse(raw).map_err(|e| ExtractError::Other(format!("Invalid selector '{raw}': {e:?}")))
}

/// Whitespace-collapsed text content.
fn text_of(element: &ElementRef) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Raw `href` values of every element matching `selector`, in document order.
pub fn select_hrefs(html: &str, selector_str: &str) -> Result<Vec<String>, ExtractError> {
    let sel = selector(selector_str)?;
    let document = Html::parse_document(html);
    Ok(document
        .select(&sel)
        .filter_map(|el| el.value().attr("href"))
        .map(|href| href.trim().to_string())
        .filter(|href| !href.is_empty())
        .collect())
}

pub fn first_href(html: &str, selector_str: &str) -> Result<Option<String>, ExtractError> {
    Ok(select_hrefs(html, selector_str)?.into_iter().next())
}

/// Extract a product record from a product page.
///
/// Fails with `SelectorNotFound` when the page is not a product page or has
/// no name. A missing price is not an error: the record carries `None`.
pub fn parse_product(
    html: &str,
    url: &str,
    profile: &SupplierProfile,
) -> Result<ProductRecord, ExtractError> {
    let selectors = &profile.selectors;
    let document = Html::parse_document(html);

    let mut is_product = false;
    for raw in &selectors.product_indicators {
        if document.select(&selector(raw)?).next().is_some() {
            is_product = true;
            break;
        }
    }
    if !is_product {
        return Err(ExtractError::SelectorNotFound(format!(
            "no product indicators on {url}"
        )));
    }

    let name = first_value(&document, &selectors.name)?
        .ok_or_else(|| ExtractError::SelectorNotFound(format!("product name on {url}")))?;

    let article = find_article(&document, &selectors.article)?
        .unwrap_or_else(|| article_from_url(url, &selectors.article_prefix));

    let price = find_price(&document, &selectors.price_meta, &selectors.price_text)?;
    let availability = find_availability(&document, &selectors.buy_button)?;

    let material_type = profile.material_for_url(url);
    let unit = profile.unit_for(&material_type);

    Ok(ProductRecord {
        article,
        name,
        price_per_unit: price,
        material_type,
        unit,
        availability_status: availability,
        source_url: url.to_string(),
        currency: None,
        origin: ORIGIN.to_string(),
        parsed_at: Utc::now(),
    })
}

/// First non-empty value among `selectors`: the `content` attribute for
/// `meta` elements, text otherwise.
fn first_value(document: &Html, selectors: &[String]) -> Result<Option<String>, ExtractError> {
    for raw in selectors {
        let Some(el) = document.select(&selector(raw)?).next() else {
            continue;
        };
        let value = if el.value().name() == "meta" {
            el.value().attr("content").unwrap_or_default().trim().to_string()
        } else {
            text_of(&el)
        };
        if !value.is_empty() {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

fn find_article(document: &Html, selectors: &[String]) -> Result<Option<String>, ExtractError> {
    for raw in selectors {
        let Some(el) = document.select(&selector(raw)?).next() else {
            continue;
        };
        let value = match el.value().attr("data-article") {
            Some(attr) if !attr.trim().is_empty() => attr.trim().to_string(),
            _ => text_of(&el),
        };
        if !value.is_empty() {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

/// `{prefix}-{trailing id}` from the URL path, or `{prefix}-{hash}` when the
/// path does not end in digits.
pub fn article_from_url(url: &str, prefix: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url).trim_end_matches('/');
    let tail = path.rsplit('/').next().unwrap_or_default();
    if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) {
        return format!("{prefix}-{tail}");
    }
    format!("{prefix}-{}", compute_hash(url)[..8].to_uppercase())
}

fn find_price(
    document: &Html,
    meta: &[String],
    text: &[String],
) -> Result<Option<f64>, ExtractError> {
    for raw in meta {
        if let Some(el) = document.select(&selector(raw)?).next()
            && let Some(content) = el.value().attr("content")
            && let Ok(price) = content.trim().parse::<f64>()
        {
            return Ok(Some(price));
        }
    }
    for raw in text {
        if let Some(el) = document.select(&selector(raw)?).next()
            && let Some(price) = parse_price_text(&text_of(&el))
        {
            return Ok(Some(price));
        }
    }
    Ok(None)
}

/// Parse a displayed price such as `"1 250,50 ₽"`. Spaces (including
/// non-breaking ones) are thousand separators.
pub fn parse_price_text(text: &str) -> Option<f64> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let start = compact.find(|c: char| c.is_ascii_digit())?;
    let mut number = String::new();
    let mut seen_separator = false;
    for c in compact[start..].chars() {
        match c {
            '0'..='9' => number.push(c),
            '.' | ',' if !seen_separator => {
                seen_separator = true;
                number.push('.');
            }
            _ => break,
        }
    }
    number.trim_end_matches('.').parse().ok()
}

fn find_availability(document: &Html, button: &str) -> Result<Availability, ExtractError> {
    if button.trim().is_empty() {
        return Ok(Availability::OnOrder);
    }
    let Some(el) = document.select(&selector(button)?).next() else {
        return Ok(Availability::OnOrder);
    };
    let label = text_of(&el).to_lowercase();
    if label.contains("корзину") || label.contains("купить") {
        Ok(Availability::InStock)
    } else {
        Ok(Availability::OnOrder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> SupplierProfile {
        SupplierProfile::from_json(
            r#"{"name":"skm_mebel","base_url":"https://skm.example","material_unit_mapping":{"edge":"м.п."}}"#,
        )
        .unwrap()
    }

    const PRODUCT: &str = r#"
        <html><head>
          <meta itemprop="name" content="ЛДСП Белый 16мм">
          <meta itemprop="price" content="1890.5">
        </head><body>
          <div class="catalog-detail">
            <h1 class="catalog-detail__title">ЛДСП Белый</h1>
            <span class="catalog-detail__article js-copy-article" data-article="W980"> Арт. W980 </span>
            <div class="catalog-detail__buy"><button>В корзину</button></div>
          </div>
        </body></html>"#;

    #[test]
    fn test_parse_full_product() {
        let record = parse_product(PRODUCT, "https://skm.example/product/ldsp-1/", &profile()).unwrap();
        assert_eq!(record.name, "ЛДСП Белый 16мм");
        assert_eq!(record.article, "W980");
        assert_eq!(record.price_per_unit, Some(1890.5));
        assert_eq!(record.availability_status, Availability::InStock);
        assert_eq!(record.material_type, "plate");
        assert_eq!(record.unit, "м²");
        assert_eq!(record.origin, "parser");
    }

    #[test]
    fn test_price_from_text_and_fallback_article() {
        let html = r#"<div class="product-detail"><h1>Кромка ПВХ</h1>
            <div class="price">1&nbsp;250,50 ₽</div>
            <button class="btn-default to-cart">Под заказ</button></div>"#;
        let record = parse_product(html, "https://skm.example/kromka/4512/", &profile()).unwrap();
        assert_eq!(record.name, "Кромка ПВХ");
        assert_eq!(record.article, "SKM-4512");
        assert_eq!(record.price_per_unit, Some(1250.5));
        assert_eq!(record.availability_status, Availability::OnOrder);
        assert_eq!(record.material_type, "edge");
        assert_eq!(record.unit, "м.п.");
    }

    #[test]
    fn test_missing_price_is_not_an_error() {
        let html = r#"<div class="catalog-detail"><h1>Фасад</h1></div>"#;
        let record = parse_product(html, "https://skm.example/product/facade", &profile()).unwrap();
        assert_eq!(record.price_per_unit, None);
        assert!(!record.has_price());
        assert!(record.article.starts_with("SKM-"));
        assert_eq!(record.article.len(), "SKM-".len() + 8);
    }

    #[test]
    fn test_non_product_page() {
        let err = parse_product("<p>Каталог</p>", "https://skm.example/catalog/", &profile()).unwrap_err();
        assert!(matches!(err, ExtractError::SelectorNotFound(_)));
    }

    #[test]
    fn test_select_hrefs() {
        let html = r##"<a href="/product/1"> x</a><a href="/product/2">y</a>
            <a href="#">z</a><a class="next" href="?PAGEN_1=2">next</a>"##;
        let hrefs = select_hrefs(html, r#"a[href*="/product/"]"#).unwrap();
        assert_eq!(hrefs, vec!["/product/1", "/product/2"]);
        assert_eq!(first_href(html, "a.next").unwrap().as_deref(), Some("?PAGEN_1=2"));
        assert_eq!(first_href(html, "a.prev").unwrap(), None);
        assert!(select_hrefs(html, "a[").is_err());
    }

    #[test]
    fn test_parse_price_text() {
        assert_eq!(parse_price_text("от 3 400 ₽"), Some(3400.0));
        assert_eq!(parse_price_text("12.75 руб."), Some(12.75));
        assert_eq!(parse_price_text("1 000,"), Some(1000.0));
        assert_eq!(parse_price_text("по запросу"), None);
    }
}
