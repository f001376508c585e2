use crate::price;
use anyhow::Context;
use async_trait::async_trait;
use derive_more::{Display, Error};
use lazy_regex::regex_captures;
use log_error::LogError;
use md5::{Digest, Md5};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use time::macros::format_description;
use time::OffsetDateTime;

pub const DEFAULT_ENDPOINT: &str = "https://api-sg.aliexpress.com/sync";

pub const SEARCH_METHOD: &str = "aliexpress.affiliate.product.query";
pub const HOT_METHOD: &str = "aliexpress.affiliate.hotproduct.query";
pub const DETAILS_METHOD: &str = "aliexpress.affiliate.productdetail.get";

const SUCCESS_CODE: i64 = 200;

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct SmallImages {
    #[serde(default)]
    pub string: Vec<String>,
}

/// Product as returned by the affiliate API. Numeric fields arrive either as
/// strings or as numbers depending on the method.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct ApiProduct {
    #[serde(default, deserialize_with = "de_opt_string")]
    pub product_id: Option<String>,
    pub product_title: Option<String>,
    pub product_main_image_url: Option<String>,
    #[serde(default)]
    pub product_small_image_urls: Option<SmallImages>,
    #[serde(default)]
    pub target_sale_price: Option<Value>,
    #[serde(default)]
    pub target_original_price: Option<Value>,
    #[serde(default)]
    pub sale_price: Option<Value>,
    #[serde(default)]
    pub original_price: Option<Value>,
    pub target_sale_price_currency: Option<String>,
    pub promotion_link: Option<String>,
    pub product_detail_url: Option<String>,
    pub first_level_category_name: Option<String>,
    pub second_level_category_name: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub shop_id: Option<String>,
}

impl ApiProduct {
    pub fn sale_price(&self) -> Decimal {
        self.target_sale_price
            .as_ref()
            .or(self.sale_price.as_ref())
            .map(price::normalize_value)
            .unwrap_or_default()
    }

    pub fn original_price(&self) -> Option<Decimal> {
        self.target_original_price
            .as_ref()
            .or(self.original_price.as_ref())
            .map(price::normalize_value)
            .filter(|p| !p.is_zero())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub keywords: String,
    #[serde(default)]
    pub category_ids: Option<String>,
    #[serde(default)]
    pub min_price: Option<Decimal>,
    #[serde(default)]
    pub max_price: Option<Decimal>,
    #[serde(default = "default_page_no")]
    pub page_no: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct HotQuery {
    #[serde(default)]
    pub category_ids: Option<String>,
    #[serde(default = "default_page_no")]
    pub page_no: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for HotQuery {
    fn default() -> Self {
        Self {
            category_ids: None,
            page_no: default_page_no(),
            page_size: default_page_size(),
        }
    }
}

fn default_page_no() -> u32 {
    1
}

fn default_page_size() -> u32 {
    50
}

/// API answer that carried no success envelope.
#[derive(Debug, Display, Error, Clone, PartialEq)]
pub enum EnvelopeError {
    #[display("{method}: request rejected ({code}): {message}")]
    Rejected {
        method: String,
        code: String,
        message: String,
    },
    #[display("{method}: unsuccessful response ({code}): {message}")]
    Unsuccessful {
        method: String,
        code: String,
        message: String,
    },
    #[display("{method}: response has no {envelope}.resp_result")]
    Missing { method: String, envelope: String },
}

/// One page of API results. `error` is set when the envelope was not a
/// success; `products` is then empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiPage {
    pub products: Vec<ApiProduct>,
    pub error: Option<EnvelopeError>,
}

impl ApiPage {
    pub fn ok(products: Vec<ApiProduct>) -> Self {
        Self {
            products,
            error: None,
        }
    }

    pub fn failed(error: EnvelopeError) -> Self {
        Self {
            products: vec![],
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Vec<ApiProduct>, EnvelopeError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.products),
        }
    }
}

#[async_trait]
pub trait AffiliateApi: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<ApiPage, anyhow::Error>;
    async fn hot_products(&self, query: &HotQuery) -> Result<ApiPage, anyhow::Error>;
    async fn product_details(&self, ids: &[String]) -> Result<ApiPage, anyhow::Error>;
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub app_key: String,
    pub app_secret: String,
    pub tracking_id: String,
}

pub struct AliExpressClient {
    client: Client,
    endpoint: String,
    credentials: Credentials,
    target_currency: String,
    target_language: String,
}

impl AliExpressClient {
    pub fn new(client: Client, endpoint: String, credentials: Credentials) -> Self {
        Self {
            client,
            endpoint,
            credentials,
            target_currency: pricefeed_types::DEFAULT_CURRENCY.to_string(),
            target_language: "EN".to_string(),
        }
    }

    pub fn with_target(mut self, currency: String, language: String) -> Self {
        self.target_currency = currency;
        self.target_language = language;
        self
    }

    /// Protocol parameters, method parameters and `sign`.
    pub fn request_params(
        &self,
        method: &str,
        params: Vec<(&str, String)>,
        now: OffsetDateTime,
    ) -> Result<BTreeMap<String, String>, anyhow::Error> {
        let timestamp = now
            .format(format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second]"
            ))
            .context("Unable to format timestamp")?;
        let mut res: BTreeMap<String, String> = [
            ("app_key", self.credentials.app_key.clone()),
            ("method", method.to_string()),
            ("sign_method", "md5".to_string()),
            ("timestamp", timestamp),
            ("format", "json".to_string()),
            ("v", "2.0".to_string()),
            ("tracking_id", self.credentials.tracking_id.clone()),
            ("target_currency", self.target_currency.clone()),
            ("target_language", self.target_language.clone()),
        ]
        .into_iter()
        .chain(params)
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        let sign = sign(
            &self.credentials.app_secret,
            res.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        );
        res.insert("sign".to_string(), sign);
        Ok(res)
    }

    async fn call(
        &self,
        method: &str,
        params: Vec<(&str, String)>,
    ) -> Result<ApiPage, anyhow::Error> {
        let form = self.request_params(method, params, OffsetDateTime::now_utc())?;
        log::debug!("Calling {method}");
        let body = self
            .client
            .post(&self.endpoint)
            .form(&form)
            .send()
            .await
            .context(format!("Unable to call {method}"))?
            .error_for_status()?
            .json::<Value>()
            .await
            .context(format!("Unable to read {method} response"))?;
        Ok(extract_page(method, &body))
    }
}

#[async_trait]
impl AffiliateApi for AliExpressClient {
    async fn search(&self, query: &SearchQuery) -> Result<ApiPage, anyhow::Error> {
        let mut params = vec![
            ("keywords", query.keywords.clone()),
            ("page_no", query.page_no.to_string()),
            ("page_size", query.page_size.to_string()),
        ];
        if let Some(ids) = &query.category_ids {
            params.push(("category_ids", ids.clone()));
        }
        if let Some(min) = query.min_price {
            params.push(("min_sale_price", min.to_string()));
        }
        if let Some(max) = query.max_price {
            params.push(("max_sale_price", max.to_string()));
        }
        self.call(SEARCH_METHOD, params).await
    }

    async fn hot_products(&self, query: &HotQuery) -> Result<ApiPage, anyhow::Error> {
        let mut params = vec![
            ("page_no", query.page_no.to_string()),
            ("page_size", query.page_size.to_string()),
        ];
        if let Some(ids) = &query.category_ids {
            params.push(("category_ids", ids.clone()));
        }
        self.call(HOT_METHOD, params).await
    }

    async fn product_details(&self, ids: &[String]) -> Result<ApiPage, anyhow::Error> {
        self.call(DETAILS_METHOD, vec![("product_ids", ids.join(","))])
            .await
    }
}

/// `MD5(secret + k1 + v1 + ... + secret)` over keys in lexicographic order,
/// upper-case hex.
pub fn sign<'a, I>(secret: &str, params: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut params: Vec<_> = params.into_iter().collect();
    params.sort_by(|a, b| a.0.cmp(b.0));
    let mut hasher = Md5::new();
    hasher.update(secret.as_bytes());
    for (k, v) in params {
        hasher.update(k.as_bytes());
        hasher.update(v.as_bytes());
    }
    hasher.update(secret.as_bytes());
    format!("{:X}", hasher.finalize())
}

/// Unwraps `<method>_response.resp_result.result.products.product`.
/// A top-level `error_response` (bad signature, unknown app key) or a
/// non-success `resp_code` yields an empty page carrying the error.
pub fn extract_page(method: &str, body: &Value) -> ApiPage {
    if let Some(err) = body.get("error_response") {
        let error = EnvelopeError::Rejected {
            method: method.to_string(),
            code: value_text(err.get("code")),
            message: value_text(err.get("msg").or(err.get("sub_msg"))),
        };
        log::warn!("{error}");
        return ApiPage::failed(error);
    }
    let envelope = format!("{}_response", method.replace('.', "_"));
    let Some(resp_result) = body.get(&envelope).and_then(|e| e.get("resp_result")) else {
        log::warn!("{method}: unexpected response {body}");
        return ApiPage::failed(EnvelopeError::Missing {
            method: method.to_string(),
            envelope,
        });
    };
    let code = resp_result.get("resp_code").and_then(|c| {
        c.as_i64()
            .or_else(|| c.as_str().and_then(|s| s.parse().ok()))
    });
    if code != Some(SUCCESS_CODE) {
        let error = EnvelopeError::Unsuccessful {
            method: method.to_string(),
            code: value_text(resp_result.get("resp_code")),
            message: value_text(resp_result.get("resp_msg")),
        };
        log::warn!("{error}");
        return ApiPage::failed(error);
    }
    let products = resp_result
        .pointer("/result/products/product")
        .and_then(Value::as_array)
        .map(|products| {
            products
                .iter()
                .filter_map(|p| {
                    serde_json::from_value::<ApiProduct>(p.clone())
                        .log_error("Unable to decode API product")
                })
                .collect()
        })
        .unwrap_or_default();
    ApiPage::ok(products)
}

/// Products of a page, empty when the envelope was not a success.
pub fn extract_products(method: &str, body: &Value) -> Vec<ApiProduct> {
    extract_page(method, body).products
}

fn value_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "none".to_string(),
        Some(v) => v.to_string(),
    }
}

/// Product id from the known AliExpress link shapes.
pub fn match_product_id<S: AsRef<str>>(url: S) -> Option<String> {
    let url = url.as_ref();
    regex_captures!(r"/item/(\d+)\.html", url)
        .or_else(|| regex_captures!(r"/i/(\d+)\.html", url))
        .or_else(|| regex_captures!(r"[?&]productId=(\d+)", url))
        .or_else(|| regex_captures!(r"/(\d{10,})\.html", url))
        .map(|(_, id)| id.to_string())
}

/// Like [`match_product_id`], following redirects of short links when the
/// URL itself carries no id.
pub async fn resolve_product_id(client: &Client, url: &str) -> Option<String> {
    if let Some(id) = match_product_id(url) {
        return Some(id);
    }
    let resp = client
        .get(url)
        .send()
        .await
        .log_error("Unable to follow product link")?;
    let id = match_product_id(resp.url().as_str());
    if id.is_none() {
        log::info!("No product id found for {url} (resolved to {})", resp.url());
    }
    id
}

fn de_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StrOrNum {
        Str(String),
        Int(i64),
        Num(f64),
    }

    let v = Option::<StrOrNum>::deserialize(deserializer)?;
    Ok(v.map(|x| match x {
        StrOrNum::Str(s) => s,
        StrOrNum::Int(i) => i.to_string(),
        StrOrNum::Num(n) => n.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{http_response, local_client, stub_server};
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn client(secret: &str) -> AliExpressClient {
        AliExpressClient::new(
            Client::new(),
            DEFAULT_ENDPOINT.to_string(),
            Credentials {
                app_key: "12345".to_string(),
                app_secret: secret.to_string(),
                tracking_id: "tr".to_string(),
            },
        )
    }

    #[test]
    fn signature_vectors() {
        assert_eq!(sign("", Vec::<(&str, &str)>::new()), "D41D8CD98F00B204E9800998ECF8427E");
        assert_eq!(sign("", [("a", "bc")]), "900150983CD24FB0D6963F7D28E17F72");
        assert_eq!(
            sign("s", [("b", "2"), ("a", "1")]),
            "5EE29085AF57D942F21F1C5BA3C2A90A"
        );
        assert_eq!(
            sign(
                "secret",
                [("method", HOT_METHOD), ("app_key", "12345")]
            ),
            "662C77DDB3062B0A1F2A226127230454"
        );
    }

    #[test]
    fn signature_ignores_parameter_order() {
        let a = sign("k", [("x", "1"), ("y", "2"), ("z", "3")]);
        let b = sign("k", [("z", "3"), ("x", "1"), ("y", "2")]);
        assert_eq!(a, b);
    }

    #[test]
    fn request_carries_protocol_params_and_sign() {
        let now = time::macros::datetime!(2024-03-05 07:08:09 UTC);
        let params = client("secret")
            .request_params(HOT_METHOD, vec![("page_no", "2".to_string())], now)
            .unwrap();
        assert_eq!(params["timestamp"], "2024-03-05 07:08:09");
        assert_eq!(params["sign_method"], "md5");
        assert_eq!(params["format"], "json");
        assert_eq!(params["v"], "2.0");
        assert_eq!(params["tracking_id"], "tr");
        assert_eq!(params["target_currency"], "EUR");
        assert_eq!(params["page_no"], "2");
        let expected = sign(
            "secret",
            params
                .iter()
                .filter(|(k, _)| k.as_str() != "sign")
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        assert_eq!(params["sign"], expected);
    }

    #[test]
    fn extracts_products_on_success() {
        let body = json!({
            "aliexpress_affiliate_hotproduct_query_response": {
                "resp_result": {
                    "resp_code": 200,
                    "resp_msg": "Call succeeds",
                    "result": {
                        "products": {
                            "product": [
                                {
                                    "product_id": 1005004,
                                    "product_title": "Earbuds",
                                    "target_sale_price": "12.50",
                                    "target_original_price": 25,
                                    "product_small_image_urls": {"string": ["https://img/2"]}
                                },
                                {
                                    "product_id": "1005005",
                                    "product_title": "Cable"
                                }
                            ]
                        }
                    }
                }
            }
        });
        let products = extract_products(HOT_METHOD, &body);
        assert_eq!(products.len(), 2);
        assert_eq!(products[0].product_id.as_deref(), Some("1005004"));
        assert_eq!(products[0].sale_price(), dec!(12.50));
        assert_eq!(products[0].original_price(), Some(dec!(25)));
        assert_eq!(products[1].product_id.as_deref(), Some("1005005"));
        assert_eq!(products[1].sale_price(), Decimal::ZERO);
    }

    #[test]
    fn unsuccessful_envelope_carries_the_error() {
        let body = json!({
            "aliexpress_affiliate_product_query_response": {
                "resp_result": {"resp_code": 405, "resp_msg": "No results"}
            }
        });
        assert!(extract_products(SEARCH_METHOD, &body).is_empty());
        let page = extract_page(SEARCH_METHOD, &body);
        assert_eq!(
            page.error,
            Some(EnvelopeError::Unsuccessful {
                method: SEARCH_METHOD.to_string(),
                code: "405".to_string(),
                message: "No results".to_string(),
            })
        );

        let body = json!({"error_response": {"code": "IncompleteSignature", "msg": "Bad sign"}});
        let err = extract_page(SEARCH_METHOD, &body).into_result().unwrap_err();
        assert!(matches!(err, EnvelopeError::Rejected { ref code, .. } if code == "IncompleteSignature"));
        assert!(err.to_string().contains("Bad sign"));

        let err = extract_page(HOT_METHOD, &json!({})).into_result().unwrap_err();
        assert!(matches!(err, EnvelopeError::Missing { .. }));
    }

    fn rejects_signature(_: &str) -> String {
        http_response(
            "200 OK",
            "Content-Type: application/json\r\n",
            r#"{"error_response":{"code":"IncompleteSignature","msg":"The request signature does not conform to platform standards"}}"#,
        )
    }

    #[tokio::test]
    async fn rejected_call_is_not_an_empty_success() {
        let base = stub_server(rejects_signature).await;
        let api = AliExpressClient::new(
            local_client(),
            format!("{base}/sync"),
            Credentials {
                app_key: "12345".to_string(),
                app_secret: "wrong".to_string(),
                tracking_id: "tr".to_string(),
            },
        );
        let page = api.hot_products(&HotQuery::default()).await.unwrap();
        assert!(page.products.is_empty());
        assert!(matches!(
            page.error,
            Some(EnvelopeError::Rejected { ref code, .. }) if code == "IncompleteSignature"
        ));
    }

    fn redirects(path: &str) -> String {
        match path {
            "/s/abc" => http_response("302 Found", "Location: /item/1005001234567.html\r\n", ""),
            "/s/home" => http_response("302 Found", "Location: /home\r\n", ""),
            _ => http_response("200 OK", "", "ok"),
        }
    }

    #[tokio::test]
    async fn short_links_are_followed() {
        let base = stub_server(redirects).await;
        let client = local_client();
        assert_eq!(
            resolve_product_id(&client, &format!("{base}/s/abc")).await.as_deref(),
            Some("1005001234567")
        );
        assert_eq!(resolve_product_id(&client, &format!("{base}/s/home")).await, None);
        assert_eq!(resolve_product_id(&client, "http://127.0.0.1:1/s/abc").await, None);
        assert_eq!(
            resolve_product_id(&client, "https://www.aliexpress.com/item/42.html").await.as_deref(),
            Some("42")
        );
    }

    #[test]
    fn product_id_from_links() {
        assert_eq!(
            match_product_id("https://www.aliexpress.com/item/1005001234567890.html?spm=a2g0o").as_deref(),
            Some("1005001234567890")
        );
        assert_eq!(
            match_product_id("https://m.aliexpress.com/i/32812345678.html").as_deref(),
            Some("32812345678")
        );
        assert_eq!(
            match_product_id("https://a.aliexpress.com/detail?productId=4000123&x=1").as_deref(),
            Some("4000123")
        );
        assert_eq!(
            match_product_id("https://aliexpress.ru/store/1005009999999.html").as_deref(),
            Some("1005009999999")
        );
        assert_eq!(match_product_id("https://example.com/shoes.html"), None);
    }
}
