use crate::feed::{FeedBatch, FeedError, FeedRow, FieldAliases, FieldSource};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

pub const XML_ALIASES: FieldAliases = FieldAliases {
    external_id: &["g:id", "id", "product_id", "sku", "guid"],
    name: &["g:title", "title", "name", "product_name"],
    description: &["g:description", "description", "summary"],
    price: &["g:sale_price", "sale_price", "g:price", "price"],
    original_price: &["g:price", "original_price", "regular_price", "price"],
    image: &["g:image_link", "image_link", "image", "image_url", "picture"],
    images: &["g:additional_image_link", "additional_image_link", "picture"],
    affiliate_url: &["g:link", "link", "affiliate_url", "url"],
    category: &[
        "g:product_type",
        "product_type",
        "category",
        "g:google_product_category",
    ],
    brand: &["g:brand", "brand", "vendor"],
    in_stock: &["g:availability", "availability", "in_stock", "stock"],
};

pub const ITEM_CONTAINERS: [&str; 3] = ["item", "product", "entry"];

const DOCUMENT: &str = "#document";

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    fn from_start(start: &BytesStart) -> Result<Self, FeedError> {
        let attributes = start
            .attributes()
            .map(|a| {
                let a = a.map_err(|err| FeedError::MalformedXml(err.to_string()))?;
                let value = a
                    .unescape_value()
                    .map_err(|err| FeedError::MalformedXml(err.to_string()))?;
                Ok((
                    String::from_utf8_lossy(a.key.as_ref()).to_string(),
                    value.to_string(),
                ))
            })
            .collect::<Result<_, FeedError>>()?;
        Ok(Self {
            name: String::from_utf8_lossy(start.name().as_ref()).to_string(),
            attributes,
            ..Default::default()
        })
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children
            .iter()
            .filter(move |c| c.name.eq_ignore_ascii_case(name))
    }

    /// Elements called `name` anywhere below this one, outermost first.
    pub fn descendants_named<'a>(&'a self, name: &str, out: &mut Vec<&'a Element>) {
        for child in &self.children {
            if child.name.eq_ignore_ascii_case(name) {
                out.push(child);
            } else {
                child.descendants_named(name, out);
            }
        }
    }

    /// Trimmed text, or the `href` attribute for Atom-style links.
    fn value(&self) -> Option<String> {
        let text = self.text.trim();
        if !text.is_empty() {
            return Some(text.to_string());
        }
        self.attribute("href")
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(ToString::to_string)
    }
}

impl FieldSource for Element {
    fn first(&self, names: &[&str]) -> Option<String> {
        names
            .iter()
            .find_map(|n| self.children_named(n).find_map(Element::value))
    }

    fn all(&self, names: &[&str]) -> Vec<String> {
        names
            .iter()
            .flat_map(|n| self.children_named(n).filter_map(Element::value).collect::<Vec<_>>())
            .collect()
    }
}

/// Reads the whole document into an element tree rooted at a synthetic
/// document node.
pub fn parse_tree(data: &[u8]) -> Result<Element, FeedError> {
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    let data = std::str::from_utf8(data).map_err(|err| FeedError::MalformedXml(err.to_string()))?;
    let mut reader = Reader::from_str(data);
    reader.config_mut().trim_text(true);

    let mut stack = vec![Element {
        name: DOCUMENT.to_string(),
        ..Default::default()
    }];
    loop {
        let event = reader.read_event().map_err(|err| {
            FeedError::MalformedXml(format!(
                "{err} at position {}",
                reader.error_position()
            ))
        })?;
        match event {
            Event::Start(start) => stack.push(Element::from_start(&start)?),
            Event::Empty(start) => {
                let element = Element::from_start(&start)?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(element);
                }
            }
            Event::End(end) => {
                let name = String::from_utf8_lossy(end.name().as_ref()).to_string();
                if stack.len() < 2 {
                    return Err(FeedError::MalformedXml(format!("unexpected </{name}>")));
                }
                let element = stack
                    .pop()
                    .ok_or_else(|| FeedError::MalformedXml(format!("unexpected </{name}>")))?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(element);
                }
            }
            Event::Text(text) => {
                let text = match text.unescape() {
                    Ok(t) => t.to_string(),
                    Err(_) => String::from_utf8_lossy(&text).to_string(),
                };
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text);
                }
            }
            Event::CData(cdata) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&String::from_utf8_lossy(&cdata.into_inner()));
                }
            }
            Event::Eof => break,
            _ => (),
        }
    }
    if stack.len() > 1 {
        let unclosed = stack.last().map(|e| e.name.clone()).unwrap_or_default();
        return Err(FeedError::MalformedXml(format!("unclosed tag <{unclosed}>")));
    }
    let document = stack
        .pop()
        .ok_or_else(|| FeedError::MalformedXml("empty document".to_string()))?;
    if document.children.is_empty() {
        return Err(FeedError::MalformedXml("no root element".to_string()));
    }
    Ok(document)
}

/// Items under the first container name that matches at least one element.
pub fn find_items(document: &Element) -> Vec<&Element> {
    for container in ITEM_CONTAINERS {
        let mut items = Vec::new();
        document.descendants_named(container, &mut items);
        if !items.is_empty() {
            return items;
        }
    }
    Vec::new()
}

pub fn parse(data: &[u8]) -> Result<FeedBatch, FeedError> {
    let document = parse_tree(data)?;
    let mut batch = FeedBatch::default();
    for (i, item) in find_items(&document).into_iter().enumerate() {
        match FeedRow::resolve(item, &XML_ALIASES) {
            Ok(row) => batch.rows.push(row),
            Err(reason) => batch.skip(i + 1, reason),
        }
    }
    log::info!(
        "Parsed XML feed: {} rows, {} skipped",
        batch.rows.len(),
        batch.skipped.len()
    );
    Ok(batch)
}
