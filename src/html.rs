//! Owned snapshots of HTML matches for `parse_html` handlers.
//!
//! `scraper`'s DOM is not `Send`, so it cannot be held across an `.await` in
//! a handler. The pipeline parses the body once, copies every match into an
//! [`HtmlElement`] and drops the DOM before the first handler runs.

use std::collections::BTreeMap;

use scraper::{ElementRef, Html, Selector};

use crate::error::CrawlError;

/// Parses a CSS selector.
///
/// # Errors
///
/// Returns [`CrawlError::InvalidSelector`] when `css` is not a valid selector.
pub fn parse_selector(css: &str) -> Result<Selector, CrawlError> {
    Selector::parse(css).map_err(|e| CrawlError::InvalidSelector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

/// One element matched by a selector, detached from its document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlElement {
    index: usize,
    name: String,
    attrs: BTreeMap<String, String>,
    text: String,
    html: String,
    inner_html: String,
}

impl HtmlElement {
    fn snapshot(index: usize, element: ElementRef<'_>) -> Self {
        let value = element.value();
        Self {
            index,
            name: value.name().to_string(),
            attrs: value
                .attrs()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            text: element.text().collect(),
            html: element.html(),
            inner_html: element.inner_html(),
        }
    }

    /// Zero-based position among the selector's matches, in document order.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Lowercase tag name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value of attribute `name`.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// All attributes.
    #[must_use]
    pub fn attrs(&self) -> &BTreeMap<String, String> {
        &self.attrs
    }

    /// Concatenated descendant text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Outer HTML.
    #[must_use]
    pub fn html(&self) -> &str {
        &self.html
    }

    /// Inner HTML.
    #[must_use]
    pub fn inner_html(&self) -> &str {
        &self.inner_html
    }

    /// Searches this element's subtree, re-indexing matches from zero.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::InvalidSelector`] for an invalid selector.
    pub fn select(&self, css: &str) -> Result<Vec<HtmlElement>, CrawlError> {
        let selector = parse_selector(css)?;
        let fragment = Html::parse_fragment(&self.html);
        Ok(snapshot_matches(&fragment, &selector))
    }
}

/// Parses `body` as a document and snapshots every match of `selector`.
#[must_use]
pub fn select_document(body: &str, selector: &Selector) -> Vec<HtmlElement> {
    let document = Html::parse_document(body);
    snapshot_matches(&document, selector)
}

/// Parses `body` once and snapshots the matches of each selector in turn.
#[must_use]
pub fn select_each<'a>(
    body: &str,
    selectors: impl IntoIterator<Item = &'a Selector>,
) -> Vec<Vec<HtmlElement>> {
    let document = Html::parse_document(body);
    selectors
        .into_iter()
        .map(|selector| snapshot_matches(&document, selector))
        .collect()
}

fn snapshot_matches(document: &Html, selector: &Selector) -> Vec<HtmlElement> {
    document
        .select(selector)
        .enumerate()
        .map(|(index, element)| HtmlElement::snapshot(index, element))
        .collect()
}
