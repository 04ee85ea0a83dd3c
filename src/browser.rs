//! A concrete [`BrowserSession`] used when the CLI isn't wired to a real
//! headless-browser driver.
//!
//! Headless-browser automation (navigating a JS-rendered page, capturing
//! the XHR/fetch responses that satisfy the `/api/` filter in
//! [`crate::extractor::parse_json_payloads`]) is out of scope here: the
//! `BrowserSession` trait is the interface, not an implementation this
//! crate owns. This fetches the page over plain HTTP instead of through a
//! JS engine, so it only ever yields the server-rendered HTML and never
//! any XHR payloads. Good enough for pages that render their event list
//! server-side, and a placeholder seam for whoever wires in a real
//! Playwright/Chromium driver.

use async_trait::async_trait;
use reqwest::Client;

use crate::error::CoreError;
use crate::extractor::{BrowserSession, CapturedPage};

pub struct HttpBrowserSession {
    url: String,
    client: Client,
}

impl HttpBrowserSession {
    pub fn new(url: String, proxy: Option<&str>) -> Result<Self, CoreError> {
        let mut builder = Client::builder();
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| CoreError::ExtractionFailure(e.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| CoreError::ExtractionFailure(e.to_string()))?;
        Ok(HttpBrowserSession { url, client })
    }
}

#[async_trait]
impl BrowserSession for HttpBrowserSession {
    async fn navigate(&self) -> Result<CapturedPage, CoreError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| CoreError::ExtractionFailure(e.to_string()))?;
        let html = response
            .text()
            .await
            .map_err(|e| CoreError::ExtractionFailure(e.to_string()))?;
        Ok(CapturedPage {
            json_payloads: Vec::new(),
            html,
        })
    }
}
