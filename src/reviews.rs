use serde_json::Value;
use tracing::{debug, info};

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::{ReviewPages, StrainSlug, page_count};
use crate::error::HarvestError;
use crate::http::{HttpTransport, RetryNotice, RetryPolicy};
use crate::identity::Identity;
use crate::pacing::{Pacer, PageDelay};

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewPage {
    pub records: Vec<Value>,
    pub total_count: u64,
}

/// Splits a reviews response into its record list and the `totalCount` of
/// its metadata object. The body must hold exactly those two values.
pub fn decode_review_page(body: &Value, context: &str) -> Result<ReviewPage, HarvestError> {
    let malformed = |message: &str| HarvestError::MalformedResponse {
        context: context.to_string(),
        message: message.to_string(),
    };
    let object = body
        .as_object()
        .ok_or_else(|| malformed("expected a JSON object"))?;
    if object.len() != 2 {
        return Err(malformed(&format!(
            "expected 2 top-level values, found {}",
            object.len()
        )));
    }
    let records = object
        .values()
        .find_map(Value::as_array)
        .ok_or_else(|| malformed("no record list"))?
        .clone();
    let total_count = object
        .values()
        .find(|value| value.is_object())
        .and_then(|meta| meta.get("totalCount"))
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed("metadata.totalCount missing"))?;
    Ok(ReviewPage {
        records,
        total_count,
    })
}

#[derive(Debug, Clone)]
pub struct ReviewSettings {
    pub url_template: String,
    pub page_size: u32,
    pub retry: RetryPolicy,
}

impl ReviewSettings {
    pub fn page_url(&self, slug: &StrainSlug, page: u64) -> String {
        format!(
            "{}?take={}&page={}",
            self.url_template.replace("{slug}", slug.as_str()),
            self.page_size,
            page
        )
    }
}

pub struct ReviewFetcher<'a, T: HttpTransport + ?Sized, P: Pacer + ?Sized> {
    transport: &'a T,
    pacer: &'a P,
    delay: &'a PageDelay,
    settings: &'a ReviewSettings,
    sink: Option<&'a dyn ProgressSink>,
}

impl<'a, T: HttpTransport + ?Sized, P: Pacer + ?Sized> ReviewFetcher<'a, T, P> {
    pub fn new(
        transport: &'a T,
        pacer: &'a P,
        delay: &'a PageDelay,
        settings: &'a ReviewSettings,
    ) -> Self {
        Self {
            transport,
            pacer,
            delay,
            settings,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: &'a dyn ProgressSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn fetch(
        &self,
        slug: &StrainSlug,
        identity: &Identity,
    ) -> Result<ReviewPages, HarvestError> {
        let first = self.fetch_page(slug, 1, identity)?;
        let total_pages = page_count(first.total_count, self.settings.page_size);
        info!(
            slug = %slug,
            reviews = first.total_count,
            pages = total_pages,
            "scraping reviews"
        );

        let mut pages = vec![first.records];
        for page in 2..=total_pages {
            self.pacer.sleep(self.delay.next());
            let next = self.fetch_page(slug, page, identity)?;
            pages.push(next.records);
        }
        Ok(pages)
    }

    fn fetch_page(
        &self,
        slug: &StrainSlug,
        page: u64,
        identity: &Identity,
    ) -> Result<ReviewPage, HarvestError> {
        let url = self.settings.page_url(slug, page);
        let notify = |notice: &RetryNotice<'_>| {
            if let Some(sink) = self.sink {
                sink.event(ProgressEvent::message(format!(
                    "phase=Fetch; {slug} page {page}: status {}, retry {} in {:.1}s",
                    notice.status,
                    notice.attempt,
                    notice.delay.as_secs_f64()
                )));
            }
        };
        let response = self.settings.retry.send_with_retries(
            self.transport,
            self.pacer,
            &url,
            identity,
            &notify,
        )?;
        let body: Value = response.json(&url)?;
        let decoded = decode_review_page(&body, &url)?;
        debug!(slug = %slug, page, records = decoded.records.len(), "review page");
        Ok(decoded)
    }
}
