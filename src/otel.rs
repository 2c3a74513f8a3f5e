// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Extracts trace context from delivery headers and starts one consumer span per
//! delivery, so handlers run inside the trace of whoever published the message.

use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::Extractor,
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

/// Read-only view of delivery headers for the text-map propagator.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<String, String>,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    /// Header lookup is case-insensitive.
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str).or_else(|| {
            self.headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(key))
                .map(|(_, value)| value.as_str())
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Creates a consumer span for a delivery.
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub(crate) fn new_span(
    headers: &BTreeMap<String, String>,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_headers_ignoring_case() {
        let mut headers = BTreeMap::new();
        headers.insert("Traceparent".to_owned(), "00-abc-def-01".to_owned());
        headers.insert("tenant".to_owned(), "acme".to_owned());

        let extractor = HeaderExtractor::new(&headers);

        assert_eq!(extractor.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(extractor.get("tenant"), Some("acme"));
        assert_eq!(extractor.get("missing"), None);
        assert_eq!(extractor.keys().len(), 2);
    }
}
