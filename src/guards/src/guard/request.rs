//! Request-like inputs to a guard

use hyper::header::HeaderMap;
use std::collections::HashMap;

/// Anything exposing credential-bearing headers
pub trait GuardRequest {
    /// Header value by case-insensitive name
    fn header(&self, name: &str) -> Option<&str>;
}

impl GuardRequest for HeaderMap {
    fn header(&self, name: &str) -> Option<&str> {
        // Non-visible-ASCII values cannot carry a credential
        self.get(name).and_then(|value| value.to_str().ok())
    }
}

impl<B> GuardRequest for hyper::Request<B> {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers().header(name)
    }
}

impl GuardRequest for HashMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name)
            .or_else(|| {
                self.iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
                    .map(|(_, value)| value)
            })
            .map(String::as_str)
    }
}

impl<T: GuardRequest + ?Sized> GuardRequest for &T {
    fn header(&self, name: &str) -> Option<&str> {
        (**self).header(name)
    }
}
