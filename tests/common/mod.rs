#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use wxcore::{Config, CredentialCache, CredentialSource, IssuedCredential, MemoryCache, RestClient, Result};

/// Source issuing `tok-1`, `tok-2`, ... without any network access
pub struct SequenceSource {
    calls: AtomicUsize,
}

impl SequenceSource {
    pub fn new() -> Arc<Self> {
        Arc::new(SequenceSource {
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CredentialSource for SequenceSource {
    fn cache_key(&self) -> String {
        "wxcore:access_token:wx-test".to_string()
    }

    fn fetch(&self) -> Result<IssuedCredential> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(IssuedCredential::new(format!("tok-{}", n), 7200))
    }
}

/// Client for `config` backed by a fresh in-memory cache
pub fn client_for(config: Config) -> (RestClient, Arc<SequenceSource>) {
    let source = SequenceSource::new();
    let credential = CredentialCache::new(source.clone(), Arc::new(MemoryCache::new()));
    let client = RestClient::new(config, credential).expect("failed to build client");
    (client, source)
}
