use std::time::Duration;

use actix_web::web::Bytes;
use cardsmith_domain::{model::MediaRef, random_hex};
use moka::sync::Cache;

#[derive(Debug, Clone)]
pub struct StoredMedia {
    pub content_type: String,
    pub bytes: Bytes,
}

/// Short-lived blobs served at `GET /media/{key}` so the generation API and
/// the chat platform can fetch them by URL.
#[derive(Clone)]
pub struct MediaStore {
    entries: Cache<String, StoredMedia>,
    base_url: String,
}

impl MediaStore {
    pub const MAX_ENTRIES: u64 = 10_000;

    pub fn new(base_url: &str, ttl: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(Self::MAX_ENTRIES)
                .time_to_live(ttl)
                .build(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn put(
        &self,
        bytes: Bytes,
        content_type: impl Into<String>,
    ) -> Result<String, getrandom::Error> {
        let key = random_hex(16)?;
        self.entries.insert(
            key.clone(),
            StoredMedia {
                content_type: content_type.into(),
                bytes,
            },
        );
        Ok(key)
    }

    pub fn get(&self, key: &str) -> Option<StoredMedia> {
        self.entries.get(key)
    }

    pub fn len(&self) -> u64 {
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn url_for(&self, key: &str) -> MediaRef {
        MediaRef::new(format!("{}/media/{key}", self.base_url))
    }
}

/// Best-effort content type for generated artifacts, from the URL suffix.
pub fn content_type_for(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".mp4") {
        "video/mp4"
    } else if path.ends_with(".jpg") || path.ends_with(".jpeg") {
        "image/jpeg"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else if path.ends_with(".png") {
        "image/png"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_media_is_addressable_by_url() {
        let store = MediaStore::new("https://bot.example/", Duration::from_secs(60));
        let key = store.put(Bytes::from_static(b"png"), "image/png").unwrap();
        assert_eq!(
            store.url_for(&key).as_str(),
            format!("https://bot.example/media/{key}")
        );
        assert_eq!(store.get(&key).unwrap().bytes, Bytes::from_static(b"png"));
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn content_type_ignores_query_strings() {
        assert_eq!(content_type_for("https://cdn/x/out.MP4?sig=1"), "video/mp4");
        assert_eq!(content_type_for("https://cdn/x/out.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("https://cdn/x/out"), "application/octet-stream");
    }
}
