//! Paginated listing of the locally cached video metadata.
//!
//! The cache file is produced out of band and has the shape
//! `{"ids": [...], "videos": [{...}, ...]}`. Entries are read leniently:
//! unknown fields are ignored and missing ones fall back to defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_PAGE: usize = 1;
pub const DEFAULT_PAGE_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub page_size: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        PageRequest {
            page: DEFAULT_PAGE,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    /// Parse `page` and `page_size` from a query string. Values that do not
    /// parse fall back to the defaults; parsed values are clamped to at least 1.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut request = PageRequest::default();
        let Some(query) = query else {
            return request;
        };
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let parsed = value.trim().parse::<i64>().ok().map(|n| n.max(1) as usize);
            match (key.as_ref(), parsed) {
                ("page", Some(page)) => request.page = page,
                ("page_size", Some(size)) => request.page_size = size,
                _ => {}
            }
        }
        request
    }

    fn range(&self, len: usize) -> std::ops::Range<usize> {
        let start = self.page.saturating_sub(1).saturating_mul(self.page_size).min(len);
        let end = start.saturating_add(self.page_size).min(len);
        start..end
    }
}

#[derive(Debug, Default, Deserialize)]
struct CacheFile {
    #[serde(default)]
    ids: Vec<Value>,
    #[serde(default)]
    videos: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoSummary {
    pub id: Option<String>,
    pub title: Option<String>,
    pub views: Value,
    pub duration: Value,
    pub upload_date: String,
    pub description: String,
    pub thumbnail: String,
    pub channel: Value,
    pub channel_url: Value,
}

impl VideoSummary {
    fn from_entry(entry: &Value) -> Self {
        let field = |name: &str| entry.get(name).filter(|v| !is_blank(v)).cloned();
        let text = |name: &str| {
            entry
                .get(name)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let id = text("id");
        let thumbnail = text("thumbnail").unwrap_or_else(|| {
            format!(
                "https://i.ytimg.com/vi/{}/hqdefault.jpg",
                id.as_deref().unwrap_or_default()
            )
        });

        VideoSummary {
            title: text("title").or_else(|| id.clone()),
            views: field("view_count").or_else(|| field("views")).unwrap_or(Value::Null),
            duration: field("duration_string")
                .or_else(|| field("duration"))
                .unwrap_or(Value::Null),
            upload_date: text("upload_date").unwrap_or_default(),
            description: text("description").unwrap_or_default(),
            thumbnail,
            channel: entry.get("channel").cloned().unwrap_or(Value::Null),
            channel_url: entry.get("channel_url").cloned().unwrap_or(Value::Null),
            id,
        }
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogPage {
    pub total_count: usize,
    pub page: usize,
    pub page_size: usize,
    pub videos: Vec<VideoSummary>,
}

#[derive(Debug, Clone)]
pub struct VideoCatalog {
    cache_path: PathBuf,
}

impl VideoCatalog {
    pub fn new(cache_path: impl Into<PathBuf>) -> Self {
        VideoCatalog {
            cache_path: cache_path.into(),
        }
    }

    /// Load one page from the cache file. A missing or unreadable cache
    /// yields an empty listing.
    pub async fn page(&self, request: PageRequest) -> CatalogPage {
        let cache = self.load().await;
        let range = request.range(cache.videos.len());
        let videos: Vec<VideoSummary> = cache.videos[range]
            .iter()
            .map(VideoSummary::from_entry)
            .collect();

        log::debug!(
            "Listing page {} (size {}): {} of {} videos",
            request.page,
            request.page_size,
            videos.len(),
            cache.ids.len()
        );

        CatalogPage {
            total_count: cache.ids.len(),
            page: request.page,
            page_size: request.page_size,
            videos,
        }
    }

    async fn load(&self) -> CacheFile {
        let raw = match tokio::fs::read(&self.cache_path).await {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("Video cache {} unavailable: {}", self.cache_path.display(), e);
                return CacheFile::default();
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(cache) => cache,
            Err(e) => {
                log::warn!("Video cache {} is not valid: {}", self.cache_path.display(), e);
                CacheFile::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn catalog_with(contents: &Value) -> (tempfile::NamedTempFile, VideoCatalog) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.to_string().as_bytes()).unwrap();
        let catalog = VideoCatalog::new(file.path());
        (file, catalog)
    }

    #[test]
    fn test_page_request_from_query() {
        assert_eq!(PageRequest::from_query(None), PageRequest::default());
        assert_eq!(
            PageRequest::from_query(Some("page=3&page_size=5")),
            PageRequest { page: 3, page_size: 5 }
        );
        assert_eq!(
            PageRequest::from_query(Some("page=0&page_size=-4")),
            PageRequest { page: 1, page_size: 1 }
        );
        assert_eq!(
            PageRequest::from_query(Some("page=two&page_size=&channel_url=x")),
            PageRequest::default()
        );
    }

    #[tokio::test]
    async fn test_page_slices_and_maps_entries() {
        let (_file, catalog) = catalog_with(&json!({
            "ids": ["a", "b", "c"],
            "videos": [
                {"id": "a", "title": "First", "view_count": 10, "duration": 61,
                 "duration_string": "1:01", "upload_date": "20240101",
                 "channel": "Chan", "channel_url": "https://example.com/c"},
                {"id": "b", "duration": 30, "thumbnail": "https://img/b.jpg"},
                {"id": "c"}
            ]
        }));

        let page = catalog.page(PageRequest { page: 1, page_size: 2 }).await;
        assert_eq!(page.total_count, 3);
        assert_eq!(page.videos.len(), 2);

        let first = &page.videos[0];
        assert_eq!(first.title.as_deref(), Some("First"));
        assert_eq!(first.views, json!(10));
        assert_eq!(first.duration, json!("1:01"));
        assert_eq!(first.thumbnail, "https://i.ytimg.com/vi/a/hqdefault.jpg");
        assert_eq!(first.channel, json!("Chan"));

        let second = &page.videos[1];
        assert_eq!(second.title.as_deref(), Some("b"));
        assert_eq!(second.duration, json!(30));
        assert_eq!(second.thumbnail, "https://img/b.jpg");
        assert_eq!(second.upload_date, "");
        assert_eq!(second.views, Value::Null);

        let last = catalog.page(PageRequest { page: 2, page_size: 2 }).await;
        assert_eq!(last.videos.len(), 1);
        assert_eq!(last.videos[0].id.as_deref(), Some("c"));

        // Zero is below the first page; treated as the first page
        let zero = catalog.page(PageRequest { page: 0, page_size: 2 }).await;
        assert_eq!(zero.videos.len(), 2);

        let past_end = catalog.page(PageRequest { page: 9, page_size: 2 }).await;
        assert_eq!(past_end.total_count, 3);
        assert!(past_end.videos.is_empty());
    }

    #[tokio::test]
    async fn test_missing_or_corrupt_cache_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = VideoCatalog::new(dir.path().join("nope.json"));
        let page = missing.page(PageRequest::default()).await;
        assert_eq!(page.total_count, 0);
        assert!(page.videos.is_empty());
        assert_eq!(page.page_size, DEFAULT_PAGE_SIZE);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{not json").unwrap();
        let corrupt = VideoCatalog::new(file.path());
        assert_eq!(corrupt.page(PageRequest::default()).await.total_count, 0);
    }

    #[test]
    fn test_page_serializes_with_listing_fields() {
        let page = CatalogPage {
            total_count: 1,
            page: 1,
            page_size: 20,
            videos: vec![VideoSummary::from_entry(&json!({"id": "z"}))],
        };
        let value = serde_json::to_value(&page).unwrap();
        assert_eq!(value["total_count"], 1);
        assert_eq!(value["videos"][0]["title"], "z");
        assert_eq!(value["videos"][0]["description"], "");
        for key in ["views", "duration", "channel", "channel_url"] {
            assert!(value["videos"][0].get(key).is_some(), "missing {}", key);
        }
    }
}
