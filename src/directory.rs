use reqwest::Client;
use serde::{ Deserialize, Serialize };
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{ debug, info };
use url::Url;

use crate::error::DirectoryError;

// ─────────────────────────────────────────────────────────────────────
//  Known channels
// ─────────────────────────────────────────────────────────────────────

/// Set of channel names the client knows about.  Only membership matters;
/// iteration is sorted so listings are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelDirectory {
    names: BTreeSet<String>,
}

impl ChannelDirectory {
    pub fn with_channel(name: &str) -> Self {
        let mut dir = Self::default();
        dir.insert(name);
        dir
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Add-if-absent.  Returns `true` when the name was new.
    pub fn insert(&mut self, name: &str) -> bool {
        if self.names.contains(name) {
            return false;
        }
        self.names.insert(name.to_string())
    }

    /// Replace the whole set with a fresh directory listing.
    pub fn replace<I, S>(&mut self, names: I)
        where I: IntoIterator<Item = S>, S: Into<String>
    {
        self.names = names
            .into_iter()
            .map(Into::into)
            .filter(|n: &String| !n.trim().is_empty())
            .collect();
    }

    /// Next free `"Channel N"` name, starting at N = count + 1.
    pub fn next_channel_name(&self) -> String {
        let mut n = self.names.len() + 1;
        loop {
            let candidate = format!("Channel {}", n);
            if !self.names.contains(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.names.iter().cloned().collect()
    }
}

// ─────────────────────────────────────────────────────────────────────
//  Directory service
// ─────────────────────────────────────────────────────────────────────

/// `GET /api/channels` body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelListResponse {
    pub channels: Vec<String>,
}

/// HTTP client for the channel directory service.
#[derive(Clone)]
pub struct DirectoryClient {
    client: Client,
    url: Url,
}

impl DirectoryClient {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, DirectoryError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, url))
    }

    pub fn with_client(client: Client, url: Url) -> Self {
        Self { client, url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Fetch the current channel list.
    pub async fn fetch(&self) -> Result<Vec<String>, DirectoryError> {
        debug!(url = %self.url, "fetching channel directory");
        let response = self.client.get(self.url.clone()).send().await?.error_for_status()?;
        let body: ChannelListResponse = response.json().await?;
        info!(count = body.channels.len(), "📒 channel directory fetched");
        Ok(body.channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_stub::{ serve_json, serve_once };

    #[test]
    fn test_replace_then_create_names_next_channel() {
        let mut dir = ChannelDirectory::with_channel("Default");
        dir.replace(["Default", "Lobby"]);
        assert_eq!(dir.names(), vec!["Default".to_string(), "Lobby".to_string()]);

        let name = dir.next_channel_name();
        assert_eq!(name, "Channel 3");
        assert!(dir.insert(&name));
        assert_eq!(dir.len(), 3);
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut dir = ChannelDirectory::default();
        assert_eq!(dir.len(), 0);
        assert!(dir.insert("Lobby"));
        assert!(!dir.insert("Lobby"));
        assert_eq!(dir.len(), 1);
        assert!(dir.contains("Lobby"));
        assert!(!dir.contains("lobby"));
    }

    #[test]
    fn test_next_name_skips_taken() {
        let mut dir = ChannelDirectory::default();
        dir.replace(["Default", "Channel 3"]);
        assert_eq!(dir.next_channel_name(), "Channel 4");
    }

    #[test]
    fn test_replace_drops_blank_names() {
        let mut dir = ChannelDirectory::with_channel("Old");
        dir.replace(vec!["A".to_string(), "  ".to_string(), String::new()]);
        assert_eq!(dir.names(), vec!["A".to_string()]);
    }

    #[test]
    fn test_response_shape() {
        let body: ChannelListResponse = serde_json
            ::from_str(r#"{"channels":["Default","Lobby"]}"#)
            .unwrap();
        assert_eq!(body.channels, vec!["Default", "Lobby"]);
    }

    #[tokio::test]
    async fn test_fetch_from_http_endpoint() {
        let (addr, served) = serve_json(r#"{"channels":["Default","Lobby"]}"#).await;

        let url = Url::parse(&format!("http://{}/api/channels", addr)).unwrap();
        let http = Client::builder().no_proxy().timeout(Duration::from_secs(5)).build().unwrap();
        let client = DirectoryClient::with_client(http, url);
        let channels = client.fetch().await.unwrap();
        assert_eq!(channels, vec!["Default".to_string(), "Lobby".to_string()]);

        let request = served.await.unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.target, "/api/channels");
    }

    #[tokio::test]
    async fn test_fetch_server_error_is_reported() {
        let (addr, _served) = serve_once("500 Internal Server Error", "text/plain", b"boom".to_vec()).await;

        let url = Url::parse(&format!("http://{}/api/channels", addr)).unwrap();
        let http = Client::builder().no_proxy().build().unwrap();
        let client = DirectoryClient::with_client(http, url);
        assert!(matches!(client.fetch().await, Err(DirectoryError::Http(_))));
    }
}
