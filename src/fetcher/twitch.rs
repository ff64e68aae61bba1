use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::Fetcher;
use crate::error::FetchError;
use crate::model::{truncate_chars, LiveStatus, MAX_STREAM_TITLE_LEN};

/// Public client id used by the Twitch web player.
const CLIENT_ID: &str = "kimne78kx3ncx6brgo4mv6wki5h1ko";

const STREAM_QUERY: &str =
    "query($login: String!) { user(login: $login) { stream { title viewersCount game { name } } } }";

#[derive(Debug, Deserialize)]
struct GqlResponse {
    data: Option<GqlData>,
}

#[derive(Debug, Deserialize)]
struct GqlData {
    user: Option<GqlUser>,
}

#[derive(Debug, Deserialize)]
struct GqlUser {
    stream: Option<GqlStream>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlStream {
    title: Option<String>,
    viewers_count: Option<u64>,
    game: Option<GqlGame>,
}

#[derive(Debug, Deserialize)]
struct GqlGame {
    name: String,
}

impl Fetcher {
    /// Look up whether `login` is streaming right now.
    pub async fn fetch_live_status(&self, login: &str) -> LiveStatus {
        let login = login.trim().to_lowercase();
        info!("Checking live status: {}", login);

        match self.try_fetch_live_status(&login).await {
            Ok(status) => status,
            Err(e) => {
                warn!("Failed to check live status for '{}': {}", login, e);
                LiveStatus::unknown(login, e.kind())
            }
        }
    }

    async fn try_fetch_live_status(&self, login: &str) -> Result<LiveStatus, FetchError> {
        let response = self
            .client
            .post(&self.options.endpoints.twitch_gql)
            .header("Client-Id", CLIENT_ID)
            .json(&json!({
                "query": STREAM_QUERY,
                "variables": { "login": login },
            }))
            .timeout(self.options.api_timeout)
            .send()
            .await?
            .error_for_status()?;
        let body = response.bytes().await?;

        parse_stream(login, &body)
    }
}

/// Classify a GraphQL stream lookup. A known user without a stream is
/// offline; an unknown user is an error.
pub fn parse_stream(login: &str, body: &[u8]) -> Result<LiveStatus, FetchError> {
    let response: GqlResponse = serde_json::from_slice(body)?;

    let data = response
        .data
        .ok_or_else(|| FetchError::MissingData(format!("no data for {}", login)))?;
    let user = data
        .user
        .ok_or_else(|| FetchError::UnknownChannel(login.to_string()))?;

    Ok(match user.stream {
        Some(stream) => LiveStatus::live(
            login,
            truncate_chars(&stream.title.unwrap_or_default(), MAX_STREAM_TITLE_LEN),
            stream.game.map(|g| g.name).unwrap_or_default(),
            stream.viewers_count.unwrap_or(0),
        ),
        None => LiveStatus::offline(login),
    })
}
