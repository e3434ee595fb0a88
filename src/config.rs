use crate::error::{RedditError, Result};

pub const DEFAULT_USER_AGENT: &str = "idea_scraper/0.1";

/// Script-app credentials. Loaded from the environment (and `.env`, if present).
#[derive(Clone)]
pub struct RedditCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub user_agent: String,
}

impl RedditCredentials {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let present = |key: &'static str| {
            get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let creds = Self {
            client_id: present("REDDIT_CLIENT_ID")
                .ok_or(RedditError::MissingCredential("REDDIT_CLIENT_ID"))?,
            client_secret: present("REDDIT_CLIENT_SECRET")
                .ok_or(RedditError::MissingCredential("REDDIT_CLIENT_SECRET"))?,
            user_agent: present("REDDIT_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        };
        tracing::debug!(
            client_id = %preview(&creds.client_id),
            user_agent = %creds.user_agent,
            "Loaded Reddit credentials"
        );
        Ok(creds)
    }
}

impl std::fmt::Debug for RedditCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedditCredentials")
            .field("client_id", &preview(&self.client_id))
            .field("client_secret", &"***")
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

fn preview(val: &str) -> String {
    let n = val.chars().count().min(4);
    format!("{}…", val.chars().take(n).collect::<String>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn user_agent_has_a_default() {
        let creds = RedditCredentials::from_lookup(lookup(&[
            ("REDDIT_CLIENT_ID", "id"),
            ("REDDIT_CLIENT_SECRET", "secret"),
        ]))
        .unwrap();
        assert_eq!(creds.user_agent, DEFAULT_USER_AGENT);
    }

    #[test]
    fn missing_or_blank_secret_fails() {
        let err = RedditCredentials::from_lookup(lookup(&[
            ("REDDIT_CLIENT_ID", "id"),
            ("REDDIT_CLIENT_SECRET", "  "),
        ]))
        .unwrap_err();
        assert!(matches!(err, RedditError::MissingCredential("REDDIT_CLIENT_SECRET")));
    }

    #[test]
    fn debug_hides_secret() {
        let creds = RedditCredentials::from_lookup(lookup(&[
            ("REDDIT_CLIENT_ID", "abcdefgh"),
            ("REDDIT_CLIENT_SECRET", "topsecret"),
        ]))
        .unwrap();
        let shown = format!("{creds:?}");
        assert!(!shown.contains("topsecret"));
        assert!(!shown.contains("abcdefgh"));
    }
}
