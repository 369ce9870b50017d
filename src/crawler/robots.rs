//! Minimal robots.txt support: group selection by user-agent, longest-rule
//! Allow/Disallow matching, and sitemap discovery. Rules are fetched once
//! per origin and cached for the duration of the crawl job.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

/// Parsed rules for the selected user-agent group.
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    allows: Vec<String>,
    disallows: Vec<String>,
    pub sitemaps: Vec<String>,
}

impl RobotsRules {
    /// Longest matching rule wins; ties go to Allow. No matching rule
    /// means allowed.
    pub fn is_allowed(&self, path: &str) -> bool {
        let best_allow = longest_match(&self.allows, path);
        let best_disallow = longest_match(&self.disallows, path);
        match (best_allow, best_disallow) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(d)) => a >= d,
        }
    }
}

fn longest_match(rules: &[String], path: &str) -> Option<usize> {
    rules
        .iter()
        .filter(|r| !r.is_empty() && path.starts_with(r.as_str()))
        .map(|r| r.len())
        .max()
}

/// Parse robots.txt content, selecting the group for `user_agent` and
/// falling back to the `*` group.
pub fn parse(content: &str, user_agent: &str) -> RobotsRules {
    let ua_token = user_agent
        .split('/')
        .next()
        .unwrap_or(user_agent)
        .to_lowercase();

    struct Group {
        agents: Vec<String>,
        allows: Vec<String>,
        disallows: Vec<String>,
    }

    let mut groups: Vec<Group> = Vec::new();
    let mut sitemaps: Vec<String> = Vec::new();
    let mut in_agent_run = false;

    for line in content.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let field = field.trim().to_lowercase();
        let value = value.trim().to_string();

        match field.as_str() {
            "user-agent" => {
                if in_agent_run {
                    if let Some(group) = groups.last_mut() {
                        group.agents.push(value.to_lowercase());
                    }
                } else {
                    groups.push(Group {
                        agents: vec![value.to_lowercase()],
                        allows: Vec::new(),
                        disallows: Vec::new(),
                    });
                    in_agent_run = true;
                }
            }
            "allow" => {
                in_agent_run = false;
                if let Some(group) = groups.last_mut() {
                    if !value.is_empty() {
                        group.allows.push(value);
                    }
                }
            }
            "disallow" => {
                in_agent_run = false;
                if let Some(group) = groups.last_mut() {
                    if !value.is_empty() {
                        group.disallows.push(value);
                    }
                }
            }
            "sitemap" => {
                sitemaps.push(value);
            }
            _ => {
                in_agent_run = false;
            }
        }
    }

    // Specific group first, wildcard fallback.
    let selected = groups
        .iter()
        .find(|g| g.agents.iter().any(|a| ua_token.contains(a.as_str()) || a == &ua_token))
        .or_else(|| groups.iter().find(|g| g.agents.iter().any(|a| a == "*")));

    match selected {
        Some(group) => RobotsRules {
            allows: group.allows.clone(),
            disallows: group.disallows.clone(),
            sitemaps,
        },
        None => RobotsRules {
            allows: Vec::new(),
            disallows: Vec::new(),
            sitemaps,
        },
    }
}

/// Per-origin robots cache, alive for one crawl job.
pub struct RobotsCache {
    client: reqwest::Client,
    user_agent: String,
    rules: Mutex<HashMap<String, RobotsRules>>,
}

impl RobotsCache {
    pub fn new(client: reqwest::Client, user_agent: String) -> Self {
        Self {
            client,
            user_agent,
            rules: Mutex::new(HashMap::new()),
        }
    }

    /// Rules for an origin (`scheme://host[:port]`), fetched on first use.
    /// An unreachable or missing robots.txt allows everything.
    pub async fn rules_for(&self, origin: &str) -> RobotsRules {
        {
            let cached = self.rules.lock().await;
            if let Some(rules) = cached.get(origin) {
                return rules.clone();
            }
        }

        let fetched = self.fetch(origin).await.unwrap_or_default();
        let mut cached = self.rules.lock().await;
        cached.insert(origin.to_string(), fetched.clone());
        fetched
    }

    async fn fetch(&self, origin: &str) -> Option<RobotsRules> {
        let url = format!("{}/robots.txt", origin);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body = response.text().await.ok()?;
        Some(parse(&body, &self.user_agent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROBOTS: &str = r#"
# comments are ignored
User-agent: *
Disallow: /private
Allow: /private/ok
Sitemap: https://example.test/sitemap.xml

User-agent: answer-harness
Disallow: /only-for-us
"#;

    #[test]
    fn test_wildcard_group_disallow() {
        let rules = parse(ROBOTS, "somebot/1.0");
        assert!(!rules.is_allowed("/private"));
        assert!(!rules.is_allowed("/private/inner"));
        assert!(rules.is_allowed("/public"));
    }

    #[test]
    fn test_allow_beats_shorter_disallow() {
        let rules = parse(ROBOTS, "somebot/1.0");
        assert!(rules.is_allowed("/private/ok/page"));
    }

    #[test]
    fn test_specific_group_selected() {
        let rules = parse(ROBOTS, "answer-harness/0.4.0");
        assert!(!rules.is_allowed("/only-for-us"));
        // The wildcard group's rules do not apply to the specific group.
        assert!(rules.is_allowed("/private"));
    }

    #[test]
    fn test_sitemaps_collected() {
        let rules = parse(ROBOTS, "anything");
        assert_eq!(rules.sitemaps, vec!["https://example.test/sitemap.xml"]);
    }

    #[test]
    fn test_empty_robots_allows_all() {
        let rules = parse("", "bot");
        assert!(rules.is_allowed("/anything"));
    }

    #[test]
    fn test_consecutive_user_agent_lines_share_group() {
        let content = "User-agent: a\nUser-agent: b\nDisallow: /x\n";
        let rules = parse(content, "b/1.0");
        assert!(!rules.is_allowed("/x"));
    }

    #[tokio::test]
    async fn test_cache_fetches_once_per_origin() {
        let server = httpmock::MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/robots.txt");
            then.status(200).body("User-agent: *\nDisallow: /secret\n");
        });

        let cache = RobotsCache::new(reqwest::Client::new(), "answer-harness/0.4".into());
        let origin = server.base_url();
        let first = cache.rules_for(&origin).await;
        let second = cache.rules_for(&origin).await;
        assert!(!first.is_allowed("/secret"));
        assert!(!second.is_allowed("/secret"));
        assert_eq!(mock.hits(), 1);
    }

    #[tokio::test]
    async fn test_missing_robots_allows_all() {
        let server = httpmock::MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/robots.txt");
            then.status(404);
        });

        let cache = RobotsCache::new(reqwest::Client::new(), "answer-harness/0.4".into());
        let rules = cache.rules_for(&server.base_url()).await;
        assert!(rules.is_allowed("/anything"));
    }
}
