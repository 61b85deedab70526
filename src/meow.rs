//! What the bot actually says.
//!
//! Every handler here degrades instead of failing: an upstream outage is
//! answered from the caches, and an empty cache from a fixed sentence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use channel_message::Channel;
use chrono::Local;
use rand::{rng, seq::IndexedRandom};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::context::SharedContext;
use crate::error::BotError;
use crate::snapshot::{SeriesRow, parse_fuel_csv};

pub const FACT_URL: &str = "https://meowfacts.herokuapp.com/";
pub const FACT_CREDIT: &str = "https://github.com/wh-iterabb-it/meowfacts";
pub const PHOTO_URL: &str = "https://cataas.com/cat/says/meow?type=square";
pub const PHOTO_CAPTION: &str = "photo from https://cataas.com/";
pub const FUEL_URL: &str = "https://storage.data.gov.my/commodities/fuelprice.csv";
pub const BLOCKED_URL: &str = "https://blockedornot.sinarproject.org/api/";
pub const BLOCKED_CREDIT: &str = "Powered by https://blockedornot.sinarproject.org/";
const IFTTT_URL: &str = "https://maker.ifttt.com/trigger/prompt/with/key";

pub const NO_FACT: &str = "The cats are keeping their facts to themselves right now.";
pub const NO_PHOTO: &str = "The cats are hiding right now, try again later.";
pub const NO_PETROL: &str = "Fuel prices are not available right now.";

const BUBBLE_WIDTH: usize = 40;

const CATS: [&str; 3] = [
    r"  {c}
   {c}  /\_/\
       ( o.o )
        > ^ <",
    r"  {c}
   {c}
       |\__/,|   (`\
     _.|o o  |_   ) )
   -(((---(((--------",
    r"  {c}
   {c}   /\_/\
        ( ^.^ )___
        (_____)   )~
          U  U--U",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Say,
    Think,
}

/// Puts `text` in a speech (or thought) bubble above a random cat, inside a
/// Markdown code block.
pub fn meow_say(text: &str, style: Style, wrap: bool) -> String {
    let mut lines: Vec<String> = if wrap {
        text.lines()
            .flat_map(|line| wrap_line(line, BUBBLE_WIDTH))
            .collect()
    } else {
        text.lines().map(str::to_string).collect()
    };
    if lines.is_empty() {
        lines.push(String::new());
    }
    let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0);

    let mut out = vec![format!(" {}", "_".repeat(width + 2))];
    let last = lines.len() - 1;
    for (i, line) in lines.iter().enumerate() {
        let (open, close) = match (style, lines.len(), i) {
            (Style::Think, _, _) => ('(', ')'),
            (Style::Say, 1, _) => ('<', '>'),
            (Style::Say, _, 0) => ('/', '\\'),
            (Style::Say, _, i) if i == last => ('\\', '/'),
            (Style::Say, _, _) => ('|', '|'),
        };
        let pad = width - line.chars().count();
        out.push(format!("{open} {line}{} {close}", " ".repeat(pad)));
    }
    out.push(format!(" {}", "-".repeat(width + 2)));

    let connector = match style {
        Style::Say => "\\",
        Style::Think => "o",
    };
    let cat = CATS.choose(&mut rng()).copied().unwrap_or(CATS[0]);
    out.push(cat.replace("{c}", connector));

    format!("```\n{}\n```", out.join("\n"))
}

fn wrap_line(line: &str, width: usize) -> Vec<String> {
    let mut wrapped = Vec::new();
    let mut current = String::new();
    for word in line.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > width {
            if !current.is_empty() {
                wrapped.push(std::mem::take(&mut current));
            }
            wrapped.push(word.drain(..width).collect());
        }
        let word: String = word.into_iter().collect();
        if word.is_empty() {
            continue;
        }
        if current.is_empty() {
            current = word;
        } else if current.chars().count() + 1 + word.chars().count() <= width {
            current.push(' ');
            current.push_str(&word);
        } else {
            wrapped.push(std::mem::replace(&mut current, word));
        }
    }
    if !current.is_empty() || wrapped.is_empty() {
        wrapped.push(current);
    }
    wrapped
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BlockedReport {
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub different_ip: bool,
    #[serde(default)]
    pub measurement: Value,
}

impl BlockedReport {
    pub fn describe(&self, query: &str) -> String {
        let verdict = match (self.blocked, self.different_ip) {
            (true, true) => "is blocked",
            (false, true) => "is likely safe",
            _ => "is safe",
        };
        let mut lines = vec![format!("Website {query} {verdict}.")];
        if let Some(url) = self.measurement.as_str().filter(|u| !u.is_empty()) {
            lines.push(format!("Measurement URL: {url}"));
        }
        lines.push(BLOCKED_CREDIT.to_string());
        lines.join("\n")
    }
}

/// The outside services the bot pulls content from.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn cat_photo(&self) -> Result<Vec<u8>, BotError>;
    async fn cat_fact(&self) -> Result<String, BotError>;
    async fn fuel_prices(&self) -> Result<Vec<SeriesRow>, BotError>;
    async fn blocked_or_not(&self, query: &str) -> Result<BlockedReport, BotError>;
    async fn prompt(&self, message: &str, channel: Channel, destination: &str)
    -> Result<(), BotError>;
}

#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: Client,
    ifttt_key: Option<String>,
}

impl HttpUpstream {
    pub fn new(ifttt_key: Option<String>) -> Result<Self, BotError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .user_agent(concat!("bigmeow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BotError::Config(format!("cannot build http client: {e}")))?;
        Ok(Self { client, ifttt_key })
    }

    async fn get(&self, source: &str, url: &str) -> Result<reqwest::Response, BotError> {
        info!(source, url, "fetching");
        self.client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| BotError::upstream(source, e))
    }
}

#[derive(Deserialize)]
struct FactResponse {
    data: Vec<String>,
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn cat_photo(&self) -> Result<Vec<u8>, BotError> {
        let response = self.get("cataas", PHOTO_URL).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BotError::upstream("cataas", e))?;
        Ok(bytes.to_vec())
    }

    async fn cat_fact(&self) -> Result<String, BotError> {
        let response: FactResponse = self
            .get("meowfacts", FACT_URL)
            .await?
            .json()
            .await
            .map_err(|e| BotError::upstream("meowfacts", e))?;
        response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| BotError::upstream("meowfacts", "response has no facts"))
    }

    async fn fuel_prices(&self) -> Result<Vec<SeriesRow>, BotError> {
        let text = self
            .get("fuel prices", FUEL_URL)
            .await?
            .text()
            .await
            .map_err(|e| BotError::upstream("fuel prices", e))?;
        parse_fuel_csv(&text)
    }

    async fn blocked_or_not(&self, query: &str) -> Result<BlockedReport, BotError> {
        info!(query, "checking blockedornot");
        self.client
            .get(BLOCKED_URL)
            .query(&[("query", query)])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| BotError::upstream("blockedornot", e))?
            .json()
            .await
            .map_err(|e| BotError::upstream("blockedornot", e))
    }

    async fn prompt(
        &self,
        message: &str,
        channel: Channel,
        destination: &str,
    ) -> Result<(), BotError> {
        let Some(key) = &self.ifttt_key else {
            return Err(BotError::upstream("ifttt", "IFTTT_KEY is not set"));
        };
        let body = json!({"value1": message, "value2": channel, "value3": destination});
        let response = self
            .client
            .post(format!("{IFTTT_URL}/{key}"))
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| BotError::upstream("ifttt", e))?;
        let text = response.text().await.unwrap_or_default();
        info!(response = %text, "ifttt accepted prompt");
        Ok(())
    }
}

pub async fn meow_fact(ctx: &SharedContext) -> String {
    let fetched = ctx.upstream.cat_fact().await;
    let fact = {
        let mut facts = ctx.facts.acquire().await;
        match fetched {
            Ok(fact) => Ok(facts.cache(format!("{fact}\n    - {FACT_CREDIT}"))),
            Err(e) => {
                warn!(error = %e, "serving a cached fact");
                facts.get()
            }
        }
    };
    let text = fact.unwrap_or_else(|_| NO_FACT.to_string());
    meow_say(&text, Style::Say, false)
}

pub async fn meow_photo(ctx: &SharedContext) -> Result<Arc<Vec<u8>>, BotError> {
    let fetched = ctx.upstream.cat_photo().await;
    let mut cats = ctx.cats.acquire().await;
    match fetched {
        Ok(bytes) => Ok(cats.cache(Arc::new(bytes))),
        Err(e) => {
            warn!(error = %e, "serving a cached photo");
            cats.get()
        }
    }
}

pub async fn meow_petrol(ctx: &SharedContext) -> String {
    let text = {
        let mut latest = ctx.latest.acquire().await;
        let now = Local::now().naive_local();
        match latest
            .refresh_if_stale(now, || ctx.upstream.fuel_prices())
            .await
        {
            Ok(updated) => *latest = updated,
            Err(e) => warn!(error = %e, "keeping the last fuel price snapshot"),
        }
        if latest.is_populated() {
            latest.describe(FUEL_URL)
        } else {
            NO_PETROL.to_string()
        }
    };
    meow_say(&text, Style::Say, false)
}

/// Slack wraps links as `<http://example.com|example.com>`; only the
/// visible part is looked up.
fn clean_query(query: &str) -> &str {
    let query = query.trim().trim_start_matches('<').trim_end_matches('>');
    query.rsplit('|').next().unwrap_or(query).trim()
}

pub async fn meow_blockedornot(ctx: &SharedContext, query: &str) -> String {
    let query = clean_query(query);
    let text = match ctx.upstream.blocked_or_not(query).await {
        Ok(report) => report.describe(query),
        Err(e) => {
            warn!(error = %e, query, "blockedornot lookup failed");
            format!("Unable to check {query} right now.\n{BLOCKED_CREDIT}")
        }
    };
    meow_say(&text, Style::Say, false)
}

pub async fn meow_prompt(ctx: &SharedContext, message: &str, channel: Channel, destination: &str) {
    match ctx.upstream.prompt(message, channel, destination).await {
        Ok(()) => info!(%channel, destination, "prompt dispatched"),
        Err(e) => warn!(error = %e, %channel, "prompt dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_say_bubble() {
        let out = meow_say("hello", Style::Say, true);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "```");
        assert_eq!(lines[1], " _______");
        assert_eq!(lines[2], "< hello >");
        assert_eq!(lines[3], " -------");
        assert!(lines[4].contains('\\'));
        assert_eq!(*lines.last().unwrap(), "```");
    }

    #[test]
    fn think_bubble_uses_parens_and_o() {
        let out = meow_say("one\ntwo", Style::Think, false);
        assert!(out.contains("( one )"));
        assert!(out.contains("( two )"));
        assert!(out.contains("  o\n"));
    }

    #[test]
    fn multi_line_say_bubble_is_padded() {
        let out = meow_say("a\nlonger\nb", Style::Say, false);
        assert!(out.contains("/ a      \\"));
        assert!(out.contains("| longer |"));
        assert!(out.contains("\\ b      /"));
    }

    #[test]
    fn long_text_wraps_at_forty() {
        let text = "word ".repeat(30);
        let wrapped = wrap_line(&text, BUBBLE_WIDTH);
        assert!(wrapped.len() > 1);
        assert!(wrapped.iter().all(|l| l.chars().count() <= BUBBLE_WIDTH));

        let long = "x".repeat(90);
        let wrapped = wrap_line(&long, BUBBLE_WIDTH);
        assert_eq!(wrapped.len(), 3);
        assert_eq!(wrapped[2].len(), 10);
    }

    #[test]
    fn empty_text_still_renders() {
        let out = meow_say("", Style::Say, true);
        assert!(out.contains("<  >"));
    }

    #[test]
    fn blocked_report_wording() {
        let blocked = BlockedReport {
            blocked: true,
            different_ip: true,
            measurement: json!("https://explorer.ooni.org/m/1"),
        };
        let text = blocked.describe("example.com");
        assert!(text.starts_with("Website example.com is blocked."));
        assert!(text.contains("Measurement URL: https://explorer.ooni.org/m/1"));
        assert!(text.ends_with(BLOCKED_CREDIT));

        let likely = BlockedReport {
            different_ip: true,
            ..Default::default()
        };
        assert!(likely.describe("a.b").starts_with("Website a.b is likely safe."));
        assert!(!BlockedReport::default().describe("a.b").contains("Measurement"));
    }

    #[test]
    fn slack_links_are_unwrapped() {
        assert_eq!(clean_query("<http://example.com|example.com>"), "example.com");
        assert_eq!(clean_query(" example.com "), "example.com");
    }
}
