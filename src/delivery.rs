use regex::{Captures, Regex};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::HumanizeConfig;
use replyflow_channels::transport::{PresenceState, Transport};
use replyflow_core::text::preview;

struct ArtifactPatterns {
    url: Regex,
    email: Regex,
    phone: Regex,
    spaces: Regex,
    space_before_punct: Regex,
    dangling_colon: Regex,
}

fn patterns() -> &'static ArtifactPatterns {
    static PATTERNS: OnceLock<ArtifactPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| ArtifactPatterns {
        url: Regex::new(r#"(?i)\b(?:https?://|www\.)[^\s<>"]+"#).expect("hardcoded regex"),
        email: Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")
            .expect("hardcoded regex"),
        phone: Regex::new(r"(?:\+?55\s?)?\(?\b\d{2}\)?[\s-]?9?\d{4}[\s-]?\d{4}\b")
            .expect("hardcoded regex"),
        spaces: Regex::new(r"[ \t]{2,}").expect("hardcoded regex"),
        space_before_punct: Regex::new(r"[ \t]+([.,!?;])").expect("hardcoded regex"),
        dangling_colon: Regex::new(r"(?m):[ \t]*([.,!?;]|$)").expect("hardcoded regex"),
    })
}

/// Contact data found in a reply. Audio renders these badly, so speech replies
/// carry them as separate text messages or contact cards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Artifacts {
    pub urls: Vec<String>,
    pub emails: Vec<String>,
    pub phones: Vec<String>,
}

impl Artifacts {
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty() && self.emails.is_empty() && self.phones.is_empty()
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !value.is_empty() && !list.contains(&value) {
        list.push(value);
    }
}

fn trim_url(raw: &str) -> &str {
    raw.trim_end_matches(['.', ',', ';', ':', '!', '?', ')'])
}

pub fn extract_artifacts(text: &str) -> Artifacts {
    let p = patterns();
    let mut artifacts = Artifacts::default();
    for m in p.url.find_iter(text) {
        push_unique(&mut artifacts.urls, trim_url(m.as_str()).to_string());
    }
    let without_urls = p.url.replace_all(text, " ");
    for m in p.email.find_iter(&without_urls) {
        push_unique(&mut artifacts.emails, m.as_str().to_string());
    }
    let without_emails = p.email.replace_all(&without_urls, " ");
    for m in p.phone.find_iter(&without_emails) {
        push_unique(&mut artifacts.phones, m.as_str().trim().to_string());
    }
    artifacts
}

/// Remove URLs, emails and phone numbers, tidying the whitespace left behind.
pub fn strip_artifacts(text: &str) -> String {
    let p = patterns();
    // keep punctuation that trailed a URL
    let out = p.url.replace_all(text, |caps: &Captures| {
        let m = &caps[0];
        m[trim_url(m).len()..].to_string()
    });
    let out = p.email.replace_all(&out, "");
    let out = p.phone.replace_all(&out, "");
    let out = p.spaces.replace_all(&out, " ");
    let out = p.space_before_punct.replace_all(&out, "$1");
    let out = p.dangling_colon.replace_all(&out, "$1");
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_sentence_end(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '…')
}

fn sentences(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        if !is_sentence_end(c) {
            continue;
        }
        while let Some(&next) = chars.peek() {
            if !is_sentence_end(next) {
                break;
            }
            current.push(next);
            chars.next();
        }
        if chars.peek().map_or(true, |n| n.is_whitespace()) {
            let sentence = current.trim();
            if !sentence.is_empty() {
                out.push(sentence.to_string());
            }
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        out.push(tail.to_string());
    }
    out
}

/// Split a reply at sentence and line boundaries into at most `max_parts`
/// messages, folding fragments shorter than `min_part_chars` into a neighbour.
pub fn split_into_parts(text: &str, max_parts: usize, min_part_chars: usize) -> Vec<String> {
    let max_parts = max_parts.max(1);
    let mut parts: Vec<String> = Vec::new();
    for sentence in text.lines().flat_map(sentences) {
        match parts.last_mut() {
            Some(last) if last.chars().count() < min_part_chars => {
                last.push(' ');
                last.push_str(&sentence);
            }
            _ => parts.push(sentence),
        }
    }
    if parts.len() > 1 {
        let short_tail = parts
            .last()
            .map(|p| p.chars().count() < min_part_chars)
            .unwrap_or(false);
        if short_tail {
            if let Some(tail) = parts.pop() {
                if let Some(last) = parts.last_mut() {
                    last.push(' ');
                    last.push_str(&tail);
                }
            }
        }
    }
    if parts.len() > max_parts {
        let rest = parts.split_off(max_parts - 1);
        parts.push(rest.join(" "));
    }
    parts
}

/// Length-proportional "typing" delay, clamped to the configured bounds.
pub fn typing_delay(text: &str, humanize: &HumanizeConfig) -> Duration {
    let chars = text.chars().count() as u64;
    let min = humanize.min_typing_delay_ms;
    let max = humanize.max_typing_delay_ms.max(min);
    Duration::from_millis(
        chars
            .saturating_mul(humanize.typing_ms_per_char)
            .clamp(min, max),
    )
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    pub parts_sent: usize,
    pub as_audio: bool,
    pub artifacts_sent: usize,
    /// Transport error that aborted the remaining parts.
    pub error: Option<String>,
}

impl DeliveryReport {
    pub fn delivered_anything(&self) -> bool {
        self.parts_sent > 0
    }
}

/// Paces a reply out through the transport the way a person would type it.
pub struct Deliverer {
    transport: Arc<dyn Transport>,
    humanize: HumanizeConfig,
}

impl Deliverer {
    pub fn new(transport: Arc<dyn Transport>, humanize: HumanizeConfig) -> Self {
        Self {
            transport,
            humanize,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    async fn presence(&self, key: &str, state: PresenceState) {
        if let Err(e) = self.transport.set_presence(key, state).await {
            debug!("Delivery: presence {} failed for {key}: {e}", state.as_str());
        }
    }

    pub async fn deliver_text(
        &self,
        key: &str,
        reply: &str,
        contact_cards: bool,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let parts = split_into_parts(
            reply,
            self.humanize.max_parts,
            self.humanize.min_part_chars,
        );
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(self.humanize.pause_between_parts_ms))
                    .await;
            }
            self.presence(key, PresenceState::Composing).await;
            tokio::time::sleep(typing_delay(part, &self.humanize)).await;
            if let Err(e) = self.transport.send_text(key, part).await {
                warn!(
                    "Delivery: send failed for {key} at part {}/{}: {e}",
                    i + 1,
                    parts.len()
                );
                self.presence(key, PresenceState::Paused).await;
                report.error = Some(e);
                return report;
            }
            report.parts_sent += 1;
        }
        self.presence(key, PresenceState::Paused).await;

        if contact_cards {
            let artifacts = extract_artifacts(reply);
            for phone in &artifacts.phones {
                match self.transport.send_contact_card(key, phone).await {
                    Ok(()) => report.artifacts_sent += 1,
                    Err(e) => warn!("Delivery: contact card to {key} failed: {e}"),
                }
            }
        }
        report
    }

    /// Send a synthesized voice reply, then the contact data that was stripped
    /// from the spoken text.
    pub async fn deliver_audio(
        &self,
        key: &str,
        reply: &str,
        audio: Vec<u8>,
        mime: &str,
        contact_cards: bool,
    ) -> DeliveryReport {
        let mut report = DeliveryReport {
            as_audio: true,
            ..Default::default()
        };
        self.presence(key, PresenceState::Recording).await;
        tokio::time::sleep(typing_delay(&strip_artifacts(reply), &self.humanize)).await;
        if let Err(e) = self.transport.send_audio(key, audio, mime).await {
            warn!("Delivery: audio send failed for {key}: {e}");
            self.presence(key, PresenceState::Paused).await;
            report.error = Some(e);
            return report;
        }
        report.parts_sent = 1;
        self.presence(key, PresenceState::Paused).await;

        let artifacts = extract_artifacts(reply);
        if artifacts.is_empty() {
            return report;
        }
        debug!(
            "Delivery: re-sending {} link(s), {} email(s), {} phone(s) to {key}",
            artifacts.urls.len(),
            artifacts.emails.len(),
            artifacts.phones.len()
        );

        let mut lines: Vec<String> = artifacts
            .urls
            .iter()
            .chain(artifacts.emails.iter())
            .cloned()
            .collect();
        if !contact_cards {
            lines.extend(artifacts.phones.iter().cloned());
        }
        if !lines.is_empty() {
            tokio::time::sleep(Duration::from_millis(self.humanize.pause_between_parts_ms)).await;
            let text = lines.join("\n");
            match self.transport.send_text(key, &text).await {
                Ok(()) => report.artifacts_sent += lines.len(),
                Err(e) => {
                    warn!(
                        "Delivery: artifact text to {key} failed ({}): {e}",
                        preview(&text, 120)
                    );
                    report.error = Some(e);
                    return report;
                }
            }
        }
        if contact_cards {
            for phone in &artifacts.phones {
                match self.transport.send_contact_card(key, phone).await {
                    Ok(()) => report.artifacts_sent += 1,
                    Err(e) => warn!("Delivery: contact card to {key} failed: {e}"),
                }
            }
        }
        report
    }
}
