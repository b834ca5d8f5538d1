//! Snapshot builder (C8).
//!
//! A pure function: raw TMS payloads in, a stable, render-ready [`Snapshot`]
//! out. Nothing here talks to the network or the filesystem, and nothing
//! here decides *whether* a ticket should be archived — that is
//! [`crate::tags::should_process`]'s job, evaluated by the orchestrator
//! before this builder ever runs.

use std::collections::BTreeMap;

use archiver_retry::{ArchiverError, ErrorCode};
use archiver_types::{ArticleLimitMode, Article, AttachmentMeta, Snapshot};

use crate::tms::{RawArticle, RawTicket};

/// Opaque HTML sanitiser seam. The sanitiser's internals are out of scope
/// (§1); this builder only needs something that turns untrusted
/// `body_html` into safe, renderable HTML, possibly empty.
pub trait HtmlSanitizer: Send + Sync {
    fn sanitise(&self, raw_html: &str) -> String;
}

/// Strips every tag, leaving only text content, and collapses whitespace.
/// A full sanitiser (attribute allow-lists, safe-URL schemes, etc.) is an
/// external collaborator per §1; this stands in so the service has
/// something to run against out of the box.
pub struct TagStrippingSanitizer {
    tag_pattern: regex::Regex,
}

impl TagStrippingSanitizer {
    pub fn new() -> Self {
        Self {
            tag_pattern: regex::Regex::new(r"(?s)<[^>]*>").expect("static tag pattern must compile"),
        }
    }
}

impl Default for TagStrippingSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl HtmlSanitizer for TagStrippingSanitizer {
    fn sanitise(&self, raw_html: &str) -> String {
        let stripped = self.tag_pattern.replace_all(raw_html, "");
        stripped.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// Builds a [`Snapshot`] from a raw ticket, its current tags, and its raw
/// articles. Articles are sorted by `(created_at asc, id asc)` (§3) and run
/// through `sanitizer`; `article_limit_mode` governs what happens when the
/// article count exceeds `article_limit` (0 means unlimited).
pub fn build_snapshot(
    ticket: RawTicket,
    tags: Vec<String>,
    mut articles: Vec<RawArticle>,
    sanitizer: &dyn HtmlSanitizer,
    article_limit: u32,
    article_limit_mode: ArticleLimitMode,
) -> Result<Snapshot, ArchiverError> {
    articles.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

    let mut truncation_warning = None;
    if article_limit > 0 && (articles.len() as u64) > article_limit as u64 {
        match article_limit_mode {
            ArticleLimitMode::Fail => {
                return Err(ArchiverError::permanent(
                    ErrorCode::ArticleLimitExceeded,
                    format!(
                        "ticket has {} articles, exceeding the configured limit of {article_limit}",
                        articles.len()
                    ),
                ));
            }
            ArticleLimitMode::CapAndContinue => {
                truncation_warning = Some(format!(
                    "truncated from {} to {article_limit} articles",
                    articles.len()
                ));
                articles.truncate(article_limit as usize);
            }
        }
    }

    let articles: Vec<Article> = articles
        .into_iter()
        .map(|raw| normalise_article(raw, sanitizer))
        .collect();

    let custom_fields: BTreeMap<String, serde_json::Value> = ticket
        .custom_fields
        .into_iter()
        .collect();

    Ok(Snapshot {
        id: ticket.id,
        number: ticket.number,
        title: ticket.title,
        created_at: ticket.created_at,
        updated_at: ticket.updated_at,
        customer: ticket.customer,
        owner: ticket.owner,
        tags,
        custom_fields,
        articles,
        truncation_warning,
    })
}

fn normalise_article(raw: RawArticle, sanitizer: &dyn HtmlSanitizer) -> Article {
    Article {
        id: raw.id,
        created_at: raw.created_at,
        internal: raw.internal,
        sender: raw.sender,
        subject: raw.subject,
        body_html: sanitizer.sanitise(&raw.body_html),
        body_text: raw.body_text,
        attachments: raw
            .attachments
            .into_iter()
            .map(|a| AttachmentMeta {
                id: a.id,
                filename: a.filename,
                content_type: a.content_type,
                size_bytes: a.size_bytes,
            })
            .collect(),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::tms::RawAttachment;
    use chrono::{DateTime, Utc};
    use serde_json::Map;

    struct IdentitySanitizer;
    impl HtmlSanitizer for IdentitySanitizer {
        fn sanitise(&self, raw_html: &str) -> String {
            raw_html.to_string()
        }
    }

    struct StripAllSanitizer;
    impl HtmlSanitizer for StripAllSanitizer {
        fn sanitise(&self, _raw_html: &str) -> String {
            String::new()
        }
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn ticket() -> RawTicket {
        RawTicket {
            id: 1,
            number: "2026070100001".to_string(),
            title: "Printer on fire".to_string(),
            created_at: ts("2026-07-01T00:00:00Z"),
            updated_at: ts("2026-07-01T01:00:00Z"),
            customer: "acme".to_string(),
            owner: "agent1".to_string(),
            custom_fields: Map::new(),
        }
    }

    fn article(id: i64, created_at: &str) -> RawArticle {
        RawArticle {
            id,
            created_at: ts(created_at),
            internal: false,
            sender: "customer".to_string(),
            subject: "subj".to_string(),
            body_html: "<p>hi</p>".to_string(),
            body_text: "hi".to_string(),
            attachments: vec![RawAttachment {
                id: 1,
                filename: "a.txt".to_string(),
                content_type: "text/plain".to_string(),
                size_bytes: 10,
            }],
        }
    }

    #[test]
    fn articles_are_sorted_by_created_at_then_id() {
        let articles = vec![
            article(2, "2026-07-01T02:00:00Z"),
            article(1, "2026-07-01T01:00:00Z"),
            article(3, "2026-07-01T01:00:00Z"),
        ];
        let snapshot = build_snapshot(
            ticket(),
            vec![],
            articles,
            &IdentitySanitizer,
            0,
            ArticleLimitMode::Fail,
        )
        .unwrap();
        let ids: Vec<i64> = snapshot.articles.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![1, 3, 2]);
    }

    #[test]
    fn empty_sanitised_html_is_preserved_empty_for_renderer_fallback() {
        let snapshot = build_snapshot(
            ticket(),
            vec![],
            vec![article(1, "2026-07-01T01:00:00Z")],
            &StripAllSanitizer,
            0,
            ArticleLimitMode::Fail,
        )
        .unwrap();
        assert_eq!(snapshot.articles[0].body_html, "");
        assert_eq!(snapshot.articles[0].body_text, "hi");
    }

    #[test]
    fn article_limit_fail_rejects_excess() {
        let articles = vec![
            article(1, "2026-07-01T01:00:00Z"),
            article(2, "2026-07-01T02:00:00Z"),
            article(3, "2026-07-01T03:00:00Z"),
        ];
        let err = build_snapshot(
            ticket(),
            vec![],
            articles,
            &IdentitySanitizer,
            2,
            ArticleLimitMode::Fail,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::ArticleLimitExceeded);
    }

    #[test]
    fn article_limit_cap_and_continue_truncates_with_warning() {
        let articles = vec![
            article(1, "2026-07-01T01:00:00Z"),
            article(2, "2026-07-01T02:00:00Z"),
            article(3, "2026-07-01T03:00:00Z"),
        ];
        let snapshot = build_snapshot(
            ticket(),
            vec![],
            articles,
            &IdentitySanitizer,
            2,
            ArticleLimitMode::CapAndContinue,
        )
        .unwrap();
        assert_eq!(snapshot.articles.len(), 2);
        assert!(snapshot.truncation_warning.is_some());
    }

    #[test]
    fn article_limit_zero_means_unlimited() {
        let articles: Vec<RawArticle> = (0..5)
            .map(|i| article(i, "2026-07-01T01:00:00Z"))
            .collect();
        let snapshot = build_snapshot(
            ticket(),
            vec![],
            articles,
            &IdentitySanitizer,
            0,
            ArticleLimitMode::Fail,
        )
        .unwrap();
        assert_eq!(snapshot.articles.len(), 5);
    }

    #[test]
    fn article_count_exactly_at_limit_is_accepted() {
        let articles = vec![
            article(1, "2026-07-01T01:00:00Z"),
            article(2, "2026-07-01T02:00:00Z"),
        ];
        let snapshot = build_snapshot(
            ticket(),
            vec![],
            articles,
            &IdentitySanitizer,
            2,
            ArticleLimitMode::Fail,
        )
        .unwrap();
        assert_eq!(snapshot.articles.len(), 2);
        assert!(snapshot.truncation_warning.is_none());
    }
}
