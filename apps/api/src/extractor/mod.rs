//! Recovers a file key and the human-written comment from notification
//! e-mails, and lines that comment up with the platform's own records.
//!
//! Both lookups are priority cascades: ordered levels, first success wins.

pub mod fuzzy;
pub mod html;
pub mod identifiers;
pub mod text;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use self::fuzzy::{fuzzy_find_text, FuzzyMatch};
pub use self::identifiers::{
    ExtractedIdentifier, HttpRedirectResolver, IdentifierInput, IdentifierStrategy,
    RedirectResolver,
};
pub use self::text::{ExtractedText, TextInput, TextStrategy};

/// Inbound-mail webhook envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailPayload {
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub from: String,
    #[serde(rename = "body-html", default)]
    pub body_html: Option<String>,
    #[serde(rename = "body-plain", default)]
    pub body_plain: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub signature: Option<MailSignature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailSignature {
    pub timestamp: String,
    pub token: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedComment {
    pub file_key: Option<ExtractedIdentifier>,
    pub text: Option<ExtractedText>,
}

pub struct ContentExtractor {
    resolver: Arc<dyn RedirectResolver>,
    bot_handle: String,
    threshold: f64,
}

impl ContentExtractor {
    pub fn new(resolver: Arc<dyn RedirectResolver>, bot_handle: &str, threshold: f64) -> Self {
        Self {
            resolver,
            bot_handle: bot_handle.trim_start_matches('@').to_string(),
            threshold,
        }
    }

    /// Runs both cascades over one e-mail.
    pub async fn extract(&self, email: &EmailPayload) -> ExtractedComment {
        let html = email.body_html.as_deref();
        let plain = email.body_plain.as_deref();

        let file_key = identifiers::extract_file_key(
            IdentifierInput {
                from: Some(email.from.as_str()),
                html,
                plain,
            },
            self.resolver.as_ref(),
        )
        .await;

        let text = text::extract_comment_text(&TextInput::new(html, plain), &self.bot_handle);

        debug!(
            file_key_strategy = ?file_key.as_ref().map(|k| k.strategy),
            text_strategy = ?text.as_ref().map(|t| t.strategy),
            "Extracted comment e-mail"
        );
        ExtractedComment { file_key, text }
    }

    /// Best record whose text clears the configured threshold.
    pub fn correlate<'a, T, F>(
        &self,
        extracted: &str,
        candidates: &'a [T],
        text_of: F,
    ) -> Option<FuzzyMatch<'a, T>>
    where
        F: Fn(&T) -> &str,
    {
        fuzzy_find_text(extracted, candidates, text_of, self.threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoRedirects;

    #[async_trait]
    impl RedirectResolver for NoRedirects {
        async fn resolve(&self, _url: &str) -> Option<String> {
            None
        }
    }

    fn extractor() -> ContentExtractor {
        ContentExtractor::new(Arc::new(NoRedirects), "@threadwise", fuzzy::DEFAULT_THRESHOLD)
    }

    #[test]
    fn test_payload_uses_mail_field_names() {
        let email: EmailPayload = serde_json::from_value(serde_json::json!({
            "recipient": "inbox@threadwise.dev",
            "subject": "New comment on Home",
            "from": "Figma <comments-AbCdEf123456@email.figma.com>",
            "body-plain": "@threadwise ship it",
            "signature": {"timestamp": "1700000000", "token": "tok", "signature": "ab"}
        }))
        .unwrap();
        assert_eq!(email.body_plain.as_deref(), Some("@threadwise ship it"));
        assert!(email.body_html.is_none());
        assert_eq!(email.signature.unwrap().token, "tok");
    }

    #[tokio::test]
    async fn test_sender_key_wins_even_when_body_disagrees() {
        let email = EmailPayload {
            from: "Figma <comments-SENDERKEY0001@email.figma.com>".into(),
            body_html: Some(
                r#"<table><tr><td>@threadwise please align the pricing cards</td></tr></table>
                   <a href="https://www.figma.com/file/BODYKEY000001/Pricing">Open</a>"#
                    .into(),
            ),
            ..Default::default()
        };
        let found = extractor().extract(&email).await;
        let key = found.file_key.unwrap();
        assert_eq!(key.file_key, "SENDERKEY0001");
        assert_eq!(key.strategy, IdentifierStrategy::SenderAddress);
        let text = found.text.unwrap();
        assert_eq!(text.strategy, TextStrategy::BotMention);
        assert_eq!(text.text, "@threadwise please align the pricing cards");
    }

    #[tokio::test]
    async fn test_stylesheet_mail_yields_no_comment() {
        let email = EmailPayload {
            from: "notifications@figma.com".into(),
            body_html: Some(
                "<style>@font-face { font-family: Inter; }</style><div>@media print { body { color: #000 } }</div>"
                    .into(),
            ),
            ..Default::default()
        };
        let found = extractor().extract(&email).await;
        assert!(found.text.is_none());
        assert!(found.file_key.is_none());
    }

    #[test]
    fn test_correlate_picks_best_candidate() {
        let comments = vec![
            ("c1", "Looks good to me"),
            ("c2", "@threadwise please align the pricing cards"),
            ("c3", "please align the cards"),
        ];
        let found = extractor()
            .correlate("@threadwise  Please align the pricing cards", &comments, |c| c.1)
            .unwrap();
        assert_eq!(found.item.0, "c2");
        assert_eq!(found.score, 1.0);
    }

    #[test]
    fn test_correlate_refuses_weak_guesses() {
        let comments = vec![("c1", "Totally unrelated remark about fonts")];
        assert!(extractor()
            .correlate("please align the pricing cards", &comments, |c| c.1)
            .is_none());
    }
}
